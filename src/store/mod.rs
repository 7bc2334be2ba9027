//! SQLite-based seat store.
//!
//! This is the only shared mutable resource between the allocation engine
//! worker and administrative operations. The engine only toggles
//! `occupied`/`student_id` on seats; students and rooms are provisioned
//! externally.
//!
//! Invariants maintained by every mutation here:
//! - a seat with `occupied = 0` has `student_id = NULL`, and vice versa
//! - at most one occupied seat references a given student

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::debug;

/// Errors from seat store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// A student as registered by the admin surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Student {
    /// Student ID.
    pub id: i64,
    /// Display name.
    pub name: String,
    /// Branch, used for the seat-conflict rule.
    pub branch: String,
    /// University register number.
    pub register_no: String,
    /// Relative path to the student's photo, if uploaded.
    pub photo_path: Option<String>,
    /// Hardware token UID presented at the reader.
    pub token_uid: String,
}

/// A committed (room, seat) assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeatAssignment {
    pub room_no: String,
    pub seat_no: i64,
}

/// A free seat eligible for assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeatCandidate {
    pub seat_id: i64,
    pub room_no: String,
    pub seat_no: i64,
}

/// One row of the seats table, as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeatRow {
    pub id: i64,
    pub room_no: String,
    pub seat_no: i64,
    pub occupied: bool,
    pub student_id: Option<i64>,
}

/// An occupied seat joined with its owning student.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    pub seat_no: i64,
    pub student_id: i64,
    pub name: String,
    pub branch: String,
    pub register_no: String,
}

/// SQLite seat store.
pub struct SeatStore {
    conn: Connection,
}

impl SeatStore {
    /// Open or create a seat store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency with admin operations
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self { conn };
        store.init_schema()?;

        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Close the underlying connection. Dropping the store closes it too.
    pub fn close(self) -> Result<(), StoreError> {
        self.conn.close().map_err(|(_, e)| StoreError::Sqlite(e))
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS students (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                branch TEXT NOT NULL,
                register_no TEXT NOT NULL UNIQUE,
                photo_path TEXT,
                token_uid TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS seats (
                id INTEGER PRIMARY KEY,
                room_no TEXT NOT NULL,
                seat_no INTEGER NOT NULL,
                occupied INTEGER NOT NULL DEFAULT 0,
                student_id INTEGER,
                UNIQUE (room_no, seat_no)
            );

            CREATE INDEX IF NOT EXISTS idx_seats_student ON seats(student_id);
            CREATE INDEX IF NOT EXISTS idx_seats_occupied ON seats(occupied);
            "#,
        )?;

        debug!("Seat store schema initialized");
        Ok(())
    }

    /// Register a student.
    pub fn insert_student(&self, student: &Student) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO students (id, name, branch, register_no, photo_path, token_uid)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                student.id,
                student.name,
                student.branch,
                student.register_no,
                student.photo_path,
                student.token_uid,
            ],
        )?;
        Ok(())
    }

    /// Delete a student. Seats keep a weak reference; no cascade.
    pub fn delete_student(&self, student_id: i64) -> Result<(), StoreError> {
        self.conn.execute(
            "DELETE FROM students WHERE id = ?1",
            params![student_id],
        )?;
        Ok(())
    }

    /// Look up a student by the token UID presented at the reader.
    pub fn student_by_token(&self, token_uid: &str) -> Result<Option<Student>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, branch, register_no, photo_path, token_uid
             FROM students WHERE token_uid = ?1",
        )?;

        stmt.query_row(params![token_uid], |row| {
            Ok(Student {
                id: row.get(0)?,
                name: row.get(1)?,
                branch: row.get(2)?,
                register_no: row.get(3)?,
                photo_path: row.get(4)?,
                token_uid: row.get(5)?,
            })
        })
        .optional()
        .map_err(Into::into)
    }

    /// Find the occupied seat already assigned to a student, if any.
    ///
    /// Checked before any new assignment so re-presenting a token is
    /// idempotent.
    pub fn existing_seat(&self, student_id: i64) -> Result<Option<SeatAssignment>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT room_no, seat_no FROM seats
             WHERE occupied = 1 AND student_id = ?1",
        )?;

        stmt.query_row(params![student_id], |row| {
            Ok(SeatAssignment {
                room_no: row.get(0)?,
                seat_no: row.get(1)?,
            })
        })
        .optional()
        .map_err(Into::into)
    }

    /// List free seats, excluding every seat in a room that already holds an
    /// occupied seat owned by a student of the given branch.
    pub fn free_seats_excluding_branch(
        &self,
        branch: &str,
    ) -> Result<Vec<SeatCandidate>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, room_no, seat_no FROM seats
             WHERE occupied = 0
               AND room_no NOT IN (
                   SELECT e.room_no FROM seats e
                   JOIN students s ON e.student_id = s.id
                   WHERE e.occupied = 1 AND s.branch = ?1
               )
             ORDER BY room_no, seat_no",
        )?;

        let candidates = stmt
            .query_map(params![branch], |row| {
                Ok(SeatCandidate {
                    seat_id: row.get(0)?,
                    room_no: row.get(1)?,
                    seat_no: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(candidates)
    }

    /// Conditionally claim a seat for a student.
    ///
    /// The update only lands if the seat is still unoccupied; returns whether
    /// the claim won. Two concurrent presentations racing for the same seat
    /// resolve here rather than double-booking.
    pub fn claim_seat(&self, seat_id: i64, student_id: i64) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "UPDATE seats SET occupied = 1, student_id = ?1
             WHERE id = ?2 AND occupied = 0",
            params![student_id, seat_id],
        )?;
        Ok(changed == 1)
    }

    /// Release every seat back to unoccupied. Returns the number of rows
    /// touched.
    pub fn release_all_seats(&self) -> Result<usize, StoreError> {
        let changed = self
            .conn
            .execute("UPDATE seats SET occupied = 0, student_id = NULL", [])?;
        debug!(seats = changed, "All allotments released");
        Ok(changed)
    }

    /// Recreate a room with the given capacity, seats numbered from 1.
    pub fn provision_room(&self, room_no: &str, total_seats: i64) -> Result<(), StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM seats WHERE room_no = ?1", params![room_no])?;
        for seat_no in 1..=total_seats {
            tx.execute(
                "INSERT INTO seats (room_no, seat_no, occupied, student_id)
                 VALUES (?1, ?2, 0, NULL)",
                params![room_no, seat_no],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Delete a room and all of its seats.
    pub fn delete_room(&self, room_no: &str) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM seats WHERE room_no = ?1", params![room_no])?;
        Ok(())
    }

    /// List the distinct room numbers.
    pub fn rooms(&self) -> Result<Vec<String>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT room_no FROM seats ORDER BY room_no")?;

        let rooms = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rooms)
    }

    /// List the occupied seats of a room joined with their students.
    pub fn room_roster(&self, room_no: &str) -> Result<Vec<RosterEntry>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT e.seat_no, s.id, s.name, s.branch, s.register_no
             FROM seats e
             JOIN students s ON e.student_id = s.id
             WHERE e.room_no = ?1 AND e.occupied = 1
             ORDER BY e.seat_no",
        )?;

        let roster = stmt
            .query_map(params![room_no], |row| {
                Ok(RosterEntry {
                    seat_no: row.get(0)?,
                    student_id: row.get(1)?,
                    name: row.get(2)?,
                    branch: row.get(3)?,
                    register_no: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(roster)
    }

    /// List every seat row.
    pub fn list_seats(&self) -> Result<Vec<SeatRow>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, room_no, seat_no, occupied, student_id
             FROM seats ORDER BY room_no, seat_no",
        )?;

        let seats = stmt
            .query_map([], |row| {
                Ok(SeatRow {
                    id: row.get(0)?,
                    room_no: row.get(1)?,
                    seat_no: row.get(2)?,
                    occupied: row.get(3)?,
                    student_id: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(seats)
    }
}
