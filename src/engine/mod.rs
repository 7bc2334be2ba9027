//! Seat allocation engine.
//!
//! A single-threaded blocking loop: wait for a token presentation, resolve
//! the student, report the existing seat or commit a new one, drive the
//! display, repeat. Per-cycle errors from the reader, the display, or the
//! store are logged and the loop continues; only the shutdown token or a
//! closed reader terminates it. Cleanup (display clear, reader release) runs
//! on every exit path, including unwinds, exactly once.

use std::thread;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use tracing::{info, warn};

use crate::hardware::{Display, HardwareError, TokenReader};
use crate::shutdown::ShutdownToken;
use crate::store::{SeatAssignment, SeatStore, StoreError, Student};

/// Engine loop timing.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Pause after a failed reader poll.
    pub read_retry_delay: Duration,
    /// How long an assignment result stays on the display.
    pub display_hold: Duration,
    /// Slice length for shutdown-aware sleeps.
    pub shutdown_poll: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            read_retry_delay: Duration::from_millis(200),
            display_hold: Duration::from_secs(3),
            shutdown_poll: Duration::from_millis(100),
        }
    }
}

/// Outcome of one token presentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenOutcome {
    /// No student matches the token UID.
    UnknownToken,
    /// The student already holds a seat; reported, not reassigned.
    AlreadySeated {
        student: Student,
        seat: SeatAssignment,
    },
    /// A new seat was committed.
    Assigned {
        student: Student,
        seat: SeatAssignment,
    },
    /// No candidate seat satisfies the branch-exclusivity rule.
    NoSeatAvailable { student: Student },
}

/// Resolve one token presentation against the seat store.
///
/// The existing-seat check runs before any new assignment, so re-presenting
/// a token is idempotent and never occupies a second seat. New seats are
/// picked uniformly at random among the free seats whose rooms hold no
/// occupied seat of the student's branch; a lost claim race falls through to
/// the remaining candidates.
pub fn resolve_token(store: &SeatStore, token_uid: &str) -> Result<TokenOutcome, StoreError> {
    let Some(student) = store.student_by_token(token_uid)? else {
        return Ok(TokenOutcome::UnknownToken);
    };

    if let Some(seat) = store.existing_seat(student.id)? {
        return Ok(TokenOutcome::AlreadySeated { student, seat });
    }

    let mut candidates = store.free_seats_excluding_branch(&student.branch)?;
    let mut rng = rand::rng();
    while !candidates.is_empty() {
        let picked = candidates.swap_remove(rng.random_range(0..candidates.len()));
        if store.claim_seat(picked.seat_id, student.id)? {
            let seat = SeatAssignment {
                room_no: picked.room_no,
                seat_no: picked.seat_no,
            };
            return Ok(TokenOutcome::Assigned { student, seat });
        }
        // Lost the claim race; try the rest of the pool.
    }

    Ok(TokenOutcome::NoSeatAvailable { student })
}

/// The allocation engine loop.
pub struct AllocationEngine {
    store: SeatStore,
    reader: Box<dyn TokenReader>,
    display: Box<dyn Display>,
    shutdown: ShutdownToken,
    config: EngineConfig,
    cleaned: bool,
}

impl AllocationEngine {
    pub fn new(
        store: SeatStore,
        reader: Box<dyn TokenReader>,
        display: Box<dyn Display>,
        shutdown: ShutdownToken,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            reader,
            display,
            shutdown,
            config,
            cleaned: false,
        }
    }

    /// Run the loop until shutdown, then clean up.
    ///
    /// The store connection closes when the engine drops, right after
    /// cleanup.
    pub fn run(mut self) -> Result<()> {
        info!("Allocation engine accepting tokens");
        let result = self.serve();
        self.cleanup();
        result
    }

    fn serve(&mut self) -> Result<()> {
        self.show_prompt();

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let uid = match self.reader.read_token() {
                Ok(uid) => uid,
                Err(HardwareError::Closed) => {
                    // A closed reader produces no further tokens; retrying
                    // would spin. Treated as a stop request.
                    warn!("Token reader closed; stopping");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Token read failed");
                    self.pause(self.config.read_retry_delay);
                    continue;
                }
            };

            // Stop requests delivered while blocked in the reader land here.
            if self.shutdown.is_cancelled() {
                break;
            }

            info!(token = %uid, "Token detected");
            match resolve_token(&self.store, &uid) {
                Ok(outcome) => self.render(&outcome),
                Err(e) => warn!(token = %uid, error = %e, "Token cycle failed"),
            }

            // Hold the result so it can be read, then re-prompt.
            self.pause(self.config.display_hold);
            if self.shutdown.is_cancelled() {
                break;
            }
            self.show_prompt();
        }

        info!("Allocation engine stopping");
        Ok(())
    }

    fn render(&mut self, outcome: &TokenOutcome) {
        match outcome {
            TokenOutcome::UnknownToken => {
                info!("Unknown token");
                self.show("Unknown card!", "");
            }
            TokenOutcome::AlreadySeated { student, seat } => {
                info!(
                    student = %student.name,
                    room = %seat.room_no,
                    seat = seat.seat_no,
                    "Already allocated"
                );
                self.show(
                    &format!("ACTD-{}", student.name),
                    &format!("{} Seat {}", seat.room_no, seat.seat_no),
                );
            }
            TokenOutcome::Assigned { student, seat } => {
                info!(
                    student = %student.name,
                    room = %seat.room_no,
                    seat = seat.seat_no,
                    "Assigned seat"
                );
                self.show(
                    &student.name,
                    &format!("{} Seat {}", seat.room_no, seat.seat_no),
                );
            }
            TokenOutcome::NoSeatAvailable { student } => {
                info!(student = %student.name, branch = %student.branch, "No seats left");
                self.show("No seats left!", "");
            }
        }
    }

    fn show_prompt(&mut self) {
        self.show("Place your card", "on reader...");
    }

    /// Display writes are best-effort; failures are logged, never fatal.
    fn show(&mut self, top: &str, bottom: &str) {
        if let Err(e) = self.display.show(top, bottom) {
            warn!(error = %e, "Display write failed");
        }
    }

    /// Sleep in short slices so stop requests are honored promptly.
    fn pause(&self, total: Duration) {
        let mut waited = Duration::ZERO;
        while waited < total {
            if self.shutdown.is_cancelled() {
                return;
            }
            let step = self.config.shutdown_poll.min(total - waited);
            thread::sleep(step);
            waited += step;
        }
    }

    /// Clear the display and release the reader. Idempotent; nothing here
    /// may panic past the cleanup boundary.
    fn cleanup(&mut self) {
        if self.cleaned {
            return;
        }
        self.cleaned = true;

        if let Err(e) = self.display.clear() {
            warn!(error = %e, "Display clear failed during cleanup");
        }
        if let Err(e) = self.reader.release() {
            warn!(error = %e, "Reader release failed during cleanup");
        }
        info!("Engine cleanup complete");
    }
}

impl Drop for AllocationEngine {
    fn drop(&mut self) {
        // Covers unwinds out of a cycle; normal exits already cleaned.
        self.cleanup();
    }
}
