//! Integration tests for the allocation engine.
//!
//! The engine is driven in-process with scripted hardware; the seat store is
//! file-backed so assertions can reopen it after the engine shuts down.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::time::Duration;

use allot_agent::engine::{resolve_token, AllocationEngine, EngineConfig, TokenOutcome};
use allot_agent::hardware::mock::{RecordingDisplay, ScriptedEvent, ScriptedReader};
use allot_agent::shutdown;
use allot_agent::store::{SeatStore, Student};

fn student(id: i64, branch: &str, token: &str) -> Student {
    Student {
        id,
        name: format!("Student {id}"),
        branch: branch.to_string(),
        register_no: format!("REG{id:04}"),
        photo_path: None,
        token_uid: token.to_string(),
    }
}

fn fast_config() -> EngineConfig {
    EngineConfig {
        read_retry_delay: Duration::from_millis(1),
        display_hold: Duration::from_millis(1),
        shutdown_poll: Duration::from_millis(1),
    }
}

#[test]
fn re_presented_token_reports_same_seat() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("allotment.db");

    let store = SeatStore::open(&db).unwrap();
    store.insert_student(&student(1, "CSE", "T1")).unwrap();
    store.provision_room("R101", 4).unwrap();

    let (handle, token) = shutdown::channel();
    let reader = ScriptedReader::new(
        [ScriptedEvent::token("T1"), ScriptedEvent::token("T1")],
        Some(handle),
    );
    let releases = reader.release_counter();
    let display = RecordingDisplay::new();

    let engine = AllocationEngine::new(
        store,
        Box::new(reader),
        Box::new(display.clone()),
        token,
        fast_config(),
    );
    engine.run().unwrap();

    let frames = display.frames();
    // prompt, assignment, prompt, re-query, prompt
    let assigned = &frames[1];
    let requeried = &frames[3];
    assert!(assigned.1.starts_with("R101 Seat "));
    assert_eq!(requeried.0, "ACTD-Student 1");
    assert_eq!(requeried.1, assigned.1);

    // Cleanup ran exactly once
    assert_eq!(display.clears(), 1);
    assert_eq!(releases.load(Ordering::SeqCst), 1);

    // Exactly one seat committed, invariants intact
    let store = SeatStore::open(&db).unwrap();
    let occupied: Vec<_> = store
        .list_seats()
        .unwrap()
        .into_iter()
        .filter(|s| s.occupied)
        .collect();
    assert_eq!(occupied.len(), 1);
    assert_eq!(occupied[0].student_id, Some(1));
}

#[test]
fn unknown_token_and_exhausted_room_are_reported() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("allotment.db");

    let store = SeatStore::open(&db).unwrap();
    store.insert_student(&student(1, "CSE", "T1")).unwrap();
    store.insert_student(&student(2, "CSE", "T2")).unwrap();
    store.provision_room("R101", 2).unwrap();

    let (handle, token) = shutdown::channel();
    let reader = ScriptedReader::new(
        [
            ScriptedEvent::token("FFFF"),
            ScriptedEvent::token("T1"),
            ScriptedEvent::ReadError,
            ScriptedEvent::token("T2"),
        ],
        Some(handle),
    );
    let display = RecordingDisplay::new();

    let engine = AllocationEngine::new(
        store,
        Box::new(reader),
        Box::new(display.clone()),
        token,
        fast_config(),
    );
    engine.run().unwrap();

    let frames = display.frames();
    assert!(frames.iter().any(|f| f.0 == "Unknown card!"));
    // Second CSE student is branch-blocked from the only room; the read
    // error in between did not kill the loop.
    assert!(frames.iter().any(|f| f.0 == "No seats left!"));
}

#[test]
fn branch_exclusivity_holds_across_rooms() {
    let store = SeatStore::open_in_memory().unwrap();
    let branches = ["CSE", "ECE", "ME"];

    // 3 branches x 3 students over 3 rooms of capacity 4: every student
    // fits, at most one student per branch per room.
    let mut id = 0;
    for branch in branches {
        for _ in 0..3 {
            id += 1;
            store
                .insert_student(&student(id, branch, &format!("T{id}")))
                .unwrap();
        }
    }
    for room in ["R101", "R102", "R103"] {
        store.provision_room(room, 4).unwrap();
    }

    for n in 1..=id {
        let outcome = resolve_token(&store, &format!("T{n}")).unwrap();
        assert!(
            matches!(outcome, TokenOutcome::Assigned { .. }),
            "student {n} should get a seat, got {outcome:?}"
        );
    }

    // No same-branch collision within any room
    for room in store.rooms().unwrap() {
        let roster = store.room_roster(&room).unwrap();
        let mut seen = std::collections::HashSet::new();
        for entry in &roster {
            assert!(
                seen.insert(entry.branch.clone()),
                "room {room} seats two {} students",
                entry.branch
            );
        }
    }

    // Every room now blocks every branch: one more student of any branch
    // gets NoSeatAvailable even though free seats remain.
    store.insert_student(&student(99, "CSE", "T99")).unwrap();
    assert!(matches!(
        resolve_token(&store, "T99").unwrap(),
        TokenOutcome::NoSeatAvailable { .. }
    ));

    // Occupancy invariant over the whole table
    for seat in store.list_seats().unwrap() {
        assert_eq!(seat.occupied, seat.student_id.is_some());
    }
}

#[test]
fn closed_reader_ends_the_loop_with_cleanup() {
    // A reader that can produce no further tokens (e.g. its input stream
    // closed underneath it) must stop the engine, not be retried forever.
    let store = SeatStore::open_in_memory().unwrap();

    let (_handle, token) = shutdown::channel();
    let reader = ScriptedReader::new([], None);
    let releases = reader.release_counter();
    let display = RecordingDisplay::new();

    let engine = AllocationEngine::new(
        store,
        Box::new(reader),
        Box::new(display.clone()),
        token,
        fast_config(),
    );
    // Returns promptly even though shutdown was never requested.
    engine.run().unwrap();

    assert_eq!(display.frames().len(), 1); // the initial prompt only
    assert_eq!(display.clears(), 1);
    assert_eq!(releases.load(Ordering::SeqCst), 1);
}

#[test]
fn cleanup_runs_exactly_once_when_a_cycle_panics() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("allotment.db");

    let store = SeatStore::open(&db).unwrap();
    store.insert_student(&student(1, "CSE", "T1")).unwrap();
    store.provision_room("R101", 2).unwrap();

    let (_handle, token) = shutdown::channel();
    let reader = ScriptedReader::new(
        [ScriptedEvent::token("T1"), ScriptedEvent::Panic],
        None,
    );
    let releases = reader.release_counter();
    let display = RecordingDisplay::new();

    let engine = AllocationEngine::new(
        store,
        Box::new(reader),
        Box::new(display.clone()),
        token,
        fast_config(),
    );

    let result = catch_unwind(AssertUnwindSafe(move || engine.run()));
    assert!(result.is_err());

    assert_eq!(display.clears(), 1);
    assert_eq!(releases.load(Ordering::SeqCst), 1);

    // The committed assignment survived the crash and the store reopens
    let store = SeatStore::open(&db).unwrap();
    let occupied: Vec<_> = store
        .list_seats()
        .unwrap()
        .into_iter()
        .filter(|s| s.occupied)
        .collect();
    assert_eq!(occupied.len(), 1);
}

#[test]
fn clear_all_races_are_superseded_by_next_write() {
    // An operator clear-all while the engine is mid-assignment simply
    // races; the next presentation re-assigns from a clean slate.
    let store = SeatStore::open_in_memory().unwrap();
    store.insert_student(&student(1, "CSE", "T1")).unwrap();
    store.provision_room("R101", 2).unwrap();

    assert!(matches!(
        resolve_token(&store, "T1").unwrap(),
        TokenOutcome::Assigned { .. }
    ));

    store.release_all_seats().unwrap();

    assert!(matches!(
        resolve_token(&store, "T1").unwrap(),
        TokenOutcome::Assigned { .. }
    ));
    let occupied = store
        .list_seats()
        .unwrap()
        .into_iter()
        .filter(|s| s.occupied)
        .count();
    assert_eq!(occupied, 1);
}
