//! Exam seat allotment agent library.
//!
//! The agent has two halves that run in different OS processes:
//!
//! ```text
//! web layer (out of scope)
//! └── Supervisor            (in-process, owns the worker lifecycle)
//!     └── allot-engine      (spawned worker, own process group)
//!         └── AllocationEngine loop: token -> student -> seat -> display
//! ```
//!
//! The [`supervisor::Supervisor`] starts and stops exactly one `allot-engine`
//! worker, records its pid on disk, and enforces an optional gate-close
//! deadline. The [`engine::AllocationEngine`] is an ordinary library type so
//! tests drive it in-process; only the production path runs it behind the
//! `allot-engine` binary.
//!
//! ## Modules
//!
//! - `store`: SQLite persistence for students and seats
//! - `engine`: the blocking token-to-seat allocation loop
//! - `hardware`: token reader / character display interfaces and mocks
//! - `supervisor`: worker spawn, safe-kill protocol, pid record, deadline
//! - `shutdown`: cancellation token satisfied by an OS signal listener

pub mod config;
pub mod engine;
pub mod hardware;
pub mod shutdown;
pub mod store;
pub mod supervisor;

// Re-export commonly used types
pub use engine::{AllocationEngine, EngineConfig, TokenOutcome};
pub use store::{SeatAssignment, SeatStore, Student};
pub use supervisor::{
    GateDeadline, StartOutcome, StatusReport, StopOutcome, Supervisor, SupervisorConfig,
};
