//! Configuration for the allot-engine worker.

use std::path::PathBuf;

use anyhow::Result;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite seat store.
    pub db_path: PathBuf,

    /// Device or FIFO the token reader lines come from; stdin when unset.
    pub reader_device: Option<PathBuf>,

    /// Pause after a failed reader poll, in milliseconds.
    pub read_retry_delay_ms: u64,

    /// How long an assignment result stays on the display, in milliseconds.
    pub display_hold_ms: u64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let data_dir = std::env::var("ALLOT_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/var/lib/allot-agent"));

        let db_path = std::env::var("ALLOT_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("allotment.db"));

        let reader_device = std::env::var("ALLOT_READER_DEVICE").ok().map(PathBuf::from);

        let read_retry_delay_ms = std::env::var("ALLOT_READ_RETRY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(200);

        let display_hold_ms = std::env::var("ALLOT_DISPLAY_HOLD_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(3000);

        Ok(Self {
            db_path,
            reader_device,
            read_retry_delay_ms,
            display_hold_ms,
        })
    }
}
