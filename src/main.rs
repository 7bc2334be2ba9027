//! allot-engine worker.
//!
//! Spawned by the supervisor (one instance, own process group), this binary
//! runs the blocking allocation loop and exits when signalled. Hardware is
//! the console stand-ins; real reader/display drivers slot in behind the
//! same traits.

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use allot_agent::config::Config;
use allot_agent::engine::{AllocationEngine, EngineConfig};
use allot_agent::hardware::{ConsoleDisplay, LineReader, TokenReader};
use allot_agent::shutdown;
use allot_agent::store::SeatStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting allot-engine worker");

    let config = Config::from_env()?;
    info!(db = %config.db_path.display(), "Configuration loaded");

    let (handle, token) = shutdown::channel();
    tokio::spawn(async move {
        if let Err(e) = shutdown::listen_for_signals(handle).await {
            error!(error = %e, "Signal listener failed");
        }
    });

    let store = SeatStore::open(&config.db_path)?;
    let reader: Box<dyn TokenReader> = match &config.reader_device {
        Some(path) => Box::new(LineReader::open(path)?),
        None => Box::new(LineReader::stdin()),
    };
    let engine = AllocationEngine::new(
        store,
        reader,
        Box::new(ConsoleDisplay::new()),
        token,
        EngineConfig {
            read_retry_delay: std::time::Duration::from_millis(config.read_retry_delay_ms),
            display_hold: std::time::Duration::from_millis(config.display_hold_ms),
            ..EngineConfig::default()
        },
    );

    // The loop blocks on the reader, so it runs off the async runtime.
    tokio::task::spawn_blocking(move || engine.run()).await??;

    info!("allot-engine shutdown complete");
    Ok(())
}
