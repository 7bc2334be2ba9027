//! Token reader and character display interfaces.
//!
//! The real reader and the 16x2 display are external hardware; the engine
//! talks to them through these traits. Console-backed implementations cover
//! bench use, and scripted mocks cover tests.

use std::collections::VecDeque;
use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tracing::debug;

use crate::shutdown::ShutdownHandle;

/// Character width of one display line.
pub const DISPLAY_WIDTH: usize = 16;

/// Errors from reader or display operations.
#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("reader closed")]
    Closed,
}

/// Blocking token reader.
///
/// `read_token` has no cancellation primitive; callers check shutdown state
/// around the call, not during it.
pub trait TokenReader: Send {
    /// Block until the next token is presented and return its UID.
    fn read_token(&mut self) -> Result<String, HardwareError>;

    /// Release the hardware interface. Called once during engine cleanup.
    fn release(&mut self) -> Result<(), HardwareError>;
}

/// Two-line status display. Best-effort: callers log failures and move on.
pub trait Display: Send {
    /// Show up to two lines of text.
    fn show(&mut self, top: &str, bottom: &str) -> Result<(), HardwareError>;

    /// Clear the display.
    fn clear(&mut self) -> Result<(), HardwareError>;
}

/// Reader that takes one token UID per line from standard input.
///
/// Stands in for the RFID reader on a bench setup; a real driver implements
/// [`TokenReader`] the same way.
pub struct LineReader<R> {
    input: R,
}

impl LineReader<io::BufReader<io::Stdin>> {
    /// Read token lines from stdin.
    pub fn stdin() -> Self {
        Self {
            input: io::BufReader::new(io::stdin()),
        }
    }
}

impl LineReader<io::BufReader<std::fs::File>> {
    /// Read token lines from a device or FIFO path.
    pub fn open(path: impl AsRef<std::path::Path>) -> io::Result<Self> {
        Ok(Self {
            input: io::BufReader::new(std::fs::File::open(path)?),
        })
    }
}

impl<R: BufRead + Send> LineReader<R> {
    pub fn new(input: R) -> Self {
        Self { input }
    }
}

impl<R: BufRead + Send> TokenReader for LineReader<R> {
    fn read_token(&mut self) -> Result<String, HardwareError> {
        loop {
            let mut line = String::new();
            let read = self.input.read_line(&mut line)?;
            if read == 0 {
                return Err(HardwareError::Closed);
            }
            let uid = line.trim();
            if !uid.is_empty() {
                return Ok(uid.to_string());
            }
        }
    }

    fn release(&mut self) -> Result<(), HardwareError> {
        debug!("Line reader released");
        Ok(())
    }
}

/// Display that renders the two lines to standard output.
pub struct ConsoleDisplay {
    out: io::Stdout,
}

impl ConsoleDisplay {
    pub fn new() -> Self {
        Self { out: io::stdout() }
    }
}

impl Default for ConsoleDisplay {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ConsoleDisplay {
    fn show(&mut self, top: &str, bottom: &str) -> Result<(), HardwareError> {
        let mut out = self.out.lock();
        writeln!(out, "[display] {}", truncate(top))?;
        writeln!(out, "[display] {}", truncate(bottom))?;
        out.flush()?;
        Ok(())
    }

    fn clear(&mut self) -> Result<(), HardwareError> {
        let mut out = self.out.lock();
        writeln!(out, "[display] <clear>")?;
        out.flush()?;
        Ok(())
    }
}

/// Clamp a line to the physical display width.
fn truncate(line: &str) -> &str {
    match line.char_indices().nth(DISPLAY_WIDTH) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}

/// Scripted hardware for tests.
pub mod mock {
    use super::*;

    /// One scripted reader event.
    pub enum ScriptedEvent {
        /// A token presentation with this UID.
        Token(String),
        /// A transient read failure.
        ReadError,
        /// A driver fault that unwinds mid-cycle.
        Panic,
    }

    impl ScriptedEvent {
        pub fn token(uid: &str) -> Self {
            Self::Token(uid.to_string())
        }
    }

    /// Reader that replays a fixed script. When the script runs out it
    /// triggers the optional shutdown handle so the engine loop winds down.
    pub struct ScriptedReader {
        events: VecDeque<ScriptedEvent>,
        on_exhausted: Option<ShutdownHandle>,
        releases: Arc<AtomicUsize>,
    }

    impl ScriptedReader {
        pub fn new(
            events: impl IntoIterator<Item = ScriptedEvent>,
            on_exhausted: Option<ShutdownHandle>,
        ) -> Self {
            Self {
                events: events.into_iter().collect(),
                on_exhausted,
                releases: Arc::new(AtomicUsize::new(0)),
            }
        }

        /// Counter incremented on each `release` call.
        pub fn release_counter(&self) -> Arc<AtomicUsize> {
            Arc::clone(&self.releases)
        }
    }

    impl TokenReader for ScriptedReader {
        fn read_token(&mut self) -> Result<String, HardwareError> {
            match self.events.pop_front() {
                Some(ScriptedEvent::Token(uid)) => Ok(uid),
                Some(ScriptedEvent::ReadError) => {
                    Err(HardwareError::Io(io::Error::other("scripted read error")))
                }
                Some(ScriptedEvent::Panic) => panic!("scripted reader fault"),
                None => {
                    if let Some(handle) = &self.on_exhausted {
                        handle.trigger();
                    }
                    Err(HardwareError::Closed)
                }
            }
        }

        fn release(&mut self) -> Result<(), HardwareError> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recorded {
        frames: Vec<(String, String)>,
        clears: usize,
    }

    /// Display that records frames for assertions. Clones share state.
    #[derive(Clone, Default)]
    pub struct RecordingDisplay {
        state: Arc<Mutex<Recorded>>,
    }

    impl RecordingDisplay {
        pub fn new() -> Self {
            Self::default()
        }

        /// Frames shown so far, oldest first.
        pub fn frames(&self) -> Vec<(String, String)> {
            self.state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .frames
                .clone()
        }

        /// Number of `clear` calls so far.
        pub fn clears(&self) -> usize {
            self.state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clears
        }
    }

    impl Display for RecordingDisplay {
        fn show(&mut self, top: &str, bottom: &str) -> Result<(), HardwareError> {
            self.state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .frames
                .push((top.to_string(), bottom.to_string()));
            Ok(())
        }

        fn clear(&mut self) -> Result<(), HardwareError> {
            self.state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clears += 1;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{ScriptedEvent, ScriptedReader};
    use super::*;

    #[test]
    fn test_line_reader_skips_blank_lines() {
        let input = io::Cursor::new(b"\n  \nAB12CD34\n".to_vec());
        let mut reader = LineReader::new(input);

        assert_eq!(reader.read_token().unwrap(), "AB12CD34");
        assert!(matches!(
            reader.read_token(),
            Err(HardwareError::Closed)
        ));
    }

    #[test]
    fn test_line_reader_from_device_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reader");
        std::fs::write(&path, "AB12CD34\n").unwrap();

        let mut reader = LineReader::open(&path).unwrap();
        assert_eq!(reader.read_token().unwrap(), "AB12CD34");
        assert!(matches!(reader.read_token(), Err(HardwareError::Closed)));
    }

    #[test]
    fn test_truncate_to_display_width() {
        assert_eq!(truncate("short"), "short");
        assert_eq!(truncate("0123456789abcdefOVERFLOW"), "0123456789abcdef");
    }

    #[test]
    fn test_scripted_reader_replays_then_closes() {
        let mut reader = ScriptedReader::new(
            [ScriptedEvent::token("T1"), ScriptedEvent::ReadError],
            None,
        );

        assert_eq!(reader.read_token().unwrap(), "T1");
        assert!(matches!(reader.read_token(), Err(HardwareError::Io(_))));
        assert!(matches!(reader.read_token(), Err(HardwareError::Closed)));

        let releases = reader.release_counter();
        reader.release().unwrap();
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }
}
