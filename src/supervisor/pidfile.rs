//! Plain-text pid record for the allocation engine worker.
//!
//! A single numeric pid at a well-known path, overwritten on each start and
//! removed on confirmed stop. It makes stop robust to supervisor restarts:
//! a fresh supervisor with no live child handle can still resolve the
//! worker from here.

use std::fs;
use std::io;
use std::path::Path;

use tracing::warn;

/// Persist the worker pid, creating parent directories as needed.
pub fn write(path: &Path, pid: u32) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, format!("{pid}\n"))
}

/// Read the recorded pid. Missing, unreadable, or non-numeric records all
/// resolve to `None`.
pub fn read(path: &Path) -> Option<i32> {
    let content = fs::read_to_string(path).ok()?;
    content.trim().parse::<i32>().ok().filter(|pid| *pid > 0)
}

/// Remove the record. Best-effort; a missing file is fine.
pub fn remove(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove pid record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_remove_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("engine.pid");

        write(&path, 4321).unwrap();
        assert_eq!(read(&path), Some(4321));

        remove(&path);
        assert_eq!(read(&path), None);
        // Removing again is fine
        remove(&path);
    }

    #[test]
    fn test_garbage_record_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.pid");

        fs::write(&path, "not-a-pid\n").unwrap();
        assert_eq!(read(&path), None);

        fs::write(&path, "-5\n").unwrap();
        assert_eq!(read(&path), None);

        fs::write(&path, "0").unwrap();
        assert_eq!(read(&path), None);
    }
}
