//! Process-level writer lock for ga-report.
//!
//! Commands that write the database (`load-analytics`, `fix-time-periods`,
//! `load-catalog`) hold `ga-report-writer.lock` for their whole run, so two
//! writers never interleave periods against the same database. Readers
//! (`generate-*-csv`) take no lock.
//!
//! The lock is an advisory OS file lock (flock), scoped to the database path
//! and released when the process exits.

use anyhow::{Context, Result};
use std::collections::hash_map::DefaultHasher;
use std::fs::{self, File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{self, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

const WRITER_LOCK_FILE: &str = "ga-report-writer.lock";

/// Held for as long as the process writes to the database.
pub struct WriterGuard {
    _lock: ProcessLock,
}

/// Acquire the writer lock for `db_path`, failing if another writer holds it.
pub fn acquire_writer_guard(db_path: &Path) -> Result<WriterGuard> {
    match try_acquire_lock(WRITER_LOCK_FILE, db_path)? {
        Some(lock) => Ok(WriterGuard { _lock: lock }),
        None => anyhow::bail!(
            "another ga-report writer is already running against {}",
            db_path.display()
        ),
    }
}

struct ProcessLock {
    file: File,
    path: PathBuf,
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        let _ = unlock_file(&self.file);
        let _ = fs::remove_file(&self.path);
    }
}

fn try_acquire_lock(filename: &str, db_path: &Path) -> Result<Option<ProcessLock>> {
    let dir = lock_dir();
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create runtime lock directory: {}", dir.display()))?;

    let path = dir.join(scoped_lock_filename(filename, db_path));
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .with_context(|| format!("failed to open lock file: {}", path.display()))?;

    match lock_file_nonblocking(&file) {
        Ok(()) => {
            // Owner info for whoever finds the lock held
            let _ = file.set_len(0);
            let _ = file.seek(SeekFrom::Start(0));
            let _ = writeln!(file, "pid={}", std::process::id());
            let _ = file.flush();

            Ok(Some(ProcessLock { file, path }))
        }
        Err(e) if is_lock_busy(&e) => Ok(None),
        Err(e) => Err(e).with_context(|| format!("failed to lock file: {}", path.display())),
    }
}

fn lock_dir() -> PathBuf {
    let mut dir = match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => std::env::temp_dir(),
    };
    dir.push("ga-report");
    dir
}

fn scoped_lock_filename(base_filename: &str, db_path: &Path) -> String {
    let mut hasher = DefaultHasher::new();
    db_path.to_string_lossy().hash(&mut hasher);
    let digest = hasher.finish();
    format!("{base_filename}.{digest:016x}")
}

fn is_lock_busy(error: &io::Error) -> bool {
    matches!(error.kind(), io::ErrorKind::WouldBlock)
        || matches!(error.raw_os_error(), Some(11) | Some(35))
}

#[cfg(unix)]
fn lock_file_nonblocking(file: &File) -> io::Result<()> {
    const LOCK_EX: i32 = 2;
    const LOCK_NB: i32 = 4;
    let fd = file.as_raw_fd();
    // SAFETY: flock is called with a valid file descriptor and constant flags.
    let rc = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn unlock_file(file: &File) -> io::Result<()> {
    const LOCK_UN: i32 = 8;
    let fd = file.as_raw_fd();
    // SAFETY: flock is called with a valid file descriptor and constant flags.
    let rc = unsafe { flock(fd, LOCK_UN) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
unsafe extern "C" {
    fn flock(fd: i32, operation: i32) -> i32;
}

#[cfg(not(unix))]
compile_error!("ga-report process locks currently require Unix (macOS/Linux)");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_writer_is_refused_until_first_exits() {
        let dir = tempfile::TempDir::new().unwrap();
        let db_path = dir.path().join("ga-report.db");

        let first = acquire_writer_guard(&db_path).unwrap();
        assert!(acquire_writer_guard(&db_path).is_err());

        drop(first);
        assert!(acquire_writer_guard(&db_path).is_ok());
    }

    #[test]
    fn test_locks_are_scoped_per_database() {
        let dir = tempfile::TempDir::new().unwrap();
        let _a = acquire_writer_guard(&dir.path().join("a.db")).unwrap();
        assert!(acquire_writer_guard(&dir.path().join("b.db")).is_ok());
    }
}
