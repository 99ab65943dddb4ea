//! Process-wide exclusivity lock for the serial line.
//!
//! Only one process may ever talk to the motor box; two writers interleaving
//! on the port would corrupt both conversations. The lock is an exclusive
//! `flock` on a well-known file in the user's home directory, taken
//! non-blockingly before the port is touched and held until the process
//! exits. The holder writes its PID into the file so a losing process can
//! say who owns the line.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use log::debug;
use nix::fcntl::{Flock, FlockArg};

use crate::error::{DriveError, DriveResult};

/// Lock file name, placed in the user's home directory so the same lock
/// works on every machine the software runs on.
pub const LOCK_FILE_NAME: &str = "drive-system-serial-port.lock";

/// RAII guard over the serial line. Dropping it releases the lock on every
/// exit path, signal-driven termination included (the kernel drops `flock`s
/// with the process).
#[derive(Debug)]
pub struct ProcessLock {
    // Held for its Drop; the flock is released when the file closes.
    _lock: Flock<std::fs::File>,
    path: PathBuf,
}

impl ProcessLock {
    /// Take the lock from the user's home directory, without blocking.
    pub fn acquire() -> DriveResult<Self> {
        let home = dirs::home_dir().ok_or_else(|| {
            DriveError::LinkUnavailable("cannot determine the home directory".to_string())
        })?;
        Self::acquire_at(home)
    }

    /// Take the lock from a specific directory.
    pub fn acquire_at(directory: PathBuf) -> DriveResult<Self> {
        let path = directory.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let mut lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => lock,
            Err((mut file, _)) => {
                let mut owner = String::new();
                let _ = file.read_to_string(&mut owner);
                let owner = owner.trim();
                let holder = if owner.is_empty() {
                    "another process".to_string()
                } else {
                    format!("process {owner}")
                };
                return Err(DriveError::LinkUnavailable(format!(
                    "the serial line is in use by {holder} (lock file {}). \
                     Stop that process before running this one",
                    path.display()
                )));
            }
        };

        lock.set_len(0)?;
        lock.seek(SeekFrom::Start(0))?;
        writeln!(lock, "{}", std::process::id())?;
        lock.flush()?;
        debug!("serial line lock taken at {}", path.display());

        Ok(Self { _lock: lock, path })
    }

    /// Where the lock file lives.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::tempdir;

    #[test]
    #[serial]
    fn test_acquire_and_release() {
        let dir = tempdir().unwrap();
        let lock = ProcessLock::acquire_at(dir.path().to_path_buf()).unwrap();
        assert!(lock.path().exists());
        drop(lock);
        // Released: can be taken again.
        let _again = ProcessLock::acquire_at(dir.path().to_path_buf()).unwrap();
    }

    #[test]
    #[serial]
    fn test_second_acquire_fails_and_names_owner() {
        let dir = tempdir().unwrap();
        let _held = ProcessLock::acquire_at(dir.path().to_path_buf()).unwrap();
        let err = ProcessLock::acquire_at(dir.path().to_path_buf()).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("in use"), "{text}");
        assert!(
            text.contains(&std::process::id().to_string()),
            "diagnostic should name the owner: {text}"
        );
    }

    #[test]
    #[serial]
    fn test_lock_file_contains_pid() {
        let dir = tempdir().unwrap();
        let lock = ProcessLock::acquire_at(dir.path().to_path_buf()).unwrap();
        let contents = std::fs::read_to_string(lock.path()).unwrap();
        assert_eq!(
            contents.trim(),
            std::process::id().to_string()
        );
    }
}
