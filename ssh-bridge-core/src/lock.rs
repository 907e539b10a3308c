//! The single-instance lock (§5): an exclusive, non-blocking advisory lock
//! on `<configDir>/lock`, pidfile semantics layered on top.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use fs2::FileExt;

/// Held for the daemon's lifetime. Dropping it truncates the lock file and
/// releases the flock, matching the shutdown sequence in §5.
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("another daemon is already running")]
    AlreadyRunning,
    #[error("opening lock file at {path}: {source}")]
    Open { path: PathBuf, source: std::io::Error },
}

impl InstanceLock {
    /// Acquires the lock at `<config_dir>/lock`, or returns
    /// `LockError::AlreadyRunning` if another daemon holds it.
    pub fn acquire(config_dir: &Path) -> Result<InstanceLock, LockError> {
        let path = config_dir.join("lock");
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| LockError::Open { path: path.clone(), source })?;

        file.try_lock_exclusive().map_err(|_| LockError::AlreadyRunning)?;

        let mut lock = InstanceLock { file, path };
        lock.write_pid().map_err(|source| LockError::Open { path: lock.path.clone(), source })?;
        Ok(lock)
    }

    fn write_pid(&mut self) -> std::io::Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        writeln!(self.file, "{}", std::process::id())?;
        self.file.flush()
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

/// Ensures `<home>/.ssh-bridge` (or an explicit override) exists with mode
/// `0700`, per §6. The caller side of the library creates it; the daemon
/// refuses to run if it is missing.
pub fn ensure_config_dir(config_dir: &Path) -> anyhow::Result<()> {
    if config_dir.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("creating config dir at {}", config_dir.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(config_dir, std::fs::Permissions::from_mode(0o700))
            .with_context(|| format!("setting permissions on {}", config_dir.display()))?;
    }
    Ok(())
}

/// Unlinks a stale socket file left by a crashed daemon, if present.
pub fn remove_stale_socket(socket_path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(socket_path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_then_acquire_again_fails() {
        let dir = tempfile::tempdir().unwrap();
        let first = InstanceLock::acquire(dir.path()).unwrap();
        let second = InstanceLock::acquire(dir.path());
        assert!(matches!(second, Err(LockError::AlreadyRunning)));
        drop(first);
        assert!(InstanceLock::acquire(dir.path()).is_ok());
    }

    #[test]
    fn acquire_writes_pid_to_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let _lock = InstanceLock::acquire(dir.path()).unwrap();
        let contents = std::fs::read_to_string(dir.path().join("lock")).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());
    }

    #[test]
    fn ensure_config_dir_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config_dir = dir.path().join("nested").join(".ssh-bridge");
        ensure_config_dir(&config_dir).unwrap();
        assert!(config_dir.is_dir());
    }

    #[test]
    fn remove_stale_socket_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("sock");
        assert!(remove_stale_socket(&socket_path).is_ok());
    }
}
