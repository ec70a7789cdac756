use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use crate::error::Result;
use crate::Error;

/// Name of the lock file inside a storage directory.
pub const LOCK_FILE: &str = "LOCK";

/// Exclusive advisory lock on a storage directory. Only one process may
/// open a storage location at a time. The lock is released when the value
/// is dropped, the lock file itself stays.
#[derive(Debug)]
pub struct DirLock {
    _file: File,
    path: PathBuf,
}

impl DirLock {
    /// Locks `dir`, failing immediately if another process holds the lock.
    /// The lock file records the owning process id.
    pub fn lock(dir: &Path) -> Result<Self> {
        let path = dir.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(Error::LockError)?;

        try_lock(&file).map_err(Error::LockError)?;

        file.set_len(0)
            .and_then(|_| writeln!(file, "{}", std::process::id()))
            .and_then(|_| file.flush())
            .map_err(Error::LockError)?;

        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn try_lock(file: &File) -> io::Result<()> {
    use libc::{flock, LOCK_EX, LOCK_NB};

    let result = unsafe { flock(file.as_raw_fd(), LOCK_EX | LOCK_NB) };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn try_lock(_file: &File) -> io::Result<()> {
    tracing::warn!("Advisory directory locks are not supported on this platform");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    #[test]
    fn test_lock_writes_pid() {
        let dir = TempDir::new().unwrap();
        let lock = DirLock::lock(dir.path()).unwrap();

        assert_eq!(lock.path(), dir.path().join(LOCK_FILE));
        let content = std::fs::read_to_string(lock.path()).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());
    }

    #[test]
    fn test_double_lock_fails() {
        let dir = TempDir::new().unwrap();
        let _lock = DirLock::lock(dir.path()).unwrap();

        assert!(matches!(
            DirLock::lock(dir.path()),
            Err(Error::LockError(_))
        ));
        // A failed attempt leaves the owner's pid in place
        let content = std::fs::read_to_string(dir.path().join(LOCK_FILE)).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());
    }

    #[test]
    fn test_released_on_drop() {
        let dir = TempDir::new().unwrap();
        {
            let _lock = DirLock::lock(dir.path()).unwrap();
        }
        assert!(DirLock::lock(dir.path()).is_ok());
    }
}
