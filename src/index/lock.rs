use std::fs::{File, OpenOptions};
use std::path::Path;

use crate::core::error::{Error, ErrorKind, Result};

/// Advisory exclusive lock on a segment's `.spl` file. The daemon holds
/// one per served index; the indexer refuses to overwrite a locked
/// index unless it is writing a rotation shadow.
pub struct FileLock {
    pub file: File,
}

impl FileLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            use libc::{flock, LOCK_EX, LOCK_NB};

            let fd = file.as_raw_fd();
            unsafe {
                if flock(fd, LOCK_EX | LOCK_NB) != 0 {
                    return Err(Error {
                        kind: ErrorKind::Io,
                        context: format!("failed to lock {}", path.display()),
                    });
                }
            }
        }

        Ok(FileLock { file })
    }

    /// True when someone else currently holds the lock.
    pub fn is_held(path: &Path) -> bool {
        match Self::acquire(path) {
            Ok(_lock) => false,
            Err(_) => true,
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            use libc::{flock, LOCK_UN};

            let fd = self.file.as_raw_fd();
            unsafe {
                flock(fd, LOCK_UN);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn lock_is_exclusive_within_process_scope() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test1.spl");
        let lock = FileLock::acquire(&path).unwrap();
        // same-process flock re-acquisition on a fresh fd succeeds on
        // some platforms, so only assert release behavior
        drop(lock);
        let relock = FileLock::acquire(&path);
        assert!(relock.is_ok());
    }
}
