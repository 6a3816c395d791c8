//! Advisory exclusive lock on a job's lock file.
//!
//! Held for the duration of one `process`/`finalize`/`cancel` call and
//! released on drop, whichever way the call exits.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::error::StoreError;

pub struct StateLock {
    #[cfg_attr(not(unix), allow(dead_code))]
    file: File,
    path: PathBuf,
}

impl std::fmt::Debug for StateLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateLock").field("path", &self.path).finish()
    }
}

impl StateLock {
    /// Takes the lock without waiting. `Ok(None)` means another holder has it.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>, StoreError> {
        imp::lock(path, false)
    }

    /// Waits until the lock is free.
    pub fn acquire(path: &Path) -> Result<Self, StoreError> {
        imp::lock(path, true)?.ok_or_else(|| StoreError::Lock {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::WouldBlock, "lock not acquired"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_lock_file(path: &Path) -> Result<File, StoreError> {
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| StoreError::OpenLock {
            path: path.to_path_buf(),
            source: e,
        })
}

#[cfg(unix)]
mod imp {
    use std::io;
    use std::os::unix::io::AsRawFd;
    use std::path::Path;

    use super::{open_lock_file, StateLock};
    use crate::error::StoreError;

    pub(super) fn lock(path: &Path, blocking: bool) -> Result<Option<StateLock>, StoreError> {
        let file = open_lock_file(path)?;
        let op = if blocking {
            libc::LOCK_EX
        } else {
            libc::LOCK_EX | libc::LOCK_NB
        };

        loop {
            let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
            if rc == 0 {
                return Ok(Some(StateLock {
                    file,
                    path: path.to_path_buf(),
                }));
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock if !blocking => return Ok(None),
                _ => {
                    return Err(StoreError::Lock {
                        path: path.to_path_buf(),
                        source: err,
                    })
                }
            }
        }
    }

    pub(super) fn unlock(lock: &StateLock) {
        unsafe {
            libc::flock(lock.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use std::fs::OpenOptions;
    use std::io;
    use std::path::Path;
    use std::time::Duration;

    use super::{open_lock_file, StateLock};
    use crate::error::StoreError;

    const POLL_INTERVAL: Duration = Duration::from_millis(50);

    /// Without flock the lock is the marker file itself, created exclusively.
    pub(super) fn lock(path: &Path, blocking: bool) -> Result<Option<StateLock>, StoreError> {
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(_) => {
                    let file = open_lock_file(path)?;
                    return Ok(Some(StateLock {
                        file,
                        path: path.to_path_buf(),
                    }));
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if !blocking {
                        return Ok(None);
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(e) => {
                    return Err(StoreError::Lock {
                        path: path.to_path_buf(),
                        source: e,
                    })
                }
            }
        }
    }

    pub(super) fn unlock(lock: &StateLock) {
        let _ = std::fs::remove_file(&lock.path);
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        imp::unlock(self);
    }
}
