//! Instance arbiter: decides which process owns the command channel.
//!
//! Ownership is an exclusive advisory lock on a well-known file. Creation and
//! the ownership check are one atomic kernel operation, and the kernel drops
//! the lock when the owning process exits, however it exits.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum ArbiterError {
    #[error("cannot open instance lock {path}: {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error("cannot lock instance lock {path}: {source}")]
    Lock { path: PathBuf, source: io::Error },
}

/// Result of [`InstanceLock::try_acquire`]. When `acquired` is true the lock
/// is held until this value is dropped, which the entry flow only does at
/// process exit.
#[derive(Debug)]
pub struct InstanceLock {
    name: PathBuf,
    acquired: bool,
    _file: Option<File>,
}

impl InstanceLock {
    /// Try to become the sole owner of `name`.
    ///
    /// `Ok` with `acquired == false` means another live process owns it.
    /// Any other failure (permissions, missing directory) is an `Err` and is
    /// fatal to startup; it must not be read as "forward to the owner".
    pub fn try_acquire(name: &Path) -> Result<Self, ArbiterError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(name)
            .map_err(|source| ArbiterError::Open {
                path: name.to_path_buf(),
                source,
            })?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(err) if is_contended(&err) => {
                debug!(lock = %name.display(), "Instance lock held by another process");
                return Ok(Self {
                    name: name.to_path_buf(),
                    acquired: false,
                    _file: None,
                });
            }
            Err(source) => {
                return Err(ArbiterError::Lock {
                    path: name.to_path_buf(),
                    source,
                })
            }
        }

        // Owner pid is informational only; the lock itself is what counts.
        if let Err(err) = record_owner(&mut file) {
            debug!(lock = %name.display(), "Could not record owner pid: {}", err);
        }
        info!(lock = %name.display(), pid = std::process::id(), "Instance lock acquired");

        Ok(Self {
            name: name.to_path_buf(),
            acquired: true,
            _file: Some(file),
        })
    }

    pub fn is_first_instance(&self) -> bool {
        self.acquired
    }

    pub fn name(&self) -> &Path {
        &self.name
    }

    /// Pid recorded by the current owner, if readable.
    pub fn owner_pid(&self) -> Option<u32> {
        let mut contents = String::new();
        File::open(&self.name)
            .ok()?
            .read_to_string(&mut contents)
            .ok()?;
        contents.trim().parse().ok()
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
        || err.kind() == io::ErrorKind::WouldBlock
}

fn record_owner(file: &mut File) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "{}", std::process::id())?;
    file.sync_data()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn second_claim_is_not_first() {
        let dir = tempfile::tempdir().unwrap();
        let name = dir.path().join("wlmd.lock");

        let first = InstanceLock::try_acquire(&name).unwrap();
        assert!(first.is_first_instance());
        assert_eq!(first.owner_pid(), Some(std::process::id()));

        let second = InstanceLock::try_acquire(&name).unwrap();
        assert!(!second.is_first_instance());
        assert_eq!(second.owner_pid(), Some(std::process::id()));
    }

    #[test]
    fn racing_claims_yield_exactly_one_owner() {
        let dir = tempfile::tempdir().unwrap();
        let name = Arc::new(dir.path().join("race.lock"));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let name = Arc::clone(&name);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    InstanceLock::try_acquire(&name).unwrap()
                })
            })
            .collect();

        // Keep every result alive until all threads are done so a winner's
        // lock cannot be released early.
        let locks: Vec<InstanceLock> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let owners = locks.iter().filter(|l| l.is_first_instance()).count();
        assert_eq!(owners, 1);
    }

    #[test]
    fn released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let name = dir.path().join("wlmd.lock");
        drop(InstanceLock::try_acquire(&name).unwrap());
        assert!(InstanceLock::try_acquire(&name).unwrap().is_first_instance());
    }

    #[test]
    fn unusable_location_is_an_error_not_a_forward() {
        let dir = tempfile::tempdir().unwrap();
        let name = dir.path().join("missing-dir").join("wlmd.lock");
        assert!(matches!(
            InstanceLock::try_acquire(&name),
            Err(ArbiterError::Open { .. })
        ));
    }
}
