//! Per-directory invocation lease
//!
//! The infrastructure tool keeps its state next to its configuration, so two
//! invocations sharing a working directory would race on that state. The
//! lease makes the one-at-a-time rule explicit inside this process instead
//! of relying on the tool's own state locking.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{Error, Result};

static LEASES: Lazy<DashMap<PathBuf, Arc<Mutex<()>>>> = Lazy::new(DashMap::new);

/// Held for the lifetime of one invocation; dropping it frees the directory.
#[derive(Debug)]
pub struct DirectoryLease {
    dir: PathBuf,
    _guard: OwnedMutexGuard<()>,
}

impl DirectoryLease {
    /// Directory this lease covers
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Take the lease for `dir` without waiting.
///
/// Fails with [`Error::DirectoryBusy`] if another invocation holds it.
pub fn try_acquire(dir: &Path) -> Result<DirectoryLease> {
    let key = std::fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
    let mutex = LEASES
        .entry(key.clone())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone();

    match mutex.try_lock_owned() {
        Ok(guard) => Ok(DirectoryLease {
            dir: key,
            _guard: guard,
        }),
        Err(_) => Err(Error::DirectoryBusy {
            dir: dir.to_path_buf(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_lease_on_same_directory_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let first = try_acquire(dir.path()).unwrap();

        let second = try_acquire(dir.path());
        assert!(matches!(second, Err(Error::DirectoryBusy { .. })));

        drop(first);
        assert!(try_acquire(dir.path()).is_ok());
    }

    #[test]
    fn leases_on_different_directories_are_independent() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let _la = try_acquire(a.path()).unwrap();
        let lb = try_acquire(b.path()).unwrap();
        assert_eq!(lb.dir(), std::fs::canonicalize(b.path()).unwrap());
    }

    #[test]
    fn equivalent_paths_share_one_lease() {
        let dir = tempfile::tempdir().unwrap();
        let _held = try_acquire(dir.path()).unwrap();
        let dotted = dir.path().join(".");
        assert!(matches!(
            try_acquire(&dotted),
            Err(Error::DirectoryBusy { .. })
        ));
    }
}
