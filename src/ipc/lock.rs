//! Advisory file locks enforcing single-producer / single-consumer roles.
//!
//! At most one producer and one consumer may be attached to a given queue
//! name at any instant. The interlock is external to the ring itself: one
//! lock file per role under the lock base directory, held exclusively and
//! non-blocking for the lifetime of the role. A second claimant fails fast
//! instead of waiting.

use std::path::{Path, PathBuf};

use rustix::fd::OwnedFd;
use rustix::fs::{flock, open, FlockOperation, Mode, OFlags};
use rustix::io::Errno;

/// Directory holding lock files and session UUID side files.
pub const LOCK_BASE_PATH: &str = "/tmp";

/// Which end of the ring a lock protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Producer,
    Consumer,
}

impl Role {
    fn lock_suffix(self) -> &'static str {
        match self {
            Role::Producer => ".prod.lock",
            Role::Consumer => ".cons.lock",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Producer => f.write_str("producer"),
            Role::Consumer => f.write_str("consumer"),
        }
    }
}

/// Failure to acquire a role lock.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// The lock file could not be opened or created.
    #[error("failed to open lock file `{path}`: {source}")]
    Open { path: PathBuf, source: Errno },

    /// Another process already holds the lock for this role.
    #[error("another {role} already holds `{path}`")]
    Held { role: Role, path: PathBuf },

    /// `flock` failed for a reason other than contention.
    #[error("flock on `{path}` failed: {source}")]
    Flock { path: PathBuf, source: Errno },
}

/// Lock file path for a queue name and role.
pub fn lock_path(name: &str, role: Role) -> PathBuf {
    Path::new(LOCK_BASE_PATH).join(format!("{name}{}", role.lock_suffix()))
}

/// Session UUID side file path for a queue name.
pub fn uuid_path(name: &str) -> PathBuf {
    Path::new(LOCK_BASE_PATH).join(format!("{name}.uuid"))
}

/// An exclusively held advisory lock, released on drop.
///
/// The kernel drops the lock when the fd closes, so a crashed holder never
/// wedges the role: the next claimant simply wins the flock.
#[derive(Debug)]
pub struct RoleLock {
    fd: OwnedFd,
    path: PathBuf,
}

impl RoleLock {
    /// Claims the role for `name`, failing fast if it is already held.
    ///
    /// # Errors
    ///
    /// [`LockError::Held`] when another process owns the role;
    /// [`LockError::Open`] / [`LockError::Flock`] on syscall failure.
    pub fn acquire(name: &str, role: Role) -> Result<Self, LockError> {
        let path = lock_path(name, role);

        let fd = open(
            &path,
            OFlags::RDWR | OFlags::CREATE | OFlags::CLOEXEC,
            Mode::RUSR | Mode::WUSR | Mode::RGRP | Mode::WGRP | Mode::ROTH | Mode::WOTH,
        )
        .map_err(|source| LockError::Open {
            path: path.clone(),
            source,
        })?;

        match flock(&fd, FlockOperation::NonBlockingLockExclusive) {
            Ok(()) => Ok(Self { fd, path }),
            Err(Errno::WOULDBLOCK) => Err(LockError::Held { role, path }),
            Err(source) => Err(LockError::Flock { path, source }),
        }
    }

    /// Path of the underlying lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RoleLock {
    fn drop(&mut self) {
        // Closing the fd releases the lock; the explicit unlock just makes
        // the hand-off immediate. The lock file itself is never unlinked --
        // another process may be racing to open the same path.
        let _ = flock(&self.fd, FlockOperation::Unlock);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_claim_on_same_role_fails() {
        let name = "ordergate-test-lock-dup";
        let first = RoleLock::acquire(name, Role::Producer).unwrap();
        let second = RoleLock::acquire(name, Role::Producer);
        assert!(matches!(second, Err(LockError::Held { role: Role::Producer, .. })));
        drop(first);

        // Released on drop: the role can be claimed again.
        let third = RoleLock::acquire(name, Role::Producer).unwrap();
        drop(third);
    }

    #[test]
    fn producer_and_consumer_locks_are_independent() {
        let name = "ordergate-test-lock-roles";
        let prod = RoleLock::acquire(name, Role::Producer).unwrap();
        let cons = RoleLock::acquire(name, Role::Consumer).unwrap();
        drop(prod);
        drop(cons);
    }

    #[test]
    fn paths_follow_the_naming_scheme() {
        assert_eq!(
            lock_path("orders", Role::Producer),
            PathBuf::from("/tmp/orders.prod.lock")
        );
        assert_eq!(
            lock_path("orders", Role::Consumer),
            PathBuf::from("/tmp/orders.cons.lock")
        );
        assert_eq!(uuid_path("orders"), PathBuf::from("/tmp/orders.uuid"));
    }
}
