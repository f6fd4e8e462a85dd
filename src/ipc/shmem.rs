//! POSIX shared memory mappings for the IPC ring.
//!
//! The ring's segment size depends on a runtime capacity, so this module maps
//! raw bytes rather than a typed value: [`ShmRegion::create`] for the producer
//! (unlink-then-create, so a fresh incarnation always starts from a clean
//! segment) and [`ShmRegion::open`] for the consumer (open-without-create,
//! with an `fstat` size check before the mapping is trusted).
//!
//! Dropping a region only unmaps it. The segment name is deliberately never
//! unlinked on shutdown (a consumer may still be draining), and leaked
//! segments are reclaimed by the next producer start or the `ipc-cleanup`
//! binary.

use std::ptr::{null_mut, NonNull};

use rustix::fs::{fstat, ftruncate, Mode};
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use rustix::{io, shm};

/// Result alias for shared memory operations.
pub type Result<T> = std::result::Result<T, ShmError>;

/// Errors produced while creating or opening a segment.
#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    /// The POSIX shared memory name is not portable.
    #[error("invalid shared memory path `{path}`: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    /// `shm_open`, `ftruncate`, `fstat` or `mmap` failed with an errno.
    #[error("{op} failed for `{path}`: {source}")]
    Posix {
        op: &'static str,
        path: String,
        source: io::Errno,
    },

    /// The existing segment's size does not match what the caller expects.
    #[error("shared memory `{path}` size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        path: String,
        expected: usize,
        actual: u64,
    },
}

impl ShmError {
    fn posix(op: &'static str, path: &str, source: io::Errno) -> Self {
        Self::Posix {
            op,
            path: path.to_string(),
            source,
        }
    }

    /// True when the segment simply was not there (consumer attached before
    /// the producer created it).
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Posix {
                op: "shm_open",
                source: io::Errno::NOENT,
                ..
            }
        )
    }
}

const POSIX_NAME_MAX: usize = 255;

/// Validates that a path meets POSIX `shm_open` requirements.
///
/// For portable use the name must start with `/`, contain no further
/// slashes, and stay within NAME_MAX.
pub fn validate_shm_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(ShmError::InvalidPath {
            path: path.to_string(),
            reason: "path must start with '/'",
        });
    }
    if path[1..].contains('/') {
        return Err(ShmError::InvalidPath {
            path: path.to_string(),
            reason: "path must not contain additional '/' characters",
        });
    }
    if path.len() > POSIX_NAME_MAX {
        return Err(ShmError::InvalidPath {
            path: path.to_string(),
            reason: "path length must be <= 255 bytes",
        });
    }
    Ok(())
}

/// Mode 0666: the gateway and sequencer may run as different users.
fn segment_mode() -> Mode {
    Mode::RUSR | Mode::WUSR | Mode::RGRP | Mode::WGRP | Mode::ROTH | Mode::WOTH
}

/// A mapped POSIX shared memory segment of runtime-determined size.
///
/// The region hands out a raw base pointer; layout interpretation (header,
/// slot array) is the ring's business. Both ends map read/write because the
/// consumer publishes its read index into the segment.
#[derive(Debug)]
pub struct ShmRegion {
    ptr: NonNull<u8>,
    size: usize,
    path: String,
}

// SAFETY: the mapping is shared memory, not thread-local state; concurrent
// access is mediated by the atomics the ring places inside it.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl ShmRegion {
    /// Creates a fresh segment of `size` bytes, discarding any prior segment
    /// of the same name.
    ///
    /// The unlink is idempotent: a leftover name from a crashed producer is
    /// removed first, so the new incarnation never inherits stale contents.
    /// The mapping is zero-filled by the kernel.
    ///
    /// # Errors
    ///
    /// Returns `Err` on an invalid path or when `shm_open`, `ftruncate` or
    /// `mmap` fail.
    pub fn create(path: &str, size: usize) -> Result<Self> {
        validate_shm_path(path)?;

        // Discard any previous incarnation's segment. ENOENT is the common
        // case and not an error.
        let _ = shm::unlink(path);

        let fd = shm::open(
            path,
            shm::OFlags::CREATE | shm::OFlags::RDWR,
            segment_mode(),
        )
        .map_err(|err| ShmError::posix("shm_open", path, err))?;

        if let Err(err) = ftruncate(&fd, size as u64) {
            drop(fd);
            let _ = shm::unlink(path);
            return Err(ShmError::posix("ftruncate", path, err));
        }

        Self::map(fd, path, size, true)
    }

    /// Opens an existing segment and verifies it is exactly `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns `Err` when the segment does not exist (see
    /// [`ShmError::is_not_found`]), when its size disagrees with `size`, or
    /// when a syscall fails.
    pub fn open(path: &str, size: usize) -> Result<Self> {
        validate_shm_path(path)?;

        let fd = shm::open(path, shm::OFlags::RDWR, Mode::empty())
            .map_err(|err| ShmError::posix("shm_open", path, err))?;

        let stat = match fstat(&fd) {
            Ok(stat) => stat,
            Err(err) => {
                drop(fd);
                return Err(ShmError::posix("fstat", path, err));
            }
        };
        if stat.st_size as u64 != size as u64 {
            drop(fd);
            return Err(ShmError::SizeMismatch {
                path: path.to_string(),
                expected: size,
                actual: stat.st_size as u64,
            });
        }

        Self::map(fd, path, size, false)
    }

    fn map(fd: rustix::fd::OwnedFd, path: &str, size: usize, created: bool) -> Result<Self> {
        // SAFETY: fresh mapping from the kernel that aliases no existing Rust
        // object; the fd refers to a segment of at least `size` bytes
        // (ftruncate succeeded on create, fstat verified on open); mmap
        // returns a page-aligned address.
        let ptr_result = unsafe {
            mmap(
                null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        };
        let ptr = match ptr_result {
            Ok(p) => p,
            Err(err) => {
                drop(fd);
                if created {
                    let _ = shm::unlink(path);
                }
                return Err(ShmError::posix("mmap", path, err));
            }
        };

        // SAFETY: mmap never returns null on success.
        let ptr = unsafe { NonNull::new_unchecked(ptr.cast::<u8>()) };

        Ok(Self {
            ptr,
            size,
            path: path.to_string(),
        })
    }

    /// Base address of the mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Mapped length in bytes.
    pub fn len(&self) -> usize {
        self.size
    }

    /// The POSIX name this region was mapped from.
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        // Unmap only. The name outlives us so the peer can keep draining;
        // reclamation is the next producer's (or ipc-cleanup's) job.
        unsafe {
            let _ = munmap(self.ptr.as_ptr().cast(), self.size);
        }
    }
}

/// Removes the named segment, ignoring a missing one.
///
/// # Errors
///
/// Returns `Err` only for failures other than ENOENT.
pub fn unlink_segment(path: &str) -> Result<()> {
    validate_shm_path(path)?;
    match shm::unlink(path) {
        Ok(()) | Err(io::Errno::NOENT) => Ok(()),
        Err(err) => Err(ShmError::posix("shm_unlink", path, err)),
    }
}
