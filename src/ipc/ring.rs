//! Lock-free SPSC ring over POSIX shared memory, with session identity.
//!
//! One producer process and one consumer process share a segment laid out as
//! a fixed header followed by `capacity` message slots:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ RingHeader                                   │
//! │  signature: [u8; 32]   "IPC_V1_MAGIC"        │
//! │  uuid: [u8; 37]        session identity      │
//! │  write (64-byte aligned): AtomicU32          │
//! │  read  (64-byte aligned): AtomicU32          │
//! │  capacity, max_msg_size: u32                 │
//! ├──────────────────────────────────────────────┤
//! │ Slot 0  { len: AtomicU32, data: [u8; 4096] } │
//! │ Slot 1                                       │
//! │ ...                                          │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! The indices are monotonic u32 counters; `write - read` (wrapping) is the
//! fill level, so empty is `write == read` and full is `write - read ==
//! capacity`. Only the producer stores `write`, only the consumer stores
//! `read`; each publishes with release and observes the peer with acquire.
//! The two counters sit on distinct cache lines to prevent false sharing.
//!
//! # Session identity
//!
//! Each producer incarnation generates a fresh UUID and writes it to both the
//! header and a side file at `/tmp/<name>.uuid`. A consumer attach compares
//! the two: a mismatch means the segment was left behind by a producer that
//! has since been replaced, and the attach fails with
//! [`IpcError::StaleSession`] instead of reading another incarnation's bytes.
//!
//! # Role exclusion
//!
//! Advisory file locks (`<name>.prod.lock` / `<name>.cons.lock`) guarantee at
//! most one producer and one consumer per queue name per host; a second
//! claimant fails fast with [`IpcError::RoleConflict`].

use std::cell::Cell;
use std::marker::PhantomData;
use std::mem::size_of;
use std::sync::atomic::{AtomicU32, Ordering};

use uuid::Uuid;

use super::lock::{uuid_path, LockError, Role, RoleLock};
use super::shmem::{ShmError, ShmRegion};

/// Maximum number of bytes a single frame can occupy in a slot.
pub const MAX_MSG_SIZE: usize = 4096;

/// Default number of slots in a ring.
pub const DEFAULT_CAPACITY: u32 = 1024;

/// Magic signature identifying a valid ring segment (zero-padded to 32).
const MAGIC: &[u8] = b"IPC_V1_MAGIC";

/// Presentation length of an RFC 4122 UUID.
const UUID_LEN: usize = 36;

/// Result alias for ring operations.
pub type Result<T> = std::result::Result<T, IpcError>;

/// Structural failures of ring creation and attachment.
///
/// `Full` and `Empty` are deliberately absent: they are ordinary return
/// values of [`RingProducer::write`] and [`RingConsumer::read`].
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// Another process already holds this role for the queue.
    #[error("another {role} is already attached to queue `{name}`")]
    RoleConflict { role: Role, name: String },

    /// Consumer attach before the producer created the segment.
    #[error("no shared memory segment for queue `{name}` (producer not up)")]
    NotFound { name: String },

    /// The segment exists but cannot be trusted.
    #[error("corrupt segment for queue `{name}`: {reason}")]
    CorruptSegment { name: String, reason: String },

    /// The segment belongs to a dead producer incarnation.
    #[error(
        "stale session for queue `{name}`: segment holds {segment_uuid}, side file holds {side_uuid}"
    )]
    StaleSession {
        name: String,
        segment_uuid: String,
        side_uuid: String,
    },

    /// Shared memory syscall failure (including a size mismatch).
    #[error(transparent)]
    Shm(ShmError),

    /// Lock file failure other than contention.
    #[error(transparent)]
    Lock(LockError),

    /// The session UUID side file could not be written.
    #[error("failed to write session uuid file `{path}`: {source}")]
    UuidFile {
        path: String,
        source: std::io::Error,
    },
}

/// Header at offset 0 of the segment.
///
/// Plain fields (`signature`, `uuid`, `capacity`, `max_msg_size`) are written
/// once by the producer before the consumer can pass its attach checks; only
/// the padded index cells are touched afterwards.
#[repr(C)]
struct RingHeader {
    signature: [u8; 32],
    uuid: [u8; 37],
    write: PaddedIndex,
    read: PaddedIndex,
    capacity: u32,
    max_msg_size: u32,
}

/// A monotonic ring index on its own cache line.
#[repr(C, align(64))]
struct PaddedIndex {
    value: AtomicU32,
}

/// One message slot. `len` is covered by the release store on the owning
/// index, so relaxed ordering on the slot itself is sufficient.
#[repr(C)]
struct Slot {
    len: AtomicU32,
    data: [u8; MAX_MSG_SIZE],
}

/// Segment size for a given capacity.
fn segment_size(capacity: u32) -> usize {
    size_of::<RingHeader>() + capacity as usize * size_of::<Slot>()
}

/// POSIX object name for a queue (leading slash mandatory).
fn segment_path(name: &str) -> String {
    format!("/{name}")
}

fn map_lock_error(err: LockError, name: &str) -> IpcError {
    match err {
        LockError::Held { role, .. } => IpcError::RoleConflict {
            role,
            name: name.to_string(),
        },
        other => IpcError::Lock(other),
    }
}

/// Extracts the NUL-terminated session UUID from a header.
fn header_uuid(header: &RingHeader) -> &str {
    let end = header
        .uuid
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(header.uuid.len());
    std::str::from_utf8(&header.uuid[..end]).unwrap_or("")
}

/// Marker to opt out of `Sync` while remaining `Send`: either end may be
/// moved to its worker thread, but never shared between threads.
type PhantomUnsync = PhantomData<Cell<&'static ()>>;

/// Write end of the ring. Exactly one per queue name per host.
pub struct RingProducer {
    region: ShmRegion,
    capacity: u32,
    session_uuid: String,
    name: String,
    // Held for the lifetime of the role; releasing it is the teardown.
    _lock: RoleLock,
    _unsync: PhantomUnsync,
}

// SAFETY: the producer owns its end of the SPSC protocol; moving it between
// threads is fine, sharing it is prevented by PhantomUnsync.
unsafe impl Send for RingProducer {}

impl RingProducer {
    /// Creates a fresh ring: claims the producer role, discards any prior
    /// segment of the same name, and initializes the header with a new
    /// session UUID (written to the header and the `/tmp/<name>.uuid` side
    /// file).
    ///
    /// # Errors
    ///
    /// [`IpcError::RoleConflict`] when another producer holds the role;
    /// shared-memory or side-file failures otherwise.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn create(name: &str, capacity: u32) -> Result<Self> {
        assert!(capacity > 0, "ring capacity must be greater than 0");

        let lock =
            RoleLock::acquire(name, Role::Producer).map_err(|err| map_lock_error(err, name))?;

        let region =
            ShmRegion::create(&segment_path(name), segment_size(capacity)).map_err(IpcError::Shm)?;

        let session_uuid = Uuid::new_v4().to_string();
        debug_assert_eq!(session_uuid.len(), UUID_LEN);

        // The new incarnation wins: the side file is replaced before the
        // consumer-visible header, so a racing attach sees either the old
        // pair or the new pair, never a torn one that passes the comparison.
        let side_path = uuid_path(name);
        std::fs::write(&side_path, &session_uuid).map_err(|source| IpcError::UuidFile {
            path: side_path.display().to_string(),
            source,
        })?;

        // SAFETY: the mapping is fresh, zero-filled, private to this call
        // until we return, and at least `segment_size(capacity)` bytes.
        let header = unsafe { &mut *region.as_ptr().cast::<RingHeader>() };
        header.signature[..MAGIC.len()].copy_from_slice(MAGIC);
        header.uuid[..UUID_LEN].copy_from_slice(session_uuid.as_bytes());
        header.uuid[UUID_LEN] = 0;
        header.capacity = capacity;
        header.max_msg_size = MAX_MSG_SIZE as u32;
        header.write.value.store(0, Ordering::Release);
        header.read.value.store(0, Ordering::Release);

        Ok(Self {
            region,
            capacity,
            session_uuid,
            name: name.to_string(),
            _lock: lock,
            _unsync: PhantomData,
        })
    }

    /// Appends one frame, non-blocking.
    ///
    /// Returns `false`, with no state change, when `data` exceeds the slot
    /// size or the ring is full. The policy is drop-at-producer: the caller
    /// decides whether to log or retry.
    #[inline]
    pub fn write(&self, data: &[u8]) -> bool {
        let header = self.header();

        if data.len() > MAX_MSG_SIZE {
            return false;
        }

        // Single writer: our own index needs no ordering. The consumer's
        // index is acquired so the slot it freed is ours to reuse.
        let w = header.write.value.load(Ordering::Relaxed);
        let r = header.read.value.load(Ordering::Acquire);
        if w.wrapping_sub(r) >= self.capacity {
            return false;
        }

        let slot = self.slot_ptr(w % self.capacity);
        // SAFETY: the full-check above proves the consumer is not reading
        // this slot (w - r < capacity), and the slot index is in bounds.
        // Visibility of these plain writes is ordered by the release store
        // on `write` below.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), (*slot).data.as_mut_ptr(), data.len());
            (*slot).len.store(data.len() as u32, Ordering::Relaxed);
        }

        // Publish: pairs with the consumer's acquire load of `write`.
        header.write.value.store(w.wrapping_add(1), Ordering::Release);
        true
    }

    /// The UUID identifying this producer incarnation.
    pub fn session_uuid(&self) -> &str {
        &self.session_uuid
    }

    /// Logical queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of slots.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Frames currently buffered (producer's view).
    pub fn len(&self) -> u32 {
        let header = self.header();
        let w = header.write.value.load(Ordering::Relaxed);
        let r = header.read.value.load(Ordering::Acquire);
        w.wrapping_sub(r)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn header(&self) -> &RingHeader {
        // SAFETY: the mapping is valid for the region's lifetime and was
        // initialized by `create`.
        unsafe { &*self.region.as_ptr().cast::<RingHeader>() }
    }

    fn slot_ptr(&self, index: u32) -> *mut Slot {
        debug_assert!(index < self.capacity);
        // SAFETY: slots start right after the header; index < capacity.
        unsafe {
            self.region
                .as_ptr()
                .add(size_of::<RingHeader>())
                .cast::<Slot>()
                .add(index as usize)
        }
    }
}

/// Read end of the ring. Exactly one per queue name per host.
pub struct RingConsumer {
    region: ShmRegion,
    capacity: u32,
    session_uuid: String,
    name: String,
    _lock: RoleLock,
    _unsync: PhantomUnsync,
}

// SAFETY: see RingProducer.
unsafe impl Send for RingConsumer {}

impl RingConsumer {
    /// Attaches to an existing ring: claims the consumer role, maps the
    /// segment, and verifies signature, size and session identity.
    ///
    /// This is the crash-recovery hinge: the producer's latest incarnation
    /// always wins, and a consumer still referencing a prior session gets
    /// [`IpcError::StaleSession`] instead of that session's leftovers.
    /// Re-attaching after the error picks up the live incarnation.
    ///
    /// # Errors
    ///
    /// [`IpcError::RoleConflict`], [`IpcError::NotFound`],
    /// [`IpcError::CorruptSegment`] (bad magic, unreadable side file,
    /// header/capacity disagreement) or [`IpcError::StaleSession`].
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn attach(name: &str, capacity: u32) -> Result<Self> {
        assert!(capacity > 0, "ring capacity must be greater than 0");

        let lock =
            RoleLock::acquire(name, Role::Consumer).map_err(|err| map_lock_error(err, name))?;

        let region = ShmRegion::open(&segment_path(name), segment_size(capacity)).map_err(
            |err| {
                if err.is_not_found() {
                    IpcError::NotFound {
                        name: name.to_string(),
                    }
                } else {
                    IpcError::Shm(err)
                }
            },
        )?;

        // SAFETY: mapping verified to be exactly segment_size(capacity).
        let header = unsafe { &*region.as_ptr().cast::<RingHeader>() };

        if &header.signature[..MAGIC.len()] != MAGIC || header.signature[MAGIC.len()] != 0 {
            return Err(IpcError::CorruptSegment {
                name: name.to_string(),
                reason: "header signature mismatch".to_string(),
            });
        }
        if header.capacity != capacity || header.max_msg_size != MAX_MSG_SIZE as u32 {
            return Err(IpcError::CorruptSegment {
                name: name.to_string(),
                reason: format!(
                    "header geometry mismatch: capacity {} max_msg_size {}",
                    header.capacity, header.max_msg_size
                ),
            });
        }

        let segment_uuid = header_uuid(header).to_string();

        let side_path = uuid_path(name);
        let side_uuid = match std::fs::read_to_string(&side_path) {
            Ok(contents) => contents.trim_end().to_string(),
            Err(err) => {
                return Err(IpcError::CorruptSegment {
                    name: name.to_string(),
                    reason: format!("session uuid file `{}` unreadable: {err}", side_path.display()),
                });
            }
        };

        if segment_uuid != side_uuid {
            return Err(IpcError::StaleSession {
                name: name.to_string(),
                segment_uuid,
                side_uuid,
            });
        }

        Ok(Self {
            region,
            capacity,
            session_uuid: segment_uuid,
            name: name.to_string(),
            _lock: lock,
            _unsync: PhantomData,
        })
    }

    /// Pops one frame into `buf`, non-blocking.
    ///
    /// Returns the number of bytes copied, or 0 when the ring is empty
    /// (not an error). A frame longer than `buf` is silently truncated;
    /// callers are expected to supply [`MAX_MSG_SIZE`] buffers.
    #[inline]
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let header = self.header();

        // Single reader: our own index needs no ordering. Acquiring the
        // producer's index makes the published slot contents visible.
        let r = header.read.value.load(Ordering::Relaxed);
        let w = header.write.value.load(Ordering::Acquire);
        if r == w {
            return 0;
        }

        let slot = self.slot_ptr(r % self.capacity);
        // SAFETY: r < w proves the producer published this slot, and it will
        // not overwrite it until we publish the new read index below.
        let copied = unsafe {
            let msg_len = (*slot).len.load(Ordering::Relaxed) as usize;
            let copied = msg_len.min(buf.len());
            std::ptr::copy_nonoverlapping((*slot).data.as_ptr(), buf.as_mut_ptr(), copied);
            copied
        };

        // Frees the slot for the producer: pairs with its acquire of `read`.
        header.read.value.store(r.wrapping_add(1), Ordering::Release);
        copied
    }

    /// Revalidates this consumer's session against the side file.
    ///
    /// A producer restart replaces the side file (and the segment) under the
    /// same queue name; a consumer still mapping the prior incarnation finds
    /// out here. On [`IpcError::StaleSession`] the consumer should drop this
    /// attachment and attach afresh to pick up the live incarnation.
    ///
    /// # Errors
    ///
    /// [`IpcError::StaleSession`] when the side file no longer matches the
    /// session this consumer attached to; [`IpcError::CorruptSegment`] when
    /// the side file is unreadable.
    pub fn check_session(&self) -> Result<()> {
        let side_path = uuid_path(&self.name);
        let side_uuid = match std::fs::read_to_string(&side_path) {
            Ok(contents) => contents.trim_end().to_string(),
            Err(err) => {
                return Err(IpcError::CorruptSegment {
                    name: self.name.clone(),
                    reason: format!(
                        "session uuid file `{}` unreadable: {err}",
                        side_path.display()
                    ),
                });
            }
        };
        if side_uuid != self.session_uuid {
            return Err(IpcError::StaleSession {
                name: self.name.clone(),
                segment_uuid: self.session_uuid.clone(),
                side_uuid,
            });
        }
        Ok(())
    }

    /// The session UUID this consumer attached to.
    pub fn session_uuid(&self) -> &str {
        &self.session_uuid
    }

    /// Logical queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn header(&self) -> &RingHeader {
        // SAFETY: mapping valid for the region's lifetime; attach verified it.
        unsafe { &*self.region.as_ptr().cast::<RingHeader>() }
    }

    fn slot_ptr(&self, index: u32) -> *mut Slot {
        debug_assert!(index < self.capacity);
        // SAFETY: slots start right after the header; index < capacity.
        unsafe {
            self.region
                .as_ptr()
                .add(size_of::<RingHeader>())
                .cast::<Slot>()
                .add(index as usize)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{align_of, offset_of};

    const CACHE_LINE_SIZE: usize = 64;

    #[test]
    fn indices_live_on_distinct_cache_lines() {
        assert_eq!(align_of::<PaddedIndex>(), CACHE_LINE_SIZE);
        assert_eq!(size_of::<PaddedIndex>(), CACHE_LINE_SIZE);
        let write = offset_of!(RingHeader, write);
        let read = offset_of!(RingHeader, read);
        assert_eq!(write % CACHE_LINE_SIZE, 0);
        assert_eq!(read % CACHE_LINE_SIZE, 0);
        assert!(read - write >= CACHE_LINE_SIZE);
    }

    #[test]
    fn slot_layout_matches_the_wire_contract() {
        assert_eq!(offset_of!(Slot, len), 0);
        assert_eq!(offset_of!(Slot, data), 4);
        assert_eq!(size_of::<Slot>(), 4 + MAX_MSG_SIZE);
    }

    #[test]
    fn segment_size_covers_header_and_slots() {
        assert_eq!(
            segment_size(8),
            size_of::<RingHeader>() + 8 * size_of::<Slot>()
        );
    }

    #[test]
    fn attach_rejects_segment_without_magic() {
        let name = "ordergate-test-ring-unmagic";
        // A zero-filled segment of the right size but with no header.
        let region = match ShmRegion::create(&segment_path(name), segment_size(4)) {
            Ok(region) => region,
            Err(err) => {
                eprintln!("skipping attach_rejects_segment_without_magic: {err}");
                return;
            }
        };

        match RingConsumer::attach(name, 4) {
            Err(IpcError::CorruptSegment { reason, .. }) => {
                assert!(reason.contains("signature"), "unexpected reason: {reason}");
            }
            Err(err) => panic!("expected CorruptSegment, got {err}"),
            Ok(_) => panic!("expected CorruptSegment, attach succeeded"),
        }

        drop(region);
        let _ = crate::ipc::shmem::unlink_segment(&segment_path(name));
    }
}
