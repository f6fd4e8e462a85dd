//! Cross-process IPC between the gateway and the sequencer.
//!
//! - [`shmem`]: runtime-sized POSIX shared memory mappings
//! - [`lock`]: advisory file locks enforcing one producer / one consumer
//! - [`ring`]: the lock-free SPSC ring with session identity
//! - [`message`]: the framed field codec carried inside ring slots

pub mod lock;
pub mod message;
pub mod ring;
pub mod shmem;
