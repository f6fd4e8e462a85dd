//! Low-latency order-entry gateway for a stock exchange.
//!
//! A front-end process terminates TCP sessions with trading clients, parses
//! inbound FIX, and forwards normalized order frames to the sequencer
//! process through a lock-free single-producer/single-consumer ring in POSIX
//! shared memory.
//!
//! # Pipeline
//!
//! ```text
//! socket bytes → TcpListener → BlockingQueue → FixDispatcher → RingProducer
//!                                                                   │
//!                      gateway process        ─ shared memory ─     │
//!                                                                   ▼
//!                      sequencer process                      RingConsumer
//! ```
//!
//! The listener and dispatcher each run on a dedicated thread owned by
//! [`gateway::Gateway`]; the ring crosses the process boundary with a
//! session-identity protocol that detects producer crashes
//! ([`ipc::ring::IpcError::StaleSession`]) and advisory file locks that
//! reject duplicate producers or consumers
//! ([`ipc::ring::IpcError::RoleConflict`]).

pub mod config;
pub mod dispatch;
pub mod fix;
pub mod gateway;
pub mod ipc;
pub mod net;
pub mod queue;

pub use config::{Config, ConfigError, GatewayConfig, SequencerConfig};
pub use gateway::{Gateway, GatewayError};

/// Initializes the tracing subscriber for a binary.
///
/// Honors `RUST_LOG`; defaults to `ordergate=info`. Call once at process
/// start (tests guard it with `Once`).
pub fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ordergate=info"));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_names(true)
                .with_timer(fmt::time::uptime()),
        )
        .with(filter)
        .init();
}
