//! Gateway process orchestration.
//!
//! Wires the pipeline (listener, ingress queue, dispatcher, IPC ring)
//! and hosts the two long-running loops on dedicated named threads.
//! Shutdown is cooperative: the stop flag halts the listener within one poll
//! timeout, the listener closes the ingress queue on its way out, and the
//! closed-and-drained queue terminates the dispatcher. `shutdown` joins in
//! that order.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, info};

use crate::config::GatewayConfig;
use crate::dispatch::FixDispatcher;
use crate::ipc::ring::{IpcError, RingProducer, DEFAULT_CAPACITY};
use crate::net::{RawPacket, TcpListener};
use crate::queue::{BlockingQueue, IngressQueue};

/// Structural startup failures. Each is fatal for the gateway process.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Listen port in use or privileged.
    #[error("failed to bind listen socket: {0}")]
    Bind(std::io::Error),

    /// Ring creation failed (role conflict, shared memory, side file).
    #[error(transparent)]
    Ipc(#[from] IpcError),
}

/// Handle to a running gateway.
///
/// Dropping the handle signals shutdown without waiting; use
/// [`Gateway::shutdown`] for a graceful join.
pub struct Gateway {
    stop: Arc<AtomicBool>,
    local_addr: SocketAddr,
    listener_handle: Option<JoinHandle<()>>,
    dispatcher_handle: Option<JoinHandle<()>>,
}

impl Gateway {
    /// Builds the pipeline and spawns the listener and dispatcher threads.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Bind`] when the listen socket cannot be set up;
    /// [`GatewayError::Ipc`] when the ring producer cannot be created
    /// (notably [`IpcError::RoleConflict`] when another gateway already
    /// serves this queue).
    ///
    /// # Panics
    ///
    /// Panics if OS thread spawning fails.
    pub fn spawn(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let queue = Arc::new(BlockingQueue::new(config.blocking_queue.size));
        let ingress: Arc<dyn IngressQueue<RawPacket>> = queue;

        let mut listener = TcpListener::bind(
            config.port,
            config.fix.backlog_size,
            config.fix.max_event_size,
            Arc::clone(&ingress),
        )
        .map_err(GatewayError::Bind)?;
        let local_addr = listener.local_addr();

        let ring = RingProducer::create(&config.ipc.queue_name, DEFAULT_CAPACITY)?;
        info!(
            queue = config.ipc.queue_name.as_str(),
            session = ring.session_uuid(),
            "ring producer created"
        );

        let stop = Arc::new(AtomicBool::new(false));

        debug!("spawning listener thread");
        let listener_stop = Arc::clone(&stop);
        let listener_handle = thread::Builder::new()
            .name("gw-listener".into())
            .spawn(move || listener.run(&listener_stop))
            .expect("failed to spawn listener thread");

        debug!("spawning dispatcher thread");
        let mut dispatcher = FixDispatcher::new(ingress, ring);
        let dispatcher_handle = thread::Builder::new()
            .name("gw-dispatcher".into())
            .spawn(move || dispatcher.run())
            .expect("failed to spawn dispatcher thread");

        info!(addr = %local_addr, "gateway running");

        Ok(Self {
            stop,
            local_addr,
            listener_handle: Some(listener_handle),
            dispatcher_handle: Some(dispatcher_handle),
        })
    }

    /// Initiates graceful shutdown and waits for both loops to exit.
    pub fn shutdown(mut self) {
        info!("gateway shutdown initiated");
        self.stop.store(true, Ordering::Release);

        // Listener first: it closes the ingress queue, which drains and
        // terminates the dispatcher.
        if let Some(handle) = self.listener_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.dispatcher_handle.take() {
            let _ = handle.join();
        }
        info!("gateway shutdown complete");
    }

    /// The flag the signal handler flips to stop the gateway.
    #[must_use]
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Bound listen address (useful when the configured port is 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BlockingQueueConfig, FixConfig, IpcConfig};

    fn test_config(queue_name: &str) -> GatewayConfig {
        GatewayConfig {
            port: 0,
            blocking_queue: BlockingQueueConfig { size: 64 },
            fix: FixConfig {
                max_event_size: 64,
                backlog_size: 16,
            },
            ipc: IpcConfig {
                queue_name: queue_name.to_string(),
            },
        }
    }

    #[test]
    fn spawn_and_shutdown_joins_cleanly() {
        let config = test_config("ordergate-test-gateway-lifecycle");
        let gateway = match Gateway::spawn(&config) {
            Ok(gw) => gw,
            Err(GatewayError::Ipc(err)) => {
                eprintln!("skipping gateway lifecycle test: {err}");
                return;
            }
            Err(err) => panic!("spawn failed: {err}"),
        };
        assert_ne!(gateway.local_addr().port(), 0);
        gateway.shutdown();
    }

    #[test]
    fn second_gateway_on_same_queue_is_a_role_conflict() {
        let config = test_config("ordergate-test-gateway-conflict");
        let first = match Gateway::spawn(&config) {
            Ok(gw) => gw,
            Err(GatewayError::Ipc(err)) => {
                eprintln!("skipping gateway conflict test: {err}");
                return;
            }
            Err(err) => panic!("spawn failed: {err}"),
        };
        let second = Gateway::spawn(&config);
        assert!(matches!(
            second,
            Err(GatewayError::Ipc(IpcError::RoleConflict { .. }))
        ));
        first.shutdown();
    }
}
