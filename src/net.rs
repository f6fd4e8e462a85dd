//! TCP ingress: accept trading clients, read their bytes, feed the ingress
//! queue.
//!
//! The listener owns the listening socket and a mio [`Poll`] (epoll on
//! Linux). The listening socket is built through rustix so the backlog from
//! configuration is honored, then handed to mio for readiness notification.
//! Accepted clients are non-blocking and registered read-ready; mio reports
//! edge-triggered on Linux, so both the accept path and the read path drain
//! until `WouldBlock`; a single read per event would stall a bursty
//! connection.
//!
//! Each read chunk becomes one [`RawPacket`] pushed into the ingress queue.
//! The push blocks when the queue is full: backpressure from the dispatcher
//! propagates here and no packet is dropped between socket and parser.

use std::collections::HashMap;
use std::io::{self, Read};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::net::{TcpListener as MioTcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use rustix::net::{bind_v4, listen, socket, sockopt, AddressFamily, SocketType};
use tracing::{debug, info, warn};

use crate::queue::IngressQueue;

/// Raw bytes read from one client socket in one `read` call.
///
/// Immutable after push; the dispatcher owns it after pop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    /// The client's socket fd, used as the session key downstream.
    pub client_id: i32,
    pub bytes: Vec<u8>,
}

/// Scratch buffer for client reads; one packet is at most this large.
const READ_BUF_SIZE: usize = 4096;

/// Bounded poll wait so the stop flag is observed within this interval.
const POLL_TIMEOUT: Duration = Duration::from_millis(1000);

/// The listening socket's token; client tokens carry the fd itself, which
/// can never collide with this sentinel.
const LISTENER: Token = Token(usize::MAX);

/// What a fully drained read told us about the connection.
enum ReadOutcome {
    KeepOpen,
    Closed,
}

/// Event-driven TCP listener feeding the ingress queue.
pub struct TcpListener {
    listener: MioTcpListener,
    poll: Poll,
    max_events: usize,
    local_addr: SocketAddr,
    queue: Arc<dyn IngressQueue<RawPacket>>,
}

impl TcpListener {
    /// Binds `0.0.0.0:port` with `SO_REUSEADDR` and the configured backlog.
    ///
    /// # Errors
    ///
    /// Any socket/bind/listen failure; the caller treats this as fatal
    /// (the port is in use or privileged).
    pub fn bind(
        port: u16,
        backlog: u32,
        max_events: usize,
        queue: Arc<dyn IngressQueue<RawPacket>>,
    ) -> io::Result<Self> {
        let fd = socket(AddressFamily::INET, SocketType::STREAM, None)?;
        // Without SO_REUSEADDR a restart during TIME_WAIT would fail to bind.
        sockopt::set_socket_reuseaddr(&fd, true)?;
        bind_v4(&fd, &SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))?;
        listen(&fd, backlog as i32)?;
        rustix::io::ioctl_fionbio(&fd, true)?;

        let std_listener = std::net::TcpListener::from(fd);
        let local_addr = std_listener.local_addr()?;
        let mut listener = MioTcpListener::from_std(std_listener);

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        Ok(Self {
            listener,
            poll,
            max_events,
            local_addr,
            queue,
        })
    }

    /// The bound address (useful when the configured port is 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Runs the accept/read loop until `stop` is observed.
    ///
    /// On exit every client socket is closed and the ingress queue is
    /// closed, which signals the dispatcher to drain and terminate.
    pub fn run(&mut self, stop: &AtomicBool) {
        let mut events = Events::with_capacity(self.max_events);
        let mut conns: HashMap<Token, TcpStream> = HashMap::new();
        let mut scratch = [0u8; READ_BUF_SIZE];

        info!(addr = %self.local_addr, "listener accepting connections");

        while !stop.load(Ordering::Acquire) {
            if let Err(err) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!(error = %err, "poll failed, listener exiting");
                break;
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_clients(&mut conns),
                    token => {
                        let Some(stream) = conns.get_mut(&token) else {
                            continue;
                        };
                        let outcome = drain_client(stream, &mut scratch, self.queue.as_ref());
                        if matches!(outcome, ReadOutcome::Closed) {
                            let mut stream = conns.remove(&token).expect("connection present");
                            let _ = self.poll.registry().deregister(&mut stream);
                            debug!(fd = stream.as_raw_fd(), "client disconnected");
                            // Dropping the stream closes the fd.
                        }
                    }
                }
            }
        }

        for (_, mut stream) in conns.drain() {
            let _ = self.poll.registry().deregister(&mut stream);
        }
        self.queue.close();
        info!("listener stopped, ingress queue closed");
    }

    /// Accepts until the backlog is drained.
    fn accept_clients(&mut self, conns: &mut HashMap<Token, TcpStream>) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    let token = Token(stream.as_raw_fd() as usize);
                    if let Err(err) =
                        self.poll
                            .registry()
                            .register(&mut stream, token, Interest::READABLE)
                    {
                        warn!(%peer, error = %err, "failed to register client, dropping");
                        continue;
                    }
                    debug!(%peer, fd = stream.as_raw_fd(), "client connected");
                    conns.insert(token, stream);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    // Transient accept failures are non-fatal.
                    warn!(error = %err, "accept failed");
                    break;
                }
            }
        }
    }
}

/// Reads until `WouldBlock`, pushing one packet per chunk.
fn drain_client(
    stream: &mut TcpStream,
    scratch: &mut [u8; READ_BUF_SIZE],
    queue: &dyn IngressQueue<RawPacket>,
) -> ReadOutcome {
    let client_id = stream.as_raw_fd();
    loop {
        match stream.read(scratch) {
            Ok(0) => return ReadOutcome::Closed,
            Ok(n) => {
                let packet = RawPacket {
                    client_id,
                    bytes: scratch[..n].to_vec(),
                };
                // Blocking push: dispatcher backpressure stalls this thread
                // rather than dropping bytes. A closed queue means shutdown
                // is in progress; stop reading.
                if queue.push(packet).is_err() {
                    return ReadOutcome::Closed;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return ReadOutcome::KeepOpen,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                warn!(fd = client_id, error = %err, "read failed, closing connection");
                return ReadOutcome::Closed;
            }
        }
    }
}
