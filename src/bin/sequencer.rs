//! Sequencer front half: drains the gateway's ring and logs decoded orders.
//!
//! Attaches as the single consumer of the shared-memory queue named in the
//! `Sequencer` config section. When the gateway is not up yet, or was just
//! replaced and the segment is stale, the attach is retried with a 1 s
//! backoff until it succeeds or the process is signalled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, warn};

use ordergate::ipc::message::{FieldId, IpcMessage, MsgType};
use ordergate::ipc::ring::{IpcError, RingConsumer, DEFAULT_CAPACITY, MAX_MSG_SIZE};
use ordergate::Config;

const CONFIG_ENV: &str = "ORDERGATE_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config.xml";

/// Backoff between attach attempts while the producer is not up.
const ATTACH_RETRY: Duration = Duration::from_secs(1);

/// Idle sleep when the ring is empty.
const IDLE_SLEEP: Duration = Duration::from_millis(1);

fn main() {
    ordergate::init_tracing();
    if let Err(err) = run() {
        error!("sequencer failed: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let config_path =
        std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::from_path(&config_path)?.sequencer;

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))
        .context("failed to register SIGINT handler")?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))
        .context("failed to register SIGTERM handler")?;

    while !shutdown.load(Ordering::Acquire) {
        let consumer = match RingConsumer::attach(&config.ipc.queue_name, DEFAULT_CAPACITY) {
            Ok(consumer) => consumer,
            // The producer is not up (or is mid-restart); try again shortly.
            Err(err @ (IpcError::NotFound { .. } | IpcError::StaleSession { .. })) => {
                info!(error = %err, "gateway ring not ready, retrying");
                std::thread::sleep(ATTACH_RETRY);
                continue;
            }
            Err(err) => return Err(err).context("ring attach failed"),
        };
        info!(
            queue = config.ipc.queue_name.as_str(),
            session = consumer.session_uuid(),
            "attached to gateway ring"
        );

        match drain(&consumer, &shutdown) {
            DrainStop::Signalled => break,
            // The gateway restarted under us: drop the stale attachment
            // (and its consumer lock) and attach to the new incarnation.
            DrainStop::Stale => {
                warn!("producer session replaced, re-attaching");
                continue;
            }
        }
    }

    info!("sequencer exiting");
    Ok(())
}

/// Why a drain loop ended.
enum DrainStop {
    Signalled,
    Stale,
}

/// How many idle sleeps pass between session revalidations (~1 s).
const IDLE_CHECKS_PER_SESSION_CHECK: u32 = 1000;

/// Polls the ring until the process is signalled or the session goes stale.
fn drain(consumer: &RingConsumer, shutdown: &AtomicBool) -> DrainStop {
    let mut buf = [0u8; MAX_MSG_SIZE];
    let mut idle = 0u32;
    while !shutdown.load(Ordering::Acquire) {
        let n = consumer.read(&mut buf);
        if n == 0 {
            idle += 1;
            if idle >= IDLE_CHECKS_PER_SESSION_CHECK {
                idle = 0;
                if consumer.check_session().is_err() {
                    return DrainStop::Stale;
                }
            }
            std::thread::sleep(IDLE_SLEEP);
            continue;
        }
        idle = 0;
        match IpcMessage::decode(&buf[..n]) {
            Ok(msg) => log_frame(&msg),
            Err(err) => warn!(error = %err, "undecodable frame, skipping"),
        }
    }
    DrainStop::Signalled
}

fn log_frame(msg: &IpcMessage) {
    match msg.msg_type() {
        Some(MsgType::NewOrder) => info!(
            symbol = msg.str_field(FieldId::Symbol).unwrap_or("?"),
            side = msg.u64_field(FieldId::Side).unwrap_or(u64::MAX),
            price = msg.i64_field(FieldId::Price).unwrap_or(0),
            qty = msg.u64_field(FieldId::Qty).unwrap_or(0),
            client_id = msg.u64_field(FieldId::ClientId).unwrap_or(0),
            order_id = msg.u64_field(FieldId::OrderId).unwrap_or(0),
            "new order"
        ),
        other => info!(
            msg_type = msg.msg_type_raw(),
            known = other.is_some(),
            fields = msg.field_count(),
            "frame received"
        ),
    }
}
