//! Gateway daemon: FIX order entry over TCP, fan-out to the sequencer ring.
//!
//! # Usage
//!
//! ```sh
//! gateway [PORT]
//! ```
//!
//! Configuration is read from `config.xml` (override the path with the
//! `ORDERGATE_CONFIG` environment variable); the optional positional
//! argument overrides the configured listen port.
//!
//! # Signals
//!
//! `SIGINT` / `SIGTERM` start a graceful shutdown. A safety-net timer forces
//! the process out if the shutdown wedges.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, warn};

use ordergate::{Config, Gateway};

const CONFIG_ENV: &str = "ORDERGATE_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config.xml";

/// Hard process-exit deadline once shutdown starts.
const FORCE_EXIT_AFTER: Duration = Duration::from_secs(3);

fn main() {
    ordergate::init_tracing();
    if let Err(err) = run() {
        error!("gateway failed: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let config_path =
        std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let mut config = Config::from_path(&config_path)?.gateway;

    if let Some(port) = std::env::args().nth(1) {
        config.port = port
            .parse()
            .with_context(|| format!("invalid port argument `{port}`"))?;
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))
        .context("failed to register SIGINT handler")?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))
        .context("failed to register SIGTERM handler")?;

    let gateway = Gateway::spawn(&config).context("gateway startup failed")?;
    info!(addr = %gateway.local_addr(), "gateway is running (Ctrl+C to shut down)");

    while !shutdown.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(100));
    }
    info!("shutdown signal received");

    // Safety net: if the graceful path hangs, the timer wins and the
    // process still exits.
    std::thread::Builder::new()
        .name("force-exit".into())
        .spawn(|| {
            std::thread::sleep(FORCE_EXIT_AFTER);
            warn!("graceful shutdown timed out, forcing exit");
            std::process::exit(0);
        })
        .context("failed to spawn force-exit thread")?;

    gateway.shutdown();
    Ok(())
}
