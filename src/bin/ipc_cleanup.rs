//! Explicit cleanup for leaked IPC queues.
//!
//! A clean gateway shutdown intentionally leaves the shared-memory segment
//! in place so a consumer can finish draining. If the gateway is retired
//! without a successor, the segment and its session side file leak; this
//! tool reclaims them.
//!
//! ```sh
//! ipc-cleanup <queue-name> [<queue-name> ...]
//! ```
//!
//! Lock files are left alone: they are empty, inert, and another process
//! may be racing to open them.

use anyhow::Context;
use tracing::{error, info};

use ordergate::ipc::lock::uuid_path;
use ordergate::ipc::shmem::unlink_segment;

fn main() {
    ordergate::init_tracing();
    if let Err(err) = run() {
        error!("cleanup failed: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let names: Vec<String> = std::env::args().skip(1).collect();
    if names.is_empty() {
        print_usage();
        anyhow::bail!("no queue names given");
    }

    for name in &names {
        unlink_segment(&format!("/{name}"))
            .with_context(|| format!("failed to unlink segment for `{name}`"))?;

        let uuid_file = uuid_path(name);
        match std::fs::remove_file(&uuid_file) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to remove `{}`", uuid_file.display())
                });
            }
        }

        info!(queue = name.as_str(), "queue cleaned up");
    }
    Ok(())
}

fn print_usage() {
    eprintln!(
        r#"ipc-cleanup - reclaim leaked ordergate IPC queues

USAGE:
    ipc-cleanup <queue-name> [<queue-name> ...]

Removes the POSIX shared memory object /<queue-name> and the session file
/tmp/<queue-name>.uuid. Run only when neither the gateway nor the sequencer
is attached to the queue.
"#
    );
}
