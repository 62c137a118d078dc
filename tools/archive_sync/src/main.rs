//! Keeps the parameter caches warm and the snapshot archive current.
//!
//! Configuration comes from `SUBSPACE_*` variables (see
//! `ClientConfig::from_env`). `ARCHIVE_SYNC_ONCE=1` runs a single light and
//! full pass and exits; `ARCHIVE_SYNC_LOG_FORMAT=json` switches log output.

use std::process::ExitCode;
use std::thread;
use std::time::{Duration, Instant};

use subspace_client::{ClientConfig, Result, SubspaceClient};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt = tracing_subscriber::fmt().with_env_filter(filter);
    if std::env::var("ARCHIVE_SYNC_LOG_FORMAT").as_deref() == Ok("json") {
        fmt.json().init();
    } else {
        fmt.init();
    }
}

fn full_sync(client: &SubspaceClient) -> Result<()> {
    let snapshot = client.archive().snapshot(None, &[])?;
    let pruned = client.archive().prune(None, client.archive_retention())?;
    info!(block = snapshot.block, pruned, "full sync complete");
    Ok(())
}

fn run(client: &SubspaceClient, once: bool) -> Result<()> {
    let light_every = Duration::from_secs(client.config().archive.light_sync_interval_secs.max(1));
    let full_every = Duration::from_secs(client.config().archive.full_sync_interval_secs.max(1));
    let mut last_full: Option<Instant> = None;
    loop {
        if let Err(e) = client.state().light_sync(None) {
            warn!(error = %e, "light sync failed");
            if once {
                return Err(e);
            }
        }
        if last_full.map_or(true, |at| at.elapsed() >= full_every) {
            match full_sync(client) {
                Ok(()) => last_full = Some(Instant::now()),
                Err(e) if once => return Err(e),
                Err(e) => warn!(error = %e, "full sync failed"),
            }
        }
        if once {
            return Ok(());
        }
        thread::sleep(light_every);
    }
}

fn main() -> ExitCode {
    init_tracing();
    let once = std::env::var("ARCHIVE_SYNC_ONCE").is_ok_and(|v| v == "1" || v == "true");
    let client = match ClientConfig::from_env().and_then(SubspaceClient::new) {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "failed to start archive sync");
            return ExitCode::FAILURE;
        }
    };
    info!(
        network = %client.config().network,
        archive = %client.archive().dir().display(),
        once,
        "archive sync starting"
    );
    let outcome = run(&client, once);
    client.shutdown();
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "archive sync stopped");
            ExitCode::FAILURE
        }
    }
}
