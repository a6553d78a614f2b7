//! Run the cluster.
//!
//! The same command line starts both roles:
//! - `shoal` - supervisor: forks `--workers` copies of itself
//! - `shoal` with `SHOAL_WORKER_ID` set - worker: serves on the shared port
//!
//! Workers are spawned with the supervisor's own arguments, so flags given to
//! the supervisor (`--port`, `--config`, ...) reach every worker unchanged.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::cluster::{self, Role};
use crate::config::ClusterConfig;
use crate::constants::ENV_WORKERS;
use crate::server::HelloDispatcher;

/// Command-line overrides for the `[cluster]` config table.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub workers: Option<usize>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub config: Option<PathBuf>,
    /// Artificial latency for the demo application.
    pub delay: Option<Duration>,
}

impl RunOptions {
    fn apply(&self, config: &mut ClusterConfig) {
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(host) = &self.host {
            config.host = Some(host.clone());
        }
        if let Some(port) = self.port {
            config.port = Some(port);
        }
    }
}

/// Run this process in its cluster role. Returns the exit code.
pub async fn execute(options: RunOptions) -> Result<i32> {
    let role = cluster::current_role();

    let mut config = match &options.config {
        Some(path) => ClusterConfig::load_from(path)?,
        None => ClusterConfig::load()?,
    };
    options.apply(&mut config);

    // Workers must agree with the supervisor's resolved count, which may
    // have come from CPU auto-detection.
    if role == Role::Worker
        && let Some(workers) = inherited_workers()
    {
        config.workers = workers;
    }

    let (settings, validation) = config.resolve().context("Invalid cluster configuration")?;

    if role == Role::Supervisor {
        validation.log();
        if !settings.profile.is_production() {
            warn!(
                "Running in development profile: restart signals are not handled \
                 (set SHOAL_ENV=production for graceful restarts)"
            );
        }
        info!(
            workers = settings.workers,
            addr = %settings.addr,
            signal = %settings.signal,
            "Starting supervisor"
        );
    }

    let delay = options.delay;
    let code = cluster::start(
        settings,
        move || match delay {
            Some(delay) => HelloDispatcher::with_delay(delay),
            None => HelloDispatcher::new(),
        },
        None,
    )
    .await?;

    Ok(code)
}

fn inherited_workers() -> Option<usize> {
    std::env::var(ENV_WORKERS).ok()?.parse().ok()
}
