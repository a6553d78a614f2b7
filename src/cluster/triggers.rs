//! Worker-side self-restart triggers.
//!
//! A worker may ask the supervisor to restart it when its resident memory
//! crosses a threshold or after a fixed uptime. Both only make sense with
//! more than one worker, because a lone worker can never be released by the
//! restart queue without dropping to zero capacity.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, warn};

use super::ipc::Message;
use super::memory::MemoryProbe;
use super::types::Pid;
use crate::config::Settings;
use crate::constants::MIB;

/// Which triggers a worker runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SelfRestart {
    /// Restart above this many bytes, checked every `interval`.
    pub memory: Option<MemoryLimit>,
    /// Restart after this much uptime.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLimit {
    pub threshold_bytes: u64,
    pub interval: Duration,
}

impl SelfRestart {
    /// Triggers enabled by `settings`, none for a single-worker cluster.
    pub fn from_settings(settings: &Settings) -> Self {
        if settings.workers <= 1 {
            return Self::default();
        }
        Self {
            memory: settings.restart_on_memory.map(|threshold_bytes| MemoryLimit {
                threshold_bytes,
                interval: settings.memory_check_interval,
            }),
            timeout: settings.restart_on_timeout,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.memory.is_some() || self.timeout.is_some()
    }

    /// Start the enabled triggers. Each sends [`Message::Restart`] on
    /// `outbound` when it fires. Abort the handles to stop them.
    pub fn spawn<P: MemoryProbe>(
        self,
        pid: Pid,
        probe: P,
        outbound: mpsc::UnboundedSender<Message>,
    ) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();
        if let Some(limit) = self.memory {
            tasks.push(tokio::spawn(watch_memory(pid, limit, probe, outbound.clone())));
        }
        if let Some(timeout) = self.timeout {
            tasks.push(tokio::spawn(restart_after(pid, timeout, outbound)));
        }
        tasks
    }
}

async fn watch_memory<P: MemoryProbe>(
    pid: Pid,
    limit: MemoryLimit,
    mut probe: P,
    outbound: mpsc::UnboundedSender<Message>,
) {
    let mut ticker = interval_at(Instant::now() + limit.interval, limit.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(rss) = probe.resident_bytes() else {
            debug!(pid, "Memory reading unavailable");
            continue;
        };
        debug!(pid, rss_mb = rss / MIB, "Memory check");
        if rss > limit.threshold_bytes {
            warn!(
                pid,
                "Cluster: worker {pid} used too much memory ({} MB), restarting...",
                rss / MIB
            );
            if outbound.send(Message::Restart { pid }).is_err() {
                return;
            }
        }
    }
}

async fn restart_after(pid: Pid, timeout: Duration, outbound: mpsc::UnboundedSender<Message>) {
    let mut ticker = interval_at(Instant::now() + timeout, timeout);
    loop {
        ticker.tick().await;
        warn!(pid, "Cluster: worker {pid} restarting by timer...");
        if outbound.send(Message::Restart { pid }).is_err() {
            return;
        }
    }
}
