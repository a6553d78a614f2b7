//! Worker and cluster bookkeeping types.

use std::fmt;

/// OS process id of a worker.
pub type Pid = u32;

/// Lifecycle of a single worker, as seen by the supervisor.
///
/// States only move forward. A crash may jump straight to `Exited` from
/// any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LifecycleState {
    /// Spawned, not yet serving.
    Forking,
    /// Bound and accepting connections.
    Listening,
    /// Waiting in the restart queue.
    RestartRequested,
    /// Told to drain and exit.
    Disconnecting,
    /// Process is gone.
    Exited,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Forking => "forking",
            Self::Listening => "listening",
            Self::RestartRequested => "restart_requested",
            Self::Disconnecting => "disconnecting",
            Self::Exited => "exited",
        };
        f.write_str(name)
    }
}

/// A worker tracked by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worker {
    pid: Pid,
    /// Fork order, used to enqueue workers oldest first.
    seq: u64,
    state: LifecycleState,
    listening: bool,
}

impl Worker {
    pub(crate) fn new(pid: Pid, seq: u64) -> Self {
        Self {
            pid,
            seq,
            state: LifecycleState::Forking,
            listening: false,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Whether this worker currently counts toward served capacity.
    pub fn is_listening(&self) -> bool {
        self.listening
    }

    /// Whether the supervisor has already told this worker to go away.
    pub fn is_disconnecting(&self) -> bool {
        self.state >= LifecycleState::Disconnecting
    }

    /// Advance the lifecycle. Backward moves are ignored.
    pub(crate) fn advance(&mut self, next: LifecycleState) {
        if next > self.state {
            self.state = next;
        }
    }

    pub(crate) fn set_listening(&mut self, listening: bool) {
        self.listening = listening;
    }
}

/// Snapshot of the cluster counters.
///
/// Outside of transient fork/exit windows,
/// `listening <= current <= desired` holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterState {
    pub desired_workers: usize,
    pub current_workers: usize,
    pub listening_workers: usize,
    pub shutdown_requested: bool,
}

impl ClusterState {
    /// True when every desired worker is serving.
    pub fn at_full_capacity(&self) -> bool {
        self.listening_workers == self.desired_workers
    }
}

/// Named states of the supervisor state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Serving at (or converging to) full capacity, nothing queued.
    Running,
    /// A rolling restart is queued or in progress.
    RestartPending,
    /// Shutdown requested, waiting for workers to exit.
    Draining,
    /// Every worker exited after a shutdown request.
    ShutDown,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Running => "running",
            Self::RestartPending => "restart_pending",
            Self::Draining => "draining",
            Self::ShutDown => "shut_down",
        };
        f.write_str(name)
    }
}

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Exited with a code.
    Code(i32),
    /// Killed by a signal (or the code is otherwise unknown).
    Signaled,
}

impl ExitStatus {
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Code(0))
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        status.code().map_or(Self::Signaled, Self::Code)
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Code(code) => write!(f, "code: {code}"),
            Self::Signaled => f.write_str("signal"),
        }
    }
}
