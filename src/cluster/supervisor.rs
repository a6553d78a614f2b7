//! The supervisor state machine.
//!
//! [`ClusterSupervisor`] owns every piece of cluster state: the worker
//! table, the counters and the [`RestartQueue`]. It is driven by typed
//! [`Event`]s and talks to the OS only through [`ProcessControl`], so the
//! whole fork/restart/shutdown protocol runs the same against real child
//! processes and against an in-memory recorder.
//!
//! # Rolling restart
//!
//! ```text
//! restart signal / worker restart request
//!         │
//!         ▼
//!   RestartQueue ──(listening == desired)──► disconnect one worker
//!         ▲                                        │
//!         │                                        ▼
//!   replacement listening ◄── fork ◄──────── worker exited
//! ```
//!
//! The queue only releases while every desired worker is listening, and the
//! released worker stops counting as listening immediately, so served
//! capacity never drops below `desired - 1` because of a restart.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use super::ipc::Message;
use super::queue::RestartQueue;
use super::signals::{RestartSignal, SignalEvent};
use super::types::{ClusterState, ExitStatus, LifecycleState, Pid, SupervisorState, Worker};
use crate::config::Settings;
use crate::error::{Error, Result};

/// OS-facing operations the supervisor needs.
pub trait ProcessControl {
    /// Spawn a new worker process and return its pid.
    fn fork(&mut self) -> Result<Pid>;

    /// Deliver an IPC message to a worker.
    ///
    /// Must return [`Error::NoSuchProcess`] when the worker is already gone.
    fn send(&mut self, pid: Pid, message: &Message) -> Result<()>;

    /// Close the IPC channel to a worker.
    fn disconnect(&mut self, pid: Pid) -> Result<()>;

    /// Release any per-worker resources after the worker exited.
    fn forget(&mut self, _pid: Pid) {}
}

/// Input to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Signal(SignalEvent),
    WorkerListening { pid: Pid },
    WorkerMessage { pid: Pid, message: Message },
    WorkerExited { pid: Pid, status: ExitStatus },
}

impl Event {
    /// Wrap a message read from a worker's IPC channel.
    pub fn from_message(pid: Pid, message: Message) -> Self {
        match message {
            Message::Listening { .. } => Self::WorkerListening { pid },
            message => Self::WorkerMessage { pid, message },
        }
    }
}

/// What the driving loop should do after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    /// Exit the supervisor process with this code.
    Exit(i32),
    /// Raise this signal on the supervisor itself (development watchers).
    ReRaise(RestartSignal),
}

/// Static supervisor options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorConfig {
    pub workers: usize,
    pub nodemon_compat: bool,
}

impl From<&Settings> for SupervisorConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            workers: settings.workers,
            nodemon_compat: settings.nodemon_compat,
        }
    }
}

/// Master-role orchestrator.
#[derive(Debug)]
pub struct ClusterSupervisor<C> {
    config: SupervisorConfig,
    control: C,
    workers: HashMap<Pid, Worker>,
    queue: RestartQueue,
    next_seq: u64,
    shutdown_requested: bool,
}

impl<C: ProcessControl> ClusterSupervisor<C> {
    pub fn new(config: SupervisorConfig, control: C) -> Self {
        Self {
            config,
            control,
            workers: HashMap::with_capacity(config.workers),
            queue: RestartQueue::new(),
            next_seq: 0,
            shutdown_requested: false,
        }
    }

    /// Fork the initial set of workers.
    pub fn start(&mut self) -> Result<()> {
        info!(workers = self.config.workers, "Starting cluster");
        for _ in 0..self.config.workers {
            self.fork_worker()?;
        }
        Ok(())
    }

    /// Apply one event.
    ///
    /// # Errors
    ///
    /// Fork failures and send failures other than "no such process" are
    /// returned; the supervisor should treat them as fatal.
    pub fn handle(&mut self, event: Event) -> Result<Step> {
        match event {
            Event::Signal(SignalEvent::Restart) => self.on_restart_signal(),
            Event::Signal(SignalEvent::Interrupt) => self.on_interrupt(),
            Event::Signal(SignalEvent::DevShutdown) => self.on_dev_shutdown(),
            Event::WorkerListening { pid } => self.on_listening(pid),
            Event::WorkerMessage { pid, message } => self.on_message(pid, message),
            Event::WorkerExited { pid, status } => self.on_exit(pid, status),
        }
    }

    /// Current counters.
    pub fn cluster_state(&self) -> ClusterState {
        ClusterState {
            desired_workers: self.config.workers,
            current_workers: self.workers.len(),
            listening_workers: self.workers.values().filter(|w| w.is_listening()).count(),
            shutdown_requested: self.shutdown_requested,
        }
    }

    /// Named state of the machine.
    pub fn state(&self) -> SupervisorState {
        if self.shutdown_requested {
            if self.workers.is_empty() {
                SupervisorState::ShutDown
            } else {
                SupervisorState::Draining
            }
        } else if !self.queue.is_empty() || self.workers.values().any(Worker::is_disconnecting) {
            SupervisorState::RestartPending
        } else {
            SupervisorState::Running
        }
    }

    pub fn worker(&self, pid: Pid) -> Option<&Worker> {
        self.workers.get(&pid)
    }

    /// Live workers in fork order.
    pub fn workers(&self) -> Vec<&Worker> {
        let mut workers: Vec<&Worker> = self.workers.values().collect();
        workers.sort_by_key(|w| w.seq());
        workers
    }

    pub fn queue(&self) -> &RestartQueue {
        &self.queue
    }

    pub fn control(&self) -> &C {
        &self.control
    }

    pub fn control_mut(&mut self) -> &mut C {
        &mut self.control
    }

    // =========================================================================
    // Event handlers
    // =========================================================================

    fn on_restart_signal(&mut self) -> Result<Step> {
        warn!("MASTER: restart signal received");

        if self.shutdown_requested {
            debug!("Shutdown in progress, ignoring restart signal");
            return Ok(Step::Continue);
        }

        let pids: Vec<Pid> = self
            .workers()
            .into_iter()
            .filter(|w| !w.is_disconnecting())
            .map(Worker::pid)
            .collect();
        for pid in pids {
            self.enqueue(pid);
        }

        self.release_next()?;
        Ok(Step::Continue)
    }

    fn on_interrupt(&mut self) -> Result<Step> {
        warn!("MASTER: SIGINT signal received");
        self.shutdown_requested = true;

        let pids: Vec<Pid> = self
            .workers()
            .into_iter()
            .filter(|w| !w.is_disconnecting())
            .map(Worker::pid)
            .collect();
        for pid in pids {
            self.disconnect_worker(pid)?;
        }

        Ok(self.finish_if_drained())
    }

    fn on_dev_shutdown(&mut self) -> Result<Step> {
        // Workers receive the same signal from the watcher and exit themselves.
        warn!("MASTER: SIGUSR2 signal received");
        self.shutdown_requested = true;
        Ok(self.finish_if_drained())
    }

    fn on_listening(&mut self, pid: Pid) -> Result<Step> {
        let Some(worker) = self.workers.get_mut(&pid) else {
            debug!(pid, "Listening event from unknown worker");
            return Ok(Step::Continue);
        };
        if worker.is_listening() || worker.is_disconnecting() {
            return Ok(Step::Continue);
        }

        worker.set_listening(true);
        worker.advance(LifecycleState::Listening);
        info!(pid, "Cluster: worker listening");

        // New worker online, maybe all online: try to restart the next one.
        self.release_next()?;
        Ok(Step::Continue)
    }

    fn on_message(&mut self, from: Pid, message: Message) -> Result<Step> {
        match message {
            Message::Restart { pid } => {
                if pid != from {
                    debug!(from, pid, "Worker requested restart on behalf of another pid");
                }
                if self.shutdown_requested {
                    debug!(pid, "Shutdown in progress, ignoring restart request");
                    return Ok(Step::Continue);
                }
                if self.enqueue(pid) {
                    info!(pid, queued = self.queue.len(), "Worker queued for restart");
                }
                self.release_next()?;
            },
            Message::Listening { .. } => return self.on_listening(from),
            Message::Disconnect => debug!(from, "Ignoring disconnect sent by a worker"),
        }
        Ok(Step::Continue)
    }

    fn on_exit(&mut self, pid: Pid, status: ExitStatus) -> Result<Step> {
        let Some(mut worker) = self.workers.remove(&pid) else {
            debug!(pid, "Exit event from unknown worker");
            return Ok(Step::Continue);
        };
        worker.advance(LifecycleState::Exited);
        self.queue.remove(pid);
        self.control.forget(pid);

        if self.shutdown_requested {
            warn!(pid, "Cluster: worker {pid} died ({status})");
            return Ok(self.finish_if_drained());
        }

        warn!(pid, "Cluster: worker {pid} died ({status}) restarting...");
        self.fork_worker()?;
        Ok(Step::Continue)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn fork_worker(&mut self) -> Result<Pid> {
        let pid = self.control.fork()?;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.workers.insert(pid, Worker::new(pid, seq));
        warn!(
            pid,
            "Cluster: worker #{} started | PID {pid}.",
            self.workers.len()
        );
        Ok(pid)
    }

    /// Queue a live, non-disconnecting worker. Returns true if newly queued.
    fn enqueue(&mut self, pid: Pid) -> bool {
        let Some(worker) = self.workers.get_mut(&pid) else {
            debug!(pid, "Restart requested for unknown worker");
            return false;
        };
        if worker.is_disconnecting() || !self.queue.push(pid) {
            return false;
        }
        worker.advance(LifecycleState::RestartRequested);
        true
    }

    /// Release at most one queued worker, if the cluster is at full capacity.
    fn release_next(&mut self) -> Result<()> {
        while let Some(pid) = self.queue.release(&self.cluster_state()) {
            match self.workers.get(&pid) {
                Some(worker) if !worker.is_disconnecting() => {
                    self.disconnect_worker(pid)?;
                    warn!(pid, "Disconnecting worker!");
                    return Ok(());
                },
                // Already gone or going: capacity is unchanged, try the next.
                _ => debug!(pid, "Skipping stale restart entry"),
            }
        }
        Ok(())
    }

    /// Order a worker to drain and close its IPC channel.
    fn disconnect_worker(&mut self, pid: Pid) -> Result<()> {
        if let Some(worker) = self.workers.get_mut(&pid) {
            worker.set_listening(false);
            worker.advance(LifecycleState::Disconnecting);
        }
        self.queue.remove(pid);

        let sent = self.control.send(pid, &Message::Disconnect);
        ignore_gone(sent)?;
        let closed = self.control.disconnect(pid);
        ignore_gone(closed)
    }

    fn finish_if_drained(&mut self) -> Step {
        if !self.shutdown_requested || !self.workers.is_empty() {
            return Step::Continue;
        }
        warn!("All workers are offline, leaving...");
        if self.config.nodemon_compat {
            Step::ReRaise(RestartSignal::Usr2)
        } else {
            Step::Exit(0)
        }
    }
}

/// Swallow the "no such process" race, propagate everything else.
fn ignore_gone(result: Result<()>) -> Result<()> {
    match result {
        Err(Error::NoSuchProcess { pid }) => {
            debug!(pid, "Worker already gone");
            Ok(())
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::testing::RecordingControl;

    fn supervisor(workers: usize) -> ClusterSupervisor<RecordingControl> {
        let mut sup = ClusterSupervisor::new(
            SupervisorConfig {
                workers,
                nodemon_compat: false,
            },
            RecordingControl::new(),
        );
        sup.start().unwrap();
        sup
    }

    fn all_listening(sup: &mut ClusterSupervisor<RecordingControl>) {
        let pids: Vec<Pid> = sup.workers().iter().map(|w| w.pid()).collect();
        for pid in pids {
            sup.handle(Event::WorkerListening { pid }).unwrap();
        }
    }

    #[test]
    fn test_start_forks_workers() {
        let sup = supervisor(3);
        assert_eq!(sup.control().forked().len(), 3);
        let state = sup.cluster_state();
        assert_eq!(state.current_workers, 3);
        assert_eq!(state.listening_workers, 0);
        assert_eq!(sup.state(), SupervisorState::Running);
    }

    #[test]
    fn test_listening_counts_once() {
        let mut sup = supervisor(2);
        let pid = sup.workers()[0].pid();
        sup.handle(Event::WorkerListening { pid }).unwrap();
        sup.handle(Event::WorkerListening { pid }).unwrap();
        assert_eq!(sup.cluster_state().listening_workers, 1);
        assert_eq!(sup.worker(pid).unwrap().state(), LifecycleState::Listening);
    }

    #[test]
    fn test_restart_waits_for_full_capacity() {
        let mut sup = supervisor(2);
        sup.handle(Event::Signal(SignalEvent::Restart)).unwrap();

        assert_eq!(sup.queue().len(), 2);
        assert!(sup.control().disconnects().is_empty());
        assert_eq!(sup.state(), SupervisorState::RestartPending);

        all_listening(&mut sup);
        assert_eq!(sup.control().disconnects().len(), 1);
        assert_eq!(sup.queue().len(), 1);
    }

    #[test]
    fn test_worker_restart_request_is_deduplicated() {
        let mut sup = supervisor(2);
        let pid = sup.workers()[0].pid();
        let request = Event::WorkerMessage {
            pid,
            message: Message::Restart { pid },
        };
        sup.handle(request.clone()).unwrap();
        sup.handle(request).unwrap();
        assert_eq!(sup.queue().len(), 1);
        assert_eq!(
            sup.worker(pid).unwrap().state(),
            LifecycleState::RestartRequested
        );
    }

    #[test]
    fn test_crash_forks_replacement() {
        let mut sup = supervisor(2);
        all_listening(&mut sup);
        let pid = sup.workers()[0].pid();

        let step = sup
            .handle(Event::WorkerExited {
                pid,
                status: ExitStatus::Code(1),
            })
            .unwrap();

        assert_eq!(step, Step::Continue);
        assert_eq!(sup.control().forked().len(), 3);
        assert_eq!(sup.cluster_state().current_workers, 2);
        assert!(sup.worker(pid).is_none());
    }

    #[test]
    fn test_exit_removes_queued_pid() {
        let mut sup = supervisor(2);
        sup.handle(Event::Signal(SignalEvent::Restart)).unwrap();
        let pid = sup.workers()[1].pid();

        sup.handle(Event::WorkerExited {
            pid,
            status: ExitStatus::Signaled,
        })
        .unwrap();

        assert!(!sup.queue().contains(pid));
    }

    #[test]
    fn test_interrupt_disconnects_everyone_and_exits() {
        let mut sup = supervisor(2);
        all_listening(&mut sup);

        let step = sup.handle(Event::Signal(SignalEvent::Interrupt)).unwrap();
        assert_eq!(step, Step::Continue);
        assert_eq!(sup.control().disconnects().len(), 2);
        assert_eq!(sup.state(), SupervisorState::Draining);

        let pids: Vec<Pid> = sup.workers().iter().map(|w| w.pid()).collect();
        let mut last = Step::Continue;
        for pid in pids {
            last = sup
                .handle(Event::WorkerExited {
                    pid,
                    status: ExitStatus::Code(0),
                })
                .unwrap();
        }

        assert_eq!(last, Step::Exit(0));
        assert_eq!(sup.control().forked().len(), 2);
        assert_eq!(sup.state(), SupervisorState::ShutDown);
    }

    #[test]
    fn test_second_interrupt_does_not_resend() {
        let mut sup = supervisor(2);
        sup.handle(Event::Signal(SignalEvent::Interrupt)).unwrap();
        sup.handle(Event::Signal(SignalEvent::Interrupt)).unwrap();
        assert_eq!(sup.control().disconnects().len(), 2);
    }

    #[test]
    fn test_interrupt_with_no_workers_exits_immediately() {
        let mut sup = supervisor(0);
        let step = sup.handle(Event::Signal(SignalEvent::Interrupt)).unwrap();
        assert_eq!(step, Step::Exit(0));
    }

    #[test]
    fn test_nodemon_compat_reraises() {
        let mut sup = ClusterSupervisor::new(
            SupervisorConfig {
                workers: 1,
                nodemon_compat: true,
            },
            RecordingControl::new(),
        );
        sup.start().unwrap();

        sup.handle(Event::Signal(SignalEvent::DevShutdown)).unwrap();
        // Dev shutdown leaves workers to the external watcher.
        assert!(sup.control().disconnects().is_empty());

        let pid = sup.workers()[0].pid();
        let step = sup
            .handle(Event::WorkerExited {
                pid,
                status: ExitStatus::Code(0),
            })
            .unwrap();
        assert_eq!(step, Step::ReRaise(RestartSignal::Usr2));
    }

    #[test]
    fn test_disconnect_to_dead_worker_is_ignored() {
        let mut sup = supervisor(2);
        all_listening(&mut sup);
        let pid = sup.workers()[0].pid();
        sup.control_mut().kill(pid);

        let step = sup.handle(Event::Signal(SignalEvent::Interrupt)).unwrap();
        assert_eq!(step, Step::Continue);
    }

    #[test]
    fn test_other_send_errors_propagate() {
        let mut sup = supervisor(2);
        all_listening(&mut sup);
        sup.control_mut()
            .fail_sends_with(std::io::ErrorKind::PermissionDenied);

        let err = sup
            .handle(Event::Signal(SignalEvent::Interrupt))
            .unwrap_err();
        assert!(matches!(err, Error::Send { .. }));
    }

    #[test]
    fn test_fork_failure_propagates() {
        let mut sup = supervisor(1);
        all_listening(&mut sup);
        sup.control_mut().fail_forks();
        let pid = sup.workers()[0].pid();

        let result = sup.handle(Event::WorkerExited {
            pid,
            status: ExitStatus::Code(1),
        });
        assert!(matches!(result, Err(Error::Spawn { .. })));
    }
}
