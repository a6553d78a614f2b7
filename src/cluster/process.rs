//! Worker processes backed by `tokio::process`.
//!
//! Workers are re-executions of the current binary with the same
//! arguments. Two environment variables mark them as workers:
//!
//! - `SHOAL_WORKER_ID`: fork sequence number
//! - `SHOAL_WORKERS`: cluster size, so worker-side restart triggers can be
//!   gated the same way the supervisor gates them
//!
//! Each child gets one writer task feeding its stdin and one reader task
//! draining its stdout. The reader turns IPC lines into [`Event`]s and, at
//! end of stream, reaps the child and reports [`Event::WorkerExited`].

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::BufReader;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::ipc::{Message, MessageReader, write_message};
use super::supervisor::{Event, ProcessControl};
use super::types::{ExitStatus, Pid};
use crate::constants::{ENV_WORKER_ID, ENV_WORKERS};
use crate::error::{Error, Result};

/// Spawns and talks to real worker processes.
#[derive(Debug)]
pub struct ChildProcesses {
    program: PathBuf,
    args: Vec<OsString>,
    workers: usize,
    next_id: u64,
    events: mpsc::UnboundedSender<Event>,
    channels: HashMap<Pid, mpsc::UnboundedSender<Message>>,
}

impl ChildProcesses {
    /// Workers run `program args...`.
    pub fn new(
        program: impl Into<PathBuf>,
        args: Vec<OsString>,
        workers: usize,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            workers,
            next_id: 0,
            events,
            channels: HashMap::new(),
        }
    }

    /// Workers re-run this executable with this process's arguments.
    pub fn from_current_exe(workers: usize, events: mpsc::UnboundedSender<Event>) -> Result<Self> {
        let program = std::env::current_exe()
            .map_err(|e| Error::io("resolving current executable", e))?;
        let args = std::env::args_os().skip(1).collect();
        Ok(Self::new(program, args, workers, events))
    }

    fn command(&self, worker_id: u64) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env(ENV_WORKER_ID, worker_id.to_string())
            .env(ENV_WORKERS, self.workers.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(false);
        cmd
    }
}

impl ProcessControl for ChildProcesses {
    fn fork(&mut self) -> Result<Pid> {
        let worker_id = self.next_id;
        self.next_id += 1;

        let mut child = self
            .command(worker_id)
            .spawn()
            .map_err(|source| Error::Spawn { source })?;
        let pid = child.id().ok_or_else(|| Error::Spawn {
            source: std::io::Error::other("worker exited before reporting a pid"),
        })?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(Error::Spawn {
                source: std::io::Error::other("worker stdio was not piped"),
            });
        };

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_to_worker(pid, stdin, rx));
        tokio::spawn(read_from_worker(pid, child, stdout, self.events.clone()));
        self.channels.insert(pid, tx);

        debug!(pid, worker_id, "Spawned worker process");
        Ok(pid)
    }

    fn send(&mut self, pid: Pid, message: &Message) -> Result<()> {
        if !is_alive(pid) {
            self.channels.remove(&pid);
            return Err(Error::NoSuchProcess { pid });
        }
        let channel = self
            .channels
            .get(&pid)
            .ok_or(Error::NoSuchProcess { pid })?;
        channel
            .send(message.clone())
            .map_err(|_| Error::NoSuchProcess { pid })
    }

    fn disconnect(&mut self, pid: Pid) -> Result<()> {
        // Dropping the sender lets the writer flush what is queued, then
        // closes the worker's stdin.
        self.channels
            .remove(&pid)
            .map(drop)
            .ok_or(Error::NoSuchProcess { pid })
    }

    fn forget(&mut self, pid: Pid) {
        self.channels.remove(&pid);
    }
}

async fn write_to_worker(
    pid: Pid,
    mut stdin: ChildStdin,
    mut messages: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = messages.recv().await {
        if let Err(e) = write_message(&mut stdin, &message).await {
            match Error::send(pid, e) {
                Error::NoSuchProcess { .. } => debug!(pid, "Worker pipe closed"),
                e => error!(pid, error = %e, "Failed to write to worker"),
            }
            return;
        }
    }
    debug!(pid, "IPC channel to worker closed");
}

async fn read_from_worker(
    pid: Pid,
    mut child: Child,
    stdout: ChildStdout,
    events: mpsc::UnboundedSender<Event>,
) {
    let mut reader = MessageReader::new(BufReader::new(stdout));
    loop {
        match reader.next().await {
            Ok(Some(message)) => {
                if events.send(Event::from_message(pid, message)).is_err() {
                    break;
                }
            },
            Ok(None) => break,
            Err(e) => {
                warn!(pid, error = %e, "Failed to read from worker");
                break;
            },
        }
    }

    let status = match child.wait().await {
        Ok(status) => ExitStatus::from(status),
        Err(e) => {
            error!(pid, error = %e, "Failed to reap worker");
            ExitStatus::Signaled
        },
    };
    let _ = events.send(Event::WorkerExited { pid, status });
}

/// Probe a pid with signal 0.
#[cfg(unix)]
fn is_alive(pid: Pid) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid as NixPid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    !matches!(kill(NixPid::from_raw(raw), None), Err(Errno::ESRCH))
}

#[cfg(not(unix))]
fn is_alive(_pid: Pid) -> bool {
    true
}
