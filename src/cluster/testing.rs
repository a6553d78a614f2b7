//! In-memory [`ProcessControl`] for driving a supervisor without children.

use std::collections::HashSet;
use std::io;

use super::ipc::Message;
use super::supervisor::ProcessControl;
use super::types::Pid;
use crate::error::{Error, Result};

/// Records every call and hands out sequential fake pids.
#[derive(Debug)]
pub struct RecordingControl {
    next_pid: Pid,
    forked: Vec<Pid>,
    sent: Vec<(Pid, Message)>,
    disconnected: Vec<Pid>,
    forgotten: Vec<Pid>,
    dead: HashSet<Pid>,
    send_failure: Option<io::ErrorKind>,
    fork_failure: bool,
}

impl Default for RecordingControl {
    fn default() -> Self {
        Self {
            next_pid: 1000,
            forked: Vec::new(),
            sent: Vec::new(),
            disconnected: Vec::new(),
            forgotten: Vec::new(),
            dead: HashSet::new(),
            send_failure: None,
            fork_failure: false,
        }
    }
}

impl RecordingControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pids returned by `fork`, in order.
    pub fn forked(&self) -> &[Pid] {
        &self.forked
    }

    /// Messages delivered to live workers.
    pub fn sent(&self) -> &[(Pid, Message)] {
        &self.sent
    }

    /// Pids whose channel was closed, in order.
    pub fn disconnects(&self) -> &[Pid] {
        &self.disconnected
    }

    pub fn forgotten(&self) -> &[Pid] {
        &self.forgotten
    }

    /// Make later sends to `pid` fail as if the process were gone.
    pub fn kill(&mut self, pid: Pid) {
        self.dead.insert(pid);
    }

    /// Make every later send fail with `kind`.
    pub fn fail_sends_with(&mut self, kind: io::ErrorKind) {
        self.send_failure = Some(kind);
    }

    /// Make every later fork fail.
    pub fn fail_forks(&mut self) {
        self.fork_failure = true;
    }
}

impl ProcessControl for RecordingControl {
    fn fork(&mut self) -> Result<Pid> {
        if self.fork_failure {
            return Err(Error::Spawn {
                source: io::Error::other("fork disabled"),
            });
        }
        let pid = self.next_pid;
        self.next_pid += 1;
        self.forked.push(pid);
        Ok(pid)
    }

    fn send(&mut self, pid: Pid, message: &Message) -> Result<()> {
        if self.dead.contains(&pid) {
            return Err(Error::NoSuchProcess { pid });
        }
        if let Some(kind) = self.send_failure {
            return Err(Error::send(pid, io::Error::from(kind)));
        }
        self.sent.push((pid, message.clone()));
        Ok(())
    }

    fn disconnect(&mut self, pid: Pid) -> Result<()> {
        if self.dead.contains(&pid) {
            return Err(Error::NoSuchProcess { pid });
        }
        self.disconnected.push(pid);
        Ok(())
    }

    fn forget(&mut self, pid: Pid) {
        self.forgotten.push(pid);
    }
}
