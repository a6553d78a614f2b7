//! Worker-role runtime.
//!
//! A worker binds the shared port, serves through a [`SocketDrain`], and
//! talks to the supervisor over its stdio:
//!
//! 1. once bound, report `listening` on stdout
//! 2. run the self-restart triggers, which send `restart` requests
//! 3. on `disconnect` (or when stdin closes), run the user hook, drain the
//!    server and exit cleanly

use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::ipc::{Message, MessageReader, write_message};
use super::memory::{MemoryProbe, ProcessMemory};
use super::signals::{SignalEvent, SignalRouter};
use super::triggers::SelfRestart;
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::server::{self, RequestDispatcher, SocketDrain};

/// Hook run when the supervisor disconnects the worker, before draining.
pub type DisconnectHook = Box<dyn FnOnce() + Send + 'static>;

/// Why a worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The supervisor disconnected us and the server drained.
    Disconnected,
    /// A development watcher asked the whole tree to stop.
    DevShutdown,
}

/// Worker-side half of the cluster.
pub struct WorkerAgent<D> {
    settings: Settings,
    dispatcher: Arc<D>,
    on_disconnect: Option<DisconnectHook>,
}

impl<D: RequestDispatcher> WorkerAgent<D> {
    pub fn new(settings: Settings, dispatcher: D) -> Self {
        Self {
            settings,
            dispatcher: Arc::new(dispatcher),
            on_disconnect: None,
        }
    }

    /// Run `hook` when the supervisor disconnects this worker.
    pub fn on_disconnect<F>(mut self, hook: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_disconnect = Some(Box::new(hook));
        self
    }

    /// Replace the disconnect hook, or clear it with `None`.
    pub fn with_disconnect_hook(mut self, hook: Option<DisconnectHook>) -> Self {
        self.on_disconnect = hook;
        self
    }

    /// Run as a real worker: bind the configured address, use stdio for IPC
    /// and the OS signals for this role.
    pub async fn run(self) -> Result<WorkerExit> {
        let listener = server::bind(self.settings.addr)?;
        let signals = SignalRouter::worker(&self.settings)
            .install()
            .map_err(|e| Error::io("installing worker signal handlers", e))?;
        self.run_with(
            listener,
            BufReader::new(tokio::io::stdin()),
            tokio::io::stdout(),
            signals,
            ProcessMemory::current(),
        )
        .await
    }

    /// Run against explicit IPC streams and signal source.
    pub async fn run_with<R, W, P>(
        mut self,
        listener: TcpListener,
        inbound: R,
        outbound: W,
        mut signals: mpsc::UnboundedReceiver<SignalEvent>,
        probe: P,
    ) -> Result<WorkerExit>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
        P: MemoryProbe,
    {
        let pid = std::process::id();
        let drain = SocketDrain::serve(listener, self.dispatcher.clone())?;
        let port = drain.local_addr().port();
        info!(pid, addr = %drain.local_addr(), "Worker listening");

        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(forward_to_supervisor(outbound, rx));
        let _ = tx.send(Message::Listening { pid, port });

        let triggers = SelfRestart::from_settings(&self.settings).spawn(pid, probe, tx.clone());

        let mut inbound = MessageReader::new(inbound);
        let exit = loop {
            tokio::select! {
                message = inbound.next() => match message {
                    Ok(Some(Message::Disconnect)) => {
                        warn!(pid, "Cluster: disconnecting server {pid}...");
                        break WorkerExit::Disconnected;
                    },
                    Ok(Some(other)) => debug!(pid, ?other, "Ignoring message from supervisor"),
                    Ok(None) => {
                        info!(pid, "IPC channel closed");
                        break WorkerExit::Disconnected;
                    },
                    Err(e) => {
                        warn!(pid, error = %e, "IPC read failed");
                        break WorkerExit::Disconnected;
                    },
                },
                Some(signal) = signals.recv() => match signal {
                    SignalEvent::DevShutdown => {
                        info!(pid, "Development shutdown requested");
                        break WorkerExit::DevShutdown;
                    },
                    // The supervisor drives shutdown; the raw signal must not kill us.
                    SignalEvent::Interrupt => debug!(pid, "Ignoring SIGINT in worker"),
                    SignalEvent::Restart => debug!(pid, "Ignoring restart signal in worker"),
                },
            }
        };

        for task in triggers {
            task.abort();
        }

        if exit == WorkerExit::Disconnected {
            if let Some(hook) = self.on_disconnect.take() {
                hook();
            }
            match self.settings.drain_timeout {
                Some(limit) => {
                    if tokio::time::timeout(limit, drain.shutdown()).await.is_err() {
                        warn!(
                            pid,
                            connections = drain.active_connections(),
                            "Drain timed out, exiting with open connections"
                        );
                    }
                },
                None => drain.shutdown().await?,
            }
        }

        drop(tx);
        let _ = writer.await;
        Ok(exit)
    }
}

async fn forward_to_supervisor<W>(mut outbound: W, mut messages: mpsc::UnboundedReceiver<Message>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = messages.recv().await {
        if let Err(e) = write_message(&mut outbound, &message).await {
            debug!(error = %e, "Supervisor channel closed");
            return;
        }
    }
}
