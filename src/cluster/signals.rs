//! OS signal routing for supervisor and worker roles.
//!
//! Signals are turned into [`SignalEvent`]s on a channel, so the
//! supervisor and worker loops never touch OS signal APIs directly and tests
//! can inject events through a [`SignalInjector`].
//!
//! | Role       | Signal            | Event          | Condition        |
//! |------------|-------------------|----------------|------------------|
//! | supervisor | SIGINT            | `Interrupt`    | `should_restart` |
//! | supervisor | restart signal    | `Restart`      | `should_restart` |
//! | supervisor | SIGUSR2           | `DevShutdown`  | `nodemon_compat` |
//! | worker     | SIGINT            | `Interrupt`    | `should_restart` |
//! | worker     | SIGUSR2           | `DevShutdown`  | `nodemon_compat` |
//!
//! Workers receive `Interrupt` only to swallow it, so the raw signal can't
//! kill them before the supervisor-driven drain finishes.

use std::fmt;
use std::str::FromStr;

use tokio::sync::mpsc;
use tracing::debug;

use crate::config::Settings;

/// The two user signals accepted as the graceful-restart trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RestartSignal {
    Usr1,
    #[default]
    Usr2,
}

impl RestartSignal {
    /// Canonical signal name, e.g. `SIGUSR2`.
    pub fn name(self) -> &'static str {
        match self {
            Self::Usr1 => "SIGUSR1",
            Self::Usr2 => "SIGUSR2",
        }
    }

    #[cfg(unix)]
    pub fn kind(self) -> tokio::signal::unix::SignalKind {
        use tokio::signal::unix::SignalKind;
        match self {
            Self::Usr1 => SignalKind::user_defined1(),
            Self::Usr2 => SignalKind::user_defined2(),
        }
    }

    #[cfg(unix)]
    pub fn as_nix(self) -> nix::sys::signal::Signal {
        use nix::sys::signal::Signal;
        match self {
            Self::Usr1 => Signal::SIGUSR1,
            Self::Usr2 => Signal::SIGUSR2,
        }
    }
}

impl fmt::Display for RestartSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error for a signal name outside the allow-list.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid restart signal <{0}>, expected SIGUSR1 or SIGUSR2")]
pub struct InvalidSignal(pub String);

impl FromStr for RestartSignal {
    type Err = InvalidSignal;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let bare = upper.strip_prefix("SIG").unwrap_or(&upper);
        match bare {
            "USR1" => Ok(Self::Usr1),
            "USR2" => Ok(Self::Usr2),
            _ => Err(InvalidSignal(s.to_string())),
        }
    }
}

/// Internal event produced from an OS signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    /// Graceful rolling restart of every worker.
    Restart,
    /// Graceful full shutdown.
    Interrupt,
    /// Development process watcher wants the whole tree gone.
    DevShutdown,
}

/// Which role the router is installed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Supervisor,
    Worker,
}

/// Signal handlers to install for one role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalRouter {
    role: Role,
    interrupt: bool,
    restart: Option<RestartSignal>,
    dev_shutdown: bool,
}

impl SignalRouter {
    /// Handlers for the supervisor process.
    pub fn supervisor(settings: &Settings) -> Self {
        let mut restart = settings.should_restart.then_some(settings.signal);
        // The dev-shutdown path owns SIGUSR2 when both are enabled.
        if settings.nodemon_compat && restart == Some(RestartSignal::Usr2) {
            restart = None;
        }
        Self {
            role: Role::Supervisor,
            interrupt: settings.should_restart,
            restart,
            dev_shutdown: settings.nodemon_compat,
        }
    }

    /// Handlers for a worker process.
    pub fn worker(settings: &Settings) -> Self {
        Self {
            role: Role::Worker,
            interrupt: settings.should_restart,
            restart: None,
            dev_shutdown: settings.nodemon_compat,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn handles_interrupt(&self) -> bool {
        self.interrupt
    }

    pub fn restart_signal(&self) -> Option<RestartSignal> {
        self.restart
    }

    pub fn handles_dev_shutdown(&self) -> bool {
        self.dev_shutdown
    }

    /// Register the OS handlers and forward their events to a channel.
    ///
    /// Must be called from within a Tokio runtime.
    #[cfg(unix)]
    pub fn install(self) -> std::io::Result<mpsc::UnboundedReceiver<SignalEvent>> {
        use tokio::signal::unix::{SignalKind, signal};

        let (tx, rx) = mpsc::unbounded_channel();

        let mut routes = Vec::new();
        if self.interrupt {
            routes.push((SignalKind::interrupt(), SignalEvent::Interrupt));
        }
        if let Some(restart) = self.restart {
            routes.push((restart.kind(), SignalEvent::Restart));
        }
        if self.dev_shutdown {
            routes.push((SignalKind::user_defined2(), SignalEvent::DevShutdown));
        }

        for (kind, event) in routes {
            let mut stream = signal(kind)?;
            let tx = tx.clone();
            let role = self.role;
            tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    debug!(?role, ?event, "Signal received");
                    if tx.send(event).is_err() {
                        break;
                    }
                }
            });
        }

        Ok(rx)
    }

    /// Register the handlers that exist off unix (Ctrl+C only).
    #[cfg(not(unix))]
    pub fn install(self) -> std::io::Result<mpsc::UnboundedReceiver<SignalEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.interrupt {
            tokio::spawn(async move {
                while tokio::signal::ctrl_c().await.is_ok() {
                    if tx.send(SignalEvent::Interrupt).is_err() {
                        break;
                    }
                }
            });
        }
        Ok(rx)
    }
}

/// Simulated signal source for driving a supervisor or worker in tests.
#[derive(Debug, Clone)]
pub struct SignalInjector {
    tx: mpsc::UnboundedSender<SignalEvent>,
}

impl SignalInjector {
    /// Create an injector and the receiver a loop would normally get from
    /// [`SignalRouter::install`].
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SignalEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Deliver an event. Returns false once the receiver is gone.
    pub fn send(&self, event: SignalEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}
