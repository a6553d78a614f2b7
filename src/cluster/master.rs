//! Supervisor-role runtime: feeds signals and worker events into the
//! [`ClusterSupervisor`] and acts on the [`Step`] it returns.

use std::path::Path;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::process::ChildProcesses;
use super::signals::{RestartSignal, SignalEvent, SignalRouter};
use super::supervisor::{ClusterSupervisor, Event, ProcessControl, Step, SupervisorConfig};
use crate::config::Settings;
use crate::error::{Error, Result};

/// Run the supervisor until the cluster shuts down. Returns the exit code.
pub async fn run(settings: &Settings) -> Result<i32> {
    write_pid_file(&settings.pid_file)?;

    let signals = SignalRouter::supervisor(settings)
        .install()
        .map_err(|e| Error::io("installing supervisor signal handlers", e))?;
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let control = ChildProcesses::from_current_exe(settings.workers, events_tx)?;
    let supervisor = ClusterSupervisor::new(SupervisorConfig::from(settings), control);

    let step = drive(supervisor, signals, events_rx).await?;
    remove_pid_file(&settings.pid_file);

    match step {
        Step::ReRaise(signal) => Ok(reraise(signal)),
        Step::Exit(code) => Ok(code),
        Step::Continue => Ok(0),
    }
}

/// Start the workers and pump events until the supervisor asks to stop.
pub async fn drive<C: ProcessControl>(
    mut supervisor: ClusterSupervisor<C>,
    mut signals: mpsc::UnboundedReceiver<SignalEvent>,
    mut events: mpsc::UnboundedReceiver<Event>,
) -> Result<Step> {
    supervisor.start()?;

    loop {
        let event = tokio::select! {
            Some(signal) = signals.recv() => Event::Signal(signal),
            Some(event) = events.recv() => event,
            else => {
                warn!("All event sources closed, stopping supervisor");
                return Ok(Step::Exit(0));
            },
        };

        debug!(?event, "Supervisor event");
        let step = supervisor.handle(event)?;
        if step != Step::Continue {
            info!(?step, state = %supervisor.state(), "Supervisor finished");
            return Ok(step);
        }
    }
}

/// Record this process's pid so operators can signal the supervisor.
pub fn write_pid_file(path: &Path) -> Result<()> {
    std::fs::write(path, std::process::id().to_string()).map_err(|source| Error::PidFile {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), "Wrote pid file");
    Ok(())
}

/// Remove the pid file if it still names this process.
fn remove_pid_file(path: &Path) {
    let ours = std::fs::read_to_string(path)
        .is_ok_and(|content| content.trim() == std::process::id().to_string());
    if ours && let Err(e) = std::fs::remove_file(path) {
        debug!(path = %path.display(), error = %e, "Failed to remove pid file");
    }
}

/// Hand `signal` back to its default disposition and raise it on ourselves,
/// so a development watcher sees the supervisor die from the signal it sent.
/// Returns the exit code to use if the raise did not terminate the process.
#[cfg(unix)]
fn reraise(signal: RestartSignal) -> i32 {
    use nix::sys::signal::{SigHandler, raise, signal as set_handler};

    // SAFETY: SigDfl installs no Rust code as a handler.
    let restored = unsafe { set_handler(signal.as_nix(), SigHandler::SigDfl) };
    if let Err(e) = restored.and_then(|_| raise(signal.as_nix())) {
        warn!(%signal, error = %e, "Failed to re-raise signal");
    }
    0
}

#[cfg(not(unix))]
fn reraise(_signal: RestartSignal) -> i32 {
    0
}
