//! Zero-downtime process cluster.
//!
//! One binary plays two roles. Started by a user it is the supervisor: it
//! forks `workers` copies of itself, keeps that many alive, and rolls
//! restarts through them one at a time. Started by the supervisor (marked by
//! `SHOAL_WORKER_ID`) it is a worker: it binds the shared port, serves, and
//! drains when told to.
//!
//! | Module         | Role       | Purpose                                  |
//! |----------------|------------|------------------------------------------|
//! | [`supervisor`] | supervisor | Pure state machine over typed events     |
//! | [`master`]     | supervisor | Event loop, pid file, exit handling      |
//! | [`process`]    | supervisor | Real child processes and their stdio     |
//! | [`queue`]      | supervisor | One-at-a-time restart admission          |
//! | [`agent`]      | worker     | Serve, report, drain on disconnect       |
//! | [`triggers`]   | worker     | Memory and uptime restart requests       |
//! | [`signals`]    | both       | OS signals to internal events            |
//! | [`ipc`]        | both       | JSON-lines messages over stdio           |

pub mod agent;
pub mod ipc;
pub mod master;
pub mod memory;
pub mod process;
pub mod queue;
pub mod signals;
pub mod supervisor;
pub mod testing;
pub mod triggers;
pub mod types;

#[cfg(test)]
mod property_tests;

pub use agent::{DisconnectHook, WorkerAgent, WorkerExit};
pub use ipc::Message;
pub use queue::RestartQueue;
pub use signals::{RestartSignal, Role, SignalEvent, SignalInjector, SignalRouter};
pub use supervisor::{ClusterSupervisor, Event, ProcessControl, Step, SupervisorConfig};
pub use types::{ClusterState, ExitStatus, LifecycleState, Pid, SupervisorState, Worker};

use tracing::info;

use crate::config::Settings;
use crate::constants::ENV_WORKER_ID;
use crate::error::Result;
use crate::server::RequestDispatcher;

/// Role of the current process, from its environment.
pub fn current_role() -> Role {
    if std::env::var_os(ENV_WORKER_ID).is_some() {
        Role::Worker
    } else {
        Role::Supervisor
    }
}

/// Run this process in its role and return the exit code.
///
/// `dispatcher` is only used (and only needs to be cheap to build) in the
/// worker role. `on_disconnect` runs in a worker after the supervisor tells
/// it to go and before its server drains.
pub async fn start<D, F>(
    settings: Settings,
    dispatcher: F,
    on_disconnect: Option<DisconnectHook>,
) -> Result<i32>
where
    D: RequestDispatcher,
    F: FnOnce() -> D,
{
    match current_role() {
        Role::Supervisor => master::run(&settings).await,
        Role::Worker => {
            let exit = WorkerAgent::new(settings, dispatcher())
                .with_disconnect_hook(on_disconnect)
                .run()
                .await?;
            info!(?exit, "Worker stopped");
            Ok(0)
        },
    }
}
