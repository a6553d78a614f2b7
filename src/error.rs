//! Typed errors for the cluster supervisor and worker runtime.
//!
//! Most errors are fatal to the process that hits them. The one exception is
//! [`Error::NoSuchProcess`]: sending to a worker that already died is a benign
//! race between the worker exiting and the supervisor reaching it, and the
//! supervisor swallows it (see [`Error::is_no_such_process`]).

use std::path::PathBuf;

/// Result type for cluster operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Cluster errors with structured context.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The target worker process no longer exists.
    #[error("no such process: {pid}")]
    NoSuchProcess { pid: u32 },

    /// Sending a message to a live worker failed for another reason.
    #[error("failed to send to worker {pid}: {source}")]
    Send {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    /// Spawning a worker process failed.
    #[error("failed to spawn worker: {source}")]
    Spawn {
        #[source]
        source: std::io::Error,
    },

    /// Binding the worker listening socket failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// An IPC line could not be encoded or decoded.
    #[error("invalid IPC message: {0}")]
    Codec(#[from] serde_json::Error),

    /// Writing the PID file failed.
    #[error("failed to write pid file {path:?}: {source}")]
    PidFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// IO error with context.
    #[error("IO error in {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Classify a failed send to `pid`.
    ///
    /// A closed pipe or `ESRCH` means the worker is gone, anything else is a
    /// real fault.
    pub fn send(pid: u32, source: std::io::Error) -> Self {
        let gone = matches!(source.kind(), std::io::ErrorKind::BrokenPipe)
            || source.raw_os_error() == Some(esrch_code());
        if gone {
            Self::NoSuchProcess { pid }
        } else {
            Self::Send { pid, source }
        }
    }

    /// Returns true for the "no such process" race, which callers may ignore.
    pub fn is_no_such_process(&self) -> bool {
        matches!(self, Self::NoSuchProcess { .. })
    }
}

#[cfg(unix)]
fn esrch_code() -> i32 {
    nix::errno::Errno::ESRCH as i32
}

#[cfg(not(unix))]
fn esrch_code() -> i32 {
    3
}
