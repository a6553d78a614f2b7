//! Zero-downtime process-cluster supervisor.
//!
//! A supervisor process forks N copies of the program, all serving HTTP on
//! one shared port. On the restart signal the workers are replaced one at a
//! time, each only after the cluster is back at full capacity, and every
//! replaced worker drains its open connections before it exits. Workers can
//! also ask for their own restart when they grow too large or run too long.
//!
//! See [`cluster`] for the process model and [`server`] for the draining
//! HTTP server.

pub mod cluster;
pub mod commands;
pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod server;

pub use config::{ClusterConfig, Settings};
pub use error::{Error, Result};
