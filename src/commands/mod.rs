//! CLI command implementations for shoal.
//!
//! - [`run`] - Start the cluster (supervisor or worker role)

pub mod run;
