//! Shared defaults and environment variable names.

/// Default HTTP port served by every worker.
pub const DEFAULT_PORT: u16 = 3001;

/// Default bind host.
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "shoal.toml";

/// Default PID file written by the supervisor at startup.
pub const DEFAULT_PID_FILE: &str = ".pid";

/// Restart signal used when none (or an invalid one) is configured.
pub const DEFAULT_RESTART_SIGNAL: &str = "SIGUSR2";

/// Period of the worker memory probe.
pub const DEFAULT_MEMORY_CHECK_INTERVAL_MS: u64 = 5_000;

/// Set on spawned workers; its presence selects the worker role.
pub const ENV_WORKER_ID: &str = "SHOAL_WORKER_ID";

/// Resolved worker count handed from the supervisor to each worker.
pub const ENV_WORKERS: &str = "SHOAL_WORKERS";

/// Selects the production or development profile.
pub const ENV_PROFILE: &str = "SHOAL_ENV";

/// Value of [`ENV_PROFILE`] that selects the production profile.
pub const PRODUCTION: &str = "production";

/// Bytes per mebibyte, for log output.
pub const MIB: u64 = 1024 * 1024;
