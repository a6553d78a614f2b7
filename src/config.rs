//! Cluster configuration.
//!
//! Configuration comes from three layers, later ones winning:
//!
//! 1. Profile defaults picked by `SHOAL_ENV` ([`Profile`])
//! 2. The `[cluster]` table of `shoal.toml` ([`ClusterConfig`])
//! 3. CLI flags, applied by the caller before [`ClusterConfig::resolve`]
//!
//! [`ClusterConfig`] is the raw, serde-facing form. [`Settings`] is the
//! validated, typed form the supervisor and workers consume.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::cluster::RestartSignal;
use crate::constants;

/// Result of configuration validation.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// Non-fatal warnings that should be logged but don't prevent operation.
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if there are any warnings.
    #[must_use]
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// Log every warning through `tracing`.
    pub fn log(&self) {
        for warning in &self.warnings {
            warn!("{warning}");
        }
    }
}

/// Deployment profile, selected by the `SHOAL_ENV` environment variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    /// Graceful restart/shutdown signals handled by the supervisor.
    Production,
    /// An external watcher restarts the whole process tree.
    Development,
}

impl Profile {
    /// Read the profile from the environment.
    pub fn from_env() -> Self {
        match std::env::var(constants::ENV_PROFILE) {
            Ok(value) if value == constants::PRODUCTION => Self::Production,
            _ => Self::Development,
        }
    }

    pub fn is_production(self) -> bool {
        self == Self::Production
    }
}

/// Top-level layout of `shoal.toml`.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    cluster: ClusterConfig,
}

/// Raw cluster configuration, as written in `shoal.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterConfig {
    /// Worker count. 0 picks CPU count - 1 (at least 1).
    pub workers: usize,
    /// Restart signal name (`SIGUSR1` or `SIGUSR2`).
    pub signal: Option<String>,
    /// Restart a worker once its RSS exceeds this many bytes.
    pub restart_on_memory: Option<u64>,
    /// Restart every worker on this period, in milliseconds.
    pub restart_on_timeout: Option<u64>,
    /// Memory probe period, in milliseconds.
    pub memory_check_interval_ms: Option<u64>,
    /// Handle graceful restart/shutdown signals. Defaults from the profile.
    pub should_restart: Option<bool>,
    /// Development shutdown path for process watchers. Defaults from the profile.
    pub nodemon_compat: Option<bool>,
    pub pid_file: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Upper bound on a worker's drain after it is told to disconnect.
    pub drain_timeout_secs: Option<u64>,
}

/// Validated configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub profile: Profile,
    pub workers: usize,
    pub signal: RestartSignal,
    pub restart_on_memory: Option<u64>,
    pub restart_on_timeout: Option<Duration>,
    pub memory_check_interval: Duration,
    pub should_restart: bool,
    pub nodemon_compat: bool,
    pub pid_file: PathBuf,
    pub addr: SocketAddr,
    pub drain_timeout: Option<Duration>,
}

/// Worker count used when none is configured: leave one core to the supervisor.
pub fn default_workers() -> usize {
    num_cpus::get().saturating_sub(1).max(1)
}

impl ClusterConfig {
    /// Load `shoal.toml` from the working directory, or defaults if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        let path = Path::new(constants::CONFIG_FILE);
        if path.exists() {
            Self::load_from(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from the specified path.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file cannot be read (IO error)
    /// - The file contains invalid TOML syntax
    /// - The `[cluster]` table has unknown keys or wrongly typed values
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Parse the contents of a config file.
    pub fn parse(content: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(content)?;
        Ok(file.cluster)
    }

    /// Validate against the profile in the environment.
    ///
    /// # Errors
    ///
    /// See [`ClusterConfig::resolve_with`].
    pub fn resolve(&self) -> Result<(Settings, ValidationResult)> {
        self.resolve_with(Profile::from_env())
    }

    /// Validate and convert into [`Settings`].
    ///
    /// Recoverable problems (bad signal name, self-restart with a single
    /// worker) become warnings and a safe fallback.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `port` is 0
    /// - `host` is not an IP address
    /// - `restart_on_timeout`, `memory_check_interval_ms` or
    ///   `restart_on_memory` is 0
    pub fn resolve_with(&self, profile: Profile) -> Result<(Settings, ValidationResult)> {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        // 1. Restart signal, with fallback
        let signal = match self.signal.as_deref() {
            None => RestartSignal::default(),
            Some(name) => name.parse().unwrap_or_else(|_| {
                warnings.push(format!(
                    "Invalid signal <{name}>, using default signal: {}",
                    constants::DEFAULT_RESTART_SIGNAL
                ));
                RestartSignal::default()
            }),
        };

        // 2. Worker count
        let workers = if self.workers == 0 {
            default_workers()
        } else {
            self.workers
        };

        // 3. Self-restart triggers need a second worker to carry traffic
        if self.restart_on_memory == Some(0) {
            errors.push("restart_on_memory must be a positive byte count".to_string());
        }
        if self.restart_on_timeout == Some(0) {
            errors.push("restart_on_timeout must be a positive number of ms".to_string());
        }
        if self.memory_check_interval_ms == Some(0) {
            errors.push("memory_check_interval_ms must be positive".to_string());
        }

        let self_restart = self.restart_on_memory.is_some() || self.restart_on_timeout.is_some();
        let (restart_on_memory, restart_on_timeout) = if workers > 1 {
            (
                self.restart_on_memory,
                self.restart_on_timeout.map(Duration::from_millis),
            )
        } else {
            if self_restart {
                warnings.push(
                    "restart_on_memory/restart_on_timeout ignored with a single worker \
                     (restarting it would drop all capacity)"
                        .to_string(),
                );
            }
            (None, None)
        };

        // 4. Signal handling mode
        let should_restart = self.should_restart.unwrap_or(profile.is_production());
        let nodemon_compat = self.nodemon_compat.unwrap_or(!profile.is_production());
        if should_restart && nodemon_compat && signal == RestartSignal::Usr2 {
            warnings.push(
                "nodemon_compat handles SIGUSR2 as a dev shutdown; \
                 graceful restart via SIGUSR2 is disabled (use SIGUSR1)"
                    .to_string(),
            );
        }

        // 5. Listen address
        let port = self.port.unwrap_or(constants::DEFAULT_PORT);
        if port == 0 {
            errors.push("port cannot be 0. Use a valid port number (1-65535)".to_string());
        }
        let host = self.host.as_deref().unwrap_or(constants::DEFAULT_HOST);
        let ip = match host.parse::<IpAddr>() {
            Ok(ip) => Some(ip),
            Err(_) => {
                errors.push(format!("host must be an IP address (got: '{host}')"));
                None
            },
        };

        if !errors.is_empty() {
            anyhow::bail!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            );
        }

        let Some(ip) = ip else {
            anyhow::bail!("Configuration validation failed: invalid host");
        };

        let settings = Settings {
            profile,
            workers,
            signal,
            restart_on_memory,
            restart_on_timeout,
            memory_check_interval: Duration::from_millis(
                self.memory_check_interval_ms
                    .unwrap_or(constants::DEFAULT_MEMORY_CHECK_INTERVAL_MS),
            ),
            should_restart,
            nodemon_compat,
            pid_file: self
                .pid_file
                .clone()
                .unwrap_or_else(|| PathBuf::from(constants::DEFAULT_PID_FILE)),
            addr: SocketAddr::new(ip, port),
            drain_timeout: self.drain_timeout_secs.map(Duration::from_secs),
        };

        Ok((settings, ValidationResult { warnings }))
    }
}
