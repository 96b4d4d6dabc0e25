//! Daemon configuration file.
//!
//! ```toml
//! [circus]
//! endpoint = "tcp://127.0.0.1:5555"
//! multicast_endpoint = "udp://237.219.251.97:12027"
//! check_delay = 1.0
//!
//! [[watcher]]
//! name = "web"
//! cmd = "python -m http.server $(circus.env.PORT)"
//! numprocesses = 2
//! env = { PORT = "8000" }
//! rlimits = { nofile = 1024 }
//! ```
//!
//! `CIRCUS_ENDPOINT` and `CIRCUS_MULTICAST_ENDPOINT` override the file.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use circus_core::{ProcessConfig, RlimitSet};
use circus_protocol::{Endpoint, EndpointError, MulticastEndpoint};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::arbiter::{Supervisor, Watcher};
use crate::controller::ControllerConfig;

/// Environment variable overriding the control endpoint
pub const ENDPOINT_ENV: &str = "CIRCUS_ENDPOINT";

/// Environment variable overriding the discovery endpoint
pub const MULTICAST_ENDPOINT_ENV: &str = "CIRCUS_MULTICAST_ENDPOINT";

/// Errors raised while loading the configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid {var}: {source}")]
    Override {
        var: &'static str,
        #[source]
        source: EndpointError,
    },

    #[error("duplicate watcher name {0:?}")]
    DuplicateWatcher(String),

    #[error("watcher {name:?}: {reason}")]
    InvalidWatcher { name: String, reason: String },

    #[error("check_delay must be a positive number of seconds, got {0}")]
    InvalidCheckDelay(f64),
}

/// The whole file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub circus: CircusSection,

    #[serde(default, rename = "watcher")]
    pub watchers: Vec<WatcherConfig>,
}

/// The `[circus]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircusSection {
    #[serde(default)]
    pub endpoint: Endpoint,

    #[serde(default)]
    pub multicast_endpoint: Option<MulticastEndpoint>,

    /// Health-check period in seconds
    #[serde(default = "default_check_delay")]
    pub check_delay: f64,
}

impl Default for CircusSection {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::default(),
            multicast_endpoint: None,
            check_delay: default_check_delay(),
        }
    }
}

/// A `[[watcher]]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatcherConfig {
    pub name: String,

    #[serde(flatten)]
    pub process: ProcessConfig,

    #[serde(default = "default_numprocesses")]
    pub numprocesses: usize,

    /// Seconds between SIGTERM and SIGKILL
    #[serde(default = "default_graceful_timeout")]
    pub graceful_timeout: f64,

    /// Start with the daemon
    #[serde(default = "default_true")]
    pub autostart: bool,
}

fn default_check_delay() -> f64 {
    1.0
}

fn default_numprocesses() -> usize {
    1
}

fn default_graceful_timeout() -> f64 {
    30.0
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Reads and validates a file. Environment overrides are not applied.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "Loaded configuration file");
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// `$XDG_CONFIG_HOME/circus/circus.toml`, when a config dir exists.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("circus").join("circus.toml"))
    }

    /// Applies `CIRCUS_ENDPOINT` and `CIRCUS_MULTICAST_ENDPOINT`.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|var| std::env::var(var).ok())
    }

    /// Applies overrides read through `lookup`.
    pub fn apply_overrides_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(value) = lookup(ENDPOINT_ENV) {
            self.circus.endpoint = value.parse().map_err(|source| ConfigError::Override {
                var: ENDPOINT_ENV,
                source,
            })?;
        }
        if let Some(value) = lookup(MULTICAST_ENDPOINT_ENV) {
            let multicast = value.parse().map_err(|source| ConfigError::Override {
                var: MULTICAST_ENDPOINT_ENV,
                source,
            })?;
            self.circus.multicast_endpoint = Some(multicast);
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let delay = self.circus.check_delay;
        if !(delay.is_finite() && delay > 0.0) {
            return Err(ConfigError::InvalidCheckDelay(delay));
        }

        let mut names = HashSet::new();
        for watcher in &self.watchers {
            if !names.insert(watcher.name.as_str()) {
                return Err(ConfigError::DuplicateWatcher(watcher.name.clone()));
            }
            watcher.validate()?;
        }
        Ok(())
    }

    /// Controller settings.
    pub fn controller(&self) -> ControllerConfig {
        ControllerConfig {
            endpoint: self.circus.endpoint.clone(),
            multicast_endpoint: self.circus.multicast_endpoint,
            check_delay: Duration::from_secs_f64(self.circus.check_delay),
        }
    }

    /// Builds the supervisor. Autostart watchers begin active and spawn on
    /// the first health check.
    pub fn supervisor(&self) -> Supervisor {
        Supervisor::new(self.watchers.iter().map(WatcherConfig::watcher))
    }
}

impl WatcherConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidWatcher {
            name: self.name.clone(),
            reason,
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty".to_string()));
        }
        if self.process.cmd.trim().is_empty() {
            return Err(invalid("cmd must not be empty".to_string()));
        }
        if !(self.graceful_timeout.is_finite() && self.graceful_timeout >= 0.0) {
            return Err(invalid(format!(
                "graceful_timeout must be a non-negative number, got {}",
                self.graceful_timeout
            )));
        }
        RlimitSet::parse(&self.process.rlimits).map_err(|e| invalid(e.to_string()))?;
        Ok(())
    }

    pub fn watcher(&self) -> Watcher {
        let watcher = Watcher::new(
            self.name.clone(),
            self.process.clone(),
            self.numprocesses,
            Duration::from_secs_f64(self.graceful_timeout),
        );
        if self.autostart {
            watcher.activated()
        } else {
            watcher
        }
    }
}
