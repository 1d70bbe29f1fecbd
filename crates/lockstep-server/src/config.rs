//! Server configuration.
//!
//! [`ServerConfig`] is read from an optional YAML file and then overridden
//! by environment variables, so a deployment can run with no file at all:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `LOCKSTEP_CONFIG` | path of the YAML file |
//! | `LOCKSTEP_HOST` | `host` |
//! | `LOCKSTEP_PORT` | `port` |
//! | `LOCKSTEP_DATA_DIR` | `data_dir` |

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Environment variable naming the YAML config file.
pub const CONFIG_PATH_ENV: &str = "LOCKSTEP_CONFIG";

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// An environment override could not be parsed.
    #[error("invalid value {value:?} for {name}: {source}")]
    InvalidEnv {
        /// Variable name.
        name: &'static str,
        /// Offending value.
        value: String,
        /// Parse failure.
        source: std::num::ParseIntError,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Configuration for the authority server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerConfig {
    /// The host address to bind to (e.g. `0.0.0.0`).
    #[serde(default = "default_host")]
    pub host: String,

    /// The TCP port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Directory holding one record file per room.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Per-room broadcast buffer. Watchers further behind than this lag.
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,

    /// Records queued for the store writer before new ones are dropped.
    #[serde(default = "default_persist_queue")]
    pub persist_queue: usize,
}

fn default_host() -> String {
    String::from("0.0.0.0")
}

const fn default_port() -> u16 {
    8080
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

const fn default_broadcast_capacity() -> usize {
    256
}

const fn default_persist_queue() -> usize {
    1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            data_dir: default_data_dir(),
            broadcast_capacity: default_broadcast_capacity(),
            persist_queue: default_persist_queue(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from the process environment.
    ///
    /// Reads the YAML file named by `LOCKSTEP_CONFIG` if set, otherwise
    /// starts from defaults, then applies environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed, or an
    /// override is malformed.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Load configuration from a YAML file at the given path.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, or
    /// [`ConfigError::Yaml`] if the content is not valid YAML.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yml::from_str(yaml)?)
    }

    /// Apply overrides supplied by `lookup`, keyed by variable name.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidEnv`] if `LOCKSTEP_PORT` is not a
    /// valid port number.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("LOCKSTEP_HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("LOCKSTEP_PORT") {
            self.port = port.parse().map_err(|source| ConfigError::InvalidEnv {
                name: "LOCKSTEP_PORT",
                value: port,
                source,
            })?;
        }
        if let Some(dir) = lookup("LOCKSTEP_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    /// The `host:port` string to bind.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
