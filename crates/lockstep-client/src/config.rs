//! Configuration for the command-line client.
//!
//! All configuration is loaded from environment variables; every value
//! has a default so the client runs against a local server out of the box.

use std::time::Duration;

use crate::error::ClientError;

/// Complete client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Server `WebSocket` URL (e.g. `ws://127.0.0.1:8080`).
    pub server_url: String,
    /// Bound on one connection attempt, handshake included.
    pub connect_timeout: Duration,
    /// Delay between clock probes.
    pub probe_interval: Duration,
    /// How long `post` waits for a clock estimate before using local time.
    pub post_clock_wait: Duration,
    /// First reconnect delay of a watcher.
    pub reconnect_min: Duration,
    /// Upper bound on the reconnect delay.
    pub reconnect_max: Duration,
    /// How often `play` re-evaluates the simulated state.
    pub render_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: String::from("ws://127.0.0.1:8080"),
            connect_timeout: Duration::from_millis(5000),
            probe_interval: Duration::from_millis(1000),
            post_clock_wait: Duration::from_millis(500),
            reconnect_min: Duration::from_millis(250),
            reconnect_max: Duration::from_millis(5000),
            render_interval: Duration::from_millis(100),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables.
    ///
    /// Optional variables:
    /// - `SERVER_URL` -- server `WebSocket` URL (default `ws://127.0.0.1:8080`)
    /// - `CONNECT_TIMEOUT_MS` -- bound on one connection attempt (default 5000)
    /// - `PROBE_INTERVAL_MS` -- clock probe period (default 1000)
    /// - `POST_CLOCK_WAIT_MS` -- clock wait before posting (default 500)
    /// - `RECONNECT_MIN_MS` -- first reconnect delay (default 250)
    /// - `RECONNECT_MAX_MS` -- reconnect delay cap (default 5000)
    /// - `RENDER_INTERVAL_MS` -- `play` refresh period (default 100)
    pub fn from_env() -> Result<Self, ClientError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ClientError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let millis = |name: &str, default: Duration| -> Result<Duration, ClientError> {
            lookup(name).map_or(Ok(default), |raw| {
                raw.parse::<u64>()
                    .map(Duration::from_millis)
                    .map_err(|e| ClientError::Config(format!("invalid {name}: {e}")))
            })
        };

        let config = Self {
            server_url: lookup("SERVER_URL").unwrap_or(defaults.server_url),
            connect_timeout: millis("CONNECT_TIMEOUT_MS", defaults.connect_timeout)?,
            probe_interval: millis("PROBE_INTERVAL_MS", defaults.probe_interval)?,
            post_clock_wait: millis("POST_CLOCK_WAIT_MS", defaults.post_clock_wait)?,
            reconnect_min: millis("RECONNECT_MIN_MS", defaults.reconnect_min)?,
            reconnect_max: millis("RECONNECT_MAX_MS", defaults.reconnect_max)?,
            render_interval: millis("RENDER_INTERVAL_MS", defaults.render_interval)?,
        };

        if config.probe_interval.is_zero()
            || config.render_interval.is_zero()
            || config.connect_timeout.is_zero()
        {
            return Err(ClientError::Config(String::from(
                "CONNECT_TIMEOUT_MS, PROBE_INTERVAL_MS and RENDER_INTERVAL_MS must be positive",
            )));
        }
        if config.reconnect_max < config.reconnect_min {
            return Err(ClientError::Config(String::from(
                "RECONNECT_MAX_MS must not be below RECONNECT_MIN_MS",
            )));
        }
        Ok(config)
    }
}
