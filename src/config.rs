//! Connection configuration for the event relay
//!
//! The emitter connects to `host:port`, resolved from (lowest to highest
//! precedence):
//! 1. Built-in defaults (`localhost:5007`)
//! 2. Environment variables `TESTRUN_RELAY_HOST` / `TESTRUN_RELAY_PORT`
//! 3. Explicit overrides (constructor arguments or CLI flags)

use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Host the emitter connects to when none is given
pub const DEFAULT_HOST: &str = "localhost";

/// Port the emitter connects to when none is given
pub const DEFAULT_PORT: u16 = 5007;

/// Prefix for environment overrides
const ENV_PREFIX: &str = "TESTRUN_RELAY";

/// Where the worker sends its event stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Receiver host name or address
    pub host: String,

    /// Receiver port
    pub port: u16,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl RelayConfig {
    /// Create a configuration for an explicit host and port
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Build a configuration from positional listener arguments.
    ///
    /// * no arguments: defaults
    /// * one argument: a port on the default host
    /// * two or more: host then port (extra arguments are ignored)
    pub fn from_args<S: AsRef<str>>(args: &[S]) -> Result<Self> {
        let mut config = Self::default();
        match args {
            [] => {}
            [port] => config.port = parse_port(port.as_ref())?,
            [host, port, ..] => {
                config.host = host.as_ref().to_string();
                config.port = parse_port(port.as_ref())?;
            }
        }
        Ok(config)
    }

    /// Load defaults layered with `TESTRUN_RELAY_*` environment variables
    pub fn load() -> Result<Self> {
        let settings = config::Config::builder()
            .set_default("host", DEFAULT_HOST)?
            .set_default("port", i64::from(DEFAULT_PORT))?
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?;

        let config: RelayConfig = settings.try_deserialize()?;
        debug!("Loaded relay configuration: {}", config);
        Ok(config)
    }

    /// Apply explicit overrides on top of this configuration
    pub fn with_overrides(mut self, host: Option<String>, port: Option<u16>) -> Self {
        if let Some(host) = host {
            self.host = host;
        }
        if let Some(port) = port {
            self.port = port;
        }
        self
    }
}

impl fmt::Display for RelayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

fn parse_port(raw: &str) -> Result<u16> {
    raw.trim()
        .parse::<u16>()
        .map_err(|_| RelayError::InvalidPort(raw.to_string()))
}
