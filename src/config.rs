//! Server configuration.
//!
//! YAML on disk, validated once at startup. Validation failures are fatal
//! before the endpoint binds; nothing is hot-reloaded.

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// UDP listen address, e.g. "0.0.0.0:4000".
    pub listen: String,
    /// Accepted proxy credentials. At least one is required.
    pub credentials: Vec<CredentialConfig>,
    /// Optional TLS certificate path. Loaded as an opaque blob for an
    /// external TLS layer; this server never parses it.
    #[serde(default)]
    pub cert: String,
    /// Optional TLS key path. Same handling as `cert`.
    #[serde(default)]
    pub key: String,
    /// Raise log verbosity to debug.
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub transport: TransportSettings,
}

/// One username/password pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CredentialConfig {
    pub username: String,
    pub password: String,
}

/// Transport and relay timing knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransportSettings {
    /// Session teardown after this many seconds without inbound frames.
    #[serde(default = "default_session_idle")]
    pub session_idle_secs: u64,
    /// Relay teardown after this many seconds without bytes either way.
    #[serde(default = "default_relay_idle")]
    pub relay_idle_secs: u64,
    /// Upstream dial timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_session_idle() -> u64 {
    120
}

fn default_relay_idle() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for TransportSettings {
    fn default() -> Self {
        TransportSettings {
            session_idle_secs: default_session_idle(),
            relay_idle_secs: default_relay_idle(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

/// TLS material loaded from the configured paths, held for an external
/// consumer.
#[derive(Debug, Clone)]
pub struct TlsMaterial {
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
}

/// Configuration error type.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config: read file: {0}")]
    Io(#[from] std::io::Error),
    #[error("config: parse yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("config: {0}")]
    Validation(String),
}

/// Load and parse a YAML config file.
pub fn load<P: AsRef<Path>>(path: P) -> Result<ServerConfig, ConfigError> {
    let data = fs::read(path)?;
    load_from_bytes(&data)
}

/// Parse a YAML config from raw bytes.
pub fn load_from_bytes(data: &[u8]) -> Result<ServerConfig, ConfigError> {
    let cfg: ServerConfig = serde_yaml::from_slice(data)?;
    cfg.validate()?;
    Ok(cfg)
}

impl ServerConfig {
    /// Validate the configuration for correctness.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::Validation(format!(
                "listen {:?} is not a valid socket address",
                self.listen
            )));
        }
        if self.credentials.is_empty() {
            return Err(ConfigError::Validation(
                "at least one credential is required".into(),
            ));
        }
        for (i, cred) in self.credentials.iter().enumerate() {
            cred.validate()
                .map_err(|e| ConfigError::Validation(format!("credentials[{i}]: {e}")))?;
        }
        if self.cert.is_empty() != self.key.is_empty() {
            return Err(ConfigError::Validation(
                "cert and key must be set together".into(),
            ));
        }
        self.transport
            .validate()
            .map_err(|e| ConfigError::Validation(format!("transport: {e}")))?;
        Ok(())
    }

    /// The validated listen address.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen.parse().map_err(|_| {
            ConfigError::Validation(format!(
                "listen {:?} is not a valid socket address",
                self.listen
            ))
        })
    }

    /// Read the configured TLS blobs, if any.
    pub fn load_tls(&self) -> Result<Option<TlsMaterial>, ConfigError> {
        if self.cert.is_empty() {
            return Ok(None);
        }
        let cert = fs::read(&self.cert)?;
        let key = fs::read(&self.key)?;
        Ok(Some(TlsMaterial { cert, key }))
    }
}

impl CredentialConfig {
    fn validate(&self) -> Result<(), String> {
        if self.username.is_empty() {
            return Err("username is required".into());
        }
        if self.username.contains(':') {
            return Err("username must not contain ':'".into());
        }
        if self.password.is_empty() {
            return Err("password is required".into());
        }
        Ok(())
    }
}

impl TransportSettings {
    fn validate(&self) -> Result<(), String> {
        if self.session_idle_secs == 0 {
            return Err("session_idle_secs must be positive".into());
        }
        if self.relay_idle_secs == 0 {
            return Err("relay_idle_secs must be positive".into());
        }
        if self.connect_timeout_secs == 0 {
            return Err("connect_timeout_secs must be positive".into());
        }
        Ok(())
    }

    pub fn session_idle(&self) -> Duration {
        Duration::from_secs(self.session_idle_secs)
    }

    pub fn relay_idle(&self) -> Duration {
        Duration::from_secs(self.relay_idle_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
