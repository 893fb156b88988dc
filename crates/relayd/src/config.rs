//! Relay configuration.
//!
//! Values are resolved in layers:
//! 1. Built-in defaults
//! 2. A TOML file (explicit path, or `<config dir>/notify-relay/config.toml` if present)
//! 3. `RELAY_*` environment variables
//!
//! The binary applies CLI overrides on top of the loaded value.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Default capacity of the consumer → dispatcher channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 100;

/// Environment variable holding the token signing secret.
pub const JWT_SECRET_ENV: &str = "RELAY_JWT_SECRET";

/// Secret used when none is configured. Only fit for local development.
pub const INSECURE_DEFAULT_SECRET: &str = "notify-relay-insecure-dev-secret";

/// Complete relay configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub broker: BrokerConfig,
    pub gateway: GatewayConfig,
    pub auth: AuthConfig,
    /// Capacity of the internal channel between consumer and dispatcher
    pub channel_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            gateway: GatewayConfig::default(),
            auth: AuthConfig::default(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Broker connection and subscription settings.
#[derive(Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub login: String,
    pub password: String,
    pub virtual_host: String,
    pub queue_name: String,
    /// Maximum unacknowledged deliveries held by this consumer
    pub prefetch: u16,
    pub consumer_tag: String,
    /// Create the queue (durable) instead of requiring it to exist
    pub declare_queue: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            login: "guest".to_string(),
            password: "guest".to_string(),
            virtual_host: "/".to_string(),
            queue_name: "default".to_string(),
            prefetch: 100,
            consumer_tag: "notify-relay".to_string(),
            declare_queue: false,
        }
    }
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("login", &self.login)
            .field("password", &"<redacted>")
            .field("virtual_host", &self.virtual_host)
            .field("queue_name", &self.queue_name)
            .field("prefetch", &self.prefetch)
            .field("consumer_tag", &self.consumer_tag)
            .field("declare_queue", &self.declare_queue)
            .finish()
    }
}

/// WebSocket listener settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
}

impl GatewayConfig {
    /// Returns `host:port` suitable for binding.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8765,
        }
    }
}

/// Connection authentication settings.
#[derive(Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HMAC-SHA-256 secret shared with the token issuer
    pub secret: String,
    /// Request header carrying the token. A `Bearer ` prefix is accepted.
    pub token_header: String,
    /// Reject tokens without an `exp` claim
    pub require_exp: bool,
}

impl AuthConfig {
    /// Returns true when the built-in development secret is in use.
    pub fn uses_insecure_default(&self) -> bool {
        self.secret == INSECURE_DEFAULT_SECRET
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: INSECURE_DEFAULT_SECRET.to_string(),
            token_header: "authorization".to_string(),
            require_exp: false,
        }
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("secret", &"<redacted>")
            .field("token_header", &self.token_header)
            .field("require_exp", &self.require_exp)
            .finish()
    }
}

impl RelayConfig {
    /// Loads configuration from defaults, an optional file, and the process environment.
    ///
    /// With `path == None` the default config file is read only if it exists.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match default_config_path() {
                Some(default) if default.exists() => Self::from_file(&default)?,
                _ => Self::default(),
            },
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a TOML config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        toml::from_str(&contents).map_err(|e| ConfigError::ParseFile {
            path: path.to_path_buf(),
            error: e.to_string(),
        })
    }

    /// Parses TOML text. Missing keys fall back to defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Applies `RELAY_*` overrides using the given variable lookup.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("RELAY_BROKER_HOST") {
            self.broker.host = v;
        }
        if let Some(v) = lookup("RELAY_BROKER_PORT") {
            self.broker.port = parse_env("RELAY_BROKER_PORT", &v)?;
        }
        if let Some(v) = lookup("RELAY_BROKER_LOGIN") {
            self.broker.login = v;
        }
        if let Some(v) = lookup("RELAY_BROKER_PASSWORD") {
            self.broker.password = v;
        }
        if let Some(v) = lookup("RELAY_BROKER_VHOST") {
            self.broker.virtual_host = v;
        }
        if let Some(v) = lookup("RELAY_BROKER_QUEUE") {
            self.broker.queue_name = v;
        }
        if let Some(v) = lookup("RELAY_GATEWAY_HOST") {
            self.gateway.host = v;
        }
        if let Some(v) = lookup("RELAY_GATEWAY_PORT") {
            self.gateway.port = parse_env("RELAY_GATEWAY_PORT", &v)?;
        }
        if let Some(v) = lookup(JWT_SECRET_ENV) {
            self.auth.secret = v;
        }
        if let Some(v) = lookup("RELAY_CHANNEL_CAPACITY") {
            self.channel_capacity = parse_env("RELAY_CHANNEL_CAPACITY", &v)?;
        }
        Ok(())
    }

    /// Checks invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "channel_capacity",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.broker.prefetch == 0 {
            return Err(ConfigError::Invalid {
                field: "broker.prefetch",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.broker.queue_name.is_empty() {
            return Err(ConfigError::Invalid {
                field: "broker.queue_name",
                reason: "must not be empty".to_string(),
            });
        }
        if self.auth.secret.is_empty() {
            return Err(ConfigError::Invalid {
                field: "auth.secret",
                reason: "must not be empty".to_string(),
            });
        }
        if self.auth.token_header.is_empty() {
            return Err(ConfigError::Invalid {
                field: "auth.token_header",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Returns `<config dir>/notify-relay/config.toml`, if a config dir is known.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("notify-relay").join("config.toml"))
}

fn parse_env<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key,
        value: value.to_string(),
    })
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {error}")]
    Read { path: PathBuf, error: String },

    #[error("Failed to parse config file {path}: {error}")]
    ParseFile { path: PathBuf, error: String },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid value for {key}: {value:?}")]
    InvalidEnv { key: &'static str, value: String },

    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
