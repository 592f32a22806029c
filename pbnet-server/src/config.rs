//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via PBNET_CONFIG)
//! 3. Environment variables

use crate::auth::SecretValidator;
use pbnet_core::ProtocolSettings;
use pbnet_protocol::DEFAULT_PORT;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    /// Timings of the built-in protocols.
    pub protocol: ProtocolConfig,
    /// Admin shutdown secrets.
    pub admin: AdminConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("PBNET_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.admin.load_secrets()?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies overrides from `lookup`, which maps a variable name to its value.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        self.network.apply_overrides(&lookup);
        self.protocol.apply_overrides(&lookup);
        self.admin.apply_overrides(&lookup);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "network.max_connections must be positive".to_string(),
            ));
        }
        self.protocol.validate()
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Maximum concurrent endpoints.
    pub max_connections: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            max_connections: 1000,
        }
    }
}

impl NetworkConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(addr) = lookup("PBNET_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }

        if let Some(max) = lookup("PBNET_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }
    }
}

/// Protocol timing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Keepalive period in seconds.
    pub keepalive_secs: u64,
    /// How long a session start may wait for its reply, in seconds.
    pub handshake_timeout_secs: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        let settings = ProtocolSettings::default();
        Self {
            keepalive_secs: settings.keepalive_period.as_secs(),
            handshake_timeout_secs: settings.handshake_timeout.as_secs(),
        }
    }
}

impl ProtocolConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(secs) = lookup("PBNET_KEEPALIVE_SECS") {
            if let Ok(secs) = secs.parse() {
                self.keepalive_secs = secs;
            }
        }

        if let Some(secs) = lookup("PBNET_HANDSHAKE_TIMEOUT_SECS") {
            if let Ok(secs) = secs.parse() {
                self.handshake_timeout_secs = secs;
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.keepalive_secs == 0 {
            return Err(ConfigError::ValidationError(
                "protocol.keepalive_secs must be positive".to_string(),
            ));
        }
        if self.handshake_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "protocol.handshake_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn settings(&self) -> ProtocolSettings {
        ProtocolSettings {
            keepalive_period: Duration::from_secs(self.keepalive_secs),
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
        }
    }
}

/// Admin shutdown configuration.
///
/// With no secret configured, every shutdown request is rejected.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Valid secret hashes (SHA-256 hex strings).
    pub password_hashes: Vec<String>,
    /// Plaintext secret, hashed before use. Never written back to disk.
    #[serde(skip_serializing)]
    pub password: Option<String>,
    /// Optional file with one secret hash per line.
    pub secrets_file: Option<PathBuf>,
}

impl AdminConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(password) = lookup("PBNET_ADMIN_PASSWORD") {
            if !password.is_empty() {
                self.password = Some(password);
            }
        }

        if let Some(hash) = lookup("PBNET_ADMIN_PASSWORD_HASH") {
            if !hash.is_empty() {
                self.password_hashes.push(hash);
            }
        }

        if let Some(path) = lookup("PBNET_ADMIN_SECRETS_FILE") {
            self.secrets_file = Some(PathBuf::from(path));
        }
    }

    /// Appends the hashes from the secrets file, if configured.
    pub fn load_secrets(&mut self) -> Result<(), ConfigError> {
        if let Some(ref path) = self.secrets_file {
            let content =
                std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(path.clone(), e))?;
            for line in content.lines() {
                let line = line.trim();
                if !line.is_empty() && !line.starts_with('#') {
                    self.password_hashes.push(line.to_string());
                }
            }
        }
        Ok(())
    }

    pub fn validator(&self) -> SecretValidator {
        let plaintext = self
            .password
            .as_deref()
            .map(SecretValidator::hash_secret);
        SecretValidator::new(self.password_hashes.iter().cloned().chain(plaintext))
    }

    pub fn is_disabled(&self) -> bool {
        !self.validator().is_enabled()
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Serializes `SocketAddr` as a plain string in YAML.
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
