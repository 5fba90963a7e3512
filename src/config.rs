//! # Configuration Management
//!
//! Centralized configuration for LDAP connections.
//!
//! ## Configuration Sources
//! - TOML files via [`LdapConfig::from_file`]
//! - Direct instantiation with defaults
//! - Environment overrides via [`LdapConfig::from_env`]
//!
//! ## Example
//! ```toml
//! [client]
//! host = "ldap.example.com"
//! port = 636
//! use_tls = true
//! operation_timeout = 5000
//!
//! [tls]
//! ca_file = "/etc/ssl/ldap-ca.pem"
//! ```

use crate::core::codec::DEFAULT_MAX_MESSAGE_SIZE;
use crate::error::{LdapError, Result};
use crate::transport::tls::TlsClientConfig;
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Standard LDAP port
pub const DEFAULT_LDAP_PORT: u16 = 389;

/// Standard LDAPS port
pub const DEFAULT_LDAPS_PORT: u16 = 636;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct LdapConfig {
    /// Connection and dispatch settings
    #[serde(default)]
    pub client: ClientConfig,

    /// TLS settings for LDAPS and StartTLS
    #[serde(default)]
    pub tls: TlsSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl LdapConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            LdapError::ConfigError(format!("Failed to read config file {}: {e}", path.display()))
        })?;
        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| LdapError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables over the defaults.
    ///
    /// Unparseable values are reported rather than silently ignored.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("LDAP_PROTOCOL_HOST") {
            config.client.host = host;
        }

        if let Some(port) = env_parse::<u16>("LDAP_PROTOCOL_PORT")? {
            config.client.port = port;
        }

        if let Some(ms) = env_parse::<u64>("LDAP_PROTOCOL_CONNECT_TIMEOUT_MS")? {
            config.client.connection_timeout = Duration::from_millis(ms);
        }

        if let Some(ms) = env_parse::<u64>("LDAP_PROTOCOL_OPERATION_TIMEOUT_MS")? {
            config.client.operation_timeout = Duration::from_millis(ms);
        }

        if let Some(use_tls) = env_parse::<bool>("LDAP_PROTOCOL_USE_TLS")? {
            config.client.use_tls = use_tls;
        }

        if let Some(ms) = env_parse::<u64>("LDAP_PROTOCOL_POLL_INTERVAL_MS")? {
            config.client.poll_interval = Duration::from_millis(ms);
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| LdapError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| LdapError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.client.validate());
        errors.extend(self.tls.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(LdapError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }

    /// TLS client configuration for this server
    pub fn tls_client_config(&self) -> TlsClientConfig {
        self.tls.to_client_config(&self.client.host)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| LdapError::ConfigError(format!("Invalid value for {name}: '{raw}'"))),
        Err(_) => Ok(None),
    }
}

/// Connection and dispatch configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Directory server host name or address
    pub host: String,

    /// Directory server port
    pub port: u16,

    /// Connect with TLS from the start (LDAPS)
    pub use_tls: bool,

    /// Timeout for establishing the connection (and the LDAPS handshake)
    #[serde(with = "duration_serde")]
    pub connection_timeout: Duration,

    /// Deadline for each operation; zero disables deadlines
    #[serde(with = "duration_serde")]
    pub operation_timeout: Duration,

    /// How often the reader expires overdue requests
    #[serde(with = "duration_serde")]
    pub timeout_sweep_interval: Duration,

    /// Sleep between event-poller checks
    #[serde(with = "duration_serde")]
    pub poll_interval: Duration,

    /// Largest accepted or sent frame in bytes
    pub max_message_size: usize,

    /// Buffered unsolicited notifications per subscriber
    pub notification_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: String::from("localhost"),
            port: DEFAULT_LDAP_PORT,
            use_tls: false,
            connection_timeout: timeout::DEFAULT_TIMEOUT,
            operation_timeout: timeout::DEFAULT_OPERATION_TIMEOUT,
            timeout_sweep_interval: timeout::DEFAULT_SWEEP_INTERVAL,
            poll_interval: timeout::DEFAULT_POLL_INTERVAL,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            notification_capacity: 16,
        }
    }
}

impl ClientConfig {
    /// `host:port`
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.host.trim().is_empty() {
            errors.push("Host cannot be empty".to_string());
        }

        if self.port == 0 {
            errors.push("Port must be greater than 0".to_string());
        }

        if self.connection_timeout.as_millis() < 100 {
            errors.push("Connection timeout too short (minimum: 100ms)".to_string());
        } else if self.connection_timeout.as_secs() > 300 {
            errors.push("Connection timeout too long (maximum: 300s)".to_string());
        }

        // Zero disables the deadline
        if !self.operation_timeout.is_zero() && self.operation_timeout.as_millis() < 10 {
            errors.push("Operation timeout too short (minimum: 10ms, or 0 to disable)".to_string());
        }

        if self.timeout_sweep_interval.as_millis() < 10 {
            errors.push("Timeout sweep interval too short (minimum: 10ms)".to_string());
        }

        if self.poll_interval.as_millis() < 1 {
            errors.push("Poll interval must be at least 1ms".to_string());
        } else if self.poll_interval.as_secs() > 60 {
            errors.push("Poll interval too long (maximum: 60s)".to_string());
        }

        if self.max_message_size < 1024 {
            errors.push("Max message size too small (minimum: 1 KB)".to_string());
        } else if self.max_message_size > 256 * 1024 * 1024 {
            errors.push(format!(
                "Max message size too large: {} bytes (maximum: 256 MB)",
                self.max_message_size
            ));
        }

        if self.notification_capacity == 0 {
            errors.push("Notification capacity must be greater than 0".to_string());
        }

        errors
    }
}

/// TLS settings shared by LDAPS and StartTLS
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct TlsSettings {
    /// Name to verify instead of `client.host`
    pub server_name: Option<String>,

    /// PEM bundle of trusted CAs; native roots when absent
    pub ca_file: Option<String>,

    /// Client certificate for mTLS (requires `client_key_file`)
    pub client_cert_file: Option<String>,

    /// Client private key for mTLS (requires `client_cert_file`)
    pub client_key_file: Option<String>,

    /// Skip certificate verification (development only)
    pub insecure: bool,
}

impl TlsSettings {
    /// Validate TLS settings
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        match (&self.client_cert_file, &self.client_key_file) {
            (Some(_), None) => {
                errors.push("client_key_file must be set when client_cert_file is set".to_string())
            }
            (None, Some(_)) => {
                errors.push("client_cert_file must be set when client_key_file is set".to_string())
            }
            _ => {}
        }

        for (label, path) in [
            ("CA file", &self.ca_file),
            ("Client certificate file", &self.client_cert_file),
            ("Client key file", &self.client_key_file),
        ] {
            if let Some(path) = path {
                if !Path::new(path).exists() {
                    errors.push(format!("{label} does not exist: {path}"));
                }
            }
        }

        if self.insecure {
            errors.push(
                "WARNING: TLS certificate verification is disabled - not recommended for production"
                    .to_string(),
            );
        }

        errors
    }

    /// Build the TLS client configuration for `host`
    pub fn to_client_config(&self, host: &str) -> TlsClientConfig {
        let mut config =
            TlsClientConfig::new(self.server_name.clone().unwrap_or_else(|| host.to_string()));
        if let Some(ca) = &self.ca_file {
            config = config.with_ca_file(ca);
        }
        if let (Some(cert), Some(key)) = (&self.client_cert_file, &self.client_key_file) {
            config = config.with_client_certificate(cert, key);
        }
        if self.insecure {
            config = config.insecure();
        }
        config
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,

    /// Include the event target (module path) in each line
    pub show_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("ldap-protocol"),
            log_level: Level::INFO,
            json_format: false,
            show_target: true,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = LdapConfig::default();
        assert!(config.validate().is_empty(), "{:?}", config.validate());
        assert_eq!(config.client.port, 389);
        assert_eq!(config.client.max_message_size, 16 * 1024 * 1024);
        assert_eq!(config.client.address(), "localhost:389");
    }

    #[test]
    fn test_ipv6_address_is_bracketed() {
        let client = ClientConfig {
            host: "::1".into(),
            ..Default::default()
        };
        assert_eq!(client.address(), "[::1]:389");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = LdapConfig::from_toml(
            r#"
            [client]
            host = "ldap.example.com"
            operation_timeout = 0

            [logging]
            log_level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.client.host, "ldap.example.com");
        assert_eq!(config.client.port, 389);
        assert!(config.client.operation_timeout.is_zero());
        assert_eq!(config.logging.log_level, Level::DEBUG);
        assert!(config.validate_strict().is_ok());
    }

    #[test]
    fn test_tls_pairing_validation() {
        let settings = TlsSettings {
            client_cert_file: Some("/nonexistent/cert.pem".into()),
            ..Default::default()
        };
        let errors = settings.validate();
        assert!(errors.iter().any(|e| e.contains("client_key_file")));
        assert!(errors.iter().any(|e| e.contains("does not exist")));
    }

    #[test]
    fn test_tls_client_config_uses_server_name_override() {
        let config = LdapConfig::default_with_overrides(|c| {
            c.client.host = "10.0.0.5".into();
            c.tls.server_name = Some("ldap.internal".into());
        });
        assert!(config.tls_client_config().server_name().is_ok());
    }
}
