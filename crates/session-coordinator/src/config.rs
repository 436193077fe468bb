//! Session coordinator configuration.
//!
//! Configuration is loaded from environment variables. All sensitive
//! fields are redacted in Debug output.

use common::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use thiserror::Error;

/// Default HTTP/WebSocket bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Default SQLite database URL (file in the working directory).
pub const DEFAULT_DATABASE_URL: &str = "sqlite://tunetogether.db?mode=rwc";

/// Default graceful shutdown deadline in seconds.
pub const DEFAULT_SHUTDOWN_DEADLINE_SECONDS: u64 = 30;

/// Session coordinator configuration.
///
/// Loaded from environment variables with sensible defaults.
/// Sensitive fields are redacted in Debug output.
#[derive(Clone)]
pub struct Config {
    /// HTTP/WebSocket server bind address (default: "0.0.0.0:8080").
    pub bind_address: String,

    /// Database connection URL. May embed credentials, so it is
    /// protected by `SecretString` to prevent accidental logging.
    pub database_url: SecretString,

    /// Shared HMAC secret for verifying connection tokens.
    /// Protected by `SecretString` to prevent accidental logging.
    pub jwt_secret: SecretString,

    /// Graceful shutdown deadline in seconds (default: 30).
    pub shutdown_deadline_seconds: u64,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("database_url", &"[REDACTED]")
            .field("jwt_secret", &"[REDACTED]")
            .field("shutdown_deadline_seconds", &self.shutdown_deadline_seconds)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let jwt_secret = SecretString::from(
            vars.get("TT_JWT_SECRET")
                .ok_or_else(|| ConfigError::MissingEnvVar("TT_JWT_SECRET".to_string()))?
                .clone(),
        );

        let bind_address = vars
            .get("TT_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let database_url = SecretString::from(
            vars.get("TT_DATABASE_URL")
                .cloned()
                .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
        );

        let shutdown_deadline_seconds = match vars.get("TT_SHUTDOWN_DEADLINE_SECONDS") {
            Some(raw) => raw.parse().map_err(|_| {
                ConfigError::InvalidValue(format!(
                    "TT_SHUTDOWN_DEADLINE_SECONDS must be a non-negative integer, got '{raw}'"
                ))
            })?,
            None => DEFAULT_SHUTDOWN_DEADLINE_SECONDS,
        };

        Ok(Config {
            bind_address,
            database_url,
            jwt_secret,
            shutdown_deadline_seconds,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::secret::ExposeSecret;

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([(
            "TT_JWT_SECRET".to_string(),
            "test-signing-secret-0123456789abcdef".to_string(),
        )])
    }

    #[test]
    fn test_from_vars_success_with_defaults() {
        let vars = base_vars();

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.bind_address, DEFAULT_BIND_ADDRESS);
        assert_eq!(config.database_url.expose_secret(), DEFAULT_DATABASE_URL);
        assert_eq!(
            config.shutdown_deadline_seconds,
            DEFAULT_SHUTDOWN_DEADLINE_SECONDS
        );
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let mut vars = base_vars();
        vars.insert("TT_BIND_ADDRESS".to_string(), "127.0.0.1:9090".to_string());
        vars.insert(
            "TT_DATABASE_URL".to_string(),
            "sqlite:///data/projects.db".to_string(),
        );
        vars.insert("TT_SHUTDOWN_DEADLINE_SECONDS".to_string(), "10".to_string());

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.bind_address, "127.0.0.1:9090");
        assert_eq!(
            config.database_url.expose_secret(),
            "sqlite:///data/projects.db"
        );
        assert_eq!(config.shutdown_deadline_seconds, 10);
    }

    #[test]
    fn test_from_vars_rejects_bad_deadline() {
        let mut vars = base_vars();
        vars.insert(
            "TT_SHUTDOWN_DEADLINE_SECONDS".to_string(),
            "soon".to_string(),
        );

        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_from_vars_missing_jwt_secret() {
        let vars = HashMap::new();

        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(v)) if v == "TT_JWT_SECRET"));
    }

    #[test]
    fn test_debug_redacts_sensitive_fields() {
        let mut vars = base_vars();
        vars.insert(
            "TT_DATABASE_URL".to_string(),
            "postgres://user:hunter2@db/projects".to_string(),
        );
        let config = Config::from_vars(&vars).expect("Config should load successfully");

        let debug_output = format!("{config:?}");

        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("hunter2"));
        assert!(!debug_output.contains("0123456789abcdef"));
    }
}
