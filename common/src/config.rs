// common/src/config.rs
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use config::{Config as ConfigFile, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::crypto::AES_KEY_LEN;
use crate::error::ConfigError;

/// Default listener port.
pub const DEFAULT_PORT: u16 = 31313;
/// Default authorization window: a pairing that has not finished by then is
/// reaped.
pub const DEFAULT_AUTH_WINDOW_SECS: u64 = 60;
/// Default interval between liveness pings; a connection that missed the
/// previous pong is dropped on the next tick.
pub const DEFAULT_PING_INTERVAL_SECS: u64 = 25;

/// Broker construction parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Enables structured logging to stdout.
    pub debug: bool,
    /// Listener port.
    pub port: u16,
    /// Relying-party project id, echoed in the `AUTH_INIT` payload. Must be
    /// a valid UUID.
    pub project_id: String,
    /// Base64 of the 32-byte AES key that wraps session ids into tokens.
    pub secret_code: String,
    /// Opaque string echoed in `CHALLENGE`, telling the authenticator which
    /// profile fields to include in `AUTH`.
    pub fields: String,
    /// Optional TLS material; plaintext listener when absent.
    pub ssl: Option<SslConfig>,
    pub auth_window_secs: u64,
    pub ping_interval_secs: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SslConfig {
    /// Path to the PEM private key.
    pub key: String,
    /// Path to the PEM certificate chain.
    pub cert: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            debug: false,
            port: DEFAULT_PORT,
            project_id: Uuid::nil().to_string(),
            secret_code: BASE64.encode([0u8; AES_KEY_LEN]),
            fields: String::new(),
            ssl: None,
            auth_window_secs: DEFAULT_AUTH_WINDOW_SECS,
            ping_interval_secs: DEFAULT_PING_INTERVAL_SECS,
        }
    }
}

impl BrokerConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self, config::ConfigError> {
        // Get the run mode, defaulting to "development"
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        // Locate the config directory
        let config_dir = env::var("CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                // Check if we're in the project root or a subcrate
                let mut path = PathBuf::from("./config");
                if !path.exists() {
                    path = PathBuf::from("../config");
                }
                path
            });

        tracing::info!("Loading configuration from {}", config_dir.display());
        tracing::info!("Using run mode: {}", run_mode);

        let config = ConfigFile::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(File::from(config_dir.join(format!("{}.toml", run_mode))).required(false))
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(Environment::with_prefix("APP").separator("__"))
            .build()?
            .try_deserialize()?;

        Ok(config)
    }

    /// Load from environment variables directly, falling back to defaults.
    pub fn from_env() -> Self {
        match Self::load() {
            Ok(config) => {
                tracing::info!("Configuration loaded from files and environment");
                config
            }
            Err(e) => {
                tracing::warn!("Failed to load configuration from files: {}", e);
                tracing::info!("Falling back to environment variables only");

                let defaults = Self::default();

                let port = env::var("BROKER_PORT")
                    .ok()
                    .and_then(|v| v.parse::<u16>().ok())
                    .unwrap_or(DEFAULT_PORT);

                let debug = env::var("BROKER_DEBUG")
                    .map(|v| v.to_lowercase() == "true")
                    .unwrap_or(false);

                Self {
                    debug,
                    port,
                    project_id: env::var("BROKER_PROJECT_ID").unwrap_or(defaults.project_id),
                    secret_code: env::var("BROKER_SECRET_CODE").unwrap_or(defaults.secret_code),
                    fields: env::var("BROKER_FIELDS").unwrap_or_default(),
                    ssl: None,
                    auth_window_secs: DEFAULT_AUTH_WINDOW_SECS,
                    ping_interval_secs: DEFAULT_PING_INTERVAL_SECS,
                }
            }
        }
    }

    /// Check the closed-set options and derive the parsed material. Broker
    /// construction fails on a bad project id or secret code.
    pub fn validate(&self) -> Result<ValidatedSecrets, ConfigError> {
        let project_id = Uuid::parse_str(&self.project_id)
            .map_err(|_| ConfigError::InvalidProjectId(self.project_id.clone()))?;

        let raw = BASE64
            .decode(&self.secret_code)
            .map_err(|_| ConfigError::InvalidSecretCode {
                expected: AES_KEY_LEN,
            })?;
        let cipher_key: [u8; AES_KEY_LEN] =
            raw.try_into().map_err(|_| ConfigError::InvalidSecretCode {
                expected: AES_KEY_LEN,
            })?;

        Ok(ValidatedSecrets {
            project_id,
            cipher_key,
        })
    }

    pub fn auth_window(&self) -> Duration {
        Duration::from_secs(self.auth_window_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
}

/// Material derived from a validated configuration.
#[derive(Clone, Debug)]
pub struct ValidatedSecrets {
    pub project_id: Uuid,
    pub cipher_key: [u8; AES_KEY_LEN],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let secrets = BrokerConfig::default().validate().unwrap();
        assert_eq!(secrets.project_id, Uuid::nil());
        assert_eq!(secrets.cipher_key, [0u8; AES_KEY_LEN]);
    }

    #[test]
    fn bad_project_id_fails_validation() {
        let config = BrokerConfig {
            project_id: "not-a-uuid".into(),
            ..BrokerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidProjectId(_))
        ));
    }

    #[test]
    fn short_secret_code_fails_validation() {
        let config = BrokerConfig {
            secret_code: BASE64.encode([1u8; 16]),
            ..BrokerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSecretCode { .. })
        ));
    }
}
