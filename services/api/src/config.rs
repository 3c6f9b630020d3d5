//! services/api/src/config.rs
//!
//! Defines the application's configuration structure and loading logic.
//!
//! All configuration is loaded from environment variables at startup. The `.env`
//! file is used for local development.

use std::net::SocketAddr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Twilio credentials. Present only when all three variables are set.
#[derive(Clone, Debug)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub from_number: String,
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    /// `None` selects the in-memory store.
    pub database_url: Option<String>,
    pub log_level: Level,
    pub frontend_url: Option<String>,
    pub twilio: Option<TwilioConfig>,
    pub fcm_server_key: Option<String>,
    pub notify_timeout: Duration,
    pub notify_max_attempts: u32,
    pub location_retention: chrono::Duration,
    pub retention_sweep_interval: Duration,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// It will look for a `.env` file in the current directory for development,
    /// but this is skipped in test environments to ensure tests are hermetic.
    pub fn from_env() -> Result<Self, ConfigError> {
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // --- Server and Database Settings ---
        let bind_address_str =
            lookup("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:5000".to_string());
        let bind_address = bind_address_str.parse::<SocketAddr>().map_err(|e| {
            ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string())
        })?;

        let database_url = lookup("DATABASE_URL").filter(|v| !v.trim().is_empty());

        let log_level_str = lookup("RUST_LOG").unwrap_or_else(|| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let frontend_url = lookup("FRONTEND_URL").filter(|v| !v.trim().is_empty());

        // --- Notification Providers (optional) ---
        let twilio = match (
            lookup("TWILIO_ACCOUNT_SID"),
            lookup("TWILIO_AUTH_TOKEN"),
            lookup("TWILIO_PHONE_NUMBER"),
        ) {
            (Some(account_sid), Some(auth_token), Some(from_number)) => Some(TwilioConfig {
                account_sid,
                auth_token,
                from_number,
            }),
            _ => None,
        };
        let fcm_server_key = lookup("FCM_SERVER_KEY").filter(|v| !v.trim().is_empty());

        // --- Delivery and Retention Tuning ---
        let notify_timeout = Duration::from_millis(parse_number(&lookup, "NOTIFY_TIMEOUT_MS", 5_000)?);
        let notify_max_attempts = parse_number(&lookup, "NOTIFY_MAX_ATTEMPTS", 3)?;
        if notify_max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "NOTIFY_MAX_ATTEMPTS".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        let retention_days: i64 = parse_number(&lookup, "LOCATION_RETENTION_DAYS", 30)?;
        if retention_days <= 0 {
            return Err(ConfigError::InvalidValue(
                "LOCATION_RETENTION_DAYS".to_string(),
                "must be positive".to_string(),
            ));
        }
        let sweep_secs: u64 = parse_number(&lookup, "RETENTION_SWEEP_SECS", 3_600)?;

        Ok(Self {
            bind_address,
            database_url,
            log_level,
            frontend_url,
            twilio,
            fcm_server_key,
            notify_timeout,
            notify_max_attempts,
            location_retention: chrono::Duration::days(retention_days),
            retention_sweep_interval: Duration::from_secs(sweep_secs.max(1)),
        })
    }
}

fn parse_number<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(key.to_string(), e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.bind_address.port(), 5000);
        assert!(config.database_url.is_none());
        assert!(config.twilio.is_none());
        assert_eq!(config.notify_timeout, Duration::from_millis(5_000));
        assert_eq!(config.notify_max_attempts, 3);
        assert_eq!(config.location_retention, chrono::Duration::days(30));
        assert_eq!(config.log_level, Level::INFO);
    }

    #[test]
    fn twilio_requires_all_three_variables() {
        let partial = config_from(&[("TWILIO_ACCOUNT_SID", "AC1"), ("TWILIO_AUTH_TOKEN", "t")]).unwrap();
        assert!(partial.twilio.is_none());

        let full = config_from(&[
            ("TWILIO_ACCOUNT_SID", "AC1"),
            ("TWILIO_AUTH_TOKEN", "t"),
            ("TWILIO_PHONE_NUMBER", "+15550001111"),
        ])
        .unwrap();
        assert_eq!(full.twilio.unwrap().from_number, "+15550001111");
    }

    #[test]
    fn invalid_values_are_reported_by_name() {
        match config_from(&[("NOTIFY_TIMEOUT_MS", "soon")]) {
            Err(ConfigError::InvalidValue(key, _)) => assert_eq!(key, "NOTIFY_TIMEOUT_MS"),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(config_from(&[("NOTIFY_MAX_ATTEMPTS", "0")]).is_err());
        assert!(config_from(&[("BIND_ADDRESS", "nowhere")]).is_err());
        assert!(config_from(&[("RUST_LOG", "chatty")]).is_err());
    }
}
