//! Node configuration
//!
//! Defaults match the deployed protocol parameters; individual fields can
//! be overridden through `WEFT_*` environment variables and are validated
//! before a node starts.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

mod error;

pub use error::ConfigError;

/// Runtime configuration for one overlay node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayConfig {
    /// Host to bind and advertise.
    pub host: String,

    /// Port to bind; 0 picks an ephemeral port.
    pub port: u16,

    /// Seed node address to join through; None starts a standalone overlay.
    pub seed: Option<String>,

    /// Per-call RPC deadline.
    #[serde(with = "humantime_serde")]
    pub rpc_timeout: Duration,

    /// Interval between republish attempts for advertised keys.
    #[serde(with = "humantime_serde")]
    pub republish_interval: Duration,

    /// Lifetime of a location entry absent re-registration.
    #[serde(with = "humantime_serde")]
    pub object_timeout: Duration,

    /// Retry budget for publish, lookup and register attempts.
    pub retries: usize,

    /// Peers kept per level while traversing backpointers on join.
    pub neighbor_set_size: usize,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        OverlayConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            seed: None,
            rpc_timeout: Duration::from_secs(5),
            republish_interval: Duration::from_secs(10),
            object_timeout: Duration::from_secs(25),
            retries: 3,
            neighbor_set_size: 10,
        }
    }
}

impl OverlayConfig {
    /// Defaults with `WEFT_*` environment overrides applied. Durations are
    /// given in whole seconds.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(host) = env::var("WEFT_HOST") {
            config.host = host;
        }
        if let Ok(port) = env::var("WEFT_PORT") {
            config.port = parse_env("WEFT_PORT", &port)?;
        }
        if let Ok(seed) = env::var("WEFT_SEED") {
            if !seed.is_empty() {
                config.seed = Some(seed);
            }
        }
        if let Ok(secs) = env::var("WEFT_RPC_TIMEOUT") {
            config.rpc_timeout = Duration::from_secs(parse_env("WEFT_RPC_TIMEOUT", &secs)?);
        }
        if let Ok(secs) = env::var("WEFT_REPUBLISH_INTERVAL") {
            config.republish_interval =
                Duration::from_secs(parse_env("WEFT_REPUBLISH_INTERVAL", &secs)?);
        }
        if let Ok(secs) = env::var("WEFT_OBJECT_TIMEOUT") {
            config.object_timeout = Duration::from_secs(parse_env("WEFT_OBJECT_TIMEOUT", &secs)?);
        }
        if let Ok(retries) = env::var("WEFT_RETRIES") {
            config.retries = parse_env("WEFT_RETRIES", &retries)?;
        }
        if let Ok(k) = env::var("WEFT_NEIGHBOR_SET_SIZE") {
            config.neighbor_set_size = parse_env("WEFT_NEIGHBOR_SET_SIZE", &k)?;
        }
        Ok(config)
    }

    /// Check the configuration for values a node cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::InvalidValue("host must not be empty".into()));
        }
        if self.retries == 0 {
            return Err(ConfigError::InvalidValue(
                "retries must be at least 1".into(),
            ));
        }
        if self.neighbor_set_size == 0 {
            return Err(ConfigError::InvalidValue(
                "neighbor_set_size must be at least 1".into(),
            ));
        }
        if self.rpc_timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "rpc_timeout must be positive".into(),
            ));
        }
        if self.object_timeout <= self.republish_interval {
            return Err(ConfigError::ValidationFailed(
                "object_timeout must exceed republish_interval or entries expire between republishes"
                    .into(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::ParseError(format!("invalid value {:?} for {}", value, name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_parameters() {
        let config = OverlayConfig::default();
        assert_eq!(config.rpc_timeout, Duration::from_secs(5));
        assert_eq!(config.republish_interval, Duration::from_secs(10));
        assert_eq!(config.object_timeout, Duration::from_secs(25));
        assert_eq!(config.retries, 3);
        assert_eq!(config.neighbor_set_size, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_retries() {
        let config = OverlayConfig {
            retries: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_expiry_shorter_than_republish() {
        let config = OverlayConfig {
            republish_interval: Duration::from_secs(30),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serde_round_trip_with_humantime_durations() {
        let config = OverlayConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"rpc_timeout\":\"5s\""));
        let decoded: OverlayConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.rpc_timeout, config.rpc_timeout);
        assert_eq!(decoded.object_timeout, config.object_timeout);
    }
}
