//! Server configuration from environment variables

use std::env;
use std::net::SocketAddr;

use chrono::FixedOffset;

use crate::error::ConfigError;

/// Runtime configuration for the tracker service
///
/// Loaded from environment variables with defaults.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,

    /// Zone used to turn event timestamps into day keys.
    /// `None` means the process-local zone.
    pub utc_offset: Option<FixedOffset>,

    /// Upper bound for `/trackTest/getTimeout` delays in milliseconds
    pub max_test_delay_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            utc_offset: None,
            max_test_delay_ms: 60_000,
        }
    }
}

impl ServerConfig {
    /// Environment variables:
    /// - `TRACKER_BIND_ADDR` (default: 127.0.0.1:3000)
    /// - `TRACKER_UTC_OFFSET` (e.g. `+08:00`; default: process-local zone)
    /// - `TRACKER_MAX_TEST_DELAY_MS` (default: 60000)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let bind_addr = match lookup("TRACKER_BIND_ADDR") {
            Some(raw) => raw.parse::<SocketAddr>().map_err(|err| ConfigError::Invalid {
                name: "TRACKER_BIND_ADDR",
                value: raw.clone(),
                reason: err.to_string(),
            })?,
            None => defaults.bind_addr,
        };

        let utc_offset = match lookup("TRACKER_UTC_OFFSET") {
            Some(raw) => Some(raw.parse::<FixedOffset>().map_err(|err| ConfigError::Invalid {
                name: "TRACKER_UTC_OFFSET",
                value: raw.clone(),
                reason: err.to_string(),
            })?),
            None => None,
        };

        let max_test_delay_ms = match lookup("TRACKER_MAX_TEST_DELAY_MS") {
            Some(raw) => raw.parse::<u64>().map_err(|err| ConfigError::Invalid {
                name: "TRACKER_MAX_TEST_DELAY_MS",
                value: raw.clone(),
                reason: err.to_string(),
            })?,
            None => defaults.max_test_delay_ms,
        };

        Ok(Self {
            bind_addr,
            utc_offset,
            max_test_delay_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = ServerConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.bind_addr, SocketAddr::from(([127, 0, 0, 1], 3000)));
        assert!(config.utc_offset.is_none());
        assert_eq!(config.max_test_delay_ms, 60_000);
    }

    #[test]
    fn test_overrides() {
        let config = ServerConfig::from_lookup(lookup_from(&[
            ("TRACKER_BIND_ADDR", "0.0.0.0:8080"),
            ("TRACKER_UTC_OFFSET", "+08:00"),
            ("TRACKER_MAX_TEST_DELAY_MS", "250"),
        ]))
        .unwrap();

        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.utc_offset.map(|o| o.local_minus_utc()), Some(8 * 3600));
        assert_eq!(config.max_test_delay_ms, 250);
    }

    #[test]
    fn test_invalid_offset_is_rejected() {
        let err = ServerConfig::from_lookup(lookup_from(&[("TRACKER_UTC_OFFSET", "tomorrow")]))
            .unwrap_err();
        assert!(err.to_string().contains("TRACKER_UTC_OFFSET"));
    }
}
