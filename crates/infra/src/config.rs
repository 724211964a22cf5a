//! Runtime configuration from environment variables.
//!
//! | Variable                     | Default                  |
//! |------------------------------|--------------------------|
//! | `REDIS_URL`                  | `redis://127.0.0.1:6379` |
//! | `HORIZON_KEY_PREFIX`         | `horizon`                |
//! | `HORIZON_CONSUMER_NAME`      | `worker-1`               |
//! | `HORIZON_RECONNECT_ATTEMPTS` | `5`                      |
//! | `HORIZON_RECONNECT_BASE_MS`  | `1000`                   |
//! | `HORIZON_PUBLISH_TIMEOUT_MS` | `5000`                   |
//! | `HORIZON_VALIDATE_EVENTS`    | `true`                   |

use std::str::FromStr;
use std::time::Duration;

use crate::event_bus::ReconnectPolicy;
use crate::publisher::DEFAULT_PUBLISH_TIMEOUT;

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
pub const DEFAULT_KEY_PREFIX: &str = "horizon";
pub const DEFAULT_CONSUMER_NAME: &str = "worker-1";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HorizonConfig {
    pub redis_url: String,
    pub key_prefix: String,
    /// Member name used when joining consumer groups.
    pub consumer_name: String,
    pub reconnect: ReconnectPolicy,
    /// Upper bound on one transport's publish call.
    pub publish_timeout: Duration,
    /// Validate payloads against the schema registry before publishing.
    pub validate_events: bool,
}

impl Default for HorizonConfig {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            consumer_name: DEFAULT_CONSUMER_NAME.to_string(),
            reconnect: ReconnectPolicy::default(),
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            validate_events: true,
        }
    }
}

impl HorizonConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source. Unset variables fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let redis_url = lookup("REDIS_URL").unwrap_or_else(|| {
            tracing::warn!("REDIS_URL not set; using {DEFAULT_REDIS_URL}");
            defaults.redis_url.clone()
        });
        let key_prefix = lookup("HORIZON_KEY_PREFIX").unwrap_or(defaults.key_prefix);
        let consumer_name = lookup("HORIZON_CONSUMER_NAME").unwrap_or_else(|| {
            tracing::warn!("HORIZON_CONSUMER_NAME not set; using {DEFAULT_CONSUMER_NAME}");
            defaults.consumer_name.clone()
        });

        let max_attempts = parse(&lookup, "HORIZON_RECONNECT_ATTEMPTS")?.unwrap_or(defaults.reconnect.max_attempts);
        let base_ms: Option<u64> = parse(&lookup, "HORIZON_RECONNECT_BASE_MS")?;
        let base_delay = base_ms.map_or(defaults.reconnect.base_delay, Duration::from_millis);
        let timeout_ms: Option<u64> = parse(&lookup, "HORIZON_PUBLISH_TIMEOUT_MS")?;
        let publish_timeout = timeout_ms.map_or(defaults.publish_timeout, Duration::from_millis);
        let validate_events = parse(&lookup, "HORIZON_VALIDATE_EVENTS")?.unwrap_or(defaults.validate_events);

        if max_attempts == 0 {
            return Err(ConfigError::Invalid {
                var: "HORIZON_RECONNECT_ATTEMPTS",
                value: "0".to_string(),
                reason: "at least one attempt is required".to_string(),
            });
        }

        if publish_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                var: "HORIZON_PUBLISH_TIMEOUT_MS",
                value: "0".to_string(),
                reason: "timeout must be positive".to_string(),
            });
        }

        Ok(Self {
            redis_url,
            key_prefix,
            consumer_name,
            reconnect: ReconnectPolicy::exponential(max_attempts, base_delay),
            publish_timeout,
            validate_events,
        })
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    lookup(var)
        .map(|value| {
            value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                var,
                reason: e.to_string(),
                value,
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| vars.get(k).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = HorizonConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, HorizonConfig::default());
    }

    #[test]
    fn reads_overrides() {
        let config = HorizonConfig::from_lookup(lookup(&[
            ("REDIS_URL", "redis://cache:6379"),
            ("HORIZON_KEY_PREFIX", "staging"),
            ("HORIZON_RECONNECT_ATTEMPTS", "3"),
            ("HORIZON_RECONNECT_BASE_MS", "250"),
            ("HORIZON_PUBLISH_TIMEOUT_MS", "750"),
            ("HORIZON_VALIDATE_EVENTS", "false"),
        ]))
        .unwrap();

        assert_eq!(config.redis_url, "redis://cache:6379");
        assert_eq!(config.key_prefix, "staging");
        assert_eq!(config.reconnect.max_attempts, 3);
        assert_eq!(config.reconnect.base_delay, Duration::from_millis(250));
        assert_eq!(config.publish_timeout, Duration::from_millis(750));
        assert!(!config.validate_events);
    }

    #[test]
    fn rejects_malformed_values() {
        let err = HorizonConfig::from_lookup(lookup(&[("HORIZON_RECONNECT_ATTEMPTS", "many")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "HORIZON_RECONNECT_ATTEMPTS", .. }));

        assert!(HorizonConfig::from_lookup(lookup(&[("HORIZON_RECONNECT_ATTEMPTS", "0")])).is_err());
        assert!(HorizonConfig::from_lookup(lookup(&[("HORIZON_VALIDATE_EVENTS", "yes")])).is_err());
        assert!(HorizonConfig::from_lookup(lookup(&[("HORIZON_PUBLISH_TIMEOUT_MS", "0")])).is_err());
    }
}
