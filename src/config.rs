use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {name}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Redis,
}

impl FromStr for StoreBackend {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "redis" => Ok(StoreBackend::Redis),
            _ => Err(()),
        }
    }
}

/// Bounded retry for contended allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Doubled after every retry.
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    pub fn backoff(&self, retry: u32) -> Duration {
        self.initial_backoff.saturating_mul(1u32 << retry.min(16))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_millis(25),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    pub retry: RetryPolicy,
    /// Rejects resets that do not carry an explicit confirmation.
    pub require_reset_confirmation: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub store: StoreBackend,
    pub redis_url: String,
    pub redis_prefix: String,
    /// Bound on counter lock waits and on individual store calls.
    pub lock_timeout: Duration,
    pub service: ServiceConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "0.0.0.0".into(),
            port: 8080,
            store: StoreBackend::Memory,
            redis_url: "redis://127.0.0.1:6379/".into(),
            redis_prefix: "docnum".into(),
            lock_timeout: Duration::from_millis(2000),
            service: ServiceConfig::default(),
        }
    }
}

impl Config {
    /// Reads:
    /// - `DOCNUM_HOST`, `DOCNUM_PORT`: listen address (default 0.0.0.0:8080)
    /// - `DOCNUM_STORE`: `memory` or `redis` (default memory)
    /// - `DOCNUM_REDIS_URL`, `DOCNUM_REDIS_PREFIX`
    /// - `DOCNUM_LOCK_TIMEOUT_MS` (default 2000)
    /// - `DOCNUM_MAX_RETRIES` (default 3), `DOCNUM_RETRY_BACKOFF_MS` (default 25)
    /// - `DOCNUM_REQUIRE_RESET_CONFIRMATION` (default false)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let default = Config::default();

        let number = |name: &'static str, fallback: u64| -> Result<u64, ConfigError> {
            match lookup(name) {
                Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid { name, value }),
                None => Ok(fallback),
            }
        };

        let port = number("DOCNUM_PORT", u64::from(default.port))?;
        let port = u16::try_from(port).map_err(|_| ConfigError::Invalid {
            name: "DOCNUM_PORT",
            value: port.to_string(),
        })?;

        let store = match lookup("DOCNUM_STORE") {
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
                name: "DOCNUM_STORE",
                value,
            })?,
            None => default.store,
        };

        let require_reset_confirmation = match lookup("DOCNUM_REQUIRE_RESET_CONFIRMATION") {
            Some(value) => match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => {
                    return Err(ConfigError::Invalid {
                        name: "DOCNUM_REQUIRE_RESET_CONFIRMATION",
                        value,
                    })
                }
            },
            None => default.service.require_reset_confirmation,
        };

        let max_retries = number("DOCNUM_MAX_RETRIES", u64::from(default.service.retry.max_retries))?;
        let max_retries = u32::try_from(max_retries).map_err(|_| ConfigError::Invalid {
            name: "DOCNUM_MAX_RETRIES",
            value: max_retries.to_string(),
        })?;

        Ok(Config {
            host: lookup("DOCNUM_HOST").unwrap_or(default.host),
            port,
            store,
            redis_url: lookup("DOCNUM_REDIS_URL").unwrap_or(default.redis_url),
            redis_prefix: lookup("DOCNUM_REDIS_PREFIX").unwrap_or(default.redis_prefix),
            lock_timeout: Duration::from_millis(number(
                "DOCNUM_LOCK_TIMEOUT_MS",
                default.lock_timeout.as_millis() as u64,
            )?),
            service: ServiceConfig {
                retry: RetryPolicy {
                    max_retries,
                    initial_backoff: Duration::from_millis(number(
                        "DOCNUM_RETRY_BACKOFF_MS",
                        default.service.retry.initial_backoff.as_millis() as u64,
                    )?),
                },
                require_reset_confirmation,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults_apply_when_unset() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.store, StoreBackend::Memory);
        assert_eq!(config.lock_timeout, Duration::from_secs(2));
        assert_eq!(config.service.retry, RetryPolicy::default());
        assert!(!config.service.require_reset_confirmation);
    }

    #[test]
    fn test_overrides_are_parsed() {
        let config = Config::from_lookup(lookup(&[
            ("DOCNUM_PORT", "9090"),
            ("DOCNUM_STORE", "Redis"),
            ("DOCNUM_LOCK_TIMEOUT_MS", "150"),
            ("DOCNUM_MAX_RETRIES", "5"),
            ("DOCNUM_REQUIRE_RESET_CONFIRMATION", "true"),
        ]))
        .unwrap();
        assert_eq!(config.port, 9090);
        assert_eq!(config.store, StoreBackend::Redis);
        assert_eq!(config.lock_timeout, Duration::from_millis(150));
        assert_eq!(config.service.retry.max_retries, 5);
        assert!(config.service.require_reset_confirmation);
    }

    #[test]
    fn test_garbage_is_a_startup_error() {
        let err = Config::from_lookup(lookup(&[("DOCNUM_STORE", "postgres")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                name: "DOCNUM_STORE",
                value: "postgres".into()
            }
        );
        assert!(Config::from_lookup(lookup(&[("DOCNUM_PORT", "70000")])).is_err());
        assert!(Config::from_lookup(lookup(&[("DOCNUM_MAX_RETRIES", "-1")])).is_err());
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_millis(10),
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(10));
        assert_eq!(policy.backoff(2), Duration::from_millis(40));
    }
}
