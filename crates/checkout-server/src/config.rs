//! Server Configuration
//!
//! Read from the environment (after `.env` is loaded). Every value has a
//! default except the Stripe credentials, which live in `StripeConfig`.

use std::time::Duration;

use checkout_payments::guard::{DEFAULT_LIMIT, DEFAULT_TOKEN_TTL_SECS, DEFAULT_WINDOW_SECS};
use checkout_payments::webhook::DEFAULT_PROCESSING_LEASE_SECS;
use checkout_payments::{DEFAULT_ATTEMPT_LIMIT, LimiterFailurePolicy, Pricing};

#[derive(Debug, thiserror::Error)]
#[error("invalid {key}: {message}")]
pub struct ConfigError {
    pub key: &'static str,
    pub message: String,
}

#[derive(Clone)]
pub struct ServerConfig {
    pub bind_addr: String,

    /// Signs CSRF tokens; `None` means a per-process secret is generated
    pub csrf_secret: Option<String>,
    pub csrf_ttl: chrono::Duration,

    /// Requests per session and window on guarded routes
    pub rate_limit: u32,
    pub rate_window: chrono::Duration,
    pub rate_limit_failure: LimiterFailurePolicy,

    /// Checkout attempts per session and hour, counted from analytics
    pub attempt_limit: u32,

    pub request_timeout: Duration,

    /// How long an unfinished webhook delivery holds its event id
    pub webhook_lease: chrono::Duration,

    pub pricing: Pricing,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("csrf_secret", &self.csrf_secret.as_ref().map(|_| "<redacted>"))
            .field("csrf_ttl", &self.csrf_ttl)
            .field("rate_limit", &self.rate_limit)
            .field("rate_window", &self.rate_window)
            .field("rate_limit_failure", &self.rate_limit_failure)
            .field("attempt_limit", &self.attempt_limit)
            .field("request_timeout", &self.request_timeout)
            .field("webhook_lease", &self.webhook_lease)
            .field("pricing", &self.pricing)
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".into(),
            csrf_secret: None,
            csrf_ttl: chrono::Duration::seconds(DEFAULT_TOKEN_TTL_SECS),
            rate_limit: DEFAULT_LIMIT,
            rate_window: chrono::Duration::seconds(DEFAULT_WINDOW_SECS),
            rate_limit_failure: LimiterFailurePolicy::FailClosed,
            attempt_limit: DEFAULT_ATTEMPT_LIMIT,
            request_timeout: Duration::from_secs(30),
            webhook_lease: chrono::Duration::seconds(DEFAULT_PROCESSING_LEASE_SECS),
            pricing: Pricing::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let csrf_ttl_secs: i64 = parse(&get, "CSRF_TOKEN_TTL_SECS", DEFAULT_TOKEN_TTL_SECS)?;
        let window_secs: i64 = parse(&get, "RATE_LIMIT_WINDOW_SECS", DEFAULT_WINDOW_SECS)?;
        if csrf_ttl_secs <= 0 || window_secs <= 0 {
            return Err(ConfigError {
                key: if csrf_ttl_secs <= 0 {
                    "CSRF_TOKEN_TTL_SECS"
                } else {
                    "RATE_LIMIT_WINDOW_SECS"
                },
                message: "must be positive".into(),
            });
        }

        let request_timeout_secs: u64 = parse(&get, "REQUEST_TIMEOUT_SECS", 30)?;
        let lease_secs: i64 = parse(&get, "WEBHOOK_PROCESSING_LEASE_SECS", DEFAULT_PROCESSING_LEASE_SECS)?;
        // A lease shorter than a request could hand a live delivery's event to a redelivery.
        if !u64::try_from(lease_secs).is_ok_and(|lease| lease > request_timeout_secs) {
            return Err(ConfigError {
                key: "WEBHOOK_PROCESSING_LEASE_SECS",
                message: format!("must exceed REQUEST_TIMEOUT_SECS ({request_timeout_secs})"),
            });
        }

        let rate_limit_failure = match get("RATE_LIMIT_FAILURE_POLICY") {
            Some(raw) => raw.parse().map_err(|message| ConfigError {
                key: "RATE_LIMIT_FAILURE_POLICY",
                message,
            })?,
            None => defaults.rate_limit_failure,
        };

        let pricing = Pricing {
            base_fee: parse(&get, "BASE_FEE_CENTS", defaults.pricing.base_fee)?,
            addon_fee: parse(&get, "ADDON_FEE_CENTS", defaults.pricing.addon_fee)?,
            currency: get("CURRENCY").map_or(defaults.pricing.currency, |c| c.to_uppercase()),
        };

        Ok(Self {
            bind_addr: get("BIND_ADDR").unwrap_or(defaults.bind_addr),
            csrf_secret: get("CSRF_SECRET"),
            csrf_ttl: chrono::Duration::seconds(csrf_ttl_secs),
            rate_limit: parse(&get, "RATE_LIMIT_MAX", DEFAULT_LIMIT)?,
            rate_window: chrono::Duration::seconds(window_secs),
            rate_limit_failure,
            attempt_limit: parse(&get, "CHECKOUT_ATTEMPT_LIMIT", DEFAULT_ATTEMPT_LIMIT)?,
            request_timeout: Duration::from_secs(request_timeout_secs),
            webhook_lease: chrono::Duration::seconds(lease_secs),
            pricing,
        })
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    get(key).map_or(Ok(default), |raw| {
        raw.parse().map_err(|e: T::Err| ConfigError {
            key,
            message: format!("{raw:?}: {e}"),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<ServerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:3000");
        assert_eq!(config.rate_limit, 5);
        assert_eq!(config.rate_window, chrono::Duration::hours(1));
        assert_eq!(config.rate_limit_failure, LimiterFailurePolicy::FailClosed);
        assert_eq!(config.pricing, Pricing::default());
        assert!(config.csrf_secret.is_none());
        assert_eq!(config.webhook_lease, chrono::Duration::minutes(5));
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("BIND_ADDR", "127.0.0.1:8080"),
            ("CSRF_SECRET", "s3cret"),
            ("RATE_LIMIT_MAX", "10"),
            ("RATE_LIMIT_FAILURE_POLICY", "open"),
            ("BASE_FEE_CENTS", "4000"),
            ("CURRENCY", "usd"),
            ("REQUEST_TIMEOUT_SECS", "5"),
        ])
        .unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.csrf_secret.as_deref(), Some("s3cret"));
        assert_eq!(config.rate_limit, 10);
        assert_eq!(config.rate_limit_failure, LimiterFailurePolicy::FailOpen);
        assert_eq!(config.pricing.base_fee, 4000);
        assert_eq!(config.pricing.currency, "USD");
        assert_eq!(config.request_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_bad_values_name_the_key() {
        let err = config(&[("RATE_LIMIT_MAX", "lots")]).unwrap_err();
        assert_eq!(err.key, "RATE_LIMIT_MAX");

        let err = config(&[("RATE_LIMIT_WINDOW_SECS", "0")]).unwrap_err();
        assert_eq!(err.key, "RATE_LIMIT_WINDOW_SECS");

        let err = config(&[("RATE_LIMIT_FAILURE_POLICY", "maybe")]).unwrap_err();
        assert_eq!(err.key, "RATE_LIMIT_FAILURE_POLICY");

        let err = config(&[("REQUEST_TIMEOUT_SECS", "60"), ("WEBHOOK_PROCESSING_LEASE_SECS", "60")])
            .unwrap_err();
        assert_eq!(err.key, "WEBHOOK_PROCESSING_LEASE_SECS");
    }

    #[test]
    fn test_debug_hides_secret() {
        let config = config(&[("CSRF_SECRET", "s3cret")]).unwrap();
        assert!(!format!("{config:?}").contains("s3cret"));
    }
}
