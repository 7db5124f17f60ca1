//! Runtime configuration.
//!
//! Every component carries its own `*Config` with defaults; [`RuntimeConfig`]
//! bundles them and overlays `CHATBOT_*` environment variables.

use crate::admission::AdmissionConfig;
use crate::cache::ResponseCacheConfig;
use crate::pool::{AutoScalerConfig, PoolConfig};
use crate::resilience::circuit_breaker::CircuitBreakerConfig;
use crate::resilience::rate_limiter::RateLimitConfig;
use crate::resilience::retry::RetryPolicy;
use crate::tokens::TokenBudgetConfig;
use crate::{Error, ErrorContext, Result};
use std::str::FromStr;
use std::time::Duration;

/// Periods of the background maintenance tasks.
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Pool eviction, replenishment and auto-scaling.
    pub resource_interval: Duration,
    pub cache_sweep_interval: Duration,
    /// Rate-window and token-budget garbage collection.
    pub limiter_sweep_interval: Duration,
    /// Periodic `info` status line.
    pub status_log_interval: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            resource_interval: Duration::from_secs(30),
            cache_sweep_interval: Duration::from_secs(15 * 60),
            limiter_sweep_interval: Duration::from_secs(10 * 60),
            status_log_interval: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    pub pool: PoolConfig,
    pub admission: AdmissionConfig,
    pub scaler: AutoScalerConfig,
    pub breaker: CircuitBreakerConfig,
    pub rate_limit: RateLimitConfig,
    pub budget: TokenBudgetConfig,
    pub cache: ResponseCacheConfig,
    pub retry: RetryPolicy,
    pub maintenance: MaintenanceConfig,
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overlaid with the process environment.
    ///
    /// - `CHATBOT_MAX_CONNECTIONS` / `CHATBOT_MIN_CONNECTIONS`
    /// - `CHATBOT_ACQUIRE_TIMEOUT`, `CHATBOT_IDLE_TIMEOUT`, `CHATBOT_MAX_LIFETIME` (ms)
    /// - `CHATBOT_MAX_CONCURRENT`
    /// - `CHATBOT_AUTO_SCALING` (`false` disables)
    /// - `CHATBOT_BREAKER_FAILURE_THRESHOLD`, `CHATBOT_BREAKER_TIMEOUT_MS`
    /// - `CHATBOT_MESSAGES_PER_MINUTE`, `CHATBOT_MESSAGES_PER_HOUR`
    /// - `CHATBOT_SESSION_TOKEN_BUDGET`
    /// - `CHATBOT_CACHE_MEMORY_ENTRIES`
    ///
    /// Values that do not parse leave the default in place.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parse = |name: &str| -> Option<u64> { parsed(&lookup, name) };
        let millis = |name: &str| parse(name).map(Duration::from_millis);

        let mut cfg = Self::default();
        if let Some(n) = parse("CHATBOT_MAX_CONNECTIONS") {
            cfg.pool.max_size = n as usize;
        }
        if let Some(n) = parse("CHATBOT_MIN_CONNECTIONS") {
            cfg.pool.min_size = n as usize;
        }
        if let Some(d) = millis("CHATBOT_ACQUIRE_TIMEOUT") {
            cfg.pool.acquire_timeout = d;
        }
        if let Some(d) = millis("CHATBOT_IDLE_TIMEOUT") {
            cfg.pool.idle_timeout = d;
        }
        if let Some(d) = millis("CHATBOT_MAX_LIFETIME") {
            cfg.pool.max_lifetime = d;
        }
        if let Some(n) = parse("CHATBOT_MAX_CONCURRENT") {
            cfg.admission.max_concurrent = n as usize;
        }
        if let Some(flag) = lookup("CHATBOT_AUTO_SCALING") {
            cfg.scaler.enabled = flag.trim() != "false";
        }
        if let Some(n) = parsed::<u32>(&lookup, "CHATBOT_BREAKER_FAILURE_THRESHOLD") {
            cfg.breaker.failure_threshold = n;
        }
        if let Some(d) = millis("CHATBOT_BREAKER_TIMEOUT_MS") {
            cfg.breaker.timeout = d;
        }
        if let Some(n) = parsed::<u32>(&lookup, "CHATBOT_MESSAGES_PER_MINUTE") {
            cfg.rate_limit.messages_per_minute = n;
        }
        if let Some(n) = parsed::<u32>(&lookup, "CHATBOT_MESSAGES_PER_HOUR") {
            cfg.rate_limit.messages_per_hour = n;
        }
        if let Some(n) = parse("CHATBOT_SESSION_TOKEN_BUDGET") {
            cfg.budget.budget_limit = n;
        }
        if let Some(n) = parse("CHATBOT_CACHE_MEMORY_ENTRIES") {
            cfg.cache.memory_entries = n as usize;
        }
        cfg
    }

    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;
        let invalid = |field: &str, msg: String| {
            Err(Error::configuration_with_context(
                msg,
                ErrorContext::new().with_source(field.to_string()),
            ))
        };
        if self.admission.max_concurrent == 0 {
            return invalid("admission.max_concurrent", "max_concurrent must be at least 1".into());
        }
        let s = &self.scaler;
        if !(0.0..=1.0).contains(&s.scale_down_threshold)
            || !(0.0..=1.0).contains(&s.scale_up_threshold)
            || s.scale_down_threshold >= s.scale_up_threshold
        {
            return invalid(
                "scaler",
                format!(
                    "scale thresholds must satisfy 0 <= down ({}) < up ({}) <= 1",
                    s.scale_down_threshold, s.scale_up_threshold
                ),
            );
        }
        if s.step == 0 {
            return invalid("scaler.step", "scaling step must be at least 1".into());
        }
        if self.breaker.failure_threshold == 0 {
            return invalid("breaker.failure_threshold", "failure threshold must be at least 1".into());
        }
        let r = &self.rate_limit;
        if r.messages_per_minute == 0 || r.messages_per_hour == 0 {
            return invalid("rate_limit", "rate limits must be positive".into());
        }
        if r.messages_per_minute > r.messages_per_hour {
            return invalid(
                "rate_limit",
                format!(
                    "per-minute limit ({}) exceeds per-hour limit ({})",
                    r.messages_per_minute, r.messages_per_hour
                ),
            );
        }
        if self.budget.budget_limit == 0 {
            return invalid("budget.budget_limit", "token budget must be positive".into());
        }
        if self.cache.memory_entries == 0 {
            return invalid("cache.memory_entries", "memory tier needs at least one entry".into());
        }
        let threshold = self.cache.similarity_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return invalid("cache.similarity_threshold", format!("similarity threshold {threshold} outside (0, 1]"));
        }
        Ok(())
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    lookup(name)?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> RuntimeConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RuntimeConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults_are_valid() {
        let cfg = RuntimeConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.pool.max_size, 10);
        assert_eq!(cfg.pool.min_size, 2);
        assert_eq!(cfg.admission.max_concurrent, 50);
        assert!(cfg.scaler.enabled);
        assert_eq!(cfg.budget.budget_limit, 50_000);
        assert_eq!(cfg.maintenance.resource_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_environment_overlay() {
        let cfg = from_pairs(&[
            ("CHATBOT_MAX_CONNECTIONS", "20"),
            ("CHATBOT_MIN_CONNECTIONS", "4"),
            ("CHATBOT_ACQUIRE_TIMEOUT", "5000"),
            ("CHATBOT_MAX_CONCURRENT", "8"),
            ("CHATBOT_AUTO_SCALING", "false"),
            ("CHATBOT_BREAKER_TIMEOUT_MS", "1500"),
            ("CHATBOT_MESSAGES_PER_MINUTE", "5"),
            ("CHATBOT_SESSION_TOKEN_BUDGET", "1000"),
        ]);
        assert_eq!(cfg.pool.max_size, 20);
        assert_eq!(cfg.pool.min_size, 4);
        assert_eq!(cfg.pool.acquire_timeout, Duration::from_secs(5));
        assert_eq!(cfg.admission.max_concurrent, 8);
        assert!(!cfg.scaler.enabled);
        assert_eq!(cfg.breaker.timeout, Duration::from_millis(1500));
        assert_eq!(cfg.rate_limit.messages_per_minute, 5);
        assert_eq!(cfg.budget.budget_limit, 1000);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_unparseable_values_keep_defaults() {
        let cfg = from_pairs(&[
            ("CHATBOT_MAX_CONNECTIONS", "many"),
            ("CHATBOT_AUTO_SCALING", "yes"),
        ]);
        assert_eq!(cfg.pool.max_size, 10);
        assert!(cfg.scaler.enabled);
    }

    #[test]
    fn test_inconsistent_settings_rejected() {
        let cfg = from_pairs(&[("CHATBOT_MIN_CONNECTIONS", "12")]);
        assert!(matches!(cfg.validate(), Err(Error::Configuration { .. })));

        let mut cfg = RuntimeConfig::default();
        cfg.scaler = cfg.scaler.with_thresholds(0.3, 0.8);
        assert!(cfg.validate().is_err());

        let mut cfg = RuntimeConfig::default();
        cfg.rate_limit = cfg.rate_limit.with_messages_per_minute(500);
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.context().and_then(|c| c.source.as_deref()), Some("rate_limit"));
    }
}
