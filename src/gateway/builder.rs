use super::{ChatGateway, GatewayInner};
use crate::admission::AdmissionQueue;
use crate::cache::{CacheBackend, MemoryCache, ResponseCache};
use crate::config::RuntimeConfig;
use crate::pool::{AutoScaler, ConnectionFactory, ConnectionPool, WithConnectionOptions};
use crate::resilience::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use crate::resilience::rate_limiter::SlidingWindowLimiter;
use crate::tokens::{CharacterEstimator, TokenBudgetTracker, TokenCounter};
use crate::Result;
use std::sync::Arc;

/// Name under which the AI generation dependency's breaker is registered.
pub const DEFAULT_AI_DEPENDENCY: &str = "gemini";

/// Builder for [`ChatGateway`].
///
/// Starts from [`RuntimeConfig::default`]; use `from_env` to pick up the
/// `CHATBOT_*` overrides.
pub struct ChatGatewayBuilder<F: ConnectionFactory> {
    factory: F,
    config: RuntimeConfig,
    durable_cache: Option<Box<dyn CacheBackend>>,
    counter: Option<Arc<dyn TokenCounter>>,
    ai_dependency: String,
    breakers: Vec<(String, CircuitBreakerConfig)>,
}

impl<F: ConnectionFactory> ChatGatewayBuilder<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            config: RuntimeConfig::default(),
            durable_cache: None,
            counter: None,
            ai_dependency: DEFAULT_AI_DEPENDENCY.to_string(),
            breakers: Vec::new(),
        }
    }

    pub fn from_env(factory: F) -> Self {
        Self::new(factory).with_config(RuntimeConfig::from_env())
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Durable cache tier. Defaults to an unbounded in-process store.
    pub fn with_durable_cache(mut self, backend: Box<dyn CacheBackend>) -> Self {
        self.durable_cache = Some(backend);
        self
    }

    /// Estimator used when a request carries no token estimate.
    pub fn with_token_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.counter = Some(counter);
        self
    }

    pub fn with_ai_dependency(mut self, name: impl Into<String>) -> Self {
        self.ai_dependency = name.into();
        self
    }

    /// Register an extra breaker with its own settings.
    pub fn with_breaker(mut self, dependency: impl Into<String>, cfg: CircuitBreakerConfig) -> Self {
        self.breakers.push((dependency.into(), cfg));
        self
    }

    pub fn build(self) -> Result<ChatGateway<F>> {
        let cfg = self.config;
        cfg.validate()?;

        let pool = ConnectionPool::new(self.factory, cfg.pool.clone())?;
        let admission = AdmissionQueue::new(cfg.admission.clone())?;
        let breakers = Arc::new(CircuitBreakerRegistry::new(cfg.breaker.clone()));
        breakers.register(&self.ai_dependency, cfg.breaker.clone());
        for (dependency, breaker_cfg) in self.breakers {
            breakers.register(&dependency, breaker_cfg);
        }
        let durable = self
            .durable_cache
            .unwrap_or_else(|| Box::new(MemoryCache::unbounded()));
        let connection_options =
            WithConnectionOptions::new(cfg.pool.acquire_timeout).with_retry(cfg.retry.clone());

        Ok(ChatGateway {
            inner: Arc::new(GatewayInner {
                pool,
                admission,
                scaler: AutoScaler::new(cfg.scaler.clone()),
                breakers,
                limiter: SlidingWindowLimiter::new(cfg.rate_limit.clone()),
                budget: TokenBudgetTracker::new(cfg.budget.clone()),
                cache: ResponseCache::new(cfg.cache.clone(), durable),
                counter: self
                    .counter
                    .unwrap_or_else(|| Arc::new(CharacterEstimator::new())),
                ai_dependency: self.ai_dependency,
                connection_options,
                config: cfg,
            }),
        })
    }
}
