//! Request gateway composing every resource control.
//!
//! [`ChatGateway::respond`] runs one chat message through the full path:
//!
//! 1. per-client sliding-window rate limit
//! 2. per-session token budget
//! 3. response cache lookup (a hit short-circuits everything below)
//! 4. breaker fast-fail for the AI dependency
//! 5. admission slot, then pooled connection
//! 6. breaker gate and generation, retried with backoff on transient errors
//! 7. usage recording and cache store
//!
//! Rejections in steps 1, 2 and 4 happen before any queue slot or connection
//! is taken.

mod builder;
mod signals;

pub use builder::{ChatGatewayBuilder, DEFAULT_AI_DEPENDENCY};
pub use signals::{AutoScalingStatus, Recommendation, ResourceStatus, Severity};

use crate::admission::{AdmissionQueue, Priority};
use crate::cache::{CacheContext, CacheSource, ResponseCache, StoreOutcome};
use crate::config::RuntimeConfig;
use crate::maintenance::MaintenanceHandle;
use crate::pool::{
    AutoScaler, ConnectionFactory, ConnectionPool, LoadSample, ScaleDecision, WithConnectionOptions,
};
use crate::resilience::circuit_breaker::CircuitBreakerRegistry;
use crate::resilience::rate_limiter::SlidingWindowLimiter;
use crate::tokens::{TokenBudgetTracker, TokenCounter};
use crate::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const DRAIN_POLL: Duration = Duration::from_millis(100);

/// One inbound chat message.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Identity the rate limiter counts against (client or IP).
    pub client_id: String,
    /// Conversation the token budget is charged to.
    pub session_id: String,
    pub message: String,
    pub context: CacheContext,
    pub priority: Priority,
    /// Token cost used for the budget check; estimated from `message` when unset.
    pub estimated_tokens: Option<u64>,
}

impl ChatRequest {
    pub fn new(client_id: impl Into<String>, session_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            session_id: session_id.into(),
            message: message.into(),
            context: CacheContext::default(),
            priority: Priority::Normal,
            estimated_tokens: None,
        }
    }

    pub fn with_context(mut self, context: CacheContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_estimated_tokens(mut self, tokens: u64) -> Self {
        self.estimated_tokens = Some(tokens);
        self
    }
}

/// Output of the generation callback.
#[derive(Debug, Clone)]
pub struct Generated {
    pub text: String,
    pub tokens_used: u64,
}

impl Generated {
    pub fn new(text: impl Into<String>, tokens_used: u64) -> Self {
        Self {
            text: text.into(),
            tokens_used,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseSource {
    Cache { tier: CacheSource, age_ms: u64 },
    Generated,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub text: String,
    pub source: ResponseSource,
    pub tokens_used: u64,
    pub budget_remaining: u64,
    /// What happened when the generated answer was offered to the cache.
    #[serde(skip)]
    pub cache_outcome: Option<StoreOutcome>,
}

impl ChatResponse {
    pub fn from_cache(&self) -> bool {
        matches!(self.source, ResponseSource::Cache { .. })
    }
}

pub(crate) struct GatewayInner<F: ConnectionFactory> {
    pub(crate) pool: ConnectionPool<F>,
    pub(crate) admission: AdmissionQueue,
    pub(crate) scaler: AutoScaler,
    pub(crate) breakers: Arc<CircuitBreakerRegistry>,
    pub(crate) limiter: SlidingWindowLimiter,
    pub(crate) budget: TokenBudgetTracker,
    pub(crate) cache: ResponseCache,
    pub(crate) counter: Arc<dyn TokenCounter>,
    pub(crate) ai_dependency: String,
    pub(crate) connection_options: WithConnectionOptions,
    pub(crate) config: RuntimeConfig,
}

/// Shared handle to the composed runtime. Cloning is cheap.
pub struct ChatGateway<F: ConnectionFactory> {
    inner: Arc<GatewayInner<F>>,
}

impl<F: ConnectionFactory> Clone for ChatGateway<F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<F: ConnectionFactory> ChatGateway<F> {
    pub fn builder(factory: F) -> ChatGatewayBuilder<F> {
        ChatGatewayBuilder::new(factory)
    }

    pub fn pool(&self) -> &ConnectionPool<F> {
        &self.inner.pool
    }

    pub fn admission(&self) -> &AdmissionQueue {
        &self.inner.admission
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.inner.breakers
    }

    pub fn rate_limiter(&self) -> &SlidingWindowLimiter {
        &self.inner.limiter
    }

    pub fn budget(&self) -> &TokenBudgetTracker {
        &self.inner.budget
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.inner.cache
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn ai_dependency(&self) -> &str {
        &self.inner.ai_dependency
    }

    /// Run `op` inside an admission slot on a pooled connection.
    ///
    /// No rate, budget or breaker checks; use this for database work that
    /// shares the pool with generation.
    pub async fn execute<T, Op>(&self, priority: Priority, op: Op) -> Result<T>
    where
        T: Send,
        Op: for<'c> FnMut(&'c mut F::Connection) -> BoxFuture<'c, Result<T>> + Send,
    {
        let inner = &self.inner;
        inner
            .admission
            .submit(priority, inner.pool.with_connection(&inner.connection_options, op))
            .await
    }

    /// Answer `request`, calling `generate` only when the cache cannot.
    pub async fn respond<G>(&self, request: ChatRequest, mut generate: G) -> Result<ChatResponse>
    where
        G: for<'c> FnMut(&'c mut F::Connection) -> BoxFuture<'c, Result<Generated>> + Send,
    {
        let inner = &self.inner;

        inner
            .limiter
            .check_and_consume(&request.client_id)
            .await
            .into_result()?;

        let estimate = request
            .estimated_tokens
            .unwrap_or_else(|| inner.counter.count(&request.message));
        let budget = inner
            .budget
            .check_token_budget(&request.session_id, estimate)
            .await
            .into_result(estimate)?;

        match inner.cache.lookup(&request.message, &request.context).await {
            Ok(Some(hit)) => {
                debug!(session = %request.session_id, category = %hit.category, "answered from cache");
                return Ok(ChatResponse {
                    text: hit.response,
                    source: ResponseSource::Cache {
                        tier: hit.source,
                        age_ms: hit.age_ms,
                    },
                    tokens_used: 0,
                    budget_remaining: budget.remaining,
                    cache_outcome: None,
                });
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "cache lookup failed, generating"),
        }

        inner.breakers.fail_fast(&inner.ai_dependency)?;

        let breakers = inner.breakers.clone();
        let dependency = inner.ai_dependency.clone();
        let generated = inner
            .admission
            .submit(
                request.priority,
                inner.pool.with_connection(&inner.connection_options, |conn| {
                    if let Err(e) = breakers.check(&dependency) {
                        return async move { Err(e) }.boxed();
                    }
                    let call = generate(conn);
                    let breakers = breakers.clone();
                    let dependency = dependency.clone();
                    async move {
                        let result = call.await;
                        match &result {
                            Ok(_) => breakers.on_success(&dependency),
                            Err(e) => {
                                warn!(dependency = %dependency, error = %e, "generation failed");
                                breakers.on_failure(&dependency);
                            }
                        }
                        result
                    }
                    .boxed()
                }),
            )
            .await?;

        let usage = inner
            .budget
            .record_usage(&request.session_id, generated.tokens_used)
            .await;

        let metadata = serde_json::json!({
            "tokens_used": generated.tokens_used,
            "dependency": inner.ai_dependency,
        });
        let cache_outcome = match inner
            .cache
            .store(&request.message, &generated.text, &request.context, metadata)
            .await
        {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(error = %e, "failed to cache generated response");
                None
            }
        };

        Ok(ChatResponse {
            budget_remaining: inner.budget.budget_limit().saturating_sub(usage.total_tokens),
            text: generated.text,
            source: ResponseSource::Generated,
            tokens_used: generated.tokens_used,
            cache_outcome,
        })
    }

    fn load_sample(&self) -> LoadSample {
        let pool = self.inner.pool.snapshot();
        let admission = self.inner.admission.snapshot();
        LoadSample {
            active: pool.active,
            max_size: pool.max_size,
            executing: admission.executing,
            max_concurrent: admission.max_concurrent,
            queue_len: admission.queue_len(),
        }
    }

    /// One resource-maintenance pass: evict stale idle connections, refill
    /// to `min_size`, then let the auto-scaler act on current load.
    pub async fn run_resource_tick(&self) -> ScaleDecision {
        let pool = &self.inner.pool;
        let evicted = pool.evict_invalid();
        if evicted > 0 {
            debug!(evicted, "evicted stale connections");
        }
        if let Err(e) = pool.warm_up().await {
            warn!(error = %e, "failed to replenish connection pool");
        }
        self.inner.scaler.tick(pool, self.load_sample()).await
    }

    pub async fn sweep_cache(&self) {
        match self.inner.cache.sweep_expired().await {
            Ok(report) => debug!(memory = report.memory, durable = report.durable, "expired cache entries removed"),
            Err(e) => warn!(error = %e, "cache sweep failed"),
        }
    }

    /// Drop rate windows and token ledgers that have gone quiet.
    pub async fn sweep_limiters(&self) {
        let identities = self.inner.limiter.sweep().await;
        let sessions = self.inner.budget.sweep().await;
        debug!(identities, sessions, "limiter state swept");
    }

    pub async fn status(&self) -> ResourceStatus {
        let sample = self.load_sample();
        let inner = &self.inner;
        ResourceStatus {
            pool: inner.pool.snapshot(),
            admission: inner.admission.snapshot(),
            breakers: inner.breakers.snapshots().into_iter().collect(),
            cache: inner.cache.stats().await,
            rate_limiter: inner.limiter.snapshot().await,
            tracked_sessions: inner.budget.tracked_sessions().await,
            load: sample.load(),
            auto_scaling: AutoScalingStatus {
                enabled: inner.scaler.config().enabled,
                cooldown_remaining_ms: inner.scaler.cooldown_remaining().as_millis() as u64,
            },
        }
    }

    pub async fn recommendations(&self) -> Vec<Recommendation> {
        self.status().await.recommendations()
    }

    pub async fn log_status(&self) {
        let status = self.status().await;
        info!(
            pool_active = status.pool.active,
            pool_idle = status.pool.idle,
            pool_total = status.pool.total,
            executing = status.admission.executing,
            queued = status.admission.queue_len(),
            cache_hit_ratio = status.cache.hit_ratio(),
            load = status.load,
            "resource status"
        );
        for rec in status.recommendations() {
            warn!(category = rec.category, issue = %rec.message, "{}", rec.recommendation);
        }
    }

    /// Fill the pool to `min_size` and start the periodic maintenance tasks.
    pub async fn start(&self) -> Result<MaintenanceHandle> {
        let opened = self.inner.pool.warm_up().await?;
        info!(opened, "connection pool warmed up");

        let m = &self.inner.config.maintenance;
        let mut handle = MaintenanceHandle::new();
        let gw = self.clone();
        handle.spawn("resources", m.resource_interval, move || {
            let gw = gw.clone();
            async move {
                gw.run_resource_tick().await;
            }
        });
        let gw = self.clone();
        handle.spawn("cache_sweep", m.cache_sweep_interval, move || {
            let gw = gw.clone();
            async move { gw.sweep_cache().await }
        });
        let gw = self.clone();
        handle.spawn("limiter_sweep", m.limiter_sweep_interval, move || {
            let gw = gw.clone();
            async move { gw.sweep_limiters().await }
        });
        let gw = self.clone();
        handle.spawn("status_log", m.status_log_interval, move || {
            let gw = gw.clone();
            async move { gw.log_status().await }
        });
        Ok(handle)
    }

    /// Stop maintenance, wait up to `drain_timeout` for in-flight and queued
    /// requests, then close the pool. Returns whether the drain completed.
    pub async fn shutdown(&self, maintenance: MaintenanceHandle, drain_timeout: Duration) -> bool {
        info!("shutting down chat gateway");
        maintenance.shutdown().await;

        let deadline = Instant::now() + drain_timeout;
        let admission = &self.inner.admission;
        let drained = loop {
            if admission.executing() == 0 && admission.queue_len() == 0 {
                break true;
            }
            if Instant::now() >= deadline {
                break false;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        };
        if !drained {
            warn!(
                executing = admission.executing(),
                queued = admission.queue_len(),
                "drain timed out, closing pool with requests in flight"
            );
        }
        self.inner.pool.close();
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{AutoScalerConfig, PoolConfig};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Conn;

    struct Factory {
        opened: AtomicUsize,
    }

    #[async_trait]
    impl ConnectionFactory for Factory {
        type Connection = Conn;

        async fn open(&self) -> Result<Conn> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Conn)
        }
    }

    fn gateway(cfg: RuntimeConfig) -> ChatGateway<Factory> {
        ChatGateway::builder(Factory {
            opened: AtomicUsize::new(0),
        })
        .with_config(cfg)
        .build()
        .unwrap()
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let mut cfg = RuntimeConfig::default();
        cfg.pool = PoolConfig::new().with_min_size(5).with_max_size(2);
        let result = ChatGateway::builder(Factory {
            opened: AtomicUsize::new(0),
        })
        .with_config(cfg)
        .build();
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_build_registers_ai_breaker() {
        let gw = gateway(RuntimeConfig::default());
        assert_eq!(gw.ai_dependency(), DEFAULT_AI_DEPENDENCY);
        let status = gw.status().await;
        assert!(status.breakers.contains_key("gemini"));
        assert_eq!(status.pool.total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_warms_pool_and_runs_maintenance() {
        let mut cfg = RuntimeConfig::default();
        cfg.scaler = AutoScalerConfig::disabled();
        let gw = gateway(cfg);
        let handle = gw.start().await.unwrap();
        assert_eq!(handle.task_count(), 4);
        assert_eq!(gw.pool().snapshot().idle, 2);

        tokio::time::sleep(Duration::from_secs(6 * 60)).await;
        // idle connections expired after 5 minutes and were replaced by the resource task
        let snap = gw.pool().snapshot();
        assert_eq!(snap.total, 2);
        assert!(snap.created >= 4);

        assert!(gw.shutdown(handle, Duration::from_secs(1)).await);
        assert!(gw.pool().snapshot().closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_in_flight_requests() {
        let gw = gateway(RuntimeConfig::default());
        let handle = gw.start().await.unwrap();

        let worker = gw.clone();
        let task = tokio::spawn(async move {
            worker
                .execute(Priority::Normal, |_conn| {
                    async {
                        tokio::time::sleep(Duration::from_secs(2)).await;
                        Ok(())
                    }
                    .boxed()
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(gw.admission().executing(), 1);

        assert!(gw.shutdown(handle, Duration::from_secs(30)).await);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_gives_up_after_drain_timeout() {
        let gw = gateway(RuntimeConfig::default());
        let handle = gw.start().await.unwrap();
        let worker = gw.clone();
        let _task = tokio::spawn(async move {
            worker
                .execute(Priority::Normal, |_conn| {
                    async {
                        tokio::time::sleep(Duration::from_secs(600)).await;
                        Ok(())
                    }
                    .boxed()
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!gw.shutdown(handle, Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resource_tick_scales_up_under_load() {
        let mut cfg = RuntimeConfig::default();
        cfg.admission = cfg.admission.with_max_concurrent(2);
        let gw = gateway(cfg);
        gw.pool().warm_up().await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..2 {
            let worker = gw.clone();
            tasks.push(tokio::spawn(async move {
                worker
                    .execute(Priority::Normal, |_conn| {
                        async {
                            tokio::time::sleep(Duration::from_secs(5)).await;
                            Ok(())
                        }
                        .boxed()
                    })
                    .await
            }));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        let decision = gw.run_resource_tick().await;
        assert_eq!(decision, ScaleDecision::ScaledUp(2));
        assert_eq!(gw.pool().snapshot().total, 4);
        assert_eq!(gw.run_resource_tick().await, ScaleDecision::CoolingDown);
        for t in tasks {
            t.await.unwrap().unwrap();
        }
    }
}
