//! Per-session token ledger.

use crate::{Error, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct TokenBudgetConfig {
    /// Ceiling on cumulative tokens per session.
    pub budget_limit: u64,
    /// Sessions idle for longer than this are forgotten by `sweep`.
    pub session_retention: Duration,
}

impl Default for TokenBudgetConfig {
    fn default() -> Self {
        Self {
            budget_limit: 50_000,
            session_retention: Duration::from_secs(2 * 3600),
        }
    }
}

impl TokenBudgetConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_budget_limit(mut self, limit: u64) -> Self {
        self.budget_limit = limit;
        self
    }

    pub fn with_session_retention(mut self, retention: Duration) -> Self {
        self.session_retention = retention;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BudgetDecision {
    pub allowed: bool,
    pub remaining: u64,
    pub used: u64,
    pub limit: u64,
}

impl BudgetDecision {
    pub fn percentage_used(&self) -> f64 {
        if self.limit == 0 {
            100.0
        } else {
            self.used as f64 / self.limit as f64 * 100.0
        }
    }

    pub fn into_result(self, requested: u64) -> Result<Self> {
        if self.allowed {
            Ok(self)
        } else {
            Err(Error::BudgetExceeded {
                used: self.used,
                limit: self.limit,
                requested,
            })
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionUsage {
    pub total_tokens: u64,
    pub request_count: u64,
    #[serde(skip)]
    started_at: Instant,
    #[serde(skip)]
    last_request: Instant,
}

impl SessionUsage {
    fn new(now: Instant) -> Self {
        Self {
            total_tokens: 0,
            request_count: 0,
            started_at: now,
            last_request: now,
        }
    }

    pub fn session_age(&self) -> Duration {
        Instant::now().duration_since(self.started_at)
    }
}

pub struct TokenBudgetTracker {
    cfg: TokenBudgetConfig,
    sessions: Mutex<HashMap<String, SessionUsage>>,
}

impl TokenBudgetTracker {
    pub fn new(cfg: TokenBudgetConfig) -> Self {
        Self {
            cfg,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn budget_limit(&self) -> u64 {
        self.cfg.budget_limit
    }

    /// Would spending `tokens_to_spend` keep the session within its ceiling?
    ///
    /// Spending exactly up to the ceiling is allowed; once usage reaches it,
    /// even a zero-token estimate is refused. Nothing is recorded here;
    /// report actual usage with `record_usage` once the call completes.
    pub async fn check_token_budget(&self, session_id: &str, tokens_to_spend: u64) -> BudgetDecision {
        let used = self
            .sessions
            .lock()
            .await
            .get(session_id)
            .map(|u| u.total_tokens)
            .unwrap_or(0);
        let limit = self.cfg.budget_limit;
        let allowed = used < limit && used.saturating_add(tokens_to_spend) <= limit;
        if !allowed {
            debug!(session_id, used, tokens_to_spend, limit, "token budget exhausted");
        }
        BudgetDecision {
            allowed,
            remaining: limit.saturating_sub(used),
            used,
            limit,
        }
    }

    pub async fn record_usage(&self, session_id: &str, tokens_used: u64) -> SessionUsage {
        let now = Instant::now();
        let mut sessions = self.sessions.lock().await;
        let usage = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionUsage::new(now));
        usage.total_tokens = usage.total_tokens.saturating_add(tokens_used);
        usage.request_count += 1;
        usage.last_request = now;
        usage.clone()
    }

    pub async fn usage(&self, session_id: &str) -> Option<SessionUsage> {
        self.sessions.lock().await.get(session_id).cloned()
    }

    /// Start the session over with a fresh allowance.
    pub async fn reset(&self, session_id: &str) -> bool {
        let removed = self.sessions.lock().await.remove(session_id).is_some();
        if removed {
            info!(session_id, "token budget reset");
        }
        removed
    }

    /// Forget sessions idle beyond the retention horizon.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let retention = self.cfg.session_retention;
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|_, u| now.duration_since(u.last_request) < retention);
        before - sessions.len()
    }

    pub async fn tracked_sessions(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(limit: u64) -> TokenBudgetTracker {
        TokenBudgetTracker::new(TokenBudgetConfig::new().with_budget_limit(limit))
    }

    #[tokio::test]
    async fn test_fresh_session_has_full_budget() {
        let t = tracker(1000);
        let d = t.check_token_budget("s1", 10).await;
        assert!(d.allowed);
        assert_eq!(d.remaining, 1000);
        assert_eq!(d.used, 0);
    }

    #[tokio::test]
    async fn test_boundary_is_inclusive() {
        let t = tracker(1000);
        t.record_usage("s1", 600).await;
        assert!(t.check_token_budget("s1", 400).await.allowed);
        let d = t.check_token_budget("s1", 401).await;
        assert!(!d.allowed);
        assert_eq!(d.remaining, 400);
        assert!(matches!(
            d.into_result(401),
            Err(Error::BudgetExceeded {
                used: 600,
                limit: 1000,
                requested: 401
            })
        ));
    }

    #[tokio::test]
    async fn test_exhausted_session_refuses_until_reset() {
        let t = tracker(100);
        t.record_usage("s1", 100).await;
        assert!(!t.check_token_budget("s1", 1).await.allowed);
        let d = t.check_token_budget("s1", 0).await;
        assert!(!d.allowed);
        assert_eq!(d.remaining, 0);
        assert!(t.reset("s1").await);
        assert!(t.check_token_budget("s1", 100).await.allowed);
    }

    #[tokio::test]
    async fn test_record_usage_accumulates() {
        let t = tracker(1000);
        t.record_usage("s1", 10).await;
        let u = t.record_usage("s1", 15).await;
        assert_eq!(u.total_tokens, 25);
        assert_eq!(u.request_count, 2);
        let d = t.check_token_budget("s1", 0).await;
        assert!((d.percentage_used() - 2.5).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_forgets_idle_sessions() {
        let t = TokenBudgetTracker::new(
            TokenBudgetConfig::new().with_session_retention(Duration::from_secs(60)),
        );
        t.record_usage("idle", 10).await;
        tokio::time::advance(Duration::from_secs(61)).await;
        t.record_usage("busy", 10).await;
        assert_eq!(t.sweep().await, 1);
        assert!(t.usage("idle").await.is_none());
        assert_eq!(t.tracked_sessions().await, 1);
    }
}
