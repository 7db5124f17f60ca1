use crate::error::RateWindowKind;
use crate::{Error, Result};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub messages_per_minute: u32,
    pub messages_per_hour: u32,
    /// Identities with no request inside this horizon are dropped by `sweep`.
    pub retention: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            messages_per_minute: 20,
            messages_per_hour: 200,
            retention: Duration::from_secs(24 * 3600),
        }
    }
}

impl RateLimitConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_messages_per_minute(mut self, n: u32) -> Self {
        self.messages_per_minute = n;
        self
    }

    pub fn with_messages_per_hour(mut self, n: u32) -> Self {
        self.messages_per_hour = n;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }
}

/// Outcome of `check_and_consume`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateDecision {
    Allowed {
        remaining_per_minute: u32,
        remaining_per_hour: u32,
    },
    Limited {
        window: RateWindowKind,
        retry_after: Duration,
    },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RateDecision::Limited { retry_after, .. } => Some(*retry_after),
            RateDecision::Allowed { .. } => None,
        }
    }

    pub fn into_result(self) -> Result<()> {
        match self {
            RateDecision::Allowed { .. } => Ok(()),
            RateDecision::Limited {
                window,
                retry_after,
            } => Err(Error::RateLimited {
                window,
                retry_after,
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterSnapshot {
    pub tracked_identities: usize,
    pub messages_per_minute: u32,
    pub messages_per_hour: u32,
}

#[derive(Debug, Default)]
struct RateWindow {
    minute: VecDeque<Instant>,
    hour: VecDeque<Instant>,
    last_request: Option<Instant>,
}

impl RateWindow {
    fn prune(&mut self, now: Instant) {
        prune_window(&mut self.minute, now, MINUTE);
        prune_window(&mut self.hour, now, HOUR);
    }
}

// Timestamps are pushed in order, so expired ones are always at the front.
fn prune_window(window: &mut VecDeque<Instant>, now: Instant, span: Duration) {
    while let Some(&front) = window.front() {
        if now.duration_since(front) >= span {
            window.pop_front();
        } else {
            break;
        }
    }
}

/// Sliding-window request limiter keyed by client identity (IP hash, session id).
pub struct SlidingWindowLimiter {
    cfg: RateLimitConfig,
    windows: Mutex<HashMap<String, RateWindow>>,
}

impl SlidingWindowLimiter {
    pub fn new(cfg: RateLimitConfig) -> Self {
        Self {
            cfg,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.cfg
    }

    /// Count one request for `identity` unless either window is already full.
    pub async fn check_and_consume(&self, identity: &str) -> RateDecision {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        let window = windows.entry(identity.to_string()).or_default();
        window.prune(now);

        if window.minute.len() >= self.cfg.messages_per_minute as usize {
            debug!(identity, "per-minute rate limit reached");
            return RateDecision::Limited {
                window: RateWindowKind::Minute,
                retry_after: MINUTE,
            };
        }
        if window.hour.len() >= self.cfg.messages_per_hour as usize {
            debug!(identity, "per-hour rate limit reached");
            return RateDecision::Limited {
                window: RateWindowKind::Hour,
                retry_after: HOUR,
            };
        }

        window.minute.push_back(now);
        window.hour.push_back(now);
        window.last_request = Some(now);
        RateDecision::Allowed {
            remaining_per_minute: self.cfg.messages_per_minute - window.minute.len() as u32,
            remaining_per_hour: self.cfg.messages_per_hour - window.hour.len() as u32,
        }
    }

    /// Drop identities idle beyond the retention horizon. Returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let retention = self.cfg.retention;
        let mut windows = self.windows.lock().await;
        let before = windows.len();
        windows.retain(|_, w| {
            w.prune(now);
            w.last_request
                .map(|t| now.duration_since(t) < retention)
                .unwrap_or(false)
        });
        before - windows.len()
    }

    pub async fn snapshot(&self) -> RateLimiterSnapshot {
        RateLimiterSnapshot {
            tracked_identities: self.windows.lock().await.len(),
            messages_per_minute: self.cfg.messages_per_minute,
            messages_per_hour: self.cfg.messages_per_hour,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(per_minute: u32, per_hour: u32) -> SlidingWindowLimiter {
        SlidingWindowLimiter::new(
            RateLimitConfig::new()
                .with_messages_per_minute(per_minute)
                .with_messages_per_hour(per_hour),
        )
    }

    #[test]
    fn test_rate_limit_config_defaults() {
        let cfg = RateLimitConfig::default();
        assert_eq!(cfg.messages_per_minute, 20);
        assert_eq!(cfg.messages_per_hour, 200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admits_exactly_per_minute_quota() {
        let rl = limiter(20, 200);
        for i in 0..20 {
            let d = rl.check_and_consume("ip:abc").await;
            assert!(d.is_allowed(), "request {} should be allowed", i);
        }
        let d = rl.check_and_consume("ip:abc").await;
        assert_eq!(
            d,
            RateDecision::Limited {
                window: RateWindowKind::Minute,
                retry_after: Duration::from_secs(60)
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides() {
        let rl = limiter(2, 200);
        assert!(rl.check_and_consume("s1").await.is_allowed());
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(rl.check_and_consume("s1").await.is_allowed());
        assert!(!rl.check_and_consume("s1").await.is_allowed());

        // first request leaves the minute window
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(rl.check_and_consume("s1").await.is_allowed());
        assert!(!rl.check_and_consume("s1").await.is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hourly_limit_reports_hour_retry() {
        let rl = limiter(100, 3);
        for _ in 0..3 {
            assert!(rl.check_and_consume("s1").await.is_allowed());
        }
        let d = rl.check_and_consume("s1").await;
        assert_eq!(d.retry_after(), Some(Duration::from_secs(3600)));
        assert!(matches!(
            d.into_result(),
            Err(Error::RateLimited {
                window: RateWindowKind::Hour,
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_requests_are_not_counted() {
        let rl = limiter(1, 200);
        assert!(rl.check_and_consume("s1").await.is_allowed());
        for _ in 0..5 {
            assert!(!rl.check_and_consume("s1").await.is_allowed());
        }
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(rl.check_and_consume("s1").await.is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_identities_are_independent() {
        let rl = limiter(1, 10);
        assert!(rl.check_and_consume("a").await.is_allowed());
        assert!(rl.check_and_consume("b").await.is_allowed());
        assert!(!rl.check_and_consume("a").await.is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_idle_identities() {
        let rl = SlidingWindowLimiter::new(
            RateLimitConfig::new().with_retention(Duration::from_secs(600)),
        );
        rl.check_and_consume("old").await;
        tokio::time::advance(Duration::from_secs(601)).await;
        rl.check_and_consume("fresh").await;
        assert_eq!(rl.sweep().await, 1);
        assert_eq!(rl.snapshot().await.tracked_identities, 1);
    }
}
