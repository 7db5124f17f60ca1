use crate::admission::AdmissionSnapshot;
use crate::cache::CacheStats;
use crate::pool::PoolSnapshot;
use crate::resilience::circuit_breaker::{CircuitBreakerSnapshot, CircuitState};
use crate::resilience::rate_limiter::RateLimiterSnapshot;
use serde::Serialize;
use std::collections::BTreeMap;

/// Point-in-time view of every resource the gateway manages.
///
/// Facts only; [`recommendations`](Self::recommendations) derives the
/// operator-facing warnings from them.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceStatus {
    pub pool: PoolSnapshot,
    pub admission: AdmissionSnapshot,
    pub breakers: BTreeMap<String, CircuitBreakerSnapshot>,
    pub cache: CacheStats,
    pub rate_limiter: RateLimiterSnapshot,
    pub tracked_sessions: usize,
    pub load: f64,
    pub auto_scaling: AutoScalingStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct AutoScalingStatus {
    pub enabled: bool,
    pub cooldown_remaining_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct Recommendation {
    pub severity: Severity,
    pub category: &'static str,
    pub message: String,
    pub recommendation: String,
}

const POOL_UTILIZATION_WARN: f64 = 0.9;
const QUEUE_BACKLOG_WARN: usize = 50;

impl ResourceStatus {
    pub fn recommendations(&self) -> Vec<Recommendation> {
        let mut out = Vec::new();
        if self.pool.utilization() > POOL_UTILIZATION_WARN {
            out.push(Recommendation {
                severity: Severity::Warning,
                category: "connections",
                message: "Connection pool utilization is very high".into(),
                recommendation: "Consider increasing max connections or optimizing query performance".into(),
            });
        }
        if self.admission.queue_len() > QUEUE_BACKLOG_WARN {
            out.push(Recommendation {
                severity: Severity::Warning,
                category: "requests",
                message: "Request queue is building up".into(),
                recommendation: "Consider increasing the concurrent request limit or speeding up request processing"
                    .into(),
            });
        }
        for (dependency, breaker) in &self.breakers {
            if breaker.state == CircuitState::Open {
                out.push(Recommendation {
                    severity: Severity::Error,
                    category: "circuit_breaker",
                    message: format!("Circuit breaker for {dependency} is OPEN"),
                    recommendation: format!("Check {dependency} health and connectivity"),
                });
            }
        }
        out
    }
}
