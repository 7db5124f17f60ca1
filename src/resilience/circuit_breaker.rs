use crate::{Error, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub failure_threshold: u32,
    pub timeout_ms: u64,
    pub consecutive_failures: u32,
    /// Remaining open time in ms, if currently open.
    pub open_remaining_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    /// How long the breaker stays open after the last failure.
    pub timeout: Duration,
    /// Admit a single trial call while half-open instead of letting every caller through.
    /// A trial that never reports back lapses after `timeout`.
    pub single_trial: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(60),
            single_trial: false,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure threshold
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Set the open-state timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_single_trial(mut self, enabled: bool) -> Self {
        self.single_trial = enabled;
        self
    }
}

#[derive(Debug)]
struct State {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    /// When the current half-open trial was handed out; it lapses after `timeout`.
    trial_started: Option<Instant>,
}

/// Consecutive-failure circuit breaker for one dependency.
///
/// - Opens once `failure_threshold` consecutive failures are recorded
/// - Half-opens after `timeout` has passed since the last failure
/// - Closes on the first success while half-open
pub struct CircuitBreaker {
    name: String,
    cfg: CircuitBreakerConfig,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, cfg: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            cfg,
            state: Mutex::new(State {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                trial_started: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Gate a call. Fails with `DependencyOpen` while the breaker is open.
    pub fn allow(&self) -> Result<()> {
        let mut st = self.lock();
        match st.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = st
                    .last_failure
                    .map(|t| Instant::now().duration_since(t))
                    .unwrap_or(Duration::MAX);
                if elapsed > self.cfg.timeout {
                    st.state = CircuitState::HalfOpen;
                    st.trial_started = Some(Instant::now());
                    info!(dependency = %self.name, "circuit breaker moved to HALF_OPEN");
                    Ok(())
                } else {
                    Err(self.open_error())
                }
            }
            CircuitState::HalfOpen => {
                let now = Instant::now();
                let trial_pending = st
                    .trial_started
                    .map_or(false, |t| now.duration_since(t) <= self.cfg.timeout);
                if self.cfg.single_trial && trial_pending {
                    return Err(self.open_error());
                }
                st.trial_started = Some(now);
                Ok(())
            }
        }
    }

    /// Read-only variant of [`allow`](Self::allow): fails while the open
    /// timeout is still running but never moves the breaker to half-open.
    pub fn fail_fast(&self) -> Result<()> {
        let st = self.lock();
        let still_open = st.state == CircuitState::Open
            && st
                .last_failure
                .map_or(false, |t| Instant::now().duration_since(t) <= self.cfg.timeout);
        if still_open {
            Err(self.open_error())
        } else {
            Ok(())
        }
    }

    fn open_error(&self) -> Error {
        Error::DependencyOpen {
            dependency: self.name.clone(),
        }
    }

    pub fn on_success(&self) {
        let mut st = self.lock();
        if st.state == CircuitState::HalfOpen {
            info!(dependency = %self.name, "circuit breaker moved to CLOSED");
        }
        st.state = CircuitState::Closed;
        st.consecutive_failures = 0;
        st.trial_started = None;
    }

    pub fn on_failure(&self) {
        let mut st = self.lock();
        st.consecutive_failures = st.consecutive_failures.saturating_add(1);
        st.last_failure = Some(Instant::now());
        st.trial_started = None;
        let should_open = st.state == CircuitState::HalfOpen
            || st.consecutive_failures >= self.cfg.failure_threshold;
        if should_open && st.state != CircuitState::Open {
            warn!(
                dependency = %self.name,
                failures = st.consecutive_failures,
                "circuit breaker moved to OPEN"
            );
        }
        if should_open {
            st.state = CircuitState::Open;
        }
    }

    /// Force the breaker back to CLOSED (operator action).
    pub fn reset(&self) {
        let mut st = self.lock();
        st.state = CircuitState::Closed;
        st.consecutive_failures = 0;
        st.last_failure = None;
        st.trial_started = None;
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let st = self.lock();
        let open_remaining_ms = match (st.state, st.last_failure) {
            (CircuitState::Open, Some(last)) => {
                let until = last + self.cfg.timeout;
                let now = Instant::now();
                (until > now).then(|| (until - now).as_millis() as u64)
            }
            _ => None,
        };
        CircuitBreakerSnapshot {
            state: st.state,
            failure_threshold: self.cfg.failure_threshold,
            timeout_ms: self.cfg.timeout.as_millis() as u64,
            consecutive_failures: st.consecutive_failures,
            open_remaining_ms,
        }
    }
}

impl CircuitBreaker {
    /// Check if a request is allowed (bool form of `allow`)
    pub fn allow_request(&self) -> bool {
        self.allow().is_ok()
    }
}

/// Breakers keyed by dependency name.
///
/// Unknown dependencies are always allowed; a breaker with the registry's
/// default config is created the first time an outcome is recorded for one.
pub struct CircuitBreakerRegistry {
    default_cfg: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(default_cfg: CircuitBreakerConfig) -> Self {
        Self {
            default_cfg,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a dependency with its own settings, replacing any previous breaker.
    pub fn register(&self, dependency: &str, cfg: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let breaker = Arc::new(CircuitBreaker::new(dependency, cfg));
        self.lock().insert(dependency.to_string(), breaker.clone());
        breaker
    }

    pub fn get(&self, dependency: &str) -> Option<Arc<CircuitBreaker>> {
        self.lock().get(dependency).cloned()
    }

    fn get_or_create(&self, dependency: &str) -> Arc<CircuitBreaker> {
        self.lock()
            .entry(dependency.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(dependency, self.default_cfg.clone())))
            .clone()
    }

    pub fn check(&self, dependency: &str) -> Result<()> {
        match self.get(dependency) {
            Some(b) => b.allow(),
            None => Ok(()),
        }
    }

    /// Reject early while `dependency` is open, without claiming a half-open trial.
    pub fn fail_fast(&self, dependency: &str) -> Result<()> {
        match self.get(dependency) {
            Some(b) => b.fail_fast(),
            None => Ok(()),
        }
    }

    pub fn allow(&self, dependency: &str) -> bool {
        self.check(dependency).is_ok()
    }

    pub fn on_success(&self, dependency: &str) {
        self.get_or_create(dependency).on_success();
    }

    pub fn on_failure(&self, dependency: &str) {
        self.get_or_create(dependency).on_failure();
    }

    pub fn snapshots(&self) -> Vec<(String, CircuitBreakerSnapshot)> {
        let breakers: Vec<Arc<CircuitBreaker>> = self.lock().values().cloned().collect();
        let mut out: Vec<_> = breakers
            .iter()
            .map(|b| (b.name().to_string(), b.snapshot()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, timeout_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "gemini",
            CircuitBreakerConfig::new()
                .with_failure_threshold(threshold)
                .with_timeout(Duration::from_millis(timeout_ms)),
        )
    }

    #[test]
    fn test_circuit_breaker_config_defaults() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert!(!config.single_trial);
    }

    #[test]
    fn test_circuit_breaker_initial_state() {
        let cb = breaker(5, 1000);
        assert!(cb.allow().is_ok());
        assert!(cb.allow_request());
        let snapshot = cb.snapshot();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.consecutive_failures, 0);
        assert!(snapshot.open_remaining_ms.is_none());
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let cb = breaker(3, 1000);
        cb.on_failure();
        cb.on_failure();
        cb.on_success();
        cb.on_failure();
        cb.on_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().consecutive_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_at_threshold_and_half_opens_after_timeout() {
        let cb = breaker(5, 60_000);
        for _ in 0..5 {
            cb.on_failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(matches!(cb.allow(), Err(Error::DependencyOpen { .. })));

        tokio::time::advance(Duration::from_secs(51)).await;
        assert!(cb.allow().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.on_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = breaker(2, 100);
        cb.on_failure();
        cb.on_failure();
        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(cb.allow().is_ok());
        cb.on_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());
        assert!(cb.snapshot().open_remaining_ms.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_relaxed_admits_concurrent_trials() {
        let cb = breaker(1, 100);
        cb.on_failure();
        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(cb.allow().is_ok());
        assert!(cb.allow().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_single_trial_gate() {
        let cb = CircuitBreaker::new(
            "gemini",
            CircuitBreakerConfig::new()
                .with_failure_threshold(1)
                .with_timeout(Duration::from_millis(100))
                .with_single_trial(true),
        );
        cb.on_failure();
        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(cb.allow().is_ok());
        assert!(cb.allow().is_err());
        cb.on_success();
        assert!(cb.allow().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreported_trial_lapses_after_timeout() {
        let cb = CircuitBreaker::new(
            "gemini",
            CircuitBreakerConfig::new()
                .with_failure_threshold(1)
                .with_timeout(Duration::from_secs(60))
                .with_single_trial(true),
        );
        cb.on_failure();
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cb.allow().is_ok());

        // trial caller went away without reporting
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(cb.allow().is_err());
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(cb.allow().is_ok());
        assert!(cb.allow().is_err());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.on_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_fast_does_not_claim_trial() {
        let cb = CircuitBreaker::new(
            "gemini",
            CircuitBreakerConfig::new()
                .with_failure_threshold(1)
                .with_timeout(Duration::from_millis(100))
                .with_single_trial(true),
        );
        cb.on_failure();
        assert!(matches!(cb.fail_fast(), Err(Error::DependencyOpen { .. })));
        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(cb.fail_fast().is_ok());
        assert!(cb.fail_fast().is_ok());
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.allow().is_ok());
    }

    #[test]
    fn test_circuit_breaker_thread_safe() {
        use std::thread;

        let cb = Arc::new(breaker(100, 1000));
        let mut handles = vec![];
        for _ in 0..10 {
            let cb_clone = Arc::clone(&cb);
            handles.push(thread::spawn(move || {
                for _ in 0..5 {
                    cb_clone.on_failure();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cb.snapshot().consecutive_failures, 50);
    }

    #[test]
    fn test_registry_unknown_dependency_allowed() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::new().with_failure_threshold(1));
        assert!(registry.allow("supabase"));
        registry.on_failure("supabase");
        assert!(!registry.allow("supabase"));
        assert!(registry.allow("gemini"));
        let names: Vec<_> = registry.snapshots().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["supabase".to_string()]);
    }

    #[test]
    fn test_registry_reset() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default());
        let b = registry.register("gemini", CircuitBreakerConfig::new().with_failure_threshold(1));
        registry.on_failure("gemini");
        assert!(registry.check("gemini").is_err());
        b.reset();
        assert!(registry.check("gemini").is_ok());
    }
}
