//! Load-driven pool resizing.

use super::connection::ConnectionFactory;
use super::manager::ConnectionPool;
use serde::Serialize;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct AutoScalerConfig {
    pub enabled: bool,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    /// Minimum gap between two scaling actions.
    pub cooldown: Duration,
    /// Connections added or removed per action.
    pub step: usize,
}

impl Default for AutoScalerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            cooldown: Duration::from_secs(60),
            step: 2,
        }
    }
}

impl AutoScalerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_thresholds(mut self, scale_up: f64, scale_down: f64) -> Self {
        self.scale_up_threshold = scale_up;
        self.scale_down_threshold = scale_down;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_step(mut self, step: usize) -> Self {
        self.step = step;
        self
    }
}

/// Inputs for one load evaluation.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LoadSample {
    pub active: usize,
    pub max_size: usize,
    pub executing: usize,
    pub max_concurrent: usize,
    pub queue_len: usize,
}

impl LoadSample {
    /// `max(active/max_size, executing/max_concurrent, min(queue_len/100, 1))`
    pub fn load(&self) -> f64 {
        let ratio = |n: usize, d: usize| if d == 0 { 0.0 } else { n as f64 / d as f64 };
        let pool = ratio(self.active, self.max_size);
        let admission = ratio(self.executing, self.max_concurrent);
        let backlog = (self.queue_len as f64 / 100.0).min(1.0);
        pool.max(admission).max(backlog)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "action", content = "connections", rename_all = "snake_case")]
pub enum ScaleDecision {
    ScaledUp(usize),
    ScaledDown(usize),
    CoolingDown,
    Hold,
    Disabled,
}

/// Resizes a [`ConnectionPool`] within `[min_size, max_size]`.
pub struct AutoScaler {
    cfg: AutoScalerConfig,
    last_action: Mutex<Option<Instant>>,
}

impl AutoScaler {
    pub fn new(cfg: AutoScalerConfig) -> Self {
        Self {
            cfg,
            last_action: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &AutoScalerConfig {
        &self.cfg
    }

    /// Time left before another scaling action is permitted.
    pub fn cooldown_remaining(&self) -> Duration {
        let last = *self.last_action.lock().unwrap_or_else(|p| p.into_inner());
        match last {
            Some(at) => self.cfg.cooldown.saturating_sub(at.elapsed()),
            None => Duration::ZERO,
        }
    }

    /// Evaluate the load and grow or shrink the pool if warranted.
    pub async fn tick<F: ConnectionFactory>(&self, pool: &ConnectionPool<F>, sample: LoadSample) -> ScaleDecision {
        if !self.cfg.enabled {
            return ScaleDecision::Disabled;
        }
        let load = sample.load();
        let snap = pool.snapshot();
        let wants_up = load > self.cfg.scale_up_threshold && snap.total < snap.max_size;
        let wants_down = load < self.cfg.scale_down_threshold && snap.total > snap.min_size;
        if !wants_up && !wants_down {
            return ScaleDecision::Hold;
        }
        if !self.cooldown_remaining().is_zero() {
            debug!(load, "scaling skipped during cooldown");
            return ScaleDecision::CoolingDown;
        }

        let decision = if wants_up {
            let added = pool.grow(self.cfg.step).await;
            info!(load, added, total = snap.total + added, "pool scaled up");
            ScaleDecision::ScaledUp(added)
        } else {
            let removed = pool.shrink_idle(self.cfg.step);
            info!(load, removed, total = snap.total.saturating_sub(removed), "pool scaled down");
            ScaleDecision::ScaledDown(removed)
        };
        if matches!(decision, ScaleDecision::ScaledUp(n) | ScaleDecision::ScaledDown(n) if n > 0) {
            *self.last_action.lock().unwrap_or_else(|p| p.into_inner()) = Some(Instant::now());
        }
        decision
    }
}
