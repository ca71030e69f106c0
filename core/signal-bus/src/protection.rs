//! Per-event load shedding: circuit breakers and sliding-window rate limiters

use crate::config::ProtectionConfig;
use crate::error::BlockReason;
use crate::metrics::MetricsSnapshot;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const RATE_WINDOW: Duration = Duration::from_secs(1);

/// Error rate above which a metrics sweep counts as a breaker failure
const ERROR_RATE_TRIP: f64 = 0.5;

// ============================================================================
// Circuit breaker
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    trial_count: u32,
}

/// Three-state breaker guarding one event
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    open_timeout: Duration,
    half_open_trials: u32,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, open_timeout: Duration, half_open_trials: u32) -> Self {
        Self {
            failure_threshold,
            open_timeout,
            half_open_trials,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                trial_count: 0,
            }),
        }
    }

    pub fn from_config(config: &ProtectionConfig) -> Self {
        Self::new(
            config.failure_threshold,
            Duration::from_millis(config.open_timeout_ms),
            config.half_open_trials,
        )
    }

    /// True while the breaker rejects traffic.
    ///
    /// An open breaker whose timeout has elapsed moves to half-open here.
    pub fn is_open(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::Open {
            let cooled = inner
                .last_failure
                .map_or(true, |at| at.elapsed() > self.open_timeout);
            if cooled {
                debug!("Circuit breaker half-open");
                inner.state = CircuitState::HalfOpen;
                inner.trial_count = 0;
            }
        }
        inner.state == CircuitState::Open
    }

    /// Current state without triggering the timed transition
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.trial_count += 1;
                if inner.trial_count >= self.half_open_trials {
                    Self::reset(&mut inner);
                }
            }
            CircuitState::Closed => Self::reset(&mut inner),
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            Self::trip(&mut inner);
            return;
        }

        inner.failure_count += 1;
        if inner.failure_count >= self.failure_threshold {
            Self::trip(&mut inner);
        }
    }

    fn trip(inner: &mut BreakerState) {
        inner.state = CircuitState::Open;
        inner.last_failure = Some(Instant::now());
        inner.failure_count = 0;
        inner.trial_count = 0;
    }

    fn reset(inner: &mut BreakerState) {
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.trial_count = 0;
    }
}

// ============================================================================
// Rate limiter
// ============================================================================

/// Sliding one-second admission window
#[derive(Debug)]
pub struct RateLimiter {
    max_requests_per_second: usize,
    window: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_requests_per_second: usize) -> Self {
        Self {
            max_requests_per_second,
            window: Mutex::new(VecDeque::with_capacity(max_requests_per_second)),
        }
    }

    /// Admit one request if the window has room, consuming a slot
    pub fn allow_request(&self) -> bool {
        let now = Instant::now();
        let mut window = self.window.lock();
        Self::evict(&mut window, now);

        if window.len() < self.max_requests_per_second {
            window.push_back(now);
            true
        } else {
            false
        }
    }

    /// Would a request be admitted right now? Consumes nothing.
    pub fn can_allow_request(&self) -> bool {
        let now = Instant::now();
        let mut window = self.window.lock();
        Self::evict(&mut window, now);
        window.len() < self.max_requests_per_second
    }

    pub fn max_requests_per_second(&self) -> usize {
        self.max_requests_per_second
    }

    fn evict(window: &mut VecDeque<Instant>, now: Instant) {
        while let Some(oldest) = window.front() {
            if now.duration_since(*oldest) > RATE_WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Outcome of the admission check made on the emit path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Blocked(BlockReason),
}

/// Owns the breakers and limiters of every event
#[derive(Default)]
pub struct SignalProtectionManager {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    limiters: DashMap<String, Arc<RateLimiter>>,
}

impl SignalProtectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read-only check: breaker open or limiter window saturated
    pub fn is_blocked(&self, event: &str) -> bool {
        self.breaker_open(event)
            || self
                .limiter(event)
                .is_some_and(|limiter| !limiter.can_allow_request())
    }

    /// Admission for one emission; consumes a limiter slot when admitted
    pub fn try_acquire(&self, event: &str) -> Admission {
        if self.breaker_open(event) {
            return Admission::Blocked(BlockReason::CircuitOpen);
        }
        match self.limiter(event) {
            Some(limiter) if !limiter.allow_request() => Admission::Blocked(BlockReason::RateLimited),
            _ => Admission::Admitted,
        }
    }

    pub fn record_success(&self, event: &str) {
        if let Some(breaker) = self.circuit_breaker(event) {
            breaker.record_success();
        }
    }

    pub fn record_failure(&self, event: &str) {
        if let Some(breaker) = self.circuit_breaker(event) {
            breaker.record_failure();
        }
    }

    /// Feed the breaker from aggregated metrics: an error rate above one
    /// half counts as a failure, anything else as a success.
    pub fn update_from_metrics(&self, event: &str, snapshot: &MetricsSnapshot) {
        let Some(breaker) = self.circuit_breaker(event) else {
            return;
        };
        if snapshot.emit_count == 0 {
            return;
        }

        let error_rate = snapshot.error_count as f64 / snapshot.emit_count as f64;
        if error_rate > ERROR_RATE_TRIP {
            breaker.record_failure();
        } else {
            breaker.record_success();
        }
    }

    pub fn register_circuit_breaker(&self, event: impl Into<String>, breaker: CircuitBreaker) {
        self.breakers.insert(event.into(), Arc::new(breaker));
    }

    pub fn register_rate_limiter(&self, event: impl Into<String>, limiter: RateLimiter) {
        self.limiters.insert(event.into(), Arc::new(limiter));
    }

    /// Register default protection for an event that has none yet
    pub fn auto_configure(&self, event: &str, config: &ProtectionConfig) {
        if !config.enabled {
            return;
        }

        let mut configured = false;
        self.breakers.entry(event.to_string()).or_insert_with(|| {
            configured = true;
            Arc::new(CircuitBreaker::from_config(config))
        });
        self.limiters.entry(event.to_string()).or_insert_with(|| {
            configured = true;
            Arc::new(RateLimiter::new(config.max_requests_per_second))
        });

        if configured {
            info!(
                event = %event,
                failure_threshold = config.failure_threshold,
                max_rps = config.max_requests_per_second,
                "Protection configured"
            );
        }
    }

    pub fn circuit_breaker(&self, event: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(event).map(|b| b.value().clone())
    }

    pub fn rate_limiter(&self, event: &str) -> Option<Arc<RateLimiter>> {
        self.limiter(event)
    }

    pub fn remove_protection(&self, event: &str) {
        self.breakers.remove(event);
        self.limiters.remove(event);
    }

    pub fn clear_all(&self) {
        self.breakers.clear();
        self.limiters.clear();
    }

    fn breaker_open(&self, event: &str) -> bool {
        self.circuit_breaker(event).is_some_and(|b| b.is_open())
    }

    fn limiter(&self, event: &str) -> Option<Arc<RateLimiter>> {
        self.limiters.get(event).map(|l| l.value().clone())
    }
}
