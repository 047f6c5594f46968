//! Per-endpoint circuit breaker
//!
//! A rolling window of the last `samples` outcomes trips the circuit when
//! the failure ratio reaches `threshold_percent`. An open circuit rejects
//! requests until `return_to_service_after` elapses, then admits a single
//! probe: success closes the circuit, failure re-opens it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::apidef::CircuitBreakerMeta;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
}

/// One endpoint's breaker.
pub struct CircuitBreaker {
    samples: usize,
    threshold: f64,
    cooldown: Duration,
    inner: RwLock<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(meta: &CircuitBreakerMeta) -> Self {
        Self {
            samples: meta.samples.max(1) as usize,
            threshold: meta.threshold_percent,
            cooldown: Duration::from_secs(meta.return_to_service_after.max(1) as u64),
            inner: RwLock::new(BreakerInner {
                state: CircuitState::Closed,
                window: VecDeque::new(),
                opened_at: None,
            }),
        }
    }

    /// Whether a request may pass. An open breaker flips to half-open once
    /// the recovery window has elapsed, admitting the probe.
    pub fn ready(&self) -> bool {
        let mut inner = self.inner.write().unwrap();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.cooldown)
                    .unwrap_or(true);
                if elapsed {
                    inner.state = CircuitState::HalfOpen;
                    tracing::info!("Circuit breaker half-open, allowing probe");
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a failed roundtrip (transport error or 5xx).
    pub fn fail(&self) {
        let mut inner = self.inner.write().unwrap();
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            tracing::warn!("Circuit breaker re-opened, probe failed");
            return;
        }

        inner.window.push_back(false);
        while inner.window.len() > self.samples {
            inner.window.pop_front();
        }

        if inner.state == CircuitState::Closed && inner.window.len() >= self.samples {
            let failures = inner.window.iter().filter(|ok| !**ok).count();
            let ratio = failures as f64 / inner.window.len() as f64;
            if ratio >= self.threshold {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.window.clear();
                tracing::warn!(ratio, "Circuit breaker opened, failure threshold reached");
            }
        }
    }

    /// Record a successful roundtrip.
    pub fn success(&self) {
        let mut inner = self.inner.write().unwrap();
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Closed;
            inner.window.clear();
            inner.opened_at = None;
            tracing::info!("Circuit breaker closed, service recovered");
            return;
        }
        inner.window.push_back(true);
        while inner.window.len() > self.samples {
            inner.window.pop_front();
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.read().unwrap().state
    }
}

/// Breakers keyed per endpoint, shared by every request to that endpoint.
#[derive(Default)]
pub struct BreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the breaker for an endpoint.
    pub fn breaker_for(&self, api_id: &str, meta: &CircuitBreakerMeta) -> Arc<CircuitBreaker> {
        let key = format!("{}:{}:{}", api_id, meta.method, meta.path);
        if let Some(breaker) = self.breakers.read().unwrap().get(&key) {
            return breaker.clone();
        }
        let mut breakers = self.breakers.write().unwrap();
        breakers
            .entry(key)
            .or_insert_with(|| Arc::new(CircuitBreaker::new(meta)))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.breakers.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> CircuitBreakerMeta {
        CircuitBreakerMeta {
            path: "/flaky".to_string(),
            method: "GET".to_string(),
            threshold_percent: 0.5,
            samples: 3,
            return_to_service_after: 1,
        }
    }

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(&meta())
    }

    // --- Trip criterion ---

    #[test]
    fn test_initially_closed() {
        let cb = breaker();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.ready());
    }

    #[test]
    fn test_trips_at_threshold() {
        let cb = breaker();
        cb.fail();
        cb.fail();
        assert!(cb.ready(), "below sample count, still closed");
        cb.fail();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.ready());
    }

    #[test]
    fn test_mixed_window_below_threshold() {
        let cb = breaker();
        cb.success();
        cb.success();
        cb.fail();
        // 1/3 failures < 0.5
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.ready());
    }

    #[test]
    fn test_mixed_window_at_threshold() {
        let cb = CircuitBreaker::new(&CircuitBreakerMeta {
            samples: 4,
            threshold_percent: 0.5,
            return_to_service_after: 1,
            ..meta()
        });
        cb.success();
        cb.fail();
        cb.success();
        cb.fail();
        // 2/4 == 0.5, trips
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_window_slides() {
        let cb = breaker();
        cb.fail();
        cb.fail();
        cb.success();
        cb.success();
        cb.success();
        // window now [ok, ok, ok]; a single failure is 1/3
        cb.fail();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    // --- Recovery ---

    #[test]
    fn test_half_open_probe_success_closes() {
        let cb = breaker();
        cb.fail();
        cb.fail();
        cb.fail();
        assert!(!cb.ready());

        std::thread::sleep(Duration::from_millis(1100));
        assert!(cb.ready());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.ready());
    }

    #[test]
    fn test_half_open_probe_failure_reopens() {
        let cb = breaker();
        cb.fail();
        cb.fail();
        cb.fail();
        std::thread::sleep(Duration::from_millis(1100));
        assert!(cb.ready());

        cb.fail();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.ready());
    }

    // --- Registry ---

    #[test]
    fn test_registry_shares_breaker_per_endpoint() {
        let registry = BreakerRegistry::new();
        let a1 = registry.breaker_for("api", &meta());
        let a2 = registry.breaker_for("api", &meta());
        assert!(Arc::ptr_eq(&a1, &a2));

        let other = registry.breaker_for("api", &CircuitBreakerMeta {
            path: "/other".to_string(),
            ..meta()
        });
        assert!(!Arc::ptr_eq(&a1, &other));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "closed");
        assert_eq!(CircuitState::Open.to_string(), "open");
        assert_eq!(CircuitState::HalfOpen.to_string(), "half-open");
    }
}
