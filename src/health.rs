//! Per-API health counters
//!
//! Rolling request/error counters surfaced by the admin health endpoint
//! when health checks are enabled.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

#[derive(Default)]
struct ApiCounters {
    requests: AtomicU64,
    errors: AtomicU64,
    latency_total_ms: AtomicU64,
}

/// Snapshot returned by `GET /tyk/health`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ApiHealthSnapshot {
    pub requests: u64,
    pub errors: u64,
    pub average_latency_ms: f64,
}

/// Tracks counters per API ID.
#[derive(Default)]
pub struct HealthTracker {
    enabled: bool,
    counters: RwLock<HashMap<String, Arc<ApiCounters>>>,
}

impl HealthTracker {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            counters: RwLock::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn record(&self, api_id: &str, status: u16, latency_ms: u64) {
        if !self.enabled {
            return;
        }
        let counters = self.counters_for(api_id);
        counters.requests.fetch_add(1, Ordering::Relaxed);
        counters.latency_total_ms.fetch_add(latency_ms, Ordering::Relaxed);
        if status >= 500 {
            counters.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self, api_id: &str) -> ApiHealthSnapshot {
        let counters = self.counters_for(api_id);
        let requests = counters.requests.load(Ordering::Relaxed);
        let total = counters.latency_total_ms.load(Ordering::Relaxed);
        ApiHealthSnapshot {
            requests,
            errors: counters.errors.load(Ordering::Relaxed),
            average_latency_ms: if requests == 0 {
                0.0
            } else {
                total as f64 / requests as f64
            },
        }
    }

    fn counters_for(&self, api_id: &str) -> Arc<ApiCounters> {
        if let Some(counters) = self.counters.read().unwrap().get(api_id) {
            return counters.clone();
        }
        self.counters
            .write()
            .unwrap()
            .entry(api_id.to_string())
            .or_default()
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let tracker = HealthTracker::new(true);
        tracker.record("api", 200, 10);
        tracker.record("api", 502, 30);

        let snap = tracker.snapshot("api");
        assert_eq!(snap.requests, 2);
        assert_eq!(snap.errors, 1);
        assert_eq!(snap.average_latency_ms, 20.0);
    }

    #[test]
    fn test_disabled_tracker_records_nothing() {
        let tracker = HealthTracker::new(false);
        tracker.record("api", 500, 10);
        assert_eq!(tracker.snapshot("api").requests, 0);
    }

    #[test]
    fn test_unknown_api_empty_snapshot() {
        let tracker = HealthTracker::new(true);
        let snap = tracker.snapshot("never-seen");
        assert_eq!(snap.requests, 0);
        assert_eq!(snap.average_latency_ms, 0.0);
    }
}
