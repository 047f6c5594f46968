//! In-memory loop for internal APIs
//!
//! Requests whose target is another API on the same process bypass the
//! network: the target spec is resolved by host (API name or ID) and the
//! request is dispatched in-process. Resolved entries are cached per host
//! and expire after one minute idle; a background sweep runs every five
//! minutes.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::registry::{ApiSpec, SpecRegistry};

pub const MAX_IDLE: Duration = Duration::from_secs(60);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Upper bound on chained internal-loop hops for one request.
pub const MAX_LOOP_LEVEL: usize = 5;

struct LoopEntry {
    spec: Arc<ApiSpec>,
    expires_at: Instant,
}

/// Host → target-spec cache with idle eviction.
#[derive(Default)]
pub struct LoopbackRegistry {
    entries: RwLock<HashMap<String, LoopEntry>>,
}

impl LoopbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve an internal host to its spec, touching the cache entry's
    /// idle deadline.
    pub fn resolve(&self, host: &str, registry: &SpecRegistry) -> Option<Arc<ApiSpec>> {
        {
            let mut entries = self.entries.write().unwrap();
            if let Some(entry) = entries.get_mut(host) {
                entry.expires_at = Instant::now() + MAX_IDLE;
                return Some(entry.spec.clone());
            }
        }

        let spec = registry.find_by_name_or_id(host)?;
        self.entries.write().unwrap().insert(
            host.to_string(),
            LoopEntry {
                spec: spec.clone(),
                expires_at: Instant::now() + MAX_IDLE,
            },
        );
        Some(spec)
    }

    /// Drop entries idle past their deadline.
    pub fn evict_idle(&self, now: Instant) -> usize {
        let mut entries = self.entries.write().unwrap();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Periodic eviction task; aborts with the returned handle.
    pub fn spawn_sweeper(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let evicted = registry.evict_idle(Instant::now());
                if evicted > 0 {
                    tracing::debug!(evicted, "Evicted idle loop providers");
                }
            }
        })
    }
}
