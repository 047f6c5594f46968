//! Key/value store handle
//!
//! Sessions, OAuth clients, quota counters, and response caches live in an
//! external store; the gateway holds a handle and treats every read/write
//! as remote. The store must serialize writes per key itself. The in-memory
//! implementation backs tests and single-node deployments.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::error::{GatewayError, Result};

/// Storage handle used by the session manager and the OAuth registry.
pub trait KeyValueStore: Send + Sync {
    fn get_key(&self, key: &str) -> Result<String>;

    /// Set a key with a time-to-live in seconds; `ttl <= 0` means no expiry.
    fn set_key(&self, key: &str, value: &str, ttl: i64) -> Result<()>;

    /// Remove a key, reporting whether it existed.
    fn delete_key(&self, key: &str) -> bool;

    /// List keys starting with the given prefix ("" lists everything).
    fn get_keys(&self, prefix: &str) -> Vec<String>;

    /// Remove every key starting with the given prefix, returning the count.
    fn delete_by_prefix(&self, prefix: &str) -> usize;

    /// Add a member to a sorted set with the given score.
    fn add_to_sorted_set(&self, key: &str, value: &str, score: f64);

    /// Members of a sorted set with scores within `[from, to]`, ascending.
    fn sorted_set_range(&self, key: &str, from: f64, to: f64) -> (Vec<String>, Vec<f64>);

    /// Remove members of a sorted set with scores within `[from, to]`.
    fn remove_sorted_set_range(&self, key: &str, from: f64, to: f64) -> usize;
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        match self.expires_at {
            Some(at) => Instant::now() < at,
            None => true,
        }
    }
}

/// Process-local store: RW-guarded maps with lazy expiry.
#[derive(Default)]
pub struct InMemoryStore {
    entries: RwLock<HashMap<String, Entry>>,
    sorted_sets: RwLock<HashMap<String, Vec<(String, f64)>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for InMemoryStore {
    fn get_key(&self, key: &str) -> Result<String> {
        let entries = self.entries.read().unwrap();
        match entries.get(key) {
            Some(entry) if entry.live() => Ok(entry.value.clone()),
            _ => Err(GatewayError::NotFound(format!("key {}", key))),
        }
    }

    fn set_key(&self, key: &str, value: &str, ttl: i64) -> Result<()> {
        let expires_at = if ttl > 0 {
            Some(Instant::now() + Duration::from_secs(ttl as u64))
        } else {
            None
        };
        self.entries.write().unwrap().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    fn delete_key(&self, key: &str) -> bool {
        self.entries.write().unwrap().remove(key).is_some()
    }

    fn get_keys(&self, prefix: &str) -> Vec<String> {
        let entries = self.entries.read().unwrap();
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(k, v)| k.starts_with(prefix) && v.live())
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    fn delete_by_prefix(&self, prefix: &str) -> usize {
        let mut entries = self.entries.write().unwrap();
        let before = entries.len();
        entries.retain(|k, _| !k.starts_with(prefix));
        before - entries.len()
    }

    fn add_to_sorted_set(&self, key: &str, value: &str, score: f64) {
        let mut sets = self.sorted_sets.write().unwrap();
        let set = sets.entry(key.to_string()).or_default();
        set.retain(|(v, _)| v != value);
        set.push((value.to_string(), score));
        set.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
    }

    fn sorted_set_range(&self, key: &str, from: f64, to: f64) -> (Vec<String>, Vec<f64>) {
        let sets = self.sorted_sets.read().unwrap();
        let mut values = Vec::new();
        let mut scores = Vec::new();
        if let Some(set) = sets.get(key) {
            for (v, s) in set {
                if *s >= from && *s <= to {
                    values.push(v.clone());
                    scores.push(*s);
                }
            }
        }
        (values, scores)
    }

    fn remove_sorted_set_range(&self, key: &str, from: f64, to: f64) -> usize {
        let mut sets = self.sorted_sets.write().unwrap();
        if let Some(set) = sets.get_mut(key) {
            let before = set.len();
            set.retain(|(_, s)| *s < from || *s > to);
            before - set.len()
        } else {
            0
        }
    }
}
