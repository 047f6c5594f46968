//! Service discovery cache
//!
//! TTL-cached resolution of dynamic upstream host lists. The first lookup
//! for a spec fetches from the discovery endpoint; concurrent callers
//! during a refresh observe the in-progress flag and get the last good
//! list without issuing a duplicate fetch. An empty result also falls
//! back to the last good list. The proxy invalidates the cache entry when
//! it classifies a request as an upstream timeout.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::apidef::HostList;
use crate::error::{GatewayError, Result};
use crate::registry::ApiSpec;

const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(120);

struct CacheEntry {
    hosts: HostList,
    expires_at: Instant,
}

/// TTL cache over discovery lookups, keyed by API ID.
pub struct ServiceCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    client: reqwest::Client,
    default_ttl: Duration,
}

impl Default for ServiceCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            default_ttl: DEFAULT_CACHE_TTL,
        }
    }

    /// Resolve the host list for a spec, consulting the cache first.
    pub async fn resolve(&self, spec: &ApiSpec) -> Result<HostList> {
        let has_run = spec.discovery.read().unwrap().has_run;

        if !has_run {
            tracing::debug!(api_id = spec.api_id(), "First discovery run, priming cache");
            return self.refresh(spec).await;
        }

        if let Some(hosts) = self.get(spec.api_id()) {
            return Ok(hosts);
        }

        // cache expired; only one caller refreshes, the rest ride the
        // last good list
        {
            let mut discovery = spec.discovery.write().unwrap();
            if discovery.refresh_in_progress {
                tracing::debug!(api_id = spec.api_id(), "Refresh in progress, returning last good list");
                return Ok(discovery.last_good_host_list.clone());
            }
            discovery.refresh_in_progress = true;
        }

        let result = self.refresh(spec).await;
        spec.discovery.write().unwrap().refresh_in_progress = false;
        result
    }

    /// Fetch from the discovery endpoint and cache the result.
    async fn refresh(&self, spec: &ApiSpec) -> Result<HostList> {
        let sd = &spec.definition.proxy.service_discovery;
        let fetched = self.fetch(&sd.query_endpoint, &sd.data_path).await;

        {
            let mut discovery = spec.discovery.write().unwrap();
            discovery.has_run = true;
        }

        let hosts = match fetched {
            Ok(hosts) => hosts,
            Err(e) => {
                tracing::error!(api_id = spec.api_id(), error = %e, "Discovery lookup failed");
                return Err(e);
            }
        };

        if hosts.is_empty() {
            tracing::warn!(
                api_id = spec.api_id(),
                "Discovery returned an empty host list, returning last good set"
            );
            return Ok(spec.discovery.read().unwrap().last_good_host_list.clone());
        }

        let ttl = sd
            .cache_options()
            .map(|secs| Duration::from_secs(secs as u64))
            .unwrap_or(self.default_ttl);
        self.set(spec.api_id(), hosts.clone(), ttl);
        spec.discovery.write().unwrap().last_good_host_list = hosts.clone();

        Ok(hosts)
    }

    async fn fetch(&self, endpoint: &str, data_path: &str) -> Result<HostList> {
        let body: Value = self
            .client
            .get(endpoint)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| GatewayError::UpstreamUnreachable(format!("discovery endpoint: {}", e)))?
            .json()
            .await?;

        Ok(extract_hosts(&body, data_path))
    }

    fn get(&self, api_id: &str) -> Option<HostList> {
        let entries = self.entries.read().unwrap();
        let entry = entries.get(api_id)?;
        if Instant::now() < entry.expires_at {
            Some(entry.hosts.clone())
        } else {
            None
        }
    }

    fn set(&self, api_id: &str, hosts: HostList, ttl: Duration) {
        self.entries.write().unwrap().insert(
            api_id.to_string(),
            CacheEntry {
                hosts,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Drop a cached entry (upstream timeout classification).
    pub fn invalidate(&self, api_id: &str) {
        self.entries.write().unwrap().remove(api_id);
    }

    /// Whether a live cache entry exists for the API.
    pub fn contains(&self, api_id: &str) -> bool {
        self.get(api_id).is_some()
    }
}

/// Pull a host list out of a discovery response. `data_path` navigates
/// nested objects dot-separated; the target may be a string, a list of
/// strings, or a list of objects carrying a `hostname` field.
fn extract_hosts(body: &Value, data_path: &str) -> HostList {
    let mut node = body;
    if !data_path.is_empty() {
        for part in data_path.split('.') {
            match node.get(part) {
                Some(next) => node = next,
                None => return HostList::new(),
            }
        }
    }

    let hosts = match node {
        Value::String(host) => vec![host.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(host) => Some(host.clone()),
                Value::Object(obj) => obj
                    .get("hostname")
                    .and_then(|h| h.as_str())
                    .map(|h| match obj.get("port").and_then(|p| p.as_u64()) {
                        Some(port) => format!("{}:{}", h, port),
                        None => h.to_string(),
                    }),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };

    HostList::from(hosts)
}
