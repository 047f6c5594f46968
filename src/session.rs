//! Sessions, policies, and the session-store facade
//!
//! A session is the per-credential state consulted by the proxy middleware
//! and mutated by the control plane. Policies are named bundles of access
//! rights and limits that merge into sessions on application. All session
//! reads and writes go through [`SessionManager`], a facade over the
//! external key/value store handle.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::headers::{QUOTA_KEY_PREFIX, RATE_LIMIT_KEY_PREFIX};
use crate::keys;
use crate::storage::KeyValueStore;

const SESSION_PREFIX: &str = "apikey-";

/// Hash algorithm tag stored alongside a basic-auth password.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BasicAuthHash {
    #[default]
    #[serde(rename = "")]
    Plaintext,
    Bcrypt,
    Sha256,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BasicAuthData {
    pub password: String,
    pub hash_type: BasicAuthHash,
}

/// Per-API quota/rate bounds inside an access definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApiLimit {
    pub rate: f64,
    pub per: f64,
    pub quota_max: i64,
    pub quota_renews: i64,
    pub quota_remaining: i64,
    pub quota_renewal_rate: i64,
}

impl ApiLimit {
    pub fn is_empty(&self) -> bool {
        *self == ApiLimit::default()
    }
}

/// What a session may do against one API.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AccessDefinition {
    pub api_name: String,
    pub api_id: String,
    pub versions: Vec<String>,
    pub limit: ApiLimit,
    pub allowance_scope: String,
}

/// Per-credential state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionState {
    pub org_id: String,
    pub key_id: String,
    pub alias: String,

    pub rate: f64,
    pub per: f64,
    pub quota_max: i64,
    pub quota_renews: i64,
    pub quota_remaining: i64,
    pub quota_renewal_rate: i64,

    /// Unix seconds; 0 or negative means no expiry
    pub expires: i64,

    pub access_rights: HashMap<String, AccessDefinition>,

    pub basic_auth_data: BasicAuthData,
    pub hmac_enabled: bool,
    pub hmac_secret: String,
    pub certificate: String,

    pub apply_policies: Vec<String>,
    pub tags: Vec<String>,
    pub meta_data: HashMap<String, serde_json::Value>,

    pub date_created: i64,
    /// Unix seconds as a string; feeds the rate limiter's period tracking
    pub last_updated: String,

    pub session_lifetime: i64,
}

impl SessionState {
    pub fn is_basic_auth(&self) -> bool {
        !self.basic_auth_data.password.is_empty()
    }

    /// Session lifetime in seconds considering the API's setting and the
    /// global override; the larger of key-expiry-derived and API lifetime
    /// wins when the API respects key expiration.
    pub fn lifetime(
        &self,
        respects_key_expiration: bool,
        api_lifetime: i64,
        force_global: bool,
        global_lifetime: i64,
    ) -> i64 {
        if force_global {
            return global_lifetime;
        }
        if respects_key_expiration && self.expires > 0 {
            let until_expiry = self.expires - now_unix();
            if until_expiry > api_lifetime {
                return until_expiry;
            }
        }
        if api_lifetime > 0 {
            return api_lifetime;
        }
        0
    }
}

/// Which policy fields merge into the session.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PolicyPartitions {
    pub quota: bool,
    pub rate_limit: bool,
    pub acl: bool,
    pub complexity: bool,
    pub per_api: bool,
}

impl PolicyPartitions {
    fn any(&self) -> bool {
        self.quota || self.rate_limit || self.acl || self.complexity || self.per_api
    }
}

/// A named bundle of access rights and limits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    pub id: String,
    pub org_id: String,
    pub rate: f64,
    pub per: f64,
    pub quota_max: i64,
    pub quota_renewal_rate: i64,
    pub access_rights: HashMap<String, AccessDefinition>,
    /// Forced expiry applied to newly-created keys, in seconds
    pub key_expires_in: i64,
    pub partitions: PolicyPartitions,
    pub tags: Vec<String>,
    pub meta_data: HashMap<String, serde_json::Value>,
    pub active: bool,
}

/// Concurrently-read policy catalog, reloaded as a whole.
#[derive(Default)]
pub struct PolicyMap {
    policies: RwLock<HashMap<String, Policy>>,
}

impl PolicyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Policy> {
        self.policies.read().unwrap().get(id).cloned()
    }

    pub fn all(&self) -> HashMap<String, Policy> {
        self.policies.read().unwrap().clone()
    }

    pub fn set(&self, policy: Policy) {
        self.policies
            .write()
            .unwrap()
            .insert(policy.id.clone(), policy);
    }

    pub fn remove(&self, id: &str) -> bool {
        self.policies.write().unwrap().remove(id).is_some()
    }

    pub fn swap(&self, new_set: HashMap<String, Policy>) {
        *self.policies.write().unwrap() = new_set;
    }

    pub fn len(&self) -> usize {
        self.policies.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load `{id}.json` files from the policy directory.
    pub fn load_from_dir(&self, dir: impl AsRef<Path>) -> Result<usize> {
        let mut loaded = HashMap::new();
        let entries = match std::fs::read_dir(dir.as_ref()) {
            Ok(entries) => entries,
            Err(_) => {
                self.swap(loaded);
                return Ok(0);
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = std::fs::read_to_string(&path)?;
            match serde_json::from_str::<Policy>(&raw) {
                Ok(mut policy) => {
                    if policy.id.is_empty() {
                        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                            policy.id = stem.to_string();
                        }
                    }
                    loaded.insert(policy.id.clone(), policy);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unparseable policy file");
                }
            }
        }
        let count = loaded.len();
        self.swap(loaded);
        Ok(count)
    }
}

/// Merge the session's `apply_policies` into its own fields. Tags are
/// set-unioned, metadata is key-unioned, access rights follow the policy
/// partitions.
pub fn apply_policies(session: &mut SessionState, policies: &PolicyMap) -> Result<()> {
    let policy_ids = session.apply_policies.clone();
    let mut tags: HashSet<String> = session.tags.iter().cloned().collect();

    for policy_id in &policy_ids {
        let policy = policies.get(policy_id).ok_or_else(|| {
            GatewayError::ValidationFailed(format!("Policy not found: {}", policy_id))
        })?;

        if !policy.active {
            return Err(GatewayError::ValidationFailed(format!(
                "Policy {} is not active",
                policy_id
            )));
        }

        let partitions = &policy.partitions;
        let unpartitioned = !partitions.any();

        if unpartitioned || partitions.acl || partitions.per_api {
            for (api_id, access) in &policy.access_rights {
                let mut access = access.clone();
                access.api_id = api_id.clone();
                if !partitions.per_api {
                    // ACL-only merges drop policy-level limits
                    if !partitions.quota && !partitions.rate_limit && !unpartitioned {
                        access.limit = ApiLimit::default();
                    }
                }
                session.access_rights.insert(api_id.clone(), access);
            }
        }

        if unpartitioned || partitions.quota {
            session.quota_max = policy.quota_max;
            session.quota_renewal_rate = policy.quota_renewal_rate;
        }

        if unpartitioned || partitions.rate_limit {
            session.rate = policy.rate;
            session.per = policy.per;
        }

        for tag in &policy.tags {
            tags.insert(tag.clone());
        }
        for (k, v) in &policy.meta_data {
            session.meta_data.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }

    let mut merged: Vec<String> = tags.into_iter().collect();
    merged.sort();
    session.tags = merged;

    Ok(())
}

/// Forced expiry for new keys: any applied policy with `key_expires_in`
/// stamps a fresh expiry iff the key does not already exist.
pub fn check_and_apply_trial_period(
    key_name: &str,
    session: &mut SessionState,
    policies: &PolicyMap,
    manager: &SessionManager,
    hashed: bool,
) {
    for policy_id in session.apply_policies.clone() {
        let Some(policy) = policies.get(&policy_id) else {
            continue;
        };
        if policy.key_expires_in > 0
            && manager.session_detail(&session.org_id, key_name, hashed).is_none()
        {
            session.expires = now_unix() + policy.key_expires_in;
        }
    }
}

/// Hash a basic-auth password with the configured algorithm; hash failure
/// falls back to plaintext.
pub fn set_basic_auth_password(session: &mut SessionState, config: &Config) {
    let algo = match config.basic_auth_hash_key_function.as_str() {
        "sha256" => BasicAuthHash::Sha256,
        _ => BasicAuthHash::Bcrypt,
    };

    match algo {
        BasicAuthHash::Bcrypt => match bcrypt::hash(&session.basic_auth_data.password, 10) {
            Ok(hashed) => {
                session.basic_auth_data.password = hashed;
                session.basic_auth_data.hash_type = BasicAuthHash::Bcrypt;
            }
            Err(e) => {
                tracing::error!(error = %e, "Could not hash password, storing plaintext");
                session.basic_auth_data.hash_type = BasicAuthHash::Plaintext;
            }
        },
        BasicAuthHash::Sha256 => {
            session.basic_auth_data.password =
                keys::hash_str(&session.basic_auth_data.password, "sha256");
            session.basic_auth_data.hash_type = BasicAuthHash::Sha256;
        }
        BasicAuthHash::Plaintext => {}
    }
}

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Facade over the external store: session CRUD with hashed-or-plain key
/// identity and quota-counter lifecycle.
pub struct SessionManager {
    store: Arc<dyn KeyValueStore>,
    hash_keys: bool,
    hash_algo: String,
}

impl SessionManager {
    pub fn new(store: Arc<dyn KeyValueStore>, config: &Config) -> Self {
        Self {
            store,
            hash_keys: config.hash_keys,
            hash_algo: config.hash_key_function.clone(),
        }
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    /// The storage hash for a key (identity when hashing is disabled).
    pub fn key_hash(&self, key: &str) -> String {
        keys::hash_key(key, self.hash_keys, &self.hash_algo)
    }

    fn storage_key(&self, key: &str, already_hashed: bool) -> String {
        if already_hashed {
            format!("{}{}", SESSION_PREFIX, key)
        } else {
            format!("{}{}", SESSION_PREFIX, self.key_hash(key))
        }
    }

    /// Fetch a session. `key_id` on the result carries the addressed key.
    pub fn session_detail(&self, _org_id: &str, key: &str, hashed: bool) -> Option<SessionState> {
        let raw = self.store.get_key(&self.storage_key(key, hashed)).ok()?;
        let mut session: SessionState = serde_json::from_str(&raw).ok()?;
        if session.key_id.is_empty() {
            session.key_id = key.to_string();
        }
        Some(session)
    }

    /// Persist a session with the given lifetime (0 = no expiry).
    pub fn update_session(
        &self,
        key: &str,
        session: &SessionState,
        lifetime: i64,
        hashed: bool,
    ) -> Result<()> {
        let raw = serde_json::to_string(session)?;
        self.store
            .set_key(&self.storage_key(key, hashed), &raw, lifetime)
            .map_err(|e| GatewayError::PersistenceFailure(e.to_string()))
    }

    /// Remove a session, reporting whether it existed.
    pub fn remove_session(&self, _org_id: &str, key: &str, hashed: bool) -> bool {
        self.store.delete_key(&self.storage_key(key, hashed))
    }

    /// Drop quota and rate counters for a key. Counters live under their
    /// own prefixed keys and outlive session deletion otherwise.
    pub fn reset_quota(&self, key: &str, session: &SessionState, hashed: bool) {
        let hash = if hashed {
            key.to_string()
        } else {
            self.key_hash(key)
        };
        self.store.delete_key(&format!("{}{}", QUOTA_KEY_PREFIX, hash));
        self.store
            .delete_key(&format!("{}{}", RATE_LIMIT_KEY_PREFIX, hash));

        for access in session.access_rights.values() {
            if !access.allowance_scope.is_empty() {
                self.store.delete_key(&format!(
                    "{}{}-{}",
                    QUOTA_KEY_PREFIX, access.allowance_scope, hash
                ));
            }
        }
    }

    /// Remaining quota for a key computed from the stored counter.
    pub fn quota_remaining(&self, key: &str, session: &SessionState, hashed: bool) -> i64 {
        if session.quota_max == -1 {
            return -1;
        }
        let hash = if hashed {
            key.to_string()
        } else {
            self.key_hash(key)
        };
        let used = self
            .store
            .get_key(&format!("{}{}", QUOTA_KEY_PREFIX, hash))
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        (session.quota_max - used).max(0)
    }

    /// List stored session keys, skipping quota and rate counters.
    pub fn sessions(&self, filter: &str) -> Vec<String> {
        self.store
            .get_keys(&format!("{}{}", SESSION_PREFIX, filter))
            .into_iter()
            .map(|k| k.trim_start_matches(SESSION_PREFIX).to_string())
            .filter(|k| !k.starts_with(QUOTA_KEY_PREFIX) && !k.starts_with(RATE_LIMIT_KEY_PREFIX))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;

    fn manager() -> SessionManager {
        SessionManager::new(Arc::new(InMemoryStore::new()), &Config::default())
    }

    fn policy(id: &str) -> Policy {
        Policy {
            id: id.to_string(),
            active: true,
            rate: 100.0,
            per: 60.0,
            quota_max: 1000,
            quota_renewal_rate: 3600,
            access_rights: [(
                "api-1".to_string(),
                AccessDefinition {
                    api_name: "API One".to_string(),
                    api_id: "api-1".to_string(),
                    versions: vec!["Default".to_string()],
                    ..AccessDefinition::default()
                },
            )]
            .into(),
            ..Policy::default()
        }
    }

    // --- Policy application ---

    #[test]
    fn test_apply_unpartitioned_policy() {
        let policies = PolicyMap::new();
        policies.set(policy("pol-1"));

        let mut session = SessionState {
            apply_policies: vec!["pol-1".to_string()],
            ..SessionState::default()
        };
        apply_policies(&mut session, &policies).unwrap();

        assert_eq!(session.rate, 100.0);
        assert_eq!(session.quota_max, 1000);
        assert!(session.access_rights.contains_key("api-1"));
    }

    #[test]
    fn test_apply_policy_missing() {
        let policies = PolicyMap::new();
        let mut session = SessionState {
            apply_policies: vec!["ghost".to_string()],
            ..SessionState::default()
        };
        assert!(apply_policies(&mut session, &policies).is_err());
    }

    #[test]
    fn test_apply_policy_inactive() {
        let policies = PolicyMap::new();
        let mut inactive = policy("pol-1");
        inactive.active = false;
        policies.set(inactive);

        let mut session = SessionState {
            apply_policies: vec!["pol-1".to_string()],
            ..SessionState::default()
        };
        assert!(apply_policies(&mut session, &policies).is_err());
    }

    #[test]
    fn test_apply_quota_partition_only() {
        let policies = PolicyMap::new();
        let mut quota_only = policy("pol-q");
        quota_only.partitions.quota = true;
        policies.set(quota_only);

        let mut session = SessionState {
            rate: 5.0,
            apply_policies: vec!["pol-q".to_string()],
            ..SessionState::default()
        };
        apply_policies(&mut session, &policies).unwrap();

        assert_eq!(session.quota_max, 1000);
        // rate untouched, rights untouched
        assert_eq!(session.rate, 5.0);
        assert!(session.access_rights.is_empty());
    }

    #[test]
    fn test_tags_set_union_and_metadata_key_union() {
        let policies = PolicyMap::new();
        let mut p = policy("pol-1");
        p.tags = vec!["team-a".to_string(), "shared".to_string()];
        p.meta_data
            .insert("origin".to_string(), serde_json::json!("policy"));
        p.meta_data
            .insert("tier".to_string(), serde_json::json!("gold"));
        policies.set(p);

        let mut session = SessionState {
            apply_policies: vec!["pol-1".to_string()],
            tags: vec!["shared".to_string(), "manual".to_string()],
            meta_data: [("origin".to_string(), serde_json::json!("session"))].into(),
            ..SessionState::default()
        };
        apply_policies(&mut session, &policies).unwrap();

        assert_eq!(session.tags, vec!["manual", "shared", "team-a"]);
        // session values win on key collision
        assert_eq!(session.meta_data["origin"], serde_json::json!("session"));
        assert_eq!(session.meta_data["tier"], serde_json::json!("gold"));
    }

    #[test]
    fn test_apply_policies_idempotent() {
        let policies = PolicyMap::new();
        policies.set(policy("pol-1"));

        let mut session = SessionState {
            apply_policies: vec!["pol-1".to_string()],
            ..SessionState::default()
        };
        apply_policies(&mut session, &policies).unwrap();
        let first = session.clone();
        apply_policies(&mut session, &policies).unwrap();

        assert_eq!(session.tags, first.tags);
        assert_eq!(session.access_rights.len(), first.access_rights.len());
        assert_eq!(session.quota_max, first.quota_max);
    }

    // --- Trial period ---

    #[test]
    fn test_trial_period_new_key_only() {
        let mgr = manager();
        let policies = PolicyMap::new();
        let mut trial = policy("trial");
        trial.key_expires_in = 600;
        policies.set(trial);

        let mut session = SessionState {
            apply_policies: vec!["trial".to_string()],
            ..SessionState::default()
        };
        check_and_apply_trial_period("newkey", &mut session, &policies, &mgr, false);
        assert!(session.expires >= now_unix() + 590);

        // existing key keeps its expiry
        mgr.update_session("existing", &session, 0, false).unwrap();
        let mut session2 = SessionState {
            apply_policies: vec!["trial".to_string()],
            expires: 42,
            ..SessionState::default()
        };
        check_and_apply_trial_period("existing", &mut session2, &policies, &mgr, false);
        assert_eq!(session2.expires, 42);
    }

    // --- Session manager ---

    #[test]
    fn test_session_crud() {
        let mgr = manager();
        let session = SessionState {
            org_id: "org-1".to_string(),
            ..SessionState::default()
        };
        mgr.update_session("key-1", &session, 0, false).unwrap();

        let fetched = mgr.session_detail("org-1", "key-1", false).unwrap();
        assert_eq!(fetched.org_id, "org-1");
        assert_eq!(fetched.key_id, "key-1");

        assert!(mgr.remove_session("org-1", "key-1", false));
        assert!(mgr.session_detail("org-1", "key-1", false).is_none());
        assert!(!mgr.remove_session("org-1", "key-1", false));
    }

    #[test]
    fn test_hashed_addressing() {
        let store: Arc<dyn KeyValueStore> = Arc::new(InMemoryStore::new());
        let mut config = Config::default();
        config.hash_keys = true;
        let mgr = SessionManager::new(store, &config);

        let session = SessionState::default();
        mgr.update_session("raw-key", &session, 0, false).unwrap();

        let hash = mgr.key_hash("raw-key");
        assert_ne!(hash, "raw-key");
        // addressable both raw and by hash
        assert!(mgr.session_detail("", "raw-key", false).is_some());
        assert!(mgr.session_detail("", &hash, true).is_some());
    }

    #[test]
    fn test_reset_quota_removes_counters() {
        let mgr = manager();
        let hash = mgr.key_hash("key-1");
        mgr.store()
            .set_key(&format!("{}{}", QUOTA_KEY_PREFIX, hash), "7", 0)
            .unwrap();
        mgr.store()
            .set_key(&format!("{}{}", RATE_LIMIT_KEY_PREFIX, hash), "3", 0)
            .unwrap();

        mgr.reset_quota("key-1", &SessionState::default(), false);
        assert!(mgr
            .store()
            .get_key(&format!("{}{}", QUOTA_KEY_PREFIX, hash))
            .is_err());
        assert!(mgr
            .store()
            .get_key(&format!("{}{}", RATE_LIMIT_KEY_PREFIX, hash))
            .is_err());
    }

    #[test]
    fn test_quota_remaining() {
        let mgr = manager();
        let mut session = SessionState::default();
        session.quota_max = 10;
        let hash = mgr.key_hash("key-1");
        mgr.store()
            .set_key(&format!("{}{}", QUOTA_KEY_PREFIX, hash), "4", 0)
            .unwrap();
        assert_eq!(mgr.quota_remaining("key-1", &session, false), 6);

        session.quota_max = -1;
        assert_eq!(mgr.quota_remaining("key-1", &session, false), -1);
    }

    #[test]
    fn test_sessions_listing_skips_counters() {
        let mgr = manager();
        mgr.update_session("key-1", &SessionState::default(), 0, false)
            .unwrap();
        mgr.update_session("key-2", &SessionState::default(), 0, false)
            .unwrap();
        let listed = mgr.sessions("");
        assert_eq!(listed.len(), 2);
    }

    // --- Basic auth ---

    #[test]
    fn test_basic_auth_bcrypt() {
        let mut session = SessionState::default();
        session.basic_auth_data.password = "hunter2".to_string();
        set_basic_auth_password(&mut session, &Config::default());
        assert_eq!(session.basic_auth_data.hash_type, BasicAuthHash::Bcrypt);
        assert_ne!(session.basic_auth_data.password, "hunter2");
        assert!(bcrypt::verify("hunter2", &session.basic_auth_data.password).unwrap());
    }

    #[test]
    fn test_basic_auth_sha256() {
        let mut config = Config::default();
        config.basic_auth_hash_key_function = "sha256".to_string();
        let mut session = SessionState::default();
        session.basic_auth_data.password = "hunter2".to_string();
        set_basic_auth_password(&mut session, &config);
        assert_eq!(session.basic_auth_data.hash_type, BasicAuthHash::Sha256);
        assert_eq!(
            session.basic_auth_data.password,
            keys::hash_str("hunter2", "sha256")
        );
    }

    // --- Lifetime ---

    #[test]
    fn test_lifetime_selection() {
        let mut session = SessionState::default();
        assert_eq!(session.lifetime(false, 0, false, 0), 0);
        assert_eq!(session.lifetime(false, 300, false, 0), 300);
        assert_eq!(session.lifetime(false, 300, true, 60), 60);

        session.expires = now_unix() + 1000;
        let lt = session.lifetime(true, 300, false, 0);
        assert!(lt > 900, "expiry-derived lifetime should win: {}", lt);
    }

    // --- Policy map ---

    #[test]
    fn test_policy_map_swap() {
        let map = PolicyMap::new();
        map.set(policy("a"));
        assert_eq!(map.len(), 1);
        map.swap(HashMap::new());
        assert!(map.is_empty());
        assert!(map.get("a").is_none());
    }
}
