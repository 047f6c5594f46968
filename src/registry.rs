//! API spec registry
//!
//! The live catalog the proxy consults on every request: one [`ApiSpec`]
//! per definition, with precomputed match tables and the per-spec mutable
//! transport slot. A single writer (the reload coordinator) swaps the
//! whole set; readers take shared locks for lookups. Between reloads the
//! only per-spec mutation is the transport handle.

use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use crate::apidef::oas::OasDocument;
use crate::apidef::{
    ApiDefinition, CircuitBreakerMeta, HardTimeoutMeta, HeaderInjectionMeta, HostList,
    MockResponseMeta, VersionDefinition,
};
use crate::error::{GatewayError, Result};
use crate::proxy::transport::Transport;

/// Behavior attached to a matched URL + method.
#[derive(Debug, Clone)]
pub enum PathRule {
    Ignored,
    WhiteList,
    BlackList,
    Mock(MockResponseMeta),
    HeaderInject(HeaderInjectionMeta),
    CircuitBreaker(CircuitBreakerMeta),
    HardTimeout(HardTimeoutMeta),
}

impl PathRule {
    fn kind(&self) -> PathRuleKind {
        match self {
            Self::Ignored => PathRuleKind::Ignored,
            Self::WhiteList => PathRuleKind::WhiteList,
            Self::BlackList => PathRuleKind::BlackList,
            Self::Mock(_) => PathRuleKind::Mock,
            Self::HeaderInject(_) => PathRuleKind::HeaderInject,
            Self::CircuitBreaker(_) => PathRuleKind::CircuitBreaker,
            Self::HardTimeout(_) => PathRuleKind::HardTimeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathRuleKind {
    Ignored,
    WhiteList,
    BlackList,
    Mock,
    HeaderInject,
    CircuitBreaker,
    HardTimeout,
}

/// One compiled URL matcher in a version's match table.
#[derive(Debug)]
pub struct UrlSpec {
    pub pattern: Regex,
    pub method: String,
    pub rule: PathRule,
}

impl UrlSpec {
    fn compile(path: &str, method: &str, rule: PathRule) -> Result<Self> {
        // `{param}` segments match any single path segment
        let mut converted = String::with_capacity(path.len());
        let mut rest = path;
        while let Some(open) = rest.find('{') {
            converted.push_str(&regex::escape(&rest[..open]));
            match rest[open..].find('}') {
                Some(close) => {
                    converted.push_str("[^/]+");
                    rest = &rest[open + close + 1..];
                }
                None => {
                    converted.push_str(&regex::escape(&rest[open..]));
                    rest = "";
                }
            }
        }
        converted.push_str(&regex::escape(rest));

        let pattern = Regex::new(&format!("^{}$", converted)).map_err(|e| {
            GatewayError::ValidationFailed(format!("Bad path pattern '{}': {}", path, e))
        })?;
        Ok(Self {
            pattern,
            method: method.to_uppercase(),
            rule,
        })
    }

    fn matches(&self, path: &str, method: &str) -> bool {
        (self.method.is_empty() || self.method == method) && self.pattern.is_match(path)
    }
}

/// Round-robin cursor shared by all requests to one spec.
#[derive(Debug, Default)]
pub struct RoundRobin {
    pos: AtomicUsize,
}

impl RoundRobin {
    /// Next position within a list of the given length.
    pub fn with_len(&self, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        self.pos.fetch_add(1, Ordering::Relaxed) % len
    }
}

/// Service-discovery state mutated by the proxy between reloads.
#[derive(Debug, Default)]
pub struct DiscoveryState {
    pub has_run: bool,
    pub refresh_in_progress: bool,
    pub last_good_host_list: HostList,
}

/// A registry entry: the definition plus everything precomputed for the
/// hot path.
pub struct ApiSpec {
    pub definition: ApiDefinition,
    pub oas: Option<OasDocument>,

    /// version name → compiled match table
    pub rx_paths: HashMap<String, Vec<UrlSpec>>,
    pub white_list_enabled: HashMap<String, bool>,
    pub circuit_breaker_enabled: bool,
    pub enforced_timeout_enabled: bool,

    pub round_robin: RoundRobin,

    /// The only fields mutated between full reloads
    pub transport: RwLock<Option<Arc<Transport>>>,
    pub discovery: RwLock<DiscoveryState>,
}

impl ApiSpec {
    /// Build a spec from its definition, compiling the match tables.
    pub fn from_definition(definition: ApiDefinition, oas: Option<OasDocument>) -> Result<Self> {
        let mut rx_paths = HashMap::new();
        let mut white_list_enabled = HashMap::new();
        let mut circuit_breaker_enabled = false;
        let mut enforced_timeout_enabled = false;

        for (version_name, version) in &definition.version_data.versions {
            let mut specs = Vec::new();
            let paths = &version.extended_paths;

            for meta in &paths.ignored {
                specs.push(UrlSpec::compile(&meta.path, &meta.method, PathRule::Ignored)?);
            }
            for meta in &paths.white_list {
                specs.push(UrlSpec::compile(&meta.path, &meta.method, PathRule::WhiteList)?);
            }
            for meta in &paths.black_list {
                specs.push(UrlSpec::compile(&meta.path, &meta.method, PathRule::BlackList)?);
            }
            for meta in &paths.mock_response {
                specs.push(UrlSpec::compile(
                    &meta.path,
                    &meta.method,
                    PathRule::Mock(meta.clone()),
                )?);
            }
            for meta in &paths.transform_headers {
                specs.push(UrlSpec::compile(
                    &meta.path,
                    &meta.method,
                    PathRule::HeaderInject(meta.clone()),
                )?);
            }
            for meta in &paths.circuit_breakers {
                circuit_breaker_enabled = true;
                specs.push(UrlSpec::compile(
                    &meta.path,
                    &meta.method,
                    PathRule::CircuitBreaker(meta.clone()),
                )?);
            }
            for meta in &paths.hard_timeouts {
                enforced_timeout_enabled = true;
                specs.push(UrlSpec::compile(
                    &meta.path,
                    &meta.method,
                    PathRule::HardTimeout(meta.clone()),
                )?);
            }

            white_list_enabled.insert(version_name.clone(), !paths.white_list.is_empty());
            rx_paths.insert(version_name.clone(), specs);
        }

        Ok(Self {
            definition,
            oas,
            rx_paths,
            white_list_enabled,
            circuit_breaker_enabled,
            enforced_timeout_enabled,
            round_robin: RoundRobin::default(),
            transport: RwLock::new(None),
            discovery: RwLock::new(DiscoveryState::default()),
        })
    }

    pub fn api_id(&self) -> &str {
        &self.definition.api_id
    }

    /// The version name a request addresses, honoring the version
    /// definition's location and key; empty string is the main version.
    pub fn request_version_name(
        &self,
        headers: &HashMap<String, String>,
        query: &HashMap<String, String>,
    ) -> String {
        let vd = &self.definition.version_definition;
        if !vd.enabled || vd.key.is_empty() {
            return self.definition.version_data.default_version.clone();
        }
        let requested = match vd.location.as_str() {
            crate::apidef::VERSION_LOCATION_URL_PARAM => query.get(&vd.key),
            _ => headers.get(&vd.key.to_lowercase()),
        };
        match requested {
            Some(name) if !name.is_empty() => name.clone(),
            _ => vd.default.clone(),
        }
    }

    /// Find a rule of the given kind matching the (stripped) path+method.
    pub fn find_rule(
        &self,
        version: &str,
        path: &str,
        method: &str,
        kind: PathRuleKind,
    ) -> Option<&UrlSpec> {
        self.rx_paths.get(version)?.iter().find(|spec| {
            spec.rule.kind() == kind && spec.matches(path, method)
        })
    }

    /// Enforced hard timeout in seconds for the matched endpoint, if any.
    pub fn hard_timeout(&self, version: &str, path: &str, method: &str) -> Option<f64> {
        if !self.enforced_timeout_enabled {
            return None;
        }
        match self.find_rule(version, path, method, PathRuleKind::HardTimeout) {
            Some(UrlSpec {
                rule: PathRule::HardTimeout(meta),
                ..
            }) if meta.timeout > 0.0 => Some(meta.timeout),
            _ => None,
        }
    }

    /// Circuit-breaker metadata for the matched endpoint, if any.
    pub fn breaker_meta(&self, version: &str, path: &str, method: &str) -> Option<&CircuitBreakerMeta> {
        if !self.circuit_breaker_enabled {
            return None;
        }
        match self.find_rule(version, path, method, PathRuleKind::CircuitBreaker) {
            Some(UrlSpec {
                rule: PathRule::CircuitBreaker(meta),
                ..
            }) => Some(meta),
            _ => None,
        }
    }

    /// Whether a header is named for removal by version-global or
    /// endpoint-level rules.
    pub fn header_in_remove_list(&self, version: &str, path: &str, method: &str, header: &str) -> bool {
        let header = header.to_lowercase();
        if let Some(info) = self.definition.version_data.versions.get(version) {
            if info
                .global_headers_remove
                .iter()
                .any(|h| h.to_lowercase() == header)
            {
                return true;
            }
        }
        match self.find_rule(version, path, method, PathRuleKind::HeaderInject) {
            Some(UrlSpec {
                rule: PathRule::HeaderInject(meta),
                ..
            }) => meta
                .delete_headers
                .iter()
                .any(|h| h.to_lowercase() == header),
            _ => false,
        }
    }

    /// Structured target list from the definition.
    pub fn structured_target_list(&self) -> HostList {
        HostList::from(self.definition.proxy.target_list.clone())
    }
}

/// Parameters controlling version-graph updates on API creation.
#[derive(Debug, Clone, Default)]
pub struct VersionQueryParams {
    pub base_api_id: Option<String>,
    pub new_version_name: Option<String>,
    pub set_default: bool,
    pub base_api_version_name: Option<String>,
}

impl VersionQueryParams {
    pub fn from_query(query: &HashMap<String, String>) -> Self {
        Self {
            base_api_id: query.get("base_api_id").cloned(),
            new_version_name: query.get("new_version_name").cloned(),
            set_default: query.get("set_default").map(|v| v == "true").unwrap_or(false),
            base_api_version_name: query.get("base_api_version_name").cloned(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.base_api_id.is_none()
    }

    /// Validate against the base's current state. `base_version_name` is
    /// the base's own version name, when the base exists.
    pub fn validate(&self, base_exists: bool, base_version_name: &str) -> Result<()> {
        let Some(base_api_id) = &self.base_api_id else {
            return Ok(());
        };
        if !base_exists {
            return Err(GatewayError::ValidationFailed(format!(
                "Base API not found: {}",
                base_api_id
            )));
        }
        if self.new_version_name.as_deref().unwrap_or("").is_empty() {
            return Err(GatewayError::ValidationFailed(
                "A new version name is required".to_string(),
            ));
        }
        if base_version_name.is_empty()
            && self.base_api_version_name.as_deref().unwrap_or("").is_empty()
        {
            // the base has never been versioned, its own name must be set now
            return Err(GatewayError::Conflict(
                "New version needed: the base API has no version name".to_string(),
            ));
        }
        Ok(())
    }
}

/// Rewrite a base's version definition to include a new child.
pub fn configure_version_definition(
    mut base: VersionDefinition,
    params: &VersionQueryParams,
    child_api_id: &str,
) -> VersionDefinition {
    base.enabled = true;
    if let Some(name) = &params.base_api_version_name {
        if !name.is_empty() {
            base.name = name.clone();
        }
    }
    if base.key.is_empty() {
        base.key = "x-api-version".to_string();
    }
    if base.location.is_empty() {
        base.location = crate::apidef::VERSION_LOCATION_HEADER.to_string();
    }
    if let Some(version_name) = &params.new_version_name {
        base.versions
            .insert(version_name.clone(), child_api_id.to_string());
        if params.set_default {
            base.default = version_name.clone();
        }
    }
    if base.default.is_empty() {
        base.default = base.name.clone();
    }
    base
}

/// Remove a child from a base's version map; the default reverts to the
/// base's own name when the child was the default.
pub fn remove_version_child(base: &mut VersionDefinition, child_api_id: &str) -> bool {
    let Some(version_name) = base
        .versions
        .iter()
        .find(|(_, id)| id.as_str() == child_api_id)
        .map(|(name, _)| name.clone())
    else {
        return false;
    };
    base.versions.remove(&version_name);
    if base.default == version_name {
        base.default = base.name.clone();
    }
    true
}

/// Concurrently-read catalog keyed by API ID; swapped atomically on reload.
#[derive(Default)]
pub struct SpecRegistry {
    specs: RwLock<HashMap<String, Arc<ApiSpec>>>,
}

impl SpecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, api_id: &str) -> Option<Arc<ApiSpec>> {
        self.specs.read().unwrap().get(api_id).cloned()
    }

    pub fn list_by_org(&self, org_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .specs
            .read()
            .unwrap()
            .values()
            .filter(|s| s.definition.org_id == org_id)
            .map(|s| s.definition.api_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn snapshot(&self) -> Vec<Arc<ApiSpec>> {
        let mut specs: Vec<Arc<ApiSpec>> = self.specs.read().unwrap().values().cloned().collect();
        specs.sort_by(|a, b| a.definition.api_id.cmp(&b.definition.api_id));
        specs
    }

    pub fn len(&self) -> usize {
        self.specs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace the whole catalog. Readers observe either the prior set or
    /// the new one, never a mix.
    pub fn swap(&self, new_set: HashMap<String, Arc<ApiSpec>>) {
        *self.specs.write().unwrap() = new_set;
    }

    /// Route an inbound request path to a spec by longest listen-path
    /// prefix. Internal APIs never match from the network.
    pub fn find_by_listen_path(&self, path: &str) -> Option<Arc<ApiSpec>> {
        let specs = self.specs.read().unwrap();
        specs
            .values()
            .filter(|s| {
                s.definition.active
                    && !s.definition.internal
                    && listen_path_matches(&s.definition.proxy.listen_path, path)
            })
            .max_by_key(|s| s.definition.proxy.listen_path.len())
            .cloned()
    }

    /// Resolve an internal-loop host (API name or ID) to a spec.
    pub fn find_by_name_or_id(&self, host: &str) -> Option<Arc<ApiSpec>> {
        let specs = self.specs.read().unwrap();
        if let Some(spec) = specs.get(host) {
            return Some(spec.clone());
        }
        specs
            .values()
            .find(|s| s.definition.name.eq_ignore_ascii_case(host))
            .cloned()
    }

    /// The base API's ID iff the base still lists this child in its
    /// version map.
    pub fn confirmed_base_id(&self, child: &ApiDefinition) -> Option<String> {
        let base_id = &child.version_definition.base_id;
        if base_id.is_empty() {
            return None;
        }
        let base = self.get(base_id)?;
        base.definition
            .version_definition
            .versions
            .values()
            .any(|id| id == &child.api_id)
            .then(|| base_id.clone())
    }
}

fn listen_path_matches(listen_path: &str, request_path: &str) -> bool {
    if listen_path.is_empty() {
        return false;
    }
    let trimmed = listen_path.trim_end_matches('/');
    if trimmed.is_empty() {
        // listen path "/" catches everything
        return true;
    }
    request_path == trimmed || request_path.starts_with(&format!("{}/", trimmed))
}

/// Load definitions from `{app_path}` (`{id}.json` + optional
/// `{id}-oas.json` companions) and build specs.
pub fn load_specs_from_dir(app_path: impl AsRef<Path>) -> Result<HashMap<String, Arc<ApiSpec>>> {
    let mut specs = HashMap::new();
    let entries = match std::fs::read_dir(app_path.as_ref()) {
        Ok(entries) => entries,
        Err(_) => return Ok(specs),
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.ends_with(".json") || name.ends_with("-oas.json") {
            continue;
        }

        let raw = std::fs::read_to_string(&path)?;
        let definition: ApiDefinition = match serde_json::from_str(&raw) {
            Ok(def) => def,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Skipping unparseable API definition");
                continue;
            }
        };

        let oas = if definition.is_oas {
            let oas_path = path.with_file_name(format!("{}-oas.json", definition.api_id));
            match std::fs::read(&oas_path) {
                Ok(bytes) => OasDocument::from_slice(&bytes).ok(),
                Err(_) => None,
            }
        } else {
            None
        };

        match ApiSpec::from_definition(definition, oas) {
            Ok(spec) => {
                specs.insert(spec.definition.api_id.clone(), Arc::new(spec));
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Skipping invalid API definition");
            }
        }
    }

    Ok(specs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apidef::{EndPointMeta, ProxyConfig};

    fn definition(api_id: &str, listen_path: &str) -> ApiDefinition {
        ApiDefinition {
            api_id: api_id.to_string(),
            org_id: "org-1".to_string(),
            name: api_id.to_string(),
            active: true,
            proxy: ProxyConfig {
                listen_path: listen_path.to_string(),
                target_url: "http://upstream".to_string(),
                strip_listen_path: true,
                ..ProxyConfig::default()
            },
            ..ApiDefinition::default()
        }
    }

    fn spec(api_id: &str, listen_path: &str) -> Arc<ApiSpec> {
        Arc::new(ApiSpec::from_definition(definition(api_id, listen_path), None).unwrap())
    }

    fn registry_with(specs: Vec<Arc<ApiSpec>>) -> SpecRegistry {
        let registry = SpecRegistry::new();
        let map = specs
            .into_iter()
            .map(|s| (s.definition.api_id.clone(), s))
            .collect();
        registry.swap(map);
        registry
    }

    // --- Lookup & swap ---

    #[test]
    fn test_get_and_snapshot() {
        let registry = registry_with(vec![spec("a", "/a/"), spec("b", "/b/")]);
        assert!(registry.get("a").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.snapshot().len(), 2);
        assert_eq!(registry.list_by_org("org-1"), vec!["a", "b"]);
        assert!(registry.list_by_org("other").is_empty());
    }

    #[test]
    fn test_swap_replaces_everything() {
        let registry = registry_with(vec![spec("a", "/a/")]);
        registry.swap(
            [("c".to_string(), spec("c", "/c/"))]
                .into_iter()
                .collect(),
        );
        assert!(registry.get("a").is_none());
        assert!(registry.get("c").is_some());
    }

    // --- Listen-path routing ---

    #[test]
    fn test_find_by_listen_path_longest_prefix() {
        let registry = registry_with(vec![spec("short", "/api/"), spec("long", "/api/v2/")]);
        assert_eq!(
            registry.find_by_listen_path("/api/v2/pets").unwrap().api_id(),
            "long"
        );
        assert_eq!(
            registry.find_by_listen_path("/api/other").unwrap().api_id(),
            "short"
        );
        assert!(registry.find_by_listen_path("/nope").is_none());
    }

    #[test]
    fn test_find_by_listen_path_no_partial_segment() {
        let registry = registry_with(vec![spec("a", "/api/")]);
        assert!(registry.find_by_listen_path("/apiv2/pets").is_none());
        assert!(registry.find_by_listen_path("/api").is_some());
    }

    #[test]
    fn test_inactive_and_internal_not_routed() {
        let mut inactive = definition("off", "/off/");
        inactive.active = false;
        let mut internal = definition("internal", "/internal/");
        internal.internal = true;
        let registry = registry_with(vec![
            Arc::new(ApiSpec::from_definition(inactive, None).unwrap()),
            Arc::new(ApiSpec::from_definition(internal, None).unwrap()),
        ]);
        assert!(registry.find_by_listen_path("/off/x").is_none());
        assert!(registry.find_by_listen_path("/internal/x").is_none());
        // still resolvable for the in-memory loop
        assert!(registry.find_by_name_or_id("internal").is_some());
    }

    // --- Match tables ---

    #[test]
    fn test_compiled_rules() {
        let mut def = definition("a", "/a/");
        let version = def.version_data.versions.get_mut("").unwrap();
        version.extended_paths.black_list.push(EndPointMeta {
            path: "/admin".to_string(),
            method: "GET".to_string(),
            ..EndPointMeta::default()
        });
        version.extended_paths.hard_timeouts.push(HardTimeoutMeta {
            path: "/slow/{id}".to_string(),
            method: "GET".to_string(),
            timeout: 1.5,
        });
        version.extended_paths.circuit_breakers.push(CircuitBreakerMeta {
            path: "/flaky".to_string(),
            method: "".to_string(),
            threshold_percent: 0.5,
            samples: 3,
            return_to_service_after: 30,
        });

        let spec = ApiSpec::from_definition(def, None).unwrap();
        assert!(spec.enforced_timeout_enabled);
        assert!(spec.circuit_breaker_enabled);

        assert!(spec
            .find_rule("", "/admin", "GET", PathRuleKind::BlackList)
            .is_some());
        assert!(spec
            .find_rule("", "/admin", "POST", PathRuleKind::BlackList)
            .is_none());
        assert_eq!(spec.hard_timeout("", "/slow/42", "GET"), Some(1.5));
        assert_eq!(spec.hard_timeout("", "/slow/42/extra", "GET"), None);
        assert!(spec.breaker_meta("", "/flaky", "PUT").is_some());
    }

    #[test]
    fn test_header_remove_list() {
        let mut def = definition("a", "/a/");
        let version = def.version_data.versions.get_mut("").unwrap();
        version.global_headers_remove.push("X-Secret".to_string());
        version.extended_paths.transform_headers.push(HeaderInjectionMeta {
            path: "/clean".to_string(),
            method: "GET".to_string(),
            delete_headers: vec!["X-Forwarded-For".to_string()],
            ..HeaderInjectionMeta::default()
        });
        let spec = ApiSpec::from_definition(def, None).unwrap();

        assert!(spec.header_in_remove_list("", "/any", "GET", "x-secret"));
        assert!(spec.header_in_remove_list("", "/clean", "GET", "x-forwarded-for"));
        assert!(!spec.header_in_remove_list("", "/other", "GET", "x-forwarded-for"));
    }

    // --- Version resolution ---

    #[test]
    fn test_request_version_name() {
        let mut def = definition("base", "/b/");
        def.version_definition = VersionDefinition {
            enabled: true,
            name: "base".to_string(),
            default: "v2".to_string(),
            location: "header".to_string(),
            key: "x-api-version".to_string(),
            versions: [("v2".to_string(), "child".to_string())].into(),
            base_id: String::new(),
        };
        let spec = ApiSpec::from_definition(def, None).unwrap();

        let mut headers = HashMap::new();
        let query = HashMap::new();
        assert_eq!(spec.request_version_name(&headers, &query), "v2");
        headers.insert("x-api-version".to_string(), "v3".to_string());
        assert_eq!(spec.request_version_name(&headers, &query), "v3");
    }

    // --- Version graph ---

    #[test]
    fn test_configure_version_definition() {
        let params = VersionQueryParams {
            base_api_id: Some("base".to_string()),
            new_version_name: Some("v2".to_string()),
            set_default: true,
            base_api_version_name: Some("base-version".to_string()),
        };
        let vd = configure_version_definition(VersionDefinition::default(), &params, "child-id");
        assert!(vd.enabled);
        assert_eq!(vd.name, "base-version");
        assert_eq!(vd.default, "v2");
        assert_eq!(vd.versions.get("v2").unwrap(), "child-id");
        assert_eq!(vd.key, "x-api-version");
        assert_eq!(vd.location, "header");
    }

    #[test]
    fn test_remove_version_child_reverts_default() {
        let mut vd = VersionDefinition {
            enabled: true,
            name: "base".to_string(),
            default: "v2".to_string(),
            versions: [
                ("v2".to_string(), "child-a".to_string()),
                ("v3".to_string(), "child-b".to_string()),
            ]
            .into(),
            ..VersionDefinition::default()
        };
        assert!(remove_version_child(&mut vd, "child-a"));
        assert!(!vd.versions.contains_key("v2"));
        assert_eq!(vd.default, "base");
        // non-default child removal keeps the default
        vd.default = "v3".to_string();
        assert!(!remove_version_child(&mut vd, "unknown"));
        assert!(remove_version_child(&mut vd, "child-b"));
        assert_eq!(vd.default, "base");
    }

    #[test]
    fn test_version_params_validate() {
        let mut params = VersionQueryParams {
            base_api_id: Some("base".to_string()),
            ..VersionQueryParams::default()
        };
        assert!(params.validate(false, "").is_err());
        assert!(params.validate(true, "base").is_err()); // no new version name

        params.new_version_name = Some("v2".to_string());
        assert!(params.validate(true, "base").is_ok());
        // unversioned base requires a name for itself
        let err = params.validate(true, "").unwrap_err();
        assert!(matches!(err, GatewayError::Conflict(_)));
        params.base_api_version_name = Some("base".to_string());
        assert!(params.validate(true, "").is_ok());
    }

    #[test]
    fn test_confirmed_base_id() {
        let mut base_def = definition("base", "/b/");
        base_def.version_definition.enabled = true;
        base_def
            .version_definition
            .versions
            .insert("v2".to_string(), "child".to_string());
        let mut child_def = definition("child", "/c/");
        child_def.version_definition.base_id = "base".to_string();

        let registry = registry_with(vec![
            Arc::new(ApiSpec::from_definition(base_def, None).unwrap()),
            Arc::new(ApiSpec::from_definition(child_def.clone(), None).unwrap()),
        ]);
        assert_eq!(registry.confirmed_base_id(&child_def), Some("base".to_string()));

        // base no longer lists the child
        let mut orphaned_base = definition("base", "/b/");
        orphaned_base.version_definition.enabled = true;
        let registry = registry_with(vec![
            Arc::new(ApiSpec::from_definition(orphaned_base, None).unwrap()),
            Arc::new(ApiSpec::from_definition(child_def.clone(), None).unwrap()),
        ]);
        assert_eq!(registry.confirmed_base_id(&child_def), None);
    }

    // --- Round robin ---

    #[test]
    fn test_round_robin_cycles() {
        let rr = RoundRobin::default();
        assert_eq!(rr.with_len(3), 0);
        assert_eq!(rr.with_len(3), 1);
        assert_eq!(rr.with_len(3), 2);
        assert_eq!(rr.with_len(3), 0);
        assert_eq!(rr.with_len(0), 0);
    }
}
