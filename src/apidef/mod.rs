//! Classic API definition model
//!
//! The authoritative per-API configuration, persisted as JSON under
//! `{app_path}/{api_id}.json`. OAS-flagged APIs carry a companion document
//! (see [`oas`]) regenerated from this form on every mutation.

pub mod oas;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{GatewayError, Result};

/// Version-definition location: where the requested version name is read from.
pub const VERSION_LOCATION_HEADER: &str = "header";
pub const VERSION_LOCATION_URL_PARAM: &str = "url-param";

/// An API definition in its Classic (non-OAS) form.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiDefinition {
    pub api_id: String,
    pub org_id: String,
    pub name: String,
    pub active: bool,
    /// Internal APIs are reachable only via the in-memory loop
    pub internal: bool,

    pub is_oas: bool,

    /// "http", "https", "tcp" or "tls"
    pub protocol: String,

    pub use_keyless: bool,
    pub use_oauth2: bool,
    pub enable_jwt: bool,
    pub use_basic_auth: bool,

    pub auth: AuthConfig,

    pub proxy: ProxyConfig,

    pub version_definition: VersionDefinition,
    pub version_data: VersionData,

    /// Keep existing quota counters when keys are created against this API
    pub dont_set_quota_on_create: bool,

    pub session_lifetime: i64,
    pub session_lifetime_respects_key_expiration: bool,

    /// Upstream mTLS certificates keyed by target host ("*" matches any)
    pub upstream_certificates: HashMap<String, String>,
    /// Pinned upstream public keys keyed by host
    pub pinned_public_keys: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub auth_header_name: String,
}

/// Proxy section: how requests on the listen path reach the upstream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub listen_path: String,
    pub target_url: String,
    pub strip_listen_path: bool,
    pub preserve_host_header: bool,
    pub disable_strip_slash: bool,
    pub enable_load_balancing: bool,
    pub target_list: Vec<String>,
    pub check_host_against_uptime_tests: bool,
    pub service_discovery: ServiceDiscoveryConfig,
    pub transport: TransportConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceDiscoveryConfig {
    pub use_discovery_service: bool,
    pub query_endpoint: String,
    /// JSON path (dot separated) to the host entry or host list in the
    /// discovery response; empty means the body is the list itself
    pub data_path: String,
    pub cache_disabled: bool,
    /// Per-API TTL in seconds; 0 falls back to the gateway default
    pub cache_timeout: i64,
}

impl ServiceDiscoveryConfig {
    /// TTL for cached discovery data; `None` when caching is disabled and
    /// the gateway default should be used.
    pub fn cache_options(&self) -> Option<i64> {
        if self.cache_disabled || self.cache_timeout <= 0 {
            None
        } else {
            Some(self.cache_timeout)
        }
    }
}

/// Per-API overrides for the outbound transport.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub proxy_url: String,
    pub ssl_insecure_skip_verify: bool,
    pub ssl_min_version: Option<String>,
    pub ssl_max_version: Option<String>,
    pub ssl_cipher_suites: Vec<String>,
    pub ssl_force_common_name_check: bool,
}

/// Version graph definition. A base API maps version names to child API
/// IDs; children point back through `base_id`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VersionDefinition {
    pub enabled: bool,
    /// The base's own version name
    pub name: String,
    /// Version served when the request names none
    pub default: String,
    /// "header" or "url-param"
    pub location: String,
    /// Header or query parameter carrying the version name
    pub key: String,
    /// version name → child API ID
    pub versions: HashMap<String, String>,
    /// On children: the owning base API's ID
    pub base_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VersionData {
    pub not_versioned: bool,
    pub default_version: String,
    pub versions: HashMap<String, VersionInfo>,
}

impl Default for VersionData {
    fn default() -> Self {
        let mut versions = HashMap::new();
        versions.insert("".to_string(), VersionInfo::default());
        Self {
            not_versioned: true,
            default_version: "".to_string(),
            versions,
        }
    }
}

/// Per-version path rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VersionInfo {
    pub name: String,
    pub expires: String,
    pub use_extended_paths: bool,
    pub extended_paths: ExtendedPathsSet,
    pub global_headers: HashMap<String, String>,
    pub global_headers_remove: Vec<String>,
}

/// Extended path rules annotating URL + method with behaviors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtendedPathsSet {
    pub ignored: Vec<EndPointMeta>,
    pub white_list: Vec<EndPointMeta>,
    pub black_list: Vec<EndPointMeta>,
    pub mock_response: Vec<MockResponseMeta>,
    pub transform_headers: Vec<HeaderInjectionMeta>,
    pub circuit_breakers: Vec<CircuitBreakerMeta>,
    pub hard_timeouts: Vec<HardTimeoutMeta>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EndPointMeta {
    pub path: String,
    pub method: String,
    pub ignore_case: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MockResponseMeta {
    pub path: String,
    pub method: String,
    pub code: u16,
    pub body: String,
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderInjectionMeta {
    pub path: String,
    pub method: String,
    pub add_headers: HashMap<String, String>,
    pub delete_headers: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerMeta {
    pub path: String,
    pub method: String,
    /// Failure ratio within the sample window that trips the breaker
    pub threshold_percent: f64,
    /// Rolling window size in requests
    pub samples: u64,
    /// Seconds the breaker stays open before allowing a probe
    pub return_to_service_after: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HardTimeoutMeta {
    pub path: String,
    pub method: String,
    /// Enforced request deadline in seconds
    pub timeout: f64,
}

impl ApiDefinition {
    /// Mint a fresh API ID.
    pub fn generate_api_id(&mut self) {
        self.api_id = uuid::Uuid::new_v4().simple().to_string();
    }

    /// The version info serving a request, honoring the version-definition
    /// default when no explicit version is requested.
    pub fn main_version(&self) -> &VersionInfo {
        self.version_data
            .versions
            .get(&self.version_data.default_version)
            .or_else(|| self.version_data.versions.values().next())
            .unwrap_or_else(|| {
                static EMPTY: std::sync::OnceLock<VersionInfo> = std::sync::OnceLock::new();
                EMPTY.get_or_init(VersionInfo::default)
            })
    }

    /// Strip the listen path from a request path, when configured.
    pub fn strip_listen_path<'a>(&self, path: &'a str) -> &'a str {
        if !self.proxy.strip_listen_path || self.proxy.listen_path.is_empty() {
            return path;
        }
        match path.strip_prefix(self.proxy.listen_path.trim_end_matches('/')) {
            Some("") => "/",
            Some(rest) if rest.starts_with('/') => rest,
            _ => path,
        }
    }

    /// Semantic validation applied by the control plane before persisting.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(GatewayError::ValidationFailed(
                "API name is required".to_string(),
            ));
        }
        if self.proxy.listen_path.trim().is_empty() {
            return Err(GatewayError::ValidationFailed(
                "Listen path is required".to_string(),
            ));
        }
        if !self.proxy.listen_path.starts_with('/') {
            return Err(GatewayError::ValidationFailed(
                "Listen path must begin with /".to_string(),
            ));
        }
        match self.protocol.as_str() {
            "" | "http" | "https" | "tcp" | "tls" => {}
            other => {
                return Err(GatewayError::ValidationFailed(format!(
                    "Unknown protocol '{}'",
                    other
                )))
            }
        }
        if self.version_definition.enabled && !self.version_definition.versions.is_empty() {
            let mut seen = std::collections::HashSet::new();
            for child in self.version_definition.versions.values() {
                if !seen.insert(child) {
                    return Err(GatewayError::ValidationFailed(format!(
                        "Version child '{}' listed more than once",
                        child
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Ordered set of upstream targets subject to round-robin selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostList {
    hosts: Vec<String>,
}

impl HostList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from(hosts: Vec<String>) -> Self {
        Self { hosts }
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn get_index(&self, idx: usize) -> Result<&str> {
        self.hosts
            .get(idx)
            .map(|s| s.as_str())
            .ok_or_else(|| GatewayError::Other(format!("host index {} out of range", idx)))
    }

    pub fn all(&self) -> &[String] {
        &self.hosts
    }
}

/// Sanitize a host/protocol pair into a full URL. Hosts without a scheme
/// get the given protocol; `h2c://` is normalized to `http://`.
pub fn ensure_transport(host: &str, protocol: &str) -> String {
    let host = host.trim();
    let protocol = {
        let p = protocol.trim();
        if p.is_empty() {
            "http"
        } else {
            p
        }
    };

    let with_scheme = if !host.contains("://") {
        format!("{}://{}", protocol, host)
    } else {
        host.to_string()
    };

    with_scheme.replacen("h2c://", "http://", 1)
}
