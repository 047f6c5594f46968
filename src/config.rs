//! Process-wide gateway configuration
//!
//! Loaded once at startup from a JSON file. Options cover key hashing,
//! persisted-state paths, outbound transport tuning, and the HTTP server
//! knobs the proxy engine consults per request.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{GatewayError, Result};

/// Top-level gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the data plane listens on (e.g. "0.0.0.0:8080")
    pub listen_address: String,

    /// Address the admin control plane listens on
    pub control_listen_address: String,

    /// Shared secret checked against the admin authorization header
    pub secret: String,

    /// Directory holding API definition files (`{id}.json`, `{id}-oas.json`)
    pub app_path: String,

    /// Hash keys before storing them
    pub hash_keys: bool,

    /// Hash algorithm for keys: "murmur32", "murmur64", "murmur128", "sha256"
    pub hash_key_function: String,

    /// Allow key listing endpoints when hashing is enabled
    pub enable_hashed_keys_listing: bool,

    /// Disable resolving `?username=true` key lookups to generated tokens
    pub disable_key_actions_by_username: bool,

    /// Permit sessions with an empty access-rights map, attached to all APIs
    pub allow_master_keys: bool,

    /// Skip registering the default org-level session store
    pub supress_default_org_store: bool,

    pub policies: PolicyConfig,

    /// Maximum transport age in seconds before it is rebuilt (0 = never)
    pub max_conn_time: i64,

    /// Outbound connection pool: total idle connections
    pub max_idle_connections: usize,

    /// Outbound connection pool: idle connections per host
    pub max_idle_connections_per_host: usize,

    /// Default upstream timeout in seconds when no endpoint timeout applies
    pub proxy_default_timeout: f64,

    pub proxy_ssl_insecure_skip_verify: bool,
    /// Minimum TLS version for upstream connections ("1.0".."1.3")
    pub proxy_ssl_min_version: Option<String>,
    pub proxy_ssl_max_version: Option<String>,
    /// Cipher suite names pinned for upstream TLS
    pub proxy_ssl_cipher_suites: Vec<String>,
    pub proxy_ssl_disable_renegotiation: bool,

    /// Disable keep-alive on upstream transports
    pub proxy_close_connections: bool,

    /// Negotiate HTTP/2 with upstreams
    pub proxy_enable_http2: bool,

    /// Verify only the certificate common name for upstream TLS
    pub ssl_force_common_name_check: bool,

    /// Copy response headers without MIME canonicalization
    pub ignore_canonical_mime_header_key: bool,

    /// Ask clients to close the connection after each response
    pub close_connections: bool,

    pub http_server_options: HttpServerOptions,

    pub health_check: HealthCheckConfig,

    /// Definitions are managed by an external dashboard; local API CRUD is blocked
    pub use_db_app_configs: bool,

    pub oas: OasConfig,

    /// Issued OAuth token lifetime in seconds
    pub oauth_token_expire: i64,

    /// How long expired token records are retained before purge eligibility
    pub oauth_token_expired_retain_period: i64,

    /// Override every session lifetime with `global_session_lifetime`
    pub force_global_session_lifetime: bool,
    pub global_session_lifetime: i64,

    /// Hash algorithm for basic-auth passwords ("bcrypt" default)
    pub basic_auth_hash_key_function: String,

    pub open_telemetry: OpenTelemetryConfig,
}

/// Policy source configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// "file" (default) or "service"; service-sourced policies block local CRUD
    pub policy_source: String,
    /// Directory holding policy files (`{id}.json`)
    pub policy_path: String,
}

/// Inbound HTTP server options consulted by the proxy engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpServerOptions {
    /// Allow protocol upgrades (WebSocket and friends)
    pub enable_websockets: bool,
    /// Forward the raw request path without re-escaping
    pub skip_target_path_escaping: bool,
    /// Response body flush interval in milliseconds (0 = no periodic flush)
    pub flush_interval: u64,
}

impl Default for HttpServerOptions {
    fn default() -> Self {
        Self {
            enable_websockets: true,
            skip_target_path_escaping: false,
            flush_interval: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub enable_health_checks: bool,
}

/// OAS document validation switches
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OasConfig {
    pub validate_examples: bool,
    pub validate_schema_defaults: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenTelemetryConfig {
    pub enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:8080".to_string(),
            control_listen_address: "127.0.0.1:9696".to_string(),
            secret: "352d20ee67be67f6340b4c0605b044b7".to_string(),
            app_path: "apps".to_string(),
            hash_keys: false,
            hash_key_function: "murmur32".to_string(),
            enable_hashed_keys_listing: false,
            disable_key_actions_by_username: false,
            allow_master_keys: false,
            supress_default_org_store: false,
            policies: PolicyConfig {
                policy_source: "file".to_string(),
                policy_path: "policies".to_string(),
            },
            max_conn_time: 0,
            max_idle_connections: 0,
            max_idle_connections_per_host: 100,
            proxy_default_timeout: 30.0,
            proxy_ssl_insecure_skip_verify: false,
            proxy_ssl_min_version: None,
            proxy_ssl_max_version: None,
            proxy_ssl_cipher_suites: Vec::new(),
            proxy_ssl_disable_renegotiation: false,
            proxy_close_connections: false,
            proxy_enable_http2: false,
            ssl_force_common_name_check: false,
            ignore_canonical_mime_header_key: false,
            close_connections: false,
            http_server_options: HttpServerOptions::default(),
            health_check: HealthCheckConfig::default(),
            use_db_app_configs: false,
            oas: OasConfig::default(),
            oauth_token_expire: 3600,
            oauth_token_expired_retain_period: 0,
            force_global_session_lifetime: false,
            global_session_lifetime: 0,
            basic_auth_hash_key_function: "bcrypt".to_string(),
            open_telemetry: OpenTelemetryConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            GatewayError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json(&content)
    }

    /// Parse configuration from a JSON string.
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| GatewayError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Validate the configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        match self.hash_key_function.as_str() {
            "" | "murmur32" | "murmur64" | "murmur128" | "sha256" => {}
            other => {
                return Err(GatewayError::Config(format!(
                    "Unknown hash_key_function '{}'",
                    other
                )))
            }
        }

        match self.policies.policy_source.as_str() {
            "" | "file" | "service" => {}
            other => {
                return Err(GatewayError::Config(format!(
                    "Unknown policy_source '{}'",
                    other
                )))
            }
        }

        if self.listen_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(GatewayError::Config(format!(
                "Invalid listen_address '{}'",
                self.listen_address
            )));
        }

        if self
            .control_listen_address
            .parse::<std::net::SocketAddr>()
            .is_err()
        {
            return Err(GatewayError::Config(format!(
                "Invalid control_listen_address '{}'",
                self.control_listen_address
            )));
        }

        Ok(())
    }

    /// Effective default upstream timeout in seconds.
    pub fn proxy_timeout(&self) -> f64 {
        if self.proxy_default_timeout > 0.0 {
            self.proxy_default_timeout
        } else {
            30.0
        }
    }
}
