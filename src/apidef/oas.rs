//! OAS form of an API definition
//!
//! An OpenAPI 3.0 document carrying the gateway vendor extension. The
//! document itself is held as close to its wire form as possible: typed
//! fields for the parts the gateway reads, an opaque map for everything
//! else, so OAS → JSON → OAS is identity modulo key order. The vendor
//! extension is materialized into a typed record on first access and
//! cached, so repeated reads avoid re-parsing.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::apidef::ApiDefinition;
use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::headers::TYK_EXTENSION;

/// An OpenAPI 3.0 document plus the gateway vendor extension.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OasDocument {
    pub openapi: String,

    pub info: OasInfo,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<OasServer>,

    #[serde(default)]
    pub paths: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub security: Vec<Map<String, Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub components: Option<Map<String, Value>>,

    /// Everything else, including vendor extensions, preserved verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,

    /// Memoized typed form of the vendor extension
    #[serde(skip)]
    ext_cache: OnceLock<Option<XTykApiGateway>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OasInfo {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub version: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OasServer {
    pub url: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl OasServer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            extra: Map::new(),
        }
    }
}

/// The `x-tyk-api-gateway` vendor extension: gateway fields projected
/// onto the Classic definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct XTykApiGateway {
    pub info: ExtensionInfo,
    pub upstream: ExtensionUpstream,
    pub server: ExtensionServer,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub middleware: Option<ExtensionMiddleware>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExtensionInfo {
    pub id: String,
    pub name: String,
    pub state: ExtensionState,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExtensionState {
    pub active: bool,
    pub internal: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExtensionUpstream {
    pub url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExtensionServer {
    pub listen_path: ExtensionListenPath,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_domain: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExtensionListenPath {
    pub value: String,
    pub strip: bool,
}

/// Global middleware switches synthesized on import or patch.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExtensionMiddleware {
    pub global: ExtensionGlobalFeatures,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_list: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validate_request: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mock_response: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExtensionGlobalFeatures {
    pub context_variables: bool,
    pub traffic_logs: bool,
}

/// Query parameters that synthesize or override extension fields on
/// OAS import and patch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtensionConfigParams {
    pub upstream_url: Option<String>,
    pub listen_path: Option<String>,
    pub custom_domain: Option<String>,
    pub api_id: Option<String>,
    pub allow_list: Option<bool>,
    pub validate_request: Option<bool>,
    pub mock_response: Option<bool>,
}

impl ExtensionConfigParams {
    /// Build from decoded query pairs; `None` when no relevant parameter
    /// is present.
    pub fn from_query(query: &HashMap<String, String>) -> Option<Self> {
        let bool_param = |name: &str| query.get(name).map(|v| v == "true");
        let params = Self {
            upstream_url: query.get("upstreamURL").cloned(),
            listen_path: query.get("listenPath").cloned(),
            custom_domain: query.get("customDomain").cloned(),
            api_id: query.get("apiID").cloned(),
            allow_list: bool_param("allowList"),
            validate_request: bool_param("validateRequest"),
            mock_response: bool_param("mockResponse"),
        };
        if params == Self::default() {
            None
        } else {
            Some(params)
        }
    }
}

impl OasDocument {
    /// Parse an OAS document from raw JSON, rejecting non-3.0 documents.
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        let doc: OasDocument = serde_json::from_slice(body)
            .map_err(|_| GatewayError::RequestMalformed("Couldn't decode OAS object".to_string()))?;
        if !doc.openapi.starts_with("3.") {
            return Err(GatewayError::RequestMalformed(format!(
                "Unsupported OpenAPI version '{}'",
                doc.openapi
            )));
        }
        Ok(doc)
    }

    /// The typed vendor extension, materialized on first access.
    pub fn get_tyk_extension(&self) -> Option<&XTykApiGateway> {
        self.ext_cache
            .get_or_init(|| {
                self.extra
                    .get(TYK_EXTENSION)
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
            })
            .as_ref()
    }

    /// Install the vendor extension, replacing any cached value.
    pub fn set_tyk_extension(&mut self, ext: XTykApiGateway) {
        self.extra.insert(
            TYK_EXTENSION.to_string(),
            serde_json::to_value(&ext).unwrap_or(Value::Null),
        );
        self.ext_cache = OnceLock::new();
        let _ = self.ext_cache.set(Some(ext));
    }

    /// Remove the vendor extension (public exports).
    pub fn remove_tyk_extension(&mut self) {
        self.extra.remove(TYK_EXTENSION);
        self.ext_cache = OnceLock::new();
        let _ = self.ext_cache.set(None);
    }

    /// Project a Classic definition into this document's extension.
    pub fn fill(&mut self, api: &ApiDefinition) {
        let ext = XTykApiGateway {
            info: ExtensionInfo {
                id: api.api_id.clone(),
                name: api.name.clone(),
                state: ExtensionState {
                    active: api.active,
                    internal: api.internal,
                },
            },
            upstream: ExtensionUpstream {
                url: api.proxy.target_url.clone(),
            },
            server: ExtensionServer {
                listen_path: ExtensionListenPath {
                    value: api.proxy.listen_path.clone(),
                    strip: api.proxy.strip_listen_path,
                },
                custom_domain: self
                    .get_tyk_extension()
                    .and_then(|e| e.server.custom_domain.clone()),
            },
            middleware: self.get_tyk_extension().and_then(|e| e.middleware.clone()),
        };
        self.set_tyk_extension(ext);

        if self.info.title.is_empty() {
            self.info.title = api.name.clone();
        }
        if self.info.version.is_empty() {
            self.info.version = "1.0.0".to_string();
        }
        if self.openapi.is_empty() {
            self.openapi = "3.0.6".to_string();
        }
    }

    /// Project this document's extension onto a Classic definition.
    pub fn extract_to(&self, api: &mut ApiDefinition) {
        let Some(ext) = self.get_tyk_extension() else {
            return;
        };
        api.api_id = ext.info.id.clone();
        api.name = ext.info.name.clone();
        api.active = ext.info.state.active;
        api.internal = ext.info.state.internal;
        api.proxy.target_url = ext.upstream.url.clone();
        api.proxy.listen_path = ext.server.listen_path.value.clone();
        api.proxy.strip_listen_path = ext.server.listen_path.strip;
        api.is_oas = true;
    }

    /// Prepend the gateway-managed URL, keeping user-added entries.
    pub fn add_servers(&mut self, api_url: &str) {
        if api_url.is_empty() {
            return;
        }
        if self.servers.is_empty() {
            self.servers.push(OasServer::new(api_url));
            return;
        }
        let mut servers = vec![OasServer::new(api_url)];
        for server in self.servers.drain(..) {
            if server.url != api_url {
                servers.push(server);
            }
        }
        self.servers = servers;
    }

    /// Refresh the gateway-managed first entry: replaced when it equals
    /// `old_api_url`, inserted when the list is empty.
    pub fn update_servers(&mut self, api_url: &str, old_api_url: &str) {
        let managed_first = self
            .servers
            .first()
            .map(|s| s.url == old_api_url)
            .unwrap_or(false);

        if managed_first {
            self.servers[0].url = api_url.to_string();
            return;
        }
        if self.servers.is_empty() {
            self.servers.push(OasServer::new(api_url));
        }
    }

    /// Keep the previous gateway-managed first server across a patch: when
    /// the incoming list does not start with it, re-insert it at index 0.
    pub fn retain_old_server_url(old_servers: &[OasServer], new_servers: Vec<OasServer>) -> Vec<OasServer> {
        let Some(old_first) = old_servers.first() else {
            return new_servers;
        };
        if new_servers.first().map(|s| s.url == old_first.url).unwrap_or(false) {
            return new_servers;
        }
        let mut servers = vec![old_first.clone()];
        servers.extend(new_servers.into_iter().filter(|s| s.url != old_first.url));
        servers
    }

    /// Document-level validation: version marker, info fields, and that
    /// every security requirement names a declared scheme.
    pub fn validate(&self, _config: &Config) -> Result<()> {
        if !self.openapi.starts_with("3.") {
            return Err(GatewayError::ValidationFailed(format!(
                "Unsupported OpenAPI version '{}'",
                self.openapi
            )));
        }
        if self.info.title.is_empty() {
            return Err(GatewayError::ValidationFailed(
                "info.title is required".to_string(),
            ));
        }

        if !self.security.is_empty() {
            let schemes = self
                .components
                .as_ref()
                .and_then(|c| c.get("securitySchemes"))
                .and_then(|v| v.as_object());
            let Some(schemes) = schemes else {
                return Err(GatewayError::ValidationFailed(
                    "No components or security schemes present in OAS".to_string(),
                ));
            };
            for requirement in &self.security {
                for key in requirement.keys() {
                    if !schemes.contains_key(key) {
                        return Err(GatewayError::ValidationFailed(format!(
                            "Missing required Security Scheme '{}' in components.securitySchemes",
                            key
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    /// Vendor extension schema check: the extension must materialize and
    /// carry the fields the gateway cannot run without.
    pub fn validate_tyk_extension(&self) -> Result<()> {
        let raw = self.extra.get(TYK_EXTENSION).ok_or_else(|| {
            GatewayError::ValidationFailed("payload doesn't contain x-tyk-api-gateway".to_string())
        })?;
        let ext: XTykApiGateway = serde_json::from_value(raw.clone()).map_err(|e| {
            GatewayError::ValidationFailed(format!("invalid x-tyk-api-gateway: {}", e))
        })?;
        if ext.info.name.trim().is_empty() {
            return Err(GatewayError::ValidationFailed(
                "x-tyk-api-gateway.info.name is required".to_string(),
            ));
        }
        if !ext.server.listen_path.value.starts_with('/') {
            return Err(GatewayError::ValidationFailed(
                "listen path must begin with /".to_string(),
            ));
        }
        Ok(())
    }

    /// Synthesize or override the extension from query parameters. On
    /// import, defaults are filled in and listen-path strip, context
    /// variables, and traffic logs are enabled.
    pub fn build_default_extension(
        &mut self,
        params: &ExtensionConfigParams,
        is_import: bool,
    ) -> Result<()> {
        let mut ext = self.get_tyk_extension().cloned().unwrap_or_default();

        if ext.info.name.is_empty() {
            ext.info.name = self.info.title.clone();
        }
        if let Some(ref api_id) = params.api_id {
            ext.info.id = api_id.clone();
        }

        if let Some(ref upstream) = params.upstream_url {
            if !upstream.starts_with("http://") && !upstream.starts_with("https://") {
                return Err(GatewayError::ValidationFailed(format!(
                    "invalid upstream URL '{}'",
                    upstream
                )));
            }
            ext.upstream.url = upstream.clone();
        } else if ext.upstream.url.is_empty() {
            // fall back to the first user-declared server
            match self.servers.first() {
                Some(server) => ext.upstream.url = server.url.clone(),
                None => {
                    return Err(GatewayError::ValidationFailed(
                        "no upstream URL and no servers declared".to_string(),
                    ))
                }
            }
        }

        if let Some(ref listen_path) = params.listen_path {
            ext.server.listen_path.value = listen_path.clone();
        } else if ext.server.listen_path.value.is_empty() {
            ext.server.listen_path.value = "/".to_string();
        }

        if let Some(ref domain) = params.custom_domain {
            ext.server.custom_domain = Some(domain.clone());
        }

        if params.allow_list.is_some() || params.validate_request.is_some() || params.mock_response.is_some() {
            let middleware = ext.middleware.get_or_insert_with(ExtensionMiddleware::default);
            if params.allow_list.is_some() {
                middleware.allow_list = params.allow_list;
            }
            if params.validate_request.is_some() {
                middleware.validate_request = params.validate_request;
            }
            if params.mock_response.is_some() {
                middleware.mock_response = params.mock_response;
            }
        }

        if is_import {
            ext.info.state.active = true;
            ext.server.listen_path.strip = true;
            let middleware = ext.middleware.get_or_insert_with(ExtensionMiddleware::default);
            middleware.global.context_variables = true;
            middleware.global.traffic_logs = true;
        }

        self.set_tyk_extension(ext);
        Ok(())
    }
}

/// The gateway-managed URL for an API given the current configuration.
pub fn get_api_url(api: &ApiDefinition, config: &Config, custom_domain: Option<&str>) -> String {
    let host = custom_domain.unwrap_or(config.listen_address.as_str());
    format!("http://{}{}", host, api.proxy.listen_path)
}
