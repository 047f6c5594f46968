//! # Gantry
//!
//! An API gateway core: a reverse-proxy frontend that receives client
//! requests on configured listen paths, applies per-API policy, and
//! forwards them to upstream services. Many API definitions multiplex on
//! a shared listener; a control plane mutates the definition registry,
//! sessions, policies, and OAuth clients, and triggers live reloads.
//!
//! ## Architecture
//!
//! ```text
//! Listener → SpecRegistry match → session lookup → ReverseProxy
//!          → TransportFactory roundtrip (or in-memory loop) → client
//!
//! Admin HTTP → control dispatcher → on-disk JSON + draft → reload
//!            → rebuilt registry swapped atomically
//! ```

pub mod apidef;
pub mod config;
pub mod control;
pub mod error;
pub mod headers;
pub mod health;
pub mod keys;
pub mod notifications;
pub mod oauth;
pub mod proxy;
pub mod registry;
pub mod reload;
pub mod session;
pub mod storage;

pub use config::Config;
pub use error::{GatewayError, Result};

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;

use crate::control::AdminContext;
use crate::health::HealthTracker;
use crate::notifications::Notifier;
use crate::oauth::OAuthClientRegistry;
use crate::proxy::engine::error_proxy_response;
use crate::proxy::{ProxyBody, ReverseProxy};
use crate::registry::{load_specs_from_dir, ApiSpec, SpecRegistry};
use crate::reload::{spawn_notification_listener, ReloadCoordinator};
use crate::session::{PolicyMap, SessionManager, SessionState};
use crate::storage::KeyValueStore;

/// The assembled gateway: registry, proxy engine, session machinery, and
/// the reload pipeline. Construct inside a tokio runtime.
pub struct Gateway {
    pub config: Arc<Config>,
    pub registry: Arc<SpecRegistry>,
    pub policies: Arc<PolicyMap>,
    pub sessions: Arc<SessionManager>,
    pub oauth: Arc<OAuthClientRegistry>,
    pub store: Arc<dyn KeyValueStore>,
    pub proxy: Arc<ReverseProxy>,
    pub coordinator: ReloadCoordinator,
    pub notifier: Arc<Notifier>,
    pub health: Arc<HealthTracker>,
}

impl Gateway {
    /// Wire the gateway together and load the initial definition set.
    pub fn new(config: Config, store: Arc<dyn KeyValueStore>) -> Result<Arc<Self>> {
        config.validate()?;
        let config = Arc::new(config);

        let registry = Arc::new(SpecRegistry::new());
        let policies = Arc::new(PolicyMap::new());
        let sessions = Arc::new(SessionManager::new(store.clone(), &config));
        let oauth = Arc::new(OAuthClientRegistry::new(
            store.clone(),
            config.oauth_token_expired_retain_period,
        ));
        let proxy = Arc::new(ReverseProxy::new(config.clone(), registry.clone()));
        let notifier = Arc::new(Notifier::new());
        let health = Arc::new(HealthTracker::new(config.health_check.enable_health_checks));

        // initial snapshot before the coordinator takes over
        registry.swap(load_specs_from_dir(&config.app_path)?);
        if config.policies.policy_source != "service" {
            policies.load_from_dir(&config.policies.policy_path)?;
        }
        tracing::info!(apis = registry.len(), policies = policies.len(), "Initial definitions loaded");

        let (coordinator, _task) =
            ReloadCoordinator::spawn(config.clone(), registry.clone(), policies.clone());
        spawn_notification_listener(&notifier, coordinator.clone());

        Ok(Arc::new(Self {
            config,
            registry,
            policies,
            sessions,
            oauth,
            store,
            proxy,
            coordinator,
            notifier,
            health,
        }))
    }

    /// The control plane's view of the gateway.
    pub fn admin_context(&self) -> Arc<AdminContext> {
        Arc::new(AdminContext {
            config: self.config.clone(),
            registry: self.registry.clone(),
            policies: self.policies.clone(),
            sessions: self.sessions.clone(),
            oauth: self.oauth.clone(),
            store: self.store.clone(),
            coordinator: self.coordinator.clone(),
            notifier: self.notifier.clone(),
            health: self.health.clone(),
        })
    }

    /// Start the data plane and the control plane.
    pub async fn start(self: Arc<Self>) -> Result<Vec<tokio::task::JoinHandle<()>>> {
        let mut handles = Vec::new();

        handles.push(self.proxy.loopback.clone().spawn_sweeper());
        handles.push(control::start_control_entrypoint(self.admin_context()).await?);
        handles.push(self.clone().start_data_entrypoint().await?);

        Ok(handles)
    }

    /// Bind the data-plane listener and serve connections, each in its
    /// own task, with protocol upgrades enabled.
    async fn start_data_entrypoint(self: Arc<Self>) -> Result<tokio::task::JoinHandle<()>> {
        let addr: SocketAddr = self
            .config
            .listen_address
            .parse()
            .map_err(|e| GatewayError::Config(format!("Invalid listen address: {}", e)))?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| GatewayError::Other(format!("Failed to bind {}: {}", addr, e)))?;

        tracing::info!(address = %addr, "Gateway listening");

        let handle = tokio::spawn(async move {
            loop {
                let (stream, remote_addr) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to accept connection");
                        continue;
                    }
                };

                let gateway = self.clone();
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let _ = http1::Builder::new()
                        .serve_connection(
                            io,
                            service_fn(move |req| {
                                let gateway = gateway.clone();
                                async move {
                                    Ok::<_, hyper::Error>(
                                        gateway.handle_data_request(req, remote_addr).await,
                                    )
                                }
                            }),
                        )
                        .with_upgrades()
                        .await;
                });
            }
        });

        Ok(handle)
    }

    /// Route one inbound request: registry match, session lookup, proxy.
    pub async fn handle_data_request(
        &self,
        req: hyper::Request<hyper::body::Incoming>,
        remote_addr: SocketAddr,
    ) -> hyper::Response<ProxyBody> {
        let path = req.uri().path().to_string();

        let Some(spec) = self.registry.find_by_listen_path(&path) else {
            return error_proxy_response(404, "No matching API found").response;
        };

        let session = match self.resolve_session(&spec, req.headers()) {
            Ok(session) => session,
            Err(response) => return response,
        };

        let begin = Instant::now();
        let proxied = self
            .proxy
            .serve(spec.clone(), req, Some(remote_addr), session.as_ref(), false)
            .await;
        self.health.record(
            spec.api_id(),
            proxied.response.status().as_u16(),
            begin.elapsed().as_millis() as u64,
        );
        proxied.response
    }

    /// The authentication chain seam: keyless APIs pass through, keyed
    /// APIs resolve their session from the configured auth header.
    fn resolve_session(
        &self,
        spec: &Arc<ApiSpec>,
        header_map: &http::HeaderMap,
    ) -> std::result::Result<Option<SessionState>, hyper::Response<ProxyBody>> {
        if spec.definition.use_keyless {
            return Ok(None);
        }

        let header_name = if spec.definition.auth.auth_header_name.is_empty() {
            "authorization".to_string()
        } else {
            spec.definition.auth.auth_header_name.to_lowercase()
        };

        let token = header_map
            .get(header_name.as_str())
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_start_matches("Bearer ").to_string())
            .unwrap_or_default();

        if token.is_empty() {
            return Err(error_proxy_response(401, "Authorization field missing").response);
        }

        match self.sessions.session_detail(&spec.definition.org_id, &token, false) {
            Some(session) => {
                if !session.access_rights.is_empty()
                    && !session.access_rights.contains_key(spec.api_id())
                {
                    return Err(
                        error_proxy_response(403, "Access to this API has been disallowed").response
                    );
                }
                Ok(Some(session))
            }
            None => Err(error_proxy_response(403, "Access to this API has been disallowed").response),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;

    fn test_config() -> Config {
        let mut config = Config::default();
        let dir = std::env::temp_dir().join(format!("gantry-lib-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        config.app_path = dir.join("apps").to_string_lossy().to_string();
        config.policies.policy_path = dir.join("policies").to_string_lossy().to_string();
        config
    }

    #[tokio::test]
    async fn test_gateway_new_empty_dirs() {
        let gateway = Gateway::new(test_config(), Arc::new(InMemoryStore::new())).unwrap();
        assert!(gateway.registry.is_empty());
        assert!(gateway.policies.is_empty());
    }

    #[tokio::test]
    async fn test_gateway_new_invalid_config() {
        let mut config = test_config();
        config.listen_address = "bogus".to_string();
        assert!(Gateway::new(config, Arc::new(InMemoryStore::new())).is_err());
    }

    #[tokio::test]
    async fn test_admin_context_shares_state() {
        let gateway = Gateway::new(test_config(), Arc::new(InMemoryStore::new())).unwrap();
        let ctx = gateway.admin_context();
        assert!(Arc::ptr_eq(&ctx.registry, &gateway.registry));
        assert!(Arc::ptr_eq(&ctx.policies, &gateway.policies));
    }
}
