//! Admin control plane
//!
//! The HTTP surface that mutates the registry, sessions, policies, and
//! OAuth clients. Every route lives under `/tyk`, requires the admin
//! authorization header, and answers JSON: `{status, message}` for
//! errors, `{key, status, action}` for mutations, the stored object for
//! reads. Mutations write their artifact to disk and enqueue a reload.

pub mod apis;
pub mod keys;
pub mod oauth;
pub mod policies;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::headers::{AUTHORIZATION, CACHE_KEY_PREFIX};
use crate::health::HealthTracker;
use crate::notifications::{Command, Notification, Notifier};
use crate::oauth::OAuthClientRegistry;
use crate::registry::SpecRegistry;
use crate::reload::ReloadCoordinator;
use crate::session::{PolicyMap, SessionManager};
use crate::storage::KeyValueStore;

/// Everything the admin handlers touch.
pub struct AdminContext {
    pub config: Arc<Config>,
    pub registry: Arc<SpecRegistry>,
    pub policies: Arc<PolicyMap>,
    pub sessions: Arc<SessionManager>,
    pub oauth: Arc<OAuthClientRegistry>,
    pub store: Arc<dyn KeyValueStore>,
    pub coordinator: ReloadCoordinator,
    pub notifier: Arc<Notifier>,
    pub health: Arc<HealthTracker>,
}

/// Admin status message body.
#[derive(Debug, Serialize)]
pub struct ApiStatusMessage {
    pub status: String,
    pub message: String,
}

pub fn api_ok(message: impl Into<String>) -> Value {
    json!({"status": "ok", "message": message.into()})
}

pub fn api_error(message: impl Into<String>) -> Value {
    json!({"status": "error", "message": message.into()})
}

/// Mutation success body.
pub fn modify_success(key: &str, action: &str) -> Value {
    json!({"key": key, "status": "ok", "action": action})
}

pub fn error_response(err: &GatewayError) -> (u16, Value) {
    (err.status_code(), api_error(err.to_string()))
}

/// A dispatched admin response.
pub struct AdminResponse {
    pub code: u16,
    pub body: Vec<u8>,
    pub content_type: &'static str,
    pub extra_headers: Vec<(String, String)>,
}

impl AdminResponse {
    pub fn json(code: u16, value: &Value) -> Self {
        Self {
            code,
            body: serde_json::to_vec(value).unwrap_or_default(),
            content_type: "application/json",
            extra_headers: Vec::new(),
        }
    }

    /// JSON file attachment (OAS export).
    pub fn export(code: u16, value: &Value, file_name: &str) -> Self {
        if code != 200 {
            return Self::json(code, value);
        }
        Self {
            code,
            body: serde_json::to_vec(value).unwrap_or_default(),
            content_type: "application/octet-stream",
            extra_headers: vec![(
                "content-disposition".to_string(),
                format!("attachment; filename=\"{}\"", file_name),
            )],
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.extra_headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn method_not_allowed() -> Self {
        Self::json(405, &api_error("Method not supported"))
    }

    pub fn not_found() -> Self {
        Self::json(404, &api_error("Not found"))
    }
}

pub(crate) fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

/// Start the admin listener.
pub async fn start_control_entrypoint(ctx: Arc<AdminContext>) -> Result<tokio::task::JoinHandle<()>> {
    let addr: std::net::SocketAddr = ctx
        .config
        .control_listen_address
        .parse()
        .map_err(|e| GatewayError::Config(format!("Invalid control listen address: {}", e)))?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| GatewayError::Other(format!("Failed to bind control API {}: {}", addr, e)))?;

    tracing::info!(address = %addr, "Control API listening");

    let handle = tokio::spawn(async move {
        loop {
            let (stream, _remote) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept control connection");
                    continue;
                }
            };
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let _ = http1::Builder::new()
                    .serve_connection(
                        io,
                        service_fn(move |req| {
                            let ctx = ctx.clone();
                            async move { Ok::<_, hyper::Error>(handle_admin_request(req, ctx).await) }
                        }),
                    )
                    .await;
            });
        }
    });

    Ok(handle)
}

async fn handle_admin_request(
    req: hyper::Request<hyper::body::Incoming>,
    ctx: Arc<AdminContext>,
) -> hyper::Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = parse_query(req.uri().query().unwrap_or(""));

    let Some(admin_path) = path.strip_prefix("/tyk") else {
        return to_hyper(AdminResponse::not_found());
    };

    // admin auth guards every route
    let presented = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if presented != ctx.config.secret {
        tracing::warn!(path = %path, "Attempted administrative access with invalid or missing key");
        return to_hyper(AdminResponse::json(
            403,
            &api_error("Attempted administrative access with invalid or missing key!"),
        ));
    }

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => {
            return to_hyper(AdminResponse::json(400, &api_error("Request malformed")));
        }
    };

    let segments: Vec<String> = admin_path
        .trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect();

    let response = dispatch(&ctx, &method, &segments, &query, &body).await;
    to_hyper(response)
}

fn to_hyper(response: AdminResponse) -> hyper::Response<Full<Bytes>> {
    let mut builder = hyper::Response::builder()
        .status(response.code)
        .header("content-type", response.content_type)
        // admin responses are never cacheable
        .header("cache-control", "no-cache, no-store, must-revalidate")
        .header("pragma", "no-cache")
        .header("x-content-type-options", "nosniff")
        .header("x-frame-options", "DENY");
    for (name, value) in &response.extra_headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder.body(Full::new(Bytes::from(response.body))).unwrap()
}

/// Route an admin request to its handler. Public so embedders and tests
/// can drive the surface without a socket.
pub async fn dispatch(
    ctx: &AdminContext,
    method: &http::Method,
    segments: &[String],
    query: &HashMap<String, String>,
    body: &Bytes,
) -> AdminResponse {
    use http::Method;

    let seg: Vec<&str> = segments.iter().map(|s| s.as_str()).collect();

    match seg.as_slice() {
        // --- APIs, Classic form ---
        ["apis"] => match *method {
            Method::GET => apis::get_api_list(ctx),
            Method::POST => apis::add_api(ctx, body, query, false).await,
            _ => AdminResponse::method_not_allowed(),
        },
        ["apis", "oas"] => match *method {
            Method::GET => apis::get_api_list_oas(ctx, query),
            Method::POST => apis::add_api(ctx, body, query, true).await,
            _ => AdminResponse::method_not_allowed(),
        },
        ["apis", "oas", "import"] => match *method {
            Method::POST => apis::import_oas(ctx, body, query).await,
            _ => AdminResponse::method_not_allowed(),
        },
        ["apis", "oas", "export"] => match *method {
            Method::GET => apis::export_oas(ctx, None, query),
            _ => AdminResponse::method_not_allowed(),
        },
        ["apis", "oas", api_id, "export"] => match *method {
            Method::GET => apis::export_oas(ctx, Some(api_id), query),
            _ => AdminResponse::method_not_allowed(),
        },
        ["apis", "oas", api_id] => match *method {
            Method::GET => apis::get_api(ctx, api_id, true, query),
            Method::PUT => apis::update_api(ctx, api_id, body, true).await,
            Method::PATCH => apis::patch_oas(ctx, api_id, body, query).await,
            Method::DELETE => apis::delete_api(ctx, api_id).await,
            _ => AdminResponse::method_not_allowed(),
        },
        ["apis", api_id] => match *method {
            Method::GET => apis::get_api(ctx, api_id, false, query),
            Method::PUT => apis::update_api(ctx, api_id, body, false).await,
            Method::DELETE => apis::delete_api(ctx, api_id).await,
            _ => AdminResponse::method_not_allowed(),
        },

        // --- Keys ---
        ["keys", "create"] => match *method {
            Method::POST => keys::create_key(ctx, body),
            _ => AdminResponse::method_not_allowed(),
        },
        ["keys", "preview"] => match *method {
            Method::POST => keys::preview_key(ctx, body),
            _ => AdminResponse::method_not_allowed(),
        },
        ["keys"] => match *method {
            Method::GET => keys::get_all_keys(ctx, query),
            _ => AdminResponse::method_not_allowed(),
        },
        ["keys", key_name] => match *method {
            Method::POST | Method::PUT => {
                keys::add_or_update_key(ctx, key_name, method, body, query)
            }
            Method::GET => keys::get_key(ctx, key_name, query),
            Method::DELETE => keys::delete_key(ctx, key_name, query),
            _ => AdminResponse::method_not_allowed(),
        },

        // --- Org keys ---
        ["org", "keys", org_id] => match *method {
            Method::POST | Method::PUT => keys::org_add_or_update(ctx, org_id, body, query),
            Method::GET => keys::org_get(ctx, org_id),
            Method::DELETE => keys::org_delete(ctx, org_id),
            _ => AdminResponse::method_not_allowed(),
        },

        // --- Policies ---
        ["policies"] => match *method {
            Method::GET => policies::get_policy_list(ctx),
            Method::POST => policies::add_or_update_policy(ctx, None, body),
            _ => AdminResponse::method_not_allowed(),
        },
        ["policies", policy_id] => match *method {
            Method::GET => policies::get_policy(ctx, policy_id),
            Method::PUT => policies::add_or_update_policy(ctx, Some(policy_id), body),
            Method::DELETE => policies::delete_policy(ctx, policy_id),
            _ => AdminResponse::method_not_allowed(),
        },

        // --- OAuth ---
        ["oauth", "clients", "create"] => match *method {
            Method::POST => oauth::create_client(ctx, body),
            _ => AdminResponse::method_not_allowed(),
        },
        ["oauth", "clients", api_id] => match *method {
            Method::GET => oauth::list_clients(ctx, api_id),
            _ => AdminResponse::method_not_allowed(),
        },
        ["oauth", "clients", api_id, client_id] => match *method {
            Method::GET => oauth::get_client(ctx, api_id, client_id),
            Method::PUT => oauth::update_client(ctx, api_id, client_id, body),
            Method::DELETE => oauth::delete_client(ctx, api_id, client_id),
            _ => AdminResponse::method_not_allowed(),
        },
        ["oauth", "clients", api_id, client_id, "rotate"] => match *method {
            Method::PUT => oauth::rotate_client(ctx, api_id, client_id),
            _ => AdminResponse::method_not_allowed(),
        },
        ["oauth", "clients", api_id, client_id, "tokens"] => match *method {
            Method::GET => oauth::client_tokens(ctx, api_id, client_id, query),
            _ => AdminResponse::method_not_allowed(),
        },
        ["oauth", "revoke"] => match *method {
            Method::POST => oauth::revoke_token(ctx, body),
            _ => AdminResponse::method_not_allowed(),
        },
        ["oauth", "revoke_all"] => match *method {
            Method::POST => oauth::revoke_all_tokens(ctx, body),
            _ => AdminResponse::method_not_allowed(),
        },
        ["oauth", "tokens"] => match *method {
            Method::DELETE => oauth::purge_lapsed_tokens(ctx, query),
            _ => AdminResponse::method_not_allowed(),
        },

        // --- Cache ---
        ["cache", api_id] => match *method {
            Method::DELETE => invalidate_cache(ctx, api_id),
            _ => AdminResponse::method_not_allowed(),
        },

        // --- Reload ---
        ["reload"] => match *method {
            Method::GET => reload(ctx, query, false).await,
            _ => AdminResponse::method_not_allowed(),
        },
        ["reload", "group"] => match *method {
            Method::GET => reload(ctx, query, true).await,
            _ => AdminResponse::method_not_allowed(),
        },

        // --- Health ---
        ["health"] => match *method {
            Method::GET => health(ctx, query),
            _ => AdminResponse::method_not_allowed(),
        },

        _ => AdminResponse::not_found(),
    }
}

/// Invalidate the upstream response cache for one API.
fn invalidate_cache(ctx: &AdminContext, api_id: &str) -> AdminResponse {
    let removed = ctx
        .store
        .delete_by_prefix(&format!("{}{}", CACHE_KEY_PREFIX, api_id));
    tracing::info!(api_id, removed, "Cache invalidated");
    AdminResponse::json(200, &api_ok("cache invalidated"))
}

/// Trigger a reload; `block=true` waits for the swap, group reloads also
/// notify the cluster.
async fn reload(ctx: &AdminContext, query: &HashMap<String, String>, group: bool) -> AdminResponse {
    if group {
        tracing::info!("Group reload accepted");
        ctx.notifier
            .notify(Notification::new(Command::GroupReload, ""));
    }

    if query.get("block").map(|v| v == "true").unwrap_or(false) {
        let done = ctx.coordinator.queue_reload_blocking();
        let _ = done.await;
    } else {
        ctx.coordinator.queue_reload();
    }

    tracing::info!("Reload URL structure - scheduled");
    AdminResponse::json(200, &api_ok(""))
}

fn health(ctx: &AdminContext, query: &HashMap<String, String>) -> AdminResponse {
    if !ctx.health.enabled() {
        return AdminResponse::json(400, &api_error("Health checks are not enabled for this node"));
    }
    let Some(api_id) = query.get("api_id") else {
        return AdminResponse::json(400, &api_error("missing api_id parameter"));
    };
    let snapshot = ctx.health.snapshot(api_id);
    AdminResponse::json(200, &serde_json::to_value(snapshot).unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_bodies() {
        assert_eq!(api_ok("fine")["status"], "ok");
        assert_eq!(api_error("broken")["message"], "broken");
        let body = modify_success("abc", "added");
        assert_eq!(body["key"], "abc");
        assert_eq!(body["action"], "added");
    }

    #[test]
    fn test_export_attachment_headers() {
        let response = AdminResponse::export(200, &json!({"a": 1}), "oas-x.json");
        assert_eq!(response.content_type, "application/octet-stream");
        assert_eq!(
            response.extra_headers[0].1,
            "attachment; filename=\"oas-x.json\""
        );

        // errors stay JSON
        let response = AdminResponse::export(404, &api_error("nope"), "oas-x.json");
        assert_eq!(response.content_type, "application/json");
    }

    #[test]
    fn test_parse_query() {
        let parsed = parse_query("block=true&mode=public");
        assert_eq!(parsed["block"], "true");
        assert_eq!(parsed["mode"], "public");
    }
}
