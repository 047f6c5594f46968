//! Reverse proxy engine
//!
//! The end-to-end request pipeline: body capture, director (target
//! selection and URL rewriting), hop-by-hop header hygiene, transport
//! binding, circuit-breaker gate, enforced timeout, the roundtrip itself
//! (with in-memory loop interception for internal APIs), upgrade
//! splicing, and streaming response copy-back.

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use http_body_util::{combinators::BoxBody, BodyExt, Full, StreamBody};
use hyper::body::Frame;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::apidef::{ensure_transport, HostList};
use crate::config::Config;
use crate::error::GatewayError;
use crate::headers::{self, HOP_HEADERS};
use crate::proxy::balancer::{next_target, HostHealth};
use crate::proxy::breaker::BreakerRegistry;
use crate::proxy::discovery::ServiceCache;
use crate::proxy::loopback::{LoopbackRegistry, MAX_LOOP_LEVEL};
use crate::proxy::transport::TransportFactory;
use crate::proxy::websocket;
use crate::registry::{ApiSpec, PathRule, PathRuleKind, SpecRegistry, UrlSpec};
use crate::session::SessionState;

/// Response body handed back to the server loop.
pub type ProxyBody = BoxBody<Bytes, std::io::Error>;

const DEFAULT_USER_AGENT: &str = concat!("gantry/", env!("CARGO_PKG_VERSION"));

/// Outcome of one proxied request.
pub struct ProxyResponse {
    pub upstream_latency: Duration,
    pub response: http::Response<ProxyBody>,
    /// Buffered body copy when the caller asked for a cacheable response
    pub cached_body: Option<Bytes>,
}

/// A request as the engine consumes it: body captured, upgrade handle
/// split off, loop depth tracked across internal hops.
pub struct ProxyRequest {
    pub method: http::Method,
    pub uri: http::Uri,
    pub headers: http::HeaderMap,
    pub body: Bytes,
    pub remote_addr: Option<SocketAddr>,
    /// A URL-rewrite stage kept the rewritten host; use the URI as-is
    pub retain_host: bool,
    pub loop_level: usize,
    pub on_upgrade: Option<hyper::upgrade::OnUpgrade>,
}

impl ProxyRequest {
    pub fn new(method: http::Method, uri: http::Uri, headers: http::HeaderMap, body: Bytes) -> Self {
        Self {
            method,
            uri,
            headers,
            body,
            remote_addr: None,
            retain_host: false,
            loop_level: 0,
            on_upgrade: None,
        }
    }
}

/// The proxy engine, shared by every request.
pub struct ReverseProxy {
    pub config: Arc<Config>,
    pub registry: Arc<SpecRegistry>,
    pub transports: TransportFactory,
    pub service_cache: Arc<ServiceCache>,
    pub breakers: Arc<BreakerRegistry>,
    pub loopback: Arc<LoopbackRegistry>,
    pub host_health: Arc<HostHealth>,
}

impl ReverseProxy {
    pub fn new(config: Arc<Config>, registry: Arc<SpecRegistry>) -> Self {
        Self {
            transports: TransportFactory::new(config.clone()),
            service_cache: Arc::new(ServiceCache::new()),
            breakers: Arc::new(BreakerRegistry::new()),
            loopback: Arc::new(LoopbackRegistry::new()),
            host_health: Arc::new(HostHealth::new()),
            config,
            registry,
        }
    }

    /// Serve a request from the wire: capture the body, split off the
    /// upgrade handle, and run the pipeline.
    pub async fn serve(
        &self,
        spec: Arc<ApiSpec>,
        mut req: http::Request<hyper::body::Incoming>,
        remote_addr: Option<SocketAddr>,
        session: Option<&SessionState>,
        use_cache: bool,
    ) -> ProxyResponse {
        let upgrade_requested = self.config.http_server_options.enable_websockets
            && websocket::upgrade_type(req.headers()).is_some();
        let on_upgrade = if upgrade_requested {
            Some(hyper::upgrade::on(&mut req))
        } else {
            None
        };

        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                tracing::debug!(error = %e, "Unable to read request body");
                return error_proxy_response(
                    500,
                    "There was a problem with reading Body of the Request.",
                );
            }
        };

        let preq = ProxyRequest {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            body,
            remote_addr,
            retain_host: parts.extensions.get::<RetainHost>().is_some(),
            loop_level: 0,
            on_upgrade,
        };

        self.serve_request(spec, preq, session, use_cache).await
    }

    /// The pipeline proper. Also the entry point for internal-loop hops.
    pub async fn serve_request(
        &self,
        spec: Arc<ApiSpec>,
        preq: ProxyRequest,
        session: Option<&SessionState>,
        use_cache: bool,
    ) -> ProxyResponse {
        let request_path = preq.uri.path().to_string();
        let method = preq.method.as_str().to_string();
        let query = parse_query(preq.uri.query().unwrap_or(""));
        let header_map = lowercase_headers(&preq.headers);

        let version = spec.request_version_name(&header_map, &query);
        let match_path = spec.definition.strip_listen_path(&request_path).to_string();

        // Mock endpoints answer without an upstream roundtrip
        if let Some(UrlSpec {
            rule: PathRule::Mock(meta),
            ..
        }) = spec.find_rule(&version, &match_path, &method, PathRuleKind::Mock)
        {
            tracing::debug!(api_id = spec.api_id(), path = %match_path, "Serving mock response");
            let mut builder = http::Response::builder().status(meta.code.clamp(200, 599));
            for (k, v) in &meta.headers {
                builder = builder.header(k.as_str(), v.as_str());
            }
            let response = builder
                .body(full_body(Bytes::from(meta.body.clone())))
                .unwrap();
            return ProxyResponse {
                upstream_latency: Duration::ZERO,
                response,
                cached_body: Some(Bytes::from(meta.body.clone())),
            };
        }

        // Director: pick the target and rewrite the outbound URL
        let (target_url, h2c) = match self.director(&spec, &preq, &match_path).await {
            Ok(target) => target,
            Err(err) => return self.handle_proxy_error(&spec, session, err),
        };

        // Internal loop: reserved scheme or the internal header
        let internal_header = preq.headers.contains_key(headers::INTERNAL_API);
        if target_url.starts_with(&format!("{}://", headers::INTERNAL_SCHEME)) || internal_header {
            return self
                .serve_internal(&spec, preq, &target_url, internal_header, session)
                .await;
        }

        let out_headers = self.build_outbound_headers(&spec, &preq, &version, &match_path, &method);

        // Timeouts: a per-endpoint hard timeout takes precedence over the
        // gateway default, for the dial timeout as well
        let enforced_timeout = spec.hard_timeout(&version, &match_path, &method);
        let dial_timeout = enforced_timeout
            .map(|t| t.max(self.config.proxy_timeout()))
            .unwrap_or_else(|| self.config.proxy_timeout());

        let transport = match self.transports.transport_for(&spec, dial_timeout, h2c) {
            Ok(transport) => transport,
            Err(err) => return self.handle_proxy_error(&spec, session, err),
        };

        // Circuit breaker gate
        let breaker = spec
            .breaker_meta(&version, &match_path, &method)
            .map(|meta| self.breakers.breaker_for(spec.api_id(), meta));
        if let Some(ref breaker) = breaker {
            if !breaker.ready() {
                tracing::debug!(api_id = spec.api_id(), "Circuit breaker is open");
                return self.handle_proxy_error(
                    &spec,
                    session,
                    GatewayError::CircuitOpen(match_path.clone()),
                );
            }
        }

        let url = match reqwest::Url::parse(&target_url) {
            Ok(url) => url,
            Err(e) => {
                return self.handle_proxy_error(
                    &spec,
                    session,
                    GatewayError::Other(format!("Couldn't parse target URL: {}", e)),
                )
            }
        };

        let mut builder = transport
            .client
            .request(preq.method.clone(), url)
            .headers(out_headers)
            .body(preq.body.clone());
        if let Some(timeout) = enforced_timeout {
            builder = builder.timeout(Duration::from_secs_f64(timeout));
        }

        let begin = Instant::now();
        let result = builder.send().await;
        let upstream_latency = begin.elapsed();

        if let Some(ref breaker) = breaker {
            match &result {
                Ok(res) if res.status().as_u16() / 100 != 5 => breaker.success(),
                _ => breaker.fail(),
            }
        }

        let res = match result {
            Ok(res) => res,
            Err(err) => {
                if err.is_timeout() && spec.definition.proxy.service_discovery.use_discovery_service
                {
                    tracing::debug!(
                        api_id = spec.api_id(),
                        "Upstream host failed, refreshing discovery host list"
                    );
                    self.service_cache.invalidate(spec.api_id());
                }
                let mut proxied = self.handle_proxy_error(&spec, session, map_reqwest_error(err));
                proxied.upstream_latency = upstream_latency;
                return proxied;
            }
        };

        // 101 Switching Protocols: hijack both sides and splice
        if res.status() == http::StatusCode::SWITCHING_PROTOCOLS {
            if let Some(on_upgrade) = preq.on_upgrade {
                return finish_upgrade(res, on_upgrade, upstream_latency);
            }
            return error_proxy_response(500, "Protocol switch without an upgradable connection");
        }

        let mut proxied = self
            .build_response(&spec, res, session, use_cache)
            .await;
        proxied.upstream_latency = upstream_latency;
        proxied
    }

    /// Determine the outbound target URL. Priority: retained rewrite →
    /// service discovery → load balancing → structured list → target URL.
    async fn director(
        &self,
        spec: &Arc<ApiSpec>,
        preq: &ProxyRequest,
        match_path: &str,
    ) -> Result<(String, bool), GatewayError> {
        if preq.retain_host {
            tracing::debug!("Detected host rewrite, overriding target");
            return Ok((preq.uri.to_string(), false));
        }

        let proxy = &spec.definition.proxy;
        let mut host_list: Option<HostList> = None;

        if proxy.service_discovery.use_discovery_service {
            match self.service_cache.resolve(spec).await {
                Ok(hosts) => host_list = Some(hosts),
                Err(e) => {
                    tracing::error!(api_id = spec.api_id(), error = %e, "Service discovery target lookup failed");
                }
            }
        }

        let base = if proxy.service_discovery.use_discovery_service || proxy.enable_load_balancing {
            let list = host_list.unwrap_or_else(|| spec.structured_target_list());
            next_target(&list, spec, &self.host_health)?
        } else if !proxy.target_list.is_empty() {
            ensure_transport(&proxy.target_list[0], &spec.definition.protocol)
        } else {
            proxy.target_url.clone()
        };

        // scheme rewrites: websocket schemes ride plain HTTP upstream,
        // h2c flags the transport
        let mut h2c = false;
        let base = if let Some(rest) = base.strip_prefix("ws://") {
            format!("http://{}", rest)
        } else if let Some(rest) = base.strip_prefix("wss://") {
            format!("https://{}", rest)
        } else if let Some(rest) = base.strip_prefix("h2c://") {
            h2c = true;
            format!("http://{}", rest)
        } else {
            base
        };

        if base.starts_with(&format!("{}://", headers::INTERNAL_SCHEME)) {
            return Ok((base, false));
        }

        let mut target = reqwest::Url::parse(&base)
            .map_err(|e| GatewayError::Other(format!("Couldn't parse target URL: {}", e)))?;

        let upstream_path = if spec.definition.proxy.strip_listen_path {
            match_path.to_string()
        } else {
            preq.uri.path().to_string()
        };
        let joined = single_joining_slash(
            target.path(),
            &upstream_path,
            spec.definition.proxy.disable_strip_slash,
        );
        target.set_path(&joined);

        // merge the target's query with the request's
        let merged_query = match (target.query(), preq.uri.query()) {
            (Some(tq), Some(rq)) if !tq.is_empty() && !rq.is_empty() => {
                Some(format!("{}&{}", tq, rq))
            }
            (Some(tq), _) if !tq.is_empty() => Some(tq.to_string()),
            (_, Some(rq)) if !rq.is_empty() => Some(rq.to_string()),
            _ => None,
        };
        target.set_query(merged_query.as_deref());

        Ok((target.to_string(), h2c))
    }

    /// Hop-by-hop hygiene plus per-API header transforms.
    fn build_outbound_headers(
        &self,
        spec: &ApiSpec,
        preq: &ProxyRequest,
        version: &str,
        match_path: &str,
        method: &str,
    ) -> http::HeaderMap {
        let mut out = preq.headers.clone();
        let upgrade = websocket::upgrade_type(&preq.headers)
            .filter(|_| self.config.http_server_options.enable_websockets);

        // remove everything the Connection header names (RFC 2616 §14.10)
        let named: Vec<String> = out
            .get_all(http::header::CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        for name in named {
            out.remove(name.as_str());
        }

        for header in HOP_HEADERS {
            if *header == "te" {
                let is_trailers = out
                    .get("te")
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v == "trailers")
                    .unwrap_or(false);
                if is_trailers {
                    continue;
                }
            }
            out.remove(*header);
        }

        // a persistent connection upstream, except for upgrades
        if let Some(upgrade_type) = upgrade {
            out.insert(http::header::CONNECTION, "Upgrade".parse().unwrap());
            out.insert(http::header::UPGRADE, upgrade_type.parse().unwrap());
        }

        if !spec.header_in_remove_list(version, match_path, method, headers::X_FORWARDED_FOR) {
            if let Some(hops) = request_ip_hops(&preq.headers, preq.remote_addr) {
                out.insert(headers::X_FORWARDED_FOR, hops.parse().unwrap());
            }
        }

        // version-global and endpoint-level header transforms
        if let Some(info) = spec.definition.version_data.versions.get(version) {
            for name in &info.global_headers_remove {
                out.remove(name.to_lowercase().as_str());
            }
            for (name, value) in &info.global_headers {
                if let (Ok(name), Ok(value)) = (
                    http::header::HeaderName::from_bytes(name.as_bytes()),
                    value.parse(),
                ) {
                    out.insert(name, value);
                }
            }
        }
        if let Some(UrlSpec {
            rule: PathRule::HeaderInject(meta),
            ..
        }) = spec.find_rule(version, match_path, method, PathRuleKind::HeaderInject)
        {
            for name in &meta.delete_headers {
                out.remove(name.to_lowercase().as_str());
            }
            for (name, value) in &meta.add_headers {
                if let (Ok(name), Ok(value)) = (
                    http::header::HeaderName::from_bytes(name.as_bytes()),
                    value.parse(),
                ) {
                    out.insert(name, value);
                }
            }
        }

        if !out.contains_key(http::header::USER_AGENT) {
            out.insert(http::header::USER_AGENT, DEFAULT_USER_AGENT.parse().unwrap());
        }

        if !spec.definition.proxy.preserve_host_header {
            // reqwest derives Host from the target URL
            out.remove(http::header::HOST);
        }

        out
    }

    /// Dispatch an internal-API call through the in-memory loop.
    async fn serve_internal(
        &self,
        spec: &Arc<ApiSpec>,
        mut preq: ProxyRequest,
        target_url: &str,
        had_internal_header: bool,
        session: Option<&SessionState>,
    ) -> ProxyResponse {
        if preq.loop_level >= MAX_LOOP_LEVEL {
            return self.handle_proxy_error(
                spec,
                session,
                GatewayError::Other("Loop level too deep".to_string()),
            );
        }

        if had_internal_header {
            preq.headers.remove(headers::INTERNAL_API);
        }

        let host = reqwest::Url::parse(target_url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
            .unwrap_or_default();

        let Some(target_spec) = self.loopback.resolve(&host, &self.registry) else {
            tracing::error!(looping_url = %format!("{}://{}", headers::INTERNAL_SCHEME, host), "Couldn't detect target");
            return self.handle_proxy_error(
                spec,
                session,
                GatewayError::UpstreamUnreachable(format!("no internal handler for {}", host)),
            );
        };

        tracing::debug!(
            looping_url = %format!("{}://{}", headers::INTERNAL_SCHEME, host),
            "Executing request on internal route"
        );

        let inner = ProxyRequest {
            method: preq.method.clone(),
            uri: preq.uri.clone(),
            headers: preq.headers.clone(),
            body: preq.body.clone(),
            remote_addr: preq.remote_addr,
            retain_host: false,
            loop_level: preq.loop_level + 1,
            on_upgrade: None,
        };

        Box::pin(self.serve_request(target_spec, inner, session, false)).await
    }

    /// Copy the upstream response back: hop-by-hop hygiene, rate-limit
    /// headers, streaming body with flush-interval override.
    async fn build_response(
        &self,
        spec: &ApiSpec,
        res: reqwest::Response,
        session: Option<&SessionState>,
        use_cache: bool,
    ) -> ProxyResponse {
        let status = res.status();
        let mut header_map = res.headers().clone();

        let named: Vec<String> = header_map
            .get_all(http::header::CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        for name in named {
            header_map.remove(name.as_str());
        }
        for header in HOP_HEADERS {
            header_map.remove(*header);
        }

        if self.config.close_connections {
            header_map.insert(http::header::CONNECTION, "close".parse().unwrap());
        }

        let content_length = res.content_length();
        let streaming = is_streaming_response(&header_map, content_length);

        let mut builder = http::Response::builder().status(status);
        for (name, value) in header_map.iter() {
            builder = builder.header(name, value);
        }
        builder = rate_limit_headers(builder, spec, session);

        if use_cache && !streaming {
            // buffer so the body can be re-read by the caching layer
            let body = match res.bytes().await {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::error!(
                        org_id = spec.definition.org_id,
                        api_id = spec.api_id(),
                        error = %e,
                        "Proxy error during body copy"
                    );
                    return error_proxy_response(500, "There was a problem proxying the request");
                }
            };
            let response = builder.body(full_body(body.clone())).unwrap();
            return ProxyResponse {
                upstream_latency: Duration::ZERO,
                response,
                cached_body: Some(body),
            };
        }

        let flush_interval = self.flush_interval(&header_map, content_length);
        let stream = copy_response_stream(res.bytes_stream(), flush_interval);
        let body = BoxBody::new(StreamBody::new(stream.map(|chunk| chunk.map(Frame::data))));
        let response = builder.body(body).unwrap();

        ProxyResponse {
            upstream_latency: Duration::ZERO,
            response,
            cached_body: None,
        }
    }

    /// Flush interval for the response copy: immediate for event streams
    /// and unknown-length bodies, else the configured interval.
    fn flush_interval(
        &self,
        header_map: &http::HeaderMap,
        content_length: Option<u64>,
    ) -> Option<Duration> {
        let content_type = header_map
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if content_type == "text/event-stream" || content_length.is_none() {
            return None; // flush immediately
        }
        let millis = self.config.http_server_options.flush_interval;
        if millis == 0 {
            None
        } else {
            Some(Duration::from_millis(millis))
        }
    }

    /// Map an error to the client-facing response, logging with the
    /// request's identity fields.
    fn handle_proxy_error(
        &self,
        spec: &ApiSpec,
        session: Option<&SessionState>,
        err: GatewayError,
    ) -> ProxyResponse {
        let user = session
            .map(|s| crate::keys::obfuscate(&s.key_id))
            .unwrap_or_else(|| "--".to_string());
        tracing::error!(
            org_id = spec.definition.org_id,
            api_id = spec.api_id(),
            user_id = user,
            error = %err,
            "Proxy error"
        );

        let (status, message) = match &err {
            GatewayError::UpstreamTimeout(_) => {
                (504, "Upstream service reached hard timeout.".to_string())
            }
            GatewayError::ClientClosed => (499, "Client closed request".to_string()),
            GatewayError::CircuitOpen(_) => (503, "Service temporarily unavailable.".to_string()),
            GatewayError::UpstreamUnreachable(msg) if msg.contains("all hosts are down") => {
                (503, "all hosts are down".to_string())
            }
            GatewayError::UpstreamUnreachable(msg) if msg.contains("lookup") => {
                (500, "Upstream host lookup failed".to_string())
            }
            _ => (500, "There was a problem proxying the request".to_string()),
        };
        error_proxy_response(status, &message)
    }
}

/// Marker extension set by URL-rewrite stages that already fixed the
/// outbound host.
#[derive(Debug, Clone, Copy)]
pub struct RetainHost;

/// Single-slash join of a target base path and a request subpath.
pub fn single_joining_slash(target_path: &str, sub_path: &str, disable_strip_slash: bool) -> String {
    if disable_strip_slash && (sub_path.is_empty() || sub_path == "/") {
        return target_path.to_string();
    }
    let target = target_path.trim_end_matches('/');
    let sub = sub_path.trim_start_matches('/');
    if sub.is_empty() {
        if target.is_empty() {
            "/".to_string()
        } else {
            target.to_string()
        }
    } else {
        format!("{}/{}", target, sub)
    }
}

/// The X-Forwarded-For chain: prior entries folded with the client IP.
pub fn request_ip_hops(
    header_map: &http::HeaderMap,
    remote_addr: Option<SocketAddr>,
) -> Option<String> {
    let client_ip = remote_addr?.ip().to_string();
    let prior: Vec<String> = header_map
        .get_all(headers::X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .collect();
    if prior.is_empty() {
        Some(client_ip)
    } else {
        Some(format!("{}, {}", prior.join(", "), client_ip))
    }
}

fn is_streaming_response(header_map: &http::HeaderMap, content_length: Option<u64>) -> bool {
    let content_type = header_map
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    content_type == "text/event-stream" || content_length.is_none()
}

fn rate_limit_headers(
    builder: http::response::Builder,
    spec: &ApiSpec,
    session: Option<&SessionState>,
) -> http::response::Builder {
    let (max, remaining, renews) = match session {
        Some(session) => match session.access_rights.get(spec.api_id()) {
            Some(access) if !access.limit.is_empty() => (
                access.limit.quota_max,
                access.limit.quota_remaining,
                access.limit.quota_renews,
            ),
            _ => (session.quota_max, session.quota_remaining, session.quota_renews),
        },
        None => (0, 0, 0),
    };
    builder
        .header(headers::RATE_LIMIT_LIMIT, max.to_string())
        .header(headers::RATE_LIMIT_REMAINING, remaining.to_string())
        .header(headers::RATE_LIMIT_RESET, renews.to_string())
}

fn map_reqwest_error(err: reqwest::Error) -> GatewayError {
    let text = format!("{:?}", err);
    if err.is_timeout() || text.contains("timeout awaiting response headers") {
        return GatewayError::UpstreamTimeout(err.to_string());
    }
    if text.contains("operation was canceled") || text.contains("context canceled") {
        return GatewayError::ClientClosed;
    }
    if text.contains("dns error") || text.contains("failed to lookup") || text.contains("no such host")
    {
        return GatewayError::UpstreamUnreachable(format!("lookup failed: {}", err));
    }
    GatewayError::Http(err)
}

/// Spawn the bidirectional splice for a 101 response and answer the
/// client with the switch headers.
fn finish_upgrade(
    res: reqwest::Response,
    on_upgrade: hyper::upgrade::OnUpgrade,
    upstream_latency: Duration,
) -> ProxyResponse {
    let mut builder = http::Response::builder().status(http::StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in res.headers().iter() {
        builder = builder.header(name, value);
    }

    tokio::spawn(async move {
        let upstream = match res.upgrade().await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                tracing::error!(error = %e, "Upstream upgrade failed");
                return;
            }
        };
        let client = match on_upgrade.await {
            Ok(upgraded) => hyper_util::rt::TokioIo::new(upgraded),
            Err(e) => {
                tracing::error!(error = %e, "Client upgrade failed");
                return;
            }
        };
        websocket::splice(client, upstream).await;
    });

    ProxyResponse {
        upstream_latency,
        response: builder.body(full_body(Bytes::new())).unwrap(),
        cached_body: None,
    }
}

/// Body copy with periodic flushing: `None` interval emits chunks as they
/// arrive, otherwise chunks are coalesced per interval window.
type SyncBoxStream =
    std::pin::Pin<Box<dyn futures_util::Stream<Item = Result<Bytes, std::io::Error>> + Send + Sync>>;

fn copy_response_stream<S>(stream: S, interval: Option<Duration>) -> SyncBoxStream
where
    S: futures_util::Stream<Item = Result<Bytes, reqwest::Error>> + Send + Sync + 'static,
{
    let Some(interval) = interval else {
        return Box::pin(
            stream.map(|chunk| chunk.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))),
        );
    };

    let boxed_inner: std::pin::Pin<
        Box<dyn futures_util::Stream<Item = Result<Bytes, reqwest::Error>> + Send + Sync>,
    > = Box::pin(stream);

    Box::pin(futures_util::stream::unfold(
        (boxed_inner, false),
        move |(mut inner, done)| async move {
            if done {
                return None;
            }
            let mut buf = BytesMut::new();
            let deadline = tokio::time::sleep(interval);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = &mut deadline, if !buf.is_empty() => {
                        return Some((Ok(buf.freeze()), (inner, false)));
                    }
                    chunk = inner.next() => match chunk {
                        Some(Ok(bytes)) => buf.extend_from_slice(&bytes),
                        Some(Err(e)) => {
                            return Some((
                                Err(std::io::Error::new(std::io::ErrorKind::Other, e)),
                                (inner, true),
                            ));
                        }
                        None => {
                            if buf.is_empty() {
                                return None;
                            }
                            return Some((Ok(buf.freeze()), (inner, true)));
                        }
                    }
                }
            }
        },
    ))
}

fn full_body(bytes: Bytes) -> ProxyBody {
    BoxBody::new(Full::new(bytes).map_err(|never| match never {}))
}

/// An error response the proxy owns (the middleware error handler's body).
pub fn error_proxy_response(status: u16, message: &str) -> ProxyResponse {
    let body = Bytes::from(format!(r#"{{"error":"{}"}}"#, message));
    let response = http::Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(full_body(body.clone()))
        .unwrap();
    ProxyResponse {
        upstream_latency: Duration::ZERO,
        response,
        cached_body: Some(body),
    }
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

fn lowercase_headers(header_map: &http::HeaderMap) -> HashMap<String, String> {
    header_map
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}
