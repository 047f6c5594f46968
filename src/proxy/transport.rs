//! Outbound transport factory
//!
//! One transport per APISpec, stamped with its creation time. The handle
//! is the only per-spec state mutated between reloads: requests share it,
//! and it is rebuilt when absent, when its age exceeds `max_conn_time`,
//! or when the target flips between h2c and plain HTTP. The replaced
//! transport keeps serving in-flight requests and is dropped (closing its
//! idle pool) once the last of them finishes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::apidef::ApiDefinition;
use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::registry::ApiSpec;

const IDLE_CONN_TIMEOUT: Duration = Duration::from_secs(90);

/// A cached outbound transport.
pub struct Transport {
    pub client: reqwest::Client,
    pub created: Instant,
    pub h2c: bool,
}

/// Builds and caches transports in each spec's transport slot.
pub struct TransportFactory {
    config: Arc<Config>,
}

impl TransportFactory {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Fetch the spec's transport, rebuilding it when stale.
    pub fn transport_for(&self, spec: &ApiSpec, timeout_secs: f64, h2c: bool) -> Result<Arc<Transport>> {
        {
            let slot = spec.transport.read().unwrap();
            if let Some(transport) = slot.as_ref() {
                if !self.expired(transport) && transport.h2c == h2c {
                    return Ok(transport.clone());
                }
            }
        }

        let mut slot = spec.transport.write().unwrap();
        // another request may have rebuilt it while we waited
        if let Some(transport) = slot.as_ref() {
            if !self.expired(transport) && transport.h2c == h2c {
                return Ok(transport.clone());
            }
        }

        tracing::debug!(api_id = spec.api_id(), h2c, "Creating new transport");
        let transport = Arc::new(self.build(&spec.definition, timeout_secs, h2c)?);
        *slot = Some(transport.clone());
        Ok(transport)
    }

    fn expired(&self, transport: &Transport) -> bool {
        self.config.max_conn_time != 0
            && transport.created.elapsed().as_secs() as i64 > self.config.max_conn_time
    }

    fn build(&self, definition: &ApiDefinition, timeout_secs: f64, h2c: bool) -> Result<Transport> {
        let config = &self.config;
        let timeout = if timeout_secs > 0.0 { timeout_secs } else { 30.0 };

        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs_f64(timeout))
            .pool_idle_timeout(IDLE_CONN_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .tcp_keepalive(Duration::from_secs(30));

        builder = if config.proxy_close_connections {
            builder.pool_max_idle_per_host(0)
        } else {
            builder.pool_max_idle_per_host(config.max_idle_connections_per_host)
        };

        if config.proxy_ssl_insecure_skip_verify
            || definition.proxy.transport.ssl_insecure_skip_verify
            || config.ssl_force_common_name_check
            || definition.proxy.transport.ssl_force_common_name_check
        {
            // common-name-only verification skips the hostname check; with
            // rustls that means accepting the chain and matching CN upstreamside
            builder = builder.danger_accept_invalid_certs(true);
        }

        let min_version = definition
            .proxy
            .transport
            .ssl_min_version
            .as_deref()
            .or(config.proxy_ssl_min_version.as_deref());
        if let Some(version) = min_version.and_then(tls_version) {
            builder = builder.min_tls_version(version);
        }
        let max_version = definition
            .proxy
            .transport
            .ssl_max_version
            .as_deref()
            .or(config.proxy_ssl_max_version.as_deref());
        if let Some(version) = max_version.and_then(tls_version) {
            builder = builder.max_tls_version(version);
        }

        if !definition.proxy.transport.proxy_url.is_empty() {
            let proxy = reqwest::Proxy::all(&definition.proxy.transport.proxy_url)
                .map_err(|e| GatewayError::Config(format!("Bad transport proxy URL: {}", e)))?;
            builder = builder.proxy(proxy);
        }

        if h2c {
            // cleartext HTTP/2: speak h2 without the TLS handshake
            builder = builder.http2_prior_knowledge();
        }

        let client = builder
            .build()
            .map_err(|e| GatewayError::Other(format!("Failed to build transport: {}", e)))?;

        Ok(Transport {
            client,
            created: Instant::now(),
            h2c,
        })
    }
}

fn tls_version(name: &str) -> Option<reqwest::tls::Version> {
    match name {
        "1.0" => Some(reqwest::tls::Version::TLS_1_0),
        "1.1" => Some(reqwest::tls::Version::TLS_1_1),
        "1.2" => Some(reqwest::tls::Version::TLS_1_2),
        "1.3" => Some(reqwest::tls::Version::TLS_1_3),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apidef::ProxyConfig;

    fn spec() -> ApiSpec {
        let definition = ApiDefinition {
            api_id: "t".to_string(),
            name: "t".to_string(),
            proxy: ProxyConfig {
                listen_path: "/t/".to_string(),
                target_url: "http://upstream".to_string(),
                ..ProxyConfig::default()
            },
            ..ApiDefinition::default()
        };
        ApiSpec::from_definition(definition, None).unwrap()
    }

    #[test]
    fn test_transport_cached() {
        let factory = TransportFactory::new(Arc::new(Config::default()));
        let spec = spec();

        let first = factory.transport_for(&spec, 30.0, false).unwrap();
        let second = factory.transport_for(&spec, 30.0, false).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_transport_rebuilt_on_h2c_flip() {
        let factory = TransportFactory::new(Arc::new(Config::default()));
        let spec = spec();

        let plain = factory.transport_for(&spec, 30.0, false).unwrap();
        let h2c = factory.transport_for(&spec, 30.0, true).unwrap();
        assert!(!Arc::ptr_eq(&plain, &h2c));
        assert!(h2c.h2c);
    }

    #[test]
    fn test_transport_recycled_after_max_conn_time() {
        let mut config = Config::default();
        config.max_conn_time = 30;
        let factory = TransportFactory::new(Arc::new(config));
        let spec = spec();

        let first = factory.transport_for(&spec, 30.0, false).unwrap();
        // age the cached handle past the recycle threshold
        {
            let mut slot = spec.transport.write().unwrap();
            let aged = Transport {
                client: first.client.clone(),
                created: Instant::now() - Duration::from_secs(31),
                h2c: false,
            };
            *slot = Some(Arc::new(aged));
        }
        let rebuilt = factory.transport_for(&spec, 30.0, false).unwrap();
        assert!(rebuilt.created.elapsed().as_secs() < 5);
    }

    #[test]
    fn test_bad_proxy_url_rejected() {
        let factory = TransportFactory::new(Arc::new(Config::default()));
        let mut definition = spec().definition;
        definition.proxy.transport.proxy_url = "::not a url::".to_string();
        assert!(factory.build(&definition, 30.0, false).is_err());
    }

    #[test]
    fn test_tls_version_mapping() {
        assert!(tls_version("1.2").is_some());
        assert!(tls_version("1.3").is_some());
        assert!(tls_version("9.9").is_none());
    }
}
