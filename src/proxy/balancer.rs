//! Upstream target selection
//!
//! Round-robin over a host list with health-probe filtering. When the
//! picked host is reported down the cursor advances through the rest of
//! the list from where it started; if every host is down the caller gets
//! an error that surfaces as 503.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::apidef::{ensure_transport, HostList};
use crate::error::{GatewayError, Result};
use crate::registry::ApiSpec;

/// Tracks hosts reported down by the health probes, with automatic
/// recovery after the report expires.
#[derive(Default)]
pub struct HostHealth {
    down: RwLock<HashMap<String, Instant>>,
}

impl HostHealth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report a host down for the given duration.
    pub fn report_down(&self, host: &str, for_duration: Duration) {
        self.down
            .write()
            .unwrap()
            .insert(host.to_string(), Instant::now() + for_duration);
        tracing::warn!(host, "Host reported down");
    }

    pub fn report_up(&self, host: &str) {
        self.down.write().unwrap().remove(host);
    }

    pub fn host_down(&self, host: &str) -> bool {
        match self.down.read().unwrap().get(host) {
            Some(until) => Instant::now() < *until,
            None => false,
        }
    }
}

/// Pick the next upstream for a spec from the given host list.
///
/// Load-balancing specs walk the list round-robin, skipping probed-down
/// hosts when uptime checks are enabled. Non-balancing specs take the
/// first entry.
pub fn next_target(host_list: &HostList, spec: &ApiSpec, health: &HostHealth) -> Result<String> {
    let protocol = &spec.definition.protocol;

    if spec.definition.proxy.enable_load_balancing {
        if host_list.is_empty() {
            return Err(GatewayError::UpstreamUnreachable(
                "empty upstream host list".to_string(),
            ));
        }
        let start = spec.round_robin.with_len(host_list.len());
        let mut pos = start;
        loop {
            let host = ensure_transport(host_list.get_index(pos)?, protocol);
            if !spec.definition.proxy.check_host_against_uptime_tests {
                return Ok(host);
            }
            if !health.host_down(&host) {
                return Ok(host);
            }
            pos = (pos + 1) % host_list.len();
            if pos == start {
                return Err(GatewayError::UpstreamUnreachable(
                    "all hosts are down, uptime tests are failing".to_string(),
                ));
            }
        }
    }

    let host = host_list.get_index(0)?;
    Ok(ensure_transport(host, protocol))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apidef::{ApiDefinition, ProxyConfig};
    use crate::registry::ApiSpec;

    fn lb_spec(check_uptime: bool) -> ApiSpec {
        let definition = ApiDefinition {
            api_id: "lb".to_string(),
            name: "lb".to_string(),
            proxy: ProxyConfig {
                listen_path: "/lb/".to_string(),
                enable_load_balancing: true,
                check_host_against_uptime_tests: check_uptime,
                ..ProxyConfig::default()
            },
            ..ApiDefinition::default()
        };
        ApiSpec::from_definition(definition, None).unwrap()
    }

    fn hosts(list: &[&str]) -> HostList {
        HostList::from(list.iter().map(|s| s.to_string()).collect())
    }

    // --- Round robin ---

    #[test]
    fn test_round_robin_cycles() {
        let spec = lb_spec(false);
        let health = HostHealth::new();
        let list = hosts(&["a:80", "b:80", "c:80"]);

        let picked: Vec<String> = (0..6)
            .map(|_| next_target(&list, &spec, &health).unwrap())
            .collect();
        assert_eq!(picked[0], "http://a:80");
        assert_eq!(picked[1], "http://b:80");
        assert_eq!(picked[2], "http://c:80");
        assert_eq!(picked[3], "http://a:80");
    }

    #[test]
    fn test_skips_down_hosts() {
        let spec = lb_spec(true);
        let health = HostHealth::new();
        health.report_down("http://a:80", Duration::from_secs(60));
        let list = hosts(&["a:80", "b:80"]);

        for _ in 0..4 {
            let host = next_target(&list, &spec, &health).unwrap();
            assert_eq!(host, "http://b:80");
        }
    }

    #[test]
    fn test_all_hosts_down() {
        let spec = lb_spec(true);
        let health = HostHealth::new();
        health.report_down("http://a:80", Duration::from_secs(60));
        health.report_down("http://b:80", Duration::from_secs(60));
        let list = hosts(&["a:80", "b:80"]);

        let err = next_target(&list, &spec, &health).unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamUnreachable(_)));
        assert!(err.to_string().contains("all hosts are down"));
    }

    #[test]
    fn test_down_report_expires() {
        let health = HostHealth::new();
        health.report_down("http://a:80", Duration::from_secs(60));
        assert!(health.host_down("http://a:80"));
        // expire by rewriting the deadline
        health
            .down
            .write()
            .unwrap()
            .insert("http://a:80".to_string(), Instant::now() - Duration::from_secs(1));
        assert!(!health.host_down("http://a:80"));

        health.report_down("http://a:80", Duration::from_secs(60));
        health.report_up("http://a:80");
        assert!(!health.host_down("http://a:80"));
    }

    // --- Non-balancing path ---

    #[test]
    fn test_single_target_first_entry() {
        let mut definition = lb_spec(false).definition;
        definition.proxy.enable_load_balancing = false;
        let spec = ApiSpec::from_definition(definition, None).unwrap();
        let health = HostHealth::new();
        let list = hosts(&["a:80", "b:80"]);

        for _ in 0..3 {
            assert_eq!(next_target(&list, &spec, &health).unwrap(), "http://a:80");
        }
    }

    #[test]
    fn test_empty_list_errors() {
        let spec = lb_spec(false);
        let health = HostHealth::new();
        assert!(next_target(&HostList::new(), &spec, &health).is_err());
    }

    #[test]
    fn test_protocol_applied() {
        let mut definition = lb_spec(false).definition;
        definition.protocol = "https".to_string();
        definition.proxy.enable_load_balancing = false;
        let spec = ApiSpec::from_definition(definition, None).unwrap();
        let health = HostHealth::new();
        assert_eq!(
            next_target(&hosts(&["a:443"]), &spec, &health).unwrap(),
            "https://a:443"
        );
    }
}
