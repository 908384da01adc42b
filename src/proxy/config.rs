//! Envoy bootstrap generation
//!
//! One bootstrap document per injected pod: a single inbound listener that
//! recovers the original destination, routes editor traffic to the dev
//! containers by virtual host or path prefix, authenticates every request
//! through the platform auth backend, and hands everything else back to its
//! original destination.
//!
//! The document is YAML with Envoy's snake_case field names; the serde
//! structs below are declared in that casing so serialization is already
//! canonical.

use serde::Serialize;
use serde_json::{json, Value};

use super::{DevContainerEndpoint, DEV_PORT_BASE, ENVOY_INBOUND_PORT, WS_RELAY_PORT};
use crate::error::Result;

const ORIGINAL_DST_LISTENER_FILTER_TYPE: &str =
    "type.googleapis.com/envoy.extensions.filters.listener.original_dst.v3.OriginalDst";
const HCM_TYPE: &str =
    "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager";
const ROUTER_TYPE: &str = "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router";
const EXT_AUTHZ_TYPE: &str =
    "type.googleapis.com/envoy.extensions.filters.http.ext_authz.v3.ExtAuthz";

/// Cluster that returns traffic to its original destination
const ORIGINAL_DST_CLUSTER: &str = "original_dst";
/// Cluster of the platform auth backend
const AUTH_CLUSTER: &str = "authelia";
/// Cluster of the in-pod websocket relay
const WS_CLUSTER: &str = "ws_gateway";

/// Builds the per-pod Envoy bootstrap
///
/// ```
/// use studio_webhook::proxy::config::ProxyConfigBuilder;
/// use studio_webhook::proxy::DevContainerEndpoint;
///
/// let yaml = ProxyConfigBuilder::new("alice")
///     .with_endpoints(vec![DevContainerEndpoint::local("web", 5000)])
///     .build()
///     .unwrap();
/// assert!(yaml.contains("devcontainer_proxy"));
/// ```
#[derive(Debug, Default)]
pub struct ProxyConfigBuilder {
    owner: String,
    endpoints: Vec<DevContainerEndpoint>,
    websocket: bool,
}

impl ProxyConfigBuilder {
    /// Start a builder for the app owner's auth domain
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            ..Default::default()
        }
    }

    /// Set the dev container endpoints to route to
    pub fn with_endpoints(mut self, endpoints: Vec<DevContainerEndpoint>) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// Also emit the websocket relay cluster
    pub fn with_websocket(mut self) -> Self {
        self.websocket = true;
        self
    }

    /// Whether the websocket relay cluster is enabled
    pub fn websocket(&self) -> bool {
        self.websocket
    }

    /// Serialize the bootstrap to YAML
    pub fn build(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.bootstrap())?)
    }

    fn bootstrap(&self) -> Bootstrap {
        Bootstrap {
            static_resources: StaticResources {
                listeners: vec![self.listener()],
                clusters: self.clusters(),
            },
        }
    }

    fn listener(&self) -> Listener {
        Listener {
            name: "devcontainer_proxy".to_string(),
            address: Address::socket("0.0.0.0", u32::from(ENVOY_INBOUND_PORT)),
            listener_filters: vec![ListenerFilter {
                name: "envoy.filters.listener.original_dst".to_string(),
                typed_config: json!({ "@type": ORIGINAL_DST_LISTENER_FILTER_TYPE }),
            }],
            filter_chains: vec![FilterChain {
                filters: vec![Filter {
                    name: "envoy.filters.network.http_connection_manager".to_string(),
                    typed_config: HttpConnectionManager {
                        type_url: HCM_TYPE,
                        stat_prefix: "dev-container".to_string(),
                        upgrade_configs: vec![UpgradeConfig {
                            upgrade_type: "websocket".to_string(),
                        }],
                        skip_xff_append: false,
                        codec_type: "AUTO".to_string(),
                        route_config: RouteConfiguration {
                            name: "local_route".to_string(),
                            virtual_hosts: vec![VirtualHost {
                                name: "service".to_string(),
                                domains: vec!["*".to_string()],
                                routes: self.routes(),
                            }],
                        },
                        http_filters: vec![
                            external_auth_filter(&self.owner),
                            HttpFilter {
                                name: "envoy.filters.http.router".to_string(),
                                typed_config: json!({ "@type": ROUTER_TYPE }),
                            },
                        ],
                        http_protocol_options: HttpProtocolOptions { accept_http_10: true },
                    },
                }],
            }],
        }
    }

    /// Route order matters: virtual-host matches first, then path prefixes,
    /// then the catch-all back to the original destination.
    fn routes(&self) -> Vec<Route> {
        let mut routes = Vec::new();

        for ep in &self.endpoints {
            // The reserved in-container default port has no virtual host of
            // its own; it is reachable through the path prefix only.
            if ep.port == DEV_PORT_BASE {
                continue;
            }
            routes.push(Route {
                r#match: RouteMatch {
                    prefix: "/".to_string(),
                    headers: Some(vec![HeaderMatcher {
                        name: ":authority".to_string(),
                        safe_regex_match: SafeRegexMatcher {
                            google_re2: json!({}),
                            regex: format!("^[^.]+-{}\\.[^.]+\\..*$", ep.port),
                        },
                    }]),
                },
                route: RouteAction::to_cluster(&ep.name),
            });
        }

        for ep in &self.endpoints {
            routes.push(Route {
                r#match: RouteMatch {
                    prefix: ep.path.clone(),
                    headers: None,
                },
                route: RouteAction::to_cluster(&ep.name),
            });
        }

        routes.push(Route {
            r#match: RouteMatch {
                prefix: "/".to_string(),
                headers: None,
            },
            route: RouteAction::to_cluster(ORIGINAL_DST_CLUSTER),
        });

        routes
    }

    fn clusters(&self) -> Vec<Cluster> {
        let mut clusters = vec![
            Cluster {
                name: ORIGINAL_DST_CLUSTER.to_string(),
                r#type: "ORIGINAL_DST".to_string(),
                connect_timeout: "5s".to_string(),
                dns_refresh_rate: None,
                dns_lookup_family: None,
                lb_policy: "CLUSTER_PROVIDED".to_string(),
                load_assignment: None,
            },
            Cluster {
                name: AUTH_CLUSTER.to_string(),
                r#type: "LOGICAL_DNS".to_string(),
                connect_timeout: "1s".to_string(),
                dns_refresh_rate: Some("600s".to_string()),
                dns_lookup_family: Some("V4_ONLY".to_string()),
                lb_policy: "ROUND_ROBIN".to_string(),
                load_assignment: Some(LoadAssignment::single(
                    AUTH_CLUSTER,
                    &auth_backend_host(&self.owner),
                    9091,
                )),
            },
        ];

        if self.websocket {
            clusters.push(Cluster {
                name: WS_CLUSTER.to_string(),
                r#type: "LOGICAL_DNS".to_string(),
                connect_timeout: "5s".to_string(),
                dns_refresh_rate: Some("600s".to_string()),
                dns_lookup_family: Some("V4_ONLY".to_string()),
                lb_policy: "ROUND_ROBIN".to_string(),
                load_assignment: Some(LoadAssignment::single(
                    WS_CLUSTER,
                    "localhost",
                    u32::from(WS_RELAY_PORT),
                )),
            });
        }

        for ep in &self.endpoints {
            clusters.push(Cluster {
                name: ep.name.clone(),
                r#type: "LOGICAL_DNS".to_string(),
                connect_timeout: "5s".to_string(),
                dns_refresh_rate: Some("600s".to_string()),
                dns_lookup_family: Some("V4_ONLY".to_string()),
                lb_policy: "ROUND_ROBIN".to_string(),
                load_assignment: Some(LoadAssignment::single(
                    &ep.name,
                    &ep.host,
                    u32::from(ep.port),
                )),
            });
        }

        clusters
    }
}

fn auth_backend_host(owner: &str) -> String {
    format!("authelia-backend.user-system-{owner}")
}

/// The ext_authz filter fronting every route
///
/// Request headers are forwarded on a fixed allow-list; the backend may set
/// `authorization`-style headers upstream and `set-cookie` downstream.
/// Auth failures close the request (`failure_mode_allow: false`).
fn external_auth_filter(owner: &str) -> HttpFilter {
    let exact = |v: &str| json!({ "exact": v });
    let prefix = |v: &str| json!({ "prefix": v });

    HttpFilter {
        name: "envoy.filters.http.ext_authz".to_string(),
        typed_config: json!({
            "@type": EXT_AUTHZ_TYPE,
            "http_service": {
                "path_prefix": "/api/verify/",
                "server_uri": {
                    "uri": format!("{}:9091", auth_backend_host(owner)),
                    "cluster": AUTH_CLUSTER,
                    "timeout": "0.250s",
                },
                "authorization_request": {
                    "allowed_headers": {
                        "patterns": [
                            exact("accept"),
                            exact("cookie"),
                            exact("proxy-authorization"),
                            prefix("x-unauth-"),
                            exact("x-authorization"),
                            exact("x-studio-user"),
                            exact("studio-nonce"),
                        ],
                    },
                    "headers_to_add": [
                        { "key": "X-Forwarded-Method", "value": "%REQ(:METHOD)%" },
                        { "key": "X-Forwarded-Proto", "value": "%REQ(:SCHEME)%" },
                        { "key": "X-Forwarded-Host", "value": "%REQ(:AUTHORITY)%" },
                        { "key": "X-Forwarded-Uri", "value": "%REQ(:PATH)%" },
                        { "key": "X-Forwarded-For", "value": "%DOWNSTREAM_REMOTE_ADDRESS_WITHOUT_PORT%" },
                    ],
                },
                "authorization_response": {
                    "allowed_upstream_headers": {
                        "patterns": [
                            exact("authorization"),
                            exact("proxy-authorization"),
                            prefix("remote-"),
                            prefix("authelia-"),
                        ],
                    },
                    "allowed_client_headers": {
                        "patterns": [exact("set-cookie")],
                    },
                },
            },
            "failure_mode_allow": false,
        }),
    }
}

#[derive(Debug, Serialize)]
struct Bootstrap {
    static_resources: StaticResources,
}

#[derive(Debug, Serialize)]
struct StaticResources {
    listeners: Vec<Listener>,
    clusters: Vec<Cluster>,
}

#[derive(Debug, Serialize)]
struct Listener {
    name: String,
    address: Address,
    listener_filters: Vec<ListenerFilter>,
    filter_chains: Vec<FilterChain>,
}

#[derive(Debug, Serialize)]
struct Address {
    socket_address: SocketAddress,
}

impl Address {
    fn socket(address: &str, port_value: u32) -> Self {
        Self {
            socket_address: SocketAddress {
                address: address.to_string(),
                port_value,
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct SocketAddress {
    address: String,
    port_value: u32,
}

#[derive(Debug, Serialize)]
struct ListenerFilter {
    name: String,
    typed_config: Value,
}

#[derive(Debug, Serialize)]
struct FilterChain {
    filters: Vec<Filter>,
}

#[derive(Debug, Serialize)]
struct Filter {
    name: String,
    typed_config: HttpConnectionManager,
}

#[derive(Debug, Serialize)]
struct HttpConnectionManager {
    #[serde(rename = "@type")]
    type_url: &'static str,
    stat_prefix: String,
    upgrade_configs: Vec<UpgradeConfig>,
    skip_xff_append: bool,
    codec_type: String,
    route_config: RouteConfiguration,
    http_filters: Vec<HttpFilter>,
    http_protocol_options: HttpProtocolOptions,
}

#[derive(Debug, Serialize)]
struct UpgradeConfig {
    upgrade_type: String,
}

#[derive(Debug, Serialize)]
struct HttpProtocolOptions {
    accept_http_10: bool,
}

#[derive(Debug, Serialize)]
struct RouteConfiguration {
    name: String,
    virtual_hosts: Vec<VirtualHost>,
}

#[derive(Debug, Serialize)]
struct VirtualHost {
    name: String,
    domains: Vec<String>,
    routes: Vec<Route>,
}

#[derive(Debug, Serialize)]
struct Route {
    r#match: RouteMatch,
    route: RouteAction,
}

#[derive(Debug, Serialize)]
struct RouteMatch {
    prefix: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    headers: Option<Vec<HeaderMatcher>>,
}

#[derive(Debug, Serialize)]
struct HeaderMatcher {
    name: String,
    safe_regex_match: SafeRegexMatcher,
}

#[derive(Debug, Serialize)]
struct SafeRegexMatcher {
    google_re2: Value,
    regex: String,
}

#[derive(Debug, Serialize)]
struct RouteAction {
    cluster: String,
    timeout: String,
}

impl RouteAction {
    /// Dev workloads can be slow to first byte; tolerate 300s.
    fn to_cluster(cluster: &str) -> Self {
        Self {
            cluster: cluster.to_string(),
            timeout: "300s".to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct HttpFilter {
    name: String,
    typed_config: Value,
}

#[derive(Debug, Serialize)]
struct Cluster {
    name: String,
    r#type: String,
    connect_timeout: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    dns_refresh_rate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dns_lookup_family: Option<String>,
    lb_policy: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    load_assignment: Option<LoadAssignment>,
}

#[derive(Debug, Serialize)]
struct LoadAssignment {
    cluster_name: String,
    endpoints: Vec<LocalityLbEndpoints>,
}

impl LoadAssignment {
    fn single(cluster: &str, host: &str, port: u32) -> Self {
        Self {
            cluster_name: cluster.to_string(),
            endpoints: vec![LocalityLbEndpoints {
                lb_endpoints: vec![LbEndpoint {
                    endpoint: Endpoint {
                        address: Address::socket(host, port),
                    },
                }],
            }],
        }
    }
}

#[derive(Debug, Serialize)]
struct LocalityLbEndpoints {
    lb_endpoints: Vec<LbEndpoint>,
}

#[derive(Debug, Serialize)]
struct LbEndpoint {
    endpoint: Endpoint,
}

#[derive(Debug, Serialize)]
struct Endpoint {
    address: Address,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints(ports: &[u16]) -> Vec<DevContainerEndpoint> {
        ports
            .iter()
            .enumerate()
            .map(|(i, &port)| DevContainerEndpoint::local(format!("dev{i}"), port))
            .collect()
    }

    #[test]
    fn one_cluster_per_endpoint_plus_fixed_clusters() {
        let bootstrap = ProxyConfigBuilder::new("alice")
            .with_endpoints(endpoints(&[5000, 5001]))
            .bootstrap();
        let clusters = &bootstrap.static_resources.clusters;

        // original_dst + authelia + one per endpoint
        assert_eq!(clusters.len(), 4);
        let names: Vec<_> = clusters.iter().map(|c| c.name.as_str()).collect();
        assert!(names.contains(&"original_dst"));
        assert!(names.contains(&"authelia"));
        assert!(names.contains(&"dev0"));
        assert!(names.contains(&"dev1"));
    }

    #[test]
    fn websocket_adds_relay_cluster() {
        let bootstrap = ProxyConfigBuilder::new("alice")
            .with_endpoints(endpoints(&[5000]))
            .with_websocket()
            .bootstrap();
        let ws = bootstrap
            .static_resources
            .clusters
            .iter()
            .find(|c| c.name == "ws_gateway")
            .expect("ws_gateway cluster");
        let endpoint =
            &ws.load_assignment.as_ref().unwrap().endpoints[0].lb_endpoints[0].endpoint;
        assert_eq!(endpoint.address.socket_address.port_value, 40010);
    }

    #[test]
    fn reserved_default_port_gets_no_host_regex_route() {
        let bootstrap = ProxyConfigBuilder::new("alice")
            .with_endpoints(endpoints(&[5000, 5001]))
            .bootstrap();
        let routes = &bootstrap.static_resources.listeners[0].filter_chains[0].filters[0]
            .typed_config
            .route_config
            .virtual_hosts[0]
            .routes;

        // one host-regex route (5001 only), two path routes, one catch-all
        assert_eq!(routes.len(), 4);
        let regex_routes: Vec<_> = routes.iter().filter(|r| r.r#match.headers.is_some()).collect();
        assert_eq!(regex_routes.len(), 1);
        assert_eq!(
            regex_routes[0].r#match.headers.as_ref().unwrap()[0]
                .safe_regex_match
                .regex,
            "^[^.]+-5001\\.[^.]+\\..*$"
        );

        // every endpoint has a path-prefix route
        assert!(routes.iter().any(|r| r.r#match.prefix == "/proxy/5000/"));
        assert!(routes.iter().any(|r| r.r#match.prefix == "/proxy/5001/"));

        // the catch-all is last and returns to the original destination
        let last = routes.last().unwrap();
        assert_eq!(last.r#match.prefix, "/");
        assert!(last.r#match.headers.is_none());
        assert_eq!(last.route.cluster, "original_dst");
    }

    #[test]
    fn route_timeouts_tolerate_slow_dev_workloads() {
        let bootstrap = ProxyConfigBuilder::new("alice")
            .with_endpoints(endpoints(&[5000]))
            .bootstrap();
        let routes = &bootstrap.static_resources.listeners[0].filter_chains[0].filters[0]
            .typed_config
            .route_config
            .virtual_hosts[0]
            .routes;
        assert!(routes.iter().all(|r| r.route.timeout == "300s"));
    }

    #[test]
    fn yaml_uses_envoy_casing_and_auth_domain() {
        let yaml = ProxyConfigBuilder::new("alice")
            .with_endpoints(endpoints(&[5000]))
            .build()
            .unwrap();
        assert!(yaml.contains("static_resources:"));
        assert!(yaml.contains("port_value: 15003"));
        assert!(yaml.contains("stat_prefix: dev-container"));
        assert!(yaml.contains("google_re2") || !yaml.contains("safe_regex_match"));
        assert!(yaml.contains("authelia-backend.user-system-alice"));
        assert!(yaml.contains("path_prefix: /api/verify/"));
        assert!(yaml.contains("failure_mode_allow: false"));
    }

    #[test]
    fn build_is_deterministic() {
        let build = || {
            ProxyConfigBuilder::new("alice")
                .with_endpoints(endpoints(&[5000, 5001, 5002]))
                .with_websocket()
                .build()
                .unwrap()
        };
        assert_eq!(build(), build());
    }
}
