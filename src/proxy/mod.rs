//! Envoy sidecar: bootstrap generation and pod injection
//!
//! Every mutated pod gets one Envoy proxy in front of its dev containers.
//! [`config`] builds the per-pod bootstrap document, [`sidecar`] publishes it
//! and splices the proxy (plus init and optional websocket containers) into
//! the pod spec.

pub mod config;
pub mod sidecar;

/// Annotation carrying the proxy instance id, a fresh UUID per injection
pub const PROXY_UUID_ANNOTATION: &str = "sidecar.studio.dev/proxy-uuid";

/// Name prefix of the per-pod ConfigMap and of its pod volume
pub const SIDECAR_CONFIG_VOLUME: &str = "studio-sidecar-config";
/// Init container programming the iptables redirect rules
pub const SIDECAR_INIT_CONTAINER: &str = "studio-sidecar-init";
/// The Envoy proxy container
pub const ENVOY_CONTAINER: &str = "studio-envoy-sidecar";
/// The websocket relay container
pub const WS_CONTAINER: &str = "studio-ws-sidecar";

/// Image of the iptables init container
pub const INIT_IMAGE: &str = "studio/sidecar-init:v1.2.3";
/// Image of the Envoy sidecar
pub const ENVOY_IMAGE: &str = "studio/envoy:v1.25.11";
/// Default websocket relay image; prefix doubles as the injected-relay marker
pub const DEFAULT_WS_IMAGE: &str = "studio/ws-gateway:v1.0.3";
/// Image prefix identifying an injected websocket relay
pub const WS_IMAGE_PREFIX: &str = "studio/ws-gateway";

/// Envoy admin port, exempt from inbound redirection
pub const ENVOY_ADMIN_PORT: u16 = 15000;
/// Inbound listener all pod traffic is redirected to
pub const ENVOY_INBOUND_PORT: u16 = 15003;
/// Name of the inbound listener container port
pub const ENVOY_INBOUND_PORT_NAME: &str = "proxy-inbound";
/// Liveness probe port of the Envoy container
pub const ENVOY_LIVENESS_PORT: u16 = 15008;
/// UID the Envoy container runs as
pub const ENVOY_UID: i64 = 1000;
/// Envoy log level passed on the command line
pub const ENVOY_LOG_LEVEL: &str = "debug";
/// Directory the bootstrap is mounted into
pub const ENVOY_CONFIG_DIR: &str = "/etc/envoy";
/// File name of the bootstrap inside the ConfigMap and the container
pub const ENVOY_CONFIG_FILE: &str = "envoy.yaml";

/// Local port of the websocket relay the `ws_gateway` cluster targets
pub const WS_RELAY_PORT: u16 = 40010;

/// First dev port allocated per pod; also the reserved in-container default
/// that never gets a host-regex route
pub const DEV_PORT_BASE: u16 = 5000;

/// Where one dev container can be reached inside the pod
///
/// Computed per admission request and consumed immediately by the config
/// builder; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevContainerEndpoint {
    /// Always local loopback; the editor binds in-pod
    pub host: String,
    /// Allocated dev port
    pub port: u16,
    /// Logical name, the mutated container's name
    pub name: String,
    /// URL path prefix routed to this endpoint
    pub path: String,
}

impl DevContainerEndpoint {
    /// Endpoint for a mutated container on `port`
    pub fn local(name: impl Into<String>, port: u16) -> Self {
        Self {
            host: "localhost".to_string(),
            port,
            name: name.into(),
            path: format!("/proxy/{port}/"),
        }
    }
}
