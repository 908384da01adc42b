//! Runtime configuration for the webhook server

use clap::Parser;

/// Command line / environment configuration
///
/// Platform-provided values (owner, namespaces, storage root) come from the
/// environment in a real install; flags exist for local runs.
#[derive(Debug, Clone, Parser)]
#[command(name = "studio-webhook", about = "Mutating admission webhook for live development")]
pub struct Settings {
    /// Address the webhook server binds to
    #[arg(long, default_value = "0.0.0.0:8443")]
    pub listen: std::net::SocketAddr,

    /// TLS certificate path (PEM)
    #[arg(long, env = "WEBHOOK_TLS_CERT", default_value = "/etc/certs/tls.crt")]
    pub tls_cert: std::path::PathBuf,

    /// TLS private key path (PEM)
    #[arg(long, env = "WEBHOOK_TLS_KEY", default_value = "/etc/certs/tls.key")]
    pub tls_key: std::path::PathBuf,

    /// CA bundle presented to the API server at webhook registration (PEM)
    #[arg(long, env = "WEBHOOK_CA_BUNDLE", default_value = "/etc/certs/ca.crt")]
    pub ca_bundle: std::path::PathBuf,

    /// User the webhook serves; scopes admission to their namespaces
    #[arg(long, env = "OWNER")]
    pub owner: String,

    /// Namespace the webhook service itself runs in
    #[arg(long, env = "NAMESPACE", default_value = "studio-system")]
    pub namespace: String,

    /// Name of the Service fronting this webhook
    #[arg(long, default_value = "studio-webhook")]
    pub service_name: String,

    /// Per-user storage root the persistent dev workspaces live under
    #[arg(long, env = "STUDIO_BASE_DIR", default_value = "/data")]
    pub base_dir: String,

    /// Base URL of the management API's registry endpoints
    ///
    /// When unset, the registry is loaded from `--registry-snapshot`.
    #[arg(long, env = "REGISTRY_URL")]
    pub registry_url: Option<String>,

    /// YAML snapshot seeding the in-memory registry (local development)
    #[arg(long)]
    pub registry_snapshot: Option<std::path::PathBuf>,

    /// Websocket relay image override
    #[arg(long, default_value = "")]
    pub ws_image: String,
}
