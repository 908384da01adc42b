//! studio-webhook server binary

use std::sync::Arc;

use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use kube::Client;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use studio_webhook::config::Settings;
use studio_webhook::manifest::KubeManifestSource;
use studio_webhook::proxy::sidecar::KubeConfigStore;
use studio_webhook::registry::{HttpRegistry, InMemoryRegistry, Registry, RegistrySnapshot};
use studio_webhook::webhook::{
    ensure_webhook_config, remove_webhook_config, webhook_router, WebhookState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        anyhow::bail!("failed to install crypto provider: {e:?}");
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let settings = Settings::parse();
    let client = Client::try_default().await?;

    let registry: Arc<dyn Registry> = match (&settings.registry_url, &settings.registry_snapshot) {
        (Some(url), _) => Arc::new(HttpRegistry::new(url.clone())),
        (None, Some(path)) => {
            let raw = tokio::fs::read_to_string(path).await?;
            let snapshot: RegistrySnapshot = serde_yaml::from_str(&raw)?;
            Arc::new(InMemoryRegistry::from_snapshot(snapshot))
        }
        (None, None) => {
            anyhow::bail!("either --registry-url or --registry-snapshot is required")
        }
    };

    let state = Arc::new(WebhookState {
        registry,
        manifests: Arc::new(KubeManifestSource::new(client.clone())),
        config_store: Arc::new(KubeConfigStore::new(client.clone())),
        settings: Arc::new(settings.clone()),
    });

    ensure_webhook_config(&client, &settings).await?;

    let app = webhook_router(state);
    let tls_config = RustlsConfig::from_pem_file(&settings.tls_cert, &settings.tls_key)
        .await
        .map_err(|e| anyhow::anyhow!("TLS config error: {e}"))?;

    info!(addr = %settings.listen, owner = %settings.owner, "starting webhook server");

    // On SIGINT the webhook configuration comes out before the server does;
    // a registered fail-closed webhook with no backend blocks the namespace.
    let handle = axum_server::Handle::new();
    tokio::spawn({
        let handle = handle.clone();
        let client = client.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested, removing webhook configuration");
                remove_webhook_config(&client).await;
                handle.graceful_shutdown(Some(std::time::Duration::from_secs(5)));
            }
        }
    });

    axum_server::bind_rustls(settings.listen, tls_config)
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .map_err(|e| anyhow::anyhow!("server error: {e}"))?;

    Ok(())
}
