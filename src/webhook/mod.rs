//! Mutating admission webhook for live development
//!
//! Two endpoints: workload mutation (rename + pod-template stamping) and pod
//! mutation (dev-image swap + sidecar injection). Both produce RFC 6902
//! patches; anything the registry does not know about passes through
//! unchanged.

pub mod handler;
pub mod patch;
pub mod pod;
pub mod workload;

use std::sync::Arc;

use axum::{routing::post, Router};
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhook, MutatingWebhookConfiguration, RuleWithOperations, ServiceReference,
    WebhookClientConfig,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use tracing::{info, warn};

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::manifest::ManifestSource;
use crate::proxy::sidecar::ProxyConfigStore;
use crate::registry::Registry;

/// Release-name annotation the deployment tool stamps on workloads
pub const HELM_RELEASE_ANNOTATION: &str = "meta.helm.sh/release-name";
/// Release-namespace annotation the deployment tool stamps on workloads
pub const HELM_RELEASE_NAMESPACE_ANNOTATION: &str = "meta.helm.sh/release-namespace";
/// Sorted, comma-joined bound-container ids, stamped on pod templates
pub const DEV_CONTAINERS_ANNOTATION: &str = "dev.studio.dev/containers";
/// Namespace label marking a user's dev namespaces
pub const DEV_OWNER_LABEL: &str = "dev.studio.dev/owner";
/// Proxy-instance id annotation; re-exported from the proxy module
pub use crate::proxy::PROXY_UUID_ANNOTATION;

/// Name of the installed MutatingWebhookConfiguration
const WEBHOOK_CONFIG_NAME: &str = "studio-mutate-webhooks";
/// Field manager for server-side apply
const FIELD_MANAGER: &str = "studio-webhook";

/// Derive the registered app name from a Helm release name
pub fn app_name(release_name: &str) -> &str {
    release_name.strip_suffix("-dev").unwrap_or(release_name)
}

/// Shared state for the admission handlers
#[derive(Clone)]
pub struct WebhookState {
    /// Dev-app registry (read only)
    pub registry: Arc<dyn Registry>,
    /// Application manifest lookup
    pub manifests: Arc<dyn ManifestSource>,
    /// Where generated proxy bootstraps are published
    pub config_store: Arc<dyn ProxyConfigStore>,
    /// Runtime configuration
    pub settings: Arc<Settings>,
}

/// Create the webhook router with both mutation endpoints
pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/webhook/workloads", post(handler::mutate_handler))
        .route("/webhook/pods", post(handler::mutate_handler))
        .with_state(state)
}

fn mutating_webhook(
    name: &str,
    path: &str,
    api_groups: &[&str],
    resources: &[&str],
    settings: &Settings,
    ca_bundle: Vec<u8>,
) -> MutatingWebhook {
    MutatingWebhook {
        name: name.to_string(),
        admission_review_versions: vec!["v1".to_string()],
        side_effects: "NoneOnDryRun".to_string(),
        failure_policy: Some("Fail".to_string()),
        match_policy: Some("Exact".to_string()),
        timeout_seconds: Some(30),
        rules: Some(vec![RuleWithOperations {
            operations: Some(vec!["CREATE".to_string(), "UPDATE".to_string()]),
            api_groups: Some(api_groups.iter().map(|s| s.to_string()).collect()),
            api_versions: Some(vec!["v1".to_string()]),
            resources: Some(resources.iter().map(|s| s.to_string()).collect()),
            scope: Some("Namespaced".to_string()),
        }]),
        client_config: WebhookClientConfig {
            service: Some(ServiceReference {
                name: settings.service_name.clone(),
                namespace: settings.namespace.clone(),
                path: Some(path.to_string()),
                port: Some(443),
            }),
            ca_bundle: Some(k8s_openapi::ByteString(ca_bundle)),
            ..Default::default()
        },
        // only this user's dev namespaces are intercepted
        namespace_selector: Some(LabelSelector {
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: DEV_OWNER_LABEL.to_string(),
                operator: "In".to_string(),
                values: Some(vec![settings.owner.clone()]),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Install (or update) the MutatingWebhookConfiguration for both endpoints
pub async fn ensure_webhook_config(client: &Client, settings: &Settings) -> Result<()> {
    let ca_bundle = tokio::fs::read(&settings.ca_bundle)
        .await
        .map_err(|e| Error::Config(format!("reading CA bundle: {e}")))?;

    let config = MutatingWebhookConfiguration {
        metadata: kube::api::ObjectMeta {
            name: Some(WEBHOOK_CONFIG_NAME.to_string()),
            ..Default::default()
        },
        webhooks: Some(vec![
            mutating_webhook(
                "workloads.studio.dev",
                "/webhook/workloads",
                &["apps"],
                &["deployments", "statefulsets", "daemonsets"],
                settings,
                ca_bundle.clone(),
            ),
            mutating_webhook(
                "pods.studio.dev",
                "/webhook/pods",
                &[""],
                &["pods"],
                settings,
                ca_bundle,
            ),
        ]),
    };

    let api: Api<MutatingWebhookConfiguration> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();
    api.patch(WEBHOOK_CONFIG_NAME, &params, &Patch::Apply(&config))
        .await?;

    info!(name = WEBHOOK_CONFIG_NAME, "webhook configuration installed");
    Ok(())
}

/// Best-effort removal of the webhook configuration on shutdown
pub async fn remove_webhook_config(client: &Client) {
    let api: Api<MutatingWebhookConfiguration> = Api::all(client.clone());
    if let Err(e) = api
        .delete(WEBHOOK_CONFIG_NAME, &kube::api::DeleteParams::default())
        .await
    {
        warn!(error = %e, "failed to remove webhook configuration");
    }
}
