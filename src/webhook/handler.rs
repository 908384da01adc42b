//! Admission review dispatch
//!
//! One handler serves both registered paths; routing to the right mutator
//! happens on the requested resource, exactly as the API server reports it.

use std::sync::Arc;

use axum::{extract::State, Json};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::core::DynamicObject;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::pod::{mutate_pod, PodMutationContext};
use super::workload::mutate_workload;
use super::WebhookState;

/// Handle a mutating admission review
pub async fn mutate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let request: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(request) => request,
        Err(e) => {
            error!(error = %e, "failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    Json(mutate(&state, &request).await.into_review())
}

/// Dispatch one admission request to the resource's mutator
///
/// Mutator errors deny the admission; the webhook is registered fail-closed
/// and a half-mutated pod is worse than a rejected create.
async fn mutate(
    state: &WebhookState,
    request: &AdmissionRequest<DynamicObject>,
) -> AdmissionResponse {
    let response = AdmissionResponse::from(request);

    let result = match request.resource.resource.as_str() {
        "deployments" | "statefulsets" | "daemonsets" => {
            mutate_workload(state.registry.as_ref(), request).await
        }
        "pods" => {
            let proxy_uuid = Uuid::new_v4().to_string();
            let ctx = PodMutationContext {
                registry: state.registry.as_ref(),
                manifests: state.manifests.as_ref(),
                config_store: state.config_store.as_ref(),
                base_dir: &state.settings.base_dir,
                ws_image: &state.settings.ws_image,
            };
            mutate_pod(&ctx, request, &proxy_uuid).await
        }
        other => {
            debug!(resource = other, "unhandled resource, allowing unchanged");
            Ok(None)
        }
    };

    match result {
        Ok(Some(patch)) => {
            info!(
                uid = %request.uid,
                resource = %request.resource.resource,
                name = %request.name,
                ops = patch.0.len(),
                "admitting with patch"
            );
            match response.with_patch(patch) {
                Ok(response) => response,
                Err(e) => {
                    error!(uid = %request.uid, error = %e, "failed to attach patch");
                    AdmissionResponse::from(request).deny(e.to_string())
                }
            }
        }
        Ok(None) => response,
        Err(e) => {
            error!(
                uid = %request.uid,
                resource = %request.resource.resource,
                error = %e,
                "mutation failed, denying admission"
            );
            AdmissionResponse::from(request).deny(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::error::Error;
    use crate::manifest::MockManifestSource;
    use crate::proxy::sidecar::MockProxyConfigStore;
    use crate::registry::{DevApp, InMemoryRegistry, MockRegistry};
    use clap::Parser;
    use serde_json::{json, Value};

    fn settings() -> Settings {
        Settings::parse_from(["studio-webhook", "--owner", "alice"])
    }

    fn state_with_registry(registry: impl crate::registry::Registry + 'static) -> WebhookState {
        WebhookState {
            registry: Arc::new(registry),
            manifests: Arc::new(MockManifestSource::new()),
            config_store: Arc::new(MockProxyConfigStore::new()),
            settings: Arc::new(settings()),
        }
    }

    fn request(resource: &str, kind: &str, group: &str, obj: Value) -> AdmissionRequest<DynamicObject> {
        let review = json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "c3c4d9e2-0000-0000-0000-42010a800002",
                "kind": {"group": group, "version": "v1", "kind": kind},
                "resource": {"group": group, "version": "v1", "resource": resource},
                "name": obj["metadata"]["name"],
                "namespace": "demo-dev-alice",
                "operation": "CREATE",
                "userInfo": {},
                "object": obj,
                "dryRun": false
            }
        });
        let review: AdmissionReview<DynamicObject> = serde_json::from_value(review).unwrap();
        review.try_into().unwrap()
    }

    fn deployment() -> Value {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": "demo",
                "annotations": {"meta.helm.sh/release-name": "demo-dev"}
            },
            "spec": {
                "selector": {"matchLabels": {"app": "demo"}},
                "template": {"metadata": {}, "spec": {"containers": []}}
            }
        })
    }

    #[tokio::test]
    async fn unknown_resource_allows_unchanged() {
        let state = state_with_registry(InMemoryRegistry::new());
        let req = request("services", "Service", "", json!({"metadata": {"name": "svc"}}));
        let response = mutate(&state, &req).await;
        assert!(response.allowed);
        assert!(response.patch.is_none());
    }

    #[tokio::test]
    async fn workload_dispatch_produces_patch() {
        let reg = InMemoryRegistry::new();
        reg.add_app(DevApp {
            id: 1,
            app_name: "demo".into(),
            owner: "alice".into(),
            dev_env: "Golang".into(),
            state: "active".into(),
        });
        let state = state_with_registry(reg);
        let response = mutate(&state, &request("deployments", "Deployment", "apps", deployment())).await;
        assert!(response.allowed);
        assert!(response.patch.is_some());
    }

    #[tokio::test]
    async fn registry_failure_denies() {
        let mut reg = MockRegistry::new();
        reg.expect_dev_app_by_name()
            .returning(|_| Err(Error::Registry("down".into())));
        let state = state_with_registry(reg);
        let response = mutate(&state, &request("deployments", "Deployment", "apps", deployment())).await;
        assert!(!response.allowed);
    }

    #[tokio::test]
    async fn pod_without_release_annotation_allows_unchanged() {
        let state = state_with_registry(InMemoryRegistry::new());
        let pod = json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "p"},
            "spec": {"containers": [{"name": "web", "image": "demo/web:1.0"}]}
        });
        let response = mutate(&state, &request("pods", "Pod", "", pod)).await;
        assert!(response.allowed);
        assert!(response.patch.is_none());
    }
}
