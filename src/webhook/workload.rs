//! Workload name mutation
//!
//! Intercepts Deployment/StatefulSet/DaemonSet admission. Workloads whose
//! Helm release maps to a registered dev app are renamed with a `-dev`
//! suffix on create, and their pod templates are stamped with the release
//! identity so the pod mutator can find the app later. Everything else
//! passes through untouched.

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::admission::{AdmissionRequest, Operation};
use kube::core::DynamicObject;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use super::{
    app_name, DEV_CONTAINERS_ANNOTATION, HELM_RELEASE_ANNOTATION,
    HELM_RELEASE_NAMESPACE_ANNOTATION,
};
use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::webhook::patch::diff_patch;

/// The capabilities the name mutator needs from a workload kind
///
/// Deployments, StatefulSets and DaemonSets only differ in fields the
/// mutator never touches; this keeps the routine single-copy.
pub trait WorkloadLike: Serialize + DeserializeOwned {
    fn metadata_mut(&mut self) -> &mut ObjectMeta;
    fn pod_template_mut(&mut self) -> Option<&mut PodTemplateSpec>;
}

impl WorkloadLike for Deployment {
    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
    fn pod_template_mut(&mut self) -> Option<&mut PodTemplateSpec> {
        self.spec.as_mut().map(|s| &mut s.template)
    }
}

impl WorkloadLike for StatefulSet {
    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
    fn pod_template_mut(&mut self) -> Option<&mut PodTemplateSpec> {
        self.spec.as_mut().map(|s| &mut s.template)
    }
}

impl WorkloadLike for DaemonSet {
    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
    fn pod_template_mut(&mut self) -> Option<&mut PodTemplateSpec> {
        self.spec.as_mut().map(|s| &mut s.template)
    }
}

/// Mutate a workload admission request, dispatching on the concrete kind
///
/// Returns `Ok(None)` when the workload is not a registered dev app's.
pub async fn mutate_workload(
    registry: &dyn Registry,
    request: &AdmissionRequest<DynamicObject>,
) -> Result<Option<json_patch::Patch>> {
    let Some(obj) = &request.object else {
        return Ok(None);
    };
    let raw = serde_json::to_value(obj)?;

    match request.kind.kind.as_str() {
        "Deployment" => mutate_name::<Deployment>(registry, &raw, request.operation.clone()).await,
        "StatefulSet" => {
            mutate_name::<StatefulSet>(registry, &raw, request.operation.clone()).await
        }
        "DaemonSet" => mutate_name::<DaemonSet>(registry, &raw, request.operation.clone()).await,
        other => {
            debug!(kind = other, "not a workload kind, allowing unchanged");
            Ok(None)
        }
    }
}

/// The shared rename-and-stamp routine behind all three workload kinds
async fn mutate_name<W: WorkloadLike>(
    registry: &dyn Registry,
    raw: &Value,
    operation: Operation,
) -> Result<Option<json_patch::Patch>> {
    let mut workload: W = serde_json::from_value(raw.clone())?;

    let meta = workload.metadata_mut();
    let annotations = meta.annotations.clone().unwrap_or_default();
    let Some(release_name) = annotations.get(HELM_RELEASE_ANNOTATION).cloned() else {
        return Ok(None);
    };
    let release_namespace = annotations
        .get(HELM_RELEASE_NAMESPACE_ANNOTATION)
        .cloned()
        .unwrap_or_default();

    let Some(app) = registry.dev_app_by_name(app_name(&release_name)).await? else {
        debug!(release = %release_name, "release has no registered dev app, allowing unchanged");
        return Ok(None);
    };

    let workload_name = meta.name.clone().ok_or_else(|| {
        Error::Internal("admitted workload has no name".to_string())
    })?;

    // A workload already named after the release needs no rename; renames
    // only happen when the object is first persisted.
    if operation == Operation::Create && workload_name != release_name {
        let dev_name = format!("{workload_name}-dev");
        info!(workload = %workload_name, renamed = %dev_name, "renaming workload for development");
        meta.name = Some(dev_name);
    }

    let bindings = registry.bindings_by_app(app.id).await?;

    if let Some(template) = workload.pod_template_mut() {
        let metadata = template.metadata.get_or_insert_with(Default::default);
        let template_annotations = metadata.annotations.get_or_insert_with(Default::default);
        template_annotations.insert(HELM_RELEASE_ANNOTATION.to_string(), release_name.clone());
        template_annotations.insert(
            HELM_RELEASE_NAMESPACE_ANNOTATION.to_string(),
            release_namespace,
        );

        if !bindings.is_empty() {
            let mut ids: Vec<i64> = bindings.iter().map(|b| b.container_id).collect();
            ids.sort_unstable();
            let ids = ids
                .iter()
                .map(i64::to_string)
                .collect::<Vec<_>>()
                .join(",");
            template_annotations.insert(DEV_CONTAINERS_ANNOTATION.to_string(), ids);
        }
    }

    diff_patch(raw, &workload)
}
