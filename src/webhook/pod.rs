//! Pod container mutation
//!
//! The second half of the admission pipeline: pods created by a mutated
//! workload get their bound containers swapped for dev-environment images
//! running code-server, persistent per-container workspaces, and the proxy
//! sidecar routing editor traffic to each container's allocated port.

use k8s_openapi::api::core::v1::{
    Container, EnvVar, HostPathVolumeSource, Pod, Volume, VolumeMount,
};
use kube::core::admission::AdmissionRequest;
use kube::core::DynamicObject;
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::{app_name, HELM_RELEASE_ANNOTATION, PROXY_UUID_ANNOTATION};
use crate::error::{Error, Result};
use crate::manifest::ManifestSource;
use crate::proxy::sidecar::{inject_sidecar, ProxyConfigStore};
use crate::proxy::{DevContainerEndpoint, DEV_PORT_BASE};
use crate::registry::{dev_env_image, DevAppContainerBinding, Registry};
use crate::selector::{parse_selector, SelectorExt};
use crate::webhook::patch::diff_patch;

/// Name of the env var tracking the bound dev-container id
pub const DEV_CONTAINER_ENV: &str = "DEV_CONTAINER";
/// Name of the env var tracking the allocated editor port
pub const DEV_CONTAINER_PORT_ENV: &str = "DEV_CONTAINER_PORT";

/// Dependencies and configuration of one pod mutation
pub struct PodMutationContext<'a> {
    pub registry: &'a dyn Registry,
    pub manifests: &'a dyn ManifestSource,
    pub config_store: &'a dyn ProxyConfigStore,
    /// Per-user storage root the persistent workspace mounts live under
    pub base_dir: &'a str,
    /// Websocket relay image override, empty for the default
    pub ws_image: &'a str,
}

/// Mutate a pod admission request
///
/// `proxy_uuid` is the fresh proxy-instance identifier for this injection
/// event. Returns `Ok(None)` for every pass-through outcome: no release
/// annotation, unregistered app, no matching binding.
pub async fn mutate_pod(
    ctx: &PodMutationContext<'_>,
    request: &AdmissionRequest<DynamicObject>,
    proxy_uuid: &str,
) -> Result<Option<json_patch::Patch>> {
    let Some(obj) = &request.object else {
        return Ok(None);
    };
    let raw = serde_json::to_value(obj)?;
    let mut pod: Pod = serde_json::from_value(raw.clone())?;

    let namespace = request
        .namespace
        .clone()
        .or_else(|| pod.metadata.namespace.clone())
        .unwrap_or_default();

    let annotations = pod.metadata.annotations.clone().unwrap_or_default();
    let Some(release_name) = annotations.get(HELM_RELEASE_ANNOTATION).cloned() else {
        return Ok(None);
    };

    let Some(app) = ctx.registry.dev_app_by_name(app_name(&release_name)).await? else {
        debug!(release = %release_name, "pod's release has no registered dev app");
        return Ok(None);
    };

    let bindings = ctx.registry.bindings_by_app(app.id).await?;
    let labels = pod.metadata.labels.clone().unwrap_or_default();
    let mut matches = matching_bindings(&bindings, &labels)?;
    if matches.is_empty() {
        debug!(app = %app.app_name, "no binding selector matches this pod");
        return Ok(None);
    }
    // stable port assignment across re-injections
    matches.sort_by_key(|b| b.id);

    let mut endpoints = Vec::new();
    let mut dev_port = DEV_PORT_BASE;
    let mut first_mutated = true;
    for binding in &matches {
        let endpoint = mutate_container(
            ctx,
            &mut pod,
            binding,
            &app.app_name,
            dev_port,
            first_mutated,
        )
        .await?;
        if let Some(endpoint) = endpoint {
            endpoints.push(endpoint);
            dev_port += 1;
            first_mutated = false;
        }
    }

    if !endpoints.is_empty() {
        pod.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(PROXY_UUID_ANNOTATION.to_string(), proxy_uuid.to_string());

        let app_config = ctx.manifests.app_config(&app.app_name).await?;
        inject_sidecar(
            ctx.config_store,
            &namespace,
            &mut pod,
            &endpoints,
            proxy_uuid,
            &app_config,
            ctx.ws_image,
        )
        .await?;
    }

    diff_patch(&raw, &pod)
}

/// Test every binding's selector against the pod labels
///
/// A selector that fails to parse is a registry data-integrity bug and
/// denies the admission rather than silently skipping the binding.
fn matching_bindings<'a>(
    bindings: &'a [DevAppContainerBinding],
    labels: &BTreeMap<String, String>,
) -> Result<Vec<&'a DevAppContainerBinding>> {
    let mut matches = Vec::new();
    for binding in bindings {
        let selector = parse_selector(&binding.pod_selector)?;
        if selector.matches(labels) {
            matches.push(binding);
        }
    }
    Ok(matches)
}

/// Turn one bound pod container into a dev container
///
/// Returns the endpoint for the proxy config, or `None` when the binding
/// names a container this pod does not have.
async fn mutate_container(
    ctx: &PodMutationContext<'_>,
    pod: &mut Pod,
    binding: &DevAppContainerBinding,
    app_name: &str,
    dev_port: u16,
    first_mutated: bool,
) -> Result<Option<DevContainerEndpoint>> {
    let spec = pod.spec.get_or_insert_with(Default::default);
    let Some(container) = spec
        .containers
        .iter_mut()
        .find(|c| c.name == binding.container_name)
    else {
        return Ok(None);
    };

    let dev_container = ctx
        .registry
        .dev_container_by_id(binding.container_id)
        .await?
        .ok_or(Error::MissingContainer(binding.container_id))?;

    info!(
        container = %container.name,
        image = %dev_env_image(&dev_container.dev_env),
        port = dev_port,
        "mutating container to dev container"
    );

    container.image = Some(dev_env_image(&dev_container.dev_env));
    container.command = Some(vec![
        "sh".to_string(),
        "-c".to_string(),
        editor_command(dev_port, first_mutated),
    ]);

    upsert_env(container, DEV_CONTAINER_ENV, &binding.container_id.to_string());
    upsert_env(container, DEV_CONTAINER_PORT_ENV, &dev_port.to_string());

    let storage_root = format!(
        "{}/studio/{}/{}",
        ctx.base_dir.trim_end_matches('/'),
        app_name,
        binding.container_id
    );
    replace_dev_volumes(
        spec.volumes.get_or_insert_with(Vec::new),
        container,
        binding.container_id,
        &storage_root,
    );

    Ok(Some(DevContainerEndpoint::local(&container.name, dev_port)))
}

/// Startup script for a mutated container
///
/// Only the first mutated container in a pod starts nginx; it is the
/// single shared front door on the in-container default port.
fn editor_command(dev_port: u16, front_door: bool) -> String {
    let nginx = if front_door { "nginx && " } else { "" };
    format!(
        "if [ ! -f /etc/nginx/conf.d/dev/dev.conf ]; then \
cp /etc/nginx/conf.d/dev.example /etc/nginx/conf.d/dev/dev.conf; fi; \
{nginx}exec /usr/bin/code-server --bind-addr \"0.0.0.0:{dev_port}\" --auth=none --log=debug"
    )
}

/// Set an env var, updating in place when it already exists
fn upsert_env(container: &mut Container, name: &str, value: &str) {
    let env = container.env.get_or_insert_with(Vec::new);
    match env.iter_mut().find(|e| e.name == name) {
        Some(existing) => existing.value = Some(value.to_string()),
        None => env.push(EnvVar {
            name: name.to_string(),
            value: Some(value.to_string()),
            ..Default::default()
        }),
    }
}

// The three persistent mounts every dev container gets, as
// (volume-name prefix, subdirectory, mount path).
const DEV_VOLUMES: [(&str, &str, &str); 3] = [
    ("dev-github-cache", "github", "/root/.cache/github-credential"),
    ("dev-workspace", "workspace", "/root"),
    ("dev-nginx-config", "nginx", "/etc/nginx/conf.d/dev"),
];

/// Replace prior-injection volumes with fresh per-container host paths
fn replace_dev_volumes(
    volumes: &mut Vec<Volume>,
    container: &mut Container,
    container_id: i64,
    storage_root: &str,
) {
    let names: Vec<String> = DEV_VOLUMES
        .iter()
        .map(|(prefix, _, _)| format!("{prefix}-{container_id}"))
        .collect();

    volumes.retain(|v| !names.contains(&v.name));
    let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
    mounts.retain(|m| !names.contains(&m.name));

    for ((_, subdir, mount_path), name) in DEV_VOLUMES.iter().zip(&names) {
        volumes.push(Volume {
            name: name.clone(),
            host_path: Some(HostPathVolumeSource {
                path: format!("{storage_root}/{subdir}"),
                type_: Some("DirectoryOrCreate".to_string()),
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: name.clone(),
            mount_path: mount_path.to_string(),
            ..Default::default()
        });
    }
}
