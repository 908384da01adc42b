//! Sidecar injection into mutated pods
//!
//! Publishes the generated bootstrap as a per-instance ConfigMap and, on
//! first injection, appends the init/proxy/websocket containers to the pod
//! spec. Re-injection (a retried or resynced admission) only repoints the
//! config volume at the newer ConfigMap; it never duplicates containers.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Capabilities, ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar,
    EnvVarSource, KeyToPath, ObjectFieldSelector, Pod, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tracing::{error, info};

use super::config::ProxyConfigBuilder;
use super::{
    DevContainerEndpoint, DEFAULT_WS_IMAGE, ENVOY_ADMIN_PORT, ENVOY_CONFIG_DIR,
    ENVOY_CONFIG_FILE, ENVOY_CONTAINER, ENVOY_IMAGE, ENVOY_INBOUND_PORT,
    ENVOY_INBOUND_PORT_NAME, ENVOY_LIVENESS_PORT, ENVOY_LOG_LEVEL, ENVOY_UID, INIT_IMAGE,
    PROXY_UUID_ANNOTATION, SIDECAR_CONFIG_VOLUME, SIDECAR_INIT_CONTAINER, WS_CONTAINER,
    WS_IMAGE_PREFIX,
};
use crate::error::Result;
use crate::manifest::AppConfig;

/// Publishes per-instance proxy bootstrap payloads
///
/// The seam between injection logic and the cluster; tests publish into a
/// mock instead of a live API server.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProxyConfigStore: Send + Sync {
    /// Create or update the config resource `name` in `namespace`
    async fn publish(&self, namespace: &str, name: &str, payload: &str) -> Result<()>;
}

/// ConfigMap-backed store used in production
pub struct KubeConfigStore {
    client: Client,
}

impl KubeConfigStore {
    /// Create a store writing through `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ProxyConfigStore for KubeConfigStore {
    async fn publish(&self, namespace: &str, name: &str, payload: &str) -> Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: Some([(ENVOY_CONFIG_FILE.to_string(), payload.to_string())].into()),
            ..Default::default()
        };

        match api.get_opt(name).await? {
            Some(mut existing) => {
                existing.data = config_map.data;
                api.replace(name, &PostParams::default(), &existing).await?;
            }
            None => {
                // A concurrent injection for the same instance id may win the
                // create; fall back to replacing its payload.
                match api.create(&PostParams::default(), &config_map).await {
                    Ok(_) => {}
                    Err(kube::Error::Api(e)) if e.code == 409 => {
                        let mut existing = api.get(name).await?;
                        existing.data = config_map.data.clone();
                        api.replace(name, &PostParams::default(), &existing).await?;
                    }
                    Err(e) => {
                        error!(namespace, name, error = %e, "failed to create sidecar configmap");
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(())
    }
}

/// Whether the pod already carries the injected sidecar
///
/// Injected means both markers are present: the proxy-uuid annotation and
/// the named init container. Either one alone is a partial state that a
/// fresh injection must repair.
pub fn is_injected(pod: &Pod) -> bool {
    let has_uuid = pod
        .metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(PROXY_UUID_ANNOTATION));
    let has_init = pod
        .spec
        .as_ref()
        .and_then(|s| s.init_containers.as_ref())
        .is_some_and(|cs| cs.iter().any(|c| c.name == SIDECAR_INIT_CONTAINER));
    has_uuid && has_init
}

/// Whether a websocket relay container is already present
pub fn is_websocket_enabled(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .map(|s| s.containers.as_slice())
        .unwrap_or_default()
        .iter()
        .any(|c| {
            c.image
                .as_deref()
                .is_some_and(|i| i.starts_with(WS_IMAGE_PREFIX))
        })
}

/// Publish the bootstrap for this injection and ensure the sidecar set
///
/// Fails closed: a pod never leaves here with a proxy container but no
/// backing configuration.
pub async fn inject_sidecar(
    store: &dyn ProxyConfigStore,
    namespace: &str,
    pod: &mut Pod,
    endpoints: &[DevContainerEndpoint],
    proxy_uuid: &str,
    app_config: &AppConfig,
    ws_image: &str,
) -> Result<()> {
    let injected = is_injected(pod);

    let mut builder =
        ProxyConfigBuilder::new(&app_config.owner_name).with_endpoints(endpoints.to_vec());
    if injected {
        if is_websocket_enabled(pod) {
            builder = builder.with_websocket();
        }
    } else if app_config.websocket_enabled() {
        builder = builder.with_websocket();
    }
    let websocket = builder.websocket();
    let payload = builder.build()?;

    let config_map_name = format!("{SIDECAR_CONFIG_VOLUME}-{proxy_uuid}");
    store.publish(namespace, &config_map_name, &payload).await?;

    let spec = pod.spec.get_or_insert_with(Default::default);
    if injected {
        info!(namespace, "sidecar already injected, repointing config volume");
        for volume in spec.volumes.get_or_insert_with(Vec::new).iter_mut() {
            if volume.name == SIDECAR_CONFIG_VOLUME {
                if let Some(cm) = volume.config_map.as_mut() {
                    cm.name = config_map_name.clone();
                }
            }
        }
        return Ok(());
    }

    info!(namespace, websocket, "injecting dev sidecar");
    spec.volumes.get_or_insert_with(Vec::new).push(Volume {
        name: SIDECAR_CONFIG_VOLUME.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: config_map_name,
            items: Some(vec![KeyToPath {
                key: ENVOY_CONFIG_FILE.to_string(),
                path: ENVOY_CONFIG_FILE.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    });

    spec.init_containers
        .get_or_insert_with(Vec::new)
        .push(init_container());
    spec.containers.push(envoy_container(
        spec.service_account_name.as_deref().unwrap_or_default(),
        pod.metadata.namespace.as_deref().unwrap_or(namespace),
    ));
    if websocket {
        spec.containers
            .push(websocket_container(app_config, ws_image));
    }
    Ok(())
}

/// The iptables rules the init container programs
///
/// All inbound TCP is redirected to the proxy's inbound listener, except
/// the proxy's own admin port and SSH.
fn iptables_script() -> String {
    format!(
        r#"iptables-restore --noflush <<EOF
# sidecar interception rules
*nat
:PROXY_IN_REDIRECT - [0:0]
:PROXY_INBOUND - [0:0]
-A PROXY_IN_REDIRECT -p tcp -j REDIRECT --to-port {ENVOY_INBOUND_PORT}
-A PREROUTING -p tcp -j PROXY_INBOUND
-A PROXY_INBOUND -p tcp --dport {ENVOY_ADMIN_PORT} -j RETURN
-A PROXY_INBOUND -p tcp --dport 22 -j RETURN
-A PROXY_INBOUND -p tcp -j PROXY_IN_REDIRECT
COMMIT
EOF
"#
    )
}

fn field_ref_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn init_container() -> Container {
    Container {
        name: SIDECAR_INIT_CONTAINER.to_string(),
        image: Some(INIT_IMAGE.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            capabilities: Some(Capabilities {
                add: Some(vec!["NET_ADMIN".to_string()]),
                ..Default::default()
            }),
            run_as_non_root: Some(false),
            run_as_user: Some(0),
            ..Default::default()
        }),
        command: Some(vec!["/bin/sh".to_string()]),
        args: Some(vec!["-c".to_string(), iptables_script()]),
        env: Some(vec![field_ref_env("POD_IP", "status.podIP")]),
        ..Default::default()
    }
}

fn envoy_container(service_account: &str, namespace: &str) -> Container {
    let cluster_id = format!("{service_account}.{namespace}");
    let config_path = format!("{ENVOY_CONFIG_DIR}/{ENVOY_CONFIG_FILE}");

    Container {
        name: ENVOY_CONTAINER.to_string(),
        image: Some(ENVOY_IMAGE.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        security_context: Some(SecurityContext {
            allow_privilege_escalation: Some(false),
            run_as_user: Some(ENVOY_UID),
            ..Default::default()
        }),
        ports: Some(vec![
            ContainerPort {
                name: Some(ENVOY_INBOUND_PORT_NAME.to_string()),
                container_port: i32::from(ENVOY_INBOUND_PORT),
                ..Default::default()
            },
            ContainerPort {
                // port names are limited to 15 characters
                name: Some("liveness-port".to_string()),
                container_port: i32::from(ENVOY_LIVENESS_PORT),
                ..Default::default()
            },
        ]),
        volume_mounts: Some(vec![VolumeMount {
            name: SIDECAR_CONFIG_VOLUME.to_string(),
            read_only: Some(true),
            mount_path: config_path.clone(),
            sub_path: Some(ENVOY_CONFIG_FILE.to_string()),
            ..Default::default()
        }]),
        command: Some(vec!["envoy".to_string()]),
        args: Some(vec![
            "--log-level".to_string(),
            ENVOY_LOG_LEVEL.to_string(),
            "-c".to_string(),
            config_path,
            "--service-cluster".to_string(),
            cluster_id,
        ]),
        env: Some(vec![
            field_ref_env("POD_UID", "metadata.uid"),
            field_ref_env("POD_NAME", "metadata.name"),
            field_ref_env("POD_NAMESPACE", "metadata.namespace"),
            field_ref_env("POD_IP", "status.podIP"),
            field_ref_env("SERVICE_ACCOUNT", "spec.serviceAccountName"),
        ]),
        ..Default::default()
    }
}

fn websocket_container(app_config: &AppConfig, ws_image: &str) -> Container {
    let ws = app_config.websocket.clone().unwrap_or_default();
    let image = if ws_image.is_empty() { DEFAULT_WS_IMAGE } else { ws_image };
    Container {
        name: WS_CONTAINER.to_string(),
        image: Some(image.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec!["/ws-gateway".to_string()]),
        env: Some(vec![
            EnvVar {
                name: "WS_PORT".to_string(),
                value: Some(ws.port.to_string()),
                ..Default::default()
            },
            EnvVar {
                name: "WS_URL".to_string(),
                value: Some(ws.url),
                ..Default::default()
            },
        ]),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::WsConfig;
    use k8s_openapi::api::core::v1::PodSpec;
    use std::collections::BTreeMap;

    fn base_pod() -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("demo-pod".to_string()),
                namespace: Some("demo-dev-alice".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                service_account_name: Some("demo".to_string()),
                containers: vec![Container {
                    name: "web".to_string(),
                    image: Some("demo/web:1.0".to_string()),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn injected_pod(uuid: &str) -> Pod {
        let mut pod = base_pod();
        pod.metadata.annotations = Some(BTreeMap::from([(
            PROXY_UUID_ANNOTATION.to_string(),
            uuid.to_string(),
        )]));
        let spec = pod.spec.as_mut().unwrap();
        spec.init_containers = Some(vec![init_container()]);
        spec.containers.push(envoy_container("demo", "demo-dev-alice"));
        spec.volumes = Some(vec![Volume {
            name: SIDECAR_CONFIG_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: format!("{SIDECAR_CONFIG_VOLUME}-{uuid}"),
                ..Default::default()
            }),
            ..Default::default()
        }]);
        pod
    }

    fn app_config(websocket: bool) -> AppConfig {
        AppConfig {
            app_name: "demo".into(),
            owner_name: "alice".into(),
            entrances: vec![],
            websocket: websocket.then(|| WsConfig {
                port: 8888,
                url: "/ws".into(),
            }),
        }
    }

    fn endpoints() -> Vec<DevContainerEndpoint> {
        vec![DevContainerEndpoint::local("web", 5000)]
    }

    #[test]
    fn injection_markers_require_annotation_and_init_container() {
        assert!(!is_injected(&base_pod()));
        assert!(is_injected(&injected_pod("u-1")));

        // annotation alone is a partial state
        let mut pod = base_pod();
        pod.metadata.annotations = Some(BTreeMap::from([(
            PROXY_UUID_ANNOTATION.to_string(),
            "u-1".to_string(),
        )]));
        assert!(!is_injected(&pod));

        // init container alone is a partial state too
        let mut pod = base_pod();
        pod.spec.as_mut().unwrap().init_containers = Some(vec![init_container()]);
        assert!(!is_injected(&pod));
    }

    #[test]
    fn iptables_rules_redirect_inbound_with_exceptions() {
        let script = iptables_script();
        assert!(script.contains("--to-port 15003"));
        assert!(script.contains("--dport 15000 -j RETURN"));
        assert!(script.contains("--dport 22 -j RETURN"));
        assert!(script.starts_with("iptables-restore --noflush"));
    }

    #[tokio::test]
    async fn first_injection_appends_sidecar_set() {
        let mut store = MockProxyConfigStore::new();
        store
            .expect_publish()
            .withf(|ns, name, payload| {
                ns == "demo-dev-alice"
                    && name == "studio-sidecar-config-u-1"
                    && payload.contains("devcontainer_proxy")
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let mut pod = base_pod();
        inject_sidecar(
            &store,
            "demo-dev-alice",
            &mut pod,
            &endpoints(),
            "u-1",
            &app_config(false),
            "",
        )
        .await
        .unwrap();

        let spec = pod.spec.as_ref().unwrap();
        let init = spec.init_containers.as_ref().unwrap();
        assert_eq!(init.len(), 1);
        assert_eq!(init[0].name, SIDECAR_INIT_CONTAINER);

        let names: Vec<_> = spec.containers.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["web", ENVOY_CONTAINER]);

        let envoy = spec.containers.iter().find(|c| c.name == ENVOY_CONTAINER).unwrap();
        let args = envoy.args.as_ref().unwrap();
        assert!(args.contains(&"demo.demo-dev-alice".to_string()));
        let ports: Vec<_> = envoy
            .ports
            .as_ref()
            .unwrap()
            .iter()
            .map(|p| p.container_port)
            .collect();
        assert_eq!(ports, vec![15003, 15008]);

        let volumes = spec.volumes.as_ref().unwrap();
        assert_eq!(volumes.len(), 1);
        assert_eq!(
            volumes[0].config_map.as_ref().unwrap().name,
            "studio-sidecar-config-u-1"
        );
    }

    #[tokio::test]
    async fn websocket_declared_adds_relay_container() {
        let mut store = MockProxyConfigStore::new();
        store
            .expect_publish()
            .withf(|_, _, payload| payload.contains("ws_gateway"))
            .times(1)
            .returning(|_, _, _| Ok(()));

        let mut pod = base_pod();
        inject_sidecar(
            &store,
            "demo-dev-alice",
            &mut pod,
            &endpoints(),
            "u-1",
            &app_config(true),
            "",
        )
        .await
        .unwrap();

        let ws = pod
            .spec
            .as_ref()
            .unwrap()
            .containers
            .iter()
            .find(|c| c.name == WS_CONTAINER)
            .expect("ws relay container");
        let env = ws.env.as_ref().unwrap();
        assert!(env.iter().any(|e| e.name == "WS_PORT" && e.value.as_deref() == Some("8888")));
        assert!(env.iter().any(|e| e.name == "WS_URL" && e.value.as_deref() == Some("/ws")));
    }

    #[tokio::test]
    async fn reinjection_only_updates_config() {
        let mut store = MockProxyConfigStore::new();
        store
            .expect_publish()
            .withf(|_, name, _| name == "studio-sidecar-config-u-2")
            .times(1)
            .returning(|_, _, _| Ok(()));

        let mut pod = injected_pod("u-1");
        let containers_before = pod.spec.as_ref().unwrap().containers.len();

        inject_sidecar(
            &store,
            "demo-dev-alice",
            &mut pod,
            &endpoints(),
            "u-2",
            &app_config(true),
            "",
        )
        .await
        .unwrap();

        let spec = pod.spec.as_ref().unwrap();
        assert_eq!(spec.containers.len(), containers_before);
        assert_eq!(spec.init_containers.as_ref().unwrap().len(), 1);
        // volume repointed at the newer instance's config
        assert_eq!(
            spec.volumes.as_ref().unwrap()[0].config_map.as_ref().unwrap().name,
            "studio-sidecar-config-u-2"
        );
    }

    #[tokio::test]
    async fn publish_failure_aborts_injection() {
        let mut store = MockProxyConfigStore::new();
        store
            .expect_publish()
            .times(1)
            .returning(|_, _, _| Err(crate::error::Error::Internal("boom".into())));

        let mut pod = base_pod();
        let err = inject_sidecar(
            &store,
            "demo-dev-alice",
            &mut pod,
            &endpoints(),
            "u-1",
            &app_config(false),
            "",
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("boom"));

        // nothing was attached without a backing config
        let spec = pod.spec.as_ref().unwrap();
        assert!(spec.init_containers.is_none());
        assert_eq!(spec.containers.len(), 1);
    }
}
