//! Client side of the dev-app registry
//!
//! The registry is owned by the studio management API; the webhook only ever
//! reads it. `Registry` is the seam: the production implementation talks to
//! the management API over HTTP, tests use the in-memory implementation (or a
//! mockall mock) without any network.

use async_trait::async_trait;
use dashmap::DashMap;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A registered application eligible for live-development mutation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevApp {
    /// Registry id
    pub id: i64,
    /// Application name (the Helm release name minus the `-dev` suffix)
    pub app_name: String,
    /// User who registered the app
    pub owner: String,
    /// Declared development-environment kind (e.g. "Golang")
    pub dev_env: String,
    /// Lifecycle state as recorded by the management API
    #[serde(default)]
    pub state: String,
}

/// A reusable development-environment definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevContainer {
    /// Registry id, also tracked on mutated containers via env
    pub id: i64,
    /// Environment kind, selects the dev image
    pub dev_env: String,
    /// Display name
    pub name: String,
}

/// Binds a dev app to one production container it should shadow
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevAppContainerBinding {
    /// Registry id
    pub id: i64,
    /// Owning [`DevApp`] id
    pub app_id: i64,
    /// Owning [`DevContainer`] id
    pub container_id: i64,
    /// Label-query expression selecting the target pods
    pub pod_selector: String,
    /// Name of the container to swap inside matched pods
    pub container_name: String,
    /// Production image the binding shadows
    pub image: String,
}

/// Read access to the dev-app registry
///
/// Misses are `Ok(None)` / empty vectors; only transport or server failures
/// are errors. The distinction matters: a miss is a legitimate "do not
/// mutate" outcome, an error denies admission.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Registry: Send + Sync {
    /// Look up a dev app by its bare app name
    async fn dev_app_by_name(&self, app_name: &str) -> Result<Option<DevApp>>;

    /// List all container bindings of an app
    async fn bindings_by_app(&self, app_id: i64) -> Result<Vec<DevAppContainerBinding>>;

    /// Look up a dev container definition by id
    async fn dev_container_by_id(&self, id: i64) -> Result<Option<DevContainer>>;
}

/// Resolve the dev image for a development-environment kind
///
/// Unknown kinds pass through unchanged so the registry can carry a literal
/// image reference in `dev_env`.
pub fn dev_env_image(env: &str) -> String {
    match env {
        "NodeJS" | "default" => "studio/node-dev:0.1.1".to_string(),
        "Golang" => "studio/go-dev:0.1.1".to_string(),
        "Python" => "studio/python-dev:0.1.1".to_string(),
        other => other.to_string(),
    }
}

/// Registry client backed by the management API's lookup endpoints
pub struct HttpRegistry {
    base_url: String,
    client: reqwest::Client,
}

impl HttpRegistry {
    /// Create a client for the management API at `base_url`
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn get_optional<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.client.get(&url).send().await.map_err(Error::registry)?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = resp.error_for_status().map_err(Error::registry)?;
        resp.json::<T>().await.map(Some).map_err(Error::registry)
    }
}

#[async_trait]
impl Registry for HttpRegistry {
    async fn dev_app_by_name(&self, app_name: &str) -> Result<Option<DevApp>> {
        self.get_optional(&format!("/registry/dev-apps/{app_name}")).await
    }

    async fn bindings_by_app(&self, app_id: i64) -> Result<Vec<DevAppContainerBinding>> {
        Ok(self
            .get_optional(&format!("/registry/dev-apps/{app_id}/containers"))
            .await?
            .unwrap_or_default())
    }

    async fn dev_container_by_id(&self, id: i64) -> Result<Option<DevContainer>> {
        self.get_optional(&format!("/registry/dev-containers/{id}")).await
    }
}

/// In-memory registry, seedable from a YAML snapshot
///
/// Used by tests and by local single-node development where no management API
/// is running.
#[derive(Default)]
pub struct InMemoryRegistry {
    apps: DashMap<String, DevApp>,
    containers: DashMap<i64, DevContainer>,
    bindings: DashMap<i64, Vec<DevAppContainerBinding>>,
}

/// Serialized form of an [`InMemoryRegistry`] seed file
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    /// Registered apps
    #[serde(default)]
    pub apps: Vec<DevApp>,
    /// Dev container definitions
    #[serde(default)]
    pub containers: Vec<DevContainer>,
    /// App-to-container bindings
    #[serde(default)]
    pub bindings: Vec<DevAppContainerBinding>,
}

impl InMemoryRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a registry from a YAML snapshot file
    pub fn from_snapshot(snapshot: RegistrySnapshot) -> Self {
        let reg = Self::new();
        for app in snapshot.apps {
            reg.add_app(app);
        }
        for container in snapshot.containers {
            reg.add_container(container);
        }
        for binding in snapshot.bindings {
            reg.add_binding(binding);
        }
        reg
    }

    /// Register an app
    pub fn add_app(&self, app: DevApp) {
        self.apps.insert(app.app_name.clone(), app);
    }

    /// Register a dev container definition
    pub fn add_container(&self, container: DevContainer) {
        self.containers.insert(container.id, container);
    }

    /// Register a binding under its owning app
    pub fn add_binding(&self, binding: DevAppContainerBinding) {
        self.bindings.entry(binding.app_id).or_default().push(binding);
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn dev_app_by_name(&self, app_name: &str) -> Result<Option<DevApp>> {
        Ok(self.apps.get(app_name).map(|a| a.clone()))
    }

    async fn bindings_by_app(&self, app_id: i64) -> Result<Vec<DevAppContainerBinding>> {
        Ok(self.bindings.get(&app_id).map(|b| b.clone()).unwrap_or_default())
    }

    async fn dev_container_by_id(&self, id: i64) -> Result<Option<DevContainer>> {
        Ok(self.containers.get(&id).map(|c| c.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dev_env_image_known_kinds() {
        assert_eq!(dev_env_image("Golang"), "studio/go-dev:0.1.1");
        assert_eq!(dev_env_image("NodeJS"), "studio/node-dev:0.1.1");
        assert_eq!(dev_env_image("Python"), "studio/python-dev:0.1.1");
        assert_eq!(dev_env_image("default"), "studio/node-dev:0.1.1");
    }

    #[test]
    fn dev_env_image_passes_through_literal_references() {
        assert_eq!(dev_env_image("registry.local/custom:2"), "registry.local/custom:2");
    }

    #[tokio::test]
    async fn in_memory_registry_lookups() {
        let reg = InMemoryRegistry::new();
        reg.add_app(DevApp {
            id: 1,
            app_name: "demo".into(),
            owner: "alice".into(),
            dev_env: "Golang".into(),
            state: "active".into(),
        });
        reg.add_container(DevContainer {
            id: 7,
            dev_env: "Golang".into(),
            name: "go-dev".into(),
        });
        reg.add_binding(DevAppContainerBinding {
            id: 3,
            app_id: 1,
            container_id: 7,
            pod_selector: "app=demo".into(),
            container_name: "web".into(),
            image: "demo/web:1.0".into(),
        });

        let app = reg.dev_app_by_name("demo").await.unwrap().unwrap();
        assert_eq!(app.id, 1);
        assert!(reg.dev_app_by_name("missing").await.unwrap().is_none());

        let bindings = reg.bindings_by_app(1).await.unwrap();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].container_name, "web");
        assert!(reg.bindings_by_app(99).await.unwrap().is_empty());

        assert!(reg.dev_container_by_id(7).await.unwrap().is_some());
        assert!(reg.dev_container_by_id(8).await.unwrap().is_none());
    }

    #[test]
    fn snapshot_roundtrip() {
        let yaml = r#"
apps:
  - id: 1
    appName: demo
    owner: alice
    devEnv: Golang
containers:
  - id: 7
    devEnv: Golang
    name: go-dev
bindings:
  - id: 3
    appId: 1
    containerId: 7
    podSelector: app=demo
    containerName: web
    image: demo/web:1.0
"#;
        let snapshot: RegistrySnapshot = serde_yaml::from_str(yaml).unwrap();
        let reg = InMemoryRegistry::from_snapshot(snapshot);
        assert_eq!(reg.apps.len(), 1);
        assert_eq!(reg.bindings.get(&1).unwrap().len(), 1);
    }
}
