//! Application manifest lookup
//!
//! The platform stores each installed application's declared configuration
//! (entrances, websocket settings, owner) in the `spec.config` field of its
//! ApplicationManager custom resource. The pod mutator needs that
//! configuration to decide whether the injected proxy carries a websocket
//! relay and which auth backend the ext_authz filter targets.

use async_trait::async_trait;
use kube::api::{Api, DynamicObject};
use kube::core::GroupVersionKind;
use kube::discovery::ApiResource;
use kube::Client;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::{Error, Result};

/// A declared HTTP entrance of an application
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Entrance {
    /// Entrance name
    pub name: String,
    /// Backing service host
    pub host: String,
    /// Backing service port
    pub port: i32,
    /// Display title
    pub title: String,
    /// Auth level ("public", "private")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_level: Option<String>,
}

/// Websocket relay settings declared by the application
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WsConfig {
    /// Port the application's websocket endpoint listens on
    pub port: i32,
    /// URL path of the websocket endpoint
    pub url: String,
}

/// The slice of an application's declared configuration the webhook consumes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    /// Application name
    pub app_name: String,
    /// User who installed the application
    pub owner_name: String,
    /// Declared entrances
    pub entrances: Vec<Entrance>,
    /// Websocket settings, when the app declares one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub websocket: Option<WsConfig>,
}

impl AppConfig {
    /// Whether the app declares a usable websocket endpoint
    pub fn websocket_enabled(&self) -> bool {
        self.websocket.as_ref().is_some_and(|ws| !ws.url.is_empty())
    }
}

/// Resolves an application's declared configuration by app name
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ManifestSource: Send + Sync {
    /// Fetch the declared configuration of `app_name`
    async fn app_config(&self, app_name: &str) -> Result<AppConfig>;
}

/// Manifest source reading ApplicationManager custom resources
pub struct KubeManifestSource {
    api: Api<DynamicObject>,
}

impl KubeManifestSource {
    /// ApplicationManager GVK served by the platform
    const GVK: (&'static str, &'static str, &'static str) = ("studio.dev", "v1alpha1", "ApplicationManager");

    /// Create a source bound to the cluster behind `client`
    pub fn new(client: Client) -> Self {
        let (group, version, kind) = Self::GVK;
        let gvk = GroupVersionKind::gvk(group, version, kind);
        let resource = ApiResource::from_gvk_with_plural(&gvk, "applicationmanagers");
        Self {
            api: Api::all_with(client, &resource),
        }
    }
}

#[async_trait]
impl ManifestSource for KubeManifestSource {
    async fn app_config(&self, app_name: &str) -> Result<AppConfig> {
        let manager = self.api.get(app_name).await.map_err(|e| {
            error!(app = %app_name, error = %e, "failed to get application manager");
            Error::Kube(e)
        })?;

        let config = manager
            .data
            .pointer("/spec/config")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                Error::Config(format!("application manager {app_name} has no spec.config"))
            })?;

        serde_json::from_str(config).map_err(|e| {
            error!(app = %app_name, error = %e, "failed to parse application config");
            Error::Serialization(e)
        })
    }
}
