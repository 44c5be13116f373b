//! karchive kubehub – cluster-side deletion of archived objects

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use karchive_core::Gvk;
use kube::{
    api::{Api, DeleteParams},
    core::{ApiResource, DynamicObject},
    Client,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// A GVK together with its (guessed) plural resource name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    pub gvk: Gvk,
    pub plural: String,
}

impl ResourceRef {
    /// Resolve the plural with [`guess_plural`]; no discovery round-trip.
    pub fn guess(gvk: &Gvk) -> Self {
        Self { gvk: gvk.clone(), plural: guess_plural(&gvk.kind) }
    }

    pub fn api_resource(&self) -> ApiResource {
        ApiResource {
            group: self.gvk.group.clone(),
            version: self.gvk.version.clone(),
            api_version: self.gvk.api_version(),
            kind: self.gvk.kind.clone(),
            plural: self.plural.clone(),
        }
    }
}

/// Best-effort kind -> plural resource name: lowercase, then `s` -> `ses`,
/// `y` -> `ies`, otherwise append `s`. Irregular kinds come out wrong.
pub fn guess_plural(kind: &str) -> String {
    let singular = kind.to_lowercase();
    if singular.is_empty() || singular.ends_with("endpoints") {
        return singular;
    }
    if singular.ends_with('s') {
        format!("{singular}es")
    } else if let Some(stem) = singular.strip_suffix('y') {
        format!("{stem}ies")
    } else {
        format!("{singular}s")
    }
}

/// Capability to delete a live object by resource, namespace and name.
#[async_trait::async_trait]
pub trait ClusterDeleter: Send + Sync {
    async fn delete(&self, resource: &ResourceRef, namespace: &str, name: &str) -> Result<()>;
}

/// Deleter backed by a kube-rs client and the dynamic API.
pub struct KubeDeleter {
    client: Client,
}

impl KubeDeleter {
    pub fn new(client: Client) -> Self { Self { client } }

    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await.context("creating kubernetes client")?;
        info!("kubernetes client ready");
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl ClusterDeleter for KubeDeleter {
    async fn delete(&self, resource: &ResourceRef, namespace: &str, name: &str) -> Result<()> {
        let ar = resource.api_resource();
        let api: Api<DynamicObject> = if namespace.is_empty() {
            Api::all_with(self.client.clone(), &ar)
        } else {
            Api::namespaced_with(self.client.clone(), namespace, &ar)
        };
        api.delete(name, &DeleteParams::default())
            .await
            .with_context(|| format!("deleting {} {}/{}", resource.plural, namespace, name))?;
        counter!("kube_delete_total", 1u64);
        debug!(resource = %resource.plural, ns = %namespace, name = %name, "object deleted");
        Ok(())
    }
}
