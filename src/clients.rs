//! Cluster client and cache seams
//!
//! The reconciler only talks to the cluster through the traits in this
//! module: synchronous listers backed by watch caches, and typed clients for
//! the handful of writes it performs. Reflector stores implement the lister
//! traits directly; the `fake` module provides in-memory implementations for
//! tests.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use k8s_openapi::api::core::v1::{ConfigMap, ObjectReference, Pod, Secret, ServiceAccount};
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Client, Resource, ResourceExt};
use serde_json::Value;
use tracing::warn;

use crate::crd::{Build, BuildConfig, ImageStream};
use crate::error::{OperatorError, Result};

/// Key of a namespaced resource, `namespace/name`.
pub fn resource_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

/// Split a `namespace/name` key back into its parts.
pub fn parse_key(key: &str) -> Result<(&str, &str)> {
    key.split_once('/')
        .filter(|(ns, name)| !ns.is_empty() && !name.is_empty())
        .ok_or_else(|| OperatorError::InvalidKey(key.to_string()))
}

/// Key of an object carrying namespace and name in its metadata.
pub fn object_key<K: Resource>(object: &K) -> String {
    resource_key(&object.namespace().unwrap_or_default(), &object.name_any())
}

/// Read access to the Build watch cache.
pub trait BuildLister: Send + Sync {
    fn get_build(&self, namespace: &str, name: &str) -> Option<Arc<Build>>;
    fn list_builds(&self, namespace: &str) -> Vec<Arc<Build>>;
}

/// Read access to the BuildConfig watch cache.
pub trait BuildConfigLister: Send + Sync {
    fn get_build_config(&self, namespace: &str, name: &str) -> Option<Arc<BuildConfig>>;
}

/// Read access to the Pod watch cache.
pub trait PodLister: Send + Sync {
    fn get_pod(&self, namespace: &str, name: &str) -> Option<Arc<Pod>>;
}

/// Read access to the Secret watch cache.
pub trait SecretLister: Send + Sync {
    fn get_secret(&self, namespace: &str, name: &str) -> Option<Arc<Secret>>;
}

/// Read access to the ImageStream watch cache.
pub trait ImageStreamLister: Send + Sync {
    fn get_image_stream(&self, namespace: &str, name: &str) -> Option<Arc<ImageStream>>;
}

impl BuildLister for Store<Build> {
    fn get_build(&self, namespace: &str, name: &str) -> Option<Arc<Build>> {
        Store::get(self, &ObjectRef::new(name).within(namespace))
    }

    fn list_builds(&self, namespace: &str) -> Vec<Arc<Build>> {
        self.state()
            .into_iter()
            .filter(|build| build.namespace().as_deref() == Some(namespace))
            .collect()
    }
}

impl BuildConfigLister for Store<BuildConfig> {
    fn get_build_config(&self, namespace: &str, name: &str) -> Option<Arc<BuildConfig>> {
        Store::get(self, &ObjectRef::new(name).within(namespace))
    }
}

impl PodLister for Store<Pod> {
    fn get_pod(&self, namespace: &str, name: &str) -> Option<Arc<Pod>> {
        Store::get(self, &ObjectRef::new(name).within(namespace))
    }
}

impl SecretLister for Store<Secret> {
    fn get_secret(&self, namespace: &str, name: &str) -> Option<Arc<Secret>> {
        Store::get(self, &ObjectRef::new(name).within(namespace))
    }
}

impl ImageStreamLister for Store<ImageStream> {
    fn get_image_stream(&self, namespace: &str, name: &str) -> Option<Arc<ImageStream>> {
        Store::get(self, &ObjectRef::new(name).within(namespace))
    }
}

/// Pod create/get/delete against the API server.
#[async_trait]
pub trait PodClient: Send + Sync {
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> kube::Result<Pod>;
    async fn get_pod(&self, namespace: &str, name: &str) -> kube::Result<Pod>;
    async fn delete_pod(&self, namespace: &str, name: &str) -> kube::Result<()>;
}

/// ConfigMap create/get against the API server.
#[async_trait]
pub trait ConfigMapClient: Send + Sync {
    async fn create_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> kube::Result<ConfigMap>;
    async fn get_config_map(&self, namespace: &str, name: &str) -> kube::Result<ConfigMap>;
}

/// Applies merge patches to Build objects.
#[async_trait]
pub trait BuildPatcher: Send + Sync {
    async fn patch_build(&self, namespace: &str, name: &str, patch: &Value)
        -> kube::Result<Build>;
}

/// ServiceAccount reads, used to chase push/pull secrets.
#[async_trait]
pub trait ServiceAccountClient: Send + Sync {
    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> kube::Result<ServiceAccount>;
}

/// Kubernetes Event emission; fire-and-forget.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn event(&self, build: &Build, event_type: EventType, reason: &str, message: String);
}

/// Typed clients backed by one kube [`Client`].
#[derive(Clone)]
pub struct KubeClients {
    client: Client,
}

impl KubeClients {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn config_maps(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn builds(&self, namespace: &str) -> Api<Build> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn service_accounts(&self, namespace: &str) -> Api<ServiceAccount> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl PodClient for KubeClients {
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> kube::Result<Pod> {
        self.pods(namespace).create(&PostParams::default(), pod).await
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> kube::Result<Pod> {
        self.pods(namespace).get(name).await
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> kube::Result<()> {
        self.pods(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl ConfigMapClient for KubeClients {
    async fn create_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> kube::Result<ConfigMap> {
        self.config_maps(namespace)
            .create(&PostParams::default(), config_map)
            .await
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> kube::Result<ConfigMap> {
        self.config_maps(namespace).get(name).await
    }
}

#[async_trait]
impl BuildPatcher for KubeClients {
    async fn patch_build(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> kube::Result<Build> {
        let api = self.builds(namespace);
        let params = PatchParams::default();
        let mut patched = None;
        // Builds keep status behind the status subresource, so metadata and
        // status slices of the diff go through their own endpoints.
        if let Some(metadata) = patch.get("metadata") {
            let body = serde_json::json!({ "metadata": metadata });
            patched = Some(api.patch(name, &params, &Patch::Merge(&body)).await?);
        }
        if let Some(spec) = patch.get("spec") {
            let body = serde_json::json!({ "spec": spec });
            patched = Some(api.patch(name, &params, &Patch::Merge(&body)).await?);
        }
        if let Some(status) = patch.get("status") {
            let body = serde_json::json!({ "status": status });
            patched = Some(api.patch_status(name, &params, &Patch::Merge(&body)).await?);
        }
        match patched {
            Some(build) => Ok(build),
            None => api.get(name).await,
        }
    }
}

#[async_trait]
impl ServiceAccountClient for KubeClients {
    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> kube::Result<ServiceAccount> {
        self.service_accounts(namespace).get(name).await
    }
}

/// Event sink publishing through `kube::runtime::events::Recorder`.
pub struct KubeEventSink {
    recorder: Recorder,
}

impl KubeEventSink {
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

fn build_object_ref(build: &Build) -> ObjectReference {
    ObjectReference {
        api_version: Some("build.openshift.io/v1".to_string()),
        kind: Some("Build".to_string()),
        name: build.meta().name.clone(),
        namespace: build.meta().namespace.clone(),
        uid: build.meta().uid.clone(),
        ..Default::default()
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn event(&self, build: &Build, event_type: EventType, reason: &str, message: String) {
        let event = Event {
            type_: event_type,
            reason: reason.to_string(),
            note: Some(message),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(err) = self.recorder.publish(&event, &build_object_ref(build)).await {
            warn!(reason, error = %err, "failed to publish event");
        }
    }
}

/// Readiness handle for one watch cache; awaited before workers start.
#[derive(Clone)]
pub struct CacheSync {
    name: &'static str,
    ready: Shared<BoxFuture<'static, bool>>,
}

impl CacheSync {
    /// Wrap a reflector store; becomes ready after the initial list lands.
    pub fn for_store<K>(name: &'static str, store: Store<K>) -> Self
    where
        K: kube::runtime::reflector::Lookup + Clone + Send + Sync + 'static,
        K::DynamicType: std::hash::Hash + Eq + Clone + Send + Sync,
    {
        let ready = async move { store.wait_until_ready().await.is_ok() }
            .boxed()
            .shared();
        Self { name, ready }
    }

    /// A sync that is ready immediately; used by tests.
    pub fn always_ready(name: &'static str) -> Self {
        Self {
            name,
            ready: async { true }.boxed().shared(),
        }
    }

    pub async fn wait_synced(&self) -> bool {
        self.ready.clone().await
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_key_round_trip() {
        let key = resource_key("ns1", "b1");
        assert_eq!(key, "ns1/b1");
        assert_eq!(parse_key(&key).unwrap(), ("ns1", "b1"));
    }

    #[test]
    fn test_parse_key_rejects_malformed() {
        assert!(parse_key("no-slash").is_err());
        assert!(parse_key("/name").is_err());
        assert!(parse_key("ns/").is_err());
    }

    #[tokio::test]
    async fn test_always_ready_cache_sync() {
        let sync = CacheSync::always_ready("builds");
        assert!(sync.wait_synced().await);
        assert_eq!(sync.name(), "builds");
    }
}
