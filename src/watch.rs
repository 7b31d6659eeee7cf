//! Watch adapters
//!
//! Reflector-backed watches feed the controller queues. Builds enqueue
//! themselves, deleted builds tickle their config so policy can start the
//! next sibling, pod events map back to their build through the build-name
//! annotation, and image stream events pop the trigger index. Pod relists
//! are suppressed by comparing resource versions.

use std::collections::HashMap;
use std::sync::Arc;

use futures::{pin_mut, StreamExt};
use k8s_openapi::api::core::v1::{Pod, Secret};
use k8s_openapi::NamespaceResourceScope;
use kube::api::Api;
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::{self, Store};
use kube::runtime::watcher::{self, watcher};
use kube::runtime::WatchStreamExt;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::clients::{resource_key, CacheSync};
use crate::controllers::BuildController;
use crate::crd::{Build, BuildConfig, ImageStream};
use crate::strategy::build_name_for_pod;

/// Reflector stores for every watched resource plus the writers the watch
/// tasks feed. The stores are the controller's listers.
pub struct ClusterCaches {
    pub builds: Store<Build>,
    pub build_configs: Store<BuildConfig>,
    pub pods: Store<Pod>,
    pub secrets: Store<Secret>,
    pub image_streams: Store<ImageStream>,
    writers: CacheWriters,
}

struct CacheWriters {
    builds: Writer<Build>,
    build_configs: Writer<BuildConfig>,
    pods: Writer<Pod>,
    secrets: Writer<Secret>,
    image_streams: Writer<ImageStream>,
}

impl ClusterCaches {
    pub fn new() -> Self {
        let (builds, builds_writer) = reflector::store();
        let (build_configs, build_configs_writer) = reflector::store();
        let (pods, pods_writer) = reflector::store();
        let (secrets, secrets_writer) = reflector::store();
        let (image_streams, image_streams_writer) = reflector::store();
        Self {
            builds,
            build_configs,
            pods,
            secrets,
            image_streams,
            writers: CacheWriters {
                builds: builds_writer,
                build_configs: build_configs_writer,
                pods: pods_writer,
                secrets: secrets_writer,
                image_streams: image_streams_writer,
            },
        }
    }

    /// The sync barriers the controller blocks on before starting workers.
    pub fn cache_syncs(&self) -> Vec<CacheSync> {
        vec![
            CacheSync::for_store("builds", self.builds.clone()),
            CacheSync::for_store("pods", self.pods.clone()),
            CacheSync::for_store("secrets", self.secrets.clone()),
            CacheSync::for_store("imagestreams", self.image_streams.clone()),
        ]
    }

    /// Start one watch task per resource. Tasks run until `shutdown` fires
    /// or their stream ends.
    pub fn spawn_watches(
        self,
        client: Client,
        namespace: Option<String>,
        controller: Arc<BuildController>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let namespace = namespace.as_deref();
        let writers = self.writers;

        let build_handler = {
            let controller = Arc::clone(&controller);
            move |event: &watcher::Event<Build>| match event {
                watcher::Event::Apply(build) | watcher::Event::InitApply(build) => {
                    controller.enqueue_build(build);
                }
                watcher::Event::Delete(build) => {
                    if let Some(key) = config_key_for_deleted_build(build) {
                        let (ns, name) = key;
                        controller.enqueue_build_config(&ns, &name);
                    }
                }
                watcher::Event::Init | watcher::Event::InitDone => {}
            }
        };

        let pod_handler = {
            let controller = Arc::clone(&controller);
            let mut gate = VersionGate::default();
            move |event: &watcher::Event<Pod>| {
                let (pod, deleted) = match event {
                    watcher::Event::Apply(pod) | watcher::Event::InitApply(pod) => (pod, false),
                    watcher::Event::Delete(pod) => (pod, true),
                    watcher::Event::Init | watcher::Event::InitDone => return,
                };
                if let Some(key) = build_key_for_pod_event(&mut gate, pod, deleted) {
                    controller.build_queue.add(key);
                }
            }
        };

        let stream_handler = {
            let controller = Arc::clone(&controller);
            move |event: &watcher::Event<ImageStream>| match event {
                watcher::Event::Apply(stream) | watcher::Event::InitApply(stream) => {
                    let namespace = stream.namespace().unwrap_or_default();
                    debug!(stream = %resource_key(&namespace, &stream.name_any()), "image stream changed");
                    controller.image_stream_changed(&namespace, &stream.name_any());
                }
                _ => {}
            }
        };

        vec![
            spawn_reflector(
                api_for::<Build>(&client, namespace),
                writers.builds,
                shutdown.clone(),
                build_handler,
            ),
            spawn_reflector(
                api_for::<BuildConfig>(&client, namespace),
                writers.build_configs,
                shutdown.clone(),
                |_: &watcher::Event<BuildConfig>| {},
            ),
            spawn_reflector(
                api_for::<Pod>(&client, namespace),
                writers.pods,
                shutdown.clone(),
                pod_handler,
            ),
            spawn_reflector(
                api_for::<Secret>(&client, namespace),
                writers.secrets,
                shutdown.clone(),
                |_: &watcher::Event<Secret>| {},
            ),
            spawn_reflector(
                api_for::<ImageStream>(&client, namespace),
                writers.image_streams,
                shutdown,
                stream_handler,
            ),
        ]
    }
}

impl Default for ClusterCaches {
    fn default() -> Self {
        Self::new()
    }
}

fn api_for<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(namespace) if !namespace.is_empty() => Api::namespaced(client.clone(), namespace),
        _ => Api::all(client.clone()),
    }
}

/// Feed a reflector store from a watch and hand every event to `on_event`.
fn spawn_reflector<K, F>(
    api: Api<K>,
    writer: Writer<K>,
    mut shutdown: watch::Receiver<bool>,
    mut on_event: F,
) -> JoinHandle<()>
where
    K: Resource<DynamicType = ()>
        + Clone
        + DeserializeOwned
        + std::fmt::Debug
        + Send
        + Sync
        + 'static,
    F: FnMut(&watcher::Event<K>) + Send + 'static,
{
    tokio::spawn(async move {
        let stream = reflector::reflector(
            writer,
            watcher(api, watcher::Config::default()).default_backoff(),
        );
        pin_mut!(stream);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = stream.next() => match event {
                    Some(Ok(event)) => on_event(&event),
                    Some(Err(err)) => warn!(error = %err, "watch error"),
                    None => break,
                },
            }
        }
    })
}

/// A deleted build that never finished frees its config slot.
fn config_key_for_deleted_build(build: &Build) -> Option<(String, String)> {
    if build.is_complete() {
        return None;
    }
    let config = build.config_name()?;
    Some((build.namespace().unwrap_or_default(), config))
}

/// Suppresses pod events whose resource version did not move; a periodic
/// relist re-delivers every known pod.
#[derive(Default)]
struct VersionGate {
    versions: HashMap<String, String>,
}

impl VersionGate {
    /// True when the event carries new state for `key`.
    fn admit(&mut self, key: &str, version: Option<&str>) -> bool {
        let Some(version) = version else {
            return true;
        };
        match self.versions.get(key) {
            Some(seen) if seen == version => false,
            _ => {
                self.versions.insert(key.to_string(), version.to_string());
                true
            }
        }
    }

    fn forget(&mut self, key: &str) {
        self.versions.remove(key);
    }
}

/// Map a pod event to the build key to enqueue, if any. Only pods annotated
/// with a build name count, and unchanged resource versions are dropped.
fn build_key_for_pod_event(gate: &mut VersionGate, pod: &Pod, deleted: bool) -> Option<String> {
    let build_name = build_name_for_pod(pod)?;
    let namespace = pod.namespace().unwrap_or_default();
    let pod_key = resource_key(&namespace, &pod.name_any());
    if deleted {
        gate.forget(&pod_key);
    } else if !gate.admit(&pod_key, pod.resource_version().as_deref()) {
        return None;
    }
    Some(resource_key(&namespace, &build_name))
}
