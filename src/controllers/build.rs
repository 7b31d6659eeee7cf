//! Build controller
//!
//! Watches builds and synchronizes them with their executor pods. Image
//! stream references in a build are resolved to concrete registry pull specs
//! before the pod is created; resolution is late-bound, so a build may be
//! created before its streams exist and converges once they do. Policy
//! decides when queued siblings of one config may start.
//!
//! Reconciliation is level driven: every pass re-reads the cached cluster
//! state, so lost or duplicated watch events only cost an extra cycle.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use chrono::{Timelike, Utc};
use k8s_openapi::api::core::v1::{ConfigMap, LocalObjectReference, Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::ObjectMeta;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::clients::{
    object_key, parse_key, resource_key, BuildConfigLister, BuildLister, BuildPatcher, CacheSync,
    ConfigMapClient, EventSink, ImageStreamLister, PodClient, PodLister, SecretLister,
    ServiceAccountClient,
};
use crate::crd::{Build, BuildPhase, BuildStatusReason, DockerImageReference};
use crate::error::{is_already_exists, is_not_found, OperatorError, Result};
use crate::policy::{default_run_policies, policy_for_build, RunPolicy};
use crate::queue::RateLimitedQueue;
use crate::resolver::ImageResolver;
use crate::strategy::{
    has_owner_reference, has_pod_owner_reference, pod_owner_reference, update_custom_image_env,
    BuildPodFactory, BuildPruner, EnvResolver, PodMutator, ADDITIONAL_TRUSTED_CA_KEY,
    CA_INJECT_ANNOTATION, GIT_CLONE_CONTAINER,
};
use crate::triggers::TriggerIndex;
use crate::update::{transition_to_phase, BuildUpdate};

/// Retries per key before the queue gives up on it.
const MAX_RETRIES: u32 = 15;

/// Trailing lines kept in a failed build's log snippet.
const MAX_EXCERPT_LINES: usize = 5;

/// Event reasons recorded on phase transitions.
const BUILD_STARTED_EVENT: &str = "BuildStarted";
const BUILD_CANCELLED_EVENT: &str = "BuildCancelled";
const BUILD_COMPLETED_EVENT: &str = "BuildCompleted";
const BUILD_FAILED_EVENT: &str = "BuildFailed";

/// Outcome of one handler: a possibly-partial update plus a possibly-set
/// error. Partial progress is recorded even when the handler also failed.
type HandlerOutcome = (Option<BuildUpdate>, Option<OperatorError>);

/// Everything the controller needs, injected at construction.
pub struct BuildControllerParams {
    pub builds: Arc<dyn BuildLister>,
    pub build_configs: Arc<dyn BuildConfigLister>,
    pub pods: Arc<dyn PodLister>,
    pub secrets: Arc<dyn SecretLister>,
    pub image_streams: Arc<dyn ImageStreamLister>,
    pub pod_client: Arc<dyn PodClient>,
    pub config_map_client: Arc<dyn ConfigMapClient>,
    pub build_patcher: Arc<dyn BuildPatcher>,
    pub service_accounts: Arc<dyn ServiceAccountClient>,
    pub events: Arc<dyn EventSink>,
    pub pod_factory: Arc<dyn BuildPodFactory>,
    pub defaults: Arc<dyn PodMutator>,
    pub overrides: Arc<dyn PodMutator>,
    pub env_resolver: Arc<dyn EnvResolver>,
    pub pruner: Arc<dyn BuildPruner>,
    pub cache_syncs: Vec<CacheSync>,
    pub additional_trusted_ca_path: Option<PathBuf>,
}

/// Reconciles builds against their executor pods.
pub struct BuildController {
    builds: Arc<dyn BuildLister>,
    build_configs: Arc<dyn BuildConfigLister>,
    pods: Arc<dyn PodLister>,
    secrets: Arc<dyn SecretLister>,
    pod_client: Arc<dyn PodClient>,
    config_map_client: Arc<dyn ConfigMapClient>,
    build_patcher: Arc<dyn BuildPatcher>,
    service_accounts: Arc<dyn ServiceAccountClient>,
    events: Arc<dyn EventSink>,
    pod_factory: Arc<dyn BuildPodFactory>,
    defaults: Arc<dyn PodMutator>,
    overrides: Arc<dyn PodMutator>,
    env_resolver: Arc<dyn EnvResolver>,
    pruner: Arc<dyn BuildPruner>,

    run_policies: Vec<Arc<dyn RunPolicy>>,
    resolver: ImageResolver,

    pub(crate) build_queue: Arc<RateLimitedQueue<String>>,
    pub(crate) build_config_queue: Arc<RateLimitedQueue<String>>,
    pub(crate) stream_triggers: Arc<TriggerIndex>,

    cache_syncs: Vec<CacheSync>,
    additional_trusted_ca_path: Option<PathBuf>,
    // Written once at run() entry, read-only afterwards.
    additional_trusted_ca: OnceLock<Option<String>>,
}

impl BuildController {
    pub fn new(params: BuildControllerParams) -> Arc<Self> {
        let stream_triggers = Arc::new(TriggerIndex::new());
        let resolver = ImageResolver::new(params.image_streams.clone(), stream_triggers.clone());
        let run_policies =
            default_run_policies(params.builds.clone(), params.build_patcher.clone());
        Arc::new(Self {
            builds: params.builds,
            build_configs: params.build_configs,
            pods: params.pods,
            secrets: params.secrets,
            pod_client: params.pod_client,
            config_map_client: params.config_map_client,
            build_patcher: params.build_patcher,
            service_accounts: params.service_accounts,
            events: params.events,
            pod_factory: params.pod_factory,
            defaults: params.defaults,
            overrides: params.overrides,
            env_resolver: params.env_resolver,
            pruner: params.pruner,
            run_policies,
            resolver,
            build_queue: RateLimitedQueue::new(),
            build_config_queue: RateLimitedQueue::new(),
            stream_triggers,
            cache_syncs: params.cache_syncs,
            additional_trusted_ca_path: params.additional_trusted_ca_path,
            additional_trusted_ca: OnceLock::new(),
        })
    }

    /// Run `workers` tasks per queue until `shutdown` fires. Blocks on the
    /// watch caches before any work starts.
    pub async fn run(
        self: Arc<Self>,
        workers: usize,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        self.load_additional_trusted_ca();

        for sync in &self.cache_syncs {
            if !sync.wait_synced().await {
                warn!(cache = sync.name(), "cache never became ready");
                return Err(OperatorError::CacheSyncFailed);
            }
        }

        info!(workers, "Starting build controller");

        let mut tasks = JoinSet::new();
        for _ in 0..workers {
            tasks.spawn(Arc::clone(&self).build_worker());
        }
        for _ in 0..workers {
            tasks.spawn(Arc::clone(&self).build_config_worker());
        }

        let build_queue = Arc::clone(&self.build_queue);
        let build_config_queue = Arc::clone(&self.build_config_queue);
        tasks.spawn(async move {
            // A closed sender also shuts the queues down.
            let _ = shutdown.changed().await;
            build_queue.shut_down();
            build_config_queue.shut_down();
        });

        while tasks.join_next().await.is_some() {}
        info!("Shutting down build controller");
        Ok(())
    }

    fn load_additional_trusted_ca(&self) {
        let data = match &self.additional_trusted_ca_path {
            Some(path) => match std::fs::read_to_string(path) {
                Ok(data) => Some(data),
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to read additional CA bundle"
                    );
                    None
                }
            },
            None => None,
        };
        let _ = self.additional_trusted_ca.set(data);
    }

    fn additional_trusted_ca(&self) -> Option<&str> {
        self.additional_trusted_ca
            .get()
            .and_then(|data| data.as_deref())
    }

    async fn build_worker(self: Arc<Self>) {
        while let Some(key) = self.build_queue.get().await {
            let result = self.sync_build(&key).await;
            self.build_queue.done(&key);
            self.handle_build_error(result, &key);
        }
    }

    /// Queue error policy: forget on success and on fatal errors, retry with
    /// backoff up to the cap otherwise.
    fn handle_build_error(&self, result: Result<()>, key: &String) {
        match result {
            Ok(()) => self.build_queue.forget(key),
            Err(err) if err.is_fatal() => {
                warn!(key = %key, error = %err, "will not retry fatal error");
                self.build_queue.forget(key);
            }
            Err(err) => {
                if self.build_queue.num_requeues(key) < MAX_RETRIES {
                    debug!(key = %key, error = %err, "retrying build");
                    self.build_queue.add_rate_limited(key.clone());
                } else {
                    warn!(key = %key, error = %err, "giving up on build");
                    self.build_queue.forget(key);
                }
            }
        }
    }

    async fn sync_build(&self, key: &str) -> Result<()> {
        let (namespace, name) = parse_key(key)?;
        match self.builds.get_build(namespace, name) {
            Some(build) => self.handle_build(&build).await,
            // Deleted between enqueue and dequeue; nothing to do.
            None => Ok(()),
        }
    }

    pub(crate) fn builds(&self) -> &dyn BuildLister {
        self.builds.as_ref()
    }

    pub(crate) fn build_configs(&self) -> &dyn BuildConfigLister {
        self.build_configs.as_ref()
    }

    pub(crate) fn enqueue_build(&self, build: &Build) {
        self.build_queue.add(object_key(build));
    }

    pub(crate) fn enqueue_build_config(&self, namespace: &str, name: &str) {
        self.build_config_queue.add(resource_key(namespace, name));
    }

    /// Image stream watch callback: wake every build waiting on the stream.
    pub(crate) fn image_stream_changed(&self, namespace: &str, name: &str) {
        for build_key in self.stream_triggers.pop(&resource_key(namespace, name)) {
            self.build_queue.add(build_key);
        }
    }

    /// Dispatch a build to the handler matching its current state and apply
    /// whatever update comes back, even when the handler also errored.
    pub(crate) async fn handle_build(&self, build: &Build) -> Result<()> {
        if build.spec.strategy.jenkins_pipeline_strategy.is_some() && build.is_complete() {
            if let Some(config) = build.config_name() {
                let namespace = build.namespace().unwrap_or_default();
                self.pruner.handle_build_pruning(&namespace, &config).await;
            }
        }

        if should_ignore(build) {
            return Ok(());
        }

        debug!(build = %build_desc(build), "handling build");

        let namespace = build.namespace().unwrap_or_default();
        let pod = self.pods.get_pod(&namespace, &build.pod_name());
        let pod = pod.as_deref();

        let (update, err) = if should_cancel(build) {
            self.cancel_build(build).await
        } else if build.phase() == BuildPhase::New {
            self.handle_new_build(build, pod).await
        } else if matches!(build.phase(), BuildPhase::Pending | BuildPhase::Running) {
            self.handle_active_build(build, pod).await
        } else if build.is_complete() {
            self.handle_completed_build(build, pod).await
        } else {
            (None, None)
        };

        let mut update_err = None;
        if let Some(update) = update {
            if !update.is_empty() {
                update_err = self.update_build(build, update, pod).await.err();
            }
        }
        if let Some(err) = err {
            return Err(err);
        }
        if let Some(err) = update_err {
            return Err(err);
        }
        Ok(())
    }

    /// Delete the executor pod (NotFound tolerated) and mark the build
    /// cancelled.
    async fn cancel_build(&self, build: &Build) -> HandlerOutcome {
        debug!(build = %build_desc(build), "cancelling build");
        let namespace = build.namespace().unwrap_or_default();
        let pod_name = build.pod_name();
        if let Err(err) = self.pod_client.delete_pod(&namespace, &pod_name).await {
            if !is_not_found(&err) {
                return (
                    None,
                    Some(OperatorError::Reconciliation(format!(
                        "could not delete build pod {}/{} to cancel build {}: {}",
                        namespace,
                        pod_name,
                        build_desc(build),
                        err
                    ))),
                );
            }
        }
        (
            Some(transition_to_phase(
                BuildPhase::Cancelled,
                Some(BuildStatusReason::CancelledBuild),
                None,
            )),
            None,
        )
    }

    /// Check policy and create the executor pod for a queued build.
    async fn handle_new_build(&self, build: &Build, pod: Option<&Pod>) -> HandlerOutcome {
        if let Some(pod) = pod {
            if has_owner_reference(pod, build) {
                // A pod we created in an earlier pass whose Pending
                // transition never got recorded. Falling through to the
                // active handler recovers the phase but loses the rest of
                // the update that pass meant to write; re-running pod
                // creation is worse because policy is not side-effect free.
                return self.handle_active_build(build, Some(pod)).await;
            }
            return (
                Some(transition_to_phase(
                    BuildPhase::Error,
                    Some(BuildStatusReason::BuildPodExists),
                    None,
                )),
                None,
            );
        }

        let Some(policy) = policy_for_build(build, &self.run_policies) else {
            return (
                None,
                Some(OperatorError::Reconciliation(format!(
                    "unable to determine build policy for {}",
                    build_desc(build)
                ))),
            );
        };

        match policy.is_runnable(build).await {
            Err(err) => (None, Some(err)),
            // Parked; a sibling's completion tickles the config queue.
            Ok(false) => (None, None),
            Ok(true) => self.create_build_pod(build).await,
        }
    }

    /// Resolve references and secrets, produce the pod spec, create the pod
    /// and its CA ConfigMap, and move the build to Pending.
    async fn create_build_pod(&self, build: &Build) -> HandlerOutcome {
        let mut update = BuildUpdate::default();
        // The lister cache owns the original; every mutation below happens
        // on this copy.
        let mut build = build.clone();
        let namespace = build.namespace().unwrap_or_default();

        if let Err(err) = self.resolver.resolve(&mut build, &mut update) {
            if err == crate::resolver::ResolveError::NoIntegratedRegistry {
                self.events
                    .event(
                        &build,
                        EventType::Warning,
                        "InvalidOutput",
                        "Error starting build: an image stream cannot be used as build output because the integrated container image registry is not configured".to_string(),
                    )
                    .await;
            }
            if err.awaits_stream_event() {
                // The build stays in New; the image stream watch wakes it.
                return (Some(update), None);
            }
            return (Some(update), Some(err.into()));
        }

        // Push secret: only resolved when the user did not name one.
        let mut push_secret = build.spec.output.push_secret.clone();
        let output_name = build
            .spec
            .output
            .to
            .as_ref()
            .and_then(|to| to.name.clone())
            .unwrap_or_default();
        if push_secret.is_none() && !output_name.is_empty() {
            match self.resolve_image_secret(&build, Some(&output_name)).await {
                Ok(secret) => push_secret = Some(secret),
                Err(err) => {
                    update.set_reason(BuildStatusReason::CannotRetrieveServiceAccount);
                    update.set_message(
                        BuildStatusReason::CannotRetrieveServiceAccount.default_message(),
                    );
                    return (Some(update), Some(err));
                }
            }
        }
        build.spec.output.push_secret = push_secret.clone();

        // Pull secret for the strategy base image, unless explicit.
        let (explicit_pull_secret, pull_image) = strategy_pull_source(&build);
        if explicit_pull_secret.is_none() {
            match self
                .resolve_image_secret(&build, pull_image.as_deref())
                .await
            {
                Ok(secret) => set_strategy_pull_secret(&mut build, secret),
                Err(err) => {
                    update.set_reason(BuildStatusReason::CannotRetrieveServiceAccount);
                    update.set_message(
                        BuildStatusReason::CannotRetrieveServiceAccount.default_message(),
                    );
                    return (Some(update), Some(err));
                }
            }
        }

        // Pull secrets for source input images.
        for index in 0..build.spec.source.images.len() {
            if build.spec.source.images[index].pull_secret.is_some() {
                continue;
            }
            let from_name = build.spec.source.images[index].from.name.clone();
            match self
                .resolve_image_secret(&build, from_name.as_deref())
                .await
            {
                Ok(secret) => build.spec.source.images[index].pull_secret = Some(secret),
                Err(err) => {
                    update.set_reason(BuildStatusReason::CannotRetrieveServiceAccount);
                    update.set_message(
                        BuildStatusReason::CannotRetrieveServiceAccount.default_message(),
                    );
                    return (Some(update), Some(err));
                }
            }
        }

        if let Some(custom) = build.spec.strategy.custom_strategy.as_mut() {
            let image = custom.from.name.clone().unwrap_or_default();
            update_custom_image_env(custom, &image);
        }

        let include_additional_ca = self.additional_trusted_ca().is_some();
        let build_pod = match self.create_pod_spec(&mut build, include_additional_ca).await {
            Ok(pod) => pod,
            Err(OperatorError::EnvVarResolution(detail)) => {
                let message = format!(
                    "{}, {}",
                    BuildStatusReason::UnresolvableEnvironmentVariable.default_message(),
                    detail
                );
                return (
                    Some(transition_to_phase(
                        BuildPhase::Error,
                        Some(BuildStatusReason::UnresolvableEnvironmentVariable),
                        Some(message),
                    )),
                    None,
                );
            }
            Err(err) => {
                // A bad pod spec is not fixed by retrying; the build stays
                // in New carrying the reason. A controller upgrade is what
                // usually clears this.
                warn!(build = %build_desc(&build), error = %err, "failed to create pod spec");
                update.set_reason(BuildStatusReason::CannotCreateBuildPodSpec);
                update.set_message(BuildStatusReason::CannotCreateBuildPodSpec.default_message());
                return (Some(update), None);
            }
        };

        let pod_name = build_pod.name_any();
        debug!(build = %build_desc(&build), pod = %pod_name, "creating build pod");
        match self.pod_client.create_pod(&namespace, &build_pod).await {
            Ok(created) => {
                if let Some(err) = self
                    .create_build_ca_config_map(&build, &created, &mut update)
                    .await
                {
                    return (Some(update), Some(err));
                }
            }
            Err(err) if is_already_exists(&err) => {
                self.events
                    .event(
                        &build,
                        EventType::Warning,
                        "FailedCreate",
                        format!("Pod already exists: {}/{}", namespace, pod_name),
                    )
                    .await;
                let existing = match self.pod_client.get_pod(&namespace, &pod_name).await {
                    Ok(pod) => pod,
                    Err(err) => return (None, Some(err.into())),
                };
                if !has_owner_reference(&existing, &build) {
                    debug!(build = %build_desc(&build), pod = %pod_name, "existing pod belongs to someone else");
                    return (
                        Some(transition_to_phase(
                            BuildPhase::Error,
                            Some(BuildStatusReason::BuildPodExists),
                            None,
                        )),
                        None,
                    );
                }
                match self.find_build_ca_config_map(&build, &existing).await {
                    Err(err) => {
                        return (
                            Some(update),
                            Some(OperatorError::Reconciliation(format!(
                                "could not find certificate authority for build: {}",
                                err
                            ))),
                        )
                    }
                    Ok(false) => {
                        if let Some(err) = self
                            .create_build_ca_config_map(&build, &existing, &mut update)
                            .await
                        {
                            return (Some(update), Some(err));
                        }
                    }
                    Ok(true) => {}
                }
            }
            Err(err) => {
                self.events
                    .event(
                        &build,
                        EventType::Warning,
                        "FailedCreate",
                        format!("Error creating build pod: {}", err),
                    )
                    .await;
                update.set_reason(BuildStatusReason::CannotCreateBuildPod);
                update.set_message(BuildStatusReason::CannotCreateBuildPod.default_message());
                return (
                    Some(update),
                    Some(OperatorError::Reconciliation(format!(
                        "failed to create build pod: {}",
                        err
                    ))),
                );
            }
        }

        let mut update = transition_to_phase(BuildPhase::Pending, None, None);
        if let Some(secret) = push_secret {
            update.set_push_secret(secret);
        }
        update.set_pod_name_annotation(pod_name);
        if !output_name.is_empty() {
            if let Some(resolved) = build.spec.output.to.as_ref().and_then(|to| to.name.clone()) {
                update.set_output_ref(resolved);
            }
        }
        (Some(update), None)
    }

    /// Produce the pod spec via the strategy factory and run it through
    /// defaults, overrides, and the env resolver.
    async fn create_pod_spec(&self, build: &mut Build, include_additional_ca: bool) -> Result<Pod> {
        let namespace = build.namespace().unwrap_or_default();
        let name = build.name_any();

        if let Some(output_name) = build.spec.output.to.as_ref().and_then(|to| to.name.clone()) {
            build
                .status
                .get_or_insert_with(Default::default)
                .output_docker_image_reference = Some(output_name);
        }
        // The pod posts status updates against this object; stale reasons
        // must not be re-asserted by it.
        if let Some(status) = build.status.as_mut() {
            status.reason = None;
            status.message = None;
        }

        let mut pod = self
            .pod_factory
            .create_build_pod(build, include_additional_ca)
            .map_err(|err| match err {
                OperatorError::FatalPodSpec(detail) => OperatorError::FatalPodSpec(format!(
                    "failed to create a build pod spec for build {}/{}: {}",
                    namespace, name, detail
                )),
                other => OperatorError::PodSpec(format!(
                    "failed to create a build pod spec for build {}/{}: {}",
                    namespace, name, other
                )),
            })?;

        self.defaults.apply(&mut pod).map_err(|err| {
            OperatorError::Reconciliation(format!(
                "failed to apply build defaults for build {}/{}: {}",
                namespace, name, err
            ))
        })?;
        self.overrides.apply(&mut pod).map_err(|err| {
            OperatorError::Reconciliation(format!(
                "failed to apply build overrides for build {}/{}: {}",
                namespace, name, err
            ))
        })?;
        self.env_resolver.resolve_value_from(&mut pod).await?;
        Ok(pod)
    }

    /// Find the push/pull secret for `image_name` among the build's service
    /// account secrets, falling back to the first docker secret. No docker
    /// secret at all is retriable; they are created shortly after the
    /// service account.
    async fn resolve_image_secret(
        &self,
        build: &Build,
        image_name: Option<&str>,
    ) -> Result<LocalObjectReference> {
        let namespace = build.namespace().unwrap_or_default();
        let service_account = build.service_account().to_string();
        let sa = self
            .service_accounts
            .get_service_account(&namespace, &service_account)
            .await
            .map_err(|err| {
                OperatorError::Reconciliation(format!(
                    "error getting push/pull secrets for service account {}/{}: {}",
                    namespace, service_account, err
                ))
            })?;

        let mut secrets = Vec::new();
        for reference in sa.secrets.unwrap_or_default() {
            if let Some(name) = reference.name {
                if let Some(secret) = self.secrets.get_secret(&namespace, &name) {
                    secrets.push(secret);
                }
            }
        }

        if let Some(image) = image_name.filter(|image| !image.is_empty()) {
            if let Some(secret) = find_docker_secret(&secrets, image) {
                return Ok(secret);
            }
        }

        debug!(
            build = %build_desc(build),
            "no secret matches the referenced image, using the service account default"
        );
        for secret in &secrets {
            if is_docker_secret(secret) {
                return Ok(LocalObjectReference {
                    name: secret.name_any(),
                });
            }
        }
        Err(OperatorError::MissingDockerSecret {
            namespace,
            service_account,
        })
    }

    /// Map the executor pod state onto a pending or running build.
    async fn handle_active_build(&self, build: &Build, pod: Option<&Pod>) -> HandlerOutcome {
        let namespace = build.namespace().unwrap_or_default();
        let fetched;
        let pod = match pod {
            Some(pod) => pod,
            None => match self.find_missing_pod(build).await {
                Some(found) => {
                    fetched = found;
                    &fetched
                }
                None => {
                    debug!(build = %build_desc(build), "build pod is gone");
                    return (
                        Some(transition_to_phase(
                            BuildPhase::Error,
                            Some(BuildStatusReason::BuildPodDeleted),
                            None,
                        )),
                        None,
                    );
                }
            },
        };

        let pod_status = pod.status.clone().unwrap_or_default();
        let mut pod_phase = pod_status.phase.clone().unwrap_or_default();

        // Pods report Pending until every init container finished, but the
        // build is running as soon as the clone container started.
        if matches!(build.phase(), BuildPhase::Pending | BuildPhase::New) {
            for init in pod_status.init_container_statuses.iter().flatten() {
                if init.name == GIT_CLONE_CONTAINER
                    && init.state.as_ref().is_some_and(|s| s.running.is_some())
                {
                    pod_phase = "Running".to_string();
                }
            }
        }

        let update = match pod_phase.as_str() {
            "Pending" => {
                let mut update = if build.phase() != BuildPhase::Pending {
                    Some(transition_to_phase(BuildPhase::Pending, None, None))
                } else {
                    None
                };
                if let Some(secret) = &build.spec.output.push_secret {
                    let already_flagged = build.status.as_ref().and_then(|s| s.reason)
                        == Some(BuildStatusReason::MissingPushSecret);
                    let secret_name = secret.name.clone();
                    if !already_flagged
                        && !secret_name.is_empty()
                        && self.secrets.get_secret(&namespace, &secret_name).is_none()
                    {
                        update = Some(transition_to_phase(
                            BuildPhase::Pending,
                            Some(BuildStatusReason::MissingPushSecret),
                            None,
                        ));
                    }
                }
                update
            }
            "Running" => {
                if build.phase() != BuildPhase::Running {
                    let mut update = transition_to_phase(BuildPhase::Running, None, None);
                    if let Some(start) = &pod_status.start_time {
                        update.set_start_time(start.clone());
                    }
                    Some(update)
                } else {
                    None
                }
            }
            "Succeeded" => {
                let mut update = if build.phase() != BuildPhase::Complete {
                    Some(transition_to_phase(BuildPhase::Complete, None, None))
                } else {
                    None
                };
                let container_statuses = pod_status.container_statuses.as_deref().unwrap_or(&[]);
                if container_statuses.is_empty() {
                    // A succeeded pod without container statuses means
                    // something went terribly wrong.
                    update = Some(transition_to_phase(
                        BuildPhase::Error,
                        Some(BuildStatusReason::NoBuildContainerStatus),
                        None,
                    ));
                } else {
                    for info in container_statuses {
                        let exited_nonzero = info
                            .state
                            .as_ref()
                            .and_then(|state| state.terminated.as_ref())
                            .is_some_and(|terminated| terminated.exit_code != 0);
                        if exited_nonzero {
                            update = Some(transition_to_phase(
                                BuildPhase::Error,
                                Some(BuildStatusReason::FailedContainer),
                                None,
                            ));
                            break;
                        }
                    }
                }
                update
            }
            "Failed" => {
                if is_oom_killed(Some(pod)) {
                    Some(transition_to_phase(
                        BuildPhase::Failed,
                        Some(BuildStatusReason::OutOfMemoryKilled),
                        None,
                    ))
                } else if build.phase() != BuildPhase::Failed {
                    if pod.metadata.deletion_timestamp.is_some() {
                        // The pod is on its way out; failure details would
                        // be lost with it.
                        Some(transition_to_phase(
                            BuildPhase::Error,
                            Some(BuildStatusReason::BuildPodDeleted),
                            None,
                        ))
                    } else {
                        Some(transition_to_phase(
                            BuildPhase::Failed,
                            Some(BuildStatusReason::GenericBuildFailed),
                            None,
                        ))
                    }
                } else {
                    None
                }
            }
            _ => None,
        };
        (update, None)
    }

    /// Repair completion metadata on a build that is already terminal.
    async fn handle_completed_build(&self, build: &Build, pod: Option<&Pod>) -> HandlerOutcome {
        let mut update = BuildUpdate::default();
        if is_oom_killed(pod) {
            update = transition_to_phase(
                BuildPhase::Failed,
                Some(BuildStatusReason::OutOfMemoryKilled),
                None,
            );
        }
        set_build_completion_data(build, pod, &mut update);
        (Some(update), None)
    }

    /// One more direct fetch before declaring the pod gone; the watch cache
    /// can lag the API server.
    async fn find_missing_pod(&self, build: &Build) -> Option<Pod> {
        let namespace = build.namespace().unwrap_or_default();
        match self.pod_client.get_pod(&namespace, &build.pod_name()).await {
            Ok(pod) => {
                debug!(build = %build_desc(build), "found missing pod with a direct fetch");
                Some(pod)
            }
            Err(_) => None,
        }
    }

    /// The single place a build is mutated: validates the transition, fills
    /// completion metadata, patches, then emits events and pokes the config
    /// queue for terminal phases.
    async fn update_build(
        &self,
        build: &Build,
        mut update: BuildUpdate,
        pod: Option<&Pod>,
    ) -> Result<()> {
        let mut transition_to = None;
        match update.phase {
            Some(phase) if phase != build.phase() => transition_to = Some(phase),
            _ => {
                if build.phase() == BuildPhase::Failed && update.completion_time.is_some() {
                    // The pod posts Failed through the status endpoint
                    // itself; the first completion-time write is what
                    // triggers the completion side effects exactly once.
                    update.set_phase(BuildPhase::Failed);
                    transition_to = Some(BuildPhase::Failed);
                }
            }
        }

        if let Some(to) = transition_to {
            if !is_valid_transition(build.phase(), to) {
                return Err(OperatorError::InvalidTransition {
                    namespace: build.namespace().unwrap_or_default(),
                    name: build.name_any(),
                    from: build.phase(),
                    to,
                });
            }
            if to.is_terminal() {
                set_build_completion_data(build, pod, &mut update);
            }
            info!(
                build = %build_desc(build),
                phase = %to,
                reason = ?update.reason.flatten(),
                "updating build"
            );
        }

        // Record the pod name if it never made it onto the build.
        if update.pod_name_annotation.is_none() && !build.has_pod_name_annotation() {
            if let Some(pod) = pod {
                update.set_pod_name_annotation(pod.name_any());
            }
        }

        let patched = self.patch_build(build, &update).await?;

        if let Some(to) = transition_to {
            let namespace = patched.namespace().unwrap_or_default();
            let name = patched.name_any();
            match to {
                BuildPhase::Running => {
                    self.events
                        .event(
                            &patched,
                            EventType::Normal,
                            BUILD_STARTED_EVENT,
                            format!("Build {}/{} is now running", namespace, name),
                        )
                        .await;
                }
                BuildPhase::Cancelled => {
                    self.events
                        .event(
                            &patched,
                            EventType::Normal,
                            BUILD_CANCELLED_EVENT,
                            format!("Build {}/{} has been cancelled", namespace, name),
                        )
                        .await;
                }
                BuildPhase::Complete => {
                    self.events
                        .event(
                            &patched,
                            EventType::Normal,
                            BUILD_COMPLETED_EVENT,
                            format!("Build {}/{} completed successfully", namespace, name),
                        )
                        .await;
                }
                BuildPhase::Error | BuildPhase::Failed => {
                    self.events
                        .event(
                            &patched,
                            EventType::Normal,
                            BUILD_FAILED_EVENT,
                            format!("Build {}/{} failed", namespace, name),
                        )
                        .await;
                }
                _ => {}
            }
            if to.is_terminal() {
                self.handle_build_completion(&patched).await;
            }
        }
        Ok(())
    }

    /// A finished build frees its config: re-evaluate policy and prune.
    async fn handle_build_completion(&self, build: &Build) {
        let Some(config) = build.config_name() else {
            return;
        };
        let namespace = build.namespace().unwrap_or_default();
        self.enqueue_build_config(&namespace, &config);
        self.pruner.handle_build_pruning(&namespace, &config).await;
    }

    /// Apply the update to a copy and send the difference. An empty diff
    /// never reaches the API server.
    async fn patch_build(&self, build: &Build, update: &BuildUpdate) -> Result<Build> {
        let (desired, patch) = crate::update::build_patch(build, update)?;
        if crate::update::patch_is_empty(&patch) {
            debug!(build = %build_desc(build), "no change to patch");
            return Ok(desired);
        }
        debug!(build = %build_desc(build), patch = %patch, "patching build");
        let namespace = build.namespace().unwrap_or_default();
        self.build_patcher
            .patch_build(&namespace, &build.name_any(), &patch)
            .await
            .map_err(Into::into)
    }

    /// Create the ConfigMap carrying trusted CA material, owned by the pod.
    async fn create_build_ca_config_map(
        &self,
        build: &Build,
        build_pod: &Pod,
        update: &mut BuildUpdate,
    ) -> Option<OperatorError> {
        let spec = self.build_ca_config_map_spec(build, build_pod);
        let namespace = build.namespace().unwrap_or_default();
        match self.config_map_client.create_config_map(&namespace, &spec).await {
            Ok(config_map) => {
                debug!(
                    build = %build_desc(build),
                    config_map = %config_map.name_any(),
                    "created certificate authority configMap"
                );
                None
            }
            Err(err) => {
                self.events
                    .event(
                        build,
                        EventType::Warning,
                        "FailedCreate",
                        format!(
                            "Error creating build certificate authority configMap: {}",
                            err
                        ),
                    )
                    .await;
                update.set_reason(BuildStatusReason::CannotCreateCAConfigMap);
                update.set_message(BuildStatusReason::CannotCreateCAConfigMap.default_message());
                Some(OperatorError::Reconciliation(format!(
                    "failed to create build certificate authority configMap: {}",
                    err
                )))
            }
        }
    }

    fn build_ca_config_map_spec(&self, build: &Build, build_pod: &Pod) -> ConfigMap {
        let mut annotations = BTreeMap::new();
        annotations.insert(CA_INJECT_ANNOTATION.to_string(), "true".to_string());
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(build.ca_config_map_name()),
                annotations: Some(annotations),
                owner_references: Some(vec![pod_owner_reference(build_pod)]),
                ..Default::default()
            },
            data: self.additional_trusted_ca().map(|ca| {
                let mut data = BTreeMap::new();
                data.insert(ADDITIONAL_TRUSTED_CA_KEY.to_string(), ca.to_string());
                data
            }),
            ..Default::default()
        }
    }

    /// Whether the CA ConfigMap exists and is owned by the build pod. A map
    /// owned by anything else is an error, not ours to adopt.
    async fn find_build_ca_config_map(&self, build: &Build, build_pod: &Pod) -> Result<bool> {
        let namespace = build.namespace().unwrap_or_default();
        let name = build.ca_config_map_name();
        let config_map = match self.config_map_client.get_config_map(&namespace, &name).await {
            Ok(config_map) => config_map,
            Err(err) if is_not_found(&err) => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        let owners = config_map.owner_references();
        if !has_pod_owner_reference(build_pod, owners) {
            return Err(OperatorError::Reconciliation(format!(
                "build CA configMap {} is not owned by build pod {}",
                name,
                build_pod.name_any()
            )));
        }
        Ok(true)
    }
}

/// Builds the controller should not touch: pipeline builds, and terminal
/// builds whose completion metadata is already in place. Complete builds
/// missing a completion time, and failed builds missing a completion time or
/// log snippet, still get one repair pass.
fn should_ignore(build: &Build) -> bool {
    if build.spec.strategy.jenkins_pipeline_strategy.is_some() {
        debug!(build = %build_desc(build), "ignoring pipeline build");
        return true;
    }
    if build.is_complete() {
        let completion = build
            .status
            .as_ref()
            .and_then(|s| s.completion_timestamp.as_ref());
        match build.phase() {
            BuildPhase::Complete => {
                if completion.is_none() {
                    return false;
                }
            }
            BuildPhase::Failed => {
                let snippet = build
                    .status
                    .as_ref()
                    .and_then(|s| s.log_snippet.as_deref())
                    .unwrap_or_default();
                if completion.is_none() || snippet.is_empty() {
                    return false;
                }
            }
            _ => {}
        }
        debug!(build = %build_desc(build), "ignoring completed build");
        return true;
    }
    false
}

/// An active build whose cancellation flag is set.
fn should_cancel(build: &Build) -> bool {
    !build.is_complete() && build.status.as_ref().is_some_and(|s| s.cancelled)
}

/// Legal phase transitions. Staying put is always legal; terminal phases are
/// sinks; a build never moves backwards out of Pending or Running.
fn is_valid_transition(from: BuildPhase, to: BuildPhase) -> bool {
    if from == to {
        return true;
    }
    match from {
        phase if phase.is_terminal() => false,
        BuildPhase::Pending => to != BuildPhase::New,
        BuildPhase::Running => !matches!(to, BuildPhase::New | BuildPhase::Pending),
        _ => true,
    }
}

/// Whether the pod or any of its containers was OOM killed.
fn is_oom_killed(pod: Option<&Pod>) -> bool {
    let Some(status) = pod.and_then(|p| p.status.as_ref()) else {
        return false;
    };
    if status.reason.as_deref() == Some("OOMKilled") {
        return true;
    }
    let containers = status
        .init_container_statuses
        .iter()
        .flatten()
        .chain(status.container_statuses.iter().flatten());
    for container in containers {
        let oom = container
            .state
            .as_ref()
            .and_then(|state| state.terminated.as_ref())
            .is_some_and(|terminated| terminated.reason.as_deref() == Some("OOMKilled"));
        if oom {
            return true;
        }
    }
    false
}

/// Fill start/completion/duration (once, at second precision) and, for
/// failed builds, the trailing log snippet from the first container's
/// termination message.
fn set_build_completion_data(build: &Build, pod: Option<&Pod>, update: &mut BuildUpdate) {
    let now = Utc::now();

    let start = match build.status.as_ref().and_then(|s| s.start_timestamp.clone()) {
        Some(start) => start,
        None => {
            let start = pod
                .and_then(|p| p.status.as_ref())
                .and_then(|s| s.start_time.clone())
                .unwrap_or(Time(now));
            update.set_start_time(start.clone());
            start
        }
    };

    if build
        .status
        .as_ref()
        .and_then(|s| s.completion_timestamp.as_ref())
        .is_none()
    {
        update.set_completion_time(Time(now));
        let start_second = start.0.with_nanosecond(0).unwrap_or(start.0);
        let end_second = now.with_nanosecond(0).unwrap_or(now);
        update.set_duration_seconds((end_second - start_second).num_seconds());
    }

    let failing =
        build.phase() == BuildPhase::Failed || update.phase == Some(BuildPhase::Failed);
    let has_snippet = build
        .status
        .as_ref()
        .and_then(|s| s.log_snippet.as_deref())
        .is_some_and(|snippet| !snippet.is_empty());
    if failing && !has_snippet {
        let message = pod
            .and_then(|p| p.status.as_ref())
            .and_then(|s| s.container_statuses.as_ref())
            .and_then(|statuses| statuses.first())
            .and_then(|container| container.state.as_ref())
            .and_then(|state| state.terminated.as_ref())
            .and_then(|terminated| terminated.message.clone())
            .unwrap_or_default();
        if !message.is_empty() {
            update.set_log_snippet(log_snippet_from_message(&message));
        }
    }
}

/// Keep the trailing lines of a termination message, eliding long lines
/// around their middle.
fn log_snippet_from_message(message: &str) -> String {
    let trimmed = message.trim_end_matches('\n');
    let lines: Vec<&str> = trimmed.split('\n').collect();
    let keep = lines.len().min(MAX_EXCERPT_LINES);
    lines[lines.len() - keep..]
        .iter()
        .map(|line| elide_line(line))
        .collect::<Vec<_>>()
        .join("\n")
}

fn elide_line(line: &str) -> String {
    let length = line.chars().count();
    if length <= 120 {
        return line.to_string();
    }
    let head: String = line.chars().take(58).collect();
    let tail: String = line.chars().skip(length - 59).collect();
    format!("{}...{}", head, tail)
}

/// The strategy's explicit pull secret and base image name, if any.
fn strategy_pull_source(build: &Build) -> (Option<LocalObjectReference>, Option<String>) {
    let strategy = &build.spec.strategy;
    if let Some(source) = &strategy.source_strategy {
        (source.pull_secret.clone(), source.from.name.clone())
    } else if let Some(docker) = &strategy.docker_strategy {
        (
            docker.pull_secret.clone(),
            docker.from.as_ref().and_then(|from| from.name.clone()),
        )
    } else if let Some(custom) = &strategy.custom_strategy {
        (custom.pull_secret.clone(), custom.from.name.clone())
    } else {
        (None, None)
    }
}

fn set_strategy_pull_secret(build: &mut Build, secret: LocalObjectReference) {
    let strategy = &mut build.spec.strategy;
    if let Some(source) = strategy.source_strategy.as_mut() {
        source.pull_secret = Some(secret);
    } else if let Some(docker) = strategy.docker_strategy.as_mut() {
        docker.pull_secret = Some(secret);
    } else if let Some(custom) = strategy.custom_strategy.as_mut() {
        custom.pull_secret = Some(secret);
    }
}

fn is_docker_secret(secret: &Secret) -> bool {
    matches!(
        secret.type_.as_deref(),
        Some("kubernetes.io/dockercfg") | Some("kubernetes.io/dockerconfigjson")
    )
}

/// Match the image's registry host against the auth entries of the service
/// account's docker secrets.
fn find_docker_secret(secrets: &[Arc<Secret>], image: &str) -> Option<LocalObjectReference> {
    let registry = DockerImageReference::parse(image).ok()?.registry?;
    for secret in secrets {
        if !is_docker_secret(secret) {
            continue;
        }
        let Some(data) = &secret.data else { continue };
        for (key, value) in data {
            let Ok(parsed) = serde_json::from_slice::<serde_json::Value>(&value.0) else {
                continue;
            };
            let hosts: Vec<String> = match key.as_str() {
                ".dockercfg" => parsed
                    .as_object()
                    .map(|map| map.keys().cloned().collect())
                    .unwrap_or_default(),
                ".dockerconfigjson" => parsed
                    .get("auths")
                    .and_then(|auths| auths.as_object())
                    .map(|map| map.keys().cloned().collect())
                    .unwrap_or_default(),
                _ => continue,
            };
            if hosts.iter().any(|host| host.contains(&registry)) {
                return Some(LocalObjectReference {
                    name: secret.name_any(),
                });
            }
        }
    }
    None
}

/// `namespace/name (Phase)`, for errors and logging.
fn build_desc(build: &Build) -> String {
    format!(
        "{}/{} ({})",
        build.namespace().unwrap_or_default(),
        build.name_any(),
        build.phase()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::fake::FakeCluster;
    use crate::crd::{
        BuildSpec, BuildStatus, BuildStrategy, DockerBuildStrategy, ImageStream, ImageStreamSpec,
        ImageStreamStatus, JenkinsPipelineBuildStrategy, BUILD_CONFIG_LABEL,
        BUILD_NUMBER_ANNOTATION, BUILD_POD_NAME_ANNOTATION,
    };
    use crate::strategy::{ExecutorPodFactory, NoopBuildPruner, NoopEnvResolver, NoopPodMutator};
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateRunning, ContainerStateTerminated, ContainerStatus,
        ObjectReference, PodStatus, ServiceAccount,
    };
    use std::collections::BTreeMap;

    fn controller(cluster: &Arc<FakeCluster>) -> Arc<BuildController> {
        BuildController::new(BuildControllerParams {
            builds: cluster.clone(),
            build_configs: cluster.clone(),
            pods: cluster.clone(),
            secrets: cluster.clone(),
            image_streams: cluster.clone(),
            pod_client: cluster.clone(),
            config_map_client: cluster.clone(),
            build_patcher: cluster.clone(),
            service_accounts: cluster.clone(),
            events: cluster.clone(),
            pod_factory: Arc::new(ExecutorPodFactory),
            defaults: Arc::new(NoopPodMutator),
            overrides: Arc::new(NoopPodMutator),
            env_resolver: Arc::new(NoopEnvResolver),
            pruner: Arc::new(NoopBuildPruner),
            cache_syncs: Vec::new(),
            additional_trusted_ca_path: None,
        })
    }

    fn seed_builder_service_account(cluster: &FakeCluster) {
        cluster.put_service_account(ServiceAccount {
            metadata: ObjectMeta {
                name: Some("builder".into()),
                namespace: Some("ns1".into()),
                ..Default::default()
            },
            secrets: Some(vec![ObjectReference {
                name: Some("builder-dockercfg".into()),
                ..Default::default()
            }]),
            ..Default::default()
        });
        cluster.put_secret(Secret {
            metadata: ObjectMeta {
                name: Some("builder-dockercfg".into()),
                namespace: Some("ns1".into()),
                ..Default::default()
            },
            type_: Some("kubernetes.io/dockercfg".into()),
            ..Default::default()
        });
    }

    fn docker_build(name: &str, phase: BuildPhase) -> Build {
        Build {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("ns1".into()),
                uid: Some(format!("uid-{}", name)),
                ..Default::default()
            },
            spec: BuildSpec {
                strategy: BuildStrategy {
                    docker_strategy: Some(DockerBuildStrategy {
                        from: Some(ObjectReference {
                            kind: Some("DockerImage".into()),
                            name: Some("quay.io/ns1/base:latest".into()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                output: crate::crd::BuildOutput {
                    to: Some(ObjectReference {
                        kind: Some("ImageStreamTag".into()),
                        name: Some("is:latest".into()),
                        ..Default::default()
                    }),
                    push_secret: None,
                },
                ..Default::default()
            },
            status: Some(BuildStatus {
                phase,
                ..Default::default()
            }),
        }
    }

    fn image_stream(repository: &str) -> ImageStream {
        ImageStream {
            metadata: ObjectMeta {
                name: Some("is".into()),
                namespace: Some("ns1".into()),
                ..Default::default()
            },
            spec: ImageStreamSpec::default(),
            status: Some(ImageStreamStatus {
                docker_image_repository: repository.into(),
                tags: Vec::new(),
            }),
        }
    }

    fn pod_for(build: &Build, phase: &str) -> Pod {
        let mut annotations = BTreeMap::new();
        annotations.insert(crate::crd::BUILD_NAME_ANNOTATION.to_string(), build.name_any());
        Pod {
            metadata: ObjectMeta {
                name: Some(build.pod_name()),
                namespace: build.namespace(),
                uid: Some(format!("pod-uid-{}", build.name_any())),
                annotations: Some(annotations),
                owner_references: Some(vec![crate::strategy::build_owner_reference(build)]),
                ..Default::default()
            },
            spec: None,
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
        }
    }

    fn terminated_container(exit_code: i32, reason: Option<&str>, message: Option<&str>) -> ContainerStatus {
        ContainerStatus {
            name: "build".into(),
            state: Some(ContainerState {
                terminated: Some(ContainerStateTerminated {
                    exit_code,
                    reason: reason.map(String::from),
                    message: message.map(String::from),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    // Scenario: a new build with a resolvable output stream gets a pod, a CA
    // configMap, and moves to Pending.
    #[tokio::test]
    async fn test_new_build_happy_path() {
        let cluster = FakeCluster::new();
        seed_builder_service_account(&cluster);
        cluster.put_image_stream(image_stream("registry/ns1/is"));
        let build = docker_build("b1", BuildPhase::New);
        cluster.put_build(build.clone());

        controller(&cluster).handle_build(&build).await.unwrap();

        let created = cluster.created_pods.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].name_any(), "b1-build");
        assert!(has_owner_reference(&created[0], &build));
        drop(created);

        let maps = cluster.created_config_maps.lock().unwrap();
        assert_eq!(maps.len(), 1);
        assert_eq!(maps[0].name_any(), "b1-ca");
        let pod = cluster.pod("ns1", "b1-build").unwrap();
        assert!(has_pod_owner_reference(&pod, maps[0].owner_references()));
        assert_eq!(
            maps[0].annotations().get(CA_INJECT_ANNOTATION).map(String::as_str),
            Some("true")
        );
        drop(maps);

        let patched = cluster.build("ns1", "b1").unwrap();
        let status = patched.status.as_ref().unwrap();
        assert_eq!(status.phase, BuildPhase::Pending);
        assert_eq!(
            status.output_docker_image_reference.as_deref(),
            Some("registry/ns1/is:latest")
        );
        assert_eq!(
            patched.annotations().get(BUILD_POD_NAME_ANNOTATION).map(String::as_str),
            Some("b1-build")
        );
        assert!(patched.spec.output.push_secret.is_some());
    }

    // Scenario: the output stream has no repository yet; the build parks in
    // New with a warning event and wakes up via the trigger index.
    #[tokio::test]
    async fn test_registry_not_configured_parks_and_wakes() {
        let cluster = FakeCluster::new();
        seed_builder_service_account(&cluster);
        cluster.put_image_stream(image_stream(""));
        let build = docker_build("b1", BuildPhase::New);
        cluster.put_build(build.clone());

        let controller = controller(&cluster);
        controller.handle_build(&build).await.unwrap();

        assert!(cluster.created_pods.lock().unwrap().is_empty());
        let parked = cluster.build("ns1", "b1").unwrap();
        let status = parked.status.as_ref().unwrap();
        assert_eq!(status.phase, BuildPhase::New);
        assert_eq!(status.reason, Some(BuildStatusReason::InvalidOutputReference));
        assert!(cluster.event_reasons().contains(&"InvalidOutput".to_string()));

        // The registry shows up; the stream event wakes exactly this build.
        cluster.put_image_stream(image_stream("registry/ns1/is"));
        controller.image_stream_changed("ns1", "is");
        assert_eq!(controller.build_queue.get().await.as_deref(), Some("ns1/b1"));
        controller.build_queue.done(&"ns1/b1".to_string());

        let parked = cluster.build("ns1", "b1").unwrap();
        controller.handle_build(&parked).await.unwrap();
        assert_eq!(cluster.created_pods.lock().unwrap().len(), 1);
        let woken = cluster.build("ns1", "b1").unwrap();
        assert_eq!(woken.status.as_ref().unwrap().phase, BuildPhase::Pending);
    }

    // Scenario: a pod with the build's name but no owner reference is a
    // collision; the build goes to Error.
    #[tokio::test]
    async fn test_foreign_pod_collision() {
        let cluster = FakeCluster::new();
        let build = docker_build("b2", BuildPhase::New);
        let mut foreign = pod_for(&build, "Running");
        foreign.metadata.owner_references = None;
        cluster.put_pod(foreign);
        cluster.put_build(build.clone());

        controller(&cluster).handle_build(&build).await.unwrap();

        let status = cluster.build("ns1", "b2").unwrap().status.unwrap();
        assert_eq!(status.phase, BuildPhase::Error);
        assert_eq!(status.reason, Some(BuildStatusReason::BuildPodExists));
    }

    // Scenario: cancellation mid-run deletes the pod and finishes the build.
    #[tokio::test]
    async fn test_cancellation_mid_run() {
        let cluster = FakeCluster::new();
        let mut build = docker_build("b1", BuildPhase::Running);
        build.metadata.labels = Some({
            let mut labels = BTreeMap::new();
            labels.insert(BUILD_CONFIG_LABEL.to_string(), "bc".to_string());
            labels
        });
        build.status.as_mut().unwrap().cancelled = true;
        build.status.as_mut().unwrap().start_timestamp = Some(Time(Utc::now()));
        cluster.put_pod(pod_for(&build, "Running"));
        cluster.put_build(build.clone());

        let controller = controller(&cluster);
        controller.handle_build(&build).await.unwrap();

        assert_eq!(
            cluster.deleted_pods.lock().unwrap().clone(),
            vec!["ns1/b1-build".to_string()]
        );
        let status = cluster.build("ns1", "b1").unwrap().status.unwrap();
        assert_eq!(status.phase, BuildPhase::Cancelled);
        assert_eq!(status.reason, Some(BuildStatusReason::CancelledBuild));
        assert!(status.completion_timestamp.is_some());
        assert!(cluster.event_reasons().contains(&BUILD_CANCELLED_EVENT.to_string()));
        // The config queue was tickled so policy can start the next build.
        assert_eq!(
            controller.build_config_queue.get().await.as_deref(),
            Some("ns1/bc")
        );
    }

    // Cancelling a build whose pod is already gone still succeeds.
    #[tokio::test]
    async fn test_cancellation_tolerates_missing_pod() {
        let cluster = FakeCluster::new();
        let mut build = docker_build("b1", BuildPhase::Pending);
        build.status.as_mut().unwrap().cancelled = true;
        cluster.put_build(build.clone());

        controller(&cluster).handle_build(&build).await.unwrap();

        let status = cluster.build("ns1", "b1").unwrap().status.unwrap();
        assert_eq!(status.phase, BuildPhase::Cancelled);
    }

    // Scenario: pod failed with an OOM kill; the build fails with the OOM
    // reason and a log snippet.
    #[tokio::test]
    async fn test_oom_killed_pod_failure() {
        let cluster = FakeCluster::new();
        let mut build = docker_build("b1", BuildPhase::Running);
        build.status.as_mut().unwrap().start_timestamp = Some(Time(Utc::now()));
        let mut pod = pod_for(&build, "Failed");
        pod.status.as_mut().unwrap().reason = Some("OOMKilled".into());
        pod.status.as_mut().unwrap().container_statuses = Some(vec![terminated_container(
            137,
            Some("OOMKilled"),
            Some("fatal: out of memory\nbuild aborted"),
        )]);
        cluster.put_pod(pod);
        cluster.put_build(build.clone());

        controller(&cluster).handle_build(&build).await.unwrap();

        let status = cluster.build("ns1", "b1").unwrap().status.unwrap();
        assert_eq!(status.phase, BuildPhase::Failed);
        assert_eq!(status.reason, Some(BuildStatusReason::OutOfMemoryKilled));
        assert!(status.completion_timestamp.is_some());
        assert_eq!(
            status.log_snippet.as_deref(),
            Some("fatal: out of memory\nbuild aborted")
        );
    }

    // Scenario: serial policy keeps b2 queued while b1 runs, then starts it
    // once b1 completes and the config queue is handled.
    #[tokio::test]
    async fn test_serial_policy_queueing() {
        let cluster = FakeCluster::new();
        seed_builder_service_account(&cluster);
        cluster.put_image_stream(image_stream("registry/ns1/is"));

        let with_config = |name: &str, number: i64, phase: BuildPhase| {
            let mut build = docker_build(name, phase);
            let mut labels = BTreeMap::new();
            labels.insert(BUILD_CONFIG_LABEL.to_string(), "bc".to_string());
            build.metadata.labels = Some(labels);
            let mut annotations = BTreeMap::new();
            annotations.insert(BUILD_NUMBER_ANNOTATION.to_string(), number.to_string());
            build.metadata.annotations = Some(annotations);
            build
        };

        let b1 = with_config("b1", 1, BuildPhase::Running);
        let b2 = with_config("b2", 2, BuildPhase::New);
        cluster.put_pod(pod_for(&b1, "Running"));
        cluster.put_build(b1.clone());
        cluster.put_build(b2.clone());

        let controller = controller(&cluster);

        // b2 is declined while b1 runs: no pod, no patch.
        controller.handle_build(&b2).await.unwrap();
        assert!(cluster.created_pods.lock().unwrap().is_empty());
        assert!(cluster.patches.lock().unwrap().is_empty());

        // b1's pod succeeds; completion enqueues the config.
        let mut finished_pod = pod_for(&b1, "Succeeded");
        finished_pod.status.as_mut().unwrap().container_statuses =
            Some(vec![terminated_container(0, None, None)]);
        cluster.put_pod(finished_pod);
        controller.handle_build(&b1).await.unwrap();
        assert_eq!(
            cluster.build("ns1", "b1").unwrap().status.unwrap().phase,
            BuildPhase::Complete
        );
        let config_key = controller.build_config_queue.get().await.unwrap();
        assert_eq!(config_key, "ns1/bc");

        // Policy hands back b2, which is enqueued and then runs.
        controller.handle_build_config("ns1", "bc").await.unwrap();
        assert_eq!(controller.build_queue.get().await.as_deref(), Some("ns1/b2"));
        let b2 = cluster.build("ns1", "b2").unwrap();
        controller.handle_build(&b2).await.unwrap();
        assert_eq!(
            cluster.build("ns1", "b2").unwrap().status.unwrap().phase,
            BuildPhase::Pending
        );
    }

    #[tokio::test]
    async fn test_pipeline_build_is_skipped() {
        let cluster = FakeCluster::new();
        let mut build = docker_build("b1", BuildPhase::Complete);
        build.spec.strategy = BuildStrategy {
            jenkins_pipeline_strategy: Some(JenkinsPipelineBuildStrategy::default()),
            ..Default::default()
        };
        cluster.put_build(build.clone());

        controller(&cluster).handle_build(&build).await.unwrap();
        assert!(cluster.patches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_active_build_with_missing_pod_errors() {
        let cluster = FakeCluster::new();
        let build = docker_build("b1", BuildPhase::Running);
        cluster.put_build(build.clone());

        controller(&cluster).handle_build(&build).await.unwrap();

        let status = cluster.build("ns1", "b1").unwrap().status.unwrap();
        assert_eq!(status.phase, BuildPhase::Error);
        assert_eq!(status.reason, Some(BuildStatusReason::BuildPodDeleted));
    }

    // The cache can lag: a pod invisible to the lister but present in the
    // API is found with a direct fetch.
    #[tokio::test]
    async fn test_cache_miss_recovers_via_direct_fetch() {
        let cluster = FakeCluster::new();
        let build = docker_build("b1", BuildPhase::Pending);
        let mut pod = pod_for(&build, "Running");
        pod.status.as_mut().unwrap().start_time = Some(Time(Utc::now()));
        cluster.put_pod(pod);
        cluster
            .pods_hidden_from_lister
            .lock()
            .unwrap()
            .insert("ns1/b1-build".to_string());
        cluster.put_build(build.clone());

        controller(&cluster).handle_build(&build).await.unwrap();

        let status = cluster.build("ns1", "b1").unwrap().status.unwrap();
        assert_eq!(status.phase, BuildPhase::Running);
        assert!(status.start_timestamp.is_some());
    }

    #[tokio::test]
    async fn test_git_clone_init_container_promotes_to_running() {
        let cluster = FakeCluster::new();
        let build = docker_build("b1", BuildPhase::Pending);
        let mut pod = pod_for(&build, "Pending");
        pod.status.as_mut().unwrap().init_container_statuses = Some(vec![ContainerStatus {
            name: GIT_CLONE_CONTAINER.into(),
            state: Some(ContainerState {
                running: Some(ContainerStateRunning::default()),
                ..Default::default()
            }),
            ..Default::default()
        }]);
        cluster.put_pod(pod);
        cluster.put_build(build.clone());

        controller(&cluster).handle_build(&build).await.unwrap();

        let status = cluster.build("ns1", "b1").unwrap().status.unwrap();
        assert_eq!(status.phase, BuildPhase::Running);
    }

    #[tokio::test]
    async fn test_failed_pod_with_deletion_timestamp_is_pod_deleted() {
        let cluster = FakeCluster::new();
        let build = docker_build("b1", BuildPhase::Running);
        let mut pod = pod_for(&build, "Failed");
        pod.metadata.deletion_timestamp = Some(Time(Utc::now()));
        cluster.put_pod(pod);
        cluster.put_build(build.clone());

        controller(&cluster).handle_build(&build).await.unwrap();

        let status = cluster.build("ns1", "b1").unwrap().status.unwrap();
        assert_eq!(status.phase, BuildPhase::Error);
        assert_eq!(status.reason, Some(BuildStatusReason::BuildPodDeleted));
    }

    #[tokio::test]
    async fn test_succeeded_pod_without_container_statuses_errors() {
        let cluster = FakeCluster::new();
        let build = docker_build("b1", BuildPhase::Running);
        cluster.put_pod(pod_for(&build, "Succeeded"));
        cluster.put_build(build.clone());

        controller(&cluster).handle_build(&build).await.unwrap();

        let status = cluster.build("ns1", "b1").unwrap().status.unwrap();
        assert_eq!(status.phase, BuildPhase::Error);
        assert_eq!(status.reason, Some(BuildStatusReason::NoBuildContainerStatus));
    }

    #[tokio::test]
    async fn test_succeeded_pod_with_failed_container_errors() {
        let cluster = FakeCluster::new();
        let build = docker_build("b1", BuildPhase::Running);
        let mut pod = pod_for(&build, "Succeeded");
        pod.status.as_mut().unwrap().container_statuses =
            Some(vec![terminated_container(2, None, None)]);
        cluster.put_pod(pod);
        cluster.put_build(build.clone());

        controller(&cluster).handle_build(&build).await.unwrap();

        let status = cluster.build("ns1", "b1").unwrap().status.unwrap();
        assert_eq!(status.phase, BuildPhase::Error);
        assert_eq!(status.reason, Some(BuildStatusReason::FailedContainer));
    }

    // Reconciling an unchanged (build, pod) pair twice patches exactly once.
    #[tokio::test]
    async fn test_handle_build_is_idempotent() {
        let cluster = FakeCluster::new();
        let build = docker_build("b1", BuildPhase::Running);
        let mut pod = pod_for(&build, "Running");
        pod.status.as_mut().unwrap().start_time = Some(Time(Utc::now()));
        cluster.put_pod(pod);
        cluster.put_build(build.clone());

        let controller = controller(&cluster);
        controller.handle_build(&build).await.unwrap();
        let build = cluster.build("ns1", "b1").unwrap();
        controller.handle_build(&build).await.unwrap();
        // Phase was already Running, so neither pass patched anything.
        assert!(cluster.patches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_completed_build_metadata_repair() {
        let cluster = FakeCluster::new();
        let mut build = docker_build("b1", BuildPhase::Failed);
        build.status.as_mut().unwrap().start_timestamp = Some(Time(Utc::now()));
        let mut pod = pod_for(&build, "Failed");
        let long_line = "x".repeat(200);
        let message = format!("one\ntwo\nthree\nfour\nfive\n{}", long_line);
        pod.status.as_mut().unwrap().container_statuses =
            Some(vec![terminated_container(1, None, Some(&message))]);
        cluster.put_pod(pod);
        cluster.put_build(build.clone());

        controller(&cluster).handle_build(&build).await.unwrap();

        let status = cluster.build("ns1", "b1").unwrap().status.unwrap();
        assert!(status.completion_timestamp.is_some());
        assert!(status.duration_seconds.is_some());
        let snippet = status.log_snippet.unwrap();
        let lines: Vec<&str> = snippet.split('\n').collect();
        // Six lines in, five out, and the long line is elided.
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0], "two");
        assert_eq!(lines[4].chars().count(), 58 + 3 + 59);
        assert!(lines[4].contains("..."));
    }

    #[test]
    fn test_elide_line_boundaries() {
        let exactly_120 = "y".repeat(120);
        assert_eq!(elide_line(&exactly_120), exactly_120);
        let long = "z".repeat(200);
        let elided = elide_line(&long);
        assert_eq!(elided.len(), 58 + 3 + 59);
        assert_eq!(&elided[..58], "z".repeat(58));
        assert!(elided.ends_with(&"z".repeat(59)));
    }

    #[test]
    fn test_log_snippet_keeps_trailing_lines() {
        assert_eq!(log_snippet_from_message("a\nb\n\n"), "a\nb");
        assert_eq!(
            log_snippet_from_message("1\n2\n3\n4\n5\n6"),
            "2\n3\n4\n5\n6"
        );
    }

    #[test]
    fn test_transition_table() {
        use BuildPhase::*;
        // Staying put is legal everywhere.
        for phase in [New, Pending, Running, Complete, Failed, Error, Cancelled] {
            assert!(is_valid_transition(phase, phase));
        }
        // Terminal phases are sinks.
        for from in [Complete, Failed, Error, Cancelled] {
            for to in [New, Pending, Running, Complete, Failed, Error, Cancelled] {
                if from != to {
                    assert!(!is_valid_transition(from, to), "{} -> {}", from, to);
                }
            }
        }
        // No moving backwards.
        assert!(!is_valid_transition(Pending, New));
        assert!(!is_valid_transition(Running, New));
        assert!(!is_valid_transition(Running, Pending));
        // Everything else is allowed.
        assert!(is_valid_transition(New, Pending));
        assert!(is_valid_transition(New, Error));
        assert!(is_valid_transition(Pending, Running));
        assert!(is_valid_transition(Pending, Cancelled));
        assert!(is_valid_transition(Running, Failed));
    }

    #[tokio::test]
    async fn test_invalid_transition_is_rejected() {
        let cluster = FakeCluster::new();
        let build = docker_build("b1", BuildPhase::Running);
        cluster.put_build(build.clone());
        let controller = controller(&cluster);

        let update = transition_to_phase(BuildPhase::New, None, None);
        let err = controller.update_build(&build, update, None).await.unwrap_err();
        assert!(matches!(err, OperatorError::InvalidTransition { .. }));
        assert!(cluster.patches.lock().unwrap().is_empty());
    }

    #[test]
    fn test_should_ignore_rules() {
        let mut build = docker_build("b1", BuildPhase::Complete);
        // Terminal but missing completion metadata: not ignored.
        assert!(!should_ignore(&build));
        build.status.as_mut().unwrap().completion_timestamp = Some(Time(Utc::now()));
        assert!(should_ignore(&build));

        let mut failed = docker_build("b2", BuildPhase::Failed);
        failed.status.as_mut().unwrap().completion_timestamp = Some(Time(Utc::now()));
        assert!(!should_ignore(&failed));
        failed.status.as_mut().unwrap().log_snippet = Some("boom".into());
        assert!(should_ignore(&failed));

        // Error and Cancelled are ignored regardless of metadata; their
        // completion data was written during the transition.
        let errored = docker_build("b3", BuildPhase::Error);
        assert!(should_ignore(&errored));

        let active = docker_build("b4", BuildPhase::Running);
        assert!(!should_ignore(&active));
    }

    #[test]
    fn test_is_oom_killed() {
        assert!(!is_oom_killed(None));
        let build = docker_build("b1", BuildPhase::Running);
        let mut pod = pod_for(&build, "Failed");
        assert!(!is_oom_killed(Some(&pod)));
        pod.status.as_mut().unwrap().reason = Some("OOMKilled".into());
        assert!(is_oom_killed(Some(&pod)));

        let mut pod = pod_for(&build, "Failed");
        pod.status.as_mut().unwrap().container_statuses =
            Some(vec![terminated_container(137, Some("OOMKilled"), None)]);
        assert!(is_oom_killed(Some(&pod)));
    }

    // A pod the controller created earlier but never recorded: the new-build
    // handler falls through to the active handler.
    #[tokio::test]
    async fn test_new_build_with_owned_pod_recovers() {
        let cluster = FakeCluster::new();
        let build = docker_build("b1", BuildPhase::New);
        cluster.put_pod(pod_for(&build, "Pending"));
        cluster.put_build(build.clone());

        controller(&cluster).handle_build(&build).await.unwrap();

        let status = cluster.build("ns1", "b1").unwrap().status.unwrap();
        assert_eq!(status.phase, BuildPhase::Pending);
    }

    #[tokio::test]
    async fn test_pending_build_with_missing_push_secret_flagged() {
        let cluster = FakeCluster::new();
        let mut build = docker_build("b1", BuildPhase::Pending);
        build.spec.output.push_secret = Some(LocalObjectReference {
            name: "push-secret".into(),
        });
        cluster.put_pod(pod_for(&build, "Pending"));
        cluster.put_build(build.clone());

        controller(&cluster).handle_build(&build).await.unwrap();

        let status = cluster.build("ns1", "b1").unwrap().status.unwrap();
        assert_eq!(status.phase, BuildPhase::Pending);
        assert_eq!(status.reason, Some(BuildStatusReason::MissingPushSecret));
    }

    #[tokio::test]
    async fn test_pod_create_failure_is_retriable() {
        let cluster = FakeCluster::new();
        seed_builder_service_account(&cluster);
        cluster.put_image_stream(image_stream("registry/ns1/is"));
        *cluster.pod_create_failure.lock().unwrap() = Some(403);
        let build = docker_build("b1", BuildPhase::New);
        cluster.put_build(build.clone());

        let err = controller(&cluster).handle_build(&build).await.unwrap_err();
        assert!(!err.is_fatal());

        let status = cluster.build("ns1", "b1").unwrap().status.unwrap();
        assert_eq!(status.phase, BuildPhase::New);
        assert_eq!(status.reason, Some(BuildStatusReason::CannotCreateBuildPod));
        assert!(cluster.event_reasons().contains(&"FailedCreate".to_string()));
    }

    #[tokio::test]
    async fn test_unknown_strategy_parks_build_without_retry() {
        let cluster = FakeCluster::new();
        seed_builder_service_account(&cluster);
        cluster.put_image_stream(image_stream("registry/ns1/is"));
        let mut build = docker_build("b1", BuildPhase::New);
        build.spec.strategy = BuildStrategy::default();
        cluster.put_build(build.clone());

        // No error returned: retrying cannot produce a pod spec.
        controller(&cluster).handle_build(&build).await.unwrap();

        let status = cluster.build("ns1", "b1").unwrap().status.unwrap();
        assert_eq!(status.phase, BuildPhase::New);
        assert_eq!(status.reason, Some(BuildStatusReason::CannotCreateBuildPodSpec));
    }

    #[tokio::test]
    async fn test_missing_docker_secret_is_retriable() {
        let cluster = FakeCluster::new();
        // Service account exists but carries no docker secrets.
        cluster.put_service_account(ServiceAccount {
            metadata: ObjectMeta {
                name: Some("builder".into()),
                namespace: Some("ns1".into()),
                ..Default::default()
            },
            ..Default::default()
        });
        cluster.put_image_stream(image_stream("registry/ns1/is"));
        let build = docker_build("b1", BuildPhase::New);
        cluster.put_build(build.clone());

        let err = controller(&cluster).handle_build(&build).await.unwrap_err();
        assert!(matches!(err, OperatorError::MissingDockerSecret { .. }));
        let status = cluster.build("ns1", "b1").unwrap().status.unwrap();
        assert_eq!(
            status.reason,
            Some(BuildStatusReason::CannotRetrieveServiceAccount)
        );
    }
}
