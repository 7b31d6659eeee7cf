//! Executor pod construction seams
//!
//! The reconciler asks a [`BuildPodFactory`] for the executor pod of a build
//! and then runs the pod through the defaults and overrides mutators and the
//! environment resolver. The concrete pod shape per strategy lives behind
//! the factory trait; [`ExecutorPodFactory`] provides a minimal one.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Container, EnvVar, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::ObjectMeta;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use tracing::debug;

use crate::crd::{Build, CustomBuildStrategy, BUILD_NAME_ANNOTATION};
use crate::error::{OperatorError, Result};

/// Init container that clones the build input; a pod in `Pending` whose
/// git-clone container is running counts as a running build.
pub const GIT_CLONE_CONTAINER: &str = "git-clone";

/// Data key under which the CA ConfigMap carries extra trusted certificates.
pub const ADDITIONAL_TRUSTED_CA_KEY: &str = "ca-bundle.crt";

/// Annotation asking the service CA operator to inject the cluster bundle.
pub const CA_INJECT_ANNOTATION: &str = "service.alpha.openshift.io/inject-cabundle";

/// Environment variable the custom strategy exposes its base image through.
pub const CUSTOM_BUILD_BASE_IMAGE_ENV: &str = "OPENSHIFT_CUSTOM_BUILD_BASE_IMAGE";

/// Produces the executor pod spec for a build.
pub trait BuildPodFactory: Send + Sync {
    /// Build the pod spec. Errors that no retry can fix (an unrecognised
    /// strategy, for instance) must be [`OperatorError::FatalPodSpec`].
    fn create_build_pod(&self, build: &Build, include_additional_ca: bool) -> Result<Pod>;
}

/// Post-processing applied to a produced pod spec; defaults run before
/// overrides.
pub trait PodMutator: Send + Sync {
    fn apply(&self, pod: &mut Pod) -> Result<()>;
}

/// Resolves `valueFrom` environment references in a produced pod spec.
#[async_trait]
pub trait EnvResolver: Send + Sync {
    async fn resolve_value_from(&self, pod: &mut Pod) -> Result<()>;
}

/// Retires completed builds beyond the config's history limits.
#[async_trait]
pub trait BuildPruner: Send + Sync {
    async fn handle_build_pruning(&self, namespace: &str, config: &str);
}

/// Owner reference from a created pod back to its build.
pub fn build_owner_reference(build: &Build) -> OwnerReference {
    OwnerReference {
        api_version: Build::api_version(&()).to_string(),
        kind: Build::kind(&()).to_string(),
        name: build.name_any(),
        uid: build.meta().uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: None,
    }
}

/// True when the pod carries an owner reference naming the build. A pod
/// without one is a name collision with a foreign controller.
pub fn has_owner_reference(pod: &Pod, build: &Build) -> bool {
    let expected = build_owner_reference(build);
    pod.owner_references().iter().any(|owner| {
        owner.api_version == expected.api_version
            && owner.kind == expected.kind
            && owner.name == expected.name
            && owner.uid == expected.uid
    })
}

/// Owner reference from a CA ConfigMap to the build pod, so the map is
/// garbage collected with the pod.
pub fn pod_owner_reference(pod: &Pod) -> OwnerReference {
    OwnerReference {
        api_version: "v1".to_string(),
        kind: "Pod".to_string(),
        name: pod.name_any(),
        uid: pod.meta().uid.clone().unwrap_or_default(),
        controller: None,
        block_owner_deletion: None,
    }
}

/// True when `owners` contains the exact pod owner reference.
pub fn has_pod_owner_reference(pod: &Pod, owners: &[OwnerReference]) -> bool {
    let expected = pod_owner_reference(pod);
    owners.iter().any(|owner| *owner == expected)
}

/// Name of the build a pod executes, read from the pod annotation.
pub fn build_name_for_pod(pod: &Pod) -> Option<String> {
    pod.annotations()
        .get(BUILD_NAME_ANNOTATION)
        .filter(|name| !name.is_empty())
        .cloned()
}

/// Mirror the custom strategy's base image into its environment so the
/// builder container can see it.
pub fn update_custom_image_env(strategy: &mut CustomBuildStrategy, image: &str) {
    if let Some(existing) = strategy
        .env
        .iter_mut()
        .find(|env| env.name == CUSTOM_BUILD_BASE_IMAGE_ENV)
    {
        existing.value = Some(image.to_string());
        existing.value_from = None;
    } else {
        strategy.env.push(EnvVar {
            name: CUSTOM_BUILD_BASE_IMAGE_ENV.to_string(),
            value: Some(image.to_string()),
            ..Default::default()
        });
    }
}

/// Minimal strategy-dispatching pod factory.
///
/// It produces a pod with the build-name annotation, an owner reference to
/// the build, a git-clone init container when the build has git input, and
/// one builder container running the strategy image. Richer per-strategy
/// shapes plug in by replacing this factory at construction.
#[derive(Default)]
pub struct ExecutorPodFactory;

impl ExecutorPodFactory {
    fn builder_image(build: &Build) -> Result<String> {
        let strategy = &build.spec.strategy;
        let from = if let Some(docker) = &strategy.docker_strategy {
            docker.from.clone()
        } else if let Some(source) = &strategy.source_strategy {
            Some(source.from.clone())
        } else if let Some(custom) = &strategy.custom_strategy {
            Some(custom.from.clone())
        } else {
            return Err(OperatorError::FatalPodSpec(format!(
                "build {}/{} declares no supported strategy",
                build.namespace().unwrap_or_default(),
                build.name_any()
            )));
        };
        Ok(from
            .and_then(|reference| reference.name)
            .unwrap_or_default())
    }

    fn strategy_env(build: &Build) -> Vec<EnvVar> {
        let strategy = &build.spec.strategy;
        if let Some(docker) = &strategy.docker_strategy {
            docker.env.clone()
        } else if let Some(source) = &strategy.source_strategy {
            source.env.clone()
        } else if let Some(custom) = &strategy.custom_strategy {
            custom.env.clone()
        } else {
            Vec::new()
        }
    }
}

impl BuildPodFactory for ExecutorPodFactory {
    fn create_build_pod(&self, build: &Build, include_additional_ca: bool) -> Result<Pod> {
        let image = Self::builder_image(build)?;

        let mut annotations = BTreeMap::new();
        annotations.insert(BUILD_NAME_ANNOTATION.to_string(), build.name_any());

        let mut init_containers = Vec::new();
        if build.spec.source.git.is_some() {
            init_containers.push(Container {
                name: GIT_CLONE_CONTAINER.to_string(),
                image: Some(image.clone()),
                ..Default::default()
            });
        }

        let mut env = Self::strategy_env(build);
        if include_additional_ca {
            env.push(EnvVar {
                name: "BUILD_ADDITIONAL_CA".to_string(),
                value: Some(build.ca_config_map_name()),
                ..Default::default()
            });
        }

        Ok(Pod {
            metadata: ObjectMeta {
                name: Some(build.pod_name()),
                namespace: build.namespace(),
                annotations: Some(annotations),
                owner_references: Some(vec![build_owner_reference(build)]),
                ..Default::default()
            },
            spec: Some(PodSpec {
                service_account_name: Some(build.service_account().to_string()),
                restart_policy: Some("Never".to_string()),
                init_containers: if init_containers.is_empty() {
                    None
                } else {
                    Some(init_containers)
                },
                containers: vec![Container {
                    name: "build".to_string(),
                    image: Some(image),
                    env: if env.is_empty() { None } else { Some(env) },
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: None,
        })
    }
}

/// Mutator that leaves the pod untouched.
pub struct NoopPodMutator;

impl PodMutator for NoopPodMutator {
    fn apply(&self, _pod: &mut Pod) -> Result<()> {
        Ok(())
    }
}

/// Env resolver that accepts every reference as-is.
pub struct NoopEnvResolver;

#[async_trait]
impl EnvResolver for NoopEnvResolver {
    async fn resolve_value_from(&self, _pod: &mut Pod) -> Result<()> {
        Ok(())
    }
}

/// Pruner that only records the request.
pub struct NoopBuildPruner;

#[async_trait]
impl BuildPruner for NoopBuildPruner {
    async fn handle_build_pruning(&self, namespace: &str, config: &str) {
        debug!(namespace, config, "build pruning requested");
    }
}
