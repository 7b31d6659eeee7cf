//! Build Custom Resource Definition
//!
//! A Build is a declarative request to produce a container image. The build
//! controller creates an executor pod for each Build and transcribes the pod
//! lifecycle back into the Build status.

use k8s_openapi::api::core::v1::{EnvVar, LocalObjectReference, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crd::BuildRunPolicy;

/// Annotation on a Build recording the name of its executor pod.
pub const BUILD_POD_NAME_ANNOTATION: &str = "build.openshift.io/build.pod-name";
/// Annotation on an executor pod pointing back at its Build.
pub const BUILD_NAME_ANNOTATION: &str = "build.openshift.io/build.name";
/// Annotation naming the BuildConfig a Build belongs to.
pub const BUILD_CONFIG_ANNOTATION: &str = "openshift.io/build-config.name";
/// Label naming the BuildConfig a Build belongs to (older clients set the
/// label only; the annotation wins when both are present).
pub const BUILD_CONFIG_LABEL: &str = "openshift.io/build-config.name";
/// Annotation carrying the sequence number of a Build within its config.
pub const BUILD_NUMBER_ANNOTATION: &str = "openshift.io/build.number";
/// Label carrying the run policy the Build was created under.
pub const BUILD_RUN_POLICY_LABEL: &str = "openshift.io/build.start-policy";

/// Service account used for builds that do not name one explicitly.
pub const BUILDER_SERVICE_ACCOUNT: &str = "builder";

/// Build is the Schema for the builds API
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "build.openshift.io",
    version = "v1",
    kind = "Build",
    namespaced,
    status = "BuildStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.reason"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BuildSpec {
    /// Input sources for the build
    #[serde(default)]
    pub source: BuildSource,

    /// How the build is executed
    #[serde(default)]
    pub strategy: BuildStrategy,

    /// Where the produced image is pushed
    #[serde(default)]
    pub output: BuildOutput,

    /// Service account whose secrets are used for pushing and pulling
    #[serde(default)]
    pub service_account: Option<String>,
}

/// Input sources for a build
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct BuildSource {
    /// Git repository to clone
    #[serde(default)]
    pub git: Option<GitBuildSource>,

    /// Inline Dockerfile content
    #[serde(default)]
    pub dockerfile: Option<String>,

    /// Images whose content is copied into the build context
    #[serde(default)]
    pub images: Vec<ImageSource>,
}

/// Git source location
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GitBuildSource {
    /// Repository URI
    pub uri: String,
    /// Branch, tag, or commit
    #[serde(default, rename = "ref")]
    pub git_ref: Option<String>,
}

/// Image content pulled into the build context
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageSource {
    /// Image to copy from; may reference an image stream
    pub from: ObjectReference,
    /// Paths copied out of the image
    #[serde(default)]
    pub paths: Vec<ImageSourcePath>,
    /// Secret used to pull the image
    #[serde(default)]
    pub pull_secret: Option<LocalObjectReference>,
}

/// Single path copied out of a source image
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageSourcePath {
    /// Absolute path inside the source image
    pub source_path: String,
    /// Directory relative to the build context to copy into
    pub destination_dir: String,
}

/// Strategy variant selector; exactly one field is expected to be set
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct BuildStrategy {
    /// Dockerfile-driven build
    #[serde(default)]
    pub docker_strategy: Option<DockerBuildStrategy>,

    /// Source-to-image build
    #[serde(default)]
    pub source_strategy: Option<SourceBuildStrategy>,

    /// User-supplied builder image
    #[serde(default)]
    pub custom_strategy: Option<CustomBuildStrategy>,

    /// Pipeline build; executed elsewhere and skipped by this controller
    #[serde(default)]
    pub jenkins_pipeline_strategy: Option<JenkinsPipelineBuildStrategy>,
}

/// Dockerfile-driven build strategy
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct DockerBuildStrategy {
    /// Base image override; may reference an image stream
    #[serde(default)]
    pub from: Option<ObjectReference>,
    /// Secret used to pull the base image
    #[serde(default)]
    pub pull_secret: Option<LocalObjectReference>,
    /// Additional environment for the builder container
    #[serde(default)]
    pub env: Vec<EnvVar>,
    /// Skip layer caching
    #[serde(default)]
    pub no_cache: bool,
}

/// Source-to-image build strategy
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct SourceBuildStrategy {
    /// Builder image; may reference an image stream
    #[serde(default)]
    pub from: ObjectReference,
    /// Secret used to pull the builder image
    #[serde(default)]
    pub pull_secret: Option<LocalObjectReference>,
    /// Additional environment for the builder container
    #[serde(default)]
    pub env: Vec<EnvVar>,
}

/// Custom builder image strategy
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct CustomBuildStrategy {
    /// Builder image; may reference an image stream
    #[serde(default)]
    pub from: ObjectReference,
    /// Secret used to pull the builder image
    #[serde(default)]
    pub pull_secret: Option<LocalObjectReference>,
    /// Environment passed to the builder container
    #[serde(default)]
    pub env: Vec<EnvVar>,
    /// Expose the container runtime socket to the builder
    #[serde(default)]
    pub expose_docker_socket: bool,
}

/// Pipeline strategy marker; builds with this strategy are driven by the
/// pipeline machinery, not by this controller
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct JenkinsPipelineBuildStrategy {
    /// Inline pipeline definition
    #[serde(default)]
    pub jenkinsfile: Option<String>,
}

/// Output target of a build
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct BuildOutput {
    /// Destination; a DockerImage reference or an image stream reference
    /// resolved by the controller before the pod is created
    #[serde(default)]
    pub to: Option<ObjectReference>,
    /// Secret used to push the produced image
    #[serde(default)]
    pub push_secret: Option<LocalObjectReference>,
}

/// Status of a Build
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct BuildStatus {
    /// Current lifecycle phase
    #[serde(default)]
    pub phase: BuildPhase,

    /// Set by the user to request cancellation
    #[serde(default)]
    pub cancelled: bool,

    /// Machine-readable reason for the current phase
    #[serde(default)]
    pub reason: Option<BuildStatusReason>,

    /// Human-readable detail for the current phase
    #[serde(default)]
    pub message: Option<String>,

    /// When the executor pod started running
    #[serde(default)]
    pub start_timestamp: Option<Time>,

    /// When the build reached a terminal phase; set exactly once
    #[serde(default)]
    pub completion_timestamp: Option<Time>,

    /// Wall-clock duration in seconds, completion minus start
    #[serde(default)]
    pub duration_seconds: Option<i64>,

    /// Resolved pull spec the build pushes to
    #[serde(default)]
    pub output_docker_image_reference: Option<String>,

    /// Trailing lines of the failed container's termination message
    #[serde(default)]
    pub log_snippet: Option<String>,
}

/// Lifecycle phase of a Build
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub enum BuildPhase {
    /// Accepted but no pod created yet
    #[default]
    New,
    /// Executor pod created, waiting to run
    Pending,
    /// Executor pod is running
    Running,
    /// Build finished successfully
    Complete,
    /// Build ran and failed
    Failed,
    /// The controller could not make the build run
    Error,
    /// Cancelled by the user
    Cancelled,
}

impl BuildPhase {
    /// Terminal phases are sinks; no transition leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildPhase::Complete | BuildPhase::Failed | BuildPhase::Error | BuildPhase::Cancelled
        )
    }
}

impl fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BuildPhase::New => "New",
            BuildPhase::Pending => "Pending",
            BuildPhase::Running => "Running",
            BuildPhase::Complete => "Complete",
            BuildPhase::Failed => "Failed",
            BuildPhase::Error => "Error",
            BuildPhase::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}

/// Machine-readable reason codes surfaced in `status.reason`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum BuildStatusReason {
    CancelledBuild,
    BuildPodExists,
    BuildPodDeleted,
    MissingPushSecret,
    CannotRetrieveServiceAccount,
    InvalidOutputReference,
    InvalidImageReference,
    CannotCreateBuildPod,
    CannotCreateBuildPodSpec,
    UnresolvableEnvironmentVariable,
    OutOfMemoryKilled,
    FailedContainer,
    NoBuildContainerStatus,
    GenericBuildFailed,
    CannotCreateCAConfigMap,
}

impl BuildStatusReason {
    /// Default human-readable message paired with the reason code.
    pub fn default_message(&self) -> &'static str {
        match self {
            BuildStatusReason::CancelledBuild => "The build was cancelled by the user.",
            BuildStatusReason::BuildPodExists => {
                "The pod for this build already exists and is older than the build."
            }
            BuildStatusReason::BuildPodDeleted => {
                "The pod for this build was deleted before the build completed."
            }
            BuildStatusReason::MissingPushSecret => "Missing push secret.",
            BuildStatusReason::CannotRetrieveServiceAccount => {
                "Unable to look up the service account secrets for this build."
            }
            BuildStatusReason::InvalidOutputReference => "Output image could not be resolved.",
            BuildStatusReason::InvalidImageReference => "Referenced image could not be resolved.",
            BuildStatusReason::CannotCreateBuildPod => "Failed creating build pod.",
            BuildStatusReason::CannotCreateBuildPodSpec => "Failed to create pod spec.",
            BuildStatusReason::UnresolvableEnvironmentVariable => {
                "Unable to resolve build environment variable reference."
            }
            BuildStatusReason::OutOfMemoryKilled => {
                "The build pod was killed due to an out of memory condition."
            }
            BuildStatusReason::FailedContainer => {
                "The pod for this build has at least one container with a non-zero exit status."
            }
            BuildStatusReason::NoBuildContainerStatus => {
                "The pod for this build has no container statuses indicating success or failure."
            }
            BuildStatusReason::GenericBuildFailed => {
                "Generic build failure - check logs for details."
            }
            BuildStatusReason::CannotCreateCAConfigMap => {
                "Failed creating build certificate authority configMap."
            }
        }
    }
}

impl fmt::Display for BuildStatusReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl Build {
    /// Name of the executor pod for this build.
    pub fn pod_name(&self) -> String {
        format!("{}-build", self.name_any())
    }

    /// Name of the ConfigMap carrying trusted CA material for the build pod.
    pub fn ca_config_map_name(&self) -> String {
        format!("{}-ca", self.name_any())
    }

    /// Name of the BuildConfig this build belongs to, if any. The annotation
    /// is authoritative; the label is kept for older clients.
    pub fn config_name(&self) -> Option<String> {
        self.annotations()
            .get(BUILD_CONFIG_ANNOTATION)
            .or_else(|| self.labels().get(BUILD_CONFIG_LABEL))
            .filter(|name| !name.is_empty())
            .cloned()
    }

    /// Sequence number within the owning config, used for serial ordering.
    pub fn build_number(&self) -> Option<i64> {
        self.annotations()
            .get(BUILD_NUMBER_ANNOTATION)
            .and_then(|n| n.parse().ok())
    }

    /// Run policy the build was created under; Serial when unlabelled.
    pub fn run_policy(&self) -> BuildRunPolicy {
        match self.labels().get(BUILD_RUN_POLICY_LABEL).map(String::as_str) {
            Some("Parallel") => BuildRunPolicy::Parallel,
            Some("SerialLatestOnly") => BuildRunPolicy::SerialLatestOnly,
            _ => BuildRunPolicy::Serial,
        }
    }

    /// Phase accessor that treats a missing status as `New`.
    pub fn phase(&self) -> BuildPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// True once the build has reached any terminal phase.
    pub fn is_complete(&self) -> bool {
        self.phase().is_terminal()
    }

    /// True if the executor pod name has been recorded on the build.
    pub fn has_pod_name_annotation(&self) -> bool {
        self.annotations().contains_key(BUILD_POD_NAME_ANNOTATION)
    }

    /// Service account used to resolve push/pull secrets.
    pub fn service_account(&self) -> &str {
        self.spec
            .service_account
            .as_deref()
            .filter(|sa| !sa.is_empty())
            .unwrap_or(BUILDER_SERVICE_ACCOUNT)
    }
}
