//! BuildConfig Custom Resource Definition
//!
//! A BuildConfig is the template and policy owner of Builds. The controller
//! only consults it for the run policy that orders sibling builds and for the
//! history limits consumed by pruning.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// BuildConfig is the Schema for the buildconfigs API
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "build.openshift.io",
    version = "v1",
    kind = "BuildConfig",
    namespaced,
    status = "BuildConfigStatus",
    shortname = "bc",
    printcolumn = r#"{"name":"Latest","type":"integer","jsonPath":".status.lastVersion"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BuildConfigSpec {
    /// How builds created from this config are scheduled relative to each
    /// other
    #[serde(default)]
    pub run_policy: BuildRunPolicy,

    /// Completed builds retained before pruning
    #[serde(default)]
    pub successful_builds_history_limit: Option<i32>,

    /// Failed builds retained before pruning
    #[serde(default)]
    pub failed_builds_history_limit: Option<i32>,
}

/// Scheduling policy for sibling builds of one config
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub enum BuildRunPolicy {
    /// Builds run as soon as they are created
    Parallel,
    /// Builds run one at a time, oldest first
    #[default]
    Serial,
    /// Builds run one at a time; queued builds older than the newest are
    /// cancelled
    SerialLatestOnly,
}

/// Status of a BuildConfig
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct BuildConfigStatus {
    /// Sequence number of the most recently created build
    #[serde(default)]
    pub last_version: i64,
}
