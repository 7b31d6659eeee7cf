//! Build status deltas and the minimal patch protocol
//!
//! A [`BuildUpdate`] is the ephemeral outcome of one reconcile pass: only the
//! fields a handler set are applied. The patch sent to the API server is the
//! recursive difference between the original and the updated build, so
//! concurrent writers (the running build pod updates its own status fields)
//! are never clobbered.

use k8s_openapi::api::core::v1::LocalObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use serde_json::{Map, Value};

use crate::crd::{Build, BuildPhase, BuildStatus, BuildStatusReason, BUILD_POD_NAME_ANNOTATION};
use crate::error::Result;

/// Pending changes to a build computed by a reconcile pass.
///
/// `reason` and `message` are double-optional: the outer level records
/// whether the handler touched the field at all, the inner level lets a
/// transition clear a stale value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildUpdate {
    pub phase: Option<BuildPhase>,
    pub reason: Option<Option<BuildStatusReason>>,
    pub message: Option<Option<String>>,
    pub start_time: Option<Time>,
    pub completion_time: Option<Time>,
    pub duration_seconds: Option<i64>,
    pub output_ref: Option<String>,
    pub log_snippet: Option<String>,
    pub pod_name_annotation: Option<String>,
    pub push_secret: Option<LocalObjectReference>,
}

impl BuildUpdate {
    pub fn set_phase(&mut self, phase: BuildPhase) {
        self.phase = Some(phase);
    }

    pub fn set_reason(&mut self, reason: BuildStatusReason) {
        self.reason = Some(Some(reason));
    }

    pub fn set_message(&mut self, message: impl Into<String>) {
        self.message = Some(Some(message.into()));
    }

    pub fn clear_reason(&mut self) {
        self.reason = Some(None);
    }

    pub fn clear_message(&mut self) {
        self.message = Some(None);
    }

    pub fn set_start_time(&mut self, time: Time) {
        self.start_time = Some(time);
    }

    pub fn set_completion_time(&mut self, time: Time) {
        self.completion_time = Some(time);
    }

    pub fn set_duration_seconds(&mut self, seconds: i64) {
        self.duration_seconds = Some(seconds);
    }

    pub fn set_output_ref(&mut self, output_ref: impl Into<String>) {
        self.output_ref = Some(output_ref.into());
    }

    pub fn set_log_snippet(&mut self, snippet: impl Into<String>) {
        self.log_snippet = Some(snippet.into());
    }

    pub fn set_pod_name_annotation(&mut self, pod_name: impl Into<String>) {
        self.pod_name_annotation = Some(pod_name.into());
    }

    pub fn set_push_secret(&mut self, secret: LocalObjectReference) {
        self.push_secret = Some(secret);
    }

    /// True iff no field has been set; empty updates are never patched.
    pub fn is_empty(&self) -> bool {
        *self == BuildUpdate::default()
    }

    /// Apply the set fields to `build` in place.
    pub fn apply(&self, build: &mut Build) {
        let status = build.status.get_or_insert_with(BuildStatus::default);
        if let Some(phase) = self.phase {
            status.phase = phase;
        }
        if let Some(reason) = &self.reason {
            status.reason = *reason;
        }
        if let Some(message) = &self.message {
            status.message = message.clone();
        }
        if let Some(start_time) = &self.start_time {
            status.start_timestamp = Some(start_time.clone());
        }
        if let Some(completion_time) = &self.completion_time {
            status.completion_timestamp = Some(completion_time.clone());
        }
        if let Some(duration) = self.duration_seconds {
            status.duration_seconds = Some(duration);
        }
        if let Some(output_ref) = &self.output_ref {
            status.output_docker_image_reference = Some(output_ref.clone());
        }
        if let Some(snippet) = &self.log_snippet {
            status.log_snippet = Some(snippet.clone());
        }
        if let Some(secret) = &self.push_secret {
            build.spec.output.push_secret = Some(secret.clone());
        }
        if let Some(pod_name) = &self.pod_name_annotation {
            build
                .metadata
                .annotations
                .get_or_insert_with(Default::default)
                .insert(BUILD_POD_NAME_ANNOTATION.to_string(), pod_name.clone());
        }
    }
}

/// Shorthand for an update that moves a build to `phase` with the reason's
/// default message.
pub fn transition_to_phase(
    phase: BuildPhase,
    reason: Option<BuildStatusReason>,
    message: Option<String>,
) -> BuildUpdate {
    let mut update = BuildUpdate::default();
    update.set_phase(phase);
    update.reason = Some(reason);
    update.message = Some(message.or_else(|| reason.map(|r| r.default_message().to_string())));
    update
}

/// Apply `update` to a copy of `build` and compute the JSON merge patch that
/// turns the original into the copy. An empty object means nothing changed.
pub fn build_patch(build: &Build, update: &BuildUpdate) -> Result<(Build, Value)> {
    let mut desired = build.clone();
    update.apply(&mut desired);
    let original_json = serde_json::to_value(build)?;
    let desired_json = serde_json::to_value(&desired)?;
    Ok((desired, diff_merge_patch(&original_json, &desired_json)))
}

/// Recursive two-way diff producing an RFC 7386 merge patch.
///
/// Arrays and scalars are replaced wholesale; keys removed in `desired`
/// become explicit nulls. The updates produced by this controller only touch
/// scalar status fields and the annotation map, so merge-patch granularity is
/// exact for them.
pub fn diff_merge_patch(original: &Value, desired: &Value) -> Value {
    match (original, desired) {
        (Value::Object(original), Value::Object(desired)) => {
            let mut patch = Map::new();
            for (key, desired_value) in desired {
                match original.get(key) {
                    Some(original_value) if original_value == desired_value => {}
                    Some(original_value) => {
                        let inner = diff_merge_patch(original_value, desired_value);
                        if !matches!(&inner, Value::Object(m) if m.is_empty()) {
                            patch.insert(key.clone(), inner);
                        }
                    }
                    None => {
                        patch.insert(key.clone(), desired_value.clone());
                    }
                }
            }
            for key in original.keys() {
                if !desired.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            Value::Object(patch)
        }
        _ if original == desired => Value::Object(Map::new()),
        _ => desired.clone(),
    }
}

/// Apply an RFC 7386 merge patch to `target` in place.
pub fn apply_merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(entries) => {
            if !target.is_object() {
                *target = Value::Object(Map::new());
            }
            let target_map = target.as_object_mut().unwrap();
            for (key, patch_value) in entries {
                if patch_value.is_null() {
                    target_map.remove(key);
                } else {
                    let slot = target_map.entry(key.clone()).or_insert(Value::Null);
                    apply_merge_patch(slot, patch_value);
                }
            }
        }
        _ => *target = patch.clone(),
    }
}

/// True when a merge patch document carries no changes.
pub fn patch_is_empty(patch: &Value) -> bool {
    matches!(patch, Value::Object(m) if m.is_empty())
}
