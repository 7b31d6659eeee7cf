//! Run policies
//!
//! A run policy decides whether a queued build may start now, given its
//! siblings under the same BuildConfig. Policies are selected per build by
//! first match over the registered set; builds without a policy label run
//! under Serial.

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use kube::Resource;
use kube::ResourceExt;
use serde_json::json;
use tracing::debug;

use crate::clients::{BuildConfigLister, BuildLister, BuildPatcher};
use crate::crd::{Build, BuildPhase, BuildRunPolicy};
use crate::error::Result;

/// Admission gate for queued builds.
#[async_trait]
pub trait RunPolicy: Send + Sync {
    /// True when this policy variant governs builds declaring `policy`.
    fn handles(&self, policy: BuildRunPolicy) -> bool;

    /// Whether the build may start now. `false` parks the build in `New`
    /// until a sibling's completion tickles the config queue.
    async fn is_runnable(&self, build: &Build) -> Result<bool>;
}

/// All policy variants in selection order.
pub fn default_run_policies(
    builds: Arc<dyn BuildLister>,
    patcher: Arc<dyn BuildPatcher>,
) -> Vec<Arc<dyn RunPolicy>> {
    vec![
        Arc::new(ParallelPolicy {
            builds: builds.clone(),
        }),
        Arc::new(SerialPolicy {
            builds: builds.clone(),
        }),
        Arc::new(SerialLatestOnlyPolicy { builds, patcher }),
    ]
}

/// First registered policy matching the build's declared run policy.
pub fn policy_for_build<'a>(
    build: &Build,
    policies: &'a [Arc<dyn RunPolicy>],
) -> Option<&'a Arc<dyn RunPolicy>> {
    let declared = build.run_policy();
    policies.iter().find(|policy| policy.handles(declared))
}

/// Builds run as soon as they are created, unless a serial sibling holds the
/// config.
pub struct ParallelPolicy {
    builds: Arc<dyn BuildLister>,
}

#[async_trait]
impl RunPolicy for ParallelPolicy {
    fn handles(&self, policy: BuildRunPolicy) -> bool {
        policy == BuildRunPolicy::Parallel
    }

    async fn is_runnable(&self, build: &Build) -> Result<bool> {
        let Some(config) = build.config_name() else {
            return Ok(true);
        };
        let namespace = build.namespace().unwrap_or_default();
        let serial_running = sibling_builds(self.builds.as_ref(), &namespace, &config)
            .iter()
            .any(|sibling| {
                is_active(sibling) && sibling.run_policy() != BuildRunPolicy::Parallel
            });
        Ok(!serial_running)
    }
}

/// Builds run one at a time, oldest first.
pub struct SerialPolicy {
    builds: Arc<dyn BuildLister>,
}

#[async_trait]
impl RunPolicy for SerialPolicy {
    fn handles(&self, policy: BuildRunPolicy) -> bool {
        policy == BuildRunPolicy::Serial
    }

    async fn is_runnable(&self, build: &Build) -> Result<bool> {
        let Some(config) = build.config_name() else {
            return Ok(true);
        };
        let namespace = build.namespace().unwrap_or_default();
        let siblings = sibling_builds(self.builds.as_ref(), &namespace, &config);
        if siblings.iter().any(|sibling| is_active(sibling)) {
            return Ok(false);
        }
        let queued = queued_builds(&siblings);
        Ok(queued
            .first()
            .is_some_and(|oldest| oldest.name_any() == build.name_any()))
    }
}

/// Builds run one at a time and only the newest queued build survives; older
/// queued siblings are cancelled.
pub struct SerialLatestOnlyPolicy {
    builds: Arc<dyn BuildLister>,
    patcher: Arc<dyn BuildPatcher>,
}

#[async_trait]
impl RunPolicy for SerialLatestOnlyPolicy {
    fn handles(&self, policy: BuildRunPolicy) -> bool {
        policy == BuildRunPolicy::SerialLatestOnly
    }

    async fn is_runnable(&self, build: &Build) -> Result<bool> {
        let Some(config) = build.config_name() else {
            return Ok(true);
        };
        let namespace = build.namespace().unwrap_or_default();
        let siblings = sibling_builds(self.builds.as_ref(), &namespace, &config);
        let queued = queued_builds(&siblings);
        let Some(newest) = queued.last() else {
            return Ok(false);
        };

        // Everything older than the newest queued build is superseded.
        for superseded in &queued[..queued.len() - 1] {
            debug!(
                build = %superseded.name_any(),
                config = %config,
                "cancelling superseded queued build"
            );
            let patch = json!({ "status": { "cancelled": true } });
            self.patcher
                .patch_build(&namespace, &superseded.name_any(), &patch)
                .await?;
        }

        if siblings.iter().any(|sibling| is_active(sibling)) {
            return Ok(false);
        }
        Ok(newest.name_any() == build.name_any())
    }
}

/// Pending or Running builds hold their config.
fn is_active(build: &Build) -> bool {
    matches!(build.phase(), BuildPhase::Pending | BuildPhase::Running)
}

/// All cached builds belonging to one config.
fn sibling_builds(builds: &dyn BuildLister, namespace: &str, config: &str) -> Vec<Arc<Build>> {
    let mut siblings: Vec<Arc<Build>> = builds
        .list_builds(namespace)
        .into_iter()
        .filter(|build| build.config_name().as_deref() == Some(config))
        .collect();
    siblings.sort_by(|a, b| build_order(a.as_ref(), b.as_ref()));
    siblings
}

/// Queued builds: phase `New`, cancellation not requested.
fn queued_builds(siblings: &[Arc<Build>]) -> Vec<Arc<Build>> {
    siblings
        .iter()
        .filter(|build| {
            build.phase() == BuildPhase::New
                && !build.status.as_ref().is_some_and(|s| s.cancelled)
        })
        .cloned()
        .collect()
}

/// Order builds by sequence number, falling back to creation time and name.
fn build_order(a: &Build, b: &Build) -> Ordering {
    match (a.build_number(), b.build_number()) {
        (Some(a_num), Some(b_num)) => a_num.cmp(&b_num),
        _ => {
            let a_created = a.meta().creation_timestamp.as_ref().map(|t| t.0);
            let b_created = b.meta().creation_timestamp.as_ref().map(|t| t.0);
            a_created
                .cmp(&b_created)
                .then_with(|| a.name_any().cmp(&b.name_any()))
        }
    }
}

/// Decide which builds of a config should start next.
///
/// Returns the next runnable builds plus a flag telling whether a sibling is
/// currently holding the config. No builds start while one is active.
pub async fn next_config_builds(
    builds: &dyn BuildLister,
    configs: &dyn BuildConfigLister,
    namespace: &str,
    name: &str,
) -> Result<(Vec<Arc<Build>>, bool)> {
    let siblings = sibling_builds(builds, namespace, name);
    if siblings.iter().any(|sibling| is_active(sibling)) {
        return Ok((Vec::new(), true));
    }
    let queued = queued_builds(&siblings);
    if queued.is_empty() {
        return Ok((Vec::new(), false));
    }

    // The config's declared policy wins; builds predating the config's
    // current policy fall back to their own label.
    let policy = configs
        .get_build_config(namespace, name)
        .map(|config| config.spec.run_policy)
        .unwrap_or_else(|| queued[queued.len() - 1].run_policy());

    let next = match policy {
        BuildRunPolicy::Parallel => queued,
        BuildRunPolicy::Serial => vec![queued[0].clone()],
        BuildRunPolicy::SerialLatestOnly => vec![queued[queued.len() - 1].clone()],
    };
    Ok((next, false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::fake::FakeCluster;
    use crate::crd::{
        BuildSpec, BuildStatus, BUILD_CONFIG_LABEL, BUILD_NUMBER_ANNOTATION,
        BUILD_RUN_POLICY_LABEL,
    };
    use kube::core::ObjectMeta;
    use std::collections::BTreeMap;

    fn sibling(
        name: &str,
        config: &str,
        number: i64,
        phase: BuildPhase,
        policy: &str,
    ) -> Build {
        let mut labels = BTreeMap::new();
        labels.insert(BUILD_CONFIG_LABEL.to_string(), config.to_string());
        labels.insert(BUILD_RUN_POLICY_LABEL.to_string(), policy.to_string());
        let mut annotations = BTreeMap::new();
        annotations.insert(BUILD_NUMBER_ANNOTATION.to_string(), number.to_string());
        Build {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("ns1".into()),
                labels: Some(labels),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: BuildSpec::default(),
            status: Some(BuildStatus {
                phase,
                ..Default::default()
            }),
        }
    }

    fn policies(cluster: &Arc<FakeCluster>) -> Vec<Arc<dyn RunPolicy>> {
        default_run_policies(
            cluster.clone() as Arc<dyn BuildLister>,
            cluster.clone() as Arc<dyn BuildPatcher>,
        )
    }

    #[tokio::test]
    async fn test_serial_runs_oldest_queued_only() {
        let cluster = FakeCluster::new();
        cluster.put_build(sibling("b1", "bc", 1, BuildPhase::New, "Serial"));
        cluster.put_build(sibling("b2", "bc", 2, BuildPhase::New, "Serial"));

        let policies = policies(&cluster);
        let b1 = cluster.build("ns1", "b1").unwrap();
        let b2 = cluster.build("ns1", "b2").unwrap();

        let policy = policy_for_build(&b1, &policies).unwrap();
        assert!(policy.is_runnable(&b1).await.unwrap());
        assert!(!policy.is_runnable(&b2).await.unwrap());
    }

    #[tokio::test]
    async fn test_serial_waits_for_active_sibling() {
        let cluster = FakeCluster::new();
        cluster.put_build(sibling("b1", "bc", 1, BuildPhase::Running, "Serial"));
        cluster.put_build(sibling("b2", "bc", 2, BuildPhase::New, "Serial"));

        let policies = policies(&cluster);
        let b2 = cluster.build("ns1", "b2").unwrap();
        let policy = policy_for_build(&b2, &policies).unwrap();
        assert!(!policy.is_runnable(&b2).await.unwrap());
    }

    #[tokio::test]
    async fn test_parallel_runs_alongside_parallel_siblings() {
        let cluster = FakeCluster::new();
        cluster.put_build(sibling("b1", "bc", 1, BuildPhase::Running, "Parallel"));
        cluster.put_build(sibling("b2", "bc", 2, BuildPhase::New, "Parallel"));

        let policies = policies(&cluster);
        let b2 = cluster.build("ns1", "b2").unwrap();
        let policy = policy_for_build(&b2, &policies).unwrap();
        assert!(policy.is_runnable(&b2).await.unwrap());
    }

    #[tokio::test]
    async fn test_parallel_waits_for_serial_sibling() {
        let cluster = FakeCluster::new();
        cluster.put_build(sibling("b1", "bc", 1, BuildPhase::Running, "Serial"));
        cluster.put_build(sibling("b2", "bc", 2, BuildPhase::New, "Parallel"));

        let policies = policies(&cluster);
        let b2 = cluster.build("ns1", "b2").unwrap();
        let policy = policy_for_build(&b2, &policies).unwrap();
        assert!(!policy.is_runnable(&b2).await.unwrap());
    }

    #[tokio::test]
    async fn test_serial_latest_only_cancels_older_queued() {
        let cluster = FakeCluster::new();
        cluster.put_build(sibling("b1", "bc", 1, BuildPhase::New, "SerialLatestOnly"));
        cluster.put_build(sibling("b2", "bc", 2, BuildPhase::New, "SerialLatestOnly"));
        cluster.put_build(sibling("b3", "bc", 3, BuildPhase::New, "SerialLatestOnly"));

        let policies = policies(&cluster);
        let b3 = cluster.build("ns1", "b3").unwrap();
        let policy = policy_for_build(&b3, &policies).unwrap();
        assert!(policy.is_runnable(&b3).await.unwrap());

        // The two older queued builds were marked cancelled.
        assert!(cluster.build("ns1", "b1").unwrap().status.unwrap().cancelled);
        assert!(cluster.build("ns1", "b2").unwrap().status.unwrap().cancelled);
        assert!(!cluster.build("ns1", "b3").unwrap().status.unwrap().cancelled);
    }

    #[tokio::test]
    async fn test_build_without_config_always_runs() {
        let cluster = FakeCluster::new();
        let build = Build {
            metadata: ObjectMeta {
                name: Some("loner".into()),
                namespace: Some("ns1".into()),
                ..Default::default()
            },
            spec: BuildSpec::default(),
            status: None,
        };
        let policies = policies(&cluster);
        let policy = policy_for_build(&build, &policies).unwrap();
        assert!(policy.is_runnable(&build).await.unwrap());
    }

    #[tokio::test]
    async fn test_next_config_builds_reports_running() {
        let cluster = FakeCluster::new();
        cluster.put_build(sibling("b1", "bc", 1, BuildPhase::Running, "Serial"));
        cluster.put_build(sibling("b2", "bc", 2, BuildPhase::New, "Serial"));

        let (next, running) = next_config_builds(
            cluster.as_ref(),
            cluster.as_ref(),
            "ns1",
            "bc",
        )
        .await
        .unwrap();
        assert!(running);
        assert!(next.is_empty());
    }

    #[tokio::test]
    async fn test_next_config_builds_serial_picks_oldest() {
        let cluster = FakeCluster::new();
        cluster.put_build(sibling("b2", "bc", 2, BuildPhase::New, "Serial"));
        cluster.put_build(sibling("b1", "bc", 1, BuildPhase::New, "Serial"));

        let (next, running) = next_config_builds(
            cluster.as_ref(),
            cluster.as_ref(),
            "ns1",
            "bc",
        )
        .await
        .unwrap();
        assert!(!running);
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].name_any(), "b1");
    }

    #[tokio::test]
    async fn test_next_config_builds_parallel_returns_all() {
        let cluster = FakeCluster::new();
        cluster.put_build(sibling("b1", "bc", 1, BuildPhase::New, "Parallel"));
        cluster.put_build(sibling("b2", "bc", 2, BuildPhase::New, "Parallel"));

        let (next, _) = next_config_builds(
            cluster.as_ref(),
            cluster.as_ref(),
            "ns1",
            "bc",
        )
        .await
        .unwrap();
        assert_eq!(next.len(), 2);
    }

    #[tokio::test]
    async fn test_next_config_builds_prefers_config_policy() {
        let cluster = FakeCluster::new();
        cluster.put_build(sibling("b1", "bc", 1, BuildPhase::New, "Parallel"));
        cluster.put_build(sibling("b2", "bc", 2, BuildPhase::New, "Parallel"));
        let config = crate::crd::BuildConfig {
            metadata: ObjectMeta {
                name: Some("bc".into()),
                namespace: Some("ns1".into()),
                ..Default::default()
            },
            spec: crate::crd::BuildConfigSpec {
                run_policy: BuildRunPolicy::Serial,
                ..Default::default()
            },
            status: None,
        };
        cluster.put_build_config(config);

        let (next, _) = next_config_builds(
            cluster.as_ref(),
            cluster.as_ref(),
            "ns1",
            "bc",
        )
        .await
        .unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].name_any(), "b1");
    }

    #[tokio::test]
    async fn test_cancelled_builds_are_not_queued() {
        let cluster = FakeCluster::new();
        let mut cancelled = sibling("b1", "bc", 1, BuildPhase::New, "Serial");
        cancelled.status.as_mut().unwrap().cancelled = true;
        cluster.put_build(cancelled);
        cluster.put_build(sibling("b2", "bc", 2, BuildPhase::New, "Serial"));

        let (next, _) = next_config_builds(
            cluster.as_ref(),
            cluster.as_ref(),
            "ns1",
            "bc",
        )
        .await
        .unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].name_any(), "b2");
    }
}
