//! BuildConfig reconciliation
//!
//! The config queue is tickled whenever a build finishes or is deleted. Its
//! worker asks policy for the next runnable sibling(s) and puts them back on
//! the build queue. Returning an error while builds are still running keeps
//! the key retrying, so the config is re-checked even if a completion event
//! is lost.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::clients::parse_key;
use crate::controllers::BuildController;
use crate::error::{OperatorError, Result};
use crate::policy::next_config_builds;

/// Retries per config key before the queue gives up on it.
const MAX_RETRIES: u32 = 15;

impl BuildController {
    pub(crate) async fn build_config_worker(self: Arc<Self>) {
        while let Some(key) = self.build_config_queue.get().await {
            let result = self.sync_build_config(&key).await;
            self.build_config_queue.done(&key);
            self.handle_build_config_error(result, &key);
        }
    }

    async fn sync_build_config(&self, key: &str) -> Result<()> {
        let (namespace, name) = parse_key(key)?;
        self.handle_build_config(namespace, name).await
    }

    /// Enqueue whatever policy says should run next for this config.
    pub(crate) async fn handle_build_config(&self, namespace: &str, name: &str) -> Result<()> {
        debug!(config = %format!("{}/{}", namespace, name), "handling build config");
        let (next_builds, has_running) = next_config_builds(
            self.builds(),
            self.build_configs(),
            namespace,
            name,
        )
        .await?;

        if has_running {
            return Err(OperatorError::Reconciliation(format!(
                "build config {}/{} has running builds and cannot run more builds",
                namespace, name
            )));
        }
        if next_builds.is_empty() {
            return Err(OperatorError::Reconciliation(format!(
                "build config {}/{} has no builds to run next",
                namespace, name
            )));
        }

        for build in next_builds {
            debug!(
                config = %format!("{}/{}", namespace, name),
                build = %build.metadata.name.as_deref().unwrap_or_default(),
                "queueing next build"
            );
            self.enqueue_build(&build);
        }
        Ok(())
    }

    fn handle_build_config_error(&self, result: Result<()>, key: &String) {
        match result {
            Ok(()) => self.build_config_queue.forget(key),
            Err(err) => {
                if self.build_config_queue.num_requeues(key) < MAX_RETRIES {
                    debug!(key = %key, error = %err, "retrying build config");
                    self.build_config_queue.add_rate_limited(key.clone());
                } else {
                    warn!(key = %key, error = %err, "giving up on build config");
                    self.build_config_queue.forget(key);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::fake::FakeCluster;
    use crate::controllers::BuildControllerParams;
    use crate::crd::{
        Build, BuildPhase, BuildSpec, BuildStatus, BUILD_CONFIG_LABEL, BUILD_NUMBER_ANNOTATION,
    };
    use crate::strategy::{ExecutorPodFactory, NoopBuildPruner, NoopEnvResolver, NoopPodMutator};
    use kube::core::ObjectMeta;
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

    fn sibling(name: &str, number: i64, phase: BuildPhase) -> Build {
        let mut labels = BTreeMap::new();
        labels.insert(BUILD_CONFIG_LABEL.to_string(), "bc".to_string());
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

    #[tokio::test]
    async fn test_next_build_is_enqueued() {
        let cluster = FakeCluster::new();
        cluster.put_build(sibling("b1", 1, BuildPhase::Complete));
        cluster.put_build(sibling("b2", 2, BuildPhase::New));

        let controller = controller(&cluster);
        controller.handle_build_config("ns1", "bc").await.unwrap();
        assert_eq!(
            controller.build_queue.get().await.as_deref(),
            Some("ns1/b2")
        );
    }

    #[tokio::test]
    async fn test_running_sibling_defers_with_error() {
        let cluster = FakeCluster::new();
        cluster.put_build(sibling("b1", 1, BuildPhase::Running));
        cluster.put_build(sibling("b2", 2, BuildPhase::New));

        let controller = controller(&cluster);
        let err = controller.handle_build_config("ns1", "bc").await.unwrap_err();
        assert!(err.to_string().contains("has running builds"));
        assert!(controller.build_queue.is_empty());
    }

    #[tokio::test]
    async fn test_no_queued_builds_is_an_error() {
        let cluster = FakeCluster::new();
        cluster.put_build(sibling("b1", 1, BuildPhase::Complete));

        let controller = controller(&cluster);
        let err = controller.handle_build_config("ns1", "bc").await.unwrap_err();
        assert!(err.to_string().contains("no builds to run next"));
    }
}
