use crate::cluster::ClusterApi;
use crate::config::RolloutSettings;
use crate::image_reference::ImageReference;
use crate::workload::WorkloadRef;
use chrono::Utc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RolloutError {
    /// The container is not part of the current spec. Retrying will not help.
    #[error("container {container} not found in {workload}")]
    NotFound {
        workload: WorkloadRef,
        container: String,
    },

    /// The cluster refused the update, e.g. because of a conflict. May be retried.
    #[error("update of {workload} rejected: {reason}")]
    PatchRejected { workload: WorkloadRef, reason: String },

    #[error("rollout of {workload} did not complete within {timeout:?}")]
    RolloutTimeout {
        workload: WorkloadRef,
        timeout: Duration,
    },

    #[error("update of {workload} cancelled")]
    Cancelled { workload: WorkloadRef },
}

/// Pins a container to a digest and waits for the workload to roll out.
pub struct RolloutExecutor<'a> {
    cluster: &'a dyn ClusterApi,
    settings: RolloutSettings,
    cleanup: bool,
}

impl<'a> RolloutExecutor<'a> {
    pub fn new(cluster: &'a dyn ClusterApi, settings: RolloutSettings, cleanup: bool) -> Self {
        Self {
            cluster,
            settings,
            cleanup,
        }
    }

    /// Patches `container` of `workload` to `image`, which is expected to carry a digest, then
    /// polls until the rollout completes. Cleanup runs afterwards and never fails the update.
    pub async fn update(
        &self,
        workload: &WorkloadRef,
        container: &str,
        image: &ImageReference,
        cancel: &CancellationToken,
    ) -> Result<(), RolloutError> {
        let cancelled = || RolloutError::Cancelled {
            workload: workload.clone(),
        };
        let not_found = || RolloutError::NotFound {
            workload: workload.clone(),
            container: container.to_string(),
        };

        let current = cancel
            .run_until_cancelled(self.cluster.get_workload(workload))
            .await
            .ok_or_else(cancelled)?
            .map_err(|e| RolloutError::PatchRejected {
                workload: workload.clone(),
                reason: format!("{:#}", e),
            })?
            .ok_or_else(not_found)?;
        if current.container(container).is_none() {
            return Err(not_found());
        }

        let image = image.to_string();
        info!("Updating container {} of {} to {}", container, workload, image);
        cancel
            .run_until_cancelled(self.cluster.patch_container_image(
                workload,
                container,
                &image,
                Utc::now(),
            ))
            .await
            .ok_or_else(cancelled)?
            .map_err(|e| RolloutError::PatchRejected {
                workload: workload.clone(),
                reason: format!("{:#}", e),
            })?;

        self.wait_for_rollout(workload, container, cancel).await?;
        info!("Rollout of {} completed", workload);

        if self.cleanup {
            self.cleanup_revisions(workload, cancel).await;
        }
        Ok(())
    }

    async fn wait_for_rollout(
        &self,
        workload: &WorkloadRef,
        container: &str,
        cancel: &CancellationToken,
    ) -> Result<(), RolloutError> {
        let poll = async {
            loop {
                tokio::time::sleep(self.settings.poll_interval).await;
                match self.cluster.get_workload(workload).await {
                    Ok(Some(current)) if current.status.is_complete() => return Ok(()),
                    Ok(Some(current)) => {
                        debug!("Rollout of {} in progress: {:?}", workload, current.status)
                    }
                    Ok(None) => {
                        return Err(RolloutError::NotFound {
                            workload: workload.clone(),
                            container: container.to_string(),
                        });
                    }
                    Err(e) => warn!("Failed to get rollout status of {}: {:#}", workload, e),
                }
            }
        };

        match cancel
            .run_until_cancelled(tokio::time::timeout(self.settings.timeout, poll))
            .await
        {
            None => Err(RolloutError::Cancelled {
                workload: workload.clone(),
            }),
            Some(Err(_)) => Err(RolloutError::RolloutTimeout {
                workload: workload.clone(),
                timeout: self.settings.timeout,
            }),
            Some(Ok(result)) => result,
        }
    }

    async fn cleanup_revisions(&self, workload: &WorkloadRef, cancel: &CancellationToken) {
        let revisions = match cancel
            .run_until_cancelled(self.cluster.list_revisions(workload))
            .await
        {
            Some(Ok(revisions)) => revisions,
            Some(Err(e)) => {
                warn!("Cleanup of {} skipped: {:#}", workload, e);
                return;
            }
            None => return,
        };

        for revision in workload.kind.cleanup_strategy().select(&revisions) {
            let deleted = cancel
                .run_until_cancelled(self.cluster.delete_object(
                    revision.kind,
                    &workload.namespace,
                    &revision.name,
                ))
                .await;
            match deleted {
                Some(Ok(())) => info!(
                    "Deleted {} {}/{}",
                    revision.kind, workload.namespace, revision.name
                ),
                Some(Err(e)) => warn!(
                    "Failed to delete {} {}/{}: {:#}",
                    revision.kind, workload.namespace, revision.name, e
                ),
                None => return,
            }
        }
    }
}
