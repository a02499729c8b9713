use crate::cluster::ClusterApi;
use crate::image_reference::{ImageReference, digest_from_image_id};
use crate::workload::{
    ContainerObservation, MONITORED_KINDS, ObservedWorkload, PodSnapshot, WorkloadSnapshot,
};
use anyhow::{Result, bail};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

static PULL_POLICY_ALWAYS: &str = "Always";

/// Builds the per-cycle list of workloads and containers that are candidates for an update.
pub struct InventoryReader<'a> {
    cluster: &'a dyn ClusterApi,
    namespace: Option<&'a str>,
}

impl<'a> InventoryReader<'a> {
    pub fn new(cluster: &'a dyn ClusterApi, namespace: Option<&'a str>) -> Self {
        Self { cluster, namespace }
    }

    /// Lists every monitored kind. Unhealthy workloads and containers that don't always re-pull
    /// are dropped; a workload without a ready pod keeps its containers with an unknown digest.
    pub async fn list(&self, cancel: &CancellationToken) -> Result<Vec<ObservedWorkload>> {
        let mut observed = Vec::new();

        for kind in MONITORED_KINDS {
            let Some(workloads) = cancel
                .run_until_cancelled(self.cluster.list_workloads(kind, self.namespace))
                .await
            else {
                bail!("Inventory listing cancelled");
            };

            for workload in workloads? {
                if workload.available <= 0 {
                    debug!(
                        "Skipping {}: no available replicas ({})",
                        workload.reference, workload.available
                    );
                    continue;
                }

                if let Some(workload) = self.observe(workload, cancel).await {
                    observed.push(workload);
                }
            }
        }

        Ok(observed)
    }

    async fn observe(
        &self,
        workload: WorkloadSnapshot,
        cancel: &CancellationToken,
    ) -> Option<ObservedWorkload> {
        let mut containers: Vec<ContainerObservation> = workload
            .containers
            .iter()
            .filter_map(|container| {
                let pull_policy = container.image_pull_policy.as_deref().unwrap_or_default();
                if pull_policy != PULL_POLICY_ALWAYS {
                    debug!(
                        "Skipping container {} of {} (image pull policy: {})",
                        container.name, workload.reference, pull_policy
                    );
                    return None;
                }

                let image = ImageReference::parse(&container.image);
                if image.repository.is_empty() {
                    warn!(
                        "Skipping container {} of {}: invalid image '{}'",
                        container.name, workload.reference, container.image
                    );
                    return None;
                }

                Some(ContainerObservation {
                    name: container.name.clone(),
                    image,
                    declared_image: container.image.clone(),
                    image_pull_policy: pull_policy.to_string(),
                    running_digest: None,
                })
            })
            .collect();

        if containers.is_empty() {
            return None;
        }

        if workload.selector.is_empty() {
            debug!("{} has no label selector, running digests unknown", workload.reference);
        } else {
            let pods = cancel
                .run_until_cancelled(
                    self.cluster
                        .list_pods_by_selector(&workload.reference.namespace, &workload.selector),
                )
                .await;
            match pods {
                Some(Ok(pods)) => fill_running_digests(&pods, &mut containers, &workload),
                Some(Err(e)) => debug!(
                    "Unable to get running digests for {}: {:#}",
                    workload.reference, e
                ),
                None => return None,
            }
        }

        Some(ObservedWorkload {
            reference: workload.reference,
            image_pull_secrets: workload.image_pull_secrets,
            containers,
        })
    }
}

/// Takes digests from the newest ready pod. Pods are expected newest first.
fn fill_running_digests(
    pods: &[PodSnapshot],
    containers: &mut [ContainerObservation],
    workload: &WorkloadSnapshot,
) {
    let Some(pod) = pods.iter().find(|pod| pod.ready) else {
        debug!("No ready pod found for {}", workload.reference);
        return;
    };
    debug!("Reading running digests of {} from pod {}", workload.reference, pod.name);

    for container in containers.iter_mut() {
        container.running_digest = pod
            .image_ids
            .iter()
            .find(|(name, _)| *name == container.name)
            .and_then(|(_, image_id)| digest_from_image_id(image_id));
    }
}
