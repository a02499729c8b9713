//! In-memory fakes of the cluster, registry and notification collaborators.

use crate::cluster::{ClusterApi, SecretPayload};
use crate::credentials::RegistryCredential;
use crate::image_reference::ImageReference;
use crate::notifier::NotificationTransport;
use crate::oci_registry::DigestResolver;
use crate::workload::{
    ContainerSpec, PodSnapshot, RevisionKind, RevisionSnapshot, RolloutStatus, WorkloadKind,
    WorkloadRef, WorkloadSnapshot,
};
use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

pub fn workload(
    kind: WorkloadKind,
    namespace: &str,
    name: &str,
    containers: &[(&str, &str, &str)],
) -> WorkloadSnapshot {
    WorkloadSnapshot {
        reference: WorkloadRef {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        },
        available: 1,
        selector: format!("app={}", name),
        containers: containers
            .iter()
            .map(|(name, image, policy)| ContainerSpec {
                name: name.to_string(),
                image: image.to_string(),
                image_pull_policy: Some(policy.to_string()),
            })
            .collect(),
        image_pull_secrets: Vec::new(),
        status: converged_status(kind, 1),
    }
}

pub fn pod(name: &str, ready: bool, image_ids: &[(&str, &str)]) -> PodSnapshot {
    PodSnapshot {
        name: name.to_string(),
        ready,
        image_ids: image_ids
            .iter()
            .map(|(c, id)| (c.to_string(), id.to_string()))
            .collect(),
    }
}

fn converged_status(kind: WorkloadKind, generation: i64) -> RolloutStatus {
    match kind {
        WorkloadKind::DaemonSet => RolloutStatus::NodeDaemon {
            generation,
            observed_generation: generation,
            desired_scheduled: 1,
            updated_scheduled: 1,
            ready: 1,
            available: 1,
        },
        _ => RolloutStatus::ScaledReplicas {
            generation,
            observed_generation: generation,
            desired: Some(1),
            updated: 1,
            current: 1,
            ready: 1,
        },
    }
}

fn progressing_status(kind: WorkloadKind, generation: i64) -> RolloutStatus {
    match kind {
        WorkloadKind::DaemonSet => RolloutStatus::NodeDaemon {
            generation,
            observed_generation: generation,
            desired_scheduled: 1,
            updated_scheduled: 0,
            ready: 1,
            available: 1,
        },
        _ => RolloutStatus::ScaledReplicas {
            generation,
            observed_generation: generation,
            desired: Some(1),
            updated: 0,
            current: 2,
            ready: 1,
        },
    }
}

fn generation_of(status: &RolloutStatus) -> i64 {
    match *status {
        RolloutStatus::ScaledReplicas { generation, .. }
        | RolloutStatus::NodeDaemon { generation, .. } => generation,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchRecord {
    pub workload: WorkloadRef,
    pub container: String,
    pub image: String,
}

#[derive(Default)]
struct FakeClusterState {
    workloads: Vec<WorkloadSnapshot>,
    pods: BTreeMap<(String, String), Vec<PodSnapshot>>,
    secrets: BTreeMap<(String, String), SecretPayload>,
    revisions: BTreeMap<WorkloadRef, Vec<RevisionSnapshot>>,
    patches: Vec<PatchRecord>,
    deleted: Vec<String>,
    /// Remaining status polls before an in-flight rollout converges.
    rollouts: BTreeMap<WorkloadRef, usize>,
    status_polls: usize,
    polls_before_ready: usize,
    stuck: bool,
    reject_patches: bool,
    fail_cleanup: bool,
}

/// A cluster whose rollouts converge after a configurable number of status polls.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<FakeClusterState>,
}

impl FakeCluster {
    fn with_state<T>(&self, f: impl FnOnce(&mut FakeClusterState) -> T) -> T {
        let mut state = self.state.lock().expect("fake cluster lock poisoned");
        f(&mut state)
    }

    pub fn add_workload(&self, workload: WorkloadSnapshot) {
        self.with_state(|s| s.workloads.push(workload));
    }

    pub fn add_pods(&self, namespace: &str, selector: &str, pods: Vec<PodSnapshot>) {
        self.with_state(|s| {
            s.pods
                .insert((namespace.to_string(), selector.to_string()), pods)
        });
    }

    pub fn add_secret(&self, namespace: &str, name: &str, payload: SecretPayload) {
        self.with_state(|s| {
            s.secrets
                .insert((namespace.to_string(), name.to_string()), payload)
        });
    }

    pub fn add_revisions(&self, workload: &WorkloadRef, revisions: Vec<RevisionSnapshot>) {
        self.with_state(|s| s.revisions.insert(workload.clone(), revisions));
    }

    pub fn set_polls_before_ready(&self, polls: usize) {
        self.with_state(|s| s.polls_before_ready = polls);
    }

    pub fn set_stuck(&self, stuck: bool) {
        self.with_state(|s| s.stuck = stuck);
    }

    pub fn set_reject_patches(&self, reject: bool) {
        self.with_state(|s| s.reject_patches = reject);
    }

    pub fn set_fail_cleanup(&self, fail: bool) {
        self.with_state(|s| s.fail_cleanup = fail);
    }

    pub fn patches(&self) -> Vec<PatchRecord> {
        self.with_state(|s| s.patches.clone())
    }

    pub fn deleted(&self) -> Vec<String> {
        self.with_state(|s| s.deleted.clone())
    }

    pub fn status_polls(&self) -> usize {
        self.with_state(|s| s.status_polls)
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn list_workloads(
        &self,
        kind: WorkloadKind,
        namespace: Option<&str>,
    ) -> Result<Vec<WorkloadSnapshot>> {
        Ok(self.with_state(|s| {
            s.workloads
                .iter()
                .filter(|w| w.reference.kind == kind)
                .filter(|w| namespace.is_none_or(|ns| w.reference.namespace == ns))
                .cloned()
                .collect()
        }))
    }

    async fn get_workload(&self, workload: &WorkloadRef) -> Result<Option<WorkloadSnapshot>> {
        Ok(self.with_state(|s| {
            if let Some(remaining) = s.rollouts.get(workload).copied() {
                s.status_polls += 1;
                if !s.stuck {
                    if remaining == 0 {
                        s.rollouts.remove(workload);
                        if let Some(w) = s.workloads.iter_mut().find(|w| &w.reference == workload) {
                            w.status = converged_status(w.reference.kind, generation_of(&w.status));
                        }
                    } else {
                        s.rollouts.insert(workload.clone(), remaining - 1);
                    }
                }
            }
            s.workloads
                .iter()
                .find(|w| &w.reference == workload)
                .cloned()
        }))
    }

    async fn patch_container_image(
        &self,
        workload: &WorkloadRef,
        container: &str,
        image: &str,
        _updated_at: DateTime<Utc>,
    ) -> Result<()> {
        self.with_state(|s| {
            if s.reject_patches {
                bail!("the object has been modified; please apply your changes to the latest version");
            }
            let polls_before_ready = s.polls_before_ready;
            let w = s
                .workloads
                .iter_mut()
                .find(|w| &w.reference == workload)
                .context("workload not found")?;
            let spec = w
                .containers
                .iter_mut()
                .find(|c| c.name == container)
                .context("container not found")?;
            spec.image = image.to_string();
            w.status = progressing_status(w.reference.kind, generation_of(&w.status) + 1);

            // Pods restarted by the rollout report the pinned digest
            let key = (w.reference.namespace.clone(), w.selector.clone());
            let image_id = ImageReference::parse(image)
                .digest
                .map(|d| format!("{}@{}", ImageReference::parse(image).repository, d))
                .unwrap_or_default();
            if let Some(pods) = s.pods.get_mut(&key) {
                for pod in pods.iter_mut() {
                    for (name, id) in pod.image_ids.iter_mut() {
                        if name == container {
                            *id = image_id.clone();
                        }
                    }
                }
            }

            s.patches.push(PatchRecord {
                workload: workload.clone(),
                container: container.to_string(),
                image: image.to_string(),
            });
            s.rollouts.insert(workload.clone(), polls_before_ready);
            Ok(())
        })
    }

    async fn list_pods_by_selector(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<PodSnapshot>> {
        Ok(self.with_state(|s| {
            s.pods
                .get(&(namespace.to_string(), selector.to_string()))
                .cloned()
                .unwrap_or_default()
        }))
    }

    async fn list_revisions(&self, workload: &WorkloadRef) -> Result<Vec<RevisionSnapshot>> {
        self.with_state(|s| {
            if s.fail_cleanup {
                bail!("forbidden: cannot list revisions");
            }
            Ok(s.revisions.get(workload).cloned().unwrap_or_default())
        })
    }

    async fn delete_object(&self, kind: RevisionKind, namespace: &str, name: &str) -> Result<()> {
        self.with_state(|s| {
            s.deleted.push(format!("{}/{}/{}", kind, namespace, name));
            Ok(())
        })
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<SecretPayload>> {
        Ok(self.with_state(|s| {
            s.secrets
                .get(&(namespace.to_string(), name.to_string()))
                .cloned()
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestCall {
    pub image: String,
    pub username: Option<String>,
}

/// A registry serving fixed digests keyed by `repository:tag`.
#[derive(Default)]
pub struct FakeRegistry {
    digests: Mutex<BTreeMap<String, String>>,
    failing: Mutex<BTreeSet<String>>,
    calls: Mutex<Vec<DigestCall>>,
}

impl FakeRegistry {
    pub fn set_digest(&self, image: &str, digest: &str) {
        self.digests
            .lock()
            .expect("fake registry lock poisoned")
            .insert(image.to_string(), digest.to_string());
    }

    pub fn fail(&self, image: &str) {
        self.failing
            .lock()
            .expect("fake registry lock poisoned")
            .insert(image.to_string());
    }

    pub fn calls(&self) -> Vec<DigestCall> {
        self.calls.lock().expect("fake registry lock poisoned").clone()
    }
}

#[async_trait]
impl DigestResolver for FakeRegistry {
    async fn get_digest(
        &self,
        image: &ImageReference,
        credential: Option<&RegistryCredential>,
    ) -> Result<String> {
        let key = image.tagged();
        self.calls
            .lock()
            .expect("fake registry lock poisoned")
            .push(DigestCall {
                image: key.clone(),
                username: credential.map(|c| c.username.clone()),
            });

        if self
            .failing
            .lock()
            .expect("fake registry lock poisoned")
            .contains(&key)
        {
            return Err(anyhow!("registry unavailable for {}", key));
        }

        self.digests
            .lock()
            .expect("fake registry lock poisoned")
            .get(&key)
            .cloned()
            .with_context(|| format!("manifest unknown: {}", key))
    }
}

/// Records every message instead of delivering it.
#[derive(Default)]
pub struct FakeTransport {
    sent: Mutex<Vec<(String, String)>>,
}

impl FakeTransport {
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().expect("fake transport lock poisoned").clone()
    }
}

#[async_trait]
impl NotificationTransport for FakeTransport {
    async fn send(&self, destination: &str, message: &str) -> Result<()> {
        self.sent
            .lock()
            .expect("fake transport lock poisoned")
            .push((destination.to_string(), message.to_string()));
        Ok(())
    }
}
