use crate::workload::{
    ContainerSpec, PodSnapshot, RevisionKind, RevisionSnapshot, RolloutStatus, WorkloadKind,
    WorkloadRef, WorkloadSnapshot,
};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::{ControllerRevision, DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::{Pod, PodSpec, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::Debug;
use tracing::{debug, info, warn};

pub static UPDATED_AT_ANNOTATION: &str = "kube-watchtower.io/updated-at";
static FIELD_MANAGER: &str = "kube-watchtower";

/// Raw pull secret as stored in the cluster.
#[derive(Debug, Clone, Default)]
pub struct SecretPayload {
    pub type_: Option<String>,
    pub data: BTreeMap<String, Vec<u8>>,
}

/// Cluster operations the reconciliation engine depends on.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Lists workloads of `kind`, in `namespace` or across all namespaces.
    async fn list_workloads(
        &self,
        kind: WorkloadKind,
        namespace: Option<&str>,
    ) -> anyhow::Result<Vec<WorkloadSnapshot>>;

    async fn get_workload(&self, workload: &WorkloadRef)
    -> anyhow::Result<Option<WorkloadSnapshot>>;

    /// Sets the container image in the pod template and stamps the update annotation.
    async fn patch_container_image(
        &self,
        workload: &WorkloadRef,
        container: &str,
        image: &str,
        updated_at: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    /// Pods matching `selector`, newest first.
    async fn list_pods_by_selector(
        &self,
        namespace: &str,
        selector: &str,
    ) -> anyhow::Result<Vec<PodSnapshot>>;

    /// Revision records (ReplicaSets or ControllerRevisions) owned by the workload.
    async fn list_revisions(&self, workload: &WorkloadRef)
    -> anyhow::Result<Vec<RevisionSnapshot>>;

    async fn delete_object(
        &self,
        kind: RevisionKind,
        namespace: &str,
        name: &str,
    ) -> anyhow::Result<()>;

    async fn get_secret(&self, namespace: &str, name: &str)
    -> anyhow::Result<Option<SecretPayload>>;
}

pub async fn create_client() -> anyhow::Result<Client> {
    info!("Initializing K8s client");
    let client = Client::try_default()
        .await
        .context("Failed to load Kubernetes client configuration")?;
    let api_server_info = client
        .apiserver_version()
        .await
        .context("Failed to reach Kubernetes API server")?;
    info!(
        "Connected to Kubernetes API server with version {}.{}",
        api_server_info.major, api_server_info.minor
    );
    Ok(client)
}

/// Uniform view over the workload kinds that run pods from a template.
pub trait WorkloadResource
where
    Self: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Send
        + Sync
        + DeserializeOwned
        + 'static,
{
    const KIND: WorkloadKind;

    fn label_selector(&self) -> Option<&LabelSelector>;
    fn pod_spec(&self) -> Option<&PodSpec>;
    fn available(&self) -> i32;
    fn rollout_status(&self) -> RolloutStatus;

    fn image_pull_secrets(&self) -> Vec<String> {
        self.pod_spec()
            .and_then(|ps| ps.image_pull_secrets.as_ref())
            .map(|secrets| secrets.iter().map(|s| s.name.clone()).collect())
            .unwrap_or_default()
    }

    fn generation(&self) -> i64 {
        self.meta().generation.unwrap_or(0)
    }

    fn snapshot(&self) -> Option<WorkloadSnapshot> {
        let meta = self.meta();
        let reference = WorkloadRef {
            kind: Self::KIND,
            namespace: meta.namespace.clone()?,
            name: meta.name.clone()?,
        };
        let containers = self
            .pod_spec()
            .map(|ps| {
                ps.containers
                    .iter()
                    .map(|c| ContainerSpec {
                        name: c.name.clone(),
                        image: c.image.clone().unwrap_or_default(),
                        image_pull_policy: c.image_pull_policy.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Some(WorkloadSnapshot {
            reference,
            available: self.available(),
            selector: self.label_selector().map(format_selector).unwrap_or_default(),
            containers,
            image_pull_secrets: self.image_pull_secrets(),
            status: self.rollout_status(),
        })
    }
}

impl WorkloadResource for Deployment {
    const KIND: WorkloadKind = WorkloadKind::Deployment;

    fn label_selector(&self) -> Option<&LabelSelector> {
        self.spec.as_ref().map(|s| &s.selector)
    }

    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref().and_then(|s| s.template.spec.as_ref())
    }

    fn available(&self) -> i32 {
        self.status
            .as_ref()
            .and_then(|s| s.available_replicas)
            .unwrap_or(0)
    }

    //https://kubernetes.io/docs/reference/kubernetes-api/workload-resources/deployment-v1/#DeploymentStatus
    fn rollout_status(&self) -> RolloutStatus {
        let status = self.status.clone().unwrap_or_default();
        RolloutStatus::ScaledReplicas {
            generation: self.generation(),
            observed_generation: status.observed_generation.unwrap_or(0),
            desired: self.spec.as_ref().and_then(|s| s.replicas),
            updated: status.updated_replicas.unwrap_or(0),
            current: status.replicas.unwrap_or(0),
            ready: status.available_replicas.unwrap_or(0),
        }
    }
}

impl WorkloadResource for StatefulSet {
    const KIND: WorkloadKind = WorkloadKind::StatefulSet;

    fn label_selector(&self) -> Option<&LabelSelector> {
        self.spec.as_ref().map(|s| &s.selector)
    }

    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref().and_then(|s| s.template.spec.as_ref())
    }

    fn available(&self) -> i32 {
        self.status
            .as_ref()
            .and_then(|s| s.available_replicas)
            .unwrap_or(0)
    }

    //https://kubernetes.io/docs/reference/kubernetes-api/workload-resources/stateful-set-v1/#StatefulSetStatus
    fn rollout_status(&self) -> RolloutStatus {
        let status = self.status.clone().unwrap_or_default();
        RolloutStatus::ScaledReplicas {
            generation: self.generation(),
            observed_generation: status.observed_generation.unwrap_or(0),
            desired: self.spec.as_ref().and_then(|s| s.replicas),
            updated: status.updated_replicas.unwrap_or(0),
            current: status.replicas,
            ready: status.ready_replicas.unwrap_or(0),
        }
    }
}

impl WorkloadResource for DaemonSet {
    const KIND: WorkloadKind = WorkloadKind::DaemonSet;

    fn label_selector(&self) -> Option<&LabelSelector> {
        self.spec.as_ref().map(|s| &s.selector)
    }

    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref().and_then(|s| s.template.spec.as_ref())
    }

    fn available(&self) -> i32 {
        self.status
            .as_ref()
            .and_then(|s| s.number_available)
            .unwrap_or(0)
    }

    //https://kubernetes.io/docs/reference/kubernetes-api/workload-resources/daemon-set-v1/#DaemonSetStatus
    fn rollout_status(&self) -> RolloutStatus {
        let status = self.status.clone().unwrap_or_default();
        RolloutStatus::NodeDaemon {
            generation: self.generation(),
            observed_generation: status.observed_generation.unwrap_or(0),
            desired_scheduled: status.desired_number_scheduled,
            updated_scheduled: status.updated_number_scheduled.unwrap_or(0),
            ready: status.number_ready,
            available: status.number_available.unwrap_or(0),
        }
    }
}

/// Formats a label selector like `kubectl` does: `app=web,tier in (a,b),!legacy`.
///
/// A requirement with an unknown operator yields an empty selector, so no pods are matched
/// by a wider selector than the workload's own.
pub fn format_selector(selector: &LabelSelector) -> String {
    let mut parts: Vec<String> = selector
        .match_labels
        .iter()
        .flatten()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();

    for req in selector.match_expressions.iter().flatten() {
        let values = req.values.clone().unwrap_or_default().join(",");
        parts.push(match req.operator.as_str() {
            "In" => format!("{} in ({})", req.key, values),
            "NotIn" => format!("{} notin ({})", req.key, values),
            "Exists" => req.key.clone(),
            "DoesNotExist" => format!("!{}", req.key),
            other => {
                warn!(
                    "Unsupported selector operator '{}' for key {}, ignoring selector",
                    other, req.key
                );
                return String::new();
            }
        });
    }

    parts.join(",")
}

/// `ClusterApi` backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K: WorkloadResource>(&self, namespace: Option<&str>) -> Api<K> {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    async fn list<K: WorkloadResource>(
        &self,
        namespace: Option<&str>,
    ) -> anyhow::Result<Vec<WorkloadSnapshot>> {
        let list = self
            .api::<K>(namespace)
            .list(&ListParams::default())
            .await
            .with_context(|| format!("Failed to list {}s", K::KIND))?;
        Ok(list.items.iter().filter_map(|w| w.snapshot()).collect())
    }

    async fn get<K: WorkloadResource>(&self, workload: &WorkloadRef) -> anyhow::Result<Option<K>> {
        self.api::<K>(Some(&workload.namespace))
            .get_opt(&workload.name)
            .await
            .with_context(|| format!("Failed to get {}", workload))
    }

    async fn patch<K: WorkloadResource>(
        &self,
        workload: &WorkloadRef,
        patch: &serde_json::Value,
    ) -> anyhow::Result<()> {
        debug!("Patching {} with patch {}", workload, patch);
        self.api::<K>(Some(&workload.namespace))
            .patch(
                &workload.name,
                &PatchParams {
                    field_manager: Some(FIELD_MANAGER.to_string()),
                    ..Default::default()
                },
                &Patch::Strategic(patch),
            )
            .await
            .with_context(|| format!("Failed to patch {}", workload))?;
        Ok(())
    }

    /// Uid and selector of the workload, needed to find the revisions it owns.
    async fn owner_info<K: WorkloadResource>(
        &self,
        workload: &WorkloadRef,
    ) -> anyhow::Result<Option<(String, String)>> {
        Ok(self.get::<K>(workload).await?.and_then(|w| {
            let uid = w.meta().uid.clone()?;
            let selector = w.label_selector().map(format_selector).unwrap_or_default();
            Some((uid, selector))
        }))
    }
}

fn is_owned_by(meta: &ObjectMeta, uid: &str) -> bool {
    meta.owner_references
        .iter()
        .flatten()
        .any(|owner| owner.uid == uid)
}

fn is_pod_ready(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    let running = status.phase.as_deref() == Some("Running");
    let ready = status
        .conditions
        .iter()
        .flatten()
        .any(|c| c.type_ == "Ready" && c.status == "True");
    running && ready
}

fn sort_pods_by_creation_timestamp(a: &Pod, b: &Pod) -> Ordering {
    let a = &a.metadata.creation_timestamp;
    let b = &b.metadata.creation_timestamp;

    b.cmp(a)
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn list_workloads(
        &self,
        kind: WorkloadKind,
        namespace: Option<&str>,
    ) -> anyhow::Result<Vec<WorkloadSnapshot>> {
        match kind {
            WorkloadKind::Deployment => self.list::<Deployment>(namespace).await,
            WorkloadKind::DaemonSet => self.list::<DaemonSet>(namespace).await,
            WorkloadKind::StatefulSet => self.list::<StatefulSet>(namespace).await,
        }
    }

    async fn get_workload(
        &self,
        workload: &WorkloadRef,
    ) -> anyhow::Result<Option<WorkloadSnapshot>> {
        Ok(match workload.kind {
            WorkloadKind::Deployment => self.get::<Deployment>(workload).await?.and_then(|w| w.snapshot()),
            WorkloadKind::DaemonSet => self.get::<DaemonSet>(workload).await?.and_then(|w| w.snapshot()),
            WorkloadKind::StatefulSet => self.get::<StatefulSet>(workload).await?.and_then(|w| w.snapshot()),
        })
    }

    async fn patch_container_image(
        &self,
        workload: &WorkloadRef,
        container: &str,
        image: &str,
        updated_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        // Strategic merge matches the containers list by name
        let patch = json!({
            "spec": {
                "template": {
                    "metadata": {
                        "annotations": {
                            UPDATED_AT_ANNOTATION: updated_at.to_rfc3339(),
                        }
                    },
                    "spec": {
                        "containers": [
                            { "name": container, "image": image }
                        ]
                    }
                }
            }
        });

        match workload.kind {
            WorkloadKind::Deployment => self.patch::<Deployment>(workload, &patch).await,
            WorkloadKind::DaemonSet => self.patch::<DaemonSet>(workload, &patch).await,
            WorkloadKind::StatefulSet => self.patch::<StatefulSet>(workload, &patch).await,
        }
    }

    async fn list_pods_by_selector(
        &self,
        namespace: &str,
        selector: &str,
    ) -> anyhow::Result<Vec<PodSnapshot>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let mut pod_list = pods
            .list(&ListParams::default().labels(selector))
            .await
            .with_context(|| format!("Failed to list pods matching selector {}", selector))?;

        pod_list.items.sort_by(sort_pods_by_creation_timestamp);

        Ok(pod_list
            .items
            .iter()
            .map(|pod| PodSnapshot {
                name: pod.metadata.name.clone().unwrap_or_default(),
                ready: is_pod_ready(pod),
                image_ids: pod
                    .status
                    .as_ref()
                    .and_then(|s| s.container_statuses.as_ref())
                    .map(|statuses| {
                        statuses
                            .iter()
                            .map(|cs| (cs.name.clone(), cs.image_id.clone()))
                            .collect()
                    })
                    .unwrap_or_default(),
            })
            .collect())
    }

    async fn list_revisions(
        &self,
        workload: &WorkloadRef,
    ) -> anyhow::Result<Vec<RevisionSnapshot>> {
        let owner = match workload.kind {
            WorkloadKind::Deployment => self.owner_info::<Deployment>(workload).await?,
            WorkloadKind::DaemonSet => self.owner_info::<DaemonSet>(workload).await?,
            WorkloadKind::StatefulSet => self.owner_info::<StatefulSet>(workload).await?,
        };
        let Some((uid, selector)) = owner else {
            return Ok(Vec::new());
        };
        let lp = ListParams::default().labels(&selector);

        match workload.kind.revision_kind() {
            RevisionKind::ReplicaSet => {
                let api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), &workload.namespace);
                let list = api
                    .list(&lp)
                    .await
                    .with_context(|| format!("Failed to list ReplicaSets of {}", workload))?;
                Ok(list
                    .items
                    .iter()
                    .filter(|rs| is_owned_by(&rs.metadata, &uid))
                    .map(|rs| RevisionSnapshot {
                        name: rs.metadata.name.clone().unwrap_or_default(),
                        kind: RevisionKind::ReplicaSet,
                        replicas: rs.spec.as_ref().and_then(|s| s.replicas),
                        revision: rs
                            .metadata
                            .annotations
                            .as_ref()
                            .and_then(|a| a.get("deployment.kubernetes.io/revision"))
                            .and_then(|r| r.parse().ok())
                            .unwrap_or(0),
                    })
                    .collect())
            }
            RevisionKind::ControllerRevision => {
                let api: Api<ControllerRevision> =
                    Api::namespaced(self.client.clone(), &workload.namespace);
                let list = api.list(&lp).await.with_context(|| {
                    format!("Failed to list ControllerRevisions of {}", workload)
                })?;
                Ok(list
                    .items
                    .iter()
                    .filter(|cr| is_owned_by(&cr.metadata, &uid))
                    .map(|cr| RevisionSnapshot {
                        name: cr.metadata.name.clone().unwrap_or_default(),
                        kind: RevisionKind::ControllerRevision,
                        replicas: None,
                        revision: cr.revision,
                    })
                    .collect())
            }
        }
    }

    async fn delete_object(
        &self,
        kind: RevisionKind,
        namespace: &str,
        name: &str,
    ) -> anyhow::Result<()> {
        let dp = DeleteParams::default();
        match kind {
            RevisionKind::ReplicaSet => {
                let api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), namespace);
                api.delete(name, &dp).await.map(|_| ())
            }
            RevisionKind::ControllerRevision => {
                let api: Api<ControllerRevision> = Api::namespaced(self.client.clone(), namespace);
                api.delete(name, &dp).await.map(|_| ())
            }
        }
        .with_context(|| format!("Failed to delete {} {}/{}", kind, namespace, name))
    }

    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> anyhow::Result<Option<SecretPayload>> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = secrets
            .get_opt(name)
            .await
            .with_context(|| format!("Failed to get secret {}/{}", namespace, name))?;

        Ok(secret.map(|s| SecretPayload {
            type_: s.type_,
            data: s
                .data
                .unwrap_or_default()
                .into_iter()
                .map(|(k, v)| (k, v.0))
                .collect(),
        }))
    }
}
