use crate::image_reference::ImageReference;
use std::fmt;

/// Workload kinds that are monitored, in the order they are listed every cycle.
pub const MONITORED_KINDS: [WorkloadKind; 3] = [
    WorkloadKind::Deployment,
    WorkloadKind::DaemonSet,
    WorkloadKind::StatefulSet,
];

/// Number of revision records kept for kinds tracked by ControllerRevisions.
const KEPT_CONTROLLER_REVISIONS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkloadKind {
    Deployment,
    DaemonSet,
    StatefulSet,
}

impl WorkloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::DaemonSet => "DaemonSet",
            WorkloadKind::StatefulSet => "StatefulSet",
        }
    }

    /// Object kind that records old revisions of this workload.
    pub fn revision_kind(&self) -> RevisionKind {
        match self {
            WorkloadKind::Deployment => RevisionKind::ReplicaSet,
            WorkloadKind::DaemonSet | WorkloadKind::StatefulSet => RevisionKind::ControllerRevision,
        }
    }

    pub fn cleanup_strategy(&self) -> CleanupStrategy {
        match self {
            WorkloadKind::Deployment => CleanupStrategy::PruneScaledToZero,
            WorkloadKind::DaemonSet | WorkloadKind::StatefulSet => {
                CleanupStrategy::KeepNewest(KEPT_CONTROLLER_REVISIONS)
            }
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevisionKind {
    ReplicaSet,
    ControllerRevision,
}

impl fmt::Display for RevisionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RevisionKind::ReplicaSet => f.write_str("ReplicaSet"),
            RevisionKind::ControllerRevision => f.write_str("ControllerRevision"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkloadRef {
    pub kind: WorkloadKind,
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} ({})", self.namespace, self.name, self.kind)
    }
}

/// Rollout progress as reported by the workload status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloutStatus {
    /// Deployments and StatefulSets.
    ScaledReplicas {
        generation: i64,
        observed_generation: i64,
        desired: Option<i32>,
        updated: i32,
        current: i32,
        ready: i32,
    },
    /// DaemonSets.
    NodeDaemon {
        generation: i64,
        observed_generation: i64,
        desired_scheduled: i32,
        updated_scheduled: i32,
        ready: i32,
        available: i32,
    },
}

impl RolloutStatus {
    pub fn is_complete(&self) -> bool {
        match *self {
            RolloutStatus::ScaledReplicas {
                generation,
                observed_generation,
                desired,
                updated,
                current,
                ready,
            } => {
                let desired = desired.unwrap_or(1);
                generation <= observed_generation
                    && updated == desired
                    && current == desired
                    && ready == desired
            }
            RolloutStatus::NodeDaemon {
                generation,
                observed_generation,
                desired_scheduled,
                updated_scheduled,
                ready,
                available,
            } => {
                generation <= observed_generation
                    && updated_scheduled == desired_scheduled
                    && ready == desired_scheduled
                    && available == desired_scheduled
            }
        }
    }
}

/// A container as declared in the pod template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub image_pull_policy: Option<String>,
}

/// What the cluster API reports about a workload, independent of its concrete kind.
#[derive(Debug, Clone)]
pub struct WorkloadSnapshot {
    pub reference: WorkloadRef,
    /// Available (DaemonSets: available scheduled) instances.
    pub available: i32,
    /// Formatted label selector, empty when the workload has none.
    pub selector: String,
    pub containers: Vec<ContainerSpec>,
    pub image_pull_secrets: Vec<String>,
    pub status: RolloutStatus,
}

impl WorkloadSnapshot {
    pub fn container(&self, name: &str) -> Option<&ContainerSpec> {
        self.containers.iter().find(|c| c.name == name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodSnapshot {
    pub name: String,
    pub ready: bool,
    /// Container name to reported `imageID`.
    pub image_ids: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionSnapshot {
    pub name: String,
    pub kind: RevisionKind,
    pub replicas: Option<i32>,
    pub revision: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupStrategy {
    /// Delete revisions whose replica count was scaled to zero.
    PruneScaledToZero,
    /// Keep the N highest revision numbers, delete the rest.
    KeepNewest(usize),
}

impl CleanupStrategy {
    pub fn select<'a>(&self, revisions: &'a [RevisionSnapshot]) -> Vec<&'a RevisionSnapshot> {
        match *self {
            CleanupStrategy::PruneScaledToZero => revisions
                .iter()
                .filter(|r| r.replicas == Some(0))
                .collect(),
            CleanupStrategy::KeepNewest(keep) => {
                let mut sorted: Vec<&RevisionSnapshot> = revisions.iter().collect();
                sorted.sort_by(|a, b| b.revision.cmp(&a.revision));
                sorted.into_iter().skip(keep).collect()
            }
        }
    }
}

/// One container that is a candidate for an update in this cycle.
#[derive(Debug, Clone)]
pub struct ContainerObservation {
    pub name: String,
    pub image: ImageReference,
    /// The image string exactly as declared.
    pub declared_image: String,
    pub image_pull_policy: String,
    /// Digest of the image a ready pod is running, if one could be inspected.
    pub running_digest: Option<String>,
}

/// A workload and the containers of it that are candidates for an update.
#[derive(Debug, Clone)]
pub struct ObservedWorkload {
    pub reference: WorkloadRef,
    pub image_pull_secrets: Vec<String>,
    pub containers: Vec<ContainerObservation>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scaled(desired: Option<i32>, updated: i32, current: i32, ready: i32) -> RolloutStatus {
        RolloutStatus::ScaledReplicas {
            generation: 3,
            observed_generation: 3,
            desired,
            updated,
            current,
            ready,
        }
    }

    #[test]
    fn test_scaled_replicas_complete() {
        assert!(scaled(Some(3), 3, 3, 3).is_complete());
        assert!(!scaled(Some(3), 2, 3, 3).is_complete());
        assert!(!scaled(Some(3), 3, 4, 3).is_complete());
        assert!(!scaled(Some(3), 3, 3, 2).is_complete());
    }

    #[test]
    fn test_scaled_replicas_default_desired_is_one() {
        assert!(scaled(None, 1, 1, 1).is_complete());
        assert!(!scaled(None, 0, 0, 0).is_complete());
    }

    #[test]
    fn test_generation_must_be_observed() {
        let status = RolloutStatus::ScaledReplicas {
            generation: 4,
            observed_generation: 3,
            desired: Some(1),
            updated: 1,
            current: 1,
            ready: 1,
        };
        assert!(!status.is_complete());

        let status = RolloutStatus::NodeDaemon {
            generation: 2,
            observed_generation: 1,
            desired_scheduled: 2,
            updated_scheduled: 2,
            ready: 2,
            available: 2,
        };
        assert!(!status.is_complete());
    }

    #[test]
    fn test_node_daemon_complete() {
        let status = RolloutStatus::NodeDaemon {
            generation: 2,
            observed_generation: 2,
            desired_scheduled: 5,
            updated_scheduled: 5,
            ready: 5,
            available: 5,
        };
        assert!(status.is_complete());

        let status = RolloutStatus::NodeDaemon {
            generation: 2,
            observed_generation: 2,
            desired_scheduled: 5,
            updated_scheduled: 5,
            ready: 5,
            available: 4,
        };
        assert!(!status.is_complete());
    }

    fn revision(name: &str, replicas: Option<i32>, revision: i64) -> RevisionSnapshot {
        RevisionSnapshot {
            name: name.to_string(),
            kind: RevisionKind::ControllerRevision,
            replicas,
            revision,
        }
    }

    #[test]
    fn test_cleanup_prunes_scaled_to_zero() {
        let revisions = vec![
            revision("web-1", Some(0), 1),
            revision("web-2", Some(3), 2),
            revision("web-3", None, 3),
        ];
        let selected = CleanupStrategy::PruneScaledToZero.select(&revisions);
        let names: Vec<&str> = selected.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["web-1"]);
    }

    #[test]
    fn test_cleanup_keeps_two_newest() {
        let revisions = vec![
            revision("ds-3", None, 3),
            revision("ds-1", None, 1),
            revision("ds-4", None, 4),
            revision("ds-2", None, 2),
        ];
        let selected = WorkloadKind::DaemonSet.cleanup_strategy().select(&revisions);
        let mut names: Vec<&str> = selected.iter().map(|r| r.name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["ds-1", "ds-2"]);

        assert!(CleanupStrategy::KeepNewest(2).select(&revisions[..2]).is_empty());
    }
}
