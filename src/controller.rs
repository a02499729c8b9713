use crate::config::UnknownDigestPolicy;
use crate::credentials::CredentialResolver;
use crate::inventory::InventoryReader;
use crate::notifier::UpdateOutcome;
use crate::rollout::{RolloutError, RolloutExecutor};
use crate::state::ControllerContext;
use crate::workload::{ContainerObservation, ObservedWorkload};
use anyhow::{Context, Result};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub scanned: usize,
    pub updated: usize,
    pub failed: usize,
}

enum ContainerCheck {
    /// Filtered out by policy. Not counted as scanned.
    Ineligible,
    UpToDate,
    Outcome(UpdateOutcome),
    Cancelled,
}

#[derive(Default)]
struct WorkloadCheck {
    scanned: usize,
    outcomes: Vec<UpdateOutcome>,
}

/// Entry point for scheduled triggers. Skips the trigger while another cycle is still running
/// and never propagates a failed cycle.
pub async fn run(ctx: ControllerContext, cancel: CancellationToken) -> Option<CycleSummary> {
    let Ok(_guard) = ctx.cycle_lock.try_lock() else {
        warn!("Previous reconciliation cycle is still running, skipping");
        return None;
    };

    match run_cycle(&ctx, &cancel).await {
        Ok(summary) => Some(summary),
        Err(e) => {
            error!("Reconciliation cycle failed: {:#}", e);
            None
        }
    }
}

/// Runs one reconciliation cycle: read the inventory, check every eligible container against
/// its registry, roll out new digests and report the outcomes once all checks have finished.
#[instrument(name = "cycle", skip_all)]
pub async fn run_cycle(ctx: &ControllerContext, cancel: &CancellationToken) -> Result<CycleSummary> {
    let inventory = InventoryReader::new(ctx.cluster.as_ref(), ctx.config.namespace.as_deref());
    let workloads = inventory
        .list(cancel)
        .await
        .context("Failed to read workload inventory")?;
    info!("Checking {} workloads for digest changes", workloads.len());

    // Containers of one workload are checked in order, workloads in parallel
    let checks: Vec<WorkloadCheck> = futures::stream::iter(workloads)
        .map(|workload| check_workload(ctx.clone(), workload, cancel.clone()))
        .buffer_unordered(ctx.config.max_concurrent_checks)
        .collect()
        .await;

    let mut summary = CycleSummary::default();
    let mut outcomes = Vec::new();
    for check in checks {
        summary.scanned += check.scanned;
        outcomes.extend(check.outcomes);
    }
    summary.updated = outcomes.iter().filter(|o| o.success).count();
    summary.failed = outcomes.len() - summary.updated;

    let notified = ctx.reporter.report(&outcomes, summary.scanned, cancel).await;
    info!(
        "Session done Failed={} Scanned={} Updated={} notify={}",
        summary.failed,
        summary.scanned,
        summary.updated,
        if notified { "yes" } else { "no" }
    );

    Ok(summary)
}

async fn check_workload(
    ctx: ControllerContext,
    workload: ObservedWorkload,
    cancel: CancellationToken,
) -> WorkloadCheck {
    let mut check = WorkloadCheck::default();

    for container in &workload.containers {
        match check_container(&ctx, &workload, container, &cancel).await {
            ContainerCheck::Ineligible => {}
            ContainerCheck::UpToDate => check.scanned += 1,
            ContainerCheck::Outcome(outcome) => {
                check.scanned += 1;
                check.outcomes.push(outcome);
            }
            ContainerCheck::Cancelled => {
                debug!("Checks of {} cancelled", workload.reference);
                break;
            }
        }
    }

    check
}

async fn check_container(
    ctx: &ControllerContext,
    workload: &ObservedWorkload,
    container: &ContainerObservation,
    cancel: &CancellationToken,
) -> ContainerCheck {
    let policy = &ctx.config.policy;
    let reference = &workload.reference;
    let image = &container.image;
    debug!(
        "Checking container {} of {} ({}, pull policy {})",
        container.name, reference, container.declared_image, container.image_pull_policy
    );

    if policy.is_container_excluded(&container.name)
        || !policy.is_namespace_allowed(&reference.namespace)
    {
        debug!("Container {} of {} is not monitored", container.name, reference);
        return ContainerCheck::Ineligible;
    }

    if !policy.is_tag_tracked(&image.tag) {
        debug!(
            "Container {} of {} uses untracked tag {}",
            container.name, reference, image.tag
        );
        return ContainerCheck::Ineligible;
    }

    let credential = if workload.image_pull_secrets.is_empty() {
        None
    } else {
        CredentialResolver::new(ctx.cluster.as_ref())
            .resolve(
                &reference.namespace,
                &workload.image_pull_secrets,
                image,
                cancel,
            )
            .await
    };
    if cancel.is_cancelled() {
        return ContainerCheck::Cancelled;
    }

    let remote_digest = match cancel
        .run_until_cancelled(ctx.registry.get_digest(image, credential.as_ref()))
        .await
    {
        Some(Ok(digest)) => digest,
        Some(Err(e)) => {
            error!(
                "Failed to get digest of {} for {}: {:#}",
                image.tagged(),
                reference,
                e
            );
            return ContainerCheck::Outcome(UpdateOutcome::failure(
                image.tagged(),
                format!("{:#}", e),
            ));
        }
        None => return ContainerCheck::Cancelled,
    };

    let running_digest = container.running_digest.as_deref();
    if !needs_update(running_digest, &remote_digest, policy.unknown_digest_policy) {
        debug!(
            "Container {} of {} is up to date (running: {}, remote: {})",
            container.name,
            reference,
            running_digest.unwrap_or("unknown"),
            remote_digest
        );
        return ContainerCheck::UpToDate;
    }

    info!(
        "Found new digest {} for {} in {} (running: {})",
        remote_digest,
        image.tagged(),
        reference,
        running_digest.unwrap_or("unknown")
    );

    let executor = RolloutExecutor::new(ctx.cluster.as_ref(), ctx.config.rollout, policy.cleanup);
    match executor
        .update(reference, &container.name, &image.pinned(&remote_digest), cancel)
        .await
    {
        Ok(()) => ContainerCheck::Outcome(UpdateOutcome::success(image.tagged())),
        Err(RolloutError::Cancelled { .. }) => ContainerCheck::Cancelled,
        Err(e) => {
            error!("Failed to update container {}: {}", container.name, e);
            ContainerCheck::Outcome(UpdateOutcome::failure(image.tagged(), e.to_string()))
        }
    }
}

/// Digests are compared as exact strings, algorithm prefix included.
pub fn needs_update(running: Option<&str>, remote: &str, unknown: UnknownDigestPolicy) -> bool {
    match running {
        Some(running) => running != remote,
        None => unknown == UnknownDigestPolicy::Update,
    }
}
