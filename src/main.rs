use crate::cluster::{ClusterApi, KubeCluster};
use crate::config::RunMode;
use crate::notifier::{Reporter, WebhookTransport};
use crate::oci_registry::{DigestResolver, OciRegistry};
use crate::state::ControllerContext;
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod cluster;
mod config;
mod controller;
mod credentials;
mod image_reference;
mod inventory;
mod notifier;
mod oci_registry;
mod rollout;
mod secret_string;
mod state;
#[cfg(test)]
mod test_support;
mod webserver;
mod workload;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::load_config().context("Failed to load configuration")?;
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .init();
    info!("Starting kube-watchtower {}", env!("CARGO_PKG_VERSION"));
    log_policy(&config);

    let kube_client = cluster::create_client().await?;
    let http_client = oci_registry::create_client(&config)?;

    let cluster: Arc<dyn ClusterApi> = Arc::new(KubeCluster::new(kube_client));
    let registry: Arc<dyn DigestResolver> = Arc::new(OciRegistry::new(http_client.clone()));
    let reporter = Reporter::new(
        Arc::new(WebhookTransport::new(http_client)),
        &config.notification,
    );
    let mode = config.mode.clone();
    let port = config.webserver.port;
    let ctx = ControllerContext::new(config, cluster, registry, reporter);

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    match mode {
        RunMode::Once => {
            info!("Running a single reconciliation cycle");
            controller::run(ctx, shutdown).await;
        }
        RunMode::Interval(interval) => {
            let listener = webserver::bind(port).await?;
            let server = tokio::spawn(webserver::serve(listener, shutdown.clone()));
            run_interval(ctx, interval, shutdown.clone()).await;
            server.await.context("Webserver task failed")??;
        }
        RunMode::Cron(schedule) => {
            let listener = webserver::bind(port).await?;
            let server = tokio::spawn(webserver::serve(listener, shutdown.clone()));
            run_cron(ctx, schedule, shutdown.clone()).await?;
            server.await.context("Webserver task failed")??;
        }
    }

    info!("Shutdown complete");
    Ok(())
}

fn log_policy(config: &config::Config) {
    let policy = &config.policy;
    info!(
        "Watching namespace {} (excluded: {:?}, included: {:?}), excluded containers: {:?}",
        config.namespace.as_deref().unwrap_or("<all>"),
        policy.excluded_namespaces.patterns(),
        policy.included_namespaces.patterns(),
        policy.excluded_containers
    );
    info!(
        "Tag policy {:?}, unknown digest policy {:?}, cleanup {}",
        policy.tag_policy, policy.unknown_digest_policy, policy.cleanup
    );
}

async fn run_interval(ctx: ControllerContext, interval: Duration, shutdown: CancellationToken) {
    info!("Checking for updates every {:?}", interval);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while shutdown.run_until_cancelled(ticker.tick()).await.is_some() {
        controller::run(ctx.clone(), shutdown.clone()).await;
    }
}

async fn run_cron(
    ctx: ControllerContext,
    schedule: String,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    info!("Executing job scheduler at cron schedule {}", schedule);
    let mut scheduler = JobScheduler::new().await?;

    let job_shutdown = shutdown.clone();
    let job = Job::new_async(schedule.clone(), move |_uuid, _l| {
        let ctx = ctx.clone();
        let shutdown = job_shutdown.clone();
        Box::pin(async move {
            controller::run(ctx, shutdown).await;
        })
    })
    .with_context(|| format!("Invalid cron schedule '{}'", schedule))?;
    scheduler.add(job).await?;
    scheduler.start().await?;

    shutdown.cancelled().await;
    scheduler.shutdown().await?;
    Ok(())
}

async fn wait_for_signal(shutdown: CancellationToken) {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {},
        _ = terminate => {},
    }
    info!("Received shutdown signal, stopping");
    shutdown.cancel();
}
