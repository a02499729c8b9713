use crate::cluster::ClusterApi;
use crate::config::Config;
use crate::notifier::Reporter;
use crate::oci_registry::DigestResolver;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Everything a reconciliation cycle needs. Cheap to clone into scheduled jobs.
#[derive(Clone)]
pub struct ControllerContext {
    pub(crate) config: Arc<Config>,
    pub(crate) cluster: Arc<dyn ClusterApi>,
    pub(crate) registry: Arc<dyn DigestResolver>,
    pub(crate) reporter: Arc<Reporter>,
    /// Held for the duration of a cycle so that overlapping triggers are skipped.
    pub(crate) cycle_lock: Arc<Mutex<()>>,
}

impl ControllerContext {
    pub fn new(
        config: Config,
        cluster: Arc<dyn ClusterApi>,
        registry: Arc<dyn DigestResolver>,
        reporter: Reporter,
    ) -> Self {
        Self {
            config: Arc::new(config),
            cluster,
            registry,
            reporter: Arc::new(reporter),
            cycle_lock: Arc::new(Mutex::new(())),
        }
    }
}
