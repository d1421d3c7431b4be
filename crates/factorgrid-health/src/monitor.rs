//! Health monitor — periodic instance refresh and failure detection.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use factor_core::InstanceId;
use factorgrid_fleet::InstanceProvider;
use factorgrid_scheduler::Dispatcher;

/// Refreshes worker state from the provider and reports dead workers.
pub struct HealthMonitor {
    dispatcher: Arc<Dispatcher>,
    provider: Arc<dyn InstanceProvider>,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        provider: Arc<dyn InstanceProvider>,
        interval: Duration,
    ) -> Self {
        Self {
            dispatcher,
            provider,
            interval,
        }
    }

    /// Run one health cycle. Returns the workers reported as failed.
    pub async fn check_once(&self) -> Vec<InstanceId> {
        let workers = self.dispatcher.workers().await;

        for worker in &workers {
            match self.provider.describe_instance(worker.id()).await {
                Ok(desc) => worker.update_instance(desc.state, desc.address),
                Err(e) => {
                    warn!(worker = %worker.id(), error = %e, "instance refresh failed");
                }
            }
        }

        let mut failed = Vec::new();
        for worker in workers {
            let state = worker.instance_state();
            if !state.is_terminal() {
                continue;
            }
            info!(worker = %worker.id(), %state, "worker instance is gone");
            match self.dispatcher.report_failure(worker.id()).await {
                Some(redispatched) => {
                    debug!(worker = %worker.id(), redispatched, "failure reported");
                    failed.push(worker.id().to_string());
                }
                None => debug!(worker = %worker.id(), "worker already left the fleet"),
            }
        }
        failed
    }

    /// Check every `interval` until `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.interval, "health monitor started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    let failed = self.check_once().await;
                    if !failed.is_empty() {
                        warn!(count = failed.len(), "workers failed this cycle");
                    }
                }
                _ = shutdown.changed() => {
                    debug!("health monitor shutting down");
                    break;
                }
            }
        }
    }
}
