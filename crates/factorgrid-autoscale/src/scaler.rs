//! Autoscaler — CPU-driven fleet sizing.
//!
//! Reads the dispatcher's fleet inventory, decides whether to add or
//! retire a worker, and carries the decision out through the
//! `FleetManager`.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use factor_core::InstanceId;
use factor_core::config::AutoscaleConfig;
use factorgrid_fleet::{WorkerState, WorkerSummary};
use factorgrid_scheduler::{Dispatcher, FleetController};

use crate::manager::FleetManager;

/// A scaling decision for the fleet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleDecision {
    /// Provision one more worker.
    ScaleUp,
    /// Retire this worker.
    ScaleDown(InstanceId),
    /// No change needed.
    NoChange,
}

/// Fleet bounds and thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalePolicy {
    pub min_workers: usize,
    pub max_workers: usize,
    pub scale_up_cpu: f64,
    pub scale_down_cpu: f64,
    pub scale_up_window: Duration,
    pub scale_down_window: Duration,
}

impl From<&AutoscaleConfig> for ScalePolicy {
    fn from(config: &AutoscaleConfig) -> Self {
        Self {
            min_workers: config.min_workers as usize,
            max_workers: config.max_workers as usize,
            scale_up_cpu: config.scale_up_cpu,
            scale_down_cpu: config.scale_down_cpu,
            scale_up_window: config.scale_up_window(),
            scale_down_window: config.scale_down_window(),
        }
    }
}

/// Evaluates fleet load and resizes the fleet.
pub struct Autoscaler {
    dispatcher: Arc<Dispatcher>,
    fleet: Arc<FleetManager>,
    policy: ScalePolicy,
    last_scale_up: Option<Instant>,
    last_scale_down: Option<Instant>,
}

impl Autoscaler {
    pub fn new(dispatcher: Arc<Dispatcher>, fleet: Arc<FleetManager>, policy: ScalePolicy) -> Self {
        Self {
            dispatcher,
            fleet,
            policy,
            last_scale_up: None,
            last_scale_down: None,
        }
    }

    /// Decide what to do about a fleet snapshot.
    ///
    /// Records the decision time for cooldown tracking.
    pub fn evaluate(&mut self, workers: &[WorkerSummary]) -> ScaleDecision {
        let now = Instant::now();
        let live = workers
            .iter()
            .filter(|w| matches!(w.state, WorkerState::Provisioning | WorkerState::Active))
            .count();
        let active: Vec<&WorkerSummary> = workers
            .iter()
            .filter(|w| w.state == WorkerState::Active)
            .collect();

        if live < self.policy.min_workers {
            debug!(live, min = self.policy.min_workers, "below minimum fleet size");
            self.last_scale_up = Some(now);
            return ScaleDecision::ScaleUp;
        }

        let Some(mean_cpu) = mean_cpu(&active) else {
            return ScaleDecision::NoChange;
        };

        if mean_cpu > self.policy.scale_up_cpu
            && live < self.policy.max_workers
            && cooled_down(self.last_scale_up, self.policy.scale_up_window, now)
        {
            self.last_scale_up = Some(now);
            debug!(live, mean_cpu, threshold = self.policy.scale_up_cpu, "scaling up");
            return ScaleDecision::ScaleUp;
        }

        if mean_cpu < self.policy.scale_down_cpu
            && live > self.policy.min_workers
            && cooled_down(self.last_scale_down, self.policy.scale_down_window, now)
            && let Some(victim) = least_loaded(&active)
        {
            self.last_scale_down = Some(now);
            debug!(
                live,
                mean_cpu,
                threshold = self.policy.scale_down_cpu,
                worker = %victim.id,
                "scaling down"
            );
            return ScaleDecision::ScaleDown(victim.id.clone());
        }

        ScaleDecision::NoChange
    }

    /// Evaluate the current fleet and carry out the decision.
    pub async fn tick(&mut self) -> ScaleDecision {
        let workers = self.dispatcher.worker_summaries().await;
        let decision = self.evaluate(&workers);

        match &decision {
            ScaleDecision::ScaleUp => match self.fleet.start_new_instance().await {
                Ok(worker) => {
                    info!(worker = %worker.id(), "scaled up");
                    self.dispatcher.add_worker(worker).await;
                }
                Err(e) => warn!(error = %e, "scale-up failed"),
            },
            ScaleDecision::ScaleDown(id) => {
                let outcome = self.fleet.retire(&self.dispatcher, id).await;
                info!(worker = %id, ?outcome, "scaled down");
            }
            ScaleDecision::NoChange => {}
        }
        decision
    }

    /// Run the autoscaler loop.
    pub async fn run(
        &mut self,
        interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        info!(interval_secs = interval.as_secs(), "autoscaler started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    info!("autoscaler shutting down");
                    break;
                }
            }
        }
    }
}

fn mean_cpu(workers: &[&WorkerSummary]) -> Option<f64> {
    if workers.is_empty() {
        return None;
    }
    let total: f64 = workers.iter().map(|w| w.cpu_percent).sum();
    Some(total / workers.len() as f64)
}

/// Fewest jobs, then lowest CPU; first wins ties.
fn least_loaded<'a>(workers: &[&'a WorkerSummary]) -> Option<&'a WorkerSummary> {
    let mut best: Option<&'a WorkerSummary> = None;
    for &w in workers {
        let better = best.is_none_or(|b| {
            w.jobs < b.jobs || (w.jobs == b.jobs && w.cpu_percent < b.cpu_percent)
        });
        if better {
            best = Some(w);
        }
    }
    best
}

fn cooled_down(last: Option<Instant>, window: Duration, now: Instant) -> bool {
    last.is_none_or(|t| now.duration_since(t) >= window)
}
