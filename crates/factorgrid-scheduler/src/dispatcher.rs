//! Dispatcher — admits jobs onto workers and re-admits the jobs of
//! workers that fail.
//!
//! Fleet membership and the job ledger are guarded by one async mutex.
//! Selecting an existing worker and recording the assignment happen in
//! a single critical section. The lock is released before any call to
//! the fleet controller and before the job is sent to the worker.
//!
//! Provisioning runs in its own task and the fresh worker joins the
//! fleet there, so a caller that goes away mid-admission cannot strand
//! a started instance outside the fleet.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use factor_core::config::DispatchConfig;
use factor_core::{Complexity, InstanceId, JobId};
use factorgrid_fleet::{
    CallbackHandle, FleetError, Job, JobIdAllocator, JobLedger, Worker, WorkerSummary,
};

use crate::error::{SchedulerError, SchedulerResult};
use crate::fleet::FleetController;
use crate::score::{exceeds_threshold, least_loaded, load_score, ScoreWeights};
use crate::transport::{DispatchRequest, JobSender};

/// Where an admitted job went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub job_id: JobId,
    pub worker_id: InstanceId,
}

/// A job released by [`Dispatcher::complete`].
#[derive(Debug)]
pub struct CompletedJob {
    pub job_id: JobId,
    pub worker_id: InstanceId,
    pub input: String,
    pub callback: CallbackHandle,
}

/// Result of asking the dispatcher to give up a worker.
#[derive(Debug)]
pub enum RetireOutcome {
    /// The worker held no jobs and has been removed from the fleet.
    /// The caller terminates its instance.
    Terminated(Arc<Worker>),
    /// The worker still runs jobs; it is draining and will be removed
    /// when its last job completes.
    Draining,
    /// No such worker in the fleet.
    NotFound,
}

/// Outcome of scoring the fleet for one input.
enum Selection {
    Assign { worker: Arc<Worker>, score: Complexity },
    NoEligibleWorker,
    Overloaded { score: Complexity, historical: Complexity },
}

/// Why the dispatcher asked for a new worker.
#[derive(Debug, Clone, Copy)]
enum CapacityReason {
    NoEligibleWorker,
    Overloaded,
}

struct DispatchState {
    /// Fleet in insertion order.
    workers: Vec<Arc<Worker>>,
    ledger: JobLedger,
    shutting_down: bool,
}

impl DispatchState {
    fn position(&self, worker_id: &str) -> Option<usize> {
        self.workers.iter().position(|w| w.id() == worker_id)
    }

    fn find(&self, worker_id: &str) -> Option<&Arc<Worker>> {
        self.workers.iter().find(|w| w.id() == worker_id)
    }
}

/// Assigns jobs to workers and keeps the pending-job ledger.
pub struct Dispatcher {
    state: Arc<Mutex<DispatchState>>,
    ids: JobIdAllocator,
    fleet: Arc<dyn FleetController>,
    sender: Arc<dyn JobSender>,
    weights: ScoreWeights,
    complexity_threshold: Complexity,
}

impl Dispatcher {
    /// Create a dispatcher with an empty fleet.
    pub fn new(
        fleet: Arc<dyn FleetController>,
        sender: Arc<dyn JobSender>,
        config: &DispatchConfig,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(DispatchState {
                workers: Vec::new(),
                ledger: JobLedger::new(),
                shutting_down: false,
            })),
            ids: JobIdAllocator::new(),
            fleet,
            sender,
            weights: ScoreWeights::from(config),
            complexity_threshold: config.complexity_threshold,
        }
    }

    // ── Admission ───────────────────────────────────────────────────

    /// Assign a job for `input` to a worker and send it there.
    ///
    /// Prefers the least-loaded eligible worker. Asks the fleet
    /// controller for a new worker when none is eligible, or when the
    /// input is known to be expensive enough to overload even the
    /// least-loaded one. Fails only if that provisioning fails; the
    /// callback is dropped in that case.
    pub async fn admit(
        &self,
        input: impl Into<String>,
        callback: CallbackHandle,
    ) -> SchedulerResult<Admission> {
        let input = input.into();

        let mut state = self.state.lock().await;
        if state.shutting_down {
            return Err(SchedulerError::ShuttingDown);
        }
        let reason = match self.select(&state, &input) {
            Selection::Assign { worker, score } => {
                let (admission, request) =
                    self.assign_locked(&mut state, &worker, input, callback, Some(score));
                drop(state);
                self.send(request);
                return Ok(admission);
            }
            Selection::NoEligibleWorker => {
                info!(%input, "no eligible worker, requesting a new one");
                CapacityReason::NoEligibleWorker
            }
            Selection::Overloaded { score, historical } => {
                info!(
                    %input,
                    score,
                    historical,
                    threshold = self.complexity_threshold,
                    "known input would overload the fleet, requesting a new worker"
                );
                CapacityReason::Overloaded
            }
        };
        drop(state);

        // Provisioning blocks; no dispatcher lock may be held here.
        let provisioning = tokio::spawn(Self::provision_into_fleet(
            self.fleet.clone(),
            self.state.clone(),
        ));
        let fresh = provisioning
            .await
            .unwrap_or_else(|e| {
                Err(SchedulerError::Provisioning(FleetError::Provider(e.to_string())))
            })
            .inspect_err(|e| {
                error!(%input, error = %e, "worker provisioning failed, rejecting job")
            })?;

        let mut state = self.state.lock().await;
        if state.shutting_down {
            return Err(SchedulerError::ShuttingDown);
        }

        let fresh_in_fleet = state.find(fresh.id()).is_some();
        let (target, score) = match (reason, self.select(&state, &input)) {
            (CapacityReason::Overloaded, _) if fresh_in_fleet => (fresh, None),
            (_, Selection::Assign { worker, score }) => (worker, Some(score)),
            // The new worker may still be inside its grace period.
            _ if fresh_in_fleet => (fresh, None),
            _ => {
                warn!(%input, worker = %fresh.id(), "fresh worker left the fleet before use");
                return Err(SchedulerError::Provisioning(FleetError::UnknownInstance(
                    fresh.id().to_string(),
                )));
            }
        };
        let (admission, request) = self.assign_locked(&mut state, &target, input, callback, score);
        drop(state);
        self.send(request);
        Ok(admission)
    }

    /// Release a finished job and hand back its caller's handle.
    ///
    /// Returns `None` for unknown ids: duplicate or late callbacks, and
    /// jobs that were already re-dispatched after a worker failure.
    pub async fn complete(&self, job_id: JobId) -> Option<CompletedJob> {
        let mut state = self.state.lock().await;
        let Some(worker_id) = state.ledger.remove_pending(job_id) else {
            debug!(job_id, "completion for unknown job ignored");
            return None;
        };
        let Some(worker) = state.find(&worker_id).cloned() else {
            warn!(job_id, worker = %worker_id, "pending job on a worker outside the fleet");
            return None;
        };
        let Some(job) = worker.complete(job_id) else {
            warn!(job_id, worker = %worker_id, "pending job missing from worker");
            return None;
        };

        let retired = worker.job_count() == 0 && worker.is_draining();
        if retired && let Some(pos) = state.position(&worker_id) {
            state.workers.remove(pos);
            worker.mark_terminated();
        }
        drop(state);

        info!(job_id, worker = %worker_id, "job completed");
        if retired {
            info!(worker = %worker_id, "drained worker retired");
            self.fleet.terminate_instance(&worker).await;
        }

        let (input, callback) = job.into_parts();
        Some(CompletedJob {
            job_id,
            worker_id,
            input,
            callback,
        })
    }

    /// Fault-tolerance protocol: drop a dead worker from the fleet,
    /// terminate it, and re-admit every job it held.
    ///
    /// Returns the number of jobs re-admitted, or `None` if the worker
    /// had already left the fleet (a repeated report is a no-op).
    pub async fn report_failure(&self, worker_id: &str) -> Option<usize> {
        let (worker, jobs) = {
            let mut state = self.state.lock().await;
            let Some(pos) = state.position(worker_id) else {
                debug!(worker = %worker_id, "failure reported for worker not in fleet");
                return None;
            };
            let worker = state.workers.remove(pos);
            worker.mark_terminated();
            let jobs = worker.take_all_jobs();
            for job in &jobs {
                state.ledger.remove_pending(job.id);
            }
            (worker, jobs)
        };

        warn!(worker = %worker_id, jobs = jobs.len(), "worker failed, re-dispatching its jobs");
        self.fleet.instance_failed(&worker).await;
        self.fleet.terminate_instance(&worker).await;

        let count = jobs.len();
        for job in jobs {
            let old_id = job.id;
            let (input, callback) = job.into_parts();
            match self.admit(input, callback).await {
                Ok(admission) => info!(
                    old_job_id = old_id,
                    job_id = admission.job_id,
                    worker = %admission.worker_id,
                    "job re-dispatched"
                ),
                Err(e) => error!(old_job_id = old_id, error = %e, "job lost during re-dispatch"),
            }
        }
        Some(count)
    }

    /// Give up a worker on behalf of the fleet controller.
    ///
    /// An empty worker leaves the fleet right away; a busy one is marked
    /// draining and stops receiving jobs.
    pub async fn retire_worker(&self, worker_id: &str) -> RetireOutcome {
        let mut state = self.state.lock().await;
        let Some(pos) = state.position(worker_id) else {
            return RetireOutcome::NotFound;
        };
        let worker = state.workers[pos].clone();
        if worker.job_count() == 0 {
            state.workers.remove(pos);
            worker.mark_terminated();
            info!(worker = %worker_id, "idle worker retired");
            RetireOutcome::Terminated(worker)
        } else {
            worker.mark_draining();
            RetireOutcome::Draining
        }
    }

    // ── Fleet membership ────────────────────────────────────────────

    /// Add a provisioned worker to the fleet. Returns `false` if a worker
    /// with the same id is already present.
    pub async fn add_worker(&self, worker: Arc<Worker>) -> bool {
        let mut state = self.state.lock().await;
        Self::register_locked(&mut state, worker)
    }

    /// Snapshot of the fleet in order.
    pub async fn workers(&self) -> Vec<Arc<Worker>> {
        self.state.lock().await.workers.clone()
    }

    pub async fn worker(&self, worker_id: &str) -> Option<Arc<Worker>> {
        self.state.lock().await.find(worker_id).cloned()
    }

    pub async fn worker_summaries(&self) -> Vec<WorkerSummary> {
        let workers = self.workers().await;
        workers.iter().map(|w| w.summary()).collect()
    }

    /// Empty the fleet for shutdown. Pending callers are released
    /// without a reply; the returned workers still need terminating.
    pub async fn shutdown(&self) -> Vec<Arc<Worker>> {
        let mut state = self.state.lock().await;
        state.shutting_down = true;
        let workers = std::mem::take(&mut state.workers);
        for worker in &workers {
            worker.mark_terminated();
            for job in worker.take_all_jobs() {
                state.ledger.remove_pending(job.id);
            }
        }
        info!(workers = workers.len(), "dispatcher shut down");
        workers
    }

    // ── Telemetry ───────────────────────────────────────────────────

    /// Store a CPU utilization sample. Returns `false` for unknown workers.
    pub async fn record_cpu(&self, worker_id: &str, percent: f64) -> bool {
        let state = self.state.lock().await;
        match state.find(worker_id) {
            Some(worker) => {
                worker.set_cpu_utilization(percent);
                true
            }
            None => false,
        }
    }

    /// Store a progress counter for a running job. Returns `false` if the
    /// job is not pending.
    pub async fn record_job_metric(&self, job_id: JobId, name: &str, value: u64) -> bool {
        let state = self.state.lock().await;
        let Some(worker) = state
            .ledger
            .owner(job_id)
            .and_then(|owner| state.find(owner))
        else {
            return false;
        };
        worker.update_job_metric(job_id, name, value)
    }

    /// Store the observed complexity of a completed input.
    pub async fn record_history(&self, input: &str, complexity: Complexity) {
        let mut state = self.state.lock().await;
        state.ledger.record_history(input, complexity);
        debug!(%input, complexity, "historical complexity recorded");
    }

    pub async fn historical_complexity(&self, input: &str) -> Option<Complexity> {
        self.state.lock().await.ledger.historical_complexity(input)
    }

    // ── Ledger queries ──────────────────────────────────────────────

    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.ledger.pending_len()
    }

    // ── Internal helpers ────────────────────────────────────────────

    /// Score every eligible worker and decide where `input` goes.
    fn select(&self, state: &DispatchState, input: &str) -> Selection {
        let eligible: Vec<&Arc<Worker>> =
            state.workers.iter().filter(|w| w.is_eligible()).collect();
        let history = |i: &str| state.ledger.historical_complexity(i);

        let scores = eligible
            .iter()
            .map(|w| load_score(w.cpu_utilization(), &w.job_loads(), self.weights, history));
        let Some((idx, score)) = least_loaded(scores) else {
            return Selection::NoEligibleWorker;
        };

        if let Some(historical) = state.ledger.historical_complexity(input)
            && exceeds_threshold(score, historical, self.complexity_threshold)
        {
            return Selection::Overloaded { score, historical };
        }

        Selection::Assign {
            worker: eligible[idx].clone(),
            score,
        }
    }

    /// Start an instance and add it to the fleet, unless the dispatcher
    /// shut down meanwhile.
    async fn provision_into_fleet(
        fleet: Arc<dyn FleetController>,
        state: Arc<Mutex<DispatchState>>,
    ) -> SchedulerResult<Arc<Worker>> {
        let fresh = fleet.start_new_instance().await?;
        let mut guard = state.lock().await;
        if guard.shutting_down {
            drop(guard);
            fleet.terminate_instance(&fresh).await;
            return Err(SchedulerError::ShuttingDown);
        }
        Self::register_locked(&mut guard, fresh.clone());
        Ok(fresh)
    }

    fn register_locked(state: &mut DispatchState, worker: Arc<Worker>) -> bool {
        if state.find(worker.id()).is_some() {
            debug!(worker = %worker.id(), "worker already in fleet");
            return false;
        }
        info!(worker = %worker.id(), address = ?worker.address(), "worker joined fleet");
        state.workers.push(worker);
        true
    }

    /// Allocate a job id, record it pending and place the job on `worker`.
    fn assign_locked(
        &self,
        state: &mut DispatchState,
        worker: &Arc<Worker>,
        input: String,
        callback: CallbackHandle,
        score: Option<Complexity>,
    ) -> (Admission, Option<DispatchRequest>) {
        let job_id = self.ids.next();
        state.ledger.insert_pending(job_id, worker.id());
        worker.assign(Job::new(job_id, input.clone(), callback));
        info!(job_id, worker = %worker.id(), score = ?score, "job admitted");

        let request = match worker.address() {
            Some(address) => Some(DispatchRequest {
                job_id,
                worker_id: worker.id().to_string(),
                address,
                input,
            }),
            None => {
                warn!(job_id, worker = %worker.id(), "worker has no address, job not sent");
                None
            }
        };

        (
            Admission {
                job_id,
                worker_id: worker.id().to_string(),
            },
            request,
        )
    }

    fn send(&self, request: Option<DispatchRequest>) {
        if let Some(request) = request {
            self.sender.dispatch(request);
        }
    }
}

#[cfg(test)]
impl Dispatcher {
    /// Worker currently running `job_id`.
    pub async fn owner_of(&self, job_id: JobId) -> Option<InstanceId> {
        self.state
            .lock()
            .await
            .ledger
            .owner(job_id)
            .map(str::to_string)
    }

    /// Pending job ids the ledger attributes to a worker.
    pub async fn pending_for(&self, worker_id: &str) -> Vec<JobId> {
        self.state.lock().await.ledger.pending_for(worker_id)
    }

    /// Job ids issued so far.
    pub fn issued_job_ids(&self) -> u64 {
        self.ids.issued()
    }
}
