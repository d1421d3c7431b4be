//! Worker — one remote compute instance and the jobs it is running.
//!
//! All mutable state sits behind a single per-worker mutex so the
//! dispatcher (assign / complete / score) and the telemetry feed
//! (CPU samples, job progress) never observe a half-applied update.
//! The lock is never held across an `.await`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info};

use factor_core::{Complexity, InstanceId, InstanceState, JobId};

/// Raw counter units per unit of complexity.
pub const COMPLEXITY_UNIT: u64 = 1_000_000;

/// Result fields a worker reported for a finished job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobReply {
    pub fields: BTreeMap<String, String>,
}

/// The live inbound request waiting for a job's result.
pub type CallbackHandle = oneshot::Sender<JobReply>;

/// Execution-progress counters reported while a job runs
/// (instructions, comparisons, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobMetrics {
    counters: HashMap<String, u64>,
}

impl JobMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the value of a counter with the latest reading.
    pub fn set(&mut self, name: &str, value: u64) {
        self.counters.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<u64> {
        self.counters.get(name).copied()
    }

    /// Accumulated complexity: all counters summed, in `COMPLEXITY_UNIT`s.
    pub fn complexity(&self) -> Complexity {
        let total = self
            .counters
            .values()
            .fold(0u64, |acc, v| acc.saturating_add(*v));
        Complexity::try_from(total / COMPLEXITY_UNIT).unwrap_or(Complexity::MAX)
    }
}

/// A unit of work in flight on a worker.
#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    pub input: String,
    pub metrics: JobMetrics,
    callback: CallbackHandle,
}

impl Job {
    pub fn new(id: JobId, input: impl Into<String>, callback: CallbackHandle) -> Self {
        Self {
            id,
            input: input.into(),
            metrics: JobMetrics::new(),
            callback,
        }
    }

    /// Release the job, handing back its input and the caller's handle.
    pub fn into_parts(self) -> (String, CallbackHandle) {
        (self.input, self.callback)
    }
}

/// What the scorer needs to know about one running job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLoad {
    pub input: String,
    pub live_complexity: Complexity,
}

/// Lifecycle state of a worker, derived from provider state, age,
/// address, drain flag and termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Provisioning,
    Active,
    Draining,
    Terminated,
    Failed,
}

/// Timing parameters every worker is created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerTiming {
    /// Age a worker must reach before it takes jobs.
    pub grace_period: Duration,
    /// Age of a drain request after which it is considered stale.
    pub drain_timeout: Duration,
}

impl Default for WorkerTiming {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(60),
            drain_timeout: Duration::from_secs(90),
        }
    }
}

/// Serializable view of a worker for status endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSummary {
    pub id: InstanceId,
    pub address: Option<String>,
    pub state: WorkerState,
    pub instance_state: String,
    pub jobs: usize,
    pub cpu_percent: f64,
}

struct WorkerInner {
    instance_state: InstanceState,
    address: Option<String>,
    cpu_percent: f64,
    jobs: HashMap<JobId, Job>,
    drain_since: Option<Instant>,
    terminated: bool,
}

/// One remote compute instance.
pub struct Worker {
    id: InstanceId,
    started_at: Instant,
    timing: WorkerTiming,
    inner: Mutex<WorkerInner>,
}

impl Worker {
    /// A worker the provider has just started; not yet running.
    pub fn new(id: impl Into<InstanceId>, timing: WorkerTiming) -> Self {
        Self {
            id: id.into(),
            started_at: Instant::now(),
            timing,
            inner: Mutex::new(WorkerInner {
                instance_state: InstanceState::Pending,
                address: None,
                cpu_percent: 0.0,
                jobs: HashMap::new(),
                drain_since: None,
                terminated: false,
            }),
        }
    }

    /// A worker already reported running at `address`.
    pub fn running(
        id: impl Into<InstanceId>,
        address: impl Into<String>,
        timing: WorkerTiming,
    ) -> Self {
        let worker = Self::new(id, timing);
        worker.update_instance(InstanceState::Running, Some(address.into()));
        worker
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn address(&self) -> Option<String> {
        self.lock().address.clone()
    }

    pub fn instance_state(&self) -> InstanceState {
        self.lock().instance_state.clone()
    }

    /// Apply a refreshed provider view. A `None` address keeps the last known one.
    pub fn update_instance(&self, state: InstanceState, address: Option<String>) {
        let mut inner = self.lock();
        if inner.instance_state != state {
            debug!(
                worker = %self.id,
                from = %inner.instance_state,
                to = %state,
                "instance state changed"
            );
        }
        inner.instance_state = state;
        if address.is_some() {
            inner.address = address;
        }
    }

    /// Current lifecycle state. Expires a stale drain request as a side effect.
    pub fn state(&self) -> WorkerState {
        let mut inner = self.lock();
        self.state_locked(&mut inner)
    }

    /// Whether the dispatcher may hand this worker a new job right now.
    pub fn is_eligible(&self) -> bool {
        self.state() == WorkerState::Active
    }

    pub fn cpu_utilization(&self) -> f64 {
        self.lock().cpu_percent
    }

    pub fn set_cpu_utilization(&self, percent: f64) {
        self.lock().cpu_percent = percent.clamp(0.0, 100.0);
    }

    /// Add a job to this worker's set.
    pub fn assign(&self, job: Job) {
        let mut inner = self.lock();
        debug_assert!(!inner.jobs.contains_key(&job.id), "job id reused");
        inner.jobs.insert(job.id, job);
    }

    /// Remove and return a job that finished.
    pub fn complete(&self, job_id: JobId) -> Option<Job> {
        self.lock().jobs.remove(&job_id)
    }

    /// Remove every job, lowest id first.
    pub fn take_all_jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.lock().jobs.drain().map(|(_, job)| job).collect();
        jobs.sort_by_key(|job| job.id);
        jobs
    }

    pub fn has_job(&self, job_id: JobId) -> bool {
        self.lock().jobs.contains_key(&job_id)
    }

    pub fn job_ids(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self.lock().jobs.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn job_count(&self) -> usize {
        self.lock().jobs.len()
    }

    /// Inputs and live complexity of every running job, for scoring.
    pub fn job_loads(&self) -> Vec<JobLoad> {
        let inner = self.lock();
        let mut jobs: Vec<&Job> = inner.jobs.values().collect();
        jobs.sort_by_key(|job| job.id);
        jobs.into_iter()
            .map(|job| JobLoad {
                input: job.input.clone(),
                live_complexity: job.metrics.complexity(),
            })
            .collect()
    }

    /// Record a progress counter for a running job. Returns `false` if the
    /// job is not on this worker.
    pub fn update_job_metric(&self, job_id: JobId, name: &str, value: u64) -> bool {
        let mut inner = self.lock();
        match inner.jobs.get_mut(&job_id) {
            Some(job) => {
                job.metrics.set(name, value);
                true
            }
            None => false,
        }
    }

    /// Flag this worker for retirement; it stops taking new jobs immediately.
    pub fn mark_draining(&self) {
        let mut inner = self.lock();
        if inner.drain_since.is_none() {
            inner.drain_since = Some(Instant::now());
            info!(worker = %self.id, jobs = inner.jobs.len(), "worker draining");
        }
    }

    pub fn is_draining(&self) -> bool {
        self.state() == WorkerState::Draining
    }

    pub fn mark_terminated(&self) {
        self.lock().terminated = true;
    }

    pub fn summary(&self) -> WorkerSummary {
        let mut inner = self.lock();
        let state = self.state_locked(&mut inner);
        WorkerSummary {
            id: self.id.clone(),
            address: inner.address.clone(),
            state,
            instance_state: inner.instance_state.to_string(),
            jobs: inner.jobs.len(),
            cpu_percent: inner.cpu_percent,
        }
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn lock(&self) -> std::sync::MutexGuard<'_, WorkerInner> {
        self.inner.lock().expect("worker lock")
    }

    fn state_locked(&self, inner: &mut WorkerInner) -> WorkerState {
        if inner.terminated {
            return WorkerState::Terminated;
        }
        if inner.instance_state.is_terminal() {
            return WorkerState::Failed;
        }
        if let Some(since) = inner.drain_since {
            if since.elapsed() < self.timing.drain_timeout {
                return WorkerState::Draining;
            }
            inner.drain_since = None;
            info!(
                worker = %self.id,
                jobs = inner.jobs.len(),
                "drain request expired, worker assignable again"
            );
        }
        let ready = inner.instance_state.is_running()
            && inner.address.is_some()
            && self.started_at.elapsed() >= self.timing.grace_period;
        if ready {
            WorkerState::Active
        } else {
            WorkerState::Provisioning
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timing(grace_secs: u64, drain_secs: u64) -> WorkerTiming {
        WorkerTiming {
            grace_period: Duration::from_secs(grace_secs),
            drain_timeout: Duration::from_secs(drain_secs),
        }
    }

    fn job(id: JobId, input: &str) -> Job {
        let (tx, _rx) = oneshot::channel();
        Job::new(id, input, tx)
    }

    #[test]
    fn metrics_complexity_sums_counters() {
        let mut m = JobMetrics::new();
        assert_eq!(m.complexity(), 0);
        m.set("instructions", 3 * COMPLEXITY_UNIT);
        m.set("comparisons", 2 * COMPLEXITY_UNIT + 10);
        assert_eq!(m.complexity(), 5);

        // Latest reading replaces the previous one.
        m.set("instructions", COMPLEXITY_UNIT);
        assert_eq!(m.complexity(), 3);
        assert_eq!(m.get("instructions"), Some(COMPLEXITY_UNIT));
    }

    #[tokio::test(start_paused = true)]
    async fn new_worker_is_provisioning_until_running_with_address() {
        let w = Worker::new("i-1", timing(0, 90));
        assert_eq!(w.state(), WorkerState::Provisioning);

        w.update_instance(InstanceState::Running, None);
        assert_eq!(w.state(), WorkerState::Provisioning, "no address yet");

        w.update_instance(InstanceState::Running, Some("10.0.0.1".into()));
        assert_eq!(w.state(), WorkerState::Active);
        assert!(w.is_eligible());
    }

    #[tokio::test(start_paused = true)]
    async fn grace_period_delays_eligibility() {
        let w = Worker::running("i-1", "10.0.0.1", timing(60, 90));
        assert!(!w.is_eligible());

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(w.state(), WorkerState::Provisioning);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(w.state(), WorkerState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_provider_state_means_failed() {
        let w = Worker::running("i-1", "10.0.0.1", timing(0, 90));
        w.update_instance(InstanceState::Stopping, None);
        assert_eq!(w.state(), WorkerState::Failed);
        assert!(!w.is_eligible());
        // The last known address is kept.
        assert_eq!(w.address().as_deref(), Some("10.0.0.1"));
    }

    #[tokio::test(start_paused = true)]
    async fn terminated_overrides_everything() {
        let w = Worker::running("i-1", "10.0.0.1", timing(0, 90));
        w.mark_draining();
        w.mark_terminated();
        assert_eq!(w.state(), WorkerState::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn draining_suppresses_eligibility_immediately() {
        let w = Worker::running("i-1", "10.0.0.1", timing(0, 90));
        w.assign(job(1, "17"));
        w.mark_draining();
        assert_eq!(w.state(), WorkerState::Draining);
        assert!(!w.is_eligible());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_drain_request_expires() {
        let w = Worker::running("i-1", "10.0.0.1", timing(0, 90));
        w.assign(job(1, "17"));
        w.mark_draining();

        tokio::time::advance(Duration::from_secs(89)).await;
        assert!(w.is_draining());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(w.is_eligible(), "drain expired at 3x health interval");
        assert!(!w.is_draining());
        assert_eq!(w.job_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn mark_draining_twice_keeps_first_timestamp() {
        let w = Worker::running("i-1", "10.0.0.1", timing(0, 90));
        w.mark_draining();
        tokio::time::advance(Duration::from_secs(60)).await;
        w.mark_draining();
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(w.is_eligible());
    }

    #[test]
    fn assign_complete_and_take_all() {
        let w = Worker::new("i-1", WorkerTiming::default());
        w.assign(job(3, "a"));
        w.assign(job(1, "b"));
        w.assign(job(2, "c"));
        assert_eq!(w.job_ids(), vec![1, 2, 3]);
        assert!(w.has_job(2));

        let done = w.complete(2).unwrap();
        assert_eq!(done.input, "c");
        assert!(w.complete(2).is_none());

        let rest = w.take_all_jobs();
        assert_eq!(rest.iter().map(|j| j.id).collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(w.job_count(), 0);
    }

    #[test]
    fn job_metric_updates_feed_job_loads() {
        let w = Worker::new("i-1", WorkerTiming::default());
        w.assign(job(1, "15"));
        assert!(w.update_job_metric(1, "instructions", 7 * COMPLEXITY_UNIT));
        assert!(!w.update_job_metric(99, "instructions", 1));

        assert_eq!(
            w.job_loads(),
            vec![JobLoad {
                input: "15".to_string(),
                live_complexity: 7
            }]
        );
    }

    #[test]
    fn cpu_sample_is_clamped() {
        let w = Worker::new("i-1", WorkerTiming::default());
        w.set_cpu_utilization(142.0);
        assert_eq!(w.cpu_utilization(), 100.0);
        w.set_cpu_utilization(-3.0);
        assert_eq!(w.cpu_utilization(), 0.0);
    }

    #[tokio::test]
    async fn callback_is_released_with_job() {
        let (tx, rx) = oneshot::channel();
        let w = Worker::new("i-1", WorkerTiming::default());
        w.assign(Job::new(1, "21", tx));

        let callback = w.complete(1).unwrap().into_parts().1;
        let mut reply = JobReply::default();
        reply.fields.insert("f".into(), "3,7".into());
        callback.send(reply.clone()).unwrap();
        assert_eq!(rx.await.unwrap(), reply);
    }

    #[tokio::test(start_paused = true)]
    async fn summary_reports_state_and_load() {
        let w = Worker::running("i-1", "10.0.0.1", timing(0, 90));
        w.assign(job(1, "a"));
        w.set_cpu_utilization(12.5);

        let s = w.summary();
        assert_eq!(s.id, "i-1");
        assert_eq!(s.state, WorkerState::Active);
        assert_eq!(s.instance_state, "running");
        assert_eq!(s.jobs, 1);
        assert_eq!(s.cpu_percent, 12.5);
    }
}
