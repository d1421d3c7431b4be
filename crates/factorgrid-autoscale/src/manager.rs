//! Fleet manager: starts and stops worker instances and tracks which
//! ones it owns.
//!
//! Each start runs in its own task that settles the book when it ends.
//! If the caller is gone by then, a worker that came up is released
//! again, so an abandoned request never holds a capacity slot.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use factor_core::InstanceId;
use factor_core::config::FactorConfig;
use factorgrid_fleet::{FleetError, FleetResult, InstanceProvider, Worker, WorkerTiming};
use factorgrid_scheduler::{Dispatcher, FleetController, RetireOutcome};

/// Instances the manager has started and not yet released.
#[derive(Debug, Default)]
struct FleetBook {
    live: HashSet<InstanceId>,
    /// Starts in flight; counted against `max_workers`.
    starting: usize,
    failures: u64,
}

/// Provider access and timing for bringing one instance up.
#[derive(Clone)]
struct Provisioner {
    provider: Arc<dyn InstanceProvider>,
    timing: WorkerTiming,
    provision_timeout: Duration,
    poll_interval: Duration,
}

impl Provisioner {
    /// Start an instance and wait for it to report running with an address.
    async fn provision(&self) -> FleetResult<Arc<Worker>> {
        let desc = self.provider.start_instance().await?;
        let id = desc.id.clone();
        info!(instance = %id, state = %desc.state, "instance started, waiting for it to run");

        let worker = Worker::new(id.clone(), self.timing);
        worker.update_instance(desc.state, desc.address);
        let deadline = Instant::now() + self.provision_timeout;

        loop {
            let state = worker.instance_state();
            if state.is_running() && worker.address().is_some() {
                return Ok(Arc::new(worker));
            }
            if state.is_terminal() {
                self.stop(&id).await;
                return Err(FleetError::StartFailed {
                    id,
                    state: state.to_string(),
                });
            }
            if Instant::now() >= deadline {
                warn!(instance = %id, %state, "instance not ready before timeout");
                self.stop(&id).await;
                return Err(FleetError::ProvisionTimeout(id));
            }

            tokio::time::sleep(self.poll_interval).await;
            match self.provider.describe_instance(&id).await {
                Ok(desc) => worker.update_instance(desc.state, desc.address),
                Err(e) => debug!(instance = %id, error = %e, "describe failed while provisioning"),
            }
        }
    }

    async fn stop(&self, id: &str) {
        match self.provider.terminate_instance(id).await {
            Ok(()) => debug!(instance = %id, "instance terminated"),
            Err(e) => warn!(instance = %id, error = %e, "instance termination failed"),
        }
    }
}

/// Provisions workers through an [`InstanceProvider`].
pub struct FleetManager {
    provisioner: Provisioner,
    max_workers: usize,
    /// The Fleet-Controller lock.
    book: Arc<Mutex<FleetBook>>,
}

impl FleetManager {
    pub fn new(provider: Arc<dyn InstanceProvider>, timing: WorkerTiming) -> Self {
        Self {
            provisioner: Provisioner {
                provider,
                timing,
                provision_timeout: Duration::from_secs(120),
                poll_interval: Duration::from_secs(2),
            },
            max_workers: 10,
            book: Arc::new(Mutex::new(FleetBook::default())),
        }
    }

    /// Build from the `[worker]`, `[health]` and `[autoscale]` sections.
    pub fn from_config(provider: Arc<dyn InstanceProvider>, config: &FactorConfig) -> Self {
        let timing = WorkerTiming {
            grace_period: config.worker.grace_period(),
            drain_timeout: config.health.drain_timeout(),
        };
        Self::new(provider, timing)
            .with_provision_timeout(config.worker.provision_timeout())
            .with_poll_interval(config.worker.poll_interval())
            .with_max_workers(config.autoscale.max_workers as usize)
    }

    pub fn with_provision_timeout(mut self, timeout: Duration) -> Self {
        self.provisioner.provision_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.provisioner.poll_interval = interval;
        self
    }

    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.max_workers = max;
        self
    }

    /// Instances started and not yet terminated.
    pub async fn live_count(&self) -> usize {
        self.book.lock().await.live.len()
    }

    pub async fn is_live(&self, id: &str) -> bool {
        self.book.lock().await.live.contains(id)
    }

    /// Workers declared failed so far.
    pub async fn failures(&self) -> u64 {
        self.book.lock().await.failures
    }

    /// Ask the dispatcher to give up a worker, holding the fleet lock so
    /// the book and the dispatcher's fleet change together.
    pub async fn retire(&self, dispatcher: &Dispatcher, worker_id: &str) -> RetireOutcome {
        let mut book = self.book.lock().await;
        let outcome = dispatcher.retire_worker(worker_id).await;
        match &outcome {
            RetireOutcome::Terminated(worker) => {
                book.live.remove(worker.id());
                self.provisioner.stop(worker.id()).await;
            }
            RetireOutcome::Draining => {
                info!(worker = %worker_id, "worker draining before retirement");
            }
            RetireOutcome::NotFound => {
                debug!(worker = %worker_id, "retire requested for worker not in fleet");
            }
        }
        outcome
    }

    /// Terminate every instance this manager started.
    pub async fn terminate_all(&self) -> usize {
        let ids: Vec<InstanceId> = {
            let mut book = self.book.lock().await;
            book.live.drain().collect()
        };
        for id in &ids {
            self.provisioner.stop(id).await;
        }
        info!(count = ids.len(), "all worker instances terminated");
        ids.len()
    }
}

#[async_trait]
impl FleetController for FleetManager {
    async fn start_new_instance(&self) -> FleetResult<Arc<Worker>> {
        {
            let mut book = self.book.lock().await;
            if book.live.len() + book.starting >= self.max_workers {
                warn!(max = self.max_workers, "worker limit reached");
                return Err(FleetError::CapacityExhausted);
            }
            book.starting += 1;
        }

        // The lock is not held while the instance boots.
        let provisioner = self.provisioner.clone();
        let book = self.book.clone();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let result = provisioner.provision().await;
            {
                let mut book = book.lock().await;
                book.starting -= 1;
                if let Ok(worker) = &result {
                    book.live.insert(worker.id().to_string());
                    info!(
                        worker = %worker.id(),
                        address = ?worker.address(),
                        live = book.live.len(),
                        "worker ready"
                    );
                }
            }
            if let Err(Ok(worker)) = tx.send(result) {
                warn!(worker = %worker.id(), "start abandoned by its caller, releasing worker");
                book.lock().await.live.remove(worker.id());
                provisioner.stop(worker.id()).await;
            }
        });

        rx.await
            .unwrap_or_else(|_| Err(FleetError::Provider("provisioning task ended early".into())))
    }

    async fn terminate_instance(&self, worker: &Worker) {
        self.book.lock().await.live.remove(worker.id());
        self.provisioner.stop(worker.id()).await;
    }

    async fn instance_failed(&self, worker: &Worker) {
        let mut book = self.book.lock().await;
        book.live.remove(worker.id());
        book.failures += 1;
        warn!(worker = %worker.id(), failures = book.failures, "worker instance failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    use tokio::sync::oneshot;

    use factor_core::InstanceState;
    use factor_core::config::DispatchConfig;
    use factorgrid_fleet::{InstanceDescription, StaticProvider, WorkerState};
    use factorgrid_scheduler::{DispatchRequest, JobSender};

    /// Provider that starts one instance per call and replays scripted
    /// describe results, then reports running.
    #[derive(Default)]
    struct ScriptedProvider {
        script: StdMutex<VecDeque<InstanceState>>,
        started: StdMutex<u32>,
        terminated: StdMutex<Vec<String>>,
    }

    impl ScriptedProvider {
        fn with_script(states: Vec<InstanceState>) -> Self {
            Self {
                script: StdMutex::new(states.into()),
                ..Self::default()
            }
        }

        fn terminated(&self) -> Vec<String> {
            self.terminated.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl InstanceProvider for ScriptedProvider {
        async fn start_instance(&self) -> FleetResult<InstanceDescription> {
            let mut n = self.started.lock().unwrap();
            *n += 1;
            Ok(InstanceDescription {
                id: format!("i-{n}"),
                state: InstanceState::Pending,
                address: None,
            })
        }

        async fn terminate_instance(&self, id: &str) -> FleetResult<()> {
            self.terminated.lock().unwrap().push(id.to_string());
            Ok(())
        }

        async fn describe_instance(&self, id: &str) -> FleetResult<InstanceDescription> {
            let state = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(InstanceState::Running);
            let address = state.is_running().then(|| "10.9.0.1".to_string());
            Ok(InstanceDescription {
                id: id.to_string(),
                state,
                address,
            })
        }
    }

    struct NullSender;

    impl JobSender for NullSender {
        fn dispatch(&self, _request: DispatchRequest) {}
    }

    fn timing() -> WorkerTiming {
        WorkerTiming {
            grace_period: Duration::ZERO,
            drain_timeout: Duration::from_secs(90),
        }
    }

    fn static_manager(hosts: &[&str]) -> (Arc<StaticProvider>, FleetManager) {
        let provider = Arc::new(StaticProvider::new(
            hosts.iter().map(|h| h.to_string()).collect(),
        ));
        let manager = FleetManager::new(provider.clone(), timing());
        (provider, manager)
    }

    #[tokio::test]
    async fn start_returns_running_worker() {
        let (_, manager) = static_manager(&["10.0.0.1"]);
        let worker = manager.start_new_instance().await.unwrap();

        assert_eq!(worker.address().as_deref(), Some("10.0.0.1"));
        assert_eq!(worker.state(), WorkerState::Active);
        assert!(manager.is_live(worker.id()).await);
        assert_eq!(manager.live_count().await, 1);
    }

    #[tokio::test]
    async fn worker_limit_is_enforced() {
        let (_, manager) = static_manager(&["10.0.0.1", "10.0.0.2"]);
        let manager = manager.with_max_workers(1);

        manager.start_new_instance().await.unwrap();
        let second = manager.start_new_instance().await;
        assert!(matches!(second, Err(FleetError::CapacityExhausted)));
    }

    #[tokio::test]
    async fn provider_exhaustion_propagates() {
        let (_, manager) = static_manager(&[]);
        let result = manager.start_new_instance().await;
        assert!(matches!(result, Err(FleetError::CapacityExhausted)));
        assert_eq!(manager.live_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_instance_is_polled_until_running() {
        let provider = Arc::new(ScriptedProvider::with_script(vec![
            InstanceState::Pending,
            InstanceState::Pending,
            InstanceState::Running,
        ]));
        let manager = FleetManager::new(provider.clone(), timing())
            .with_poll_interval(Duration::from_secs(2));

        let started = Instant::now();
        let worker = manager.start_new_instance().await.unwrap();

        assert_eq!(worker.id(), "i-1");
        assert_eq!(worker.address().as_deref(), Some("10.9.0.1"));
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn instance_that_never_runs_times_out() {
        let provider = Arc::new(ScriptedProvider::with_script(vec![InstanceState::Pending; 100]));
        let manager = FleetManager::new(provider.clone(), timing())
            .with_poll_interval(Duration::from_secs(2))
            .with_provision_timeout(Duration::from_secs(10));

        let result = manager.start_new_instance().await;
        assert!(matches!(result, Err(FleetError::ProvisionTimeout(id)) if id == "i-1"));
        assert_eq!(provider.terminated(), vec!["i-1".to_string()]);
        assert_eq!(manager.live_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn instance_dying_while_starting_fails() {
        let provider = Arc::new(ScriptedProvider::with_script(vec![InstanceState::Terminated]));
        let manager = FleetManager::new(provider.clone(), timing());

        let result = manager.start_new_instance().await;
        assert!(matches!(
            result,
            Err(FleetError::StartFailed { ref state, .. }) if state == "terminated"
        ));
        assert_eq!(provider.terminated(), vec!["i-1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_start_frees_its_slot() {
        let provider = Arc::new(ScriptedProvider::with_script(vec![InstanceState::Pending; 5]));
        let manager = Arc::new(
            FleetManager::new(provider.clone(), timing())
                .with_max_workers(1)
                .with_poll_interval(Duration::from_secs(2))
                .with_provision_timeout(Duration::from_secs(10)),
        );

        let start = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.start_new_instance().await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        start.abort();
        assert!(start.await.unwrap_err().is_cancelled());

        // The detached start times out and hands the slot back.
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(provider.terminated(), vec!["i-1".to_string()]);
        assert_eq!(manager.live_count().await, 0);

        let worker = manager.start_new_instance().await.unwrap();
        assert_eq!(worker.id(), "i-2");
    }

    #[tokio::test(start_paused = true)]
    async fn worker_ready_after_caller_left_is_released() {
        let provider = Arc::new(ScriptedProvider::with_script(vec![InstanceState::Pending]));
        let manager = Arc::new(
            FleetManager::new(provider.clone(), timing())
                .with_max_workers(1)
                .with_poll_interval(Duration::from_secs(2)),
        );

        let start = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.start_new_instance().await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        start.abort();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(provider.terminated(), vec!["i-1".to_string()]);
        assert_eq!(manager.live_count().await, 0);
        assert!(manager.start_new_instance().await.is_ok());
    }

    #[tokio::test]
    async fn terminate_returns_host_and_frees_capacity() {
        let (provider, manager) = static_manager(&["10.0.0.1"]);
        let manager = manager.with_max_workers(1);
        let worker = manager.start_new_instance().await.unwrap();
        assert_eq!(provider.available(), 0);

        manager.terminate_instance(&worker).await;
        assert_eq!(provider.available(), 1);
        assert_eq!(manager.live_count().await, 0);
        assert!(manager.start_new_instance().await.is_ok());
    }

    #[tokio::test]
    async fn failures_are_counted() {
        let (_, manager) = static_manager(&["10.0.0.1"]);
        let worker = manager.start_new_instance().await.unwrap();

        manager.instance_failed(&worker).await;
        assert_eq!(manager.failures().await, 1);
        assert!(!manager.is_live(worker.id()).await);
    }

    #[tokio::test]
    async fn terminate_all_releases_every_instance() {
        let (provider, manager) = static_manager(&["10.0.0.1", "10.0.0.2"]);
        manager.start_new_instance().await.unwrap();
        manager.start_new_instance().await.unwrap();

        assert_eq!(manager.terminate_all().await, 2);
        assert_eq!(provider.available(), 2);
        assert_eq!(manager.live_count().await, 0);
    }

    #[tokio::test]
    async fn retire_idle_worker_terminates_instance() {
        let (provider, manager) = static_manager(&["10.0.0.1"]);
        let manager = Arc::new(manager);
        let dispatcher =
            Dispatcher::new(manager.clone(), Arc::new(NullSender), &DispatchConfig::default());
        let worker = manager.start_new_instance().await.unwrap();
        dispatcher.add_worker(worker.clone()).await;

        let outcome = manager.retire(&dispatcher, worker.id()).await;
        assert!(matches!(outcome, RetireOutcome::Terminated(_)));
        assert_eq!(provider.available(), 1);
        assert!(dispatcher.workers().await.is_empty());
    }

    #[tokio::test]
    async fn retire_busy_worker_drains_then_terminates() {
        let (provider, manager) = static_manager(&["10.0.0.1"]);
        let manager = Arc::new(manager);
        let dispatcher =
            Dispatcher::new(manager.clone(), Arc::new(NullSender), &DispatchConfig::default());
        let worker = manager.start_new_instance().await.unwrap();
        dispatcher.add_worker(worker.clone()).await;

        let (tx, _rx) = oneshot::channel();
        let admitted = dispatcher.admit("91", tx).await.unwrap();

        let outcome = manager.retire(&dispatcher, worker.id()).await;
        assert!(matches!(outcome, RetireOutcome::Draining));
        assert_eq!(provider.available(), 0);

        dispatcher.complete(admitted.job_id).await.unwrap();
        assert_eq!(provider.available(), 1);
        assert_eq!(manager.live_count().await, 0);
    }
}
