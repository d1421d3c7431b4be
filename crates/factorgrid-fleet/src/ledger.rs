//! Job ledger — where each in-flight job runs, and how expensive each
//! input turned out to be the last time it completed.
//!
//! The ledger is plain data; the dispatcher owns it behind its own lock.
//! Job id allocation is separate and lock-free.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use factor_core::{Complexity, InstanceId, JobId};

/// Hands out job ids: unique, starting at 1, strictly increasing.
#[derive(Debug)]
pub struct JobIdAllocator {
    next: AtomicU64,
}

impl JobIdAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> JobId {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Ids handed out so far.
    pub fn issued(&self) -> u64 {
        self.next.load(Ordering::Relaxed) - 1
    }
}

impl Default for JobIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Pending-job map and historical complexity records.
#[derive(Debug, Default)]
pub struct JobLedger {
    /// In-flight job → worker executing it.
    pending: HashMap<JobId, InstanceId>,
    /// Input value → complexity observed when it last completed.
    history: HashMap<String, Complexity>,
}

impl JobLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `job_id` now runs on `worker_id`.
    ///
    /// Returns the previous owner if the id was already pending, which
    /// only happens if an id is reused.
    pub fn insert_pending(&mut self, job_id: JobId, worker_id: &str) -> Option<InstanceId> {
        self.pending.insert(job_id, worker_id.to_string())
    }

    /// Clear a pending job, returning the worker it was on.
    pub fn remove_pending(&mut self, job_id: JobId) -> Option<InstanceId> {
        self.pending.remove(&job_id)
    }

    pub fn owner(&self, job_id: JobId) -> Option<&str> {
        self.pending.get(&job_id).map(String::as_str)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Pending job ids held by one worker, lowest first.
    pub fn pending_for(&self, worker_id: &str) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self
            .pending
            .iter()
            .filter(|(_, owner)| owner.as_str() == worker_id)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Store the complexity of a completed input. Most recent wins.
    pub fn record_history(&mut self, input: &str, complexity: Complexity) -> Option<Complexity> {
        self.history.insert(input.to_string(), complexity)
    }

    pub fn historical_complexity(&self, input: &str) -> Option<Complexity> {
        self.history.get(input).copied()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}
