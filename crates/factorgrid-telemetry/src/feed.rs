//! Telemetry feed — applies polled events to the dispatcher.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use factorgrid_scheduler::Dispatcher;

use crate::event::TelemetryEvent;
use crate::source::TelemetrySource;

/// Counters since the feed started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FeedStats {
    pub applied: u64,
    /// Events naming a worker or job the dispatcher no longer knows.
    pub stale: u64,
    pub poll_errors: u64,
}

/// Polls telemetry sources and feeds the dispatcher.
pub struct TelemetryFeed {
    dispatcher: Arc<Dispatcher>,
    sources: Vec<Arc<dyn TelemetrySource>>,
    interval: Duration,
    applied: AtomicU64,
    stale: AtomicU64,
    poll_errors: AtomicU64,
}

impl TelemetryFeed {
    pub fn new(dispatcher: Arc<Dispatcher>, interval: Duration) -> Self {
        Self {
            dispatcher,
            sources: Vec::new(),
            interval,
            applied: AtomicU64::new(0),
            stale: AtomicU64::new(0),
            poll_errors: AtomicU64::new(0),
        }
    }

    pub fn with_source(mut self, source: Arc<dyn TelemetrySource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn stats(&self) -> FeedStats {
        FeedStats {
            applied: self.applied.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            poll_errors: self.poll_errors.load(Ordering::Relaxed),
        }
    }

    /// Apply one event. Returns `false` if its target is gone.
    pub async fn apply(&self, event: TelemetryEvent) -> bool {
        let applied = match &event {
            TelemetryEvent::CpuUtilization { worker, percent } => {
                self.dispatcher.record_cpu(worker, *percent).await
            }
            TelemetryEvent::JobMetric {
                job_id,
                name,
                value,
            } => self.dispatcher.record_job_metric(*job_id, name, *value).await,
            TelemetryEvent::Historical { input, complexity } => {
                self.dispatcher.record_history(input, *complexity).await;
                true
            }
        };

        if applied {
            self.applied.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stale.fetch_add(1, Ordering::Relaxed);
            debug!(kind = event.kind(), ?event, "telemetry for unknown target dropped");
        }
        applied
    }

    /// Poll every source once and apply what came back. Returns the
    /// number of events applied.
    pub async fn poll_once(&self) -> usize {
        let mut applied = 0;
        for source in &self.sources {
            let events = match source.poll().await {
                Ok(events) => events,
                Err(e) => {
                    self.poll_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "telemetry poll failed");
                    continue;
                }
            };
            for event in events {
                if self.apply(event).await {
                    applied += 1;
                }
            }
        }
        applied
    }

    /// Poll every `interval` until `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            sources = self.sources.len(),
            "telemetry feed started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    let applied = self.poll_once().await;
                    if applied > 0 {
                        debug!(applied, "telemetry applied");
                    }
                }
                _ = shutdown.changed() => {
                    // Drain what is already queued.
                    self.poll_once().await;
                    info!("telemetry feed shutting down");
                    break;
                }
            }
        }
    }
}
