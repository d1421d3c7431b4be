//! Fleet controller seam.
//!
//! The dispatcher calls into the fleet controller only while it holds
//! none of its own locks. The controller may hold its own lock while
//! calling into the dispatcher, so the only lock order in the system is
//! fleet controller → dispatcher.

use std::sync::Arc;

use async_trait::async_trait;

use factorgrid_fleet::{FleetResult, Worker};

/// Owns instance lifecycle on behalf of the dispatcher.
#[async_trait]
pub trait FleetController: Send + Sync {
    /// Provision a worker and wait until it is running with a known
    /// address. The dispatcher adds it to the fleet.
    async fn start_new_instance(&self) -> FleetResult<Arc<Worker>>;

    /// Stop a worker's instance. Failures are logged, not returned.
    async fn terminate_instance(&self, worker: &Worker);

    /// A worker was declared failed by the health monitor.
    async fn instance_failed(&self, worker: &Worker);
}
