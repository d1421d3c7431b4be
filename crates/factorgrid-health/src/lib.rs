//! factorgrid-health — worker liveness for FactorGrid.
//!
//! The health monitor runs on a fixed interval, independent of request
//! traffic. Each cycle refreshes every worker's provider-reported state
//! and hands workers whose instance has died to the dispatcher's
//! failure protocol.
//!
//! # Cycle
//!
//! ```text
//! HealthMonitor::check_once
//!   ├── snapshot fleet           (Dispatcher::workers)
//!   ├── describe each instance   (InstanceProvider::describe_instance)
//!   │   └── Worker::update_instance(state, address)
//!   └── for each terminal state  (shutting-down, terminated, stopping, stopped)
//!       └── Dispatcher::report_failure → re-admit orphaned jobs
//! ```
//!
//! A worker removed from the fleet between two cycles is simply skipped;
//! `report_failure` is idempotent.

pub mod monitor;

pub use monitor::HealthMonitor;
