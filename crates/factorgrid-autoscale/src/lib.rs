//! factorgrid-autoscale — the fleet controller.
//!
//! `FleetManager` provisions and terminates worker instances through an
//! `InstanceProvider` and implements the dispatcher's `FleetController`
//! seam. `Autoscaler` periodically compares fleet CPU against the
//! configured bounds and grows or shrinks the fleet.
//!
//! # Scaling Algorithm
//!
//! ```text
//! live      = workers not draining, failed or terminated
//! mean_cpu  = mean CPU of eligible (active) workers
//!
//! if live < min_workers:
//!     ScaleUp                                  // no cooldown
//! if mean_cpu > scale_up_cpu and live < max_workers:
//!     ScaleUp                                  // after scale_up_window
//! if mean_cpu < scale_down_cpu and live > min_workers:
//!     ScaleDown(least-loaded active worker)    // after scale_down_window
//! ```
//!
//! # Locking
//!
//! The fleet manager's book lock is the Fleet-Controller lock. Scale-down
//! holds it while asking the dispatcher to retire a worker; the
//! dispatcher never calls back into the fleet manager while holding its
//! own lock, so the order is always fleet manager → dispatcher.

pub mod manager;
pub mod scaler;

pub use manager::FleetManager;
pub use scaler::{Autoscaler, ScaleDecision, ScalePolicy};
