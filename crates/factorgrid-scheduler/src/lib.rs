//! factorgrid-scheduler — job admission and fault tolerance.
//!
//! The `Dispatcher` decides which worker runs each incoming job, keeps
//! the pending-job ledger consistent under concurrent arrivals,
//! completions and failures, and re-admits the jobs of a worker that
//! died.
//!
//! # Architecture
//!
//! ```text
//! Dispatcher
//!   ├── Mutex<DispatchState>
//!   │   ├── fleet: Vec<Arc<Worker>>   (stable order, first wins ties)
//!   │   └── JobLedger                 (pending jobs, input history)
//!   ├── JobIdAllocator                (lock-free, monotonic)
//!   ├── FleetController               (called with no dispatcher lock held)
//!   └── JobSender                     (fire-and-forget GET to the worker)
//! ```

pub mod dispatcher;
pub mod error;
pub mod fleet;
pub mod score;
pub mod transport;

pub use dispatcher::{Admission, CompletedJob, Dispatcher, RetireOutcome};
pub use error::{DispatchError, SchedulerError, SchedulerResult};
pub use fleet::FleetController;
pub use score::{load_score, ScoreWeights};
pub use transport::{DispatchRequest, HttpJobSender, JobSender};
