//! factorgrid-fleet — the fleet model shared by the dispatcher, the
//! health monitor and the fleet controller.
//!
//! - **`worker`** — one remote compute instance: address, provider state,
//!   assigned jobs, CPU sample, and the drain flag. Its lifecycle state
//!   and assignment eligibility are derived on every call, never cached.
//! - **`ledger`** — which job runs where (`JobId → InstanceId`) and the
//!   historical complexity of inputs that have completed before.
//! - **`provider`** — the seam to whatever provisions instances, plus a
//!   static host-pool implementation.
//!
//! # Worker lifecycle
//!
//! ```text
//! provisioning ──► active ──► draining ──► terminated
//!                    ▲            │
//!                    └────────────┘  drain expired (3 × health interval)
//!
//! active | draining ──► failed       provider reports a terminal state
//! ```

pub mod error;
pub mod ledger;
pub mod provider;
pub mod worker;

pub use error::{FleetError, FleetResult};
pub use ledger::{JobIdAllocator, JobLedger};
pub use provider::{InstanceDescription, InstanceProvider, StaticProvider};
pub use worker::{
    CallbackHandle, Job, JobLoad, JobMetrics, JobReply, Worker, WorkerState, WorkerSummary,
    WorkerTiming, COMPLEXITY_UNIT,
};
