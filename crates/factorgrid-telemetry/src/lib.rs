//! factorgrid-telemetry — load signals for the dispatcher.
//!
//! Workers and monitoring agents report three kinds of event: CPU
//! utilization per worker, progress counters per running job, and the
//! final complexity of a finished input. The feed polls its sources on
//! an interval and applies each event to the dispatcher.
//!
//! # Architecture
//!
//! ```text
//! POST /api/v1/telemetry ──► ChannelSink ──► ChannelSource ─┐
//!                                                           ├─► TelemetryFeed::poll_once
//! other TelemetrySource impls ──────────────────────────────┘        │
//!                                                                     ▼
//!                     Dispatcher::{record_cpu, record_job_metric, record_history}
//! ```

pub mod event;
pub mod feed;
pub mod source;

pub use event::TelemetryEvent;
pub use feed::{FeedStats, TelemetryFeed};
pub use source::{ChannelSink, ChannelSource, TelemetrySource};
