//! factorgrid-api — HTTP surface of the dispatcher.
//!
//! Clients submit jobs and wait for the answer on the same request;
//! workers report results on the callback route.
//!
//! # Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/f.html?n=<value>` | Submit a job; responds when it completes |
//! | GET | `/r.html?rid=<job id>&...` | Worker result callback |
//! | GET | `/api/v1/workers` | Fleet inventory |
//! | POST | `/api/v1/telemetry` | Push a telemetry event |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use factorgrid_scheduler::Dispatcher;
use factorgrid_telemetry::ChannelSink;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub dispatcher: Arc<Dispatcher>,
    pub telemetry: ChannelSink,
}

/// Build the complete router (job routes + REST API).
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/workers", get(handlers::list_workers))
        .route("/telemetry", post(handlers::push_telemetry))
        .with_state(state.clone());

    Router::new()
        .route("/f.html", get(handlers::submit_job))
        .route("/r.html", get(handlers::job_result))
        .with_state(state)
        .nest("/api/v1", api_routes)
}
