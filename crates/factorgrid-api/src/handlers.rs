//! Route handlers.
//!
//! `/f.html` and `/r.html` speak the worker protocol; everything under
//! `/api/v1` returns the `ApiResponse` JSON envelope.

use std::collections::{BTreeMap, HashMap};

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use factorgrid_fleet::JobReply;
use factorgrid_telemetry::TelemetryEvent;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

// ── Worker protocol ────────────────────────────────────────────

/// GET /f.html?n=<value>
///
/// Holds the request open until the job's result arrives.
pub async fn submit_job(
    State(state): State<ApiState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(input) = params.get("n").filter(|n| !n.is_empty()) else {
        return error_response("missing query parameter n", StatusCode::BAD_REQUEST).into_response();
    };

    let (tx, rx) = oneshot::channel();
    let admission = match state.dispatcher.admit(input.as_str(), tx).await {
        Ok(admission) => admission,
        Err(e) => {
            return error_response(&e.to_string(), StatusCode::SERVICE_UNAVAILABLE).into_response();
        }
    };

    match rx.await {
        Ok(reply) => Json(reply).into_response(),
        Err(_) => {
            warn!(job_id = admission.job_id, "job abandoned before completion");
            error_response("job could not be completed", StatusCode::SERVICE_UNAVAILABLE)
                .into_response()
        }
    }
}

/// GET /r.html?rid=<job id>&<field>=<value>...
///
/// Unknown ids are acknowledged; the worker has nothing to retry.
pub async fn job_result(
    State(state): State<ApiState>,
    Query(params): Query<Vec<(String, String)>>,
) -> impl IntoResponse {
    let rid = params
        .iter()
        .find(|(k, _)| k == "rid")
        .and_then(|(_, v)| v.parse::<u64>().ok());
    let Some(job_id) = rid else {
        return error_response("missing or invalid rid", StatusCode::BAD_REQUEST).into_response();
    };

    if let Some(done) = state.dispatcher.complete(job_id).await {
        let fields: BTreeMap<String, String> =
            params.into_iter().filter(|(k, _)| k != "rid").collect();
        if done.callback.send(JobReply { fields }).is_err() {
            debug!(job_id, "caller went away before the result arrived");
        }
    }
    (StatusCode::OK, "OK").into_response()
}

// ── Fleet ──────────────────────────────────────────────────────

/// GET /api/v1/workers
pub async fn list_workers(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.dispatcher.worker_summaries().await)
}

// ── Telemetry ──────────────────────────────────────────────────

/// POST /api/v1/telemetry
pub async fn push_telemetry(
    State(state): State<ApiState>,
    Json(event): Json<TelemetryEvent>,
) -> impl IntoResponse {
    let kind = event.kind();
    match state.telemetry.push(event) {
        Ok(()) => (StatusCode::ACCEPTED, ApiResponse::ok(kind)).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::SERVICE_UNAVAILABLE).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use factor_core::config::DispatchConfig;
    use factorgrid_fleet::{FleetError, FleetResult, Worker, WorkerTiming};
    use factorgrid_scheduler::{DispatchRequest, Dispatcher, FleetController, JobSender};
    use factorgrid_telemetry::{ChannelSource, TelemetrySource};

    struct NoFleet;

    #[async_trait]
    impl FleetController for NoFleet {
        async fn start_new_instance(&self) -> FleetResult<Arc<Worker>> {
            Err(FleetError::CapacityExhausted)
        }
        async fn terminate_instance(&self, _worker: &Worker) {}
        async fn instance_failed(&self, _worker: &Worker) {}
    }

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<DispatchRequest>>,
    }

    impl JobSender for RecordingSender {
        fn dispatch(&self, request: DispatchRequest) {
            self.sent.lock().unwrap().push(request);
        }
    }

    async fn test_state(workers: &[&str]) -> (ApiState, ChannelSource) {
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(NoFleet),
            Arc::new(RecordingSender::default()),
            &DispatchConfig::default(),
        ));
        let timing = WorkerTiming {
            grace_period: Duration::ZERO,
            drain_timeout: Duration::from_secs(90),
        };
        for id in workers {
            dispatcher
                .add_worker(Arc::new(Worker::running(*id, "10.0.0.1", timing)))
                .await;
        }
        let (sink, source) = ChannelSource::channel(4);
        (
            ApiState {
                dispatcher,
                telemetry: sink,
            },
            source,
        )
    }

    fn query(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn pairs(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[tokio::test]
    async fn submit_without_n_is_bad_request() {
        let (state, _) = test_state(&["w1"]).await;
        let resp = submit_job(State(state), Query(query(&[]))).await.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn submit_with_no_capacity_is_unavailable() {
        let (state, _) = test_state(&[]).await;
        let resp = submit_job(State(state), Query(query(&[("n", "15")])))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn submit_waits_for_worker_result() {
        let (state, _) = test_state(&["w1"]).await;
        let submit = tokio::spawn(submit_job(State(state.clone()), Query(query(&[("n", "15")]))));

        // Wait for admission.
        while state.dispatcher.pending_count().await == 0 {
            tokio::task::yield_now().await;
        }
        let resp = job_result(
            State(state.clone()),
            Query(pairs(&[("rid", "1"), ("f", "3"), ("g", "5")])),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = submit.await.unwrap().into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn submit_reports_abandoned_job() {
        let (state, _) = test_state(&["w1"]).await;
        let submit = tokio::spawn(submit_job(State(state.clone()), Query(query(&[("n", "15")]))));

        while state.dispatcher.pending_count().await == 0 {
            tokio::task::yield_now().await;
        }
        state.dispatcher.shutdown().await;

        let resp = submit.await.unwrap().into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn result_for_unknown_job_is_acknowledged() {
        let (state, _) = test_state(&["w1"]).await;
        let resp = job_result(State(state), Query(pairs(&[("rid", "999")])))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn result_with_bad_rid_is_bad_request() {
        let (state, _) = test_state(&["w1"]).await;
        let resp = job_result(State(state.clone()), Query(pairs(&[("rid", "abc")])))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = job_result(State(state), Query(pairs(&[("f", "1")])))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn list_workers_returns_fleet() {
        let (state, _) = test_state(&["w1", "w2"]).await;
        let resp = list_workers(State(state)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["data"][1]["id"], "w2");
        assert_eq!(body["data"][0]["jobs"], 0);
    }

    #[tokio::test]
    async fn telemetry_is_queued_for_the_feed() {
        let (state, source) = test_state(&["w1"]).await;
        let event = TelemetryEvent::CpuUtilization {
            worker: "w1".into(),
            percent: 33.0,
        };

        let resp = push_telemetry(State(state), Json(event.clone()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(source.poll().await.unwrap(), vec![event]);
    }
}
