//! Outbound job dispatch to workers.
//!
//! Each job is handed to its worker with a single
//! `GET /f.html?n=<input>&rid=<job_id>&ip=<public_ip>`. The worker answers
//! later by calling back `/r.html` on the dispatcher, so the response
//! body is drained and discarded. Send failures are logged only; the job
//! stays pending until it completes or its worker is declared failed.

use std::time::Duration;

use http_body_util::BodyExt;
use tracing::{debug, warn};

use factor_core::{InstanceId, JobId};

use crate::error::DispatchError;

/// Connecting to a worker gives up after this long.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A job ready to be sent to the worker it was assigned to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRequest {
    pub job_id: JobId,
    pub worker_id: InstanceId,
    pub address: String,
    pub input: String,
}

/// Delivers assigned jobs to workers without blocking the caller.
pub trait JobSender: Send + Sync {
    fn dispatch(&self, request: DispatchRequest);
}

/// Sends jobs over HTTP/1 with hyper, one connection per job.
#[derive(Debug, Clone)]
pub struct HttpJobSender {
    worker_port: u16,
    public_ip: String,
}

impl HttpJobSender {
    pub fn new(worker_port: u16, public_ip: impl Into<String>) -> Self {
        Self {
            worker_port,
            public_ip: public_ip.into(),
        }
    }

    /// Path and query sent to the worker.
    pub fn job_path(&self, request: &DispatchRequest) -> String {
        format!(
            "/f.html?n={}&rid={}&ip={}",
            urlencoding::encode(&request.input),
            request.job_id,
            urlencoding::encode(&self.public_ip),
        )
    }

    /// Send one job and drain the reply. Returns the response status.
    pub async fn send(
        &self,
        request: &DispatchRequest,
    ) -> Result<http::StatusCode, DispatchError> {
        let authority = format!("{}:{}", request.address, self.worker_port);
        let path = self.job_path(request);

        let stream = tokio::time::timeout(
            CONNECT_TIMEOUT,
            tokio::net::TcpStream::connect(&authority),
        )
        .await
        .map_err(|_| DispatchError::Timeout(authority.clone()))?
        .map_err(|source| DispatchError::Connect {
            authority: authority.clone(),
            source,
        })?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method("GET")
            .uri(&path)
            .header("host", &authority)
            .header("user-agent", "factorgrid-dispatcher/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())?;

        let resp = sender.send_request(req).await?;
        let status = resp.status();
        resp.into_body().collect().await?;

        Ok(status)
    }
}

impl JobSender for HttpJobSender {
    fn dispatch(&self, request: DispatchRequest) {
        let sender = self.clone();
        tokio::spawn(async move {
            match sender.send(&request).await {
                Ok(status) if status.is_success() => {
                    debug!(job_id = request.job_id, worker = %request.worker_id, "job delivered");
                }
                Ok(status) => {
                    warn!(
                        job_id = request.job_id,
                        worker = %request.worker_id,
                        %status,
                        "worker rejected job"
                    );
                }
                Err(e) => {
                    warn!(
                        job_id = request.job_id,
                        worker = %request.worker_id,
                        error = %e,
                        "job dispatch failed"
                    );
                }
            }
        });
    }
}
