use serde::{Deserialize, Serialize};

use factor_core::{Complexity, InstanceId, JobId};

/// One telemetry report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TelemetryEvent {
    /// Latest CPU utilization sample for a worker, in percent.
    CpuUtilization { worker: InstanceId, percent: f64 },
    /// Latest reading of a progress counter for a running job.
    JobMetric {
        job_id: JobId,
        name: String,
        value: u64,
    },
    /// Observed complexity of an input whose job has completed.
    Historical { input: String, complexity: Complexity },
}

impl TelemetryEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            TelemetryEvent::CpuUtilization { .. } => "cpu_utilization",
            TelemetryEvent::JobMetric { .. } => "job_metric",
            TelemetryEvent::Historical { .. } => "historical",
        }
    }
}
