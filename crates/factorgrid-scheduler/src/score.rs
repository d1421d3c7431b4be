//! Load scoring.
//!
//! ```text
//! score = cpu_weight × ⌊cpu%⌋ + Σ job_factor
//!
//! job_factor = unknown_job_penalty + live            (input never completed before)
//!            = historical(input) − live              (otherwise)
//! ```
//!
//! The known-input term estimates remaining work, so it shrinks as a job
//! progresses and goes negative once a job runs longer than it did last
//! time. Lower scores mean more available capacity.

use factor_core::Complexity;
use factor_core::config::DispatchConfig;
use factorgrid_fleet::JobLoad;

/// Weights applied by [`load_score`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoreWeights {
    pub cpu_weight: i64,
    pub unknown_job_penalty: i64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            cpu_weight: 10,
            unknown_job_penalty: 100,
        }
    }
}

impl From<&DispatchConfig> for ScoreWeights {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            cpu_weight: config.cpu_weight,
            unknown_job_penalty: config.unknown_job_penalty,
        }
    }
}

/// Score one worker from its CPU sample and the jobs it is running.
///
/// Complexities come from telemetry, so the arithmetic saturates at the
/// bounds of [`Complexity`] instead of overflowing.
pub fn load_score<F>(
    cpu_percent: f64,
    jobs: &[JobLoad],
    weights: ScoreWeights,
    history: F,
) -> Complexity
where
    F: Fn(&str) -> Option<Complexity>,
{
    // Whole percentage points only.
    let cpu = cpu_percent.max(0.0) as i64;
    let request_factor = jobs.iter().fold(0 as Complexity, |acc, job| {
        let factor = match history(&job.input) {
            Some(historical) => historical.saturating_sub(job.live_complexity),
            None => weights.unknown_job_penalty.saturating_add(job.live_complexity),
        };
        acc.saturating_add(factor)
    });

    weights.cpu_weight.saturating_mul(cpu).saturating_add(request_factor)
}

/// Index and score of the lowest score; ties go to the earliest entry.
pub fn least_loaded<I>(scores: I) -> Option<(usize, Complexity)>
where
    I: IntoIterator<Item = Complexity>,
{
    let mut best: Option<(usize, Complexity)> = None;
    for (idx, score) in scores.into_iter().enumerate() {
        if best.is_none_or(|(_, s)| score < s) {
            best = Some((idx, score));
        }
    }
    best
}

/// Whether a known-expensive input should get a fresh worker instead of
/// the least-loaded one. An idle worker (score 0) is always acceptable.
pub fn exceeds_threshold(
    selected_score: Complexity,
    historical: Complexity,
    threshold: Complexity,
) -> bool {
    selected_score != 0 && historical.saturating_add(selected_score) >= threshold
}
