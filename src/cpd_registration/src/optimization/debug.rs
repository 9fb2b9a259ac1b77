//! Iteration history for EM registration.
//!
//! Each run records one [`IterationRecord`] per EM iteration so a run can be
//! inspected or exported after the fact.

use serde::Serialize;

/// State captured at the end of one EM iteration.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IterationRecord {
    /// Iteration number (1-indexed; 0 is the initial E-step).
    pub iteration: usize,

    /// σ² after the M-step.
    pub sigma2: f64,

    /// Objective after the M-step.
    pub log_likelihood: f64,

    /// Change of the objective relative to the previous iteration.
    pub delta: f64,

    /// Total posterior mass n_p.
    pub weight_mass: f64,

    /// E-step wall time in milliseconds.
    pub expectation_ms: f64,

    /// M-step wall time in milliseconds.
    pub maximization_ms: f64,
}

impl IterationRecord {
    /// Format as a compact log line.
    pub fn to_log_line(&self) -> String {
        format!(
            "iter={} sigma2={:.6e} ll={:.6} delta={:.3e} np={:.3} e={:.2}ms m={:.2}ms",
            self.iteration,
            self.sigma2,
            self.log_likelihood,
            self.delta,
            self.weight_mass,
            self.expectation_ms,
            self.maximization_ms,
        )
    }
}

/// Complete history of one registration run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistrationHistory {
    /// Transformation family name.
    pub transform_type: String,

    /// Number of source points.
    pub num_source_points: usize,

    /// Number of target points.
    pub num_target_points: usize,

    /// σ² the run started from.
    pub initial_sigma2: f64,

    /// Objective of the initial E-step.
    pub initial_log_likelihood: f64,

    /// Iteration history.
    pub iterations: Vec<IterationRecord>,

    /// Final status name.
    pub status: String,

    /// Total wall time in milliseconds.
    pub total_ms: f64,
}

impl RegistrationHistory {
    pub fn new(transform_type: &str, num_source_points: usize, num_target_points: usize) -> Self {
        Self {
            transform_type: transform_type.to_string(),
            num_source_points,
            num_target_points,
            ..Default::default()
        }
    }

    pub fn push(&mut self, record: IterationRecord) {
        self.iterations.push(record);
    }

    /// Objective values, starting with the initial E-step.
    pub fn log_likelihoods(&self) -> Vec<f64> {
        std::iter::once(self.initial_log_likelihood)
            .chain(self.iterations.iter().map(|r| r.log_likelihood))
            .collect()
    }

    pub fn last(&self) -> Option<&IterationRecord> {
        self.iterations.last()
    }

    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Convert to pretty JSON string.
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Format as compact multi-line log.
    pub fn to_log(&self) -> String {
        let mut lines = Vec::new();
        lines.push(format!(
            "=== {} registration source={} target={} status={} iters={} total={:.2}ms ===",
            self.transform_type,
            self.num_source_points,
            self.num_target_points,
            self.status,
            self.iterations.len(),
            self.total_ms,
        ));
        lines.push(format!(
            "  initial sigma2={:.6e} ll={:.6}",
            self.initial_sigma2, self.initial_log_likelihood
        ));
        for record in &self.iterations {
            lines.push(format!("  {}", record.to_log_line()));
        }
        lines.join("\n")
    }
}
