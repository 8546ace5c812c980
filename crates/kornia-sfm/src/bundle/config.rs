use serde::{Deserialize, Serialize};

use super::BundleAdjustmentError;

/// Configuration of the bundle adjustment solver.
///
/// The configuration is validated once when the solver is created and never changes
/// during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Maximum number of outer (linearization) iterations.
    pub max_iterations: usize,
    /// Initial damping parameter.
    pub initial_damping: f64,
    /// Factor used to increase or decrease the damping.
    pub damping_factor: f64,
    /// Relative cost decrease below which the solver has converged.
    pub convergence_threshold: f64,
    /// Lower bound of the damping.
    pub min_damping: f64,
    /// Upper bound of the damping; exceeding it means divergence.
    pub max_damping: f64,
    /// Maximum number of consecutive rejected steps within one iteration.
    pub max_retries: usize,
    /// Gradient norm below which the solver has converged.
    pub gradient_tolerance: f64,
    /// Cameras held constant during the refinement (gauge anchor).
    pub fixed_cameras: Vec<usize>,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_iterations: 15,
            initial_damping: 1.0,
            damping_factor: 10.0,
            convergence_threshold: 1e-6,
            min_damping: 1e-7,
            max_damping: 1e10,
            max_retries: 10,
            gradient_tolerance: 1e-10,
            fixed_cameras: vec![0],
        }
    }
}

impl SolverConfig {
    /// Set the maximum number of iterations.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Set the initial damping.
    pub fn with_initial_damping(mut self, initial_damping: f64) -> Self {
        self.initial_damping = initial_damping;
        self
    }

    /// Set the damping factor.
    pub fn with_damping_factor(mut self, damping_factor: f64) -> Self {
        self.damping_factor = damping_factor;
        self
    }

    /// Set the convergence threshold.
    pub fn with_convergence_threshold(mut self, convergence_threshold: f64) -> Self {
        self.convergence_threshold = convergence_threshold;
        self
    }

    /// Set the damping bounds.
    pub fn with_damping_bounds(mut self, min_damping: f64, max_damping: f64) -> Self {
        self.min_damping = min_damping;
        self.max_damping = max_damping;
        self
    }

    /// Set the maximum number of consecutive rejected steps.
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the gradient tolerance.
    pub fn with_gradient_tolerance(mut self, gradient_tolerance: f64) -> Self {
        self.gradient_tolerance = gradient_tolerance;
        self
    }

    /// Set the cameras held constant during the refinement.
    pub fn with_fixed_cameras(mut self, fixed_cameras: Vec<usize>) -> Self {
        self.fixed_cameras = fixed_cameras;
        self
    }

    /// Check the configuration values.
    ///
    /// Camera indices are checked against the problem when the solver runs.
    pub fn validate(&self) -> Result<(), BundleAdjustmentError> {
        let invalid = |msg: String| Err(BundleAdjustmentError::InvalidConfiguration(msg));

        if self.max_iterations == 0 {
            return invalid("max_iterations must be positive".to_string());
        }
        if !(self.initial_damping > 0.0) || !self.initial_damping.is_finite() {
            return invalid(format!(
                "initial_damping must be positive, got {}",
                self.initial_damping
            ));
        }
        if !(self.damping_factor > 1.0) || !self.damping_factor.is_finite() {
            return invalid(format!(
                "damping_factor must be greater than 1, got {}",
                self.damping_factor
            ));
        }
        if !(self.convergence_threshold > 0.0) {
            return invalid(format!(
                "convergence_threshold must be positive, got {}",
                self.convergence_threshold
            ));
        }
        if !(self.min_damping > 0.0) {
            return invalid(format!(
                "min_damping must be positive, got {}",
                self.min_damping
            ));
        }
        if !(self.min_damping <= self.initial_damping && self.initial_damping <= self.max_damping)
        {
            return invalid(format!(
                "damping bounds must satisfy min <= initial <= max, got {} <= {} <= {}",
                self.min_damping, self.initial_damping, self.max_damping
            ));
        }
        if self.max_retries == 0 {
            return invalid("max_retries must be positive".to_string());
        }
        if !(self.gradient_tolerance >= 0.0) {
            return invalid(format!(
                "gradient_tolerance must be non-negative, got {}",
                self.gradient_tolerance
            ));
        }
        Ok(())
    }
}
