use super::SolverConfig;

/// Levenberg-Marquardt damping schedule.
///
/// The damping decreases after an accepted step, down to the lower bound, and increases
/// after a rejected step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DampingSchedule {
    lambda: f64,
    factor: f64,
    min: f64,
    max: f64,
}

impl DampingSchedule {
    /// Create the schedule described by the configuration.
    pub fn new(config: &SolverConfig) -> Self {
        Self {
            lambda: config.initial_damping,
            factor: config.damping_factor,
            min: config.min_damping,
            max: config.max_damping,
        }
    }

    /// Current damping.
    pub fn value(&self) -> f64 {
        self.lambda
    }

    /// Update the damping after an accepted step.
    pub fn accept(&mut self) {
        self.lambda = (self.lambda / self.factor).max(self.min);
    }

    /// Update the damping after a rejected step.
    ///
    /// Returns `false` once the damping exceeds its upper bound.
    pub fn reject(&mut self) -> bool {
        self.lambda *= self.factor;
        self.lambda <= self.max
    }
}
