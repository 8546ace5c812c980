use super::schur::NormalEquations;
use super::solver::{
    BundleAdjustmentResult, SolverStatus, SparseLevenbergMarquardt, TerminationReason,
};
use super::{BundleAdjustmentError, SolverConfig};
use crate::problem::BundleProblem;

/// Cost below which the residuals are considered to vanish.
const COST_FLOOR: f64 = 1e-16;

/// Relative cost change indistinguishable from rounding error.
const COST_NOISE: f64 = 1e-12;

/// Snapshot of the solver after every step attempt, passed to the callback.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterationState {
    /// Outer iteration the attempt belongs to, starting at 1.
    pub iteration: usize,
    /// Cost before the attempt.
    pub cost: f64,
    /// Cost of the candidate state.
    pub candidate_cost: f64,
    /// Damping used for the attempt.
    pub damping: f64,
    /// Damping after the attempt.
    pub next_damping: f64,
    /// Whether the candidate was accepted.
    pub accepted: bool,
}

/// Drives the sparse Levenberg-Marquardt solver until convergence.
///
/// The adjuster keeps no state between runs: the same problem and configuration
/// always produce the same result.
///
/// # Example
///
/// ```
/// use kornia_sfm::bundle::{BundleAdjuster, SolverConfig};
/// use kornia_sfm::synthetic::{SyntheticConfig, SyntheticScene};
///
/// let scene = SyntheticScene::generate(&SyntheticConfig::default());
/// let problem = scene.perturbed_problem(0.01, 0.01, 0).unwrap();
///
/// let adjuster = BundleAdjuster::new(SolverConfig::default()).unwrap();
/// let result = adjuster.run(&problem).unwrap();
/// assert!(result.final_residual_norm <= result.initial_residual_norm);
/// ```
#[derive(Debug, Clone)]
pub struct BundleAdjuster {
    config: SolverConfig,
}

impl BundleAdjuster {
    /// Create an adjuster, validating the configuration.
    pub fn new(config: SolverConfig) -> Result<Self, BundleAdjustmentError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// The solver configuration.
    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Refine the cameras and points of the problem.
    pub fn run(
        &self,
        problem: &BundleProblem,
    ) -> Result<BundleAdjustmentResult, BundleAdjustmentError> {
        self.run_with_callback(problem, |_state| true)
    }

    /// Refine the cameras and points of the problem, reporting every step attempt.
    ///
    /// The callback may return `false` to stop the run; the current estimate is then
    /// returned with [`TerminationReason::Interrupted`].
    pub fn run_with_callback<F>(
        &self,
        problem: &BundleProblem,
        mut callback: F,
    ) -> Result<BundleAdjustmentResult, BundleAdjustmentError>
    where
        F: FnMut(&IterationState) -> bool,
    {
        let mut solver = SparseLevenbergMarquardt::new(problem, &self.config)?;
        let initial_residual_norm = solver.cost().sqrt();

        log::debug!(
            "bundle adjustment: {} cameras ({} free), {} points, {} observations, initial residual norm {:.6}",
            problem.num_cameras(),
            solver.layout().num_free(),
            problem.num_points(),
            problem.observations().len(),
            initial_residual_norm
        );

        let mut iterations = 0;
        let termination = loop {
            if solver.cost() < COST_FLOOR {
                break TerminationReason::CostConverged;
            }
            if iterations >= self.config.max_iterations {
                break TerminationReason::MaxIterations;
            }

            let normal = solver.linearize()?;
            let gradient_norm = normal.gradient_norm(solver.layout());
            if gradient_norm < self.config.gradient_tolerance {
                break TerminationReason::GradientConverged;
            }
            iterations += 1;

            if let Some(reason) =
                self.attempt_steps(&mut solver, &normal, iterations, gradient_norm, &mut callback)?
            {
                break reason;
            }
        };

        let status = match termination {
            TerminationReason::MaxIterations | TerminationReason::Interrupted => {
                SolverStatus::MaxIterationsReached
            }
            _ => SolverStatus::Converged,
        };

        let result = solver.finish(status, termination, iterations, initial_residual_norm);

        log::info!(
            "bundle adjustment finished after {} iterations ({:?}): residual norm {:.6} -> {:.6}",
            result.iterations,
            result.termination,
            result.initial_residual_norm,
            result.final_residual_norm
        );

        Ok(result)
    }

    /// Attempt damped steps with one linearization until a step is accepted.
    ///
    /// Returns the termination reason if the run ends during the attempts, `None` if a
    /// step was accepted and the run goes on.
    fn attempt_steps<F>(
        &self,
        solver: &mut SparseLevenbergMarquardt<'_>,
        normal: &NormalEquations,
        iteration: usize,
        gradient_norm: f64,
        callback: &mut F,
    ) -> Result<Option<TerminationReason>, BundleAdjustmentError>
    where
        F: FnMut(&IterationState) -> bool,
    {
        let mut retries = 0;
        let mut all_solves_failed = true;
        loop {
            let outcome = solver.step(normal)?;
            all_solves_failed &= outcome.solve_failed;

            log::debug!(
                "iteration {}: cost {:.6e} -> {:.6e}, lambda {:.1e}, |g| {:.3e}, |step| {:.3e}, {}",
                iteration,
                outcome.cost,
                outcome.candidate_cost,
                outcome.damping,
                gradient_norm,
                outcome.step_norm,
                if outcome.accepted { "accepted" } else { "rejected" }
            );

            let state = IterationState {
                iteration,
                cost: outcome.cost,
                candidate_cost: outcome.candidate_cost,
                damping: outcome.damping,
                next_damping: outcome.next_damping,
                accepted: outcome.accepted,
            };
            if !callback(&state) {
                return Ok(Some(TerminationReason::Interrupted));
            }

            if outcome.step_norm < SparseLevenbergMarquardt::STEP_TOLERANCE {
                return Ok(Some(TerminationReason::StepConverged));
            }
            if !outcome.accepted && outcome.relative_change() <= COST_NOISE {
                // the step no longer changes the cost measurably
                return Ok(Some(TerminationReason::StepConverged));
            }
            if outcome.accepted {
                if outcome.relative_change() < self.config.convergence_threshold {
                    return Ok(Some(TerminationReason::CostConverged));
                }
                return Ok(None);
            }

            retries += 1;
            if retries >= self.config.max_retries {
                let err = if all_solves_failed {
                    BundleAdjustmentError::RankDeficiency(format!(
                        "damped system not solvable in {retries} attempts at iteration {iteration}, last lambda {:e}",
                        outcome.damping
                    ))
                } else {
                    BundleAdjustmentError::DivergenceDetected(format!(
                        "{retries} consecutive rejected steps at iteration {iteration}"
                    ))
                };
                return Err(solver.fail(err));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::residual::linearize;
    use crate::synthetic::{SyntheticConfig, SyntheticScene};

    #[test]
    fn test_invalid_configuration() {
        let result = BundleAdjuster::new(SolverConfig::default().with_damping_factor(0.5));
        assert!(matches!(
            result,
            Err(BundleAdjustmentError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_fixed_camera_out_of_range() -> Result<(), BundleAdjustmentError> {
        let scene = SyntheticScene::generate(&SyntheticConfig {
            num_cameras: 3,
            num_points: 10,
            noise_std: 0.0,
            seed: 3,
        });
        let problem = scene.problem()?;
        let adjuster = BundleAdjuster::new(SolverConfig::default().with_fixed_cameras(vec![5]))?;
        assert!(matches!(
            adjuster.run(&problem),
            Err(BundleAdjustmentError::InvalidConfiguration(_))
        ));
        Ok(())
    }

    #[test]
    fn test_callback_interrupts() -> Result<(), BundleAdjustmentError> {
        let scene = SyntheticScene::generate(&SyntheticConfig {
            num_cameras: 4,
            num_points: 20,
            noise_std: 0.5,
            seed: 5,
        });
        let problem = scene.perturbed_problem(0.05, 0.05, 9)?;
        let adjuster = BundleAdjuster::new(SolverConfig::default())?;

        let mut calls = 0;
        let result = adjuster.run_with_callback(&problem, |_state| {
            calls += 1;
            false
        })?;
        assert_eq!(calls, 1);
        assert_eq!(result.termination, TerminationReason::Interrupted);
        assert_eq!(result.status, SolverStatus::MaxIterationsReached);
        assert_eq!(result.iterations, 1);
        Ok(())
    }

    #[test]
    fn test_max_iterations_is_not_an_error() -> Result<(), BundleAdjustmentError> {
        let scene = SyntheticScene::generate(&SyntheticConfig {
            num_cameras: 4,
            num_points: 20,
            noise_std: 1.0,
            seed: 2,
        });
        let problem = scene.perturbed_problem(0.1, 0.1, 4)?;
        let adjuster = BundleAdjuster::new(
            SolverConfig::default()
                .with_max_iterations(1)
                .with_convergence_threshold(1e-15),
        )?;
        let result = adjuster.run(&problem)?;
        assert_eq!(result.iterations, 1);
        assert_eq!(result.status, SolverStatus::MaxIterationsReached);
        assert_eq!(result.termination, TerminationReason::MaxIterations);
        assert!(result.final_residual_norm < result.initial_residual_norm);
        Ok(())
    }

    #[test]
    fn test_unsolvable_system_is_rank_deficient() -> Result<(), BundleAdjustmentError> {
        let scene = SyntheticScene::generate(&SyntheticConfig {
            num_cameras: 4,
            num_points: 20,
            noise_std: 0.5,
            seed: 5,
        });
        let problem = scene.perturbed_problem(0.02, 0.05, 7)?;
        let adjuster = BundleAdjuster::new(SolverConfig::default())?;
        let mut solver = SparseLevenbergMarquardt::new(&problem, adjuster.config())?;

        // a non-finite point block cannot be factorized at any damping
        let mut blocks = linearize(problem.cameras(), problem.points(), &problem)?;
        blocks[0].jac_point[0][0] = f64::NAN;
        let normal = NormalEquations::assemble(&problem, &blocks);

        let mut states: Vec<IterationState> = Vec::new();
        let mut record = |state: &IterationState| {
            states.push(*state);
            true
        };
        let result = adjuster.attempt_steps(&mut solver, &normal, 1, 1.0, &mut record);

        assert!(matches!(
            result,
            Err(BundleAdjustmentError::RankDeficiency(_))
        ));
        assert_eq!(states.len(), adjuster.config().max_retries);
        assert!(states
            .iter()
            .all(|s| !s.accepted && s.candidate_cost.is_infinite()));
        assert_eq!(solver.status(), SolverStatus::Failed);
        Ok(())
    }

    #[test]
    fn test_rejected_steps_never_converge() -> Result<(), BundleAdjustmentError> {
        let scene = SyntheticScene::generate(&SyntheticConfig {
            num_cameras: 4,
            num_points: 20,
            noise_std: 1.0,
            seed: 11,
        });
        let problem = scene.perturbed_problem(0.02, 0.05, 3)?;
        let threshold = 1e-1;
        let adjuster = BundleAdjuster::new(
            SolverConfig::default()
                .with_initial_damping(1e3)
                .with_convergence_threshold(threshold),
        )?;
        let mut solver = SparseLevenbergMarquardt::new(&problem, adjuster.config())?;

        // reversed residuals point every step uphill
        let mut blocks = linearize(problem.cameras(), problem.points(), &problem)?;
        for block in &mut blocks {
            block.residual = -block.residual;
        }
        let normal = NormalEquations::assemble(&problem, &blocks);

        let mut states: Vec<IterationState> = Vec::new();
        let mut record = |state: &IterationState| {
            states.push(*state);
            true
        };
        let result = adjuster.attempt_steps(&mut solver, &normal, 1, 1.0, &mut record);

        assert!(matches!(
            result,
            Err(BundleAdjustmentError::DivergenceDetected(_))
        ));
        assert!(states.iter().all(|s| !s.accepted));
        // small cost increases are still rejections, not convergence
        assert!(states
            .iter()
            .any(|s| (s.candidate_cost - s.cost) / s.cost < threshold));
        Ok(())
    }
}
