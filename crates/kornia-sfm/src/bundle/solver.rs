//! Sparse Levenberg-Marquardt solver.
//!
//! The solver owns a working copy of the cameras and points. One outer iteration
//! linearizes the problem once; the damped system is then solved, possibly several
//! times with increasing damping, until a step decreases the cost.

use glam::DVec3;

use super::damping::DampingSchedule;
use super::schur::{CameraLayout, NormalEquations, Step};
use super::{BundleAdjustmentError, SolverConfig};
use crate::pose::CameraPose;
use crate::problem::{BundleProblem, ProblemError};
use crate::residual::{linearize, total_cost};

/// Lifecycle of a solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverStatus {
    /// Created, no iteration performed yet.
    Init,
    /// Linearized at least once and still running.
    Iterating,
    /// A convergence criterion was met.
    Converged,
    /// The iteration budget ran out or the run was interrupted.
    MaxIterationsReached,
    /// The run aborted with an error.
    Failed,
}

/// Reason why the solver terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Converged: relative cost change below the threshold
    CostConverged,
    /// Converged: gradient norm below tolerance
    GradientConverged,
    /// Converged: the step vanished
    StepConverged,
    /// Maximum iterations reached
    MaxIterations,
    /// Stopped early by the user callback
    Interrupted,
}

/// Outcome of one damped step attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutcome {
    /// Cost before the step.
    pub cost: f64,
    /// Cost of the candidate state; infinite if the candidate is infeasible.
    pub candidate_cost: f64,
    /// Norm of the step; infinite if the damped system could not be solved.
    pub step_norm: f64,
    /// Damping used to compute the step.
    pub damping: f64,
    /// Damping after the update of the schedule.
    pub next_damping: f64,
    /// Whether the candidate replaced the current state.
    pub accepted: bool,
    /// Whether the damped system could not be factorized, no candidate was produced.
    pub solve_failed: bool,
}

impl StepOutcome {
    /// Relative change of the cost produced by the step.
    pub fn relative_change(&self) -> f64 {
        let change = (self.cost - self.candidate_cost).abs();
        if self.cost > 0.0 {
            change / self.cost
        } else {
            change
        }
    }
}

/// Output of a bundle adjustment run.
#[derive(Debug, Clone)]
pub struct BundleAdjustmentResult {
    /// Refined camera poses.
    pub cameras: Vec<CameraPose>,
    /// Refined points.
    pub points: Vec<DVec3>,
    /// Residual norm of the input state.
    pub initial_residual_norm: f64,
    /// Residual norm of the refined state.
    pub final_residual_norm: f64,
    /// Terminal status, either converged or out of iterations.
    pub status: SolverStatus,
    /// Reason why the solver terminated.
    pub termination: TerminationReason,
    /// Number of outer iterations performed.
    pub iterations: usize,
    /// Damping at termination.
    pub final_damping: f64,
}

impl BundleAdjustmentResult {
    /// Whether a convergence criterion was met.
    pub fn converged(&self) -> bool {
        self.status == SolverStatus::Converged
    }

    /// Publish the refined state as a new snapshot of `problem`.
    pub fn to_problem(&self, problem: &BundleProblem) -> Result<BundleProblem, ProblemError> {
        problem.with_state(self.cameras.clone(), self.points.clone())
    }
}

/// Levenberg-Marquardt solver over the block-sparse bundle adjustment problem.
pub struct SparseLevenbergMarquardt<'a> {
    problem: &'a BundleProblem,
    layout: CameraLayout,
    cameras: Vec<CameraPose>,
    points: Vec<DVec3>,
    cost: f64,
    damping: DampingSchedule,
    status: SolverStatus,
}

impl<'a> SparseLevenbergMarquardt<'a> {
    /// Steps with a norm below this threshold are considered zero.
    pub const STEP_TOLERANCE: f64 = 1e-12;

    /// Prepare a solver for the problem.
    ///
    /// Fails if a fixed camera does not exist, if the problem is structurally
    /// under-determined or if a point of the initial state is behind its camera.
    pub fn new(
        problem: &'a BundleProblem,
        config: &SolverConfig,
    ) -> Result<Self, BundleAdjustmentError> {
        let layout = CameraLayout::new(problem.num_cameras(), &config.fixed_cameras)?;
        check_structure(problem, &layout)?;

        let cost = total_cost(problem.cameras(), problem.points(), problem)?;

        Ok(Self {
            problem,
            layout,
            cameras: problem.cameras().to_vec(),
            points: problem.points().to_vec(),
            cost,
            damping: DampingSchedule::new(config),
            status: SolverStatus::Init,
        })
    }

    /// Current status.
    pub fn status(&self) -> SolverStatus {
        self.status
    }

    /// Cost of the current state.
    pub fn cost(&self) -> f64 {
        self.cost
    }

    /// Current damping.
    pub fn damping(&self) -> f64 {
        self.damping.value()
    }

    /// Current camera poses.
    pub fn cameras(&self) -> &[CameraPose] {
        &self.cameras
    }

    /// Current points.
    pub fn points(&self) -> &[DVec3] {
        &self.points
    }

    /// Free and fixed cameras.
    pub fn layout(&self) -> &CameraLayout {
        &self.layout
    }

    /// Linearize the problem around the current state and assemble the normal
    /// equations.
    pub fn linearize(&mut self) -> Result<NormalEquations, BundleAdjustmentError> {
        self.status = SolverStatus::Iterating;
        match linearize(&self.cameras, &self.points, self.problem) {
            Ok(blocks) => Ok(NormalEquations::assemble(self.problem, &blocks)),
            Err(err) => Err(self.fail(err.into())),
        }
    }

    /// Attempt one damped step with the given linearization.
    ///
    /// An improving candidate is accepted and the damping decreases; otherwise the
    /// state is kept and the damping increases. Fails once the damping exceeds its
    /// upper bound.
    pub fn step(&mut self, normal: &NormalEquations) -> Result<StepOutcome, BundleAdjustmentError> {
        let damping = self.damping.value();

        let (candidate, factorization_error) =
            match normal.solve(self.problem, &self.layout, damping) {
                Ok(step) => (Some(step), None),
                Err(BundleAdjustmentError::RankDeficiency(msg)) => {
                    log::debug!("damped system not solvable with lambda {damping:e}: {msg}");
                    (None, Some(msg))
                }
                Err(err) => return Err(self.fail(err)),
            };

        let (candidate_cost, step_norm, candidate_state) = match candidate {
            Some(step) => {
                let (cameras, points) = self.apply(&step);
                // a candidate that moves a point behind a camera is infeasible
                let candidate_cost =
                    total_cost(&cameras, &points, self.problem).unwrap_or(f64::INFINITY);
                (candidate_cost, step.norm(), Some((cameras, points)))
            }
            None => (f64::INFINITY, f64::INFINITY, None),
        };

        let cost = self.cost;
        let solve_failed = factorization_error.is_some();
        let accepted = candidate_cost < cost;
        match candidate_state {
            Some((cameras, points)) if accepted => {
                self.cameras = cameras;
                self.points = points;
                self.cost = candidate_cost;
                self.damping.accept();
            }
            _ => {
                if !self.damping.reject() {
                    let err = match factorization_error {
                        Some(msg) => BundleAdjustmentError::RankDeficiency(msg),
                        None => BundleAdjustmentError::DivergenceDetected(format!(
                            "damping exceeded its upper bound with cost {cost:e}"
                        )),
                    };
                    return Err(self.fail(err));
                }
            }
        }

        Ok(StepOutcome {
            cost,
            candidate_cost,
            step_norm,
            damping,
            next_damping: self.damping.value(),
            accepted,
            solve_failed,
        })
    }

    /// Mark the run as failed and hand the error back.
    pub(crate) fn fail(&mut self, err: BundleAdjustmentError) -> BundleAdjustmentError {
        self.status = SolverStatus::Failed;
        err
    }

    /// Finish the run with a terminal status.
    pub(crate) fn finish(
        mut self,
        status: SolverStatus,
        termination: TerminationReason,
        iterations: usize,
        initial_residual_norm: f64,
    ) -> BundleAdjustmentResult {
        self.status = status;
        BundleAdjustmentResult {
            initial_residual_norm,
            final_residual_norm: self.cost.sqrt(),
            final_damping: self.damping.value(),
            status,
            termination,
            iterations,
            cameras: self.cameras,
            points: self.points,
        }
    }

    fn apply(&self, step: &Step) -> (Vec<CameraPose>, Vec<DVec3>) {
        let cameras = self
            .cameras
            .iter()
            .zip(&step.cameras)
            .enumerate()
            .map(|(i, (pose, delta))| {
                if self.layout.is_fixed(i) {
                    *pose
                } else {
                    pose.retract(delta)
                }
            })
            .collect();
        let points = self
            .points
            .iter()
            .zip(&step.points)
            .map(|(x, dx)| *x + *dx)
            .collect();
        (cameras, points)
    }
}

/// Reject problems whose normal equations are singular by construction.
fn check_structure(
    problem: &BundleProblem,
    layout: &CameraLayout,
) -> Result<(), BundleAdjustmentError> {
    if problem.observations().is_empty() {
        return Err(BundleAdjustmentError::RankDeficiency(
            "the problem has no observations".to_string(),
        ));
    }

    for (j, num_cameras) in problem.point_camera_counts().into_iter().enumerate() {
        if num_cameras < 2 {
            return Err(BundleAdjustmentError::RankDeficiency(format!(
                "point {j} is observed by {num_cameras} camera(s), at least 2 are required"
            )));
        }
    }

    for (i, num_observations) in problem.camera_observation_counts().into_iter().enumerate() {
        if !layout.is_fixed(i) && num_observations < 3 {
            return Err(BundleAdjustmentError::RankDeficiency(format!(
                "camera {i} has {num_observations} observation(s), at least 3 are required"
            )));
        }
    }

    Ok(())
}
