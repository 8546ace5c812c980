//! Sparse bundle adjustment.
//!
//! Jointly refines camera poses and 3D points by minimizing the sum of squared
//! reprojection errors with a Levenberg-Marquardt solver. The point blocks of the damped
//! normal equations are eliminated with a Schur complement, so only the reduced camera
//! system is factorized densely.

mod config;
mod controller;
mod damping;
mod schur;
mod solver;

use thiserror::Error;

use crate::problem::ProblemError;
use crate::residual::ResidualError;

pub use config::SolverConfig;
pub use controller::{BundleAdjuster, IterationState};
pub use damping::DampingSchedule;
pub use schur::{CameraLayout, NormalEquations, Step};
pub use solver::{
    BundleAdjustmentResult, SolverStatus, SparseLevenbergMarquardt, StepOutcome,
    TerminationReason,
};

/// Errors that can occur during bundle adjustment.
#[derive(Debug, Error)]
pub enum BundleAdjustmentError {
    /// The solver configuration is invalid.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The problem is under-determined or a factorization failed.
    #[error("Rank deficiency: {0}")]
    RankDeficiency(String),

    /// The damping could not produce an accepted step.
    #[error("Divergence detected: {0}")]
    DivergenceDetected(String),

    /// Problem-related error
    #[error("Problem error: {0}")]
    Problem(#[from] ProblemError),

    /// Residual evaluation failed
    #[error("Residual evaluation failed: {0}")]
    Residual(#[from] ResidualError),
}
