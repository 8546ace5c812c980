#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]
//!
//! # Kornia SfM
//!
//! Multi-view geometry refinement: triangulation of 3D points from known cameras and
//! joint refinement of cameras and points with sparse bundle adjustment.
//!
//! ## Key Features
//!
//! - **Triangulation**: linear multi-view DLT with per-point conditioning and a
//!   reprojection quality report
//! - **Analytic Jacobians**: reprojection derivatives through pinhole and distorted
//!   camera models
//! - **Sparse Bundle Adjustment**: Levenberg-Marquardt with Schur complement point
//!   elimination
//!
//! ## Example: triangulate and refine
//!
//! ```rust
//! use kornia_sfm::bundle::{BundleAdjuster, SolverConfig};
//! use kornia_sfm::synthetic::{SyntheticConfig, SyntheticScene};
//! use kornia_sfm::{triangulate_points, BundleProblem, TriangulationParams};
//!
//! let scene = SyntheticScene::generate(&SyntheticConfig::default());
//!
//! let triangulation = triangulate_points(
//!     &scene.cameras,
//!     &scene.camera_model,
//!     &scene.observations,
//!     &TriangulationParams::default(),
//! )?;
//! println!(
//!     "mean reprojection error: {:.3} px",
//!     triangulation.quality.mean_reprojection_error
//! );
//!
//! let (problem, _) = BundleProblem::from_triangulation(
//!     scene.cameras.clone(),
//!     &scene.observations,
//!     scene.camera_model,
//!     &triangulation,
//! )?;
//!
//! let result = BundleAdjuster::new(SolverConfig::default())?.run(&problem)?;
//! println!(
//!     "residual norm: {:.3} -> {:.3}",
//!     result.initial_residual_norm, result.final_residual_norm
//! );
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

/// Sparse bundle adjustment.
pub mod bundle;

/// Camera projection models.
pub mod camera;

/// Small fixed-size linear algebra helpers.
pub mod linalg;

/// Camera poses.
pub mod pose;

/// Observations and the bundle adjustment problem.
pub mod problem;

/// Reprojection residuals and Jacobians.
pub mod residual;

/// Synthetic scenes.
pub mod synthetic;

/// Multi-view triangulation.
pub mod triangulation;

pub use bundle::{
    BundleAdjuster, BundleAdjustmentError, BundleAdjustmentResult, SolverConfig, SolverStatus,
    TerminationReason,
};
pub use camera::{CameraIntrinsic, CameraModel, PolynomialDistortion};
pub use pose::CameraPose;
pub use problem::{BundleProblem, Observation, ProblemError};
pub use residual::{ObservationBlock, ResidualError};
pub use triangulation::{
    compute_triangulation_quality, triangulate_point, triangulate_points,
    InsufficientObservationsPolicy, Triangulation, TriangulationError, TriangulationParams,
    TriangulationQuality,
};
