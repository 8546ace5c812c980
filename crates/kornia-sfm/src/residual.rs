//! Reprojection residuals and their analytic Jacobians.
//!
//! The residual of an observation is `predicted - observed` in pixels. The camera
//! Jacobian is taken with respect to the local pose update `[omega, delta_t]` used by
//! [`CameraPose::retract`], the point Jacobian with respect to the world coordinates.

use glam::{DMat3, DVec2, DVec3};
use rayon::prelude::*;
use thiserror::Error;

use crate::linalg::skew;
use crate::pose::CameraPose;
use crate::problem::BundleProblem;

/// Errors raised while evaluating residuals.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResidualError {
    /// The observed point is not in front of its camera, the projection is undefined.
    #[error("Observation {observation} projects a point that is behind its camera")]
    PointBehindCamera {
        /// Index of the offending observation.
        observation: usize,
    },

    /// The evaluated state does not have the dimensions of the problem.
    #[error("State has {cameras} cameras and {points} points, the problem has {expected_cameras} and {expected_points}")]
    StateMismatch {
        /// Number of cameras of the problem.
        expected_cameras: usize,
        /// Number of points of the problem.
        expected_points: usize,
        /// Number of cameras provided.
        cameras: usize,
        /// Number of points provided.
        points: usize,
    },
}

/// Linearization of a single observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObservationBlock {
    /// Residual `predicted - observed` in pixels.
    pub residual: DVec2,
    /// 2x6 Jacobian (row-major) with respect to the camera update `[omega, delta_t]`.
    pub jac_camera: [[f64; 6]; 2],
    /// 2x3 Jacobian (row-major) with respect to the point.
    pub jac_point: [[f64; 3]; 2],
}

/// Compute the residuals of every observation of the problem for the given state.
///
/// The state is passed separately from the problem so candidate states can be
/// evaluated without publishing a new snapshot.
pub fn evaluate_residuals(
    cameras: &[CameraPose],
    points: &[DVec3],
    problem: &BundleProblem,
) -> Result<Vec<DVec2>, ResidualError> {
    check_dimensions(cameras, points, problem)?;
    let model = problem.camera_model();
    problem
        .observations()
        .par_iter()
        .enumerate()
        .map(|(i, obs)| -> Result<DVec2, ResidualError> {
            let p_cam = cameras[obs.camera_index].transform_point(&points[obs.point_index]);
            let predicted = model
                .project(&p_cam)
                .ok_or(ResidualError::PointBehindCamera { observation: i })?;
            Ok(predicted - obs.image_point)
        })
        .collect()
}

/// Sum of the squared residuals.
pub fn total_cost(
    cameras: &[CameraPose],
    points: &[DVec3],
    problem: &BundleProblem,
) -> Result<f64, ResidualError> {
    let residuals = evaluate_residuals(cameras, points, problem)?;
    Ok(residuals.iter().map(|r| r.length_squared()).sum())
}

/// Euclidean norm of the stacked residual vector.
pub fn residual_norm(
    cameras: &[CameraPose],
    points: &[DVec3],
    problem: &BundleProblem,
) -> Result<f64, ResidualError> {
    Ok(total_cost(cameras, points, problem)?.sqrt())
}

/// Mean reprojection error in pixels over all the observations.
pub fn mean_reprojection_error(
    cameras: &[CameraPose],
    points: &[DVec3],
    problem: &BundleProblem,
) -> Result<f64, ResidualError> {
    let residuals = evaluate_residuals(cameras, points, problem)?;
    if residuals.is_empty() {
        return Ok(0.0);
    }
    let sum = residuals.iter().map(|r| r.length()).sum::<f64>();
    Ok(sum / residuals.len() as f64)
}

/// Linearize every observation of the problem around the given state.
///
/// Returns one block per observation, in observation order.
pub fn linearize(
    cameras: &[CameraPose],
    points: &[DVec3],
    problem: &BundleProblem,
) -> Result<Vec<ObservationBlock>, ResidualError> {
    check_dimensions(cameras, points, problem)?;
    let model = problem.camera_model();
    problem
        .observations()
        .par_iter()
        .enumerate()
        .map(|(i, obs)| -> Result<ObservationBlock, ResidualError> {
            let pose = &cameras[obs.camera_index];
            let rotated = pose.rotation * points[obs.point_index];
            let p_cam = rotated + pose.translation;

            let (predicted, jac_proj) = model
                .project_with_jacobian(&p_cam)
                .ok_or(ResidualError::PointBehindCamera { observation: i })?;

            // d(p_cam)/d(omega) = -[R X]x, d(p_cam)/d(delta_t) = I, d(p_cam)/d(X) = R
            let d_omega = mul_2x3_3x3(&jac_proj, &(-skew(&rotated)));
            let d_point = mul_2x3_3x3(&jac_proj, &pose.rotation);

            let mut jac_camera = [[0.0; 6]; 2];
            for r in 0..2 {
                jac_camera[r][..3].copy_from_slice(&d_omega[r]);
                jac_camera[r][3..].copy_from_slice(&jac_proj[r]);
            }

            Ok(ObservationBlock {
                residual: predicted - obs.image_point,
                jac_camera,
                jac_point: d_point,
            })
        })
        .collect()
}

fn check_dimensions(
    cameras: &[CameraPose],
    points: &[DVec3],
    problem: &BundleProblem,
) -> Result<(), ResidualError> {
    if cameras.len() != problem.num_cameras() || points.len() != problem.num_points() {
        return Err(ResidualError::StateMismatch {
            expected_cameras: problem.num_cameras(),
            expected_points: problem.num_points(),
            cameras: cameras.len(),
            points: points.len(),
        });
    }
    Ok(())
}

fn mul_2x3_3x3(a: &[[f64; 3]; 2], m: &DMat3) -> [[f64; 3]; 2] {
    let mut out = [[0.0; 3]; 2];
    for (r, row) in out.iter_mut().enumerate() {
        for (c, val) in row.iter_mut().enumerate() {
            let col = m.col(c);
            *val = a[r][0] * col.x + a[r][1] * col.y + a[r][2] * col.z;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraIntrinsic, CameraModel, PolynomialDistortion};
    use crate::problem::{BundleProblem, Observation};
    use approx::assert_relative_eq;

    fn distorted_problem() -> BundleProblem {
        let model = CameraModel::PinholeDistorted {
            intrinsic: CameraIntrinsic::new(600.0, 610.0, 320.0, 240.0),
            distortion: PolynomialDistortion {
                k1: -0.12,
                k2: 0.03,
                p1: 0.001,
                p2: -0.002,
                ..Default::default()
            },
        };
        let cameras = vec![
            CameraPose::look_at(DVec3::new(0.0, -5.0, 0.5), DVec3::ZERO, DVec3::Z),
            CameraPose::look_at(DVec3::new(3.0, -4.0, -0.5), DVec3::ZERO, DVec3::Z),
        ];
        let points = vec![DVec3::new(0.2, 0.1, -0.3), DVec3::new(-0.4, 0.6, 0.5)];
        let observations = vec![
            Observation::new(0, 0, DVec2::new(300.0, 250.0)),
            Observation::new(1, 0, DVec2::new(330.0, 260.0)),
            Observation::new(0, 1, DVec2::new(280.0, 200.0)),
            Observation::new(1, 1, DVec2::new(350.0, 190.0)),
        ];
        BundleProblem::new(cameras, points, observations, model).unwrap()
    }

    #[test]
    fn test_residuals_vanish_at_exact_projection() -> Result<(), ResidualError> {
        let problem = distorted_problem();
        let model = problem.camera_model();
        let observations = problem
            .observations()
            .iter()
            .map(|obs| {
                let p_cam = problem.cameras()[obs.camera_index]
                    .transform_point(&problem.points()[obs.point_index]);
                Observation::new(obs.camera_index, obs.point_index, model.project(&p_cam).unwrap())
            })
            .collect();
        let exact = BundleProblem::new(
            problem.cameras().to_vec(),
            problem.points().to_vec(),
            observations,
            *model,
        )
        .unwrap();

        let cost = total_cost(exact.cameras(), exact.points(), &exact)?;
        assert_relative_eq!(cost, 0.0, epsilon = 1e-18);
        assert_relative_eq!(
            mean_reprojection_error(exact.cameras(), exact.points(), &exact)?,
            0.0,
            epsilon = 1e-9
        );

        let cost = total_cost(problem.cameras(), problem.points(), &problem)?;
        let norm = residual_norm(problem.cameras(), problem.points(), &problem)?;
        assert_relative_eq!(norm * norm, cost, max_relative = 1e-12);
        Ok(())
    }

    #[test]
    fn test_jacobians_match_finite_differences() -> Result<(), ResidualError> {
        let problem = distorted_problem();
        let cameras = problem.cameras();
        let points = problem.points();
        let blocks = linearize(cameras, points, &problem)?;
        let residuals = evaluate_residuals(cameras, points, &problem)?;
        assert_eq!(blocks.len(), residuals.len());

        let eps = 1e-6;
        for (i, obs) in problem.observations().iter().enumerate() {
            assert_eq!(blocks[i].residual, residuals[i]);

            for k in 0..6 {
                let mut delta = [0.0; 6];
                delta[k] = eps;
                let plus = cameras[obs.camera_index].retract(&delta);
                delta[k] = -eps;
                let minus = cameras[obs.camera_index].retract(&delta);

                let mut cams_plus = cameras.to_vec();
                cams_plus[obs.camera_index] = plus;
                let mut cams_minus = cameras.to_vec();
                cams_minus[obs.camera_index] = minus;

                let r_plus = evaluate_residuals(&cams_plus, points, &problem)?[i];
                let r_minus = evaluate_residuals(&cams_minus, points, &problem)?[i];
                let fd = (r_plus - r_minus) / (2.0 * eps);

                assert_relative_eq!(blocks[i].jac_camera[0][k], fd.x, epsilon = 1e-3);
                assert_relative_eq!(blocks[i].jac_camera[1][k], fd.y, epsilon = 1e-3);
            }

            for k in 0..3 {
                let mut pts_plus = points.to_vec();
                pts_plus[obs.point_index][k] += eps;
                let mut pts_minus = points.to_vec();
                pts_minus[obs.point_index][k] -= eps;

                let r_plus = evaluate_residuals(cameras, &pts_plus, &problem)?[i];
                let r_minus = evaluate_residuals(cameras, &pts_minus, &problem)?[i];
                let fd = (r_plus - r_minus) / (2.0 * eps);

                assert_relative_eq!(blocks[i].jac_point[0][k], fd.x, epsilon = 1e-3);
                assert_relative_eq!(blocks[i].jac_point[1][k], fd.y, epsilon = 1e-3);
            }
        }
        Ok(())
    }

    #[test]
    fn test_point_behind_camera() {
        let problem = distorted_problem();
        let mut points = problem.points().to_vec();
        // behind the first camera, which sits at y = -5 looking along +y
        points[1] = DVec3::new(0.0, -10.0, 0.0);

        let err = linearize(problem.cameras(), &points, &problem).unwrap_err();
        assert!(matches!(
            err,
            ResidualError::PointBehindCamera { observation: 2 | 3 }
        ));
        assert!(total_cost(problem.cameras(), &points, &problem).is_err());
    }

    #[test]
    fn test_state_dimensions_are_checked() {
        let problem = distorted_problem();
        let points = &problem.points()[..1];

        let err = evaluate_residuals(problem.cameras(), points, &problem).unwrap_err();
        assert_eq!(
            err,
            ResidualError::StateMismatch {
                expected_cameras: 2,
                expected_points: 2,
                cameras: 2,
                points: 1
            }
        );
        assert!(linearize(&problem.cameras()[..1], problem.points(), &problem).is_err());
        assert!(mean_reprojection_error(problem.cameras(), points, &problem).is_err());
    }
}
