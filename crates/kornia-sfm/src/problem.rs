//! Bundle problem aggregate: cameras, points, observations and the camera model.

use glam::{DVec2, DVec3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::camera::CameraModel;
use crate::pose::CameraPose;
use crate::triangulation::Triangulation;

/// Errors raised when assembling a bundle problem.
#[derive(Debug, Error, PartialEq)]
pub enum ProblemError {
    /// An observation references a camera that does not exist.
    #[error("Observation {observation} references camera {camera_index}, but only {num_cameras} cameras exist")]
    CameraIndexOutOfRange {
        /// Index of the offending observation.
        observation: usize,
        /// Camera index referenced by the observation.
        camera_index: usize,
        /// Number of cameras in the problem.
        num_cameras: usize,
    },

    /// An observation references a point that does not exist.
    #[error("Observation {observation} references point {point_index}, but only {num_points} points exist")]
    PointIndexOutOfRange {
        /// Index of the offending observation.
        observation: usize,
        /// Point index referenced by the observation.
        point_index: usize,
        /// Number of points in the problem.
        num_points: usize,
    },

    /// An observation carries a non-finite image point.
    #[error("Observation {observation} has a non-finite image point")]
    NonFiniteObservation {
        /// Index of the offending observation.
        observation: usize,
    },

    /// A camera pose or a point of the state is not finite.
    #[error("The state has a non-finite {kind} at index {index}")]
    NonFiniteState {
        /// Either `"camera"` or `"point"`.
        kind: &'static str,
        /// Index of the offending camera or point.
        index: usize,
    },

    /// Replacement state does not match the problem dimensions.
    #[error("State mismatch: expected {expected_cameras} cameras and {expected_points} points, got {cameras} and {points}")]
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

/// A 2D measurement of a scene point in one camera.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Index of the observing camera.
    pub camera_index: usize,
    /// Index of the observed point.
    pub point_index: usize,
    /// Measured image point in pixels.
    pub image_point: DVec2,
}

impl Observation {
    /// Create a new observation.
    pub fn new(camera_index: usize, point_index: usize, image_point: DVec2) -> Self {
        Self {
            camera_index,
            point_index,
            image_point,
        }
    }
}

/// A bundle adjustment problem.
///
/// The problem is immutable once assembled; refined states are published as new
/// snapshots with [`BundleProblem::with_state`].
#[derive(Debug, Clone)]
pub struct BundleProblem {
    cameras: Vec<CameraPose>,
    points: Vec<DVec3>,
    observations: Vec<Observation>,
    camera_model: CameraModel,
    point_observations: Vec<Vec<usize>>,
}

impl BundleProblem {
    /// Assemble a problem, checking that the state is finite and that every observation
    /// references a valid camera and point.
    pub fn new(
        cameras: Vec<CameraPose>,
        points: Vec<DVec3>,
        observations: Vec<Observation>,
        camera_model: CameraModel,
    ) -> Result<Self, ProblemError> {
        check_finite_state(&cameras, &points)?;
        for (i, obs) in observations.iter().enumerate() {
            if obs.camera_index >= cameras.len() {
                return Err(ProblemError::CameraIndexOutOfRange {
                    observation: i,
                    camera_index: obs.camera_index,
                    num_cameras: cameras.len(),
                });
            }
            if obs.point_index >= points.len() {
                return Err(ProblemError::PointIndexOutOfRange {
                    observation: i,
                    point_index: obs.point_index,
                    num_points: points.len(),
                });
            }
            if !obs.image_point.is_finite() {
                return Err(ProblemError::NonFiniteObservation { observation: i });
            }
        }

        let point_observations = group_by_point(&observations, points.len());

        Ok(Self {
            cameras,
            points,
            observations,
            camera_model,
            point_observations,
        })
    }

    /// Assemble a problem from the output of the triangulation engine.
    ///
    /// Points that could not be triangulated are dropped together with their
    /// observations; the remaining points are re-indexed densely. Returns the problem
    /// and, for every point of the problem, the index it had in the input observations.
    pub fn from_triangulation(
        cameras: Vec<CameraPose>,
        observations: &[Observation],
        camera_model: CameraModel,
        triangulation: &Triangulation,
    ) -> Result<(Self, Vec<usize>), ProblemError> {
        let mut remap = vec![None; triangulation.points.len()];
        let mut points = Vec::new();
        let mut original_indices = Vec::new();
        for (i, point) in triangulation.points.iter().enumerate() {
            if let Some(point) = point {
                remap[i] = Some(points.len());
                points.push(point.position);
                original_indices.push(i);
            }
        }

        let observations = observations
            .iter()
            .filter_map(|obs| {
                let new_index = remap.get(obs.point_index).copied().flatten()?;
                Some(Observation::new(obs.camera_index, new_index, obs.image_point))
            })
            .collect();

        let problem = Self::new(cameras, points, observations, camera_model)?;
        Ok((problem, original_indices))
    }

    /// Publish a new snapshot of the problem with replaced cameras and points.
    pub fn with_state(
        &self,
        cameras: Vec<CameraPose>,
        points: Vec<DVec3>,
    ) -> Result<Self, ProblemError> {
        if cameras.len() != self.cameras.len() || points.len() != self.points.len() {
            return Err(ProblemError::StateMismatch {
                expected_cameras: self.cameras.len(),
                expected_points: self.points.len(),
                cameras: cameras.len(),
                points: points.len(),
            });
        }
        check_finite_state(&cameras, &points)?;
        Ok(Self {
            cameras,
            points,
            observations: self.observations.clone(),
            camera_model: self.camera_model,
            point_observations: self.point_observations.clone(),
        })
    }

    /// The camera poses.
    pub fn cameras(&self) -> &[CameraPose] {
        &self.cameras
    }

    /// The 3D points.
    pub fn points(&self) -> &[DVec3] {
        &self.points
    }

    /// The observations.
    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    /// The camera model shared by all observations.
    pub fn camera_model(&self) -> &CameraModel {
        &self.camera_model
    }

    /// Number of cameras.
    pub fn num_cameras(&self) -> usize {
        self.cameras.len()
    }

    /// Number of points.
    pub fn num_points(&self) -> usize {
        self.points.len()
    }

    /// Indices of the observations of every point, indexed by point.
    pub fn point_observations(&self) -> &[Vec<usize>] {
        &self.point_observations
    }

    /// Number of observations made by each camera.
    pub fn camera_observation_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.cameras.len()];
        for obs in &self.observations {
            counts[obs.camera_index] += 1;
        }
        counts
    }

    /// Number of distinct cameras observing each point.
    pub fn point_camera_counts(&self) -> Vec<usize> {
        self.point_observations
            .iter()
            .map(|obs_ids| {
                let mut cams: Vec<usize> = obs_ids
                    .iter()
                    .map(|&o| self.observations[o].camera_index)
                    .collect();
                cams.sort_unstable();
                cams.dedup();
                cams.len()
            })
            .collect()
    }
}

fn check_finite_state(cameras: &[CameraPose], points: &[DVec3]) -> Result<(), ProblemError> {
    if let Some(index) = cameras.iter().position(|pose| !pose.is_finite()) {
        return Err(ProblemError::NonFiniteState {
            kind: "camera",
            index,
        });
    }
    if let Some(index) = points.iter().position(|x| !x.is_finite()) {
        return Err(ProblemError::NonFiniteState {
            kind: "point",
            index,
        });
    }
    Ok(())
}

fn group_by_point(observations: &[Observation], num_points: usize) -> Vec<Vec<usize>> {
    let mut grouped = vec![Vec::new(); num_points];
    for (i, obs) in observations.iter().enumerate() {
        grouped[obs.point_index].push(i);
    }
    grouped
}
