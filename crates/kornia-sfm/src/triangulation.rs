//! Multi-view triangulation (spatial intersection).
//!
//! Every point is estimated independently from all the cameras observing it with the
//! linear DLT method: each observation contributes two rows to a homogeneous system
//! `A X = 0` whose solution is the right singular vector of the smallest singular
//! value. The estimate minimizes an algebraic error, not the reprojection error, and is
//! meant to initialize a bundle adjustment.

use glam::{DVec2, DVec3};
use rayon::prelude::*;
use thiserror::Error;

use crate::camera::{CameraModel, MIN_DEPTH};
use crate::pose::CameraPose;
use crate::problem::Observation;

/// Minimum number of distinct cameras needed to triangulate a point.
pub const MIN_TRIANGULATION_VIEWS: usize = 2;

/// Errors raised while triangulating a point.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TriangulationError {
    /// The point is observed by fewer than two distinct cameras.
    #[error("Point {point_index} is observed by {num_cameras} camera(s), at least 2 are required")]
    InsufficientObservations {
        /// Index of the point.
        point_index: usize,
        /// Number of distinct cameras observing the point.
        num_cameras: usize,
    },

    /// The homogeneous solution lies at infinity.
    #[error("Point {point_index} has a degenerate geometry (solution at infinity)")]
    DegenerateGeometry {
        /// Index of the point.
        point_index: usize,
    },

    /// The estimated point lies behind one of the observing cameras.
    #[error("Point {point_index} lies behind camera {camera_index}")]
    BehindCamera {
        /// Index of the point.
        point_index: usize,
        /// Index of the camera.
        camera_index: usize,
    },

    /// An observation references a camera that does not exist.
    #[error("Point {point_index} is observed by camera {camera_index}, which does not exist")]
    CameraIndexOutOfRange {
        /// Index of the point.
        point_index: usize,
        /// Camera index referenced by the observation.
        camera_index: usize,
    },
}

impl TriangulationError {
    /// Index of the point that failed.
    pub fn point_index(&self) -> usize {
        match self {
            TriangulationError::InsufficientObservations { point_index, .. }
            | TriangulationError::DegenerateGeometry { point_index }
            | TriangulationError::BehindCamera { point_index, .. }
            | TriangulationError::CameraIndexOutOfRange { point_index, .. } => *point_index,
        }
    }
}

/// What to do when a point cannot be triangulated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InsufficientObservationsPolicy {
    /// Record the failure and continue with the remaining points.
    #[default]
    Skip,
    /// Abort the whole triangulation on the first failure.
    Fail,
}

/// Parameters of the triangulation engine.
#[derive(Debug, Clone)]
pub struct TriangulationParams {
    /// Reprojection error (pixels) above which a point is flagged.
    pub max_reprojection_error: f64,
    /// Conditioning below which a point is flagged as ill-conditioned.
    pub min_conditioning: f64,
    /// Failure policy.
    pub policy: InsufficientObservationsPolicy,
}

impl Default for TriangulationParams {
    fn default() -> Self {
        Self {
            max_reprojection_error: 2.0,
            min_conditioning: 1e-6,
            policy: InsufficientObservationsPolicy::Skip,
        }
    }
}

impl TriangulationParams {
    /// Set the reprojection error threshold.
    pub fn with_max_reprojection_error(mut self, threshold: f64) -> Self {
        self.max_reprojection_error = threshold;
        self
    }

    /// Set the conditioning threshold.
    pub fn with_min_conditioning(mut self, min_conditioning: f64) -> Self {
        self.min_conditioning = min_conditioning;
        self
    }

    /// Set the failure policy.
    pub fn with_policy(mut self, policy: InsufficientObservationsPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// All the observations of one scene point.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointTrack {
    /// Index of the point.
    pub point_index: usize,
    /// Observing camera index and measured image point.
    pub views: Vec<(usize, DVec2)>,
}

impl PointTrack {
    /// Number of distinct cameras in the track.
    pub fn num_cameras(&self) -> usize {
        let mut cams: Vec<usize> = self.views.iter().map(|(c, _)| *c).collect();
        cams.sort_unstable();
        cams.dedup();
        cams.len()
    }
}

/// Group observations into one track per point index.
///
/// The output has one entry for every index up to the largest observed point index;
/// indices without observations yield empty tracks.
pub fn build_tracks(observations: &[Observation]) -> Vec<PointTrack> {
    let num_points = observations
        .iter()
        .map(|obs| obs.point_index + 1)
        .max()
        .unwrap_or(0);

    let mut tracks: Vec<PointTrack> = (0..num_points)
        .map(|point_index| PointTrack {
            point_index,
            views: Vec::new(),
        })
        .collect();

    for obs in observations {
        tracks[obs.point_index]
            .views
            .push((obs.camera_index, obs.image_point));
    }

    tracks
}

/// A triangulated point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriangulatedPoint {
    /// Estimated position in world coordinates.
    pub position: DVec3,
    /// Ratio between the second smallest and the largest singular value of the DLT
    /// system. Tends to zero as the viewing rays become parallel.
    pub conditioning: f64,
}

/// Quality metrics of a single triangulated point.
#[derive(Debug, Clone, PartialEq)]
pub struct PointQuality {
    /// Index of the point.
    pub point_index: usize,
    /// Mean reprojection error over the observing cameras (pixels).
    pub mean_error: f64,
    /// Maximum reprojection error over the observing cameras (pixels).
    pub max_error: f64,
    /// Conditioning of the DLT system.
    pub conditioning: f64,
    /// Whether `max_error` exceeds the configured threshold.
    pub exceeds_threshold: bool,
    /// Whether the conditioning is below the configured threshold.
    pub ill_conditioned: bool,
}

/// Summary of the triangulation quality.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TriangulationQuality {
    /// Mean reprojection error over all observations of the triangulated points.
    pub mean_reprojection_error: f64,
    /// Maximum reprojection error over all observations of the triangulated points.
    pub max_reprojection_error: f64,
    /// Worst conditioning among the triangulated points.
    pub min_conditioning: f64,
    /// Per-point metrics, for triangulated points only.
    pub points: Vec<PointQuality>,
}

impl TriangulationQuality {
    /// Number of points whose reprojection error exceeds the threshold.
    pub fn num_exceeding(&self) -> usize {
        self.points.iter().filter(|p| p.exceeds_threshold).count()
    }

    /// Number of ill-conditioned points.
    pub fn num_ill_conditioned(&self) -> usize {
        self.points.iter().filter(|p| p.ill_conditioned).count()
    }
}

/// Output of [`triangulate_points`].
#[derive(Debug, Clone)]
pub struct Triangulation {
    /// One entry per point index; `None` for the points that failed.
    pub points: Vec<Option<TriangulatedPoint>>,
    /// Per-point failures, ordered by point index.
    pub failures: Vec<TriangulationError>,
    /// Quality report of the triangulated points.
    pub quality: TriangulationQuality,
}

impl Triangulation {
    /// Number of successfully triangulated points.
    pub fn num_triangulated(&self) -> usize {
        self.points.iter().filter(|p| p.is_some()).count()
    }
}

/// Triangulate a single point from all the cameras observing it.
///
/// # Arguments
///
/// * `cameras` - Camera poses, indexed by camera index.
/// * `model` - Camera model used to normalize the image points.
/// * `track` - The observations of the point.
///
/// # Returns
///
/// The estimated point, or an error if the point has fewer than two observing cameras,
/// lies at infinity or behind one of the cameras.
pub fn triangulate_point(
    cameras: &[CameraPose],
    model: &CameraModel,
    track: &PointTrack,
) -> Result<TriangulatedPoint, TriangulationError> {
    let point_index = track.point_index;

    for (camera_index, _) in &track.views {
        if *camera_index >= cameras.len() {
            return Err(TriangulationError::CameraIndexOutOfRange {
                point_index,
                camera_index: *camera_index,
            });
        }
    }

    let num_cameras = track.num_cameras();
    if num_cameras < MIN_TRIANGULATION_VIEWS {
        return Err(TriangulationError::InsufficientObservations {
            point_index,
            num_cameras,
        });
    }

    let mut a = faer::Mat::<f64>::zeros(2 * track.views.len(), 4);
    for (k, (camera_index, pixel)) in track.views.iter().enumerate() {
        let p = cameras[*camera_index].projection_matrix();
        let xn = model.unproject(pixel);
        write_dlt_row(&mut a, 2 * k, xn.x, &p[2], &p[0]);
        write_dlt_row(&mut a, 2 * k + 1, xn.y, &p[2], &p[1]);
    }

    // solve A X = 0 and take the singular vector of the smallest singular value
    let svd = a.svd();
    let s = svd.s_diagonal();
    let conditioning = if s[0] > 0.0 { s[2] / s[0] } else { 0.0 };

    let xh = svd.v().col(3);
    let w = xh[3];
    if w.abs() < 1e-12 {
        return Err(TriangulationError::DegenerateGeometry { point_index });
    }
    let position = DVec3::new(xh[0] / w, xh[1] / w, xh[2] / w);
    if !position.is_finite() {
        return Err(TriangulationError::DegenerateGeometry { point_index });
    }

    for (camera_index, _) in &track.views {
        if cameras[*camera_index].transform_point(&position).z <= MIN_DEPTH {
            return Err(TriangulationError::BehindCamera {
                point_index,
                camera_index: *camera_index,
            });
        }
    }

    Ok(TriangulatedPoint {
        position,
        conditioning,
    })
}

/// Write one normalized DLT row `x * p3 - p1`.
fn write_dlt_row(a: &mut faer::Mat<f64>, row: usize, x: f64, p3: &[f64; 4], p1: &[f64; 4]) {
    let mut coeffs = [0.0; 4];
    for j in 0..4 {
        coeffs[j] = x * p3[j] - p1[j];
    }
    let norm = coeffs.iter().map(|c| c * c).sum::<f64>().sqrt();
    let scale = if norm > 0.0 { 1.0 / norm } else { 1.0 };
    for (j, c) in coeffs.iter().enumerate() {
        a.write(row, j, c * scale);
    }
}

/// Triangulate all the points referenced by the observations.
///
/// The points are processed independently and in parallel. Failures are recorded in
/// [`Triangulation::failures`], unless the policy is
/// [`InsufficientObservationsPolicy::Fail`], in which case the first failure (by point
/// index) is returned.
///
/// # Arguments
///
/// * `cameras` - Camera poses, indexed by camera index.
/// * `model` - Camera model shared by all the cameras.
/// * `observations` - All the observations; point indices define the output indices.
/// * `params` - Triangulation parameters.
pub fn triangulate_points(
    cameras: &[CameraPose],
    model: &CameraModel,
    observations: &[Observation],
    params: &TriangulationParams,
) -> Result<Triangulation, TriangulationError> {
    let tracks = build_tracks(observations);

    let results: Vec<Result<TriangulatedPoint, TriangulationError>> = tracks
        .par_iter()
        .map(|track| triangulate_point(cameras, model, track))
        .collect();

    let mut points = Vec::with_capacity(results.len());
    let mut failures = Vec::new();
    for result in results {
        match result {
            Ok(point) => points.push(Some(point)),
            Err(err) => {
                if params.policy == InsufficientObservationsPolicy::Fail {
                    return Err(err);
                }
                log::debug!("skipping point: {}", err);
                points.push(None);
                failures.push(err);
            }
        }
    }

    if !failures.is_empty() {
        log::warn!(
            "{} of {} points could not be triangulated",
            failures.len(),
            points.len()
        );
    }

    let quality = quality_from_tracks(cameras, model, &tracks, &points, params);

    log::debug!(
        "triangulated {} points, mean reprojection error {:.4} px, max {:.4} px",
        points.len() - failures.len(),
        quality.mean_reprojection_error,
        quality.max_reprojection_error
    );

    Ok(Triangulation {
        points,
        failures,
        quality,
    })
}

/// Compute the reprojection quality of a set of triangulated points.
///
/// # Arguments
///
/// * `cameras` - Camera poses, indexed by camera index.
/// * `model` - Camera model shared by all the cameras.
/// * `observations` - The observations used for the triangulation.
/// * `points` - One optional point per point index, as in [`Triangulation::points`].
/// * `params` - Thresholds used to flag points.
pub fn compute_triangulation_quality(
    cameras: &[CameraPose],
    model: &CameraModel,
    observations: &[Observation],
    points: &[Option<TriangulatedPoint>],
    params: &TriangulationParams,
) -> TriangulationQuality {
    let tracks = build_tracks(observations);
    quality_from_tracks(cameras, model, &tracks, points, params)
}

fn quality_from_tracks(
    cameras: &[CameraPose],
    model: &CameraModel,
    tracks: &[PointTrack],
    points: &[Option<TriangulatedPoint>],
    params: &TriangulationParams,
) -> TriangulationQuality {
    let per_point: Vec<(PointQuality, f64, usize)> = tracks
        .par_iter()
        .filter_map(|track| {
            let point = points.get(track.point_index).copied().flatten()?;
            let errors: Vec<f64> = track
                .views
                .iter()
                .map(|(camera_index, pixel)| {
                    cameras
                        .get(*camera_index)
                        .map(|pose| pose.transform_point(&point.position))
                        .and_then(|p_cam| model.project(&p_cam))
                        .map_or(f64::INFINITY, |uv| (uv - *pixel).length())
                })
                .collect();
            if errors.is_empty() {
                return None;
            }
            let sum = errors.iter().sum::<f64>();
            let max_error = errors.iter().copied().fold(0.0, f64::max);
            let quality = PointQuality {
                point_index: track.point_index,
                mean_error: sum / errors.len() as f64,
                max_error,
                conditioning: point.conditioning,
                exceeds_threshold: max_error > params.max_reprojection_error,
                ill_conditioned: point.conditioning < params.min_conditioning,
            };
            Some((quality, sum, errors.len()))
        })
        .collect();

    if per_point.is_empty() {
        return TriangulationQuality::default();
    }

    let (sum, count) = per_point
        .iter()
        .fold((0.0, 0usize), |(s, c), (_, ps, pc)| (s + ps, c + pc));
    let max_reprojection_error = per_point
        .iter()
        .map(|(q, _, _)| q.max_error)
        .fold(0.0, f64::max);
    let min_conditioning = per_point
        .iter()
        .map(|(q, _, _)| q.conditioning)
        .fold(f64::INFINITY, f64::min);

    TriangulationQuality {
        mean_reprojection_error: sum / count as f64,
        max_reprojection_error,
        min_conditioning,
        points: per_point.into_iter().map(|(q, _, _)| q).collect(),
    }
}
