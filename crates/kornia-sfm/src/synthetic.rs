//! Seeded synthetic scenes for tests, benchmarks and demos.
//!
//! Cameras are placed on an arc around the origin, all looking at it, and the points
//! are drawn uniformly from a cube centered at the origin. Every point is observed by
//! every camera with optional Gaussian pixel noise.

use glam::{DVec2, DVec3};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::camera::CameraModel;
use crate::pose::CameraPose;
use crate::problem::{BundleProblem, Observation, ProblemError};

/// Distance of the cameras to the origin.
const CAMERA_DISTANCE: f64 = 8.0;
/// Half extent of the cube the points are drawn from.
const POINT_EXTENT: f64 = 1.5;

/// Parameters of a synthetic scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    /// Number of cameras.
    pub num_cameras: usize,
    /// Number of points.
    pub num_points: usize,
    /// Standard deviation of the pixel noise added to the observations.
    pub noise_std: f64,
    /// Seed of the random generator.
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            num_cameras: 5,
            num_points: 50,
            noise_std: 1.0,
            seed: 42,
        }
    }
}

/// A synthetic scene with its ground truth.
#[derive(Debug, Clone)]
pub struct SyntheticScene {
    /// Ground truth camera poses.
    pub cameras: Vec<CameraPose>,
    /// Ground truth points.
    pub points: Vec<DVec3>,
    /// Noisy observations, grouped by point.
    pub observations: Vec<Observation>,
    /// Camera model shared by all the cameras.
    pub camera_model: CameraModel,
}

impl SyntheticScene {
    /// Generate a scene. The same configuration always produces the same scene.
    pub fn generate(config: &SyntheticConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let camera_model = CameraModel::pinhole(800.0, 800.0, 320.0, 240.0);

        let cameras = (0..config.num_cameras)
            .map(|i| {
                let angle = if config.num_cameras > 1 {
                    -std::f64::consts::FRAC_PI_4
                        + std::f64::consts::FRAC_PI_2 * i as f64 / (config.num_cameras - 1) as f64
                } else {
                    0.0
                };
                let height = ((i % 3) as f64 - 1.0) * 0.5;
                let center = DVec3::new(
                    CAMERA_DISTANCE * angle.sin(),
                    -CAMERA_DISTANCE * angle.cos(),
                    height,
                );
                CameraPose::look_at(center, DVec3::ZERO, DVec3::Z)
            })
            .collect::<Vec<_>>();

        let points = (0..config.num_points)
            .map(|_| {
                DVec3::new(
                    rng.random_range(-POINT_EXTENT..POINT_EXTENT),
                    rng.random_range(-POINT_EXTENT..POINT_EXTENT),
                    rng.random_range(-POINT_EXTENT..POINT_EXTENT),
                )
            })
            .collect::<Vec<_>>();

        let mut observations = Vec::with_capacity(config.num_cameras * config.num_points);
        for (p, point) in points.iter().enumerate() {
            for (c, pose) in cameras.iter().enumerate() {
                let Some(uv) = camera_model.project(&pose.transform_point(point)) else {
                    continue;
                };
                let noise = DVec2::new(gaussian(&mut rng), gaussian(&mut rng)) * config.noise_std;
                observations.push(Observation::new(c, p, uv + noise));
            }
        }

        Self {
            cameras,
            points,
            observations,
            camera_model,
        }
    }

    /// The problem with the ground truth state as initial estimate.
    pub fn problem(&self) -> Result<BundleProblem, ProblemError> {
        BundleProblem::new(
            self.cameras.clone(),
            self.points.clone(),
            self.observations.clone(),
            self.camera_model,
        )
    }

    /// The problem with a perturbed initial estimate.
    ///
    /// Every camera but the first is moved by a random local update with standard
    /// deviation `camera_noise` on each component; every point by a random offset with
    /// standard deviation `point_noise` on each coordinate.
    pub fn perturbed_problem(
        &self,
        camera_noise: f64,
        point_noise: f64,
        seed: u64,
    ) -> Result<BundleProblem, ProblemError> {
        let mut rng = StdRng::seed_from_u64(seed);

        let cameras = self
            .cameras
            .iter()
            .enumerate()
            .map(|(i, pose)| {
                if i == 0 {
                    return *pose;
                }
                let mut delta = [0.0; 6];
                for d in delta.iter_mut() {
                    *d = gaussian(&mut rng) * camera_noise;
                }
                pose.retract(&delta)
            })
            .collect();

        let points = self
            .points
            .iter()
            .map(|x| {
                *x + DVec3::new(gaussian(&mut rng), gaussian(&mut rng), gaussian(&mut rng))
                    * point_noise
            })
            .collect();

        BundleProblem::new(
            cameras,
            points,
            self.observations.clone(),
            self.camera_model,
        )
    }
}

/// Standard normal sample (Box-Muller).
fn gaussian(rng: &mut impl Rng) -> f64 {
    let u1 = rng.random::<f64>().max(f64::MIN_POSITIVE);
    let u2 = rng.random::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}
