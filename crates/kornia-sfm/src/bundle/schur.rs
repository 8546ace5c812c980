//! Block-sparse normal equations and their Schur complement solve.
//!
//! With cameras `c` and points `p` the damped normal equations read
//!
//! ```text
//! | U + λI   W      | |Δc|   |-g_c|
//! | Wᵀ       V + λI | |Δp| = |-g_p|
//! ```
//!
//! where `U` is block diagonal with one 6x6 block per camera, `V` is block diagonal
//! with one 3x3 block per point and `W` has one 6x3 block per observation. Each point
//! block is eliminated independently, the reduced camera system
//! `S = U + λI - W (V + λI)⁻¹ Wᵀ` is factorized densely and the point updates are
//! recovered by back substitution.

use faer::prelude::SpSolver;
use glam::{DMat3, DVec3};
use rayon::prelude::*;

use super::BundleAdjustmentError;
use crate::linalg::spd_inverse_3x3;
use crate::problem::BundleProblem;
use crate::residual::ObservationBlock;

type Block6 = [[f64; 6]; 6];
type Block6x3 = [[f64; 3]; 6];

/// Mapping from camera indices to the blocks of the reduced camera system.
///
/// Fixed cameras take no part in the system and always receive a zero update.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraLayout {
    free_index: Vec<Option<usize>>,
    num_free: usize,
}

impl CameraLayout {
    /// Create the layout of `num_cameras` cameras where `fixed` are held constant.
    pub fn new(num_cameras: usize, fixed: &[usize]) -> Result<Self, BundleAdjustmentError> {
        let mut is_fixed = vec![false; num_cameras];
        for &camera in fixed {
            if camera >= num_cameras {
                return Err(BundleAdjustmentError::InvalidConfiguration(format!(
                    "fixed camera {camera} is out of range, the problem has {num_cameras} cameras"
                )));
            }
            is_fixed[camera] = true;
        }

        let mut num_free = 0;
        let free_index = is_fixed
            .iter()
            .map(|&fixed| {
                if fixed {
                    None
                } else {
                    num_free += 1;
                    Some(num_free - 1)
                }
            })
            .collect();

        Ok(Self {
            free_index,
            num_free,
        })
    }

    /// Position of the camera in the reduced system, `None` for a fixed camera.
    #[inline]
    pub fn free_index(&self, camera: usize) -> Option<usize> {
        self.free_index.get(camera).copied().flatten()
    }

    /// Whether the camera is held constant.
    pub fn is_fixed(&self, camera: usize) -> bool {
        self.free_index(camera).is_none()
    }

    /// Number of cameras being refined.
    pub fn num_free(&self) -> usize {
        self.num_free
    }

    /// Total number of cameras.
    pub fn num_cameras(&self) -> usize {
        self.free_index.len()
    }
}

/// Update of the full state computed by [`NormalEquations::solve`].
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    /// Local update `[omega, delta_t]` of every camera; zero for fixed cameras.
    pub cameras: Vec<[f64; 6]>,
    /// Update of every point.
    pub points: Vec<DVec3>,
}

impl Step {
    /// Euclidean norm of the stacked update.
    pub fn norm(&self) -> f64 {
        let cameras = self
            .cameras
            .iter()
            .flat_map(|d| d.iter())
            .map(|v| v * v)
            .sum::<f64>();
        let points = self.points.iter().map(|d| d.length_squared()).sum::<f64>();
        (cameras + points).sqrt()
    }
}

/// Block-sparse Gauss-Newton normal equations `JᵀJ Δ = -Jᵀr`.
#[derive(Debug, Clone)]
pub struct NormalEquations {
    camera_hessians: Vec<Block6>,
    point_hessians: Vec<DMat3>,
    cross_terms: Vec<Block6x3>,
    camera_gradients: Vec<[f64; 6]>,
    point_gradients: Vec<DVec3>,
}

/// A point block eliminated from the damped system.
struct EliminatedPoint {
    v_inv: DMat3,
    /// `(free camera index, observation, W (V + λI)⁻¹)` for every observation of the
    /// point made by a free camera.
    coupled: Vec<(usize, usize, Block6x3)>,
}

impl NormalEquations {
    /// Accumulate the normal equations from the linearized observations.
    ///
    /// # Arguments
    ///
    /// * `problem` - The problem the blocks were computed for.
    /// * `blocks` - One linearization block per observation.
    pub fn assemble(problem: &BundleProblem, blocks: &[ObservationBlock]) -> Self {
        let observations = problem.observations();

        let cross_terms: Vec<Block6x3> = blocks
            .par_iter()
            .map(|block| {
                let mut w = [[0.0; 3]; 6];
                for (a, row) in w.iter_mut().enumerate() {
                    for (b, val) in row.iter_mut().enumerate() {
                        *val = block.jac_camera[0][a] * block.jac_point[0][b]
                            + block.jac_camera[1][a] * block.jac_point[1][b];
                    }
                }
                w
            })
            .collect();

        let mut camera_hessians = vec![[[0.0; 6]; 6]; problem.num_cameras()];
        let mut camera_gradients = vec![[0.0; 6]; problem.num_cameras()];
        for (obs, block) in observations.iter().zip(blocks) {
            let u = &mut camera_hessians[obs.camera_index];
            let g = &mut camera_gradients[obs.camera_index];
            let r = [block.residual.x, block.residual.y];
            for a in 0..6 {
                for b in 0..6 {
                    u[a][b] += block.jac_camera[0][a] * block.jac_camera[0][b]
                        + block.jac_camera[1][a] * block.jac_camera[1][b];
                }
                g[a] += block.jac_camera[0][a] * r[0] + block.jac_camera[1][a] * r[1];
            }
        }

        let (point_hessians, point_gradients): (Vec<DMat3>, Vec<DVec3>) = problem
            .point_observations()
            .par_iter()
            .map(|obs_ids| {
                let mut v = [[0.0; 3]; 3];
                let mut g = [0.0; 3];
                for &o in obs_ids {
                    let jp = &blocks[o].jac_point;
                    let r = [blocks[o].residual.x, blocks[o].residual.y];
                    for a in 0..3 {
                        for b in 0..3 {
                            v[a][b] += jp[0][a] * jp[0][b] + jp[1][a] * jp[1][b];
                        }
                        g[a] += jp[0][a] * r[0] + jp[1][a] * r[1];
                    }
                }
                // symmetric, so the column-major layout does not matter
                (DMat3::from_cols_array_2d(&v), DVec3::from_array(g))
            })
            .unzip();

        Self {
            camera_hessians,
            point_hessians,
            cross_terms,
            camera_gradients,
            point_gradients,
        }
    }

    /// Norm of the gradient `Jᵀr` restricted to the free parameters.
    pub fn gradient_norm(&self, layout: &CameraLayout) -> f64 {
        let cameras = self
            .camera_gradients
            .iter()
            .enumerate()
            .filter(|(i, _)| !layout.is_fixed(*i))
            .flat_map(|(_, g)| g.iter())
            .map(|v| v * v)
            .sum::<f64>();
        let points = self
            .point_gradients
            .iter()
            .map(|g| g.length_squared())
            .sum::<f64>();
        (cameras + points).sqrt()
    }

    /// Solve the damped system `(JᵀJ + λI) Δ = -Jᵀr` through the Schur complement.
    ///
    /// # Arguments
    ///
    /// * `problem` - The problem the equations were assembled for.
    /// * `layout` - Free and fixed cameras.
    /// * `lambda` - The damping added to the diagonal.
    ///
    /// # Returns
    ///
    /// The update of all cameras and points, or [`BundleAdjustmentError::RankDeficiency`]
    /// if a point block or the reduced camera system is not positive definite.
    pub fn solve(
        &self,
        problem: &BundleProblem,
        layout: &CameraLayout,
        lambda: f64,
    ) -> Result<Step, BundleAdjustmentError> {
        let observations = problem.observations();
        let damping = DMat3::from_diagonal(DVec3::splat(lambda));

        let eliminated = problem
            .point_observations()
            .par_iter()
            .enumerate()
            .map(|(j, obs_ids)| -> Result<EliminatedPoint, BundleAdjustmentError> {
                let v_inv = spd_inverse_3x3(&(self.point_hessians[j] + damping)).ok_or_else(
                    || {
                        BundleAdjustmentError::RankDeficiency(format!(
                            "block of point {j} is not positive definite"
                        ))
                    },
                )?;
                let coupled = obs_ids
                    .iter()
                    .filter_map(|&o| {
                        let free = layout.free_index(observations[o].camera_index)?;
                        Some((free, o, mul_6x3_3x3(&self.cross_terms[o], &v_inv)))
                    })
                    .collect();
                Ok(EliminatedPoint { v_inv, coupled })
            })
            .collect::<Result<Vec<_>, BundleAdjustmentError>>()?;

        let dim = 6 * layout.num_free();
        let mut s = faer::Mat::<f64>::zeros(dim, dim);
        let mut b = faer::Mat::<f64>::zeros(dim, 1);

        for camera in 0..layout.num_cameras() {
            let Some(i) = layout.free_index(camera) else {
                continue;
            };
            let u = &self.camera_hessians[camera];
            let g = &self.camera_gradients[camera];
            for r in 0..6 {
                for c in 0..6 {
                    s.write(6 * i + r, 6 * i + c, u[r][c]);
                }
                s.write(6 * i + r, 6 * i + r, u[r][r] + lambda);
                b.write(6 * i + r, 0, -g[r]);
            }
        }

        // scatter -W (V + λI)⁻¹ Wᵀ and W (V + λI)⁻¹ g_p into the reduced system
        for (j, point) in eliminated.iter().enumerate() {
            let gp = self.point_gradients[j];
            for (i, _, y) in &point.coupled {
                for r in 0..6 {
                    let row = 6 * i + r;
                    b.write(row, 0, b.read(row, 0) + DVec3::from_array(y[r]).dot(gp));
                }
                for (k, o, _) in &point.coupled {
                    let w = &self.cross_terms[*o];
                    for r in 0..6 {
                        for c in 0..6 {
                            let val = y[r][0] * w[c][0] + y[r][1] * w[c][1] + y[r][2] * w[c][2];
                            let (row, col) = (6 * i + r, 6 * k + c);
                            s.write(row, col, s.read(row, col) - val);
                        }
                    }
                }
            }
        }

        let delta_free = if dim > 0 {
            let llt = s.cholesky(faer::Side::Lower).map_err(|_| {
                BundleAdjustmentError::RankDeficiency(
                    "reduced camera system is not positive definite".to_string(),
                )
            })?;
            llt.solve(&b)
        } else {
            b
        };

        let cameras: Vec<[f64; 6]> = (0..layout.num_cameras())
            .map(|camera| {
                let mut delta = [0.0; 6];
                if let Some(i) = layout.free_index(camera) {
                    for (r, d) in delta.iter_mut().enumerate() {
                        *d = delta_free.read(6 * i + r, 0);
                    }
                }
                delta
            })
            .collect();

        // Δp = (V + λI)⁻¹ (-g_p - Wᵀ Δc)
        let points = eliminated
            .par_iter()
            .enumerate()
            .map(|(j, point)| {
                let mut rhs = -self.point_gradients[j];
                for (_, o, _) in &point.coupled {
                    let w = &self.cross_terms[*o];
                    let dc = &cameras[observations[*o].camera_index];
                    for m in 0..3 {
                        rhs[m] -= (0..6).map(|a| w[a][m] * dc[a]).sum::<f64>();
                    }
                }
                point.v_inv * rhs
            })
            .collect();

        Ok(Step { cameras, points })
    }
}

fn mul_6x3_3x3(w: &Block6x3, m: &DMat3) -> Block6x3 {
    let mut out = [[0.0; 3]; 6];
    for (r, row) in out.iter_mut().enumerate() {
        let w_row = DVec3::from_array(w[r]);
        for (c, val) in row.iter_mut().enumerate() {
            *val = w_row.dot(m.col(c));
        }
    }
    out
}
