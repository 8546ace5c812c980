use glam::{DVec2, DVec3};
use serde::{Deserialize, Serialize};

/// Minimum depth for a point to be considered in front of the camera.
pub const MIN_DEPTH: f64 = 1e-8;

const UNDISTORT_MAX_ITERATIONS: usize = 20;
const UNDISTORT_TOLERANCE: f64 = 1e-14;

/// Represents the instrinsic parameters of a pinhole camera
///
/// # Fields
///
/// * `fx` - The focal length in the x direction
/// * `fy` - The focal length in the y direction
/// * `cx` - The x coordinate of the principal point
/// * `cy` - The y coordinate of the principal point
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsic {
    /// The focal length in the x direction
    pub fx: f64,
    /// The focal length in the y direction
    pub fy: f64,
    /// The x coordinate of the principal point
    pub cx: f64,
    /// The y coordinate of the principal point
    pub cy: f64,
}

impl CameraIntrinsic {
    /// Create a new set of pinhole intrinsics.
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self { fx, fy, cx, cy }
    }

    /// Map normalized image coordinates to pixels.
    #[inline]
    pub fn to_pixel(&self, xn: &DVec2) -> DVec2 {
        DVec2::new(self.fx * xn.x + self.cx, self.fy * xn.y + self.cy)
    }

    /// Map pixels to normalized image coordinates.
    #[inline]
    pub fn to_normalized(&self, pixel: &DVec2) -> DVec2 {
        DVec2::new((pixel.x - self.cx) / self.fx, (pixel.y - self.cy) / self.fy)
    }
}

/// Represents the polynomial distortion parameters of a camera
///
/// The radial part is the rational model
/// `(1 + k1 r² + k2 r⁴ + k3 r⁶) / (1 + k4 r² + k5 r⁴ + k6 r⁶)`, applied in
/// normalized image coordinates together with the tangential terms `p1`, `p2`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PolynomialDistortion {
    /// The first radial distortion coefficient
    pub k1: f64,
    /// The second radial distortion coefficient
    pub k2: f64,
    /// The third radial distortion coefficient
    pub k3: f64,
    /// The fourth radial distortion coefficient
    pub k4: f64,
    /// The fifth radial distortion coefficient
    pub k5: f64,
    /// The sixth radial distortion coefficient
    pub k6: f64,
    /// The first tangential distortion coefficient
    pub p1: f64,
    /// The second tangential distortion coefficient
    pub p2: f64,
}

impl PolynomialDistortion {
    fn radial(&self, r2: f64) -> (f64, f64, f64, f64) {
        let (r4, r6) = (r2 * r2, r2 * r2 * r2);
        let num = 1.0 + self.k1 * r2 + self.k2 * r4 + self.k3 * r6;
        let den = 1.0 + self.k4 * r2 + self.k5 * r4 + self.k6 * r6;
        let dnum = self.k1 + 2.0 * self.k2 * r2 + 3.0 * self.k3 * r4;
        let dden = self.k4 + 2.0 * self.k5 * r2 + 3.0 * self.k6 * r4;
        (num, den, dnum, dden)
    }

    /// Distort a point given in normalized image coordinates.
    pub fn distort(&self, xn: &DVec2) -> DVec2 {
        let (x, y) = (xn.x, xn.y);
        let r2 = x * x + y * y;
        let (num, den, _, _) = self.radial(r2);
        let kr = num / den;
        DVec2::new(
            x * kr + 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x),
            y * kr + self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y,
        )
    }

    /// Distort a normalized point and return the 2x2 derivative (row-major) of the
    /// distorted coordinates with respect to the undistorted ones.
    pub fn distort_with_jacobian(&self, xn: &DVec2) -> (DVec2, [[f64; 2]; 2]) {
        let (x, y) = (xn.x, xn.y);
        let r2 = x * x + y * y;
        let (num, den, dnum, dden) = self.radial(r2);
        let kr = num / den;
        // d(kr)/d(r2)
        let dkr = (dnum * den - num * dden) / (den * den);

        let (p1, p2) = (self.p1, self.p2);
        let xd = x * kr + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
        let yd = y * kr + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;

        let dxd_dx = kr + 2.0 * x * x * dkr + 2.0 * p1 * y + 6.0 * p2 * x;
        let dxd_dy = 2.0 * x * y * dkr + 2.0 * p1 * x + 2.0 * p2 * y;
        let dyd_dx = 2.0 * x * y * dkr + 2.0 * p1 * x + 2.0 * p2 * y;
        let dyd_dy = kr + 2.0 * y * y * dkr + 6.0 * p1 * y + 2.0 * p2 * x;

        (DVec2::new(xd, yd), [[dxd_dx, dxd_dy], [dyd_dx, dyd_dy]])
    }

    /// Remove the distortion of a normalized point with a fixed-point iteration.
    pub fn undistort(&self, xd: &DVec2) -> DVec2 {
        let mut xn = *xd;
        for _ in 0..UNDISTORT_MAX_ITERATIONS {
            let (x, y) = (xn.x, xn.y);
            let r2 = x * x + y * y;
            let (num, den, _, _) = self.radial(r2);
            if num.abs() < f64::EPSILON {
                break;
            }
            let icdist = den / num;
            let dx = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
            let dy = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
            let next = DVec2::new((xd.x - dx) * icdist, (xd.y - dy) * icdist);
            let delta = (next - xn).length();
            xn = next;
            if delta < UNDISTORT_TOLERANCE {
                break;
            }
        }
        xn
    }
}

/// Projection model shared by all the observations of a problem.
///
/// The set of variants is closed: the solver only needs the projection and its
/// derivative, never the concrete model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum CameraModel {
    /// Ideal pinhole camera.
    Pinhole(CameraIntrinsic),
    /// Pinhole camera with radial and tangential lens distortion.
    PinholeDistorted {
        /// Pinhole intrinsics.
        intrinsic: CameraIntrinsic,
        /// Lens distortion applied in normalized coordinates.
        distortion: PolynomialDistortion,
    },
}

impl CameraModel {
    /// Create a pinhole model.
    pub fn pinhole(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        CameraModel::Pinhole(CameraIntrinsic::new(fx, fy, cx, cy))
    }

    /// The pinhole intrinsics of the model.
    pub fn intrinsic(&self) -> &CameraIntrinsic {
        match self {
            CameraModel::Pinhole(intrinsic) => intrinsic,
            CameraModel::PinholeDistorted { intrinsic, .. } => intrinsic,
        }
    }

    /// Project a point given in the camera frame to pixel coordinates.
    ///
    /// Returns `None` if the point is not in front of the camera.
    pub fn project(&self, p_cam: &DVec3) -> Option<DVec2> {
        if p_cam.z <= MIN_DEPTH {
            return None;
        }
        let xn = DVec2::new(p_cam.x / p_cam.z, p_cam.y / p_cam.z);
        match self {
            CameraModel::Pinhole(intrinsic) => Some(intrinsic.to_pixel(&xn)),
            CameraModel::PinholeDistorted {
                intrinsic,
                distortion,
            } => Some(intrinsic.to_pixel(&distortion.distort(&xn))),
        }
    }

    /// Project a camera-frame point and compute the 2x3 derivative (row-major) of the
    /// pixel coordinates with respect to the camera-frame point.
    pub fn project_with_jacobian(&self, p_cam: &DVec3) -> Option<(DVec2, [[f64; 3]; 2])> {
        if p_cam.z <= MIN_DEPTH {
            return None;
        }
        let inv_z = 1.0 / p_cam.z;
        let xn = DVec2::new(p_cam.x * inv_z, p_cam.y * inv_z);

        // d(xn)/d(p_cam)
        let dxn = [
            [inv_z, 0.0, -xn.x * inv_z],
            [0.0, inv_z, -xn.y * inv_z],
        ];

        let intrinsic = self.intrinsic();
        let (xd, dxd_dxn) = match self {
            CameraModel::Pinhole(_) => (xn, [[1.0, 0.0], [0.0, 1.0]]),
            CameraModel::PinholeDistorted { distortion, .. } => {
                distortion.distort_with_jacobian(&xn)
            }
        };

        let focal = [intrinsic.fx, intrinsic.fy];
        let mut jac = [[0.0; 3]; 2];
        for (r, row) in jac.iter_mut().enumerate() {
            for (c, val) in row.iter_mut().enumerate() {
                *val = focal[r] * (dxd_dxn[r][0] * dxn[0][c] + dxd_dxn[r][1] * dxn[1][c]);
            }
        }

        Some((intrinsic.to_pixel(&xd), jac))
    }

    /// Map a pixel to normalized image coordinates, removing the lens distortion.
    pub fn unproject(&self, pixel: &DVec2) -> DVec2 {
        match self {
            CameraModel::Pinhole(intrinsic) => intrinsic.to_normalized(pixel),
            CameraModel::PinholeDistorted {
                intrinsic,
                distortion,
            } => distortion.undistort(&intrinsic.to_normalized(pixel)),
        }
    }
}
