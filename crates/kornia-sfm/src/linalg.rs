use glam::{DMat3, DVec3};

/// Computes the Cholesky decomposition of a symmetric positive definite 3x3 matrix.
///
/// Returns a lower triangular matrix L such that A = L * L^T.
///
/// # Arguments
///
/// * `mat` - The symmetric positive definite matrix to decompose.
///
/// # Returns
///
/// An `Option<DMat3>` containing the lower triangular matrix L, or `None` if the matrix
/// is not positive definite.
pub fn cholesky_3x3(mat: &DMat3) -> Option<DMat3> {
    let mut l = DMat3::ZERO;
    let a = mat;

    if !(a.x_axis.x > 0.0) {
        return None;
    }
    l.x_axis.x = a.x_axis.x.sqrt();

    l.x_axis.y = a.x_axis.y / l.x_axis.x;
    l.x_axis.z = a.x_axis.z / l.x_axis.x;

    let val_l22 = a.y_axis.y - l.x_axis.y * l.x_axis.y;
    if !(val_l22 > 0.0) {
        return None;
    }
    l.y_axis.y = val_l22.sqrt();

    l.y_axis.z = (a.y_axis.z - l.x_axis.z * l.x_axis.y) / l.y_axis.y;

    let val_l33 = a.z_axis.z - l.x_axis.z * l.x_axis.z - l.y_axis.z * l.y_axis.z;
    if !(val_l33 > 0.0) {
        return None;
    }
    l.z_axis.z = val_l33.sqrt();

    Some(l)
}

/// Solves the system A x = b given the Cholesky factor L of A.
pub fn cholesky_solve_3x3(l: &DMat3, b: &DVec3) -> DVec3 {
    let (l11, l21, l31) = (l.x_axis.x, l.x_axis.y, l.x_axis.z);
    let (l22, l32) = (l.y_axis.y, l.y_axis.z);
    let l33 = l.z_axis.z;

    // forward substitution: L y = b
    let y0 = b.x / l11;
    let y1 = (b.y - l21 * y0) / l22;
    let y2 = (b.z - l31 * y0 - l32 * y1) / l33;

    // backward substitution: L^T x = y
    let x2 = y2 / l33;
    let x1 = (y1 - l32 * x2) / l22;
    let x0 = (y0 - l21 * x1 - l31 * x2) / l11;

    DVec3::new(x0, x1, x2)
}

/// Inverts a symmetric positive definite 3x3 matrix through its Cholesky factor.
///
/// Returns `None` if the matrix is not positive definite.
pub fn spd_inverse_3x3(mat: &DMat3) -> Option<DMat3> {
    let l = cholesky_3x3(mat)?;
    Some(DMat3::from_cols(
        cholesky_solve_3x3(&l, &DVec3::X),
        cholesky_solve_3x3(&l, &DVec3::Y),
        cholesky_solve_3x3(&l, &DVec3::Z),
    ))
}

/// Skew-symmetric matrix `[v]x` such that `[v]x * w = v.cross(w)`.
pub fn skew(v: &DVec3) -> DMat3 {
    DMat3::from_cols(
        DVec3::new(0.0, v.z, -v.y),
        DVec3::new(-v.z, 0.0, v.x),
        DVec3::new(v.y, -v.x, 0.0),
    )
}

/// Rotation matrix of a rotation vector (Rodrigues formula).
pub fn so3_exp(omega: &DVec3) -> DMat3 {
    let theta = omega.length();
    if theta < 1e-12 {
        // first order expansion
        return DMat3::IDENTITY + skew(omega);
    }
    DMat3::from_axis_angle(*omega / theta, theta)
}
