//! Closed-form initial guesses from planar homographies.

use crate::model::{CameraMatrix, Pose};
use log::debug;
use nalgebra::{DMatrix, Matrix3, Rotation3, Vector3};

fn v_ij(h: &Matrix3<f64>, i: usize, j: usize) -> [f64; 6] {
    [
        h[(0, i)] * h[(0, j)],
        h[(0, i)] * h[(1, j)] + h[(1, i)] * h[(0, j)],
        h[(1, i)] * h[(1, j)],
        h[(2, i)] * h[(0, j)] + h[(0, i)] * h[(2, j)],
        h[(2, i)] * h[(1, j)] + h[(1, i)] * h[(2, j)],
        h[(2, i)] * h[(2, j)],
    ]
}

/// Zhang's method with the zero-skew constraint `B12 = 0`.
///
/// Needs at least two homographies (three without the skew row).
pub(crate) fn zhang_intrinsics(homographies: &[Matrix3<f64>]) -> Option<CameraMatrix> {
    if homographies.len() < 2 {
        return None;
    }

    let rows = 2 * homographies.len() + 1;
    let mut v = DMatrix::<f64>::zeros(rows.max(6), 6);
    for (i, h) in homographies.iter().enumerate() {
        // Unit-norm rows keep views with large homography scale from dominating.
        let h = h / h.norm();
        let v12 = v_ij(&h, 0, 1);
        let v11 = v_ij(&h, 0, 0);
        let v22 = v_ij(&h, 1, 1);
        for j in 0..6 {
            v[(2 * i, j)] = v12[j];
            v[(2 * i + 1, j)] = v11[j] - v22[j];
        }
    }
    let scale = v.row(0).norm().max(1e-12);
    v[(rows - 1, 1)] = scale;

    let svd = v.svd(false, true);
    let vt = svd.v_t?;
    let (min_idx, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .fold((0, f64::INFINITY), |best, (i, &sv)| if sv < best.1 { (i, sv) } else { best });
    let b = vt.row(min_idx);
    let sign = if b[0] < 0.0 { -1.0 } else { 1.0 };
    let (b11, b12, b22, b13, b23, b33) = (
        sign * b[0],
        sign * b[1],
        sign * b[2],
        sign * b[3],
        sign * b[4],
        sign * b[5],
    );

    let denom = b11 * b22 - b12 * b12;
    if denom.abs() < 1e-300 || b11.abs() < 1e-300 {
        return None;
    }
    let v0 = (b12 * b13 - b11 * b23) / denom;
    let lambda = b33 - (b13 * b13 + v0 * (b12 * b13 - b11 * b23)) / b11;
    if lambda / b11 <= 0.0 || lambda * b11 / denom <= 0.0 {
        return None;
    }
    let alpha = (lambda / b11).sqrt();
    let beta = (lambda * b11 / denom).sqrt();
    let u0 = -b13 * alpha * alpha / lambda;

    let k = CameraMatrix::new(alpha, beta, u0, v0);
    k.is_finite().then_some(k)
}

/// Focal lengths from vanishing points with the principal point fixed at
/// the image centre.
pub(crate) fn centered_intrinsics(homographies: &[Matrix3<f64>], width: u32, height: u32) -> Option<CameraMatrix> {
    if homographies.is_empty() {
        return None;
    }
    let cx = (width as f64 - 1.0) * 0.5;
    let cy = (height as f64 - 1.0) * 0.5;

    let n = homographies.len();
    let mut a = DMatrix::<f64>::zeros(2 * n, 2);
    let mut b = nalgebra::DVector::<f64>::zeros(2 * n);
    for (i, h) in homographies.iter().enumerate() {
        let mut hc = *h;
        for c in 0..3 {
            hc[(0, c)] -= cx * h[(2, c)];
            hc[(1, c)] -= cy * h[(2, c)];
        }
        let h1 = hc.column(0).into_owned();
        let h2 = hc.column(1).into_owned();
        let d1 = (h1 + h2) * 0.5;
        let d2 = (h1 - h2) * 0.5;
        let (h1, h2) = (h1.normalize(), h2.normalize());
        let (d1, d2) = (d1.normalize(), d2.normalize());

        a[(2 * i, 0)] = h1[0] * h2[0];
        a[(2 * i, 1)] = h1[1] * h2[1];
        a[(2 * i + 1, 0)] = d1[0] * d2[0];
        a[(2 * i + 1, 1)] = d1[1] * d2[1];
        b[2 * i] = -h1[2] * h2[2];
        b[2 * i + 1] = -d1[2] * d2[2];
    }

    let f = a.svd(true, true).solve(&b, 1e-14).ok()?;
    let fx = (1.0 / f[0].abs()).sqrt();
    let fy = (1.0 / f[1].abs()).sqrt();
    let k = CameraMatrix::new(fx, fy, cx, cy);
    debug!("centred intrinsics fallback: fx={fx:.2} fy={fy:.2}");
    k.is_finite().then_some(k)
}

/// Board pose from `H = K [r1 r2 t]`, with the rotation orthonormalised.
pub(crate) fn pose_from_homography(k: &CameraMatrix, h: &Matrix3<f64>) -> Option<Pose> {
    let k_inv = k.matrix().try_inverse()?;
    let r1_raw = k_inv * h.column(0);
    let r2_raw = k_inv * h.column(1);
    let t_raw = k_inv * h.column(2);

    let mut scale = 2.0 / (r1_raw.norm() + r2_raw.norm()).max(1e-18);
    // The board lies in front of the camera.
    if t_raw.z * scale < 0.0 {
        scale = -scale;
    }

    let r1: Vector3<f64> = r1_raw * scale;
    let r2: Vector3<f64> = r2_raw * scale;
    let r3 = r1.cross(&r2);
    let r = Matrix3::from_columns(&[r1, r2, r3]);

    let svd = r.svd(true, true);
    let mut r = svd.u? * svd.v_t?;
    if r.determinant() < 0.0 {
        r = -r;
    }

    let rotation = Rotation3::from_matrix_unchecked(r);
    Some(Pose::from_rotation(&rotation, t_raw * scale))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Point3;

    fn homography_for(k: &CameraMatrix, pose: &Pose) -> Matrix3<f64> {
        let r = pose.rotation_matrix();
        let m = r.matrix();
        let cols = Matrix3::from_columns(&[m.column(0).into_owned(), m.column(1).into_owned(), pose.translation]);
        k.matrix() * cols
    }

    fn views() -> Vec<Pose> {
        vec![
            Pose::new(Vector3::new(0.3, 0.1, 0.05), Vector3::new(-80.0, -60.0, 600.0)),
            Pose::new(Vector3::new(-0.2, 0.35, -0.1), Vector3::new(-120.0, -40.0, 650.0)),
            Pose::new(Vector3::new(0.1, -0.3, 0.2), Vector3::new(-60.0, -90.0, 550.0)),
            Pose::new(Vector3::new(-0.35, -0.2, 0.0), Vector3::new(-100.0, -70.0, 700.0)),
        ]
    }

    #[test]
    fn zhang_recovers_intrinsics() {
        let k = CameraMatrix::new(810.0, 795.0, 322.0, 238.0);
        let hs: Vec<_> = views().iter().map(|p| homography_for(&k, p)).collect();
        let est = zhang_intrinsics(&hs).expect("solvable");
        assert_relative_eq!(est.fx, k.fx, max_relative = 1e-6);
        assert_relative_eq!(est.fy, k.fy, max_relative = 1e-6);
        assert_relative_eq!(est.cx, k.cx, epsilon = 1e-3);
        assert_relative_eq!(est.cy, k.cy, epsilon = 1e-3);
    }

    #[test]
    fn centred_fallback_estimates_focal_length() {
        let k = CameraMatrix::new(800.0, 800.0, 319.5, 239.5);
        let hs: Vec<_> = views().iter().map(|p| homography_for(&k, p)).collect();
        let est = centered_intrinsics(&hs, 640, 480).expect("solvable");
        assert_relative_eq!(est.fx, 800.0, max_relative = 1e-6);
        assert_relative_eq!(est.fy, 800.0, max_relative = 1e-6);
    }

    #[test]
    fn pose_from_homography_matches_truth() {
        let k = CameraMatrix::new(800.0, 780.0, 320.0, 240.0);
        for truth in views() {
            // Homographies are only defined up to scale, sign included.
            let h = -homography_for(&k, &truth) * 0.01;
            let pose = pose_from_homography(&k, &h).expect("pose");
            let p = Point3::new(50.0, 30.0, 0.0);
            let a = pose.transform(&p);
            let b = truth.transform(&p);
            assert!((a - b).norm() < 1e-6, "{a:?} vs {b:?}");
        }
    }
}
