//! Reprojection-error problem over intrinsics, distortion and board poses,
//! minimised with `levenberg_marquardt`.
//!
//! Parameter layout: the free entries of `[fx, fy, cx, cy, k1, k2, p1, p2,
//! k3]`, then `(rotation, translation)` for every view. Held coefficients
//! are not parameters at all, so they keep their value exactly.

use crate::model::{CameraMatrix, CameraModel, Distortion, Pose};
use levenberg_marquardt::LeastSquaresProblem;
use nalgebra::{storage::Owned, DMatrix, DVector, Dyn, Point2, Point3, Rotation3, Vector3};
use std::ops::Range;

pub(crate) const N_INTRINSICS: usize = 9;
pub(crate) const N_POSE: usize = 6;

/// Correspondences of one view, object points on `z = 0`.
pub(crate) struct View {
    pub object: Vec<Point3<f64>>,
    pub image: Vec<Point2<f64>>,
}

pub(crate) fn model_from(k: &[f64; N_INTRINSICS]) -> CameraModel {
    CameraModel::new(
        CameraMatrix::new(k[0], k[1], k[2], k[3]),
        Distortion::from_coefficients([k[4], k[5], k[6], k[7], k[8]]),
    )
}

pub(crate) fn intrinsics_of(model: &CameraModel) -> [f64; N_INTRINSICS] {
    let m = model.matrix;
    let d = model.distortion.coefficients();
    [m.fx, m.fy, m.cx, m.cy, d[0], d[1], d[2], d[3], d[4]]
}

fn pose_from(x: &[f64]) -> Pose {
    Pose::new(Vector3::new(x[0], x[1], x[2]), Vector3::new(x[3], x[4], x[5]))
}

/// Projection without the behind-camera check, so that finite differences
/// stay defined everywhere.
#[inline]
fn project(model: &CameraModel, rotation: &Rotation3<f64>, t: &Vector3<f64>, p: &Point3<f64>) -> Point2<f64> {
    let pc = rotation * p + t;
    let z = if pc.z.abs() < 1e-12 { 1e-12 } else { pc.z };
    let n = Point2::new(pc.x / z, pc.y / z);
    model.matrix.to_pixel(model.distortion.distort(n))
}

fn view_residuals(intr: &[f64; N_INTRINSICS], pose: &[f64], view: &View, out: &mut [f64]) {
    let model = model_from(intr);
    let pose = pose_from(pose);
    let rotation = pose.rotation_matrix();
    for (k, (p, obs)) in view.object.iter().zip(&view.image).enumerate() {
        let q = project(&model, &rotation, &pose.translation, p);
        out[2 * k] = q.x - obs.x;
        out[2 * k + 1] = q.y - obs.y;
    }
}

fn fd_step(v: f64) -> f64 {
    1e-6 * v.abs().max(1.0)
}

pub(crate) struct PlanarProblem<'a> {
    views: &'a [View],
    /// First residual row of each view.
    offsets: Vec<usize>,
    total: usize,
    /// Intrinsics; entries not listed in `free` are held at these values.
    held: [f64; N_INTRINSICS],
    free: Vec<usize>,
    params: DVector<f64>,
}

impl<'a> PlanarProblem<'a> {
    pub fn new(views: &'a [View], model: &CameraModel, poses: &[Pose], free: [bool; N_INTRINSICS]) -> Self {
        let held = intrinsics_of(model);
        let free: Vec<usize> = (0..N_INTRINSICS).filter(|&i| free[i]).collect();

        let mut x = Vec::with_capacity(free.len() + N_POSE * poses.len());
        x.extend(free.iter().map(|&i| held[i]));
        for pose in poses {
            x.extend(pose.rotation.iter());
            x.extend(pose.translation.iter());
        }

        let mut offsets = Vec::with_capacity(views.len());
        let mut total = 0;
        for v in views {
            offsets.push(total);
            total += 2 * v.object.len();
        }

        Self {
            views,
            offsets,
            total,
            held,
            free,
            params: DVector::from_vec(x),
        }
    }

    fn intrinsics(&self) -> [f64; N_INTRINSICS] {
        let mut k = self.held;
        for (slot, &i) in self.free.iter().enumerate() {
            k[i] = self.params[slot];
        }
        k
    }

    fn pose_range(&self, view: usize) -> Range<usize> {
        let start = self.free.len() + N_POSE * view;
        start..start + N_POSE
    }

    /// Residual rows of `view`.
    pub fn rows(&self, view: usize) -> Range<usize> {
        let start = self.offsets[view];
        start..start + 2 * self.views[view].object.len()
    }

    pub fn model(&self) -> CameraModel {
        model_from(&self.intrinsics())
    }

    pub fn poses(&self) -> Vec<Pose> {
        (0..self.views.len())
            .map(|vi| pose_from(&self.params.as_slice()[self.pose_range(vi)]))
            .collect()
    }

    pub fn residual_vector(&self) -> DVector<f64> {
        let mut r = DVector::zeros(self.total);
        let intr = self.intrinsics();
        for (vi, view) in self.views.iter().enumerate() {
            let pose = &self.params.as_slice()[self.pose_range(vi)];
            view_residuals(&intr, pose, view, &mut r.as_mut_slice()[self.rows(vi)]);
        }
        r
    }

    /// Central differences. A view's rows only depend on the intrinsics and
    /// its own pose, so only those two blocks are evaluated.
    pub fn jacobian_matrix(&self) -> DMatrix<f64> {
        let mut j = DMatrix::zeros(self.total, self.params.len());
        let base = self.intrinsics();

        for (vi, view) in self.views.iter().enumerate() {
            let rows = self.rows(vi);
            let poses = self.pose_range(vi);
            let mut intr = base;
            let mut pose = [0.0; N_POSE];
            pose.copy_from_slice(&self.params.as_slice()[poses.clone()]);
            let mut plus = vec![0.0; rows.len()];
            let mut minus = vec![0.0; rows.len()];

            for (col, &p) in self.free.iter().enumerate() {
                let h = fd_step(intr[p]);
                let orig = intr[p];
                intr[p] = orig + h;
                view_residuals(&intr, &pose, view, &mut plus);
                intr[p] = orig - h;
                view_residuals(&intr, &pose, view, &mut minus);
                intr[p] = orig;
                for (k, row) in rows.clone().enumerate() {
                    j[(row, col)] = (plus[k] - minus[k]) / (2.0 * h);
                }
            }

            for p in 0..N_POSE {
                let h = fd_step(pose[p]);
                let orig = pose[p];
                pose[p] = orig + h;
                view_residuals(&intr, &pose, view, &mut plus);
                pose[p] = orig - h;
                view_residuals(&intr, &pose, view, &mut minus);
                pose[p] = orig;
                for (k, row) in rows.clone().enumerate() {
                    j[(row, poses.start + p)] = (plus[k] - minus[k]) / (2.0 * h);
                }
            }
        }

        j
    }
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for PlanarProblem<'_> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, x: &DVector<f64>) {
        self.params.clone_from(x);
    }

    fn params(&self) -> DVector<f64> {
        self.params.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        Some(self.residual_vector())
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        Some(self.jacobian_matrix())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use levenberg_marquardt::LevenbergMarquardt;

    fn truth() -> CameraModel {
        CameraModel::new(
            CameraMatrix::new(700.0, 690.0, 318.0, 243.0),
            Distortion {
                k1: -0.1,
                k2: 0.03,
                ..Distortion::default()
            },
        )
    }

    fn poses() -> Vec<Pose> {
        [(0.3, -0.2, 0.1), (-0.25, 0.3, -0.05), (0.1, 0.35, 0.2), (-0.3, -0.25, 0.0)]
            .iter()
            .map(|&(rx, ry, rz)| {
                let r = Rotation3::from_euler_angles(rx, ry, rz);
                Pose::from_rotation(&r, Vector3::new(-120.0, -90.0, 450.0))
            })
            .collect()
    }

    fn views(model: &CameraModel, poses: &[Pose]) -> Vec<View> {
        let object: Vec<Point3<f64>> = (0..7)
            .flat_map(|y| (0..9).map(move |x| Point3::new(x as f64 * 30.0, y as f64 * 30.0, 0.0)))
            .collect();
        poses
            .iter()
            .map(|pose| View {
                image: object.iter().map(|p| model.project(pose, p).unwrap()).collect(),
                object: object.clone(),
            })
            .collect()
    }

    #[test]
    fn held_coefficients_are_not_parameters() {
        let model = truth();
        let poses = poses();
        let views = views(&model, &poses);
        let mut free = [true; N_INTRINSICS];
        free[6] = false;
        free[7] = false;
        let problem = PlanarProblem::new(&views, &model, &poses, free);
        assert_eq!(problem.params().len(), 7 + N_POSE * 4);
        assert_eq!(problem.model(), model);
        assert!(problem.residual_vector().amax() < 1e-9);
    }

    #[test]
    fn jacobian_is_block_sparse_and_matches_differences() {
        let model = truth();
        let poses = poses();
        let views = views(&model, &poses);
        let problem = PlanarProblem::new(&views, &model, &poses, [true; N_INTRINSICS]);
        let j = problem.jacobian_matrix();
        assert_eq!(j.shape(), (2 * 63 * 4, N_INTRINSICS + N_POSE * 4));

        // View 1 rows do not see the pose of view 2.
        let rows = problem.rows(1);
        let cols = problem.pose_range(2);
        assert_eq!(j.view((rows.start, cols.start), (rows.len(), N_POSE)).amax(), 0.0);

        // Spot-check a column against a forward difference of the full vector.
        let col = problem.pose_range(3).start + 4;
        let r0 = problem.residual_vector();
        let mut moved = PlanarProblem::new(&views, &model, &poses, [true; N_INTRINSICS]);
        let mut x = moved.params();
        x[col] += 1e-4;
        moved.set_params(&x);
        let fd = (moved.residual_vector() - r0) / 1e-4;
        approx::assert_relative_eq!(j.column(col).into_owned(), fd, epsilon = 1e-3);
    }

    #[test]
    fn recovers_a_perturbed_start() {
        let model = truth();
        let poses = poses();
        let views = views(&model, &poses);

        let mut start = model;
        start.matrix.fx *= 1.03;
        start.matrix.cy -= 6.0;
        start.distortion = Distortion::default();
        let start_poses: Vec<Pose> = poses
            .iter()
            .map(|p| Pose::new(p.rotation * 0.97, p.translation + Vector3::new(3.0, -2.0, 10.0)))
            .collect();

        // k1 and k2 free; tangential terms and k3 held at zero.
        let mut free = [true; N_INTRINSICS];
        free[6..].fill(false);
        let problem = PlanarProblem::new(&views, &start, &start_poses, free);
        let lm: LevenbergMarquardt<f64> = LevenbergMarquardt::new();
        let (problem, report) = lm.minimize(problem);
        assert!(report.termination.was_successful(), "{:?}", report.termination);
        assert!(report.number_of_evaluations > 0);

        let found = problem.model();
        approx::assert_relative_eq!(found.matrix.fx, 700.0, max_relative = 1e-4);
        approx::assert_relative_eq!(found.matrix.cy, 243.0, epsilon = 0.05);
        approx::assert_relative_eq!(found.distortion.k1, -0.1, epsilon = 1e-3);
        assert_eq!(found.distortion.p1, 0.0);
        assert!(problem.residual_vector().amax() < 1e-4);
    }
}
