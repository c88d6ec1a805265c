//! Pinhole camera with Brown-Conrady distortion (OpenCV coefficient order).

use nalgebra::{Matrix3, Point2, Point3, Rotation3, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Intrinsic matrix without skew.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraMatrix {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl CameraMatrix {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self { fx, fy, cx, cy }
    }

    /// `[[fx, 0, cx], [0, fy, cy], [0, 0, 1]]`
    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0)
    }

    /// Normalized image coordinates to pixels.
    #[inline]
    pub fn to_pixel(&self, n: Point2<f64>) -> Point2<f64> {
        Point2::new(self.fx * n.x + self.cx, self.fy * n.y + self.cy)
    }

    /// Pixels to normalized image coordinates.
    #[inline]
    pub fn to_normalized(&self, p: Point2<f64>) -> Point2<f64> {
        Point2::new((p.x - self.cx) / self.fx, (p.y - self.cy) / self.fy)
    }

    pub fn is_finite(&self) -> bool {
        [self.fx, self.fy, self.cx, self.cy].iter().all(|v| v.is_finite())
    }
}

/// Radial (`k1`, `k2`, `k3`) and tangential (`p1`, `p2`) coefficients.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Distortion {
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64,
}

impl Distortion {
    /// Number of undistortion fixed-point iterations.
    const UNDISTORT_ITERS: usize = 20;

    /// `[k1, k2, p1, p2, k3]`
    pub fn coefficients(&self) -> [f64; 5] {
        [self.k1, self.k2, self.p1, self.p2, self.k3]
    }

    pub fn from_coefficients(c: [f64; 5]) -> Self {
        Self {
            k1: c[0],
            k2: c[1],
            p1: c[2],
            p2: c[3],
            k3: c[4],
        }
    }

    pub fn is_finite(&self) -> bool {
        self.coefficients().iter().all(|v| v.is_finite())
    }

    /// Apply distortion to normalized coordinates.
    #[inline]
    pub fn distort(&self, n: Point2<f64>) -> Point2<f64> {
        let (x, y) = (n.x, n.y);
        let r2 = x * x + y * y;
        let radial = 1.0 + r2 * (self.k1 + r2 * (self.k2 + r2 * self.k3));
        let xy = x * y;
        let dx = 2.0 * self.p1 * xy + self.p2 * (r2 + 2.0 * x * x);
        let dy = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * xy;
        Point2::new(x * radial + dx, y * radial + dy)
    }

    /// Invert [`Distortion::distort`] by fixed-point iteration.
    pub fn undistort(&self, d: Point2<f64>) -> Point2<f64> {
        let (mut x, mut y) = (d.x, d.y);
        for _ in 0..Self::UNDISTORT_ITERS {
            let r2 = x * x + y * y;
            let radial = 1.0 + r2 * (self.k1 + r2 * (self.k2 + r2 * self.k3));
            if radial.abs() < 1e-12 {
                break;
            }
            let dx = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
            let dy = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
            x = (d.x - dx) / radial;
            y = (d.y - dy) / radial;
        }
        Point2::new(x, y)
    }
}

/// Board-to-camera transform; `rotation` is a Rodrigues vector.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub rotation: Vector3<f64>,
    pub translation: Vector3<f64>,
}

impl Pose {
    pub fn new(rotation: Vector3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    pub fn from_rotation(r: &Rotation3<f64>, translation: Vector3<f64>) -> Self {
        Self::new(r.scaled_axis(), translation)
    }

    pub fn rotation_matrix(&self) -> Rotation3<f64> {
        Rotation3::new(self.rotation)
    }

    #[inline]
    pub fn transform(&self, p: &Point3<f64>) -> Point3<f64> {
        self.rotation_matrix() * p + self.translation
    }
}

/// Intrinsics plus distortion.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraModel {
    pub matrix: CameraMatrix,
    pub distortion: Distortion,
}

impl CameraModel {
    pub fn new(matrix: CameraMatrix, distortion: Distortion) -> Self {
        Self { matrix, distortion }
    }

    /// Pixel position of a camera-frame point; `None` behind the camera.
    #[inline]
    pub fn project_camera_point(&self, pc: &Point3<f64>) -> Option<Point2<f64>> {
        if pc.z <= 1e-12 {
            return None;
        }
        let n = Point2::new(pc.x / pc.z, pc.y / pc.z);
        Some(self.matrix.to_pixel(self.distortion.distort(n)))
    }

    /// Pixel position of a board point seen from `pose`.
    pub fn project(&self, pose: &Pose, p: &Point3<f64>) -> Option<Point2<f64>> {
        self.project_camera_point(&pose.transform(p))
    }

    /// Undistorted normalized coordinates of a distorted pixel.
    pub fn undistort_pixel(&self, p: Point2<f64>) -> Point2<f64> {
        self.distortion.undistort(self.matrix.to_normalized(p))
    }

    pub fn is_finite(&self) -> bool {
        self.matrix.is_finite() && self.distortion.is_finite()
    }
}

impl fmt::Display for CameraModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.matrix;
        writeln!(f, "camera matrix:")?;
        writeln!(f, "[[{:12.6}, {:12.6}, {:12.6}],", m.fx, 0.0, m.cx)?;
        writeln!(f, " [{:12.6}, {:12.6}, {:12.6}],", 0.0, m.fy, m.cy)?;
        writeln!(f, " [{:12.6}, {:12.6}, {:12.6}]]", 0.0, 0.0, 1.0)?;
        let d = self.distortion.coefficients();
        write!(
            f,
            "distortion: [{:.8}, {:.8}, {:.8}, {:.8}, {:.8}]",
            d[0], d[1], d[2], d[3], d[4]
        )
    }
}
