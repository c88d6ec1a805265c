//! Calibration results as written to and read from disk.

use std::fmt;
use std::fs;
use std::path::Path;

use dotgrid_core::PatternSpec;
use dotgrid_solver::{Calibration, CameraMatrix, CameraModel, Distortion, Pose};
use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug)]
pub enum ReportError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Calibration of the reference Basler rig, used for distortion previews
/// when no report is at hand.
pub fn reference_camera() -> CameraModel {
    CameraModel::new(
        CameraMatrix::new(2828.79001, 2837.77321, 1092.41918, 979.090977),
        Distortion {
            k1: -0.14865853,
            k2: 0.58814702,
            p1: -0.00104411,
            p2: -0.01651453,
            k3: -0.53782368,
        },
    )
}

/// Outcome of one calibration run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationReport {
    pub image_width: u32,
    pub image_height: u32,
    pub pattern: PatternSpec,
    pub samples: usize,
    pub camera: CameraModel,
    /// RMS reprojection error over all points, in pixels.
    pub rms: f64,
    pub per_view_rms: Vec<f64>,
    /// Board pose of every sample (Rodrigues vector and translation).
    pub poses: Vec<Pose>,
    pub iterations: usize,
    pub converged: bool,
}

impl CalibrationReport {
    pub fn new(calibration: Calibration, image_size: (u32, u32), pattern: PatternSpec) -> Self {
        Self {
            image_width: image_size.0,
            image_height: image_size.1,
            pattern,
            samples: calibration.poses.len(),
            camera: calibration.model,
            rms: calibration.rms,
            per_view_rms: calibration.per_view_rms,
            poses: calibration.poses,
            iterations: calibration.iterations,
            converged: calibration.converged,
        }
    }

    /// Load a report from JSON on disk.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, ReportError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Write this report to disk as pretty JSON.
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), ReportError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

impl fmt::Display for CalibrationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} samples of {}x{} frames, rms {:.4} px",
            self.samples, self.image_width, self.image_height, self.rms
        )?;
        write!(f, "{}", self.camera)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Point2, Vector3};

    fn report() -> CalibrationReport {
        CalibrationReport {
            image_width: 640,
            image_height: 480,
            pattern: PatternSpec::default(),
            samples: 1,
            camera: CameraModel::new(
                CameraMatrix::new(812.5, 809.25, 321.0, 238.5),
                Distortion {
                    k1: -0.1,
                    ..Distortion::default()
                },
            ),
            rms: 0.125,
            per_view_rms: vec![0.125],
            poses: vec![Pose::new(Vector3::new(0.1, -0.2, 0.05), Vector3::new(-100.0, -70.0, 600.0))],
            iterations: 7,
            converged: true,
        }
    }

    #[test]
    fn json_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let report = report();
        report.write_json(&path).unwrap();
        assert_eq!(CalibrationReport::load_json(&path).unwrap(), report);
    }

    #[test]
    fn display_prints_matrix_and_coefficients() {
        let text = report().to_string();
        assert!(text.starts_with("1 samples of 640x480 frames, rms 0.1250 px"));
        assert!(text.contains("camera matrix"));
        assert!(text.contains("distortion"));
    }

    #[test]
    fn reference_camera_undistorts_its_own_distortion() {
        let camera = reference_camera();
        assert!(camera.is_finite());
        assert!((camera.matrix.fx - 2828.79).abs() < 0.01);
        assert!((camera.distortion.k3 + 0.5378).abs() < 1e-4);

        // Near the top-left corner of the sensor.
        let corner = Point2::new(50.0, 60.0);
        let n = camera.undistort_pixel(corner);
        let back = camera.matrix.to_pixel(camera.distortion.distort(n));
        assert!((back - corner).norm() < 1e-3, "{back:?}");
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = CalibrationReport::load_json(dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, ReportError::Io(_)));
    }
}
