//! Camera calibration from planar dot-grid observations.
//!
//! - [`calibrate_camera`]: closed-form initialisation from per-view
//!   homographies followed by Levenberg-Marquardt (`levenberg-marquardt`
//!   crate) over intrinsics, Brown-Conrady distortion and all board poses.
//! - [`optimal_new_camera_matrix`] and [`UndistortMap`]: undistorted output
//!   images with a chosen field of view.

mod calibrate;
mod init;
mod lm;
mod model;
mod optimal;
mod undistort;

pub use calibrate::{
    calibrate_camera, Calibration, CalibrationError, SolverParams, MIN_POINTS_PER_VIEW, MIN_VIEWS,
};
pub use model::{CameraMatrix, CameraModel, Distortion, Pose};
pub use optimal::{optimal_new_camera_matrix, Roi};
pub use undistort::UndistortMap;
