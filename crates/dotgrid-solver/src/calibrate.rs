use crate::init::{centered_intrinsics, pose_from_homography, zhang_intrinsics};
use crate::lm::{PlanarProblem, View, N_INTRINSICS};
use crate::model::{CameraMatrix, CameraModel, Distortion, Pose};
use dotgrid_core::{estimate_homography, HomographyError, SamplePair};
use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use log::{debug, info, warn};
use nalgebra::{Point2, Point3};
use serde::{Deserialize, Serialize};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Minimum number of views.
pub const MIN_VIEWS: usize = 3;
/// Minimum number of correspondences per view.
pub const MIN_POINTS_PER_VIEW: usize = 6;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("need at least {need} views, got {got}")]
    TooFewViews { got: usize, need: usize },
    #[error("view {view}: {object} object points but {image} image points")]
    ViewSizeMismatch {
        view: usize,
        object: usize,
        image: usize,
    },
    #[error("view {view}: need at least {need} points, got {got}")]
    TooFewPoints { view: usize, got: usize, need: usize },
    #[error("view {view}: object points are not on the z = 0 plane")]
    NonPlanar { view: usize },
    #[error("view {view}: degenerate homography")]
    DegenerateView {
        view: usize,
        #[source]
        source: HomographyError,
    },
    #[error("could not initialise the intrinsic matrix")]
    DegenerateIntrinsics,
    #[error("optimisation produced a non-finite result")]
    NonFinite,
}

/// Solver options, passed through to [`LevenbergMarquardt`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverParams {
    /// Budget of `patience * (n + 1)` residual evaluations for `n`
    /// parameters.
    pub patience: usize,
    /// Relative reduction of the cost below which the refinement stops.
    pub ftol: f64,
    /// Relative step size below which the refinement stops.
    pub xtol: f64,
    /// Cosine between residuals and Jacobian columns below which the
    /// refinement stops.
    pub gtol: f64,
    /// Keep `k3` at zero.
    pub fix_k3: bool,
    /// Keep `p1` and `p2` at zero.
    pub zero_tangential: bool,
}

impl Default for SolverParams {
    fn default() -> Self {
        Self {
            patience: 100,
            ftol: 1e-12,
            xtol: 1e-12,
            gtol: 1e-12,
            fix_k3: false,
            zero_tangential: false,
        }
    }
}

/// Result of a calibration run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub model: CameraModel,
    /// Root mean square reprojection error over all points (pixels).
    pub rms: f64,
    pub per_view_rms: Vec<f64>,
    /// Board pose of each view.
    pub poses: Vec<Pose>,
    /// Residual evaluations spent by the optimiser.
    pub iterations: usize,
    /// The optimiser stopped on a tolerance rather than on its budget or a
    /// numerical failure.
    pub converged: bool,
}

fn validate(samples: &[SamplePair]) -> Result<Vec<View>, CalibrationError> {
    if samples.len() < MIN_VIEWS {
        return Err(CalibrationError::TooFewViews {
            got: samples.len(),
            need: MIN_VIEWS,
        });
    }

    samples
        .iter()
        .enumerate()
        .map(|(view, s)| {
            if s.object.len() != s.image.len() {
                return Err(CalibrationError::ViewSizeMismatch {
                    view,
                    object: s.object.len(),
                    image: s.image.len(),
                });
            }
            if s.object.len() < MIN_POINTS_PER_VIEW {
                return Err(CalibrationError::TooFewPoints {
                    view,
                    got: s.object.len(),
                    need: MIN_POINTS_PER_VIEW,
                });
            }
            if s.object.iter().any(|p| p.z.abs() > 1e-6) {
                return Err(CalibrationError::NonPlanar { view });
            }
            Ok(View {
                object: s
                    .object
                    .iter()
                    .map(|p| Point3::new(p.x as f64, p.y as f64, 0.0))
                    .collect(),
                image: s
                    .image
                    .iter()
                    .map(|p| Point2::new(p.x as f64, p.y as f64))
                    .collect(),
            })
        })
        .collect()
}

fn plausible(k: &CameraMatrix, width: u32, height: u32) -> bool {
    k.fx > 0.0
        && k.fy > 0.0
        && k.cx > 0.0
        && k.cy > 0.0
        && k.cx < width as f64
        && k.cy < height as f64
        && (k.fx / k.fy) > 0.2
        && (k.fx / k.fy) < 5.0
}

/// Estimate intrinsics and distortion from planar observations.
///
/// Every sample must hold the same number of object and image points, with
/// object points on the `z = 0` plane.
#[cfg_attr(feature = "tracing", instrument(level = "info", skip(samples, params), fields(views = samples.len())))]
pub fn calibrate_camera(
    samples: &[SamplePair],
    width: u32,
    height: u32,
    params: &SolverParams,
) -> Result<Calibration, CalibrationError> {
    let views = validate(samples)?;

    let homographies = views
        .iter()
        .enumerate()
        .map(|(view, v)| {
            let src: Vec<Point2<f64>> = v.object.iter().map(|p| Point2::new(p.x, p.y)).collect();
            estimate_homography(&src, &v.image)
                .map(|h| h.h)
                .map_err(|source| CalibrationError::DegenerateView { view, source })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let k0 = match zhang_intrinsics(&homographies) {
        Some(k) if plausible(&k, width, height) => k,
        other => {
            warn!("closed-form intrinsics rejected ({other:?}), using centred principal point");
            centered_intrinsics(&homographies, width, height)
                .filter(|k| plausible(k, width, height))
                .ok_or(CalibrationError::DegenerateIntrinsics)?
        }
    };
    debug!(
        "initial intrinsics fx={:.2} fy={:.2} cx={:.2} cy={:.2}",
        k0.fx, k0.fy, k0.cx, k0.cy
    );

    let poses0 = homographies
        .iter()
        .enumerate()
        .map(|(view, h)| {
            pose_from_homography(&k0, h).ok_or(CalibrationError::DegenerateView {
                view,
                source: HomographyError::Degenerate,
            })
        })
        .collect::<Result<Vec<Pose>, _>>()?;

    let mut free = [true; N_INTRINSICS];
    if params.zero_tangential {
        free[6] = false;
        free[7] = false;
    }
    if params.fix_k3 {
        free[8] = false;
    }

    let start = CameraModel::new(k0, Distortion::default());
    let problem = PlanarProblem::new(&views, &start, &poses0, free);
    let lm = LevenbergMarquardt::new()
        .with_ftol(params.ftol.max(0.0))
        .with_xtol(params.xtol.max(0.0))
        .with_gtol(params.gtol.max(0.0))
        .with_patience(params.patience.max(1));
    let (problem, report) = lm.minimize(problem);
    let converged = report.termination.was_successful();
    if !converged {
        warn!("refinement stopped early: {:?}", report.termination);
    }
    if problem.params().iter().any(|v| !v.is_finite()) {
        return Err(CalibrationError::NonFinite);
    }

    let model = problem.model();
    let poses = problem.poses();

    let residuals = problem.residual_vector();
    let mut total_sq = 0.0;
    let mut total_points = 0usize;
    let per_view_rms: Vec<f64> = views
        .iter()
        .enumerate()
        .map(|(vi, v)| {
            let rows = problem.rows(vi);
            let sq: f64 = residuals.rows(rows.start, rows.len()).norm_squared();
            total_sq += sq;
            total_points += v.object.len();
            (sq / v.object.len() as f64).sqrt()
        })
        .collect();
    let rms = (total_sq / total_points.max(1) as f64).sqrt();

    if !model.is_finite() || !rms.is_finite() {
        return Err(CalibrationError::NonFinite);
    }

    info!(
        "calibrated {} views: rms {:.4}px after {} evaluations (converged: {})",
        views.len(),
        rms,
        report.number_of_evaluations,
        converged
    );

    Ok(Calibration {
        model,
        rms,
        per_view_rms,
        poses,
        iterations: report.number_of_evaluations,
        converged,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Point3 as P3;
    use std::sync::Arc;
    use std::time::Duration;

    fn sample(object: Vec<P3<f32>>, image: Vec<nalgebra::Point2<f32>>) -> SamplePair {
        SamplePair {
            object: Arc::from(object),
            image,
            timestamp: Duration::ZERO,
        }
    }

    fn square(n: usize) -> Vec<P3<f32>> {
        (0..n).map(|i| P3::new((i % 3) as f32 * 10.0, (i / 3) as f32 * 10.0, 0.0)).collect()
    }

    #[test]
    fn rejects_too_few_views() {
        let s = sample(square(9), vec![nalgebra::Point2::new(0.0, 0.0); 9]);
        let err = calibrate_camera(&[s.clone(), s], 640, 480, &SolverParams::default()).unwrap_err();
        assert_eq!(err, CalibrationError::TooFewViews { got: 2, need: 3 });
    }

    #[test]
    fn rejects_malformed_views() {
        let good = sample(square(9), vec![nalgebra::Point2::new(0.0, 0.0); 9]);
        let short = sample(square(9), vec![nalgebra::Point2::new(0.0, 0.0); 8]);
        let err = calibrate_camera(&[good.clone(), short, good.clone()], 640, 480, &SolverParams::default())
            .unwrap_err();
        assert_eq!(
            err,
            CalibrationError::ViewSizeMismatch {
                view: 1,
                object: 9,
                image: 8
            }
        );

        let mut lifted = square(9);
        lifted[4].z = 5.0;
        let bent = sample(lifted, vec![nalgebra::Point2::new(0.0, 0.0); 9]);
        let err = calibrate_camera(&[good.clone(), good, bent], 640, 480, &SolverParams::default())
            .unwrap_err();
        assert_eq!(err, CalibrationError::NonPlanar { view: 2 });
    }

    #[test]
    fn params_deserialize_with_defaults() {
        let p: SolverParams = serde_json::from_str(r#"{"fix_k3": true}"#).unwrap();
        assert!(p.fix_k3);
        assert_eq!(p.patience, 100);
        assert_eq!(p.ftol, 1e-12);
    }
}
