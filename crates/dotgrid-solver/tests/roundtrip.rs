use std::sync::Arc;
use std::time::Duration;

use dotgrid_core::{DotGridPattern, PatternSpec, SamplePair};
use dotgrid_solver::{calibrate_camera, CameraMatrix, CameraModel, Distortion, Pose, SolverParams};
use nalgebra::{Point2, Point3, Rotation3, Vector3};

fn truth() -> CameraModel {
    CameraModel::new(
        CameraMatrix::new(800.0, 795.0, 322.0, 241.0),
        Distortion {
            k1: -0.12,
            k2: 0.06,
            p1: 0.0008,
            p2: -0.0005,
            k3: 0.0,
        },
    )
}

/// Twenty board poses with the centre around 600 mm in front of the camera.
fn poses() -> Vec<Pose> {
    let centre = Vector3::new(100.0, 70.0, 0.0);
    (0..20)
        .map(|i| {
            let f = i as f64;
            let rx = 0.4 * (0.7 * f).sin();
            let ry = 0.4 * (1.3 * f + 0.5).cos();
            let rz = 0.15 * (0.9 * f).sin();
            let r = Rotation3::from_euler_angles(rx, ry, rz);
            let offset = Vector3::new(60.0 * (0.5 * f).cos(), 45.0 * (0.8 * f).sin(), 560.0 + 8.0 * f);
            Pose::from_rotation(&r, offset - r * centre)
        })
        .collect()
}

/// Deterministic noise in [-amp, amp].
fn noise(seed: &mut u64, amp: f64) -> f64 {
    *seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    let unit = (*seed >> 11) as f64 / (1u64 << 53) as f64;
    (2.0 * unit - 1.0) * amp
}

fn samples(model: &CameraModel, noise_amp: f64) -> Vec<SamplePair> {
    let pattern = DotGridPattern::new(PatternSpec::default()).unwrap();
    let object = pattern.object_points();
    let mut seed = 42u64;
    poses()
        .iter()
        .enumerate()
        .map(|(i, pose)| {
            let image = object
                .iter()
                .map(|p| {
                    let q = model
                        .project(pose, &Point3::new(p.x as f64, p.y as f64, p.z as f64))
                        .expect("board in front of the camera");
                    assert!(q.x > 0.0 && q.x < 640.0 && q.y > 0.0 && q.y < 480.0, "view {i}: {q:?}");
                    Point2::new(
                        (q.x + noise(&mut seed, noise_amp)) as f32,
                        (q.y + noise(&mut seed, noise_amp)) as f32,
                    )
                })
                .collect();
            SamplePair {
                object: Arc::clone(&object),
                image,
                timestamp: Duration::from_secs(2 * i as u64),
            }
        })
        .collect()
}

#[test]
fn recovers_intrinsics_from_clean_views() {
    let truth = truth();
    let calib = calibrate_camera(&samples(&truth, 0.0), 640, 480, &SolverParams::default()).expect("calibration");

    let k = calib.model.matrix;
    assert!((k.fx - 800.0).abs() / 800.0 < 1e-3, "{k:?}");
    assert!((k.fy - 795.0).abs() / 795.0 < 1e-3, "{k:?}");
    assert!((k.cx - 322.0).abs() < 0.5, "{k:?}");
    assert!((k.cy - 241.0).abs() < 0.5, "{k:?}");
    let d = calib.model.distortion;
    assert!((d.k1 + 0.12).abs() < 5e-3, "{d:?}");
    assert!((d.p1 - 0.0008).abs() < 5e-4, "{d:?}");

    // Points are stored as f32, so a residual of a few thousandths remains.
    assert!(calib.rms < 0.01, "rms {}", calib.rms);
    assert_eq!(calib.per_view_rms.len(), 20);
    assert_eq!(calib.poses.len(), 20);

    let first = poses()[0];
    assert!((calib.poses[0].translation - first.translation).norm() < 1.0);
}

#[test]
fn tolerates_pixel_noise() {
    let truth = truth();
    let calib = calibrate_camera(&samples(&truth, 0.1), 640, 480, &SolverParams::default()).expect("calibration");

    let k = calib.model.matrix;
    assert!((k.fx - 800.0).abs() / 800.0 < 0.01, "{k:?}");
    assert!((k.fy - 795.0).abs() / 795.0 < 0.01, "{k:?}");
    assert!((k.cx - 322.0).abs() < 5.0, "{k:?}");
    assert!((k.cy - 241.0).abs() < 5.0, "{k:?}");
    assert!(calib.rms > 0.01 && calib.rms < 0.1, "rms {}", calib.rms);
}

#[test]
fn fixed_coefficients_stay_zero() {
    let truth = truth();
    let params = SolverParams {
        fix_k3: true,
        zero_tangential: true,
        ..SolverParams::default()
    };
    let calib = calibrate_camera(&samples(&truth, 0.0), 640, 480, &params).expect("calibration");
    assert_eq!(calib.model.distortion.k3, 0.0);
    assert_eq!(calib.model.distortion.p1, 0.0);
    assert_eq!(calib.model.distortion.p2, 0.0);
    // The small true tangential terms leave a visible residual.
    assert!(calib.rms < 1.0, "rms {}", calib.rms);
}
