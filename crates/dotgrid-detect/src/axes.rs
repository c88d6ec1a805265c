//! Lattice axis estimation from neighbour edge directions.
//!
//! Edge angles are undirected (mod π). Two dominant directions are found
//! with a smoothed circular histogram and refined by circular 2-means with
//! outlier rejection.

use log::warn;
use serde::{Deserialize, Serialize};
use std::f32::consts::{FRAC_PI_2, PI};

/// Parameters for edge-direction clustering.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AxisClusteringParams {
    /// Number of histogram bins on [0, π).
    pub num_bins: usize,
    /// Max 2-means iterations.
    pub max_iters: usize,
    /// Minimal separation between the two axes (degrees).
    pub min_separation_deg: f32,
    /// Edges farther than this from both centres are outliers (degrees).
    pub outlier_threshold_deg: f32,
}

impl Default for AxisClusteringParams {
    fn default() -> Self {
        Self {
            num_bins: 60, // 3° per bin
            max_iters: 10,
            min_separation_deg: 30.0,
            outlier_threshold_deg: 20.0,
        }
    }
}

/// Wrap an angle to [0, π).
pub(crate) fn wrap_angle_pi(theta: f32) -> f32 {
    let t = theta.rem_euclid(PI);
    if t >= PI {
        0.0
    } else {
        t
    }
}

/// Smallest angular distance on the circle with period π (result in [0, π/2]).
pub(crate) fn angular_dist_pi(a: f32, b: f32) -> f32 {
    let d = (a - b).rem_euclid(PI);
    if d > FRAC_PI_2 {
        PI - d
    } else {
        d
    }
}

fn angle_to_bin(theta: f32, num_bins: usize) -> usize {
    let x = wrap_angle_pi(theta) / PI * num_bins as f32;
    (x.floor() as usize).min(num_bins - 1)
}

fn smooth_circular(hist: &[f32]) -> Vec<f32> {
    const K: [f32; 5] = [1.0, 4.0, 6.0, 4.0, 1.0];
    let n = hist.len();
    (0..n)
        .map(|i| {
            K.iter()
                .enumerate()
                .map(|(k, w)| w * hist[(i + n + k - 2) % n])
                .sum::<f32>()
                / 16.0
        })
        .collect()
}

fn circular_mean_pi<'a>(angles: impl Iterator<Item = &'a f32>) -> Option<f32> {
    // Double-angle mean handles θ ≡ θ + π.
    let (sx, sy, n) = angles.fold((0.0f32, 0.0f32, 0usize), |(sx, sy, n), &t| {
        (sx + (2.0 * t).cos(), sy + (2.0 * t).sin(), n + 1)
    });
    if n == 0 || (sx * sx + sy * sy) < 1e-12 {
        return None;
    }
    Some(wrap_angle_pi(0.5 * sy.atan2(sx)))
}

/// Two dominant undirected directions among `angles`, if they exist.
pub fn cluster_axes(angles: &[f32], params: &AxisClusteringParams) -> Option<[f32; 2]> {
    if angles.len() < 4 || params.num_bins < 4 {
        warn!("{} edge angles, {} bins", angles.len(), params.num_bins);
        return None;
    }

    let mut hist = vec![0.0f32; params.num_bins];
    for &t in angles {
        hist[angle_to_bin(t, params.num_bins)] += 1.0;
    }
    let hist = smooth_circular(&hist);
    let bin_angle = |b: usize| (b as f32 + 0.5) * PI / params.num_bins as f32;

    let (b1, _) = hist
        .iter()
        .enumerate()
        .fold((0, f32::MIN), |best, (i, &v)| if v > best.1 { (i, v) } else { best });
    let phi1 = bin_angle(b1);
    let min_sep = params.min_separation_deg.to_radians();
    let (b2, w2) = hist
        .iter()
        .enumerate()
        .filter(|(i, _)| angular_dist_pi(bin_angle(*i), phi1) >= min_sep)
        .fold((0, 0.0f32), |best, (i, &v)| if v > best.1 { (i, v) } else { best });
    if w2 <= 0.0 {
        warn!("edge directions have a single dominant axis");
        return None;
    }

    let mut centers = [phi1, bin_angle(b2)];
    let outlier = params.outlier_threshold_deg.to_radians();
    let mut labels: Vec<Option<usize>> = vec![None; angles.len()];

    for _ in 0..params.max_iters {
        let mut changed = false;
        for (t, label) in angles.iter().zip(labels.iter_mut()) {
            let d0 = angular_dist_pi(*t, centers[0]);
            let d1 = angular_dist_pi(*t, centers[1]);
            let (best, dist) = if d0 <= d1 { (0, d0) } else { (1, d1) };
            let new_label = (dist <= outlier).then_some(best);
            if *label != new_label {
                *label = new_label;
                changed = true;
            }
        }

        for (c, center) in centers.iter_mut().enumerate() {
            let members = angles
                .iter()
                .zip(&labels)
                .filter(|(_, l)| **l == Some(c))
                .map(|(t, _)| t);
            if let Some(mean) = circular_mean_pi(members) {
                *center = mean;
            }
        }

        if !changed {
            break;
        }
    }

    if angular_dist_pi(centers[0], centers[1]) < min_sep {
        return None;
    }
    Some(centers)
}
