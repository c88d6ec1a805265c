//! Iterative sub-pixel refinement of dot centres.
//!
//! On the edge of a dark dot the image gradient points along the line
//! through the dot centre. For a window around the current estimate `q`
//! the refined centre is the point closest (in the least-squares sense) to
//! all those gradient lines:
//!
//! `sum(|g|^2 I - g g^T) q = sum((|g|^2 I - g g^T) p)`
//!
//! On a disk every edge line passes through the centre. On an ellipse the
//! lines of opposite edge points mirror each other through the centre, so
//! the least-squares point is still the centre once the window holds the
//! whole edge. The window is moved to the new estimate and the solve
//! repeated until the update is below `epsilon`.

use dotgrid_core::{sample_bilinear, GrayImageView};
use nalgebra::Point2;
use serde::{Deserialize, Serialize};

#[cfg(feature = "tracing")]
use tracing::instrument;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubPixParams {
    /// Window radius for a point without neighbours. Points of a grid use
    /// half the distance to their nearest neighbour instead, which holds
    /// the whole dot edge and none of the neighbouring dots.
    pub half_window: usize,
    /// Radius of the central dead zone excluded from the sums, if any.
    pub zero_zone: Option<usize>,
    pub max_iters: usize,
    /// Stop once the update moves the point by less than this (pixels).
    pub epsilon: f32,
}

impl Default for SubPixParams {
    fn default() -> Self {
        Self {
            half_window: 11,
            zero_zone: None,
            max_iters: 30,
            epsilon: 0.001,
        }
    }
}

/// Pixel offsets inside a disk of `radius`, minus the dead zone.
fn window_offsets(radius: f64, zero_zone: Option<usize>) -> Vec<(f64, f64)> {
    let r = radius.floor() as i32;
    let dead = zero_zone.map_or(-1.0, |z| z as f64);
    let mut offsets = Vec::new();
    for dy in -r..=r {
        for dx in -r..=r {
            let (x, y) = (dx as f64, dy as f64);
            let d2 = x * x + y * y;
            if d2 > radius * radius || (x.abs() <= dead && y.abs() <= dead) {
                continue;
            }
            offsets.push((x, y));
        }
    }
    offsets
}

/// Distance from every point to its nearest other point.
fn nearest_distances(points: &[Point2<f32>]) -> Vec<Option<f64>> {
    points
        .iter()
        .enumerate()
        .map(|(i, p)| {
            points
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, q)| ((p.x - q.x) as f64).hypot((p.y - q.y) as f64))
                .filter(|d| *d > 0.0)
                .min_by(|a, b| a.total_cmp(b))
        })
        .collect()
}

fn refine_one(img: &GrayImageView<'_>, start: Point2<f32>, radius: f64, params: &SubPixParams) -> Point2<f32> {
    let offsets = window_offsets(radius, params.zero_zone);
    let eps2 = (params.epsilon as f64).powi(2);
    let mut c = Point2::new(start.x as f64, start.y as f64);

    for _ in 0..params.max_iters.max(1) {
        let (mut a, mut b, mut d, mut r1, mut r2) = (0.0, 0.0, 0.0, 0.0, 0.0);
        for &(px, py) in &offsets {
            let x = (c.x + px) as f32;
            let y = (c.y + py) as f32;
            let gx = 0.5 * (sample_bilinear(img, x + 1.0, y) - sample_bilinear(img, x - 1.0, y)) as f64;
            let gy = 0.5 * (sample_bilinear(img, x, y + 1.0) - sample_bilinear(img, x, y - 1.0)) as f64;

            // |g|^2 I - g g^T
            let (mxx, mxy, myy) = (gy * gy, -gx * gy, gx * gx);
            a += mxx;
            b += mxy;
            d += myy;
            r1 += mxx * px + mxy * py;
            r2 += mxy * px + myy * py;
        }

        let det = a * d - b * b;
        let trace = a + d;
        if trace <= f64::EPSILON || det <= 1e-9 * trace * trace {
            break;
        }
        let dx = (d * r1 - b * r2) / det;
        let dy = (a * r2 - b * r1) / det;
        c = Point2::new(c.x + dx, c.y + dy);

        if !img.contains(c.x as f32, c.y as f32) {
            break;
        }
        if dx * dx + dy * dy <= eps2 {
            break;
        }
    }

    let moved = Point2::new(c.x as f32, c.y as f32);
    let shift = ((moved.x - start.x) as f64).hypot((moved.y - start.y) as f64);
    if !shift.is_finite() || shift > radius || !img.contains(moved.x, moved.y) {
        return start;
    }
    moved
}

/// Refine dot centres in place.
///
/// Points whose refinement leaves the search window or the image keep
/// their input position.
#[cfg_attr(feature = "tracing", instrument(level = "debug", skip(img, points, params), fields(points = points.len())))]
pub fn refine_centers(img: &GrayImageView<'_>, points: &mut [Point2<f32>], params: &SubPixParams) {
    if params.half_window == 0 || img.width == 0 || img.height == 0 {
        return;
    }
    let nearest = nearest_distances(points);
    for (p, nn) in points.iter_mut().zip(nearest) {
        let radius = nn.map_or(params.half_window as f64, |d| 0.5 * d);
        if radius < 2.0 {
            continue;
        }
        *p = refine_one(img, *p, radius, params);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dotgrid_core::GrayImage;

    fn render_disks(w: usize, h: usize, disks: &[(f32, f32)], r: f32) -> GrayImage {
        let mut img = GrayImage::filled(w, h, 230);
        for y in 0..h {
            for x in 0..w {
                let mut cover = 0.0f32;
                for sy in 0..5 {
                    for sx in 0..5 {
                        let px = x as f32 + (sx as f32 + 0.5) / 5.0 - 0.5;
                        let py = y as f32 + (sy as f32 + 0.5) / 5.0 - 0.5;
                        if disks.iter().any(|(cx, cy)| (px - cx).powi(2) + (py - cy).powi(2) <= r * r) {
                            cover += 1.0 / 25.0;
                        }
                    }
                }
                img.data[y * w + x] = (230.0 - 210.0 * cover).round() as u8;
            }
        }
        img
    }

    #[test]
    fn converges_to_dot_centre() {
        let img = render_disks(64, 64, &[(31.37, 29.62)], 7.0);
        for start in [Point2::new(32.5f32, 28.9), Point2::new(30.4, 30.3)] {
            let mut pts = [start];
            refine_centers(&img.view(), &mut pts, &SubPixParams::default());
            assert!((pts[0].x - 31.37).abs() < 0.05, "{:?}", pts[0]);
            assert!((pts[0].y - 29.62).abs() < 0.05, "{:?}", pts[0]);
        }
    }

    #[test]
    fn neighbouring_dots_do_not_pull() {
        // Two dots 22 px apart; each window stops halfway between them.
        let truth = [(30.3f32, 40.6f32), (52.1, 40.2)];
        let img = render_disks(84, 80, &truth, 6.0);
        let mut pts = [Point2::new(29.6f32, 41.2), Point2::new(52.8, 39.7)];
        refine_centers(&img.view(), &mut pts, &SubPixParams::default());
        for (p, (tx, ty)) in pts.iter().zip(truth) {
            assert!((p.x - tx).abs() < 0.05 && (p.y - ty).abs() < 0.05, "{p:?} vs ({tx}, {ty})");
        }
    }

    #[test]
    fn dot_larger_than_the_default_window_is_refined_in_a_grid() {
        // Radius 14 exceeds `half_window`; the neighbour 40 px away allows a ~19 px window.
        let truth = [(40.4f32, 40.7f32), (80.2, 40.3)];
        let img = render_disks(120, 80, &truth, 14.0);
        let mut pts = [Point2::new(41.1f32, 40.1), Point2::new(79.6, 41.0)];
        refine_centers(&img.view(), &mut pts, &SubPixParams::default());
        for (p, (tx, ty)) in pts.iter().zip(truth) {
            assert!((p.x - tx).abs() < 0.05 && (p.y - ty).abs() < 0.05, "{p:?} vs ({tx}, {ty})");
        }
    }

    #[test]
    fn flat_window_keeps_position() {
        let img = GrayImage::filled(40, 40, 128);
        let mut pts = [Point2::new(20.3f32, 17.8)];
        refine_centers(&img.view(), &mut pts, &SubPixParams::default());
        assert_eq!(pts[0], Point2::new(20.3, 17.8));
    }

    #[test]
    fn window_is_a_disk_without_the_dead_zone() {
        let full = window_offsets(3.0, None);
        assert!(full.contains(&(0.0, 0.0)));
        assert!(full.contains(&(3.0, 0.0)));
        assert!(!full.contains(&(3.0, 3.0)));

        let hollow = window_offsets(3.0, Some(1));
        assert!(!hollow.contains(&(0.0, 0.0)));
        assert!(!hollow.contains(&(1.0, -1.0)));
        assert!(hollow.contains(&(2.0, 0.0)));
        assert_eq!(full.len() - hollow.len(), 9);
    }
}
