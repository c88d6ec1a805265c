//! Asymmetric circle-grid finder.
//!
//! 1. Build the diagonal neighbour graph over the keypoints.
//! 2. BFS the largest component into `(u, v)` axis steps.
//! 3. Map steps to lattice coordinates `a = u + v`, `b = u - v`.
//! 4. Pick the lattice symmetry that fits the pattern's extent and parity
//!    and keeps the board unmirrored in the image.
//! 5. Validate the ordering with a board-to-image homography.

use crate::blob::Keypoint;
use crate::grid_graph::{assign_grid_coordinates, connected_components, GridGraph, GridGraphParams};
use dotgrid_core::{estimate_homography, DotGridPattern};
use log::debug;
use nalgebra::{Matrix3, Point2, Vector3};
use serde::{Deserialize, Serialize};

#[cfg(feature = "tracing")]
use tracing::instrument;

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CircleGridParams {
    pub graph: GridGraphParams,
    /// Largest accepted homography residual relative to the median
    /// nearest-neighbour distance.
    pub max_residual_ratio: f32,
}

impl Default for CircleGridParams {
    fn default() -> Self {
        Self {
            graph: GridGraphParams::default(),
            max_residual_ratio: 0.3,
        }
    }
}

/// One of the eight axis-aligned symmetries of the lattice.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct LatticeSymmetry {
    swap: bool,
    flip_a: bool,
    flip_b: bool,
}

impl LatticeSymmetry {
    const ALL: [LatticeSymmetry; 8] = {
        let mut out = [LatticeSymmetry {
            swap: false,
            flip_a: false,
            flip_b: false,
        }; 8];
        let mut k = 0;
        while k < 8 {
            out[k] = LatticeSymmetry {
                swap: k & 4 != 0,
                flip_a: k & 1 != 0,
                flip_b: k & 2 != 0,
            };
            k += 1;
        }
        out
    };

    fn preserves_orientation(self) -> bool {
        !(self.swap ^ self.flip_a ^ self.flip_b)
    }

    /// Apply to coordinates already shifted to a zero minimum; `ext` is the
    /// extent after the optional swap.
    fn apply(self, (a, b): (i32, i32), ext: (i32, i32)) -> (i32, i32) {
        let (a, b) = if self.swap { (b, a) } else { (a, b) };
        let a = if self.flip_a { ext.0 - a } else { a };
        let b = if self.flip_b { ext.1 - b } else { b };
        (a, b)
    }
}

/// Determinant of the linear part of the least-squares affine map
/// `(a, b) -> image`.
fn affine_handedness(lattice: &[(i32, i32)], image: &[Point2<f32>]) -> Option<f64> {
    let mut ata = Matrix3::<f64>::zeros();
    let mut atx = Vector3::<f64>::zeros();
    let mut aty = Vector3::<f64>::zeros();
    for (&(a, b), p) in lattice.iter().zip(image) {
        let row = Vector3::new(a as f64, b as f64, 1.0);
        ata += row * row.transpose();
        atx += row * p.x as f64;
        aty += row * p.y as f64;
    }
    let chol = ata.cholesky()?;
    let mx = chol.solve(&atx);
    let my = chol.solve(&aty);
    Some(mx[0] * my[1] - mx[1] * my[0])
}

fn median(values: &mut [f32]) -> Option<f32> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    Some(values[values.len() / 2])
}

/// Locates the asymmetric dot grid among blob keypoints.
#[derive(Clone, Debug)]
pub struct CircleGridFinder {
    pattern: DotGridPattern,
    params: CircleGridParams,
}

impl CircleGridFinder {
    pub fn new(pattern: DotGridPattern, params: CircleGridParams) -> Self {
        Self { pattern, params }
    }

    pub fn pattern(&self) -> &DotGridPattern {
        &self.pattern
    }

    pub fn params(&self) -> &CircleGridParams {
        &self.params
    }

    /// Image positions of all pattern dots in pattern order, or `None` when
    /// the complete grid is not visible.
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(self, keypoints), fields(keypoints = keypoints.len())))]
    pub fn find(&self, keypoints: &[Keypoint]) -> Option<Vec<Point2<f32>>> {
        let expected = self.pattern.len();
        if keypoints.len() < expected {
            debug!("{} keypoints, need {}", keypoints.len(), expected);
            return None;
        }

        let points: Vec<Point2<f32>> = keypoints.iter().map(|k| k.position).collect();
        let graph = GridGraph::new(&points, &self.params.graph)?;

        let component = connected_components(&graph)
            .into_iter()
            .max_by_key(|c| c.len())?;
        if component.len() != expected {
            debug!("largest component has {} dots, need {}", component.len(), expected);
            return None;
        }

        let coords = assign_grid_coordinates(&graph, &component)?;
        let nodes: Vec<usize> = coords.iter().map(|c| c.0).collect();
        let image: Vec<Point2<f32>> = nodes.iter().map(|&n| points[n]).collect();

        let raw: Vec<(i32, i32)> = coords.iter().map(|&(_, u, v)| (u + v, u - v)).collect();
        let min_a = raw.iter().map(|c| c.0).min()?;
        let min_b = raw.iter().map(|c| c.1).min()?;
        let shifted: Vec<(i32, i32)> = raw.iter().map(|&(a, b)| (a - min_a, b - min_b)).collect();
        let ext = (
            shifted.iter().map(|c| c.0).max()?,
            shifted.iter().map(|c| c.1).max()?,
        );

        let det = affine_handedness(&shifted, &image)?;
        let target_ext = self.pattern.lattice_extent();

        let mut ordered: Option<Vec<Point2<f32>>> = None;
        for sym in LatticeSymmetry::ALL {
            let sym_ext = if sym.swap { (ext.1, ext.0) } else { ext };
            if sym_ext != target_ext {
                continue;
            }
            // Image y points down, so an unmirrored board has a positive determinant.
            let signed = if sym.preserves_orientation() { det } else { -det };
            if signed <= 0.0 {
                continue;
            }

            let mut out = vec![Point2::origin(); expected];
            let mut filled = vec![false; expected];
            let fits = shifted.iter().zip(&image).all(|(&c, p)| {
                let (a, b) = sym.apply(c, sym_ext);
                match self.pattern.index_of_lattice(a, b) {
                    Some(idx) if !filled[idx] => {
                        filled[idx] = true;
                        out[idx] = *p;
                        true
                    }
                    _ => false,
                }
            });
            if fits {
                // Even column counts admit a second fit (180° turn); the first in
                // `ALL` order wins.
                ordered = Some(out);
                break;
            }
        }
        let ordered = ordered?;

        let mut nn: Vec<f32> = graph
            .neighbors
            .iter()
            .filter_map(|l| l.iter().map(|n| n.distance).reduce(f32::min))
            .collect();
        let spacing = median(&mut nn)?;

        let board = self.pattern.plane_points();
        let dst: Vec<Point2<f64>> = ordered
            .iter()
            .map(|p| Point2::new(p.x as f64, p.y as f64))
            .collect();
        let h = estimate_homography(&board, &dst).ok()?;
        let residual = h.max_transfer_error(&board, &dst);
        if residual > (self.params.max_residual_ratio * spacing) as f64 {
            debug!("grid homography residual {residual:.2}px exceeds limit");
            return None;
        }

        Some(ordered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dotgrid_core::{Homography, PatternSpec};

    fn keypoints_through(h: &Homography, pattern: &DotGridPattern) -> Vec<Keypoint> {
        pattern
            .plane_points()
            .iter()
            .map(|p| {
                let q = h.apply(*p);
                Keypoint {
                    position: Point2::new(q.x as f32, q.y as f32),
                    size: 10.0,
                    hits: 5,
                }
            })
            .collect()
    }

    fn finder() -> CircleGridFinder {
        let pattern = DotGridPattern::new(PatternSpec::default()).unwrap();
        CircleGridFinder::new(pattern, CircleGridParams::default())
    }

    fn assert_ordered(found: &[Point2<f32>], expected: &[Keypoint]) {
        assert_eq!(found.len(), expected.len());
        for (f, e) in found.iter().zip(expected) {
            assert!((f - e.position).norm() < 1e-3, "{f:?} vs {:?}", e.position);
        }
    }

    #[test]
    fn orders_perspective_grid_regardless_of_input_order() {
        let finder = finder();
        let h = Homography::new(Matrix3::new(
            1.6, 0.1, 120.0, //
            -0.1, 1.6, 90.0, //
            0.0003, 0.0004, 1.0,
        ));
        let truth = keypoints_through(&h, finder.pattern());
        let mut shuffled = truth.clone();
        shuffled.reverse();
        shuffled.swap(3, 17);
        shuffled.swap(40, 8);

        let found = finder.find(&shuffled).expect("grid");
        assert_ordered(&found, &truth);
    }

    #[test]
    fn rotated_board_keeps_pattern_order() {
        let finder = finder();
        // Board turned by 180 degrees in the image.
        let h = Homography::new(Matrix3::new(
            -2.0, 0.0, 520.0, //
            0.0, -2.0, 400.0, //
            0.0, 0.0, 1.0,
        ));
        let truth = keypoints_through(&h, finder.pattern());
        let found = finder.find(&truth).expect("grid");
        assert_ordered(&found, &truth);

        // Board turned by 90 degrees.
        let h = Homography::new(Matrix3::new(
            0.0, -2.0, 400.0, //
            2.0, 0.0, 50.0, //
            0.0, 0.0, 1.0,
        ));
        let truth = keypoints_through(&h, finder.pattern());
        let found = finder.find(&truth).expect("grid");
        assert_ordered(&found, &truth);
    }

    #[test]
    fn ignores_clutter_far_from_the_board() {
        let finder = finder();
        let h = Homography::new(Matrix3::new(2.0, 0.0, 100.0, 0.0, 2.0, 60.0, 0.0, 0.0, 1.0));
        let truth = keypoints_through(&h, finder.pattern());
        let mut input = truth.clone();
        input.push(Keypoint {
            position: Point2::new(600.0, 20.0),
            size: 10.0,
            hits: 3,
        });
        input.push(Keypoint {
            position: Point2::new(15.0, 470.0),
            size: 10.0,
            hits: 3,
        });
        let found = finder.find(&input).expect("grid");
        assert_ordered(&found, &truth);
    }

    #[test]
    fn incomplete_grid_is_a_miss() {
        let finder = finder();
        let h = Homography::new(Matrix3::new(2.0, 0.0, 100.0, 0.0, 2.0, 60.0, 0.0, 0.0, 1.0));
        let mut kps = keypoints_through(&h, finder.pattern());
        kps.remove(20);
        assert!(finder.find(&kps).is_none());
        assert!(finder.find(&[]).is_none());
    }

    #[test]
    fn mirrored_board_comes_back_in_mirror_order() {
        let finder = finder();
        // x -> -x mirrors the board; the only unmirrored reading is the
        // layout flipped along its columns.
        let h = Homography::new(Matrix3::new(-2.0, 0.0, 500.0, 0.0, 2.0, 60.0, 0.0, 0.0, 1.0));
        let kps = keypoints_through(&h, finder.pattern());
        let found = finder.find(&kps).expect("grid");
        assert!((found[0] - kps[40].position).norm() < 1e-3);
        assert!((found[40] - kps[0].position).norm() < 1e-3);
    }

    #[test]
    fn symmetries_cover_orientation_classes() {
        let proper = LatticeSymmetry::ALL
            .iter()
            .filter(|s| s.preserves_orientation())
            .count();
        assert_eq!(proper, 4);
        let s = LatticeSymmetry {
            swap: true,
            flip_a: true,
            flip_b: false,
        };
        assert_eq!(s.apply((1, 2), (10, 7)), (8, 1));
    }
}
