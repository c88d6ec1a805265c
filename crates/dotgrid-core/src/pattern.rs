//! Asymmetric dot-grid layout.
//!
//! The board has `cols` columns of `rows` dots each. Odd columns are shifted
//! by one `spacing` along the column, so dot `(c, r)` sits at
//!
//! ```text
//! x = c * spacing
//! y = (2 * r + c % 2) * spacing
//! ```
//!
//! and carries the index `c * rows + r`. Nearest neighbours are the diagonal
//! dots at `sqrt(2) * spacing`, dots in the same column are `2 * spacing`
//! apart.

use std::sync::Arc;

use nalgebra::{Point2, Point3};
use serde::{Deserialize, Serialize};

/// Physical description of an asymmetric dot grid.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternSpec {
    /// Dots per column.
    pub rows: u32,
    /// Number of columns.
    pub cols: u32,
    /// Half of the distance between two dots of the same column (board units).
    pub spacing: f32,
    /// Dot diameter in the same units as `spacing`.
    pub dot_diameter: f32,
}

impl Default for PatternSpec {
    /// The 4x11 board printed on A4 with 20 mm steps and 15 mm dots.
    fn default() -> Self {
        Self {
            rows: 4,
            cols: 11,
            spacing: 20.0,
            dot_diameter: 15.0,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum PatternError {
    #[error("pattern needs at least 2 rows and 3 columns (got {rows}x{cols})")]
    InvalidSize { rows: u32, cols: u32 },
    #[error("spacing must be finite and > 0")]
    InvalidSpacing,
    #[error("dot diameter must be finite, > 0 and smaller than the diagonal dot distance")]
    InvalidDiameter,
}

/// Column/row address of one dot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GridIndex {
    pub col: u32,
    pub row: u32,
}

impl GridIndex {
    /// Lattice coordinates `(a, b)` in units of `spacing`; `a + b` is always even.
    pub fn lattice(self) -> (i32, i32) {
        let a = self.col as i32;
        let b = 2 * self.row as i32 + (self.col % 2) as i32;
        (a, b)
    }
}

/// Validated pattern with its object points computed once.
#[derive(Clone, Debug)]
pub struct DotGridPattern {
    spec: PatternSpec,
    object_points: Arc<[Point3<f32>]>,
}

impl DotGridPattern {
    pub fn new(spec: PatternSpec) -> Result<Self, PatternError> {
        if spec.rows < 2 || spec.cols < 3 {
            return Err(PatternError::InvalidSize {
                rows: spec.rows,
                cols: spec.cols,
            });
        }
        if !spec.spacing.is_finite() || spec.spacing <= 0.0 {
            return Err(PatternError::InvalidSpacing);
        }
        if !spec.dot_diameter.is_finite()
            || spec.dot_diameter <= 0.0
            || spec.dot_diameter >= spec.spacing * std::f32::consts::SQRT_2
        {
            return Err(PatternError::InvalidDiameter);
        }

        let object_points: Arc<[Point3<f32>]> = (0..spec.cols)
            .flat_map(|col| (0..spec.rows).map(move |row| GridIndex { col, row }))
            .map(|g| {
                let (a, b) = g.lattice();
                Point3::new(a as f32 * spec.spacing, b as f32 * spec.spacing, 0.0)
            })
            .collect();

        Ok(Self {
            spec,
            object_points,
        })
    }

    #[inline]
    pub fn spec(&self) -> PatternSpec {
        self.spec
    }

    #[inline]
    pub fn rows(&self) -> u32 {
        self.spec.rows
    }

    #[inline]
    pub fn cols(&self) -> u32 {
        self.spec.cols
    }

    /// Total number of dots (`rows * cols`).
    #[inline]
    pub fn len(&self) -> usize {
        (self.spec.rows * self.spec.cols) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shared handle to the ordered 3D reference points (z = 0).
    pub fn object_points(&self) -> Arc<[Point3<f32>]> {
        Arc::clone(&self.object_points)
    }

    /// Reference points projected to the board plane.
    pub fn plane_points(&self) -> Vec<Point2<f64>> {
        self.object_points
            .iter()
            .map(|p| Point2::new(p.x as f64, p.y as f64))
            .collect()
    }

    /// Extent of the lattice in spacing units: `(cols - 1, 2 * rows - 1)`.
    pub fn lattice_extent(&self) -> (i32, i32) {
        (self.spec.cols as i32 - 1, 2 * self.spec.rows as i32 - 1)
    }

    /// Index of the dot at lattice position `(a, b)`, if it belongs to the pattern.
    pub fn index_of_lattice(&self, a: i32, b: i32) -> Option<usize> {
        let (ext_a, ext_b) = self.lattice_extent();
        if a < 0 || b < 0 || a > ext_a || b > ext_b || (a + b) % 2 != 0 {
            return None;
        }
        let row = (b - a % 2) / 2;
        Some(a as usize * self.spec.rows as usize + row as usize)
    }

    /// Address of the dot at `index`.
    pub fn grid_index(&self, index: usize) -> Option<GridIndex> {
        if index >= self.len() {
            return None;
        }
        let rows = self.spec.rows as usize;
        Some(GridIndex {
            col: (index / rows) as u32,
            row: (index % rows) as u32,
        })
    }

    /// Board width and height spanned by the dot centres.
    pub fn board_extent(&self) -> (f32, f32) {
        let (ext_a, ext_b) = self.lattice_extent();
        (
            ext_a as f32 * self.spec.spacing,
            ext_b as f32 * self.spec.spacing,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_matches_printed_board() {
        let pattern = DotGridPattern::new(PatternSpec::default()).expect("valid");
        let pts = pattern.object_points();
        assert_eq!(pts.len(), 44);

        let expected_head = [
            (0.0, 0.0),
            (0.0, 40.0),
            (0.0, 80.0),
            (0.0, 120.0),
            (20.0, 20.0),
            (20.0, 60.0),
            (20.0, 100.0),
            (20.0, 140.0),
            (40.0, 0.0),
        ];
        for (p, (x, y)) in pts.iter().zip(expected_head) {
            assert_eq!((p.x, p.y, p.z), (x, y, 0.0));
        }
        let last = pts[43];
        assert_eq!((last.x, last.y), (200.0, 120.0));
        assert_eq!(pattern.board_extent(), (200.0, 140.0));
    }

    #[test]
    fn lattice_index_round_trips() {
        let pattern = DotGridPattern::new(PatternSpec::default()).expect("valid");
        for idx in 0..pattern.len() {
            let g = pattern.grid_index(idx).expect("in range");
            let (a, b) = g.lattice();
            assert_eq!(pattern.index_of_lattice(a, b), Some(idx));
        }
        assert_eq!(pattern.index_of_lattice(0, 1), None);
        assert_eq!(pattern.index_of_lattice(11, 1), None);
        assert_eq!(pattern.index_of_lattice(-1, 1), None);
    }

    #[test]
    fn nearest_neighbours_are_diagonal() {
        let pattern = DotGridPattern::new(PatternSpec::default()).expect("valid");
        let pts = pattern.object_points();
        let d01 = (pts[0] - pts[1]).norm();
        let d04 = (pts[0] - pts[4]).norm();
        approx::assert_relative_eq!(d01, 40.0);
        approx::assert_relative_eq!(d04, 20.0 * std::f32::consts::SQRT_2, epsilon = 1e-4);
    }

    #[test]
    fn rejects_invalid_specs() {
        let bad = PatternSpec {
            rows: 1,
            ..PatternSpec::default()
        };
        assert!(matches!(
            DotGridPattern::new(bad),
            Err(PatternError::InvalidSize { .. })
        ));
        let bad = PatternSpec {
            dot_diameter: 40.0,
            ..PatternSpec::default()
        };
        assert_eq!(
            DotGridPattern::new(bad).unwrap_err(),
            PatternError::InvalidDiameter
        );
    }

    #[test]
    fn spec_deserializes_with_defaults() {
        let spec: PatternSpec = serde_json::from_str(r#"{"cols": 9}"#).expect("json");
        assert_eq!(spec.cols, 9);
        assert_eq!(spec.rows, 4);
    }
}
