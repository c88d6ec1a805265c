//! Camera matrix for undistorted output images.

use crate::model::{CameraMatrix, CameraModel};
use nalgebra::Point2;
use serde::{Deserialize, Serialize};

/// Pixel rectangle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct RectF {
    x: f64,
    y: f64,
    width: f64,
    height: f64,
}

const GRID: usize = 9;

/// Largest rectangle inside and smallest rectangle around the undistorted
/// image border, sampled on a `GRID x GRID` lattice. Coordinates are
/// normalized, or pixels of `new_matrix` when given.
fn undistorted_rectangles(
    model: &CameraModel,
    new_matrix: Option<&CameraMatrix>,
    width: u32,
    height: u32,
) -> (RectF, RectF) {
    let (mut ix0, mut ix1, mut iy0, mut iy1) = (f64::MIN, f64::MAX, f64::MIN, f64::MAX);
    let (mut ox0, mut ox1, mut oy0, mut oy1) = (f64::MAX, f64::MIN, f64::MAX, f64::MIN);
    let step_x = (width as f64 - 1.0) / (GRID - 1) as f64;
    let step_y = (height as f64 - 1.0) / (GRID - 1) as f64;

    for gy in 0..GRID {
        for gx in 0..GRID {
            let pixel = Point2::new(gx as f64 * step_x, gy as f64 * step_y);
            let mut p = model.undistort_pixel(pixel);
            if let Some(k) = new_matrix {
                p = k.to_pixel(p);
            }

            ox0 = ox0.min(p.x);
            ox1 = ox1.max(p.x);
            oy0 = oy0.min(p.y);
            oy1 = oy1.max(p.y);

            if gx == 0 {
                ix0 = ix0.max(p.x);
            }
            if gx == GRID - 1 {
                ix1 = ix1.min(p.x);
            }
            if gy == 0 {
                iy0 = iy0.max(p.y);
            }
            if gy == GRID - 1 {
                iy1 = iy1.min(p.y);
            }
        }
    }

    (
        RectF {
            x: ix0,
            y: iy0,
            width: ix1 - ix0,
            height: iy1 - iy0,
        },
        RectF {
            x: ox0,
            y: oy0,
            width: ox1 - ox0,
            height: oy1 - oy0,
        },
    )
}

/// New camera matrix for undistorting `width x height` images.
///
/// `alpha = 0` keeps only valid pixels (the inner rectangle fills the
/// output), `alpha = 1` keeps every source pixel (the outer rectangle fits
/// the output). Also returns the region of valid pixels in the output.
pub fn optimal_new_camera_matrix(model: &CameraModel, width: u32, height: u32, alpha: f64) -> (CameraMatrix, Roi) {
    let alpha = alpha.clamp(0.0, 1.0);
    let (inner, outer) = undistorted_rectangles(model, None, width, height);
    let w = width as f64 - 1.0;
    let h = height as f64 - 1.0;

    let fx0 = w / inner.width;
    let fy0 = h / inner.height;
    let cx0 = -fx0 * inner.x;
    let cy0 = -fy0 * inner.y;

    let fx1 = w / outer.width;
    let fy1 = h / outer.height;
    let cx1 = -fx1 * outer.x;
    let cy1 = -fy1 * outer.y;

    let k = CameraMatrix::new(
        fx0 * (1.0 - alpha) + fx1 * alpha,
        fy0 * (1.0 - alpha) + fy1 * alpha,
        cx0 * (1.0 - alpha) + cx1 * alpha,
        cy0 * (1.0 - alpha) + cy1 * alpha,
    );

    let (valid, _) = undistorted_rectangles(model, Some(&k), width, height);
    let x0 = valid.x.round().max(0.0);
    let y0 = valid.y.round().max(0.0);
    let x1 = (valid.x + valid.width).round().min(width as f64);
    let y1 = (valid.y + valid.height).round().min(height as f64);
    let roi = if x1 > x0 && y1 > y0 {
        Roi {
            x: x0 as u32,
            y: y0 as u32,
            width: (x1 - x0) as u32,
            height: (y1 - y0) as u32,
        }
    } else {
        Roi::default()
    };

    (k, roi)
}
