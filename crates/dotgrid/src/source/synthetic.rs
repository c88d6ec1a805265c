//! Frames rendered from a known camera looking at the printed board.

use std::time::Duration;

use dotgrid_core::DotGridPattern;
use dotgrid_solver::{CameraModel, Pose};
use image::{Rgb, RgbImage};
use nalgebra::{Matrix3, Point2, Rotation3, Vector3};

use super::{Frame, FrameSource, FrameSourceError};

#[cfg(feature = "tracing")]
use tracing::instrument;

const DOT: f64 = 20.0;
const PAPER: f64 = 255.0;
const BACKGROUND: f64 = 200.0;
/// Paper border around the outer dot centres, in board units.
const PAPER_MARGIN: f64 = 20.0;
const SUPERSAMPLE: usize = 3;

/// What the camera sees in one frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SyntheticView {
    Board(Pose),
    Blank,
}

/// Scripted camera: renders one frame per [`SyntheticView`] with a fixed
/// frame interval, then reports [`FrameSourceError::Exhausted`].
#[derive(Clone, Debug)]
pub struct SyntheticSource {
    pattern: DotGridPattern,
    model: CameraModel,
    width: u32,
    height: u32,
    interval: Duration,
    views: Vec<SyntheticView>,
    next: usize,
    active: bool,
    stop_after: Option<usize>,
    /// Undistorted normalized coordinates of every pixel centre.
    rays: Option<Vec<Point2<f64>>>,
}

impl SyntheticSource {
    pub fn new(
        pattern: DotGridPattern,
        model: CameraModel,
        width: u32,
        height: u32,
        views: Vec<SyntheticView>,
    ) -> Self {
        Self {
            pattern,
            model,
            width,
            height,
            interval: Duration::from_millis(500),
            views,
            next: 0,
            active: false,
            stop_after: None,
            rays: None,
        }
    }

    /// Time between consecutive frames (default 500 ms).
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Stop grabbing on its own after `frames` frames, like a camera that
    /// drops off the bus.
    pub fn with_stop_after(mut self, frames: usize) -> Self {
        self.stop_after = Some(frames);
        self
    }

    pub fn model(&self) -> &CameraModel {
        &self.model
    }

    pub fn frames_delivered(&self) -> usize {
        self.next
    }

    pub fn remaining(&self) -> usize {
        self.views.len().saturating_sub(self.next)
    }

    fn rays(&mut self) -> &[Point2<f64>] {
        let (w, h) = (self.width as usize, self.height as usize);
        let model = &self.model;
        self.rays.get_or_insert_with(|| {
            let mut rays = Vec::with_capacity(w * h);
            for y in 0..h {
                for x in 0..w {
                    rays.push(model.undistort_pixel(Point2::new(x as f64, y as f64)));
                }
            }
            rays
        })
    }

    /// Render a single view. Blank views show only the background.
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(self, view)))]
    pub fn render(&mut self, view: &SyntheticView) -> RgbImage {
        let (w, h) = (self.width as usize, self.height as usize);
        let mut img = RgbImage::from_pixel(self.width, self.height, Rgb([BACKGROUND as u8; 3]));
        let SyntheticView::Board(pose) = view else {
            return img;
        };

        // Normalized camera coordinates -> board plane.
        let r = pose.rotation_matrix().into_inner();
        let plane = Matrix3::from_columns(&[r.column(0).into_owned(), r.column(1).into_owned(), pose.translation]);
        let Some(to_board) = plane.try_inverse() else {
            return img;
        };

        let spec = self.pattern.spec();
        let board = Board {
            rows: spec.rows as i32,
            cols: spec.cols as i32,
            spacing: spec.spacing as f64,
            radius: spec.dot_diameter as f64 / 2.0,
            extent: {
                let (bw, bh) = self.pattern.board_extent();
                (bw as f64, bh as f64)
            },
        };

        let rays = self.rays();
        let ray = |x: isize, y: isize| rays[y.clamp(0, h as isize - 1) as usize * w + x.clamp(0, w as isize - 1) as usize];
        let sub = |k: usize| (k as f64 + 0.5) / SUPERSAMPLE as f64 - 0.5;

        let mut out = vec![0u8; w * h];
        for y in 0..h as isize {
            for x in 0..w as isize {
                let c = ray(x, y);
                let du = (ray(x + 1, y) - ray(x - 1, y)) / 2.0;
                let dv = (ray(x, y + 1) - ray(x, y - 1)) / 2.0;
                let mut acc = 0.0;
                for sy in 0..SUPERSAMPLE {
                    for sx in 0..SUPERSAMPLE {
                        let n = c + du * sub(sx) + dv * sub(sy);
                        acc += board.shade(&to_board, n);
                    }
                }
                out[y as usize * w + x as usize] = (acc / (SUPERSAMPLE * SUPERSAMPLE) as f64).round() as u8;
            }
        }

        for (px, v) in img.pixels_mut().zip(out) {
            *px = Rgb([v, v, v]);
        }
        img
    }
}

struct Board {
    rows: i32,
    cols: i32,
    spacing: f64,
    radius: f64,
    extent: (f64, f64),
}

impl Board {
    fn shade(&self, to_board: &Matrix3<f64>, n: Point2<f64>) -> f64 {
        let q = to_board * Vector3::new(n.x, n.y, 1.0);
        // Points behind the camera.
        if q.z <= 0.0 {
            return BACKGROUND;
        }
        let (x, y) = (q.x / q.z, q.y / q.z);
        if x < -PAPER_MARGIN || y < -PAPER_MARGIN || x > self.extent.0 + PAPER_MARGIN || y > self.extent.1 + PAPER_MARGIN {
            return BACKGROUND;
        }
        if self.inside_dot(x, y) {
            DOT
        } else {
            PAPER
        }
    }

    fn inside_dot(&self, x: f64, y: f64) -> bool {
        let a0 = (x / self.spacing).round() as i32;
        (a0 - 1..=a0 + 1).filter(|a| (0..self.cols).contains(a)).any(|a| {
            let parity = a % 2;
            let row = ((y / self.spacing - parity as f64) / 2.0).round() as i32;
            if !(0..self.rows).contains(&row) {
                return false;
            }
            let dx = x - a as f64 * self.spacing;
            let dy = y - (2 * row + parity) as f64 * self.spacing;
            dx * dx + dy * dy <= self.radius * self.radius
        })
    }
}

impl FrameSource for SyntheticSource {
    fn start(&mut self) -> Result<(), FrameSourceError> {
        self.active = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.active = false;
    }

    fn is_active(&self) -> bool {
        self.active && self.stop_after.is_none_or(|n| self.next < n)
    }

    fn next_frame(&mut self, _timeout: Duration) -> Result<Frame, FrameSourceError> {
        if !self.is_active() {
            return Err(FrameSourceError::NotGrabbing);
        }
        let Some(view) = self.views.get(self.next).copied() else {
            return Err(FrameSourceError::Exhausted);
        };
        let timestamp = self.interval * self.next as u32;
        self.next += 1;
        Ok(Frame {
            image: self.render(&view),
            timestamp,
        })
    }
}

/// `count` board poses spread over a cone of viewing directions, with the
/// board centre about `distance` in front of the camera.
pub fn orbit_poses(pattern: &DotGridPattern, count: usize, distance: f64) -> Vec<Pose> {
    let (bw, bh) = pattern.board_extent();
    let centre = Vector3::new(bw as f64 / 2.0, bh as f64 / 2.0, 0.0);
    (0..count)
        .map(|i| {
            let f = i as f64;
            let r = Rotation3::from_euler_angles(
                0.3 * (0.7 * f).sin(),
                0.3 * (1.3 * f + 0.5).cos(),
                0.15 * (0.9 * f).sin(),
            );
            let offset = Vector3::new(
                0.1 * distance * (0.5 * f).cos(),
                0.07 * distance * (0.8 * f).sin(),
                distance * (1.0 + 0.01 * (f % 7.0)),
            );
            Pose::from_rotation(&r, offset - r * centre)
        })
        .collect()
}
