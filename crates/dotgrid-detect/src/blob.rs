//! Multi-threshold blob detector.
//!
//! The image is binarized at a ladder of thresholds. Every 8-connected
//! component is traced and filtered by area, circularity, convexity and
//! inertia ratio. Centres that reappear at the same place across thresholds
//! are merged; a blob is reported once it was seen at `min_repeatability`
//! thresholds.

use crate::contour::{
    convex_hull, label_regions, perimeter, polygon_area, trace_contour, BinaryView, Foreground,
    LabelScratch,
};
use dotgrid_core::GrayImageView;
use log::debug;
use nalgebra::Point2;
use serde::{Deserialize, Serialize};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Which blobs to look for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobPolarity {
    /// Dark dots on a light background.
    #[default]
    Dark,
    /// Light dots on a dark background.
    Light,
}

/// Blob detector parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobParams {
    pub min_threshold: u8,
    pub max_threshold: u8,
    pub threshold_step: u8,
    /// Number of thresholds a blob must survive.
    pub min_repeatability: usize,
    /// Centres closer than this (pixels) are considered the same blob.
    pub min_dist_between_blobs: f32,
    pub polarity: BlobPolarity,

    pub filter_by_area: bool,
    pub min_area: f32,
    pub max_area: f32,

    pub filter_by_circularity: bool,
    pub min_circularity: f32,
    pub max_circularity: f32,

    pub filter_by_convexity: bool,
    pub min_convexity: f32,
    pub max_convexity: f32,

    pub filter_by_inertia: bool,
    pub min_inertia_ratio: f32,
    pub max_inertia_ratio: f32,
}

impl Default for BlobParams {
    fn default() -> Self {
        Self {
            min_threshold: 10,
            max_threshold: 255,
            threshold_step: 10,
            min_repeatability: 2,
            min_dist_between_blobs: 10.0,
            polarity: BlobPolarity::Dark,
            filter_by_area: true,
            min_area: std::f32::consts::PI * 25.0,
            max_area: 5000.0,
            filter_by_circularity: true,
            min_circularity: 0.1,
            max_circularity: f32::MAX,
            filter_by_convexity: true,
            min_convexity: 0.87,
            max_convexity: f32::MAX,
            filter_by_inertia: true,
            min_inertia_ratio: 0.01,
            max_inertia_ratio: f32::MAX,
        }
    }
}

impl BlobParams {
    /// Replace the area bounds with the ones derived from `sizing` for a frame.
    pub fn with_area_bounds(mut self, bounds: (f32, f32)) -> Self {
        self.min_area = bounds.0;
        self.max_area = bounds.1;
        self
    }
}

/// How large a printed dot can get in a frame.
///
/// The upper bound assumes the printed sheet fills the frame along its
/// tighter axis; the lower bound is a fixed pixel diameter.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobSizing {
    /// Smallest dot diameter still accepted, in pixels.
    pub min_pixel_diameter: f32,
    /// Printed sheet width (same unit as the dot diameter).
    pub sheet_width: f32,
    /// Printed sheet height (same unit as the dot diameter).
    pub sheet_height: f32,
}

impl Default for BlobSizing {
    /// A4 landscape in millimetres, 10 px minimum diameter.
    fn default() -> Self {
        Self {
            min_pixel_diameter: 10.0,
            sheet_width: 297.0,
            sheet_height: 210.0,
        }
    }
}

impl BlobSizing {
    /// `(min_area, max_area)` in square pixels for a `width x height` frame.
    pub fn area_bounds(&self, width: u32, height: u32, dot_diameter: f32) -> (f32, f32) {
        use std::f32::consts::PI;
        let min_r = self.min_pixel_diameter / 2.0;
        let px_per_unit = (height as f32 / self.sheet_height).max(width as f32 / self.sheet_width);
        let max_r = px_per_unit * dot_diameter / 2.0;
        (PI * min_r * min_r, PI * max_r * max_r)
    }
}

/// Detected blob.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    /// Centre in pixels.
    pub position: Point2<f32>,
    /// Blob diameter in pixels.
    pub size: f32,
    /// Number of thresholds the blob was found at.
    pub hits: usize,
}

#[derive(Clone, Copy, Debug)]
struct Center {
    location: Point2<f64>,
    radius: f64,
    confidence: f64,
}

fn in_range(v: f64, min: f32, max: f32) -> bool {
    v >= min as f64 && v < max as f64
}

/// Blob detector over gray images.
#[derive(Clone, Debug, Default)]
pub struct BlobDetector {
    params: BlobParams,
}

impl BlobDetector {
    pub fn new(params: BlobParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &BlobParams {
        &self.params
    }

    /// Detect blobs in `img`.
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(self, img), fields(w = img.width, h = img.height)))]
    pub fn detect(&self, img: &GrayImageView<'_>) -> Vec<Keypoint> {
        let p = &self.params;
        if img.width == 0 || img.height == 0 || p.threshold_step == 0 {
            return Vec::new();
        }

        let mut scratch = LabelScratch::default();
        let mut groups: Vec<Vec<Center>> = Vec::new();
        let mut thresholds = 0usize;

        let mut t = p.min_threshold as u16;
        while t < p.max_threshold as u16 {
            thresholds += 1;
            let centers = self.find_blobs(img, t as u8, &mut scratch);

            let mut fresh: Vec<Vec<Center>> = Vec::new();
            for c in centers {
                let mut is_new = true;
                for group in groups.iter_mut() {
                    let mid = group[group.len() / 2];
                    let dist = (mid.location - c.location).norm();
                    is_new = dist >= p.min_dist_between_blobs as f64
                        && dist >= mid.radius
                        && dist >= c.radius;
                    if !is_new {
                        // Keep each group sorted by radius.
                        let pos = group
                            .iter()
                            .position(|g| g.radius > c.radius)
                            .unwrap_or(group.len());
                        group.insert(pos, c);
                        break;
                    }
                }
                if is_new {
                    fresh.push(vec![c]);
                }
            }
            groups.extend(fresh);

            t += p.threshold_step as u16;
        }

        let keypoints: Vec<Keypoint> = groups
            .iter()
            .filter(|g| g.len() >= p.min_repeatability)
            .map(|g| {
                let (sum, norm) = g.iter().fold((nalgebra::Vector2::zeros(), 0.0), |(s, n), c| {
                    (s + c.location.coords * c.confidence, n + c.confidence)
                });
                let loc = if norm > 0.0 {
                    sum / norm
                } else {
                    g[g.len() / 2].location.coords
                };
                Keypoint {
                    position: Point2::new(loc.x as f32, loc.y as f32),
                    size: (g[g.len() / 2].radius * 2.0) as f32,
                    hits: g.len(),
                }
            })
            .collect();

        debug!(
            "{} blobs from {} candidate groups over {} thresholds",
            keypoints.len(),
            groups.len(),
            thresholds
        );
        keypoints
    }

    fn find_blobs(&self, img: &GrayImageView<'_>, threshold: u8, scratch: &mut LabelScratch) -> Vec<Center> {
        let p = &self.params;
        let foreground = match p.polarity {
            BlobPolarity::Dark => Foreground::Dark,
            BlobPolarity::Light => Foreground::Light,
        };
        let bin = BinaryView::new(img, threshold, foreground);
        let regions = label_regions(&bin, scratch);

        let mut centers = Vec::new();
        for region in regions {
            // The traced polygon never encloses more than the pixel count.
            if p.filter_by_area && (region.pixels as f64) < p.min_area as f64 {
                continue;
            }
            if p.filter_by_area && region.pixels as f64 > 2.0 * p.max_area as f64 + 64.0 {
                continue;
            }

            let contour = trace_contour(&bin, region.start, 4 * region.pixels + 8);
            let area = polygon_area(&contour);
            if area <= 0.0 {
                continue;
            }

            if p.filter_by_area && !in_range(area, p.min_area, p.max_area) {
                continue;
            }

            if p.filter_by_circularity {
                let per = perimeter(&contour);
                let ratio = 4.0 * std::f64::consts::PI * area / (per * per);
                if !in_range(ratio, p.min_circularity, p.max_circularity) {
                    continue;
                }
            }

            let mut confidence = 1.0;
            if p.filter_by_inertia {
                let ratio = region.inertia_ratio();
                if !in_range(ratio, p.min_inertia_ratio, p.max_inertia_ratio) {
                    continue;
                }
                confidence = ratio * ratio;
            }

            if p.filter_by_convexity {
                let hull_area = polygon_area(&convex_hull(&contour));
                if hull_area <= 0.0 || !in_range(area / hull_area, p.min_convexity, p.max_convexity) {
                    continue;
                }
            }

            let location = region.centroid();
            // Rings and other shapes with a hole at the centre.
            if !bin.is_set(location.x.round() as i32, location.y.round() as i32) {
                continue;
            }

            let mut dists: Vec<f64> = contour.iter().map(|q| (q - location).norm()).collect();
            dists.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let radius = (dists[(dists.len() - 1) / 2] + dists[dists.len() / 2]) / 2.0;

            centers.push(Center {
                location,
                radius,
                confidence,
            });
        }

        centers
    }
}
