use crate::blob::{BlobDetector, BlobParams, BlobSizing, Keypoint};
use crate::circle_grid::{CircleGridFinder, CircleGridParams};
use crate::subpix::{refine_centers, SubPixParams};
use dotgrid_core::{DotGridPattern, GrayImageView};
use log::debug;
use nalgebra::Point2;
use serde::{Deserialize, Serialize};

/// Finds the calibration pattern in gray frames.
///
/// Detection is split in two so that callers can show keypoints on every
/// frame while only paying for grid search when they intend to keep the
/// result.
pub trait GridDetector {
    fn pattern(&self) -> &DotGridPattern;

    /// Blob candidates in the frame.
    fn keypoints(&mut self, img: &GrayImageView<'_>) -> Vec<Keypoint>;

    /// Refined image positions of all pattern dots in pattern order, or
    /// `None` when the grid is not (completely) visible.
    fn locate(&mut self, img: &GrayImageView<'_>, keypoints: &[Keypoint]) -> Option<Vec<Point2<f32>>>;

    /// Both steps at once.
    fn detect(&mut self, img: &GrayImageView<'_>) -> GridDetection {
        let keypoints = self.keypoints(img);
        let grid = self.locate(img, &keypoints);
        GridDetection { keypoints, grid }
    }
}

#[derive(Clone, Debug, Default)]
pub struct GridDetection {
    pub keypoints: Vec<Keypoint>,
    pub grid: Option<Vec<Point2<f32>>>,
}

/// Configuration of [`CircleGridDetector`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircleGridDetectorParams {
    pub blob: BlobParams,
    /// When set, blob area bounds are derived from the frame size on the
    /// first frame, overriding `blob.min_area` / `blob.max_area`.
    pub sizing: Option<BlobSizing>,
    pub grid: CircleGridParams,
    pub subpix: SubPixParams,
}

impl Default for CircleGridDetectorParams {
    fn default() -> Self {
        Self {
            blob: BlobParams::default(),
            sizing: Some(BlobSizing::default()),
            grid: CircleGridParams::default(),
            subpix: SubPixParams::default(),
        }
    }
}

/// Blob detection, asymmetric grid search and sub-pixel refinement.
#[derive(Clone, Debug)]
pub struct CircleGridDetector {
    params: CircleGridDetectorParams,
    finder: CircleGridFinder,
    blob: Option<((usize, usize), BlobDetector)>,
}

impl CircleGridDetector {
    pub fn new(pattern: DotGridPattern, params: CircleGridDetectorParams) -> Self {
        let finder = CircleGridFinder::new(pattern, params.grid.clone());
        Self {
            params,
            finder,
            blob: None,
        }
    }

    pub fn params(&self) -> &CircleGridDetectorParams {
        &self.params
    }

    /// Blob detector for a frame size, built on first use.
    fn blob_detector(&mut self, width: usize, height: usize) -> &BlobDetector {
        if !matches!(&self.blob, Some((size, _)) if *size == (width, height)) {
            self.blob = None;
        }
        let params = &self.params;
        let dot_diameter = self.finder.pattern().spec().dot_diameter;
        let (_, detector) = self.blob.get_or_insert_with(|| {
            let mut blob = params.blob.clone();
            if let Some(sizing) = &params.sizing {
                let bounds = sizing.area_bounds(width as u32, height as u32, dot_diameter);
                debug!(
                    "blob area bounds for {width}x{height}: {:.1}..{:.1} px^2",
                    bounds.0, bounds.1
                );
                blob = blob.with_area_bounds(bounds);
            }
            ((width, height), BlobDetector::new(blob))
        });
        detector
    }
}

impl GridDetector for CircleGridDetector {
    fn pattern(&self) -> &DotGridPattern {
        self.finder.pattern()
    }

    fn keypoints(&mut self, img: &GrayImageView<'_>) -> Vec<Keypoint> {
        self.blob_detector(img.width, img.height).detect(img)
    }

    fn locate(&mut self, img: &GrayImageView<'_>, keypoints: &[Keypoint]) -> Option<Vec<Point2<f32>>> {
        let mut points = self.finder.find(keypoints)?;
        refine_centers(img, &mut points, &self.params.subpix);
        Some(points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dotgrid_core::{GrayImage, PatternSpec};

    #[test]
    fn area_bounds_follow_the_frame() {
        let pattern = DotGridPattern::new(PatternSpec::default()).unwrap();
        let mut det = CircleGridDetector::new(pattern, CircleGridDetectorParams::default());
        let small = det.blob_detector(297, 210).params().max_area;
        let large = det.blob_detector(594, 420).params().max_area;
        approx::assert_relative_eq!(large, 4.0 * small, epsilon = 1e-2);

        let no_sizing = CircleGridDetectorParams {
            sizing: None,
            ..CircleGridDetectorParams::default()
        };
        let pattern = DotGridPattern::new(PatternSpec::default()).unwrap();
        let mut det = CircleGridDetector::new(pattern, no_sizing);
        assert_eq!(det.blob_detector(640, 480).params().max_area, BlobParams::default().max_area);
    }

    #[test]
    fn blank_frame_has_no_grid() {
        let pattern = DotGridPattern::new(PatternSpec::default()).unwrap();
        let mut det = CircleGridDetector::new(pattern, CircleGridDetectorParams::default());
        let img = GrayImage::filled(160, 120, 200);
        let found = det.detect(&img.view());
        assert!(found.keypoints.is_empty());
        assert!(found.grid.is_none());
    }
}
