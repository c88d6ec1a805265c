//! Showing frames to the operator, and the before/after distortion preview.

use std::path::PathBuf;
use std::time::Duration;

use dotgrid_solver::{optimal_new_camera_matrix, CameraMatrix, CameraModel, Roi, UndistortMap};
use image::imageops::FilterType;
use image::RgbImage;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;

#[cfg(feature = "tracing")]
use tracing::instrument;

#[derive(thiserror::Error, Debug)]
pub enum PreviewError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("failed to write preview frame {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// Destination of preview frames (a window, a folder, nothing).
pub trait PreviewSink {
    fn show(&mut self, title: &str, frame: &RgbImage) -> Result<(), PreviewError>;
}

impl<P: PreviewSink + ?Sized> PreviewSink for &mut P {
    fn show(&mut self, title: &str, frame: &RgbImage) -> Result<(), PreviewError> {
        (**self).show(title, frame)
    }
}

/// Discards every frame.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl PreviewSink for NullSink {
    fn show(&mut self, _title: &str, _frame: &RgbImage) -> Result<(), PreviewError> {
        Ok(())
    }
}

/// Writes frames as numbered PNG files (`000017_<title>.png`).
#[derive(Debug)]
pub struct FolderSink {
    dir: PathBuf,
    written: usize,
    /// Only every `every`-th frame is written.
    every: usize,
    shown: usize,
}

impl FolderSink {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, PreviewError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            written: 0,
            every: 1,
            shown: 0,
        })
    }

    pub fn every(mut self, every: usize) -> Self {
        self.every = every.max(1);
        self
    }

    pub fn written(&self) -> usize {
        self.written
    }
}

impl PreviewSink for FolderSink {
    fn show(&mut self, title: &str, frame: &RgbImage) -> Result<(), PreviewError> {
        let shown = self.shown;
        self.shown += 1;
        if shown % self.every != 0 {
            return Ok(());
        }
        let name: String = title
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        let path = self.dir.join(format!("{:06}_{name}.png", self.written));
        frame
            .save(&path)
            .map_err(|source| PreviewError::Image { path, source })?;
        self.written += 1;
        Ok(())
    }
}

/// Options of [`DistortionPreview`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewParams {
    /// Free scaling of the undistorted view: 0 keeps valid pixels only,
    /// 1 keeps the whole source field of view.
    pub alpha: f64,
    /// Display scale applied to both images.
    pub scale: f32,
    /// Time each image stays on screen.
    #[serde(with = "millis")]
    pub cadence: Duration,
    /// Stop after this many original/undistorted cycles.
    pub max_cycles: Option<usize>,
}

impl Default for PreviewParams {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            scale: 0.5,
            cadence: Duration::from_millis(200),
            max_cycles: None,
        }
    }
}

pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Original and undistorted version of one frame.
#[derive(Clone, Debug)]
pub struct DistortionPreview {
    original: RgbImage,
    undistorted: RgbImage,
    new_matrix: CameraMatrix,
    roi: Roi,
}

impl DistortionPreview {
    /// Undistort `frame` with the camera matrix that keeps the field of view
    /// selected by `params.alpha`, then scale both images.
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "info", skip(model, frame, params), fields(width = frame.width(), height = frame.height()))
    )]
    pub fn new(model: &CameraModel, frame: &RgbImage, params: &PreviewParams) -> Self {
        let (w, h) = frame.dimensions();
        let (new_matrix, roi) = optimal_new_camera_matrix(model, w, h, params.alpha);
        debug!("new camera matrix {new_matrix:?}, valid roi {roi:?}");

        let map = UndistortMap::new(model, &new_matrix, w, h);
        let data = map.remap_interleaved(frame.as_raw(), w as usize, h as usize, 3);
        let undistorted = RgbImage::from_raw(w, h, data).unwrap_or_else(|| RgbImage::new(w, h));

        Self {
            original: scaled(frame, params.scale),
            undistorted: scaled(&undistorted, params.scale),
            new_matrix,
            roi,
        }
    }

    pub fn original(&self) -> &RgbImage {
        &self.original
    }

    pub fn undistorted(&self) -> &RgbImage {
        &self.undistorted
    }

    pub fn new_matrix(&self) -> &CameraMatrix {
        &self.new_matrix
    }

    /// Valid pixel region of the full-size undistorted frame.
    pub fn roi(&self) -> Roi {
        self.roi
    }

    /// Alternate original and undistorted images until cancelled (or
    /// `max_cycles` is reached). Returns the number of completed cycles.
    pub fn run<P: PreviewSink + ?Sized>(
        &self,
        sink: &mut P,
        params: &PreviewParams,
        cancel: &CancelToken,
    ) -> Result<usize, PreviewError> {
        let mut cycles = 0;
        while params.max_cycles.is_none_or(|max| cycles < max) {
            sink.show("original", &self.original)?;
            if !cancel.sleep(params.cadence) {
                break;
            }
            sink.show("undistorted", &self.undistorted)?;
            if !cancel.sleep(params.cadence) {
                break;
            }
            cycles += 1;
        }
        info!("distortion preview stopped after {cycles} cycles");
        Ok(cycles)
    }
}

fn scaled(img: &RgbImage, scale: f32) -> RgbImage {
    if !scale.is_finite() || scale <= 0.0 || (scale - 1.0).abs() < f32::EPSILON {
        return img.clone();
    }
    let w = ((img.width() as f32 * scale).round() as u32).max(1);
    let h = ((img.height() as f32 * scale).round() as u32).max(1);
    image::imageops::resize(img, w, h, FilterType::Triangle)
}
