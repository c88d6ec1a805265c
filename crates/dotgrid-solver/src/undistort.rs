//! Per-pixel undistortion maps and bilinear remapping.

use crate::model::{CameraMatrix, CameraModel};
use dotgrid_core::{GrayImage, GrayImageView};
use nalgebra::Point2;

#[cfg(feature = "tracing")]
use tracing::instrument;

/// For every output pixel, the source pixel to sample.
#[derive(Clone, Debug)]
pub struct UndistortMap {
    width: usize,
    height: usize,
    map: Vec<[f32; 2]>,
}

impl UndistortMap {
    /// Map from images taken with `model` to an ideal pinhole camera with
    /// `new_matrix` and an output size of `width x height`.
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(model, new_matrix)))]
    pub fn new(model: &CameraModel, new_matrix: &CameraMatrix, width: u32, height: u32) -> Self {
        let (width, height) = (width as usize, height as usize);
        let mut map = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                let n = new_matrix.to_normalized(Point2::new(x as f64, y as f64));
                let src = model.matrix.to_pixel(model.distortion.distort(n));
                map.push([src.x as f32, src.y as f32]);
            }
        }
        Self { width, height, map }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Source position for output pixel `(x, y)`.
    pub fn source(&self, x: usize, y: usize) -> Option<Point2<f32>> {
        (x < self.width && y < self.height).then(|| {
            let [u, v] = self.map[y * self.width + x];
            Point2::new(u, v)
        })
    }

    /// Remap an interleaved 8-bit image with `channels` channels.
    ///
    /// Output pixels whose source lies outside the input are black.
    pub fn remap_interleaved(&self, src: &[u8], src_width: usize, src_height: usize, channels: usize) -> Vec<u8> {
        let mut out = vec![0u8; self.width * self.height * channels];
        if src_width == 0 || src_height == 0 || src.len() < src_width * src_height * channels {
            return out;
        }
        let max_x = (src_width - 1) as f32;
        let max_y = (src_height - 1) as f32;

        for (idx, &[u, v]) in self.map.iter().enumerate() {
            if !(u >= 0.0 && v >= 0.0 && u <= max_x && v <= max_y) {
                continue;
            }
            let x0 = u.floor() as usize;
            let y0 = v.floor() as usize;
            let x1 = (x0 + 1).min(src_width - 1);
            let y1 = (y0 + 1).min(src_height - 1);
            let fx = u - x0 as f32;
            let fy = v - y0 as f32;

            let base = |x: usize, y: usize| (y * src_width + x) * channels;
            let (b00, b10, b01, b11) = (base(x0, y0), base(x1, y0), base(x0, y1), base(x1, y1));
            for c in 0..channels {
                let p00 = src[b00 + c] as f32;
                let p10 = src[b10 + c] as f32;
                let p01 = src[b01 + c] as f32;
                let p11 = src[b11 + c] as f32;
                let a = p00 + fx * (p10 - p00);
                let b = p01 + fx * (p11 - p01);
                out[idx * channels + c] = (a + fy * (b - a)).round().clamp(0.0, 255.0) as u8;
            }
        }
        out
    }

    pub fn remap_gray(&self, src: &GrayImageView<'_>) -> GrayImage {
        GrayImage {
            width: self.width,
            height: self.height,
            data: self.remap_interleaved(src.data, src.width, src.height, 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Distortion;
    use crate::optimal::optimal_new_camera_matrix;

    #[test]
    fn identity_model_copies_the_image() {
        let model = CameraModel::new(CameraMatrix::new(100.0, 100.0, 8.0, 6.0), Distortion::default());
        let map = UndistortMap::new(&model, &model.matrix, 16, 12);
        let src = GrayImage {
            width: 16,
            height: 12,
            data: (0..192).map(|v| v as u8).collect(),
        };
        let out = map.remap_gray(&src.view());
        assert_eq!(out, src);
    }

    #[test]
    fn interleaved_channels_are_remapped_independently() {
        let model = CameraModel::new(CameraMatrix::new(50.0, 50.0, 4.0, 4.0), Distortion::default());
        // Output shifted by one pixel to the right of the source.
        let shifted = CameraMatrix::new(50.0, 50.0, 5.0, 4.0);
        let map = UndistortMap::new(&model, &shifted, 8, 8);
        let src: Vec<u8> = (0..64).flat_map(|i| [i as u8, 100, 200]).collect();
        let out = map.remap_interleaved(&src, 8, 8, 3);
        // Column 0 samples x = -1: black.
        assert_eq!(&out[0..3], &[0, 0, 0]);
        // Output (1, 0) samples source (0, 0).
        assert_eq!(&out[3..6], &[0, 100, 200]);
        assert_eq!(&out[6..9], &[1, 100, 200]);
    }

    #[test]
    fn barrel_undistortion_straightens_a_line() {
        let model = CameraModel::new(
            CameraMatrix::new(300.0, 300.0, 79.5, 59.5),
            Distortion {
                k1: -0.3,
                ..Distortion::default()
            },
        );
        let (k, _) = optimal_new_camera_matrix(&model, 160, 120, 0.0);
        let map = UndistortMap::new(&model, &k, 160, 120);
        // A straight row in the undistorted view comes from a curved row in
        // the source: its ends bend towards the centre.
        let mid = map.source(80, 10).unwrap();
        let end = map.source(2, 10).unwrap();
        assert!(end.y > mid.y);
    }
}
