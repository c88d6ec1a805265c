//! Core types and utilities for asymmetric dot-grid calibration.
//!
//! This crate is intentionally small and purely geometric. It does *not*
//! depend on any concrete image library, blob detector or solver.

mod homography;
mod image;
mod logger;
mod pattern;
mod sample;

pub use homography::{estimate_homography, Homography, HomographyError};
pub use image::{sample_bilinear, sample_bilinear_u8, GrayImage, GrayImageView};
pub use pattern::{DotGridPattern, GridIndex, PatternError, PatternSpec};
pub use sample::{SamplePair, SampleSet};

#[cfg(feature = "tracing")]
pub use logger::init_tracing;

pub use logger::init_with_level;
