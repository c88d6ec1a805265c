//! Camera calibration with an asymmetric dot grid.
//!
//! A [`PatternSampler`] pulls frames from a [`FrameSource`], finds the
//! printed 4x11 grid and keeps one observation per cooldown interval. The
//! observations go to [`dotgrid_solver::calibrate_camera`]; the resulting
//! camera model can be checked visually with a [`DistortionPreview`].
//!
//! ## Quickstart
//!
//! ```no_run
//! use dotgrid::{calibrate, open_source, CalibrationConfig, CancelToken, NullSink};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CalibrationConfig::load_json("calibration.json")?;
//! let source = open_source(&config)?;
//! let report = calibrate(source, &config, &mut NullSink, &CancelToken::new())?;
//! println!("{report}");
//! # Ok(())
//! # }
//! ```
//!
//! ## API map
//! - `dotgrid::core`: pattern layout, sample types, gray images, homographies.
//! - `dotgrid::detect`: blob detection, grid finding, sub-pixel refinement.
//! - `dotgrid::solver`: camera model, calibration, undistortion.
//! - [`source`]: frame sources (synthetic rig, recorded folders).

pub use dotgrid_core as core;
pub use dotgrid_detect as detect;
pub use dotgrid_solver as solver;

pub mod annotate;
mod cancel;
mod config;
mod pipeline;
mod preview;
mod report;
mod sampler;
pub mod source;

pub use cancel::CancelToken;
pub use config::{CalibrationConfig, ConfigError, SimulationParams, SourceConfig};
pub use pipeline::{
    calibrate, collect_samples, open_source, preview_distortion, simulated_source, solve, PipelineError,
};
pub use preview::{DistortionPreview, FolderSink, NullSink, PreviewError, PreviewParams, PreviewSink};
pub use report::{reference_camera, CalibrationReport, ReportError};
pub use sampler::{PatternSampler, SamplerError, SamplerParams, StepOutcome, CONTROL_TITLE};
pub use source::{Frame, FrameSource, FrameSourceError, GrabSession};

pub use dotgrid_core::{DotGridPattern, PatternSpec, SamplePair, SampleSet};
pub use dotgrid_solver::{CameraMatrix, CameraModel, Distortion};
