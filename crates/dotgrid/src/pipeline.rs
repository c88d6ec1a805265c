//! End-to-end runs: sample, solve, report, preview.

use std::time::Duration;

use dotgrid_core::{DotGridPattern, SampleSet};
use dotgrid_solver::{calibrate_camera, CalibrationError, CameraModel};
use log::info;

use crate::cancel::CancelToken;
use crate::config::{CalibrationConfig, ConfigError, SimulationParams, SourceConfig};
use crate::preview::{DistortionPreview, PreviewError, PreviewParams, PreviewSink};
use crate::report::{CalibrationReport, ReportError};
use crate::sampler::{PatternSampler, SamplerError};
use crate::source::{
    grab_one, orbit_poses, FrameSource, FrameSourceError, RecordedSource, SyntheticSource, SyntheticView,
};

#[cfg(feature = "tracing")]
use tracing::instrument;

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Source(#[from] FrameSourceError),
    #[error(transparent)]
    Sampler(#[from] SamplerError),
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
    #[error(transparent)]
    Report(#[from] ReportError),
    #[error(transparent)]
    Preview(#[from] PreviewError),
    #[error("no frame was processed")]
    NoFrames,
}

/// Synthetic source for a simulated rig: every board pose is followed by
/// `blank_frames` empty frames.
pub fn simulated_source(pattern: &DotGridPattern, sim: &SimulationParams) -> SyntheticSource {
    let views = orbit_poses(pattern, sim.views, sim.distance)
        .into_iter()
        .flat_map(|pose| {
            std::iter::once(SyntheticView::Board(pose)).chain(std::iter::repeat_n(SyntheticView::Blank, sim.blank_frames))
        })
        .collect();
    SyntheticSource::new(pattern.clone(), sim.camera, sim.width, sim.height, views).with_interval(sim.frame_interval)
}

/// Frame source selected by the config.
pub fn open_source(config: &CalibrationConfig) -> Result<Box<dyn FrameSource>, PipelineError> {
    let source: Box<dyn FrameSource> = match &config.source {
        SourceConfig::Synthetic(sim) => Box::new(simulated_source(&config.build_pattern()?, sim)),
        SourceConfig::Recorded { dir, params } => Box::new(RecordedSource::open(dir, params.clone())?),
    };
    Ok(source)
}

/// Run the pattern sampler until the configured number of observations is
/// collected. Returns them with the frame size they were taken at.
pub fn collect_samples<S, P>(
    source: S,
    config: &CalibrationConfig,
    sink: &mut P,
    cancel: &CancelToken,
) -> Result<(SampleSet, (u32, u32)), PipelineError>
where
    S: FrameSource,
    P: PreviewSink + ?Sized,
{
    let detector = config.build_detector()?;
    let mut sampler = PatternSampler::new(source, detector, config.sampling.clone()).with_cancel(cancel.clone());
    sampler.run(sink)?;
    let size = sampler.frame_size().ok_or(PipelineError::NoFrames)?;
    Ok((sampler.into_samples(), size))
}

/// Solve for the camera from a completed sample set.
#[cfg_attr(feature = "tracing", instrument(level = "info", skip(samples, config), fields(samples = samples.len())))]
pub fn solve(samples: SampleSet, image_size: (u32, u32), config: &CalibrationConfig) -> Result<CalibrationReport, PipelineError> {
    let samples = samples.into_samples();
    let calibration = calibrate_camera(&samples, image_size.0, image_size.1, &config.solver)?;
    info!(
        "calibrated from {} samples: rms {:.4} px after {} evaluations",
        samples.len(),
        calibration.rms,
        calibration.iterations
    );
    Ok(CalibrationReport::new(calibration, image_size, config.pattern))
}

/// Sample, solve and (when configured) write the report.
pub fn calibrate<S, P>(
    source: S,
    config: &CalibrationConfig,
    sink: &mut P,
    cancel: &CancelToken,
) -> Result<CalibrationReport, PipelineError>
where
    S: FrameSource,
    P: PreviewSink + ?Sized,
{
    let (samples, size) = collect_samples(source, config, sink, cancel)?;
    let report = solve(samples, size, config)?;
    if let Some(path) = &config.report_path {
        report.write_json(path)?;
        info!("report written to {}", path.display());
    }
    Ok(report)
}

/// Grab one frame and alternate it with its undistorted version until
/// cancelled. Returns the number of completed cycles.
pub fn preview_distortion<S, P>(
    source: &mut S,
    model: &CameraModel,
    params: &PreviewParams,
    timeout: Duration,
    sink: &mut P,
    cancel: &CancelToken,
) -> Result<usize, PipelineError>
where
    S: FrameSource + ?Sized,
    P: PreviewSink + ?Sized,
{
    let frame = grab_one(source, timeout)?;
    let preview = DistortionPreview::new(model, &frame.image, params);
    Ok(preview.run(sink, params, cancel)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_source_interleaves_blank_frames() {
        let pattern = DotGridPattern::new(Default::default()).unwrap();
        let sim = SimulationParams {
            views: 3,
            blank_frames: 2,
            ..SimulationParams::default()
        };
        let src = simulated_source(&pattern, &sim);
        assert_eq!(src.remaining(), 9);
    }

    #[test]
    fn empty_recorded_folder_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let config = CalibrationConfig {
            source: SourceConfig::Recorded {
                dir: dir.path().to_path_buf(),
                params: Default::default(),
            },
            ..CalibrationConfig::default()
        };
        let err = open_source(&config).err().unwrap();
        assert!(matches!(err, PipelineError::Source(FrameSourceError::NoFrames(_))));
    }

    #[test]
    fn too_few_samples_fail_to_solve() {
        let config = CalibrationConfig::default();
        let err = solve(SampleSet::with_capacity(2), (640, 480), &config).unwrap_err();
        assert!(matches!(err, PipelineError::Calibration(CalibrationError::TooFewViews { .. })));
    }
}
