//! Collecting calibration observations from a live frame stream.
//!
//! Every frame is run through blob detection and shown to the operator with
//! the keypoints drawn in. Grid search only runs once the cooldown since the
//! last accepted sample has elapsed, so the operator has time to move the
//! board to a new pose.

use std::time::Duration;

use dotgrid_core::{SamplePair, SampleSet};
use dotgrid_detect::GridDetector;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::annotate::{draw_grid, draw_keypoints};
use crate::cancel::CancelToken;
use crate::preview::{millis, PreviewError, PreviewSink};
use crate::source::{FrameSource, FrameSourceError, GrabSession};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Title of the operator preview frames.
pub const CONTROL_TITLE: &str = "control image";

/// Options of [`PatternSampler`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerParams {
    /// Number of observations to collect.
    pub target_samples: usize,
    /// Minimum frame time between two accepted observations.
    #[serde(with = "millis")]
    pub cooldown: Duration,
    /// Longest wait for a single frame.
    #[serde(with = "millis")]
    pub frame_timeout: Duration,
}

impl Default for SamplerParams {
    fn default() -> Self {
        Self {
            target_samples: 20,
            cooldown: Duration::from_secs(2),
            frame_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum SamplerError {
    #[error("camera is not grabbing")]
    CameraNotGrabbing,
    #[error("sampling cancelled")]
    Cancelled,
    #[error(transparent)]
    Source(FrameSourceError),
    #[error(transparent)]
    Preview(#[from] PreviewError),
}

impl From<FrameSourceError> for SamplerError {
    fn from(err: FrameSourceError) -> Self {
        match err {
            FrameSourceError::NotGrabbing => SamplerError::CameraNotGrabbing,
            other => SamplerError::Source(other),
        }
    }
}

/// What happened to one frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StepOutcome {
    /// A new observation was recorded.
    pub accepted: bool,
    /// Grid search ran on this frame (cooldown elapsed).
    pub attempted: bool,
    /// Blob candidates found in the frame.
    pub keypoints: usize,
    /// Observations collected so far.
    pub samples: usize,
}

#[derive(Debug)]
struct Progress {
    params: SamplerParams,
    samples: SampleSet,
    last_accept: Option<Duration>,
    frame_size: Option<(u32, u32)>,
    frames: usize,
    cancel: CancelToken,
}

/// Pulls frames from a [`FrameSource`] until `target_samples` observations
/// of the pattern are collected.
#[derive(Debug)]
pub struct PatternSampler<S, D> {
    source: S,
    detector: D,
    progress: Progress,
}

impl<S: FrameSource, D: GridDetector> PatternSampler<S, D> {
    pub fn new(source: S, detector: D, params: SamplerParams) -> Self {
        let samples = SampleSet::with_capacity(params.target_samples);
        Self {
            source,
            detector,
            progress: Progress {
                params,
                samples,
                last_accept: None,
                frame_size: None,
                frames: 0,
                cancel: CancelToken::new(),
            },
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.progress.cancel = cancel;
        self
    }

    pub fn params(&self) -> &SamplerParams {
        &self.progress.params
    }

    /// Observations collected so far (also after an error).
    pub fn samples(&self) -> &SampleSet {
        &self.progress.samples
    }

    /// Size of the frames the observations were taken from.
    pub fn frame_size(&self) -> Option<(u32, u32)> {
        self.progress.frame_size
    }

    pub fn frames_processed(&self) -> usize {
        self.progress.frames
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn detector(&self) -> &D {
        &self.detector
    }

    /// Process one frame of an already started source.
    pub fn step<P: PreviewSink + ?Sized>(&mut self, sink: &mut P) -> Result<StepOutcome, SamplerError> {
        self.progress.step(&mut self.source, &mut self.detector, sink)
    }

    /// Start the source and step until the sample set is complete. The
    /// source is stopped again on every exit path.
    pub fn run<P: PreviewSink + ?Sized>(&mut self, sink: &mut P) -> Result<&SampleSet, SamplerError> {
        {
            let mut session = GrabSession::start(&mut self.source)?;
            while !self.progress.samples.is_complete() {
                self.progress.step(&mut *session, &mut self.detector, sink)?;
            }
        }
        info!(
            "collected {} samples from {} frames",
            self.progress.samples.len(),
            self.progress.frames
        );
        Ok(&self.progress.samples)
    }

    /// Hand over the collected observations.
    pub fn into_samples(self) -> SampleSet {
        self.progress.samples
    }
}

impl Progress {
    fn cooldown_elapsed(&self, timestamp: Duration) -> bool {
        self.last_accept
            .is_none_or(|last| timestamp.saturating_sub(last) >= self.params.cooldown)
    }

    #[cfg_attr(
        feature = "tracing",
        instrument(level = "debug", skip_all, fields(frame = self.frames, samples = self.samples.len()))
    )]
    fn step<S, D, P>(&mut self, source: &mut S, detector: &mut D, sink: &mut P) -> Result<StepOutcome, SamplerError>
    where
        S: FrameSource + ?Sized,
        D: GridDetector,
        P: PreviewSink + ?Sized,
    {
        if self.cancel.is_cancelled() {
            return Err(SamplerError::Cancelled);
        }
        if !source.is_active() {
            return Err(SamplerError::CameraNotGrabbing);
        }
        let frame = source.next_frame(self.params.frame_timeout)?;
        self.frames += 1;

        let size = (frame.width(), frame.height());
        let size_ok = match self.frame_size {
            None => {
                self.frame_size = Some(size);
                true
            }
            Some(expected) => expected == size,
        };
        if !size_ok {
            warn!("frame size {size:?} differs from {:?}; frame ignored", self.frame_size);
        }

        let gray = frame.to_gray();
        let view = gray.view();
        let keypoints = detector.keypoints(&view);

        let attempted = size_ok && !self.samples.is_complete() && self.cooldown_elapsed(frame.timestamp);
        let grid = if attempted {
            detector.locate(&view, &keypoints)
        } else {
            None
        };

        let mut accepted = false;
        if let Some(points) = &grid {
            let sample = SamplePair {
                object: detector.pattern().object_points(),
                image: points.clone(),
                timestamp: frame.timestamp,
            };
            if self.samples.push(sample).is_ok() {
                accepted = true;
                self.last_accept = Some(frame.timestamp);
                info!(
                    "sample {}/{} at {:.2}s ({} keypoints)",
                    self.samples.len(),
                    self.samples.capacity(),
                    frame.timestamp.as_secs_f64(),
                    keypoints.len()
                );
            }
        } else if attempted {
            debug!(
                "no grid at {:.2}s ({} keypoints)",
                frame.timestamp.as_secs_f64(),
                keypoints.len()
            );
        }

        let mut control = frame.image;
        draw_keypoints(&mut control, &keypoints);
        if let Some(points) = &grid {
            draw_grid(&mut control, points, detector.pattern().rows() as usize);
        }
        sink.show(CONTROL_TITLE, &control)?;

        Ok(StepOutcome {
            accepted,
            attempted,
            keypoints: keypoints.len(),
            samples: self.samples.len(),
        })
    }
}
