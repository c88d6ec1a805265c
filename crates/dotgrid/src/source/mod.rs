//! Frame sources: anything that yields timestamped color frames.

mod recorded;
mod synthetic;

use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::time::Duration;

use dotgrid_core::GrayImage;
use image::RgbImage;

pub use recorded::{RecordedSource, RecordedSourceParams};
pub use synthetic::{orbit_poses, SyntheticSource, SyntheticView};

/// One decoded frame.
#[derive(Clone, Debug)]
pub struct Frame {
    pub image: RgbImage,
    /// Monotonic time since the source started.
    pub timestamp: Duration,
}

impl Frame {
    #[inline]
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Luma conversion used by the detector.
    pub fn to_gray(&self) -> GrayImage {
        let luma = image::imageops::grayscale(&self.image);
        GrayImage {
            width: luma.width() as usize,
            height: luma.height() as usize,
            data: luma.into_raw(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum FrameSourceError {
    #[error("frame source is not grabbing")]
    NotGrabbing,
    #[error("no frame within {timeout:?}")]
    Timeout { timeout: Duration },
    #[error("frame source has no more frames")]
    Exhausted,
    #[error("no image frames found in {0}")]
    NoFrames(PathBuf),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("failed to decode {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// Camera-like producer of frames.
///
/// Frames are only delivered between `start` and `stop`; `next_frame`
/// blocks for at most `timeout`.
pub trait FrameSource {
    fn start(&mut self) -> Result<(), FrameSourceError>;

    fn stop(&mut self);

    fn is_active(&self) -> bool;

    fn next_frame(&mut self, timeout: Duration) -> Result<Frame, FrameSourceError>;
}

impl<S: FrameSource + ?Sized> FrameSource for &mut S {
    fn start(&mut self) -> Result<(), FrameSourceError> {
        (**self).start()
    }

    fn stop(&mut self) {
        (**self).stop()
    }

    fn is_active(&self) -> bool {
        (**self).is_active()
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<Frame, FrameSourceError> {
        (**self).next_frame(timeout)
    }
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn start(&mut self) -> Result<(), FrameSourceError> {
        (**self).start()
    }

    fn stop(&mut self) {
        (**self).stop()
    }

    fn is_active(&self) -> bool {
        (**self).is_active()
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<Frame, FrameSourceError> {
        (**self).next_frame(timeout)
    }
}

/// Started source that is stopped again when the session is dropped.
pub struct GrabSession<'a, S: FrameSource + ?Sized> {
    source: &'a mut S,
}

impl<'a, S: FrameSource + ?Sized> GrabSession<'a, S> {
    pub fn start(source: &'a mut S) -> Result<Self, FrameSourceError> {
        source.start()?;
        Ok(Self { source })
    }
}

impl<S: FrameSource + ?Sized> Deref for GrabSession<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        self.source
    }
}

impl<S: FrameSource + ?Sized> DerefMut for GrabSession<'_, S> {
    fn deref_mut(&mut self) -> &mut S {
        self.source
    }
}

impl<S: FrameSource + ?Sized> Drop for GrabSession<'_, S> {
    fn drop(&mut self) {
        self.source.stop();
    }
}

/// Grab one frame from a source, starting and stopping it around the call.
pub fn grab_one<S: FrameSource + ?Sized>(source: &mut S, timeout: Duration) -> Result<Frame, FrameSourceError> {
    let mut session = GrabSession::start(source)?;
    if !session.is_active() {
        return Err(FrameSourceError::NotGrabbing);
    }
    session.next_frame(timeout)
}
