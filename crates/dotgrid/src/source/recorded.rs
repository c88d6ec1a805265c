//! Replay of frames stored as image files named by their arrival time.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::debug;
use serde::{Deserialize, Serialize};

use super::{Frame, FrameSource, FrameSourceError};

/// Options of [`RecordedSource`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordedSourceParams {
    /// Deliver frames at their recorded pace instead of as fast as possible.
    pub pace: bool,
    /// Accepted file extensions (lowercase).
    pub extensions: Vec<String>,
}

impl Default for RecordedSourceParams {
    fn default() -> Self {
        Self {
            pace: false,
            extensions: ["png", "jpg", "jpeg", "bmp", "tif", "tiff"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// Folder of frames whose file stems are millisecond timestamps
/// (`1712345678901.png`). Frames are replayed in timestamp order; frame
/// timestamps are relative to the first file.
#[derive(Debug)]
pub struct RecordedSource {
    params: RecordedSourceParams,
    frames: Vec<(Duration, PathBuf)>,
    next: usize,
    started: Option<Instant>,
}

impl RecordedSource {
    pub fn open(dir: impl AsRef<Path>, params: RecordedSourceParams) -> Result<Self, FrameSourceError> {
        let dir = dir.as_ref();
        let mut stamped = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let ext_ok = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| params.extensions.iter().any(|x| x.eq_ignore_ascii_case(e)));
            if !ext_ok {
                continue;
            }
            match path.file_stem().and_then(|s| s.to_str()).and_then(|s| s.parse::<u64>().ok()) {
                Some(ms) => stamped.push((ms, path)),
                None => debug!("skipping {}: file stem is not a timestamp", path.display()),
            }
        }
        if stamped.is_empty() {
            return Err(FrameSourceError::NoFrames(dir.to_path_buf()));
        }
        stamped.sort();

        let first = stamped[0].0;
        let frames = stamped
            .into_iter()
            .map(|(ms, path)| (Duration::from_millis(ms - first), path))
            .collect::<Vec<_>>();
        debug!("{} recorded frames in {}", frames.len(), dir.display());

        Ok(Self {
            params,
            frames,
            next: 0,
            started: None,
        })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Timestamps of all frames, in replay order.
    pub fn timestamps(&self) -> impl Iterator<Item = Duration> + '_ {
        self.frames.iter().map(|(ts, _)| *ts)
    }
}

impl FrameSource for RecordedSource {
    fn start(&mut self) -> Result<(), FrameSourceError> {
        if self.started.is_none() {
            // Keep the replay clock aligned with frames already delivered.
            let offset = self.frames.get(self.next).map_or(Duration::ZERO, |(ts, _)| *ts);
            let now = Instant::now();
            self.started = Some(now.checked_sub(offset).unwrap_or(now));
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.started = None;
    }

    fn is_active(&self) -> bool {
        self.started.is_some()
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<Frame, FrameSourceError> {
        let Some(started) = self.started else {
            return Err(FrameSourceError::NotGrabbing);
        };
        let Some((timestamp, path)) = self.frames.get(self.next).cloned() else {
            return Err(FrameSourceError::Exhausted);
        };

        if self.params.pace {
            let wait = (started + timestamp).saturating_duration_since(Instant::now());
            if wait > timeout {
                std::thread::sleep(timeout);
                return Err(FrameSourceError::Timeout { timeout });
            }
            std::thread::sleep(wait);
        }

        let image = image::open(&path)
            .map_err(|source| FrameSourceError::Image {
                path: path.clone(),
                source,
            })?
            .to_rgb8();
        self.next += 1;
        if self.next == self.frames.len() {
            debug!("last recorded frame delivered");
        }
        Ok(Frame { image, timestamp })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn write_frame(dir: &Path, name: &str, value: u8) {
        RgbImage::from_pixel(4, 3, Rgb([value; 3]))
            .save(dir.join(name))
            .unwrap();
    }

    #[test]
    fn frames_replay_in_timestamp_order() {
        let dir = tempfile::tempdir().unwrap();
        write_frame(dir.path(), "1500.png", 3);
        write_frame(dir.path(), "900.png", 1);
        write_frame(dir.path(), "1000.png", 2);
        write_frame(dir.path(), "preview.png", 9);
        std::fs::write(dir.path().join("1200.txt"), "not a frame").unwrap();

        let mut src = RecordedSource::open(dir.path(), RecordedSourceParams::default()).unwrap();
        assert_eq!(src.len(), 3);
        assert!(matches!(src.next_frame(Duration::ZERO), Err(FrameSourceError::NotGrabbing)));

        src.start().unwrap();
        let frames: Vec<_> = (0..3).map(|_| src.next_frame(Duration::ZERO).unwrap()).collect();
        let stamps: Vec<_> = frames.iter().map(|f| f.timestamp.as_millis()).collect();
        assert_eq!(stamps, vec![0, 100, 600]);
        let values: Vec<_> = frames.iter().map(|f| f.image.get_pixel(0, 0).0[0]).collect();
        assert_eq!(values, vec![1, 2, 3]);
        assert!(matches!(src.next_frame(Duration::ZERO), Err(FrameSourceError::Exhausted)));
    }

    #[test]
    fn empty_folder_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = RecordedSource::open(dir.path(), RecordedSourceParams::default()).unwrap_err();
        assert!(matches!(err, FrameSourceError::NoFrames(_)));
    }

    #[test]
    fn paced_replay_times_out_on_long_gaps() {
        let dir = tempfile::tempdir().unwrap();
        write_frame(dir.path(), "0.png", 0);
        write_frame(dir.path(), "60000.png", 0);
        let params = RecordedSourceParams {
            pace: true,
            ..RecordedSourceParams::default()
        };
        let mut src = RecordedSource::open(dir.path(), params).unwrap();
        src.start().unwrap();
        assert!(src.next_frame(Duration::from_millis(20)).is_ok());
        let err = src.next_frame(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, FrameSourceError::Timeout { .. }));
    }
}
