//! JSON configuration of a calibration run.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use dotgrid_core::{DotGridPattern, PatternError, PatternSpec};
use dotgrid_detect::{CircleGridDetector, CircleGridDetectorParams};
use dotgrid_solver::{CameraMatrix, CameraModel, Distortion, SolverParams};
use serde::{Deserialize, Serialize};

use crate::preview::{millis, PreviewParams};
use crate::sampler::SamplerParams;
use crate::source::RecordedSourceParams;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Pattern(#[from] PatternError),
}

/// Synthetic rig: a known camera filming the board from scripted poses.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationParams {
    pub width: u32,
    pub height: u32,
    pub camera: CameraModel,
    /// Number of distinct board poses.
    pub views: usize,
    /// Distance of the board centre from the camera, in board units.
    pub distance: f64,
    #[serde(with = "millis")]
    pub frame_interval: Duration,
    /// Blank frames shown after every board pose.
    pub blank_frames: usize,
}

impl Default for SimulationParams {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            camera: CameraModel::new(
                CameraMatrix::new(800.0, 795.0, 322.0, 241.0),
                Distortion {
                    k1: -0.12,
                    k2: 0.06,
                    p1: 0.0008,
                    p2: -0.0005,
                    k3: 0.0,
                },
            ),
            views: 24,
            distance: 600.0,
            frame_interval: Duration::from_millis(500),
            blank_frames: 3,
        }
    }
}

/// Where frames come from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    Synthetic(SimulationParams),
    Recorded {
        dir: PathBuf,
        #[serde(flatten)]
        params: RecordedSourceParams,
    },
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig::Synthetic(SimulationParams::default())
    }
}

/// Everything a calibration run needs. Every field has a default, so an
/// empty JSON object is a valid configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub pattern: PatternSpec,
    /// Blob filters, sheet size, grid search and sub-pixel refinement.
    pub detector: CircleGridDetectorParams,
    pub sampling: SamplerParams,
    pub solver: SolverParams,
    pub source: SourceConfig,
    pub preview: PreviewParams,
    /// Folder for operator preview frames; nothing is written when unset.
    pub preview_dir: Option<PathBuf>,
    /// Where to write the calibration report.
    pub report_path: Option<PathBuf>,
}

impl CalibrationConfig {
    /// Load a JSON config from disk.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Write this config to disk as pretty JSON.
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn build_pattern(&self) -> Result<DotGridPattern, ConfigError> {
        Ok(DotGridPattern::new(self.pattern)?)
    }

    pub fn build_detector(&self) -> Result<CircleGridDetector, ConfigError> {
        Ok(CircleGridDetector::new(self.build_pattern()?, self.detector.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_gives_defaults() {
        let cfg: CalibrationConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, CalibrationConfig::default());
        assert_eq!(cfg.sampling.target_samples, 20);
        assert_eq!(cfg.sampling.cooldown, Duration::from_secs(2));
        assert_eq!(cfg.preview.cadence, Duration::from_millis(200));
        assert_eq!(cfg.pattern.rows, 4);
        assert_eq!(cfg.pattern.cols, 11);
    }

    #[test]
    fn partial_overrides_keep_other_defaults() {
        let cfg: CalibrationConfig = serde_json::from_str(
            r#"{
                "sampling": { "target_samples": 12, "cooldown": 1500 },
                "source": { "kind": "recorded", "dir": "frames", "pace": true },
                "detector": { "blob": { "min_convexity": 0.9 } }
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.sampling.target_samples, 12);
        assert_eq!(cfg.sampling.cooldown, Duration::from_millis(1500));
        assert_eq!(cfg.sampling.frame_timeout, Duration::from_secs(5));
        assert_eq!(cfg.detector.blob.min_convexity, 0.9);
        assert!(cfg.detector.sizing.is_some());
        match &cfg.source {
            SourceConfig::Recorded { dir, params } => {
                assert_eq!(dir, &PathBuf::from("frames"));
                assert!(params.pace);
                assert!(!params.extensions.is_empty());
            }
            other => panic!("unexpected source {other:?}"),
        }
    }

    #[test]
    fn json_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calibration.json");
        let cfg = CalibrationConfig {
            report_path: Some(PathBuf::from("report.json")),
            ..CalibrationConfig::default()
        };
        cfg.write_json(&path).unwrap();
        assert_eq!(CalibrationConfig::load_json(&path).unwrap(), cfg);
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let cfg: CalibrationConfig = serde_json::from_str(r#"{ "pattern": { "rows": 1 } }"#).unwrap();
        assert!(matches!(cfg.build_detector(), Err(ConfigError::Pattern(_))));
    }
}
