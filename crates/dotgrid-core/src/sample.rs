use std::sync::Arc;
use std::time::Duration;

use nalgebra::{Point2, Point3};

/// One accepted observation: the pattern and where its dots were seen.
///
/// `image[k]` is the refined pixel position of `object[k]`.
#[derive(Clone, Debug)]
pub struct SamplePair {
    pub object: Arc<[Point3<f32>]>,
    pub image: Vec<Point2<f32>>,
    /// Timestamp of the frame the observation was taken from.
    pub timestamp: Duration,
}

impl SamplePair {
    pub fn len(&self) -> usize {
        self.image.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image.is_empty()
    }
}

/// Observations collected during one calibration run, bounded by `capacity`.
#[derive(Clone, Debug)]
pub struct SampleSet {
    capacity: usize,
    samples: Vec<SamplePair>,
}

impl SampleSet {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            samples: Vec::with_capacity(capacity),
        }
    }

    /// Append a sample. Returns it back when the set is already full.
    pub fn push(&mut self, sample: SamplePair) -> Result<(), SamplePair> {
        if self.is_complete() {
            return Err(sample);
        }
        self.samples.push(sample);
        Ok(())
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.samples.len() >= self.capacity
    }

    pub fn samples(&self) -> &[SamplePair] {
        &self.samples
    }

    pub fn last(&self) -> Option<&SamplePair> {
        self.samples.last()
    }

    /// Freeze the set and hand the observations over.
    pub fn into_samples(self) -> Vec<SamplePair> {
        self.samples
    }
}
