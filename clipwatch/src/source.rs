//! # Frame sources

use crate::config::DetectionTuning;
use crate::detection::{BlockDiffDetector, Detection};
use crate::frame::Frame;
use crate::sink::RawClipReader;
use anyhow::Result;
use std::io::Read;
use std::path::Path;

/// Camera or video stream paired with a motion candidate detector.
pub trait FrameSource: Send {
    /// Grab and analyse the next frame.
    ///
    /// On success, `frame` holds the new image and `detections` holds every region that passed
    /// contour thresholding. `Ok(false)` is returned once the stream has ended, and `Err` if the
    /// frame could not be grabbed.
    ///
    /// # Arguments
    ///
    /// * `frame` - frame to write into. Sources should reuse its allocation.
    /// * `detections` - output list of moving regions. Cleared by the source.
    /// * `tuning` - thresholds taken from the live configuration.
    fn next_frame(
        &mut self,
        frame: &mut Frame,
        detections: &mut Vec<Detection>,
        tuning: &DetectionTuning,
    ) -> Result<bool>;

    /// Get the framerate of the stream.
    ///
    /// This will return `Some(framerate)` if it is known. On realtime streams it may
    /// not always be known. In such cases, `None` is returned.
    fn framerate(&self) -> Option<f64>;

    /// Get frame dimensions as `(width, height)`, if known.
    fn dimensions(&self) -> Option<(usize, usize)>;
}

/// Replays a raw clip file through a [`BlockDiffDetector`].
pub struct RawClipSource<T> {
    reader: RawClipReader<T>,
    detector: BlockDiffDetector,
}

impl RawClipSource<std::io::BufReader<std::fs::File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(RawClipReader::open(path)?))
    }
}

impl<T: Read> RawClipSource<T> {
    pub fn new(reader: RawClipReader<T>) -> Self {
        Self {
            reader,
            detector: Default::default(),
        }
    }
}

impl<T: Read + Send> FrameSource for RawClipSource<T> {
    fn next_frame(
        &mut self,
        frame: &mut Frame,
        detections: &mut Vec<Detection>,
        tuning: &DetectionTuning,
    ) -> Result<bool> {
        detections.clear();

        if !self.reader.read_frame(frame)? {
            return Ok(false);
        }

        self.detector.detect(frame, tuning, detections);

        Ok(true)
    }

    fn framerate(&self) -> Option<f64> {
        Some(self.reader.fps()).filter(|f| *f > 0.0)
    }

    fn dimensions(&self) -> Option<(usize, usize)> {
        Some(self.reader.dim())
    }
}
