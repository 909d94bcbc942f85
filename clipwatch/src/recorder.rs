//! # Pre-buffered clip recording
//!
//! [`ClipRecorder`] keeps the last few seconds of frames in a ring buffer. Once motion is
//! confirmed, it opens a clip, flushes the buffered frames into it, and keeps recording until no
//! motion has been confirmed for the configured clip duration.
//!
//! Clip length is counted in frames derived from the nominal frame rate, not in wall-clock time.
//! If the camera drifts from the nominal rate, clips are proportionally longer or shorter.

use crate::config::{
    Config, CLIP_DURATION_SECONDS_RANGE, FPS_RANGE, PRE_BUFFER_SECONDS_RANGE,
};
use crate::error::{ClipError, Result};
use crate::frame::Frame;
use crate::sink::{clip_file_name, FrameSink, SinkFactory};
use log::*;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

/// Fixed recorder parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct RecorderSettings {
    pub width: usize,
    pub height: usize,
    pub fps: f32,
    pub pre_buffer_seconds: f32,
    pub clip_duration_seconds: f32,
    pub output_dir: PathBuf,
}

impl RecorderSettings {
    /// Take recorder settings from the pipeline configuration.
    pub fn from_config(config: &Config, width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            fps: config.fps,
            pre_buffer_seconds: config.pre_buffer_seconds,
            clip_duration_seconds: config.clip_duration_seconds,
            output_dir: config.output_dir.clone(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(ClipError::config(format!(
                "frame dimensions {}x{} are empty",
                self.width, self.height
            )));
        }

        if !FPS_RANGE.contains(&self.fps) {
            return Err(ClipError::config(format!("fps = {} is invalid", self.fps)));
        }

        if !PRE_BUFFER_SECONDS_RANGE.contains(&self.pre_buffer_seconds) {
            return Err(ClipError::config(format!(
                "pre_buffer_seconds = {} is invalid",
                self.pre_buffer_seconds
            )));
        }

        if !CLIP_DURATION_SECONDS_RANGE.contains(&self.clip_duration_seconds)
            || self.clip_frames() < 1
        {
            return Err(ClipError::config(format!(
                "clip_duration_seconds = {} is invalid at {} fps",
                self.clip_duration_seconds, self.fps
            )));
        }

        Ok(())
    }

    /// Both frame counts are `fps * seconds` truncated toward zero.
    pub fn pre_buffer_frames(&self) -> usize {
        (self.fps * self.pre_buffer_seconds) as usize
    }

    pub fn clip_frames(&self) -> usize {
        (self.fps * self.clip_duration_seconds) as usize
    }
}

/// Ring buffer of frame copies.
#[derive(Debug)]
pub struct PreBuffer {
    frames: VecDeque<Frame>,
    capacity: usize,
}

impl PreBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a copy of `frame`, evicting the oldest frame when full.
    pub fn push(&mut self, frame: &Frame) {
        if self.capacity == 0 {
            return;
        }

        if self.frames.len() == self.capacity {
            // Reuse the evicted frame's allocation.
            if let Some(mut slot) = self.frames.pop_front() {
                slot.copy_from(frame);
                self.frames.push_back(slot);
                return;
            }
        }

        self.frames.push_back(frame.clone());
    }

    /// Change capacity, dropping the oldest frames if needed.
    pub fn set_capacity(&mut self, capacity: usize) {
        while self.frames.len() > capacity {
            self.frames.pop_front();
        }
        self.capacity = capacity;
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Iterate frames from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &Frame> + '_ {
        self.frames.iter()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

/// A single open clip.
struct RecordingSession {
    path: PathBuf,
    frames_remaining: usize,
    frames_written: usize,
    sink: Box<dyn FrameSink>,
}

impl RecordingSession {
    fn write(&mut self, frame: &Frame) -> Result<()> {
        self.sink
            .write(frame)
            .map_err(|source| ClipError::SinkWriteFailed {
                path: self.path.clone(),
                source,
            })?;
        self.frames_written += 1;
        Ok(())
    }

    fn close(mut self) -> Result<()> {
        info!(
            "Finished recording {:?} ({} frames)",
            self.path, self.frames_written
        );
        self.sink
            .close()
            .map_err(|source| ClipError::SinkWriteFailed {
                path: self.path.clone(),
                source,
            })
    }
}

impl Drop for RecordingSession {
    fn drop(&mut self) {
        // No-op after an explicit close.
        if let Err(e) = self.sink.close() {
            warn!("Error while closing {:?}: {}", self.path, e);
        }
    }
}

/// Recorder state after processing a frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecordingState {
    pub is_recording: bool,
    /// Confirmed motion passed in, returned for convenience.
    pub confirmed_motion: bool,
}

/// Motion triggered clip recorder.
///
/// The recorder is either idle or has exactly one open clip. Dropping the recorder closes any
/// open clip.
pub struct ClipRecorder {
    settings: RecorderSettings,
    clip_frames: usize,
    pre_buffer: PreBuffer,
    session: Option<RecordingSession>,
    factory: Box<dyn SinkFactory>,
}

impl ClipRecorder {
    /// Create a new recorder, creating the output directory if it does not exist.
    ///
    /// # Arguments
    ///
    /// * `settings` - frame dimensions, rate, and timing of the clips.
    /// * `factory` - creates a sink for every new clip.
    pub fn new(settings: RecorderSettings, factory: Box<dyn SinkFactory>) -> Result<Self> {
        settings.validate()?;

        std::fs::create_dir_all(&settings.output_dir).map_err(|e| {
            ClipError::SinkCreationFailed {
                path: settings.output_dir.clone(),
                source: e.into(),
            }
        })?;

        Ok(Self {
            clip_frames: settings.clip_frames(),
            pre_buffer: PreBuffer::new(settings.pre_buffer_frames()),
            settings,
            session: None,
            factory,
        })
    }

    /// Process the next frame.
    ///
    /// The frame is always copied into the pre-buffer, unless its dimensions are wrong, in which
    /// case nothing changes. On the transition into recording, the buffered frames (those that
    /// came before this one) are written first, followed by this frame.
    ///
    /// When the clip cannot be created, the recorder stays idle. When a write fails, the clip is
    /// closed and the recorder returns to idle. Both cases are reported as errors, and the
    /// recorder can keep processing frames afterwards.
    pub fn update(&mut self, frame: &Frame, confirmed_motion: bool) -> Result<RecordingState> {
        let expected = (self.settings.width, self.settings.height);

        if frame.dim() != expected {
            return Err(ClipError::InvalidFrameDimensions {
                expected,
                actual: frame.dim(),
            });
        }

        let ret = self.record(frame, confirmed_motion);

        self.pre_buffer.push(frame);

        ret.map(|_| RecordingState {
            is_recording: self.is_recording(),
            confirmed_motion,
        })
    }

    fn record(&mut self, frame: &Frame, confirmed_motion: bool) -> Result<()> {
        if self.session.is_none() {
            if !confirmed_motion {
                return Ok(());
            }
            self.start_session()?;
        }

        let clip_frames = self.clip_frames;

        let done = match &mut self.session {
            Some(session) => {
                if let Err(e) = session.write(frame) {
                    self.abort_session();
                    return Err(e);
                }

                if confirmed_motion {
                    session.frames_remaining = clip_frames;
                } else {
                    session.frames_remaining = session.frames_remaining.saturating_sub(1);
                }

                session.frames_remaining == 0
            }
            None => false,
        };

        if done {
            self.stop()?;
        }

        Ok(())
    }

    fn start_session(&mut self) -> Result<()> {
        let name = clip_file_name(&chrono::Local::now(), self.factory.extension());
        let path = self.settings.output_dir.join(name);

        let sink = self
            .factory
            .create(
                &path,
                self.settings.width,
                self.settings.height,
                self.settings.fps as f64,
            )
            .map_err(|source| ClipError::SinkCreationFailed {
                path: path.clone(),
                source,
            })?;

        info!("Started recording {:?}", path);

        let mut session = RecordingSession {
            path,
            frames_remaining: self.clip_frames,
            frames_written: 0,
            sink,
        };

        for frame in self.pre_buffer.iter() {
            if let Err(e) = session.write(frame) {
                if let Err(close_err) = session.close() {
                    warn!("Error while closing failed clip: {}", close_err);
                }
                return Err(e);
            }
        }

        debug!("Flushed {} pre-buffered frames", session.frames_written);

        self.session = Some(session);

        Ok(())
    }

    fn abort_session(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(e) = session.close() {
                warn!("Error while closing failed clip: {}", e);
            }
        }
    }

    /// Close the open clip, if any.
    ///
    /// Calling this while idle does nothing.
    pub fn stop(&mut self) -> Result<()> {
        match self.session.take() {
            Some(session) => session.close(),
            None => Ok(()),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.session.is_some()
    }

    /// Frames left in the open clip, unless motion is confirmed again.
    pub fn frames_remaining(&self) -> Option<usize> {
        self.session.as_ref().map(|s| s.frames_remaining)
    }

    /// Path of the open clip.
    pub fn current_clip(&self) -> Option<&Path> {
        self.session.as_ref().map(|s| s.path.as_path())
    }

    pub fn buffered_frames(&self) -> usize {
        self.pre_buffer.len()
    }

    pub fn pre_buffer(&self) -> &PreBuffer {
        &self.pre_buffer
    }

    pub fn settings(&self) -> &RecorderSettings {
        &self.settings
    }

    /// Change clip duration.
    ///
    /// The new length is applied the next time motion is confirmed.
    pub fn set_clip_duration(&mut self, seconds: f32) -> Result<()> {
        let settings = RecorderSettings {
            clip_duration_seconds: seconds,
            ..self.settings.clone()
        };
        settings.validate()?;

        self.clip_frames = settings.clip_frames();
        self.settings = settings;

        debug!("Clip length is now {} frames", self.clip_frames);

        Ok(())
    }

    /// Change the pre-buffer length, dropping the oldest frames when shrinking.
    pub fn set_pre_buffer_seconds(&mut self, seconds: f32) -> Result<()> {
        let settings = RecorderSettings {
            pre_buffer_seconds: seconds,
            ..self.settings.clone()
        };
        settings.validate()?;

        self.pre_buffer.set_capacity(settings.pre_buffer_frames());
        self.settings = settings;

        debug!("Pre-buffer is now {} frames", self.pre_buffer.capacity());

        Ok(())
    }
}

impl Drop for ClipRecorder {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Error while closing clip on shutdown: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::RGBA;
    use crate::sink::ThreadedSinkFactory;
    use anyhow::anyhow;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Counters {
        opens: usize,
        closes: usize,
        clips: Vec<Vec<u8>>,
        fail_create: bool,
        fail_write_at: Option<usize>,
    }

    #[derive(Clone, Default)]
    struct MockFactory(Arc<Mutex<Counters>>);

    struct MockSink {
        counters: Arc<Mutex<Counters>>,
        idx: usize,
        closed: bool,
    }

    impl SinkFactory for MockFactory {
        fn extension(&self) -> &str {
            "mock"
        }

        fn create(
            &mut self,
            _path: &Path,
            _width: usize,
            _height: usize,
            _fps: f64,
        ) -> anyhow::Result<Box<dyn FrameSink>> {
            let mut c = self.0.lock().unwrap();
            if c.fail_create {
                return Err(anyhow!("no disk"));
            }
            // Open sessions must never overlap.
            assert_eq!(c.opens, c.closes);
            c.opens += 1;
            c.clips.push(vec![]);
            Ok(Box::new(MockSink {
                counters: self.0.clone(),
                idx: c.clips.len() - 1,
                closed: false,
            }))
        }
    }

    impl FrameSink for MockSink {
        fn write(&mut self, frame: &Frame) -> anyhow::Result<()> {
            assert!(!self.closed);
            let mut c = self.counters.lock().unwrap();
            if c.fail_write_at == Some(c.clips[self.idx].len()) {
                return Err(anyhow!("write failed"));
            }
            c.clips[self.idx].push(frame.pixels()[0].r);
            Ok(())
        }

        fn close(&mut self) -> anyhow::Result<()> {
            if !self.closed {
                self.closed = true;
                self.counters.lock().unwrap().closes += 1;
            }
            Ok(())
        }
    }

    fn frame(n: u8) -> Frame {
        Frame::filled(4, 3, RGBA::opaque(n, 0, 0))
    }

    fn recorder(
        fps: f32,
        pre: f32,
        clip: f32,
    ) -> (ClipRecorder, MockFactory, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let factory = MockFactory::default();
        let settings = RecorderSettings {
            width: 4,
            height: 3,
            fps,
            pre_buffer_seconds: pre,
            clip_duration_seconds: clip,
            output_dir: dir.path().join("clips"),
        };
        let rec = ClipRecorder::new(settings, Box::new(factory.clone())).unwrap();
        (rec, factory, dir)
    }

    #[test]
    fn creates_output_dir() {
        let (rec, _, dir) = recorder(10.0, 1.0, 1.0);
        assert!(dir.path().join("clips").is_dir());
        assert_eq!(rec.pre_buffer().capacity(), 10);
    }

    #[test]
    fn fractional_rate_truncates() {
        let (rec, _, _dir) = recorder(29.97, 1.0, 1.0);
        assert_eq!(rec.pre_buffer().capacity(), 29);
        assert_eq!(rec.settings().clip_frames(), 29);
    }

    #[test]
    fn rejects_invalid_settings() {
        let dir = tempfile::tempdir().unwrap();
        let settings = RecorderSettings {
            width: 4,
            height: 3,
            fps: 0.0,
            pre_buffer_seconds: 1.0,
            clip_duration_seconds: 1.0,
            output_dir: dir.path().into(),
        };
        assert!(matches!(
            ClipRecorder::new(settings, Box::new(MockFactory::default())),
            Err(ClipError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn idle_only_buffers() {
        let (mut rec, factory, _dir) = recorder(10.0, 1.0, 1.0);

        for i in 0..15 {
            let state = rec.update(&frame(i), false).unwrap();
            assert_eq!(state, RecordingState::default());
        }

        assert_eq!(rec.buffered_frames(), 10);
        assert_eq!(
            rec.pre_buffer().iter().map(|f| f.pixels()[0].r).collect::<Vec<_>>(),
            (5..15).collect::<Vec<_>>()
        );
        assert_eq!(factory.0.lock().unwrap().opens, 0);
    }

    #[test]
    fn trigger_flushes_pre_buffer() {
        let (mut rec, factory, _dir) = recorder(10.0, 1.0, 2.0);

        for i in 0..15 {
            rec.update(&frame(i), false).unwrap();
        }

        let state = rec.update(&frame(15), true).unwrap();
        assert!(state.is_recording);
        assert!(state.confirmed_motion);

        let c = factory.0.lock().unwrap();
        assert_eq!(c.opens, 1);
        assert_eq!(c.clips[0], (5..16).collect::<Vec<_>>());
    }

    #[test]
    fn motion_extends_clip() {
        let (mut rec, factory, _dir) = recorder(10.0, 1.0, 2.0);

        let mut n = 0u8;
        let mut next = || {
            n = n.wrapping_add(1);
            frame(n)
        };

        for _ in 0..10 {
            rec.update(&next(), false).unwrap();
        }

        for _ in 0..25 {
            assert!(rec.update(&next(), true).unwrap().is_recording);
            assert_eq!(rec.frames_remaining(), Some(20));
        }

        for i in 0..20 {
            let state = rec.update(&next(), false).unwrap();
            assert_eq!(state.is_recording, i < 19, "frame {i}");
        }

        assert!(!rec.is_recording());

        let c = factory.0.lock().unwrap();
        assert_eq!(c.opens, 1);
        assert_eq!(c.closes, 1);
        assert_eq!(c.clips[0].len(), 10 + 45);
        assert_eq!(c.clips[0], (1..=55).collect::<Vec<_>>());
    }

    #[test]
    fn buffer_stays_warm_while_recording() {
        let (mut rec, factory, _dir) = recorder(10.0, 0.5, 0.1);

        rec.update(&frame(0), true).unwrap();
        rec.update(&frame(1), false).unwrap();
        assert!(!rec.is_recording());
        assert_eq!(rec.buffered_frames(), 2);

        for i in 2..7 {
            rec.update(&frame(i), false).unwrap();
        }

        rec.update(&frame(7), true).unwrap();
        rec.update(&frame(8), false).unwrap();

        let c = factory.0.lock().unwrap();
        assert_eq!(c.opens, 2);
        assert_eq!(c.closes, 2);
        assert_eq!(c.clips[0], vec![0, 1]);
        assert_eq!(c.clips[1], vec![2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn at_most_one_session() {
        let (mut rec, factory, _dir) = recorder(10.0, 0.3, 0.3);

        let pattern = [true, false, true, true, false, false, false, false, true, false];

        for (i, &m) in pattern.iter().cycle().take(200).enumerate() {
            rec.update(&frame(i as u8), m).unwrap();
            let c = factory.0.lock().unwrap();
            assert_eq!(c.opens, c.closes + rec.is_recording() as usize);
        }

        drop(rec);

        let c = factory.0.lock().unwrap();
        assert_eq!(c.opens, c.closes);
    }

    #[test]
    fn stop_is_idempotent() {
        let (mut rec, factory, _dir) = recorder(10.0, 1.0, 1.0);

        rec.update(&frame(0), true).unwrap();
        assert!(rec.is_recording());

        rec.stop().unwrap();
        assert!(!rec.is_recording());
        rec.stop().unwrap();
        assert!(!rec.is_recording());

        assert_eq!(factory.0.lock().unwrap().closes, 1);
    }

    #[test]
    fn drop_closes_session() {
        let (mut rec, factory, _dir) = recorder(10.0, 1.0, 1.0);
        rec.update(&frame(0), true).unwrap();
        drop(rec);

        let c = factory.0.lock().unwrap();
        assert_eq!((c.opens, c.closes), (1, 1));
    }

    #[test]
    fn wrong_dimensions_rejected() {
        let (mut rec, _, _dir) = recorder(10.0, 1.0, 1.0);

        let err = rec.update(&Frame::new(3, 4), true).unwrap_err();
        assert!(matches!(err, ClipError::InvalidFrameDimensions { .. }));
        assert!(!rec.is_recording());
        assert_eq!(rec.buffered_frames(), 0);
    }

    #[test]
    fn creation_failure_stays_idle() {
        let (mut rec, factory, _dir) = recorder(10.0, 1.0, 1.0);
        factory.0.lock().unwrap().fail_create = true;

        let err = rec.update(&frame(0), true).unwrap_err();
        assert!(matches!(err, ClipError::SinkCreationFailed { .. }));
        assert!(!rec.is_recording());
        assert_eq!(rec.buffered_frames(), 1);

        factory.0.lock().unwrap().fail_create = false;
        assert!(rec.update(&frame(1), true).unwrap().is_recording);
        assert_eq!(factory.0.lock().unwrap().clips[0], vec![0, 1]);
    }

    #[test]
    fn write_failure_closes_session() {
        let (mut rec, factory, _dir) = recorder(10.0, 1.0, 1.0);
        factory.0.lock().unwrap().fail_write_at = Some(3);

        rec.update(&frame(0), true).unwrap();
        rec.update(&frame(1), true).unwrap();
        rec.update(&frame(2), true).unwrap();

        let err = rec.update(&frame(3), true).unwrap_err();
        assert!(matches!(err, ClipError::SinkWriteFailed { .. }));
        assert!(!rec.is_recording());

        {
            let mut c = factory.0.lock().unwrap();
            assert_eq!((c.opens, c.closes), (1, 1));
            c.fail_write_at = None;
        }

        // The pipeline keeps going with a fresh clip.
        assert!(rec.update(&frame(4), true).unwrap().is_recording);
        assert_eq!(factory.0.lock().unwrap().opens, 2);
    }

    #[test]
    fn flush_failure_stays_idle() {
        let (mut rec, factory, _dir) = recorder(10.0, 1.0, 1.0);

        for i in 0..5 {
            rec.update(&frame(i), false).unwrap();
        }

        factory.0.lock().unwrap().fail_write_at = Some(2);

        let err = rec.update(&frame(5), true).unwrap_err();
        assert!(matches!(err, ClipError::SinkWriteFailed { .. }));
        assert!(!rec.is_recording());
        assert_eq!(rec.frames_remaining(), None);
        assert_eq!(rec.buffered_frames(), 6);

        {
            let mut c = factory.0.lock().unwrap();
            assert_eq!((c.opens, c.closes), (1, 1));
            assert_eq!(c.clips[0], vec![0, 1]);
            c.fail_write_at = None;
        }

        assert!(rec.update(&frame(6), true).unwrap().is_recording);
        assert_eq!(factory.0.lock().unwrap().clips[1], (0..=6).collect::<Vec<_>>());
    }

    #[test]
    fn threaded_write_failure_stays_idle() {
        let dir = tempfile::tempdir().unwrap();
        let factory = MockFactory::default();
        factory.0.lock().unwrap().fail_write_at = Some(2);

        let settings = RecorderSettings {
            width: 4,
            height: 3,
            fps: 10.0,
            pre_buffer_seconds: 1.0,
            clip_duration_seconds: 1.0,
            output_dir: dir.path().join("clips"),
        };
        let mut rec = ClipRecorder::new(
            settings,
            Box::new(ThreadedSinkFactory::new(factory.clone(), 1)),
        )
        .unwrap();

        // The writer thread fails asynchronously, a later write or the close reports it.
        let err = (0..100)
            .find_map(|i| rec.update(&frame(i), true).err())
            .or_else(|| rec.stop().err())
            .expect("write failure was not reported");

        assert!(matches!(err, ClipError::SinkWriteFailed { .. }));
        assert!(!rec.is_recording());

        let c = factory.0.lock().unwrap();
        assert_eq!((c.opens, c.closes), (1, 1));
        assert_eq!(c.clips[0], vec![0, 1]);
    }

    #[test]
    fn caller_mutation_does_not_leak() {
        let (mut rec, factory, _dir) = recorder(10.0, 1.0, 1.0);

        let mut buf = frame(1);
        rec.update(&buf, false).unwrap();
        buf.pixels_mut()[0] = RGBA::opaque(99, 0, 0);
        assert_eq!(rec.pre_buffer().iter().next().unwrap().pixels()[0].r, 1);

        rec.update(&buf, true).unwrap();
        buf.pixels_mut()[0] = RGBA::opaque(42, 0, 0);

        assert_eq!(factory.0.lock().unwrap().clips[0], vec![1, 99]);
        assert_eq!(
            rec.pre_buffer().iter().map(|f| f.pixels()[0].r).collect::<Vec<_>>(),
            vec![1, 99]
        );
    }

    #[test]
    fn reconfigure_at_runtime() {
        let (mut rec, _, _dir) = recorder(10.0, 1.0, 1.0);

        for i in 0..10 {
            rec.update(&frame(i), false).unwrap();
        }

        rec.set_pre_buffer_seconds(0.5).unwrap();
        assert_eq!(rec.buffered_frames(), 5);
        assert_eq!(rec.pre_buffer().iter().next().unwrap().pixels()[0].r, 5);

        assert!(rec.set_clip_duration(0.0).is_err());
        rec.set_clip_duration(3.0).unwrap();
        rec.update(&frame(10), true).unwrap();
        assert_eq!(rec.frames_remaining(), Some(30));
    }
}
