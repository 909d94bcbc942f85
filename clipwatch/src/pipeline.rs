//! # Motion pipeline
//!
//! [`MotionPipeline`] ties the debouncer, the recorder and the event log together for a single
//! stream. [`PipelineWorker`] runs a pipeline on its own thread, pulling frames from a
//! [`FrameSource`].

use crate::config::{Config, SharedConfig};
use crate::debounce::MotionDebouncer;
use crate::detection::Detection;
use crate::error::{ClipError, Result};
use crate::event_log::{EventLogger, SnapshotWriter};
use crate::frame::{Frame, RGBA};
use crate::recorder::{ClipRecorder, RecorderSettings};
use crate::sink::SinkFactory;
use crate::source::FrameSource;
use log::*;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, PoisonError, RwLock,
};
use std::thread::{spawn, JoinHandle};
use std::time::Instant;

/// Maximum number of errors kept for [`PipelineWorker::take_errors`]. Older errors are dropped.
pub const MAX_PENDING_ERRORS: usize = 64;

/// Outcome of processing a single frame.
#[derive(Debug, Default)]
pub struct FrameReport {
    pub frame_index: usize,
    /// At least one region passed contour thresholding.
    pub raw_motion: bool,
    /// Motion held for the whole persistence window.
    pub confirmed_motion: bool,
    pub is_recording: bool,
    pub detections: Vec<Detection>,
    pub current_clip: Option<PathBuf>,
    /// Measured processing rate, in frames per second.
    pub fps: f32,
    /// Errors that occurred while processing. None of them stop the pipeline.
    pub errors: Vec<ClipError>,
}

/// Measures the live frame rate from the time between frames.
///
/// Individual intervals are smoothed with an exponential moving average.
#[derive(Clone, Debug, Default)]
pub struct FpsMeter {
    last: Option<Instant>,
    fps: f32,
}

impl FpsMeter {
    const SMOOTHING: f32 = 0.1;

    /// Record a frame at `now` and return the updated rate.
    pub fn tick(&mut self, now: Instant) -> f32 {
        if let Some(last) = self.last.replace(now) {
            let secs = now.saturating_duration_since(last).as_secs_f32();

            if secs > 0.0 {
                let fps = 1.0 / secs;
                self.fps = if self.fps == 0.0 {
                    fps
                } else {
                    self.fps + (fps - self.fps) * Self::SMOOTHING
                };
            }
        }

        self.fps
    }

    /// Current rate. Zero until two frames have been seen.
    pub fn fps(&self) -> f32 {
        self.fps
    }
}

/// Motion confirmation, recording and event logging for a single stream.
pub struct MotionPipeline {
    debouncer: MotionDebouncer,
    recorder: ClipRecorder,
    snapshots: Box<dyn SnapshotWriter>,
    logger: Option<EventLogger>,
    failed_log_dir: Option<PathBuf>,
    applied: Config,
    frames: usize,
    fps: FpsMeter,
}

impl MotionPipeline {
    /// Create a new pipeline.
    ///
    /// # Arguments
    ///
    /// * `config` - initial configuration.
    /// * `(width, height)` - dimensions of every frame of the stream.
    /// * `factory` - creates sinks for recorded clips.
    /// * `snapshots` - writes snapshots of logged events.
    pub fn new(
        config: &Config,
        (width, height): (usize, usize),
        factory: Box<dyn SinkFactory>,
        snapshots: Box<dyn SnapshotWriter>,
    ) -> Result<Self> {
        config.validate()?;

        let debouncer = MotionDebouncer::new(config.persistence)?;
        let recorder = ClipRecorder::new(
            RecorderSettings::from_config(config, width, height),
            factory,
        )?;

        Ok(Self {
            debouncer,
            recorder,
            snapshots,
            logger: None,
            failed_log_dir: None,
            applied: config.clone(),
            frames: 0,
            fps: FpsMeter::default(),
        })
    }

    /// Number of frames accepted so far.
    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn recorder(&self) -> &ClipRecorder {
        &self.recorder
    }

    pub fn debouncer(&self) -> &MotionDebouncer {
        &self.debouncer
    }

    /// Path of the current event log, if logging has started.
    pub fn event_log(&self) -> Option<&std::path::Path> {
        self.logger.as_ref().map(EventLogger::path)
    }

    /// Process the next frame.
    ///
    /// Detections are logged, motion is confirmed and the frame is passed to the recorder. After
    /// that, `frame` is annotated with the detections and the recording state for display.
    ///
    /// A frame with the wrong dimensions is rejected before anything else happens, and the
    /// returned report only carries the error.
    pub fn process(
        &mut self,
        frame: &mut Frame,
        detections: &[Detection],
        config: &Config,
    ) -> FrameReport {
        let settings = self.recorder.settings();
        let expected = (settings.width, settings.height);

        if frame.dim() != expected {
            return FrameReport {
                frame_index: self.frames,
                is_recording: self.recorder.is_recording(),
                current_clip: self.recorder.current_clip().map(Into::into),
                fps: self.fps.fps(),
                errors: vec![ClipError::InvalidFrameDimensions {
                    expected,
                    actual: frame.dim(),
                }],
                ..Default::default()
            };
        }

        let fps = self.fps.tick(Instant::now());

        let mut errors = vec![];

        self.apply_config(config, &mut errors);

        let frame_index = self.frames;
        self.frames += 1;

        let raw_motion = !detections.is_empty();

        if config.log_enabled && raw_motion {
            self.log_detections(frame, detections, config, &mut errors);
        }

        let confirmed_motion = self.debouncer.observe(raw_motion);

        let is_recording = match self.recorder.update(frame, confirmed_motion) {
            Ok(state) => state.is_recording,
            Err(e) => {
                errors.push(e);
                self.recorder.is_recording()
            }
        };

        if config.show_debug {
            debug!(
                "Frame {}: {} regions, confirmed: {}, recording: {}",
                frame_index,
                detections.len(),
                confirmed_motion,
                is_recording
            );
        }

        annotate(frame, detections, is_recording);

        FrameReport {
            frame_index,
            raw_motion,
            confirmed_motion,
            is_recording,
            detections: detections.to_vec(),
            current_clip: self.recorder.current_clip().map(Into::into),
            fps,
            errors,
        }
    }

    /// Close any open clip.
    pub fn stop(&mut self) -> Result<()> {
        self.recorder.stop()
    }

    fn apply_config(&mut self, config: &Config, errors: &mut Vec<ClipError>) {
        if *config == self.applied {
            return;
        }

        if config.persistence != self.applied.persistence {
            debug!("Persistence changed to {}", config.persistence);
            if let Err(e) = self.debouncer.set_persistence(config.persistence) {
                errors.push(e);
            }
        }

        if config.clip_duration_seconds != self.applied.clip_duration_seconds {
            if let Err(e) = self.recorder.set_clip_duration(config.clip_duration_seconds) {
                errors.push(e);
            }
        }

        if config.pre_buffer_seconds != self.applied.pre_buffer_seconds {
            if let Err(e) = self
                .recorder
                .set_pre_buffer_seconds(config.pre_buffer_seconds)
            {
                errors.push(e);
            }
        }

        // Frame rate and output directory are fixed for the lifetime of the recorder.
        if config.fps != self.applied.fps || config.output_dir != self.applied.output_dir {
            errors.push(ClipError::config(
                "fps and output_dir changes take effect after a restart",
            ));
        }

        self.applied = config.clone();
    }

    fn log_detections(
        &mut self,
        frame: &Frame,
        detections: &[Detection],
        config: &Config,
        errors: &mut Vec<ClipError>,
    ) {
        if self.logger.as_ref().map(|l| l.dir()) != Some(config.log_dir.as_path()) {
            self.logger = None;

            // Do not retry a broken directory on every frame.
            if self.failed_log_dir.as_ref() == Some(&config.log_dir) {
                return;
            }

            match EventLogger::create(&config.log_dir) {
                Ok(logger) => {
                    self.failed_log_dir = None;
                    self.logger = Some(logger);
                }
                Err(e) => {
                    self.failed_log_dir = Some(config.log_dir.clone());
                    errors.push(e);
                    return;
                }
            }
        }

        if let Some(logger) = &mut self.logger {
            let now = chrono::Local::now();
            for detection in detections {
                if let Err(e) = logger.log(&now, detection, frame, &mut *self.snapshots) {
                    errors.push(e);
                    break;
                }
            }
        }
    }
}

/// Draw detection boxes, centroids and the recording marker.
pub fn annotate(frame: &mut Frame, detections: &[Detection], is_recording: bool) {
    for d in detections {
        frame.draw_rect(d.bounds, 2, RGBA::GREEN);
        let (cx, cy) = d.centroid;
        frame.fill_rect(cx.saturating_sub(2), cy.saturating_sub(2), 5, 5, RGBA::RED);
    }

    if is_recording {
        frame.fill_rect(10, 10, 12, 12, RGBA::RED);
    }
}

fn append_capped(errors: &mut Vec<String>, new: impl IntoIterator<Item = String>) {
    errors.extend(new);

    if errors.len() > MAX_PENDING_ERRORS {
        let excess = errors.len() - MAX_PENDING_ERRORS;
        errors.drain(..excess);
    }
}

/// Latest state published by a [`PipelineWorker`].
#[derive(Clone, Debug, Default)]
pub struct PipelineOutput {
    /// Last annotated frame.
    pub frame: Frame,
    pub frames: usize,
    pub raw_motion: bool,
    pub confirmed_motion: bool,
    pub is_recording: bool,
    pub current_clip: Option<PathBuf>,
    pub detections: Vec<Detection>,
    /// Measured processing rate, in frames per second.
    pub fps: f32,
    /// Errors not yet taken by [`PipelineWorker::take_errors`], at most
    /// [`MAX_PENDING_ERRORS`] of them.
    pub errors: Vec<String>,
    pub running: bool,
}

impl PipelineOutput {
    /// Overlay text for a preview window, top to bottom.
    pub fn status_lines(&self, now: &chrono::NaiveDateTime) -> [String; 3] {
        let status = if self.raw_motion {
            "Motion detected!"
        } else {
            "No motion"
        };

        [
            format!("Status: {status}"),
            format!("FPS: {:.1}", self.fps),
            now.format("%Y-%m-%d %H:%M:%S").to_string(),
        ]
    }
}

/// Runs a [`MotionPipeline`] on a background thread.
///
/// The worker checks its stop signal before every frame, and closes any open clip before the
/// thread exits. Output is published without ever waiting on readers, so a slow preview cannot
/// stall processing.
pub struct PipelineWorker {
    output: Arc<RwLock<PipelineOutput>>,
    config: SharedConfig,
    signal: Arc<AtomicBool>,
    handle: Option<JoinHandle<anyhow::Result<()>>>,
}

impl PipelineWorker {
    /// Start processing frames of `source` on a new thread.
    pub fn spawn(
        mut source: Box<dyn FrameSource>,
        mut pipeline: MotionPipeline,
        config: SharedConfig,
    ) -> Self {
        let output = Arc::new(RwLock::new(PipelineOutput {
            running: true,
            ..Default::default()
        }));
        let signal = Arc::new(AtomicBool::new(true));

        let handle = Some({
            let output = output.clone();
            let signal = signal.clone();
            let config = config.clone();

            spawn(move || {
                let mut frame = Frame::default();
                let mut detections = vec![];
                let mut pending_errors = vec![];

                let ret = loop {
                    if !signal.load(Ordering::SeqCst) {
                        break Ok(());
                    }

                    let config = config.snapshot();

                    match source.next_frame(&mut frame, &mut detections, &config.detection_tuning())
                    {
                        Ok(true) => {}
                        Ok(false) => {
                            info!("Stream ended");
                            break Ok(());
                        }
                        Err(e) => {
                            error!("Failed to grab frame: {}", e);
                            break Err(e);
                        }
                    }

                    let report = pipeline.process(&mut frame, &detections, &config);

                    append_capped(
                        &mut pending_errors,
                        report.errors.iter().map(ToString::to_string),
                    );

                    if let Ok(mut out) = output.try_write() {
                        out.frame.copy_from(&frame);
                        out.frames = pipeline.frames();
                        out.raw_motion = report.raw_motion;
                        out.confirmed_motion = report.confirmed_motion;
                        out.is_recording = report.is_recording;
                        out.current_clip = report.current_clip;
                        out.detections = report.detections;
                        out.fps = report.fps;
                        append_capped(&mut out.errors, pending_errors.drain(..));
                    }
                };

                if let Err(e) = pipeline.stop() {
                    pending_errors.push(e.to_string());
                }

                let mut out = output.write().unwrap_or_else(PoisonError::into_inner);
                out.frames = pipeline.frames();
                out.is_recording = false;
                out.current_clip = None;
                out.running = false;
                append_capped(&mut out.errors, pending_errors.drain(..));

                ret
            })
        });

        Self {
            output,
            config,
            signal,
            handle,
        }
    }

    /// Configuration shared with the worker thread.
    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    /// Copy of the latest published output.
    pub fn output(&self) -> PipelineOutput {
        self.output
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Take all errors reported since the last call.
    pub fn take_errors(&self) -> Vec<String> {
        std::mem::take(
            &mut self
                .output
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .errors,
        )
    }

    /// Whether the worker thread is still processing frames.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }

    /// Request the worker to stop and wait for it to exit.
    ///
    /// Returns the error that ended the stream, if any. Calling this again does nothing.
    pub fn stop(&mut self) -> anyhow::Result<()> {
        self.signal.store(false, Ordering::SeqCst);

        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| anyhow::anyhow!("Pipeline worker panicked"))?,
            None => Ok(()),
        }
    }
}

impl Drop for PipelineWorker {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Pipeline worker exited with error: {}", e);
        }
    }
}
