//! # Motion Triggered Clip Recording Library
//!
//! This library turns a stream of frames with motion candidates into short video clips. Raw
//! motion is confirmed over a sliding window of frames, and every confirmed event is recorded
//! together with a few seconds of footage preceding it.
//!
//! The easiest way to use the library is to import its prelude:
//!
//! ```
//! use clipwatch::prelude::v1::*;
//! ```
//!
//! Capture and encoding backends plug in through the [`source::FrameSource`] and
//! [`sink::SinkFactory`] traits. A dependency free raw clip format is provided out of the box.

pub mod config;
pub mod debounce;
pub mod detection;
pub mod error;
pub mod event_log;
pub mod frame;
pub mod pipeline;
pub mod properties;
pub mod recorder;
pub mod sink;
pub mod source;

pub mod prelude {
    pub mod v1 {
        pub use crate::{
            config::{Config, DetectionTuning, SharedConfig},
            debounce::MotionDebouncer,
            detection::{BlockDiffDetector, Detection},
            error::ClipError,
            event_log::{EventLogger, PpmSnapshotWriter, SnapshotWriter},
            frame::{Frame, RGBA},
            pipeline::{
                FpsMeter, FrameReport, MotionPipeline, PipelineOutput, PipelineWorker,
                MAX_PENDING_ERRORS,
            },
            properties::{BoundedProp, Properties, Property},
            recorder::{ClipRecorder, PreBuffer, RecorderSettings, RecordingState},
            sink::{
                FrameSink, RawClipFactory, RawClipReader, RawClipSink, SinkFactory,
                ThreadedSinkFactory,
            },
            source::{FrameSource, RawClipSource},
        };
        pub use anyhow::{anyhow, Error, Result};
    }
}
