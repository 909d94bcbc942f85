//! # Pipeline configuration
//!
//! Every pipeline instance owns its own [`Config`]. When the pipeline runs on a worker thread,
//! the configuration is shared through [`SharedConfig`], which hands out whole snapshots so that
//! a multi-field read is never torn.

use crate::error::{ClipError, Result};
use crate::properties::{Properties, Property};
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub const THRESHOLD_RANGE: RangeInclusive<usize> = 1..=255;
pub const MIN_CONTOUR_AREA_RANGE: RangeInclusive<usize> = 1..=10_000_000;
pub const PERSISTENCE_RANGE: RangeInclusive<usize> = 1..=300;
pub const FPS_RANGE: RangeInclusive<f32> = 0.1..=1000.0;
pub const PRE_BUFFER_SECONDS_RANGE: RangeInclusive<f32> = 0.0..=60.0;
pub const CLIP_DURATION_SECONDS_RANGE: RangeInclusive<f32> = 0.1..=3600.0;

/// Tunables forwarded to the frame source's contour thresholding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DetectionTuning {
    /// Foreground mask threshold.
    pub threshold: usize,
    /// Smallest contour area, in pixels, counted as motion.
    pub min_contour_area: usize,
}

impl Default for DetectionTuning {
    fn default() -> Self {
        Config::default().detection_tuning()
    }
}

/// Motion detection and recording configuration.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(::serde::Serialize, ::serde::Deserialize),
    serde(default)
)]
pub struct Config {
    pub threshold: usize,
    pub min_contour_area: usize,
    /// Consecutive frames with motion before it is confirmed.
    pub persistence: usize,
    pub pre_buffer_seconds: f32,
    pub clip_duration_seconds: f32,
    /// Nominal frame rate. Clip lengths are counted in frames derived from it.
    pub fps: f32,
    pub output_dir: PathBuf,
    pub log_enabled: bool,
    pub log_dir: PathBuf,
    pub show_debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            threshold: 5,
            min_contour_area: 1000,
            persistence: 5,
            pre_buffer_seconds: 1.0,
            clip_duration_seconds: 5.0,
            fps: 30.0,
            output_dir: "motion_clips".into(),
            log_enabled: true,
            log_dir: "motion_logs".into(),
            show_debug: false,
        }
    }
}

fn check<T: PartialOrd + std::fmt::Debug>(
    name: &str,
    val: T,
    range: RangeInclusive<T>,
) -> Result<()> {
    if range.contains(&val) {
        Ok(())
    } else {
        Err(ClipError::config(format!(
            "{name} = {val:?} is outside of {range:?}"
        )))
    }
}

impl Config {
    /// Check every field.
    pub fn validate(&self) -> Result<()> {
        check("threshold", self.threshold, THRESHOLD_RANGE)?;
        check(
            "min_contour_area",
            self.min_contour_area,
            MIN_CONTOUR_AREA_RANGE,
        )?;
        check("persistence", self.persistence, PERSISTENCE_RANGE)?;
        check("fps", self.fps, FPS_RANGE)?;
        check(
            "pre_buffer_seconds",
            self.pre_buffer_seconds,
            PRE_BUFFER_SECONDS_RANGE,
        )?;
        check(
            "clip_duration_seconds",
            self.clip_duration_seconds,
            CLIP_DURATION_SECONDS_RANGE,
        )?;

        if self.clip_frames() < 1 {
            return Err(ClipError::config(format!(
                "clip of {} s at {} fps is shorter than a frame",
                self.clip_duration_seconds, self.fps
            )));
        }

        if self.output_dir.as_os_str().is_empty() {
            return Err(ClipError::config("output_dir is empty"));
        }

        if self.log_enabled && self.log_dir.as_os_str().is_empty() {
            return Err(ClipError::config("log_dir is empty"));
        }

        Ok(())
    }

    /// Capacity of the pre-trigger buffer, in frames.
    ///
    /// Truncated toward zero: one second at 29.97 fps buffers 29 frames.
    pub fn pre_buffer_frames(&self) -> usize {
        (self.fps * self.pre_buffer_seconds) as usize
    }

    /// Frames recorded after the last confirmed motion, truncated toward zero.
    pub fn clip_frames(&self) -> usize {
        (self.fps * self.clip_duration_seconds) as usize
    }

    pub fn detection_tuning(&self) -> DetectionTuning {
        DetectionTuning {
            threshold: self.threshold,
            min_contour_area: self.min_contour_area,
        }
    }

    /// Apply `f` to a copy of the configuration and commit it only if it validates.
    pub fn try_update(&mut self, f: impl FnOnce(&mut Self)) -> Result<()> {
        let mut candidate = self.clone();
        f(&mut candidate);
        candidate.validate()?;
        *self = candidate;
        Ok(())
    }

    pub fn set_threshold(&mut self, threshold: usize) -> Result<()> {
        self.try_update(|c| c.threshold = threshold)
    }

    pub fn set_min_contour_area(&mut self, area: usize) -> Result<()> {
        self.try_update(|c| c.min_contour_area = area)
    }

    pub fn set_persistence(&mut self, persistence: usize) -> Result<()> {
        self.try_update(|c| c.persistence = persistence)
    }

    pub fn set_pre_buffer_seconds(&mut self, seconds: f32) -> Result<()> {
        self.try_update(|c| c.pre_buffer_seconds = seconds)
    }

    pub fn set_clip_duration_seconds(&mut self, seconds: f32) -> Result<()> {
        self.try_update(|c| c.clip_duration_seconds = seconds)
    }

    pub fn set_fps(&mut self, fps: f32) -> Result<()> {
        self.try_update(|c| c.fps = fps)
    }

    pub fn set_output_dir(&mut self, dir: impl Into<PathBuf>) -> Result<()> {
        let dir = dir.into();
        self.try_update(|c| c.output_dir = dir)
    }

    pub fn set_log_enabled(&mut self, enabled: bool) -> Result<()> {
        self.try_update(|c| c.log_enabled = enabled)
    }

    pub fn set_log_dir(&mut self, dir: impl Into<PathBuf>) -> Result<()> {
        let dir = dir.into();
        self.try_update(|c| c.log_dir = dir)
    }

    pub fn set_show_debug(&mut self, show: bool) -> Result<()> {
        self.try_update(|c| c.show_debug = show)
    }
}

impl Properties for Config {
    fn props(&self) -> Vec<(&'static str, Property)> {
        let usize_prop = |val, range: RangeInclusive<usize>| {
            Property::usize(val, *range.start(), *range.end())
        };
        let float_prop =
            |val, range: RangeInclusive<f32>| Property::float(val, *range.start(), *range.end());

        vec![
            ("threshold", usize_prop(self.threshold, THRESHOLD_RANGE)),
            (
                "min_contour_area",
                usize_prop(self.min_contour_area, MIN_CONTOUR_AREA_RANGE),
            ),
            ("persistence", usize_prop(self.persistence, PERSISTENCE_RANGE)),
            (
                "pre_buffer_seconds",
                float_prop(self.pre_buffer_seconds, PRE_BUFFER_SECONDS_RANGE),
            ),
            (
                "clip_duration_seconds",
                float_prop(self.clip_duration_seconds, CLIP_DURATION_SECONDS_RANGE),
            ),
            ("fps", float_prop(self.fps, FPS_RANGE)),
            ("output_dir", Property::path(&self.output_dir)),
            ("log_enabled", Property::bool(self.log_enabled)),
            ("log_dir", Property::path(&self.log_dir)),
            ("show_debug", Property::bool(self.show_debug)),
        ]
    }

    fn set_prop(&mut self, name: &str, prop: &Property) -> Result<()> {
        match (name, prop) {
            ("threshold", Property::Usize(p)) => self.set_threshold(p.val),
            ("min_contour_area", Property::Usize(p)) => self.set_min_contour_area(p.val),
            ("persistence", Property::Usize(p)) => self.set_persistence(p.val),
            ("pre_buffer_seconds", Property::Float(p)) => self.set_pre_buffer_seconds(p.val),
            ("clip_duration_seconds", Property::Float(p)) => {
                self.set_clip_duration_seconds(p.val)
            }
            ("fps", Property::Float(p)) => self.set_fps(p.val),
            ("output_dir", Property::Path(p)) => self.set_output_dir(p),
            ("log_enabled", Property::Bool(b)) => self.set_log_enabled(*b),
            ("log_dir", Property::Path(p)) => self.set_log_dir(p),
            ("show_debug", Property::Bool(b)) => self.set_show_debug(*b),
            _ if self.props().iter().any(|(n, _)| *n == name) => Err(ClipError::config(
                format!("{name} cannot be set from {prop:?}"),
            )),
            _ => Err(ClipError::config(format!("unknown property {name}"))),
        }
    }
}

/// Thread-safe configuration handle.
///
/// Cloning the handle shares the same underlying configuration.
#[derive(Clone, Debug, Default)]
pub struct SharedConfig {
    inner: Arc<Mutex<Config>>,
}

impl SharedConfig {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Mutex::new(config)),
        })
    }

    fn lock(&self) -> MutexGuard<Config> {
        // Config is always valid between operations, so a poisoned lock is still usable.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get a consistent copy of the whole configuration.
    pub fn snapshot(&self) -> Config {
        self.lock().clone()
    }

    /// Atomically update the configuration, committing only valid results.
    pub fn update(&self, f: impl FnOnce(&mut Config)) -> Result<()> {
        self.lock().try_update(f)
    }

    pub fn set_prop(&self, name: &str, prop: &Property) -> Result<()> {
        self.lock().set_prop(name, prop)
    }

    pub fn props(&self) -> Vec<(&'static str, Property)> {
        self.lock().props()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.pre_buffer_frames(), 30);
        assert_eq!(config.clip_frames(), 150);
    }

    #[test]
    fn frame_counts_truncate() {
        let config = Config {
            fps: 29.97,
            pre_buffer_seconds: 1.0,
            clip_duration_seconds: 5.0,
            ..Default::default()
        };
        assert_eq!(config.pre_buffer_frames(), 29);
        assert_eq!(config.clip_frames(), 149);
    }

    #[test]
    fn setters_validate() {
        let mut config = Config::default();

        assert!(matches!(
            config.set_persistence(0),
            Err(ClipError::InvalidConfiguration(_))
        ));
        assert!(config.set_fps(0.0).is_err());
        assert!(config.set_fps(-30.0).is_err());
        assert!(config.set_clip_duration_seconds(f32::NAN).is_err());
        assert_eq!(config, Config::default());

        config.set_persistence(3).unwrap();
        assert_eq!(config.persistence, 3);
    }

    #[test]
    fn clip_shorter_than_frame_rejected() {
        let mut config = Config::default();
        config.set_fps(1.0).unwrap();
        assert!(config.set_clip_duration_seconds(0.5).is_err());
    }

    #[test]
    fn set_prop_by_name() {
        let mut config = Config::default();

        let (_, persistence) = config
            .props()
            .into_iter()
            .find(|(n, _)| *n == "persistence")
            .unwrap();

        let three = persistence.parse_like("3").unwrap();
        config.set_prop("persistence", &three).unwrap();
        assert_eq!(config.persistence, 3);

        let zero = persistence.parse_like("0").unwrap();
        assert!(config.set_prop("persistence", &zero).is_err());
        assert_eq!(config.persistence, 3);

        assert!(config.set_prop("persistence", &Property::bool(true)).is_err());
        assert!(config.set_prop("bogus", &Property::bool(true)).is_err());
    }

    #[test]
    fn shared_config_is_shared() {
        let shared = SharedConfig::new(Config::default()).unwrap();
        let other = shared.clone();

        other.update(|c| c.threshold = 20).unwrap();
        assert_eq!(shared.snapshot().threshold, 20);

        assert!(other.update(|c| c.threshold = 0).is_err());
        assert_eq!(shared.snapshot().threshold, 20);
    }

    #[test]
    fn shared_config_rejects_invalid_initial() {
        let config = Config {
            persistence: 0,
            ..Default::default()
        };
        assert!(SharedConfig::new(config).is_err());
    }
}
