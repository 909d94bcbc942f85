//! # Motion confirmation

use crate::error::{ClipError, Result};
use std::collections::VecDeque;

/// Sliding window motion debouncer.
///
/// Raw per-frame motion flags are noisy. This debouncer only confirms motion once the last
/// `persistence` frames all had motion. Until the window has been filled, nothing is confirmed,
/// so motion lasting fewer than `persistence` frames never fires an event.
#[derive(Clone, Debug)]
pub struct MotionDebouncer {
    window: VecDeque<bool>,
    persistence: usize,
}

impl MotionDebouncer {
    /// Create a new debouncer.
    ///
    /// # Arguments
    ///
    /// * `persistence` - number of consecutive frames with motion required. Must be at least 1.
    pub fn new(persistence: usize) -> Result<Self> {
        check_persistence(persistence)?;

        Ok(Self {
            window: VecDeque::with_capacity(persistence),
            persistence,
        })
    }

    /// Observe raw motion for the next frame and return whether motion is confirmed.
    pub fn observe(&mut self, raw_motion: bool) -> bool {
        if self.window.len() == self.persistence {
            self.window.pop_front();
        }

        self.window.push_back(raw_motion);

        self.window.len() == self.persistence && self.window.iter().all(|&m| m)
    }

    /// Change the window size.
    ///
    /// When shrinking, the oldest entries are dropped. Invalid values leave the debouncer
    /// untouched.
    pub fn set_persistence(&mut self, persistence: usize) -> Result<()> {
        check_persistence(persistence)?;

        while self.window.len() > persistence {
            self.window.pop_front();
        }

        self.persistence = persistence;

        Ok(())
    }

    pub fn persistence(&self) -> usize {
        self.persistence
    }

    /// Number of frames currently held in the window.
    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Forget all observed frames, restarting the warm-up period.
    pub fn reset(&mut self) {
        self.window.clear();
    }
}

fn check_persistence(persistence: usize) -> Result<()> {
    if persistence < 1 {
        Err(ClipError::config("persistence must be at least 1"))
    } else {
        Ok(())
    }
}
