//! Blink liveness detection from the eye aspect ratio (EAR) time series.
//!
//! EAR per eye is `(|p1 - p5| + |p2 - p4|) / (2 * |p0 - p3|)`. It sits around
//! 0.3 for an open eye and collapses towards zero when the lid closes. A
//! printed photograph never blinks; a live subject asked to blink three times
//! produces three clean close/open cycles.
//!
//! Two strategies are available:
//!
//! - [`BlinkStrategy::Debounced`] (default): a closed state is entered after
//!   `close_frames` consecutive low-EAR frames and a blink is counted after
//!   `open_frames` consecutive high-EAR frames following it.
//! - [`BlinkStrategy::MovingAverage`]: the EAR is smoothed over the last
//!   `window_size` frames and a blink is a dip of the average below the
//!   threshold followed by a recovery above it.
//!
//! Either way at most one blink is counted per close/open cycle, and once
//! `required_blinks` is reached the detector stays satisfied for the rest of
//! the attempt.
//!
//! # Threat Coverage
//!
//! - **Blocks:** printed photographs, still images on a screen.
//! - **Does not block:** video replay of a blinking subject (the spoken
//!   challenge covers that), 3D masks with moving eyelids.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::geometry::{distance, ratio};
use crate::types::{EyeContour, LandmarkFrame};

/// Default EAR threshold for a frontal face with both eyes visible.
pub const DEFAULT_EAR_THRESHOLD: f32 = 0.25;
/// Threshold multiplier applied when only one eye is visible.
pub const DEFAULT_SINGLE_EYE_FACTOR: f32 = 0.85;
/// Maximum retained EAR samples.
pub const DEFAULT_WINDOW_SIZE: usize = 5;
/// Consecutive low-EAR frames required to enter the closed state.
pub const BLINK_CLOSE_FRAMES: u32 = 2;
/// Consecutive high-EAR frames required to complete a blink.
pub const BLINK_OPEN_FRAMES: u32 = 2;
/// Completed blinks needed to satisfy the detector.
pub const REQUIRED_BLINKS: u32 = 3;

/// EAR substituted for a frame with a face but no usable eye.
const NO_SIGNAL_EAR: f32 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlinkStrategy {
    #[default]
    Debounced,
    MovingAverage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlinkConfig {
    pub strategy: BlinkStrategy,
    pub ear_threshold: f32,
    pub single_eye_factor: f32,
    pub window_size: usize,
    pub close_frames: u32,
    pub open_frames: u32,
    pub required_blinks: u32,
}

impl Default for BlinkConfig {
    fn default() -> Self {
        Self {
            strategy: BlinkStrategy::Debounced,
            ear_threshold: DEFAULT_EAR_THRESHOLD,
            single_eye_factor: DEFAULT_SINGLE_EYE_FACTOR,
            window_size: DEFAULT_WINDOW_SIZE,
            close_frames: BLINK_CLOSE_FRAMES,
            open_frames: BLINK_OPEN_FRAMES,
            required_blinks: REQUIRED_BLINKS,
        }
    }
}

/// Per-attempt blink state, owned by the session and passed into every
/// detector call.
#[derive(Debug, Clone, Default)]
pub struct BlinkState {
    ear_history: VecDeque<f32>,
    in_blink: bool,
    blink_count: u32,
    close_frames: u32,
    open_frames: u32,
    detected: bool,
}

impl BlinkState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blink_count(&self) -> u32 {
        self.blink_count
    }

    /// Sticky: true once the required number of blinks has been seen.
    pub fn is_detected(&self) -> bool {
        self.detected
    }

    pub fn in_blink(&self) -> bool {
        self.in_blink
    }

    pub fn ear_history(&self) -> &VecDeque<f32> {
        &self.ear_history
    }

    fn push_ear(&mut self, ear: f32, window_size: usize) {
        self.ear_history.push_back(ear);
        while self.ear_history.len() > window_size.max(1) {
            self.ear_history.pop_front();
        }
    }

    fn average_ear(&self) -> Option<f32> {
        if self.ear_history.is_empty() {
            return None;
        }
        Some(self.ear_history.iter().sum::<f32>() / self.ear_history.len() as f32)
    }
}

/// What one frame contributed to the blink detector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlinkObservation {
    /// EAR of this frame, `None` if neither eye produced a signal.
    pub ear: Option<f32>,
    /// Mean of the retained EAR window.
    pub average_ear: Option<f32>,
    /// Threshold in effect for this frame (lowered for a single eye).
    pub threshold: f32,
    /// A close/open cycle completed on this frame.
    pub blink_completed: bool,
    pub blink_count: u32,
    pub detected: bool,
}

/// Eye aspect ratio of one contour, `None` if the corners coincide.
pub fn eye_aspect_ratio(eye: &EyeContour) -> Option<f32> {
    let vertical_1 = distance(eye[1], eye[5]);
    let vertical_2 = distance(eye[2], eye[4]);
    let horizontal = distance(eye[0], eye[3]);
    ratio(vertical_1 + vertical_2, 2.0 * horizontal)
}

#[derive(Debug, Clone)]
pub struct BlinkDetector {
    config: BlinkConfig,
}

impl BlinkDetector {
    pub fn new(config: BlinkConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BlinkConfig {
        &self.config
    }

    /// Combine both eyes into one EAR and the threshold that applies to it.
    pub fn frame_ear(&self, frame: &LandmarkFrame) -> (Option<f32>, f32) {
        let left = frame.left_eye.as_ref().and_then(eye_aspect_ratio);
        let right = frame.right_eye.as_ref().and_then(eye_aspect_ratio);
        let threshold = self.config.ear_threshold;

        match (left, right) {
            (Some(l), Some(r)) => (Some((l + r) / 2.0), threshold),
            (Some(one), None) | (None, Some(one)) => {
                (Some(one), threshold * self.config.single_eye_factor)
            }
            (None, None) => (None, threshold),
        }
    }

    /// Feed one detected face into the detector.
    pub fn observe(&self, state: &mut BlinkState, frame: &LandmarkFrame) -> BlinkObservation {
        let (ear, threshold) = self.frame_ear(frame);
        self.observe_ear(state, ear, threshold)
    }

    /// Feed a raw EAR sample. `None` means no eye signal and counts as open.
    pub fn observe_ear(
        &self,
        state: &mut BlinkState,
        ear: Option<f32>,
        threshold: f32,
    ) -> BlinkObservation {
        let sample = ear.unwrap_or(NO_SIGNAL_EAR);
        state.push_ear(sample, self.config.window_size);

        let completed = match self.config.strategy {
            BlinkStrategy::Debounced => self.step_debounced(state, sample < threshold),
            BlinkStrategy::MovingAverage => self.step_moving_average(state, threshold),
        };

        if completed {
            state.blink_count += 1;
            tracing::debug!(count = state.blink_count, "blink confirmed");
            if !state.detected && state.blink_count >= self.config.required_blinks {
                state.detected = true;
                tracing::info!(count = state.blink_count, "blink challenge satisfied");
            }
        }

        BlinkObservation {
            ear,
            average_ear: state.average_ear(),
            threshold,
            blink_completed: completed,
            blink_count: state.blink_count,
            detected: state.detected,
        }
    }

    fn step_debounced(&self, state: &mut BlinkState, low: bool) -> bool {
        if low {
            state.close_frames = state.close_frames.saturating_add(1);
            state.open_frames = 0;
            if !state.in_blink && state.close_frames >= self.config.close_frames {
                state.in_blink = true;
                tracing::trace!("eyes closed");
            }
            return false;
        }

        state.open_frames = state.open_frames.saturating_add(1);
        state.close_frames = 0;
        if state.in_blink && state.open_frames >= self.config.open_frames {
            state.in_blink = false;
            return true;
        }
        false
    }

    fn step_moving_average(&self, state: &mut BlinkState, threshold: f32) -> bool {
        let Some(average) = state.average_ear() else {
            return false;
        };

        if !state.in_blink && average < threshold {
            state.in_blink = true;
            tracing::trace!(average, threshold, "blink potential started");
            return false;
        }
        if state.in_blink && average >= threshold {
            state.in_blink = false;
            state.ear_history.clear();
            return true;
        }
        false
    }
}

impl Default for BlinkDetector {
    fn default() -> Self {
        Self::new(BlinkConfig::default())
    }
}
