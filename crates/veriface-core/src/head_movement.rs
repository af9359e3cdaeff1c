//! Head-movement liveness detection via landmark ratio analysis.
//!
//! A photograph held in front of the camera keeps its internal proportions:
//! the nose stays at the same fraction of the face width and the nose-to-chin
//! span stays constant. A live subject turning or nodding changes those
//! ratios. This module compares the most recent frames of a bounded history
//! against the first frame of the window.
//!
//! # Threat Coverage
//!
//! - **Blocks:** static photographs, static images on a screen.
//! - **Does not block:** a photo that is rotated in-plane or tilted (which
//!   changes apparent ratios), video replay.
//!
//! The result is informational: it is reported alongside the other signals
//! but does not take part in the fusion decision.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::geometry::{distance, ratio};
use crate::types::{LandmarkFrame, Point};

/// Maximum frames retained in the history window.
pub const HISTORY_CAPACITY: usize = 30;
/// Frames required before the detector evaluates anything.
pub const DEFAULT_MIN_FRAMES: usize = 15;
/// Number of most recent frames compared against the baseline.
pub const DEFAULT_RECENT_FRAMES: usize = 10;
/// A ratio below this fraction of its baseline counts as a movement sample.
pub const DEFAULT_RATIO_DROP: f32 = 0.9;
/// Movement samples (out of the recent frames) required to confirm.
pub const DEFAULT_CONFIRM_SAMPLES: usize = 3;

/// The landmarks head-movement analysis needs from one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeadPose {
    pub nose: Point,
    pub left_edge: Point,
    pub right_edge: Point,
    pub chin: Point,
}

impl From<&LandmarkFrame> for HeadPose {
    fn from(frame: &LandmarkFrame) -> Self {
        Self {
            nose: frame.nose,
            left_edge: frame.left_face_edge,
            right_edge: frame.right_face_edge,
            chin: frame.chin,
        }
    }
}

struct PoseRatios {
    left: f32,
    right: f32,
    vertical: f32,
}

impl HeadPose {
    fn ratios(&self) -> Option<PoseRatios> {
        let width = distance(self.left_edge, self.right_edge);
        Some(PoseRatios {
            left: ratio(distance(self.nose, self.left_edge), width)?,
            right: ratio(distance(self.nose, self.right_edge), width)?,
            vertical: distance(self.nose, self.chin),
        })
    }
}

/// Bounded FIFO of head poses. The first entry is the baseline.
#[derive(Debug, Clone)]
pub struct HeadHistory {
    frames: VecDeque<HeadPose>,
    capacity: usize,
}

impl HeadHistory {
    pub fn new() -> Self {
        Self::with_capacity(HISTORY_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, pose: HeadPose) {
        if self.frames.len() == self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(pose);
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn baseline(&self) -> Option<&HeadPose> {
        self.frames.front()
    }
}

impl Default for HeadHistory {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MovementType {
    LeftTurn,
    RightTurn,
    Nod,
}

impl MovementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LeftTurn => "LEFT_TURN",
            Self::RightTurn => "RIGHT_TURN",
            Self::Nod => "NOD",
        }
    }
}

/// Result of one head-movement evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MovementResult {
    pub movement: Option<MovementType>,
    pub left_turn_samples: usize,
    pub right_turn_samples: usize,
    pub nod_samples: usize,
}

impl MovementResult {
    pub fn is_detected(&self) -> bool {
        self.movement.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadMovementConfig {
    pub min_frames: usize,
    pub recent_frames: usize,
    pub ratio_drop: f32,
    pub confirm_samples: usize,
}

impl Default for HeadMovementConfig {
    fn default() -> Self {
        Self {
            min_frames: DEFAULT_MIN_FRAMES,
            recent_frames: DEFAULT_RECENT_FRAMES,
            ratio_drop: DEFAULT_RATIO_DROP,
            confirm_samples: DEFAULT_CONFIRM_SAMPLES,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HeadMovementDetector {
    config: HeadMovementConfig,
}

impl HeadMovementDetector {
    pub fn new(config: HeadMovementConfig) -> Self {
        Self { config }
    }

    /// Evaluate the history. Returns no movement until `min_frames` poses
    /// have been collected or if the baseline face width is degenerate.
    pub fn evaluate(&self, history: &HeadHistory) -> MovementResult {
        if history.len() < self.config.min_frames {
            return MovementResult::default();
        }
        let Some(baseline) = history.baseline().and_then(HeadPose::ratios) else {
            return MovementResult::default();
        };

        let drop = self.config.ratio_drop;
        let skip = history.len().saturating_sub(self.config.recent_frames);
        let mut result = MovementResult::default();

        for pose in history.frames.iter().skip(skip) {
            let Some(current) = pose.ratios() else {
                continue;
            };
            if current.left < baseline.left * drop {
                result.left_turn_samples += 1;
            }
            if current.right < baseline.right * drop {
                result.right_turn_samples += 1;
            }
            if current.vertical < baseline.vertical * drop {
                result.nod_samples += 1;
            }
        }

        let needed = self.config.confirm_samples;
        result.movement = if result.left_turn_samples >= needed {
            Some(MovementType::LeftTurn)
        } else if result.right_turn_samples >= needed {
            Some(MovementType::RightTurn)
        } else if result.nod_samples >= needed {
            Some(MovementType::Nod)
        } else {
            None
        };

        tracing::trace!(
            left = result.left_turn_samples,
            right = result.right_turn_samples,
            nod = result.nod_samples,
            movement = ?result.movement,
            "head movement evaluated"
        );
        result
    }
}
