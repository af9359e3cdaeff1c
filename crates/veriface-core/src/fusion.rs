//! Liveness fusion: the single authoritative "liveness satisfied" decision.
//!
//! All three of face match, blink challenge and spoken challenge must hold at
//! the same evaluation. Head movement is carried along for reporting only.

use serde::Serialize;

use crate::head_movement::MovementType;

/// Committed per-attempt signals, read once per evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LivenessSignals {
    pub face_verified: bool,
    pub blink_detected: bool,
    pub challenge_verified: bool,
    pub movement: Option<MovementType>,
}

impl LivenessSignals {
    pub fn satisfied(&self) -> bool {
        self.face_verified && self.blink_detected && self.challenge_verified
    }

    /// Names of the factors still outstanding.
    pub fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if !self.face_verified {
            missing.push("face");
        }
        if !self.blink_detected {
            missing.push("blink");
        }
        if !self.challenge_verified {
            missing.push("challenge");
        }
        missing
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusionDecision {
    Pending,
    /// Satisfied for the first time in this attempt.
    Satisfied,
    /// Already fired earlier; nothing to do.
    AlreadyFired,
}

/// Fires at most once per attempt.
#[derive(Debug, Clone, Default)]
pub struct FusionPolicy {
    fired: bool,
}

impl FusionPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }

    pub fn evaluate(&mut self, signals: &LivenessSignals) -> FusionDecision {
        if self.fired {
            return FusionDecision::AlreadyFired;
        }
        if signals.satisfied() {
            self.fired = true;
            tracing::info!(movement = ?signals.movement, "liveness fusion satisfied");
            return FusionDecision::Satisfied;
        }
        FusionDecision::Pending
    }

    pub fn reset(&mut self) {
        self.fired = false;
    }
}
