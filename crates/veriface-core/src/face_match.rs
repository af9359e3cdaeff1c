//! Live-vs-reference face descriptor comparison.

use serde::{Deserialize, Serialize};

use crate::geometry::euclidean;
use crate::types::Descriptor;

/// Distance below which the live face is accepted as the enrolled user.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.5;
/// Distance at or beyond which the best match is labelled unknown.
pub const DEFAULT_MATCHER_TOLERANCE: f32 = 0.6;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// `None` if the descriptors could not be compared.
    pub distance: Option<f32>,
}

impl MatchResult {
    const NO_MATCH: Self = Self {
        matched: false,
        distance: None,
    };
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FaceMatcher {
    pub threshold: f32,
    pub tolerance: f32,
}

impl Default for FaceMatcher {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
            tolerance: DEFAULT_MATCHER_TOLERANCE,
        }
    }
}

impl FaceMatcher {
    pub fn with_threshold(threshold: f32) -> Self {
        Self {
            threshold,
            ..Self::default()
        }
    }

    pub fn compare(&self, live: &Descriptor, reference: &Descriptor) -> MatchResult {
        if !live.is_finite() || !reference.is_finite() {
            return MatchResult::NO_MATCH;
        }
        let Some(distance) = euclidean(&live.values, &reference.values) else {
            tracing::warn!(
                live = live.len(),
                reference = reference.len(),
                "descriptor length mismatch"
            );
            return MatchResult::NO_MATCH;
        };

        let known = distance < self.tolerance;
        MatchResult {
            matched: known && distance < self.threshold,
            distance: Some(distance),
        }
    }
}
