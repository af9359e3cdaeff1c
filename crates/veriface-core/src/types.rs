use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A 2D landmark position in image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Six-point eye contour.
///
/// Points 0 and 3 are the horizontal corners; (1, 5) and (2, 4) are the
/// upper/lower lid pairs.
pub type EyeContour = [Point; 6];

/// Fixed-length face embedding produced by the landmark oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    pub values: Vec<f32>,
}

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// True if every component is finite.
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }
}

/// One detected face in one sampled frame.
///
/// Produced by the oracle once per sampler tick, consumed by the detectors and
/// then dropped. Either eye may be missing when the face is seen in profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LandmarkFrame {
    pub timestamp: DateTime<Utc>,
    pub left_eye: Option<EyeContour>,
    pub right_eye: Option<EyeContour>,
    pub nose: Point,
    pub left_face_edge: Point,
    pub right_face_edge: Point,
    pub chin: Point,
    pub descriptor: Descriptor,
    /// Antispoof score in [0, 1] when the oracle runs one (1 = live).
    #[serde(default)]
    pub spoof_score: Option<f32>,
}

/// Decode a base64 image, accepting an optional `data:image/...;base64,`
/// prefix as browsers produce it.
pub fn decode_image(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let payload = match encoded.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => encoded,
    };
    STANDARD.decode(payload.trim())
}

pub fn encode_image(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}
