//! HTTP client for the face inference sidecar.
//!
//! The sidecar runs the landmark, embedding and antispoof models and exposes
//! one endpoint:
//!
//! ```text
//! POST {base}/detect   {"image": "<base64>"}
//!   200 {"face": LandmarkFrame | null}
//!   422 frame could not be decoded
//! ```
//!
//! Calls are blocking; callers run them on the blocking pool.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use ureq::Agent;
use veriface_core::{encode_image, Frame, LandmarkFrame, LandmarkOracle, OracleError};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Serialize)]
struct DetectRequest<'a> {
    image: &'a str,
}

#[derive(Deserialize)]
struct DetectResponse {
    face: Option<LandmarkFrame>,
}

pub struct HttpOracle {
    agent: Agent,
    detect_url: String,
}

impl HttpOracle {
    pub fn new(base_url: &str) -> Self {
        Self::with_timeout(base_url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Self {
        let agent: Agent = Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build()
            .into();
        Self {
            agent,
            detect_url: format!("{}/detect", base_url.trim_end_matches('/')),
        }
    }

    pub fn detect_url(&self) -> &str {
        &self.detect_url
    }
}

impl LandmarkOracle for HttpOracle {
    fn detect(&self, frame: &Frame) -> Result<Option<LandmarkFrame>, OracleError> {
        let encoded = encode_image(&frame.image);
        let mut response = self
            .agent
            .post(&self.detect_url)
            .send_json(&DetectRequest { image: &encoded })
            .map_err(|e| OracleError::Unavailable(e.to_string()))?;

        let status = response.status().as_u16();
        match status {
            200 => {}
            400 | 422 => {
                return Err(OracleError::InvalidFrame(format!("sidecar returned {status}")))
            }
            _ => return Err(OracleError::Unavailable(format!("sidecar returned {status}"))),
        }

        let body: DetectResponse = response
            .body_mut()
            .read_json()
            .map_err(|e| OracleError::Protocol(e.to_string()))?;

        if let Some(face) = &body.face {
            if face.descriptor.is_empty() || !face.descriptor.is_finite() {
                return Err(OracleError::Protocol("descriptor is empty or non-finite".into()));
            }
        }
        tracing::trace!(face = body.face.is_some(), "sidecar detection");
        Ok(body.face)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_url_is_normalised() {
        assert_eq!(
            HttpOracle::new("http://127.0.0.1:8700/").detect_url(),
            "http://127.0.0.1:8700/detect"
        );
    }

    #[test]
    fn test_response_without_face() {
        let body: DetectResponse = serde_json::from_str(r#"{"face": null}"#).unwrap();
        assert!(body.face.is_none());
    }

    #[test]
    fn test_response_with_face() {
        let json = r#"{"face": {
            "timestamp": "2024-05-01T12:00:00Z",
            "leftEye": [
                {"x": 0, "y": 0}, {"x": 3, "y": -1}, {"x": 7, "y": -1},
                {"x": 10, "y": 0}, {"x": 7, "y": 1}, {"x": 3, "y": 1}
            ],
            "rightEye": null,
            "nose": {"x": 150, "y": 100},
            "leftFaceEdge": {"x": 100, "y": 100},
            "rightFaceEdge": {"x": 200, "y": 100},
            "chin": {"x": 150, "y": 160},
            "descriptor": {"values": [0.1, 0.2, 0.3]},
            "spoofScore": 0.97
        }}"#;
        let face = serde_json::from_str::<DetectResponse>(json)
            .unwrap()
            .face
            .unwrap();
        assert!(face.left_eye.is_some());
        assert!(face.right_eye.is_none());
        assert_eq!(face.spoof_score, Some(0.97));
        assert_eq!(face.descriptor.len(), 3);
    }

    #[test]
    fn test_eye_contour_needs_six_points() {
        let json = r#"{"face": {
            "timestamp": "2024-05-01T12:00:00Z",
            "leftEye": [{"x": 0, "y": 0}],
            "rightEye": null,
            "nose": {"x": 1, "y": 1},
            "leftFaceEdge": {"x": 0, "y": 1},
            "rightFaceEdge": {"x": 2, "y": 1},
            "chin": {"x": 1, "y": 3},
            "descriptor": {"values": [0.1]}
        }}"#;
        assert!(serde_json::from_str::<DetectResponse>(json).is_err());
    }

    #[test]
    fn test_unreachable_sidecar_is_unavailable() {
        // Port 9 (discard) on loopback is not expected to accept connections.
        let oracle = HttpOracle::with_timeout("http://127.0.0.1:9", Duration::from_millis(500));
        let err = oracle.detect(&Frame::new(vec![1, 2, 3])).unwrap_err();
        assert!(matches!(err, OracleError::Unavailable(_)));
    }
}
