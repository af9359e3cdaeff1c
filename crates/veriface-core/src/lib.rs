//! veriface-core: multi-factor login session and face liveness fusion.
//!
//! A login walks three factors in order: password, one-time code, then a
//! liveness phase in which a 15 Hz landmark stream is reduced to a single
//! authentication decision (face match AND blink AND spoken challenge).
//! Model inference, speech recognition and the camera sit behind the traits
//! in [`oracle`]; everything else lives here.

pub mod blink;
pub mod challenge;
pub mod error;
pub mod face_match;
pub mod flow;
pub mod fusion;
pub mod geometry;
pub mod head_movement;
pub mod oracle;
pub mod otp;
pub mod runtime;
pub mod session;
pub mod types;

pub use blink::{BlinkConfig, BlinkDetector, BlinkState, BlinkStrategy};
pub use challenge::ChallengeState;
pub use error::AuthError;
pub use face_match::{FaceMatcher, MatchResult};
pub use flow::{Account, AuthBackend, AuthFlow, Authenticated, FaceLoginGrant, OtpGrant};
pub use fusion::{FusionDecision, FusionPolicy, LivenessSignals};
pub use head_movement::{HeadHistory, HeadMovementConfig, HeadMovementDetector, MovementType};
pub use oracle::{Camera, CameraError, Frame, LandmarkOracle, OracleError, SpeechOracle};
pub use otp::{OtpManager, OtpRecord, OtpRejection};
pub use runtime::{LivenessConfig, LivenessHandle, LivenessOutcome, LivenessProgress};
pub use session::{FailureCause, LivenessPipeline, OtpReceipt, Phase, Resume, Session};
pub use types::{decode_image, encode_image, Descriptor, EyeContour, LandmarkFrame, Point};
