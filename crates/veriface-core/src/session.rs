//! The login session state machine.
//!
//! A [`Session`] owns every piece of per-login mutable state and is changed
//! only through the transition methods below. Each transition checks the
//! current phase and returns [`AuthError::InvalidTransition`] instead of
//! silently doing nothing, so a stale UI action can never skip a factor.
//!
//! ```text
//! CREDENTIALS -> OTP_PENDING -> LIVENESS -> AUTHENTICATED
//!      \              \             \
//!       +-------------+-------------+--> FAILED { cause, resume }
//!
//! any phase --close()--> CLOSED
//! ```
//!
//! `FAILED` remembers which phase may be re-entered. A bad password resumes
//! at CREDENTIALS; a bad or expired code resumes at OTP_PENDING, where a
//! fresh code must be requested. Sessions are not durable.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::blink::{BlinkDetector, BlinkObservation, BlinkState};
use crate::challenge::ChallengeState;
use crate::error::AuthError;
use crate::face_match::{FaceMatcher, MatchResult};
use crate::fusion::{FusionDecision, FusionPolicy, LivenessSignals};
use crate::head_movement::{HeadHistory, HeadMovementDetector, HeadPose, MovementType};
use crate::runtime::LivenessConfig;
use crate::types::{Descriptor, LandmarkFrame};

/// Phase that a failed session may re-enter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Resume {
    Credentials,
    OtpPending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    BadCredentials,
    InvalidOtp,
    ExpiredOtp,
    OracleUnavailable,
    CameraUnavailable,
    LivenessTimeout,
    Transient,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Credentials,
    OtpPending,
    Liveness,
    Authenticated,
    Failed {
        cause: FailureCause,
        resume: Option<Resume>,
    },
    Closed,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Phase::Authenticated | Phase::Closed | Phase::Failed { resume: None, .. }
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Credentials => f.write_str("CREDENTIALS"),
            Phase::OtpPending => f.write_str("OTP_PENDING"),
            Phase::Liveness => f.write_str("LIVENESS"),
            Phase::Authenticated => f.write_str("AUTHENTICATED"),
            Phase::Failed { cause, .. } => write!(f, "FAILED({cause:?})"),
            Phase::Closed => f.write_str("CLOSED"),
        }
    }
}

/// When the last code was issued, as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OtpReceipt {
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Stateless detectors for one liveness attempt. The running state they act
/// on lives in the [`Session`].
#[derive(Debug, Clone)]
pub struct LivenessPipeline {
    pub blink: BlinkDetector,
    pub head: HeadMovementDetector,
    pub matcher: FaceMatcher,
    /// Frames scored below this by the antispoof model never count as a
    /// face match.
    pub antispoof_threshold: Option<f32>,
}

impl LivenessPipeline {
    pub fn new(config: &LivenessConfig) -> Self {
        Self {
            blink: BlinkDetector::new(config.blink.clone()),
            head: HeadMovementDetector::new(config.head.clone()),
            matcher: config.matcher,
            antispoof_threshold: config.antispoof_threshold,
        }
    }
}

impl Default for LivenessPipeline {
    fn default() -> Self {
        Self::new(&LivenessConfig::default())
    }
}

/// What one sampled frame did to the session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameObservation {
    pub face_present: bool,
    pub face: Option<MatchResult>,
    pub blink: Option<BlinkObservation>,
}

pub struct Session {
    id: Uuid,
    phase: Phase,
    email: Option<String>,
    reference: Option<Descriptor>,
    otp: Option<OtpReceipt>,
    challenge: Option<ChallengeState>,
    blink: BlinkState,
    head: HeadHistory,
    face_verified: bool,
    movement: Option<MovementType>,
    fusion: FusionPolicy,
    created_at: DateTime<Utc>,
    liveness_started_at: Option<DateTime<Utc>>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            phase: Phase::Credentials,
            email: None,
            reference: None,
            otp: None,
            challenge: None,
            blink: BlinkState::new(),
            head: HeadHistory::new(),
            face_verified: false,
            movement: None,
            fusion: FusionPolicy::new(),
            created_at: Utc::now(),
            liveness_started_at: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    pub fn otp_receipt(&self) -> Option<OtpReceipt> {
        self.otp
    }

    pub fn challenge_code(&self) -> Option<&str> {
        self.challenge.as_ref().map(ChallengeState::code)
    }

    pub fn blink_state(&self) -> &BlinkState {
        &self.blink
    }

    pub fn head_history(&self) -> &HeadHistory {
        &self.head
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn liveness_started_at(&self) -> Option<DateTime<Utc>> {
        self.liveness_started_at
    }

    /// The phase a transition acts on: a failed session behaves as the phase
    /// it may resume.
    fn effective_phase(&self) -> Phase {
        match self.phase {
            Phase::Failed {
                resume: Some(Resume::Credentials),
                ..
            } => Phase::Credentials,
            Phase::Failed {
                resume: Some(Resume::OtpPending),
                ..
            } => Phase::OtpPending,
            other => other,
        }
    }

    /// True if a transition out of `phase` is currently allowed.
    pub fn accepts(&self, phase: Phase) -> bool {
        self.effective_phase() == phase
    }

    pub(crate) fn require(&self, action: &'static str, allowed: &[Phase]) -> Result<(), AuthError> {
        let effective = self.effective_phase();
        if allowed.contains(&effective) {
            Ok(())
        } else {
            Err(AuthError::InvalidTransition {
                action,
                phase: self.phase.to_string(),
            })
        }
    }

    fn enter(&mut self, next: Phase) {
        if self.phase != next {
            tracing::info!(session = %self.id, from = %self.phase, to = %next, "phase transition");
        }
        self.phase = next;
    }

    /// CREDENTIALS -> OTP_PENDING.
    pub fn credentials_accepted(&mut self, email: &str) -> Result<(), AuthError> {
        self.require("credentials_accepted", &[Phase::Credentials])?;
        self.email = Some(email.trim().to_string());
        self.otp = None;
        self.enter(Phase::OtpPending);
        Ok(())
    }

    pub fn credentials_rejected(&mut self) -> Result<(), AuthError> {
        self.require("credentials_rejected", &[Phase::Credentials])?;
        self.fail(FailureCause::BadCredentials);
        Ok(())
    }

    /// Record a freshly issued (or regenerated) code. Regeneration out of a
    /// failed OTP attempt re-enters OTP_PENDING.
    pub fn otp_issued(&mut self, receipt: OtpReceipt) -> Result<(), AuthError> {
        self.require("otp_issued", &[Phase::OtpPending])?;
        self.otp = Some(receipt);
        self.enter(Phase::OtpPending);
        Ok(())
    }

    /// OTP_PENDING -> LIVENESS. Resets every liveness detector and installs a
    /// fresh challenge.
    pub fn otp_accepted(
        &mut self,
        reference: Descriptor,
        challenge: ChallengeState,
    ) -> Result<(), AuthError> {
        self.require("otp_accepted", &[Phase::OtpPending])?;
        if self.otp.is_none() {
            return Err(AuthError::InvalidTransition {
                action: "otp_accepted",
                phase: "OTP_PENDING without an issued code".into(),
            });
        }
        if reference.is_empty() || !reference.is_finite() {
            return Err(AuthError::Validation("reference descriptor is unusable".into()));
        }
        self.reference = Some(reference);
        self.otp = None;
        self.challenge = Some(challenge);
        self.reset_liveness();
        self.liveness_started_at = Some(Utc::now());
        self.enter(Phase::Liveness);
        Ok(())
    }

    pub fn otp_rejected(&mut self, error: &AuthError) -> Result<(), AuthError> {
        self.require("otp_rejected", &[Phase::OtpPending])?;
        let cause = match error {
            AuthError::ExpiredOrConsumed => FailureCause::ExpiredOtp,
            _ => FailureCause::InvalidOtp,
        };
        self.fail(cause);
        Ok(())
    }

    /// Move to FAILED from any live phase. Stops the challenge.
    pub fn fail(&mut self, cause: FailureCause) {
        if matches!(self.phase, Phase::Authenticated | Phase::Closed) {
            return;
        }
        let resume = match cause {
            FailureCause::BadCredentials => Some(Resume::Credentials),
            FailureCause::InvalidOtp
            | FailureCause::ExpiredOtp
            | FailureCause::CameraUnavailable
            | FailureCause::LivenessTimeout => Some(Resume::OtpPending),
            FailureCause::Transient => match self.effective_phase() {
                Phase::Credentials => Some(Resume::Credentials),
                _ => Some(Resume::OtpPending),
            },
            FailureCause::OracleUnavailable | FailureCause::Internal => None,
        };
        if let Some(challenge) = self.challenge.as_mut() {
            challenge.deactivate();
        }
        if matches!(self.phase, Phase::Liveness) {
            self.face_verified = false;
        }
        tracing::warn!(session = %self.id, from = %self.phase, ?cause, ?resume, "session failed");
        self.phase = Phase::Failed { cause, resume };
    }

    fn reset_liveness(&mut self) {
        self.blink = BlinkState::new();
        self.head.clear();
        self.face_verified = false;
        self.movement = None;
        self.fusion.reset();
    }

    /// Feed one sampler tick. `None` means the oracle saw no face: the
    /// detectors skip the frame and the face match drops to false.
    pub fn observe_frame(
        &mut self,
        pipeline: &LivenessPipeline,
        frame: Option<&LandmarkFrame>,
    ) -> Result<FrameObservation, AuthError> {
        self.require("observe_frame", &[Phase::Liveness])?;

        let Some(frame) = frame else {
            self.face_verified = false;
            return Ok(FrameObservation {
                face_present: false,
                face: None,
                blink: None,
            });
        };

        let blink = pipeline.blink.observe(&mut self.blink, frame);
        self.head.push(HeadPose::from(frame));

        let face = self
            .reference
            .as_ref()
            .map(|reference| pipeline.matcher.compare(&frame.descriptor, reference));
        let spoofed = match (pipeline.antispoof_threshold, frame.spoof_score) {
            (Some(threshold), Some(score)) => score < threshold,
            _ => false,
        };
        self.face_verified = !spoofed && face.is_some_and(|m| m.matched);

        tracing::trace!(
            distance = ?face.and_then(|m| m.distance),
            face_verified = self.face_verified,
            spoofed,
            ear = ?blink.ear,
            blinks = blink.blink_count,
            "frame observed"
        );

        Ok(FrameObservation {
            face_present: true,
            face,
            blink: Some(blink),
        })
    }

    /// Feed one transcript from the speech listener. Returns whether the
    /// challenge is verified afterwards.
    pub fn hear(&mut self, transcript: &str) -> Result<bool, AuthError> {
        self.require("hear", &[Phase::Liveness])?;
        Ok(self
            .challenge
            .as_mut()
            .is_some_and(|challenge| challenge.verify(transcript)))
    }

    pub fn challenge_verified(&self) -> bool {
        self.challenge.as_ref().is_some_and(ChallengeState::is_verified)
    }

    /// Run the head-movement detector over the current history. A detected
    /// movement is kept until the next attempt.
    pub fn evaluate_head_movement(&mut self, pipeline: &LivenessPipeline) -> Option<MovementType> {
        if self.phase != Phase::Liveness {
            return self.movement;
        }
        if let Some(movement) = pipeline.head.evaluate(&self.head).movement {
            if self.movement.is_none() {
                tracing::info!(session = %self.id, movement = movement.as_str(), "head movement detected");
            }
            self.movement = Some(movement);
        }
        self.movement
    }

    /// Committed liveness state, read in one place for fusion.
    pub fn signals(&self) -> LivenessSignals {
        LivenessSignals {
            face_verified: self.face_verified,
            blink_detected: self.blink.is_detected(),
            challenge_verified: self.challenge_verified(),
            movement: self.movement,
        }
    }

    pub fn evaluate_fusion(&mut self) -> FusionDecision {
        if self.phase != Phase::Liveness {
            return FusionDecision::Pending;
        }
        let signals = self.signals();
        self.fusion.evaluate(&signals)
    }

    /// LIVENESS -> AUTHENTICATED. Only after fusion has fired.
    pub fn authenticate(&mut self) -> Result<(), AuthError> {
        self.require("authenticate", &[Phase::Liveness])?;
        if !self.fusion.has_fired() {
            return Err(AuthError::AuthFailure(format!(
                "liveness not satisfied (missing {})",
                self.signals().missing().join(", ")
            )));
        }
        if let Some(challenge) = self.challenge.as_mut() {
            challenge.deactivate();
        }
        self.enter(Phase::Authenticated);
        Ok(())
    }

    /// Logout or abandon: clear all state. Idempotent.
    pub fn close(&mut self) {
        self.email = None;
        self.reference = None;
        self.otp = None;
        self.challenge = None;
        self.liveness_started_at = None;
        self.reset_liveness();
        self.enter(Phase::Closed);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Reference descriptor and challenge code stay out of logs.
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("phase", &self.phase)
            .field("email", &self.email)
            .field("face_verified", &self.face_verified)
            .field("blinks", &self.blink.blink_count())
            .field("movement", &self.movement)
            .finish_non_exhaustive()
    }
}
