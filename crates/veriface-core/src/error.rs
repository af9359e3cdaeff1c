use thiserror::Error;

use crate::oracle::{CameraError, OracleError};
use crate::otp::OtpRejection;

/// Error taxonomy shared by the session, the liveness runtime and the
/// backend client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Malformed input: missing field, undecodable image.
    #[error("invalid input: {0}")]
    Validation(String),
    /// Wrong password, wrong code, face mismatch, spoof.
    #[error("authentication failed: {0}")]
    AuthFailure(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("code expired or already used")]
    ExpiredOrConsumed,
    /// Network, delivery, oracle or camera trouble. Retryable.
    #[error("temporarily unavailable: {0}")]
    TransientInfra(String),
    #[error("fatal: {0}")]
    Fatal(String),
    #[error("{action} is not allowed in phase {phase}")]
    InvalidTransition { action: &'static str, phase: String },
    #[error("too many failed attempts, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
}

impl AuthError {
    /// User-correctable failures that allow the current phase to be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::AuthFailure(_) | Self::TransientInfra(_)
        )
    }
}

impl From<OtpRejection> for AuthError {
    fn from(r: OtpRejection) -> Self {
        match r {
            OtpRejection::Expired | OtpRejection::Consumed => Self::ExpiredOrConsumed,
            OtpRejection::NotFound => Self::NotFound("no code issued".into()),
            OtpRejection::Mismatch => Self::AuthFailure(r.to_string()),
        }
    }
}

impl From<OracleError> for AuthError {
    fn from(e: OracleError) -> Self {
        Self::TransientInfra(e.to_string())
    }
}

impl From<CameraError> for AuthError {
    fn from(e: CameraError) -> Self {
        Self::TransientInfra(e.to_string())
    }
}
