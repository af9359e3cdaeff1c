//! API error type and its axum response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use veriface_core::OtpRejection;

use crate::engine::EngineError;
use crate::mailer::MailError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum ApiError {
    /// Client-correctable failure: bad input, bad credentials, rejected code.
    #[error("{0}")]
    BadRequest(String),
    #[error("too many failed attempts; try again in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("Failed to send OTP")]
    Delivery(#[from] MailError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        ApiError::BadRequest(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Delivery(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateEmail => ApiError::bad_request("Email already in use."),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NoFaceDetected => ApiError::bad_request("no face detected"),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<OtpRejection> for ApiError {
    fn from(rejection: OtpRejection) -> Self {
        match rejection {
            OtpRejection::Expired => ApiError::bad_request("OTP expired"),
            OtpRejection::NotFound | OtpRejection::Consumed | OtpRejection::Mismatch => {
                ApiError::bad_request("Invalid OTP")
            }
        }
    }
}

impl From<jsonwebtoken::errors::Error> for ApiError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        ApiError::Internal(format!("token signing failed: {err}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match &self {
            ApiError::Delivery(e) => tracing::error!(error = %e, "one-time code delivery failed"),
            ApiError::Internal(msg) => tracing::error!(error = %msg, "request failed"),
            _ => {}
        }
        let body = json!({ "error": self.to_string() });
        let mut response = (status, Json(body)).into_response();
        if let ApiError::RateLimited { retry_after_secs } = self {
            if let Ok(value) = retry_after_secs.to_string().parse() {
                response
                    .headers_mut()
                    .insert(axum::http::header::RETRY_AFTER, value);
            }
        }
        response
    }
}
