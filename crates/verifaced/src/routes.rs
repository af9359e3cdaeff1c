use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use veriface_core::{decode_image, OtpManager};

use crate::engine::{EngineHandle, VerifyOutcome};
use crate::error::ApiError;
use crate::mailer::OtpMailer;
use crate::password;
use crate::rate_limiter::RateLimiter;
use crate::store::{NewUser, UserRecord, UserStore};
use crate::token::TokenIssuer;

/// Request bodies carry base64 face images.
const BODY_LIMIT: usize = 50 * 1024 * 1024;

pub struct AppState {
    pub store: UserStore,
    pub engine: EngineHandle,
    pub otp: Mutex<OtpManager>,
    pub limiter: Mutex<RateLimiter>,
    /// Counts code emails per address, so sending is throttled on its own.
    pub otp_sends: Mutex<RateLimiter>,
    pub tokens: TokenIssuer,
    pub mailer: Arc<dyn OtpMailer>,
}

impl AppState {
    pub fn new(
        store: UserStore,
        engine: EngineHandle,
        otp: OtpManager,
        tokens: TokenIssuer,
        mailer: Arc<dyn OtpMailer>,
    ) -> Self {
        Self {
            store,
            engine,
            otp: Mutex::new(otp),
            limiter: Mutex::new(RateLimiter::new()),
            otp_sends: Mutex::new(RateLimiter::new()),
            tokens,
            mailer,
        }
    }

    async fn check_rate(&self, email: &str) -> Result<(), ApiError> {
        self.limiter
            .lock()
            .await
            .check(email)
            .map_err(|retry| ApiError::RateLimited {
                retry_after_secs: retry.as_secs().max(1),
            })
    }

    /// Refuse a code email while the address is locked out or has had too
    /// many codes sent recently.
    async fn check_otp_send(&self, email: &str) -> Result<(), ApiError> {
        self.check_rate(email).await?;
        self.otp_sends
            .lock()
            .await
            .check(email)
            .map_err(|retry| ApiError::RateLimited {
                retry_after_secs: retry.as_secs().max(1),
            })
    }

    async fn record_failure(&self, email: &str) {
        self.limiter.lock().await.record_failure(email);
    }

    async fn record_success(&self, email: &str) {
        self.limiter.lock().await.record_success(email);
    }

    async fn require_user(&self, email: &str) -> Result<UserRecord, ApiError> {
        self.store
            .find_by_email(email)
            .await?
            .ok_or_else(|| ApiError::bad_request("User not found"))
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/signup", post(signup))
        .route("/login", post(login))
        .route("/generate-otp", post(generate_otp))
        .route("/verify-otp", post(verify_otp))
        .route("/face-login", post(face_login))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// CORS for the single frontend origin.
pub fn cors_layer(origin: &str) -> anyhow::Result<CorsLayer> {
    Ok(CorsLayer::new()
        .allow_origin(origin.parse::<HeaderValue>()?)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any))
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(v)| v)
        .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))
}

/// Trimmed value of a required text field.
fn required(field: &Option<String>) -> Option<&str> {
    field.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignupRequest {
    #[serde(default)]
    full_name: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    face_image: Option<String>,
}

async fn signup(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SignupRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let req = body(payload)?;
    let (Some(full_name), Some(email), Some(password), Some(face_image)) = (
        required(&req.full_name),
        required(&req.email),
        req.password.as_deref().filter(|p| !p.is_empty()),
        required(&req.face_image),
    ) else {
        return Err(ApiError::bad_request("All fields are required."));
    };

    let image = decode_image(face_image).map_err(|_| ApiError::bad_request("Invalid image data."))?;
    if let Err(e) = image::load_from_memory(&image) {
        tracing::debug!(error = %e, "signup image did not decode");
        return Err(ApiError::bad_request("Invalid image data."));
    }

    if state.store.find_by_email(email).await?.is_some() {
        return Err(ApiError::bad_request("Email already in use."));
    }

    let descriptor = state.engine.enroll(image.clone()).await?;

    let plain = password.to_string();
    let password_hash = tokio::task::spawn_blocking(move || password::hash_password(&plain))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let user = state
        .store
        .insert(NewUser {
            full_name: full_name.to_string(),
            email: email.to_string(),
            password_hash,
            face_image: image,
            descriptor,
        })
        .await?;

    tracing::info!(email = %user.email, user_id = %user.id, "user registered");
    Ok((
        StatusCode::CREATED,
        Json(json!({ "message": "User registered successfully." })),
    ))
}

#[derive(Deserialize)]
struct LoginRequest {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

async fn login(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let req = body(payload)?;
    let (Some(email), Some(plain)) = (required(&req.email), req.password.clone()) else {
        return Err(ApiError::bad_request("All fields are required."));
    };
    let email = email.to_lowercase();

    state.check_rate(&email).await?;
    let user = state.require_user(&email).await?;

    let stored = user.password_hash.clone();
    let valid = tokio::task::spawn_blocking(move || password::verify_password(&plain, &stored))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    if !valid {
        state.record_failure(&email).await;
        tracing::info!(email = %email, "login rejected: invalid password");
        return Err(ApiError::bad_request("Invalid password"));
    }

    state.record_success(&email).await;
    tracing::info!(email = %email, "credentials accepted");
    Ok(Json(json!({ "user": user.to_account() })))
}

#[derive(Deserialize)]
struct EmailRequest {
    #[serde(default)]
    email: Option<String>,
}

async fn generate_otp(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<EmailRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let req = body(payload)?;
    let Some(email) = required(&req.email) else {
        return Err(ApiError::bad_request("Email is required."));
    };
    let user = state.require_user(email).await?;
    state.check_otp_send(&user.email).await?;

    let record = {
        let mut otp = state.otp.lock().await;
        let purged = otp.purge_stale(Utc::now());
        if purged > 0 {
            tracing::debug!(purged, "purged stale one-time codes");
        }
        otp.issue(&user.email)
    };

    state.mailer.send_otp(&user.email, &record.code).await?;
    state.otp_sends.lock().await.record_failure(&user.email);
    tracing::info!(email = %user.email, expires_at = %record.expires_at, "one-time code sent");
    Ok(Json(json!({ "message": "OTP sent successfully" })))
}

#[derive(Deserialize)]
struct VerifyOtpRequest {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    otp: Option<String>,
}

async fn verify_otp(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<VerifyOtpRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let req = body(payload)?;
    let (Some(email), Some(code)) = (required(&req.email), required(&req.otp)) else {
        return Err(ApiError::bad_request("Invalid OTP"));
    };
    let email = email.to_lowercase();

    state.check_rate(&email).await?;
    let verified = state.otp.lock().await.verify(&email, code);
    if let Err(rejection) = verified {
        state.record_failure(&email).await;
        tracing::info!(email = %email, reason = %rejection, "one-time code rejected");
        return Err(rejection.into());
    }

    let user = state.require_user(&email).await?;
    state.record_success(&email).await;
    let token = state.tokens.issue(user.id, &user.email)?;
    tracing::info!(email = %email, "one-time code accepted");
    Ok(Json(json!({ "token": token, "user": user.to_account() })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FaceLoginRequest {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    face_image: Option<String>,
}

async fn face_login(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<FaceLoginRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let req = body(payload)?;
    let (Some(email), Some(face_image)) = (required(&req.email), required(&req.face_image)) else {
        return Err(ApiError::bad_request("All fields are required."));
    };
    let email = email.to_lowercase();

    state.check_rate(&email).await?;
    let user = state.require_user(&email).await?;
    let image = decode_image(face_image).map_err(|_| ApiError::bad_request("Invalid image data."))?;

    match state.engine.verify(image, user.descriptor.clone()).await? {
        VerifyOutcome::Match { distance } => {
            state.record_success(&email).await;
            let token = state.tokens.issue(user.id, &user.email)?;
            tracing::info!(email = %email, distance, "face login accepted");
            Ok(Json(json!({
                "message": "Face login successful",
                "token": token,
                "user": user.to_account(),
            })))
        }
        VerifyOutcome::NoFace => Err(ApiError::bad_request("no face detected")),
        VerifyOutcome::Spoof { score } => {
            state.record_failure(&email).await;
            tracing::warn!(email = %email, score, "face login rejected: spoof detected");
            Err(ApiError::bad_request("spoof detected"))
        }
        VerifyOutcome::Mismatch { distance } => {
            state.record_failure(&email).await;
            tracing::info!(email = %email, distance = ?distance, "face login rejected: no match");
            Err(ApiError::bad_request("face does not match"))
        }
    }
}

async fn health(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let users = state.store.count_all().await?;
    Ok(Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "users": users,
    })))
}
