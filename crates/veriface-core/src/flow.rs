//! Client-side orchestration of a full login.
//!
//! [`AuthFlow`] pairs a [`Session`] with the remote [`AuthBackend`] and drives
//! it through credentials, one-time code and liveness. Every backend call is
//! made only after the session has confirmed the transition is allowed, so a
//! stale action never reaches the server.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::challenge::ChallengeState;
use crate::error::AuthError;
use crate::oracle::{Camera, LandmarkOracle, SpeechOracle};
use crate::otp::DEFAULT_OTP_TTL_SECS;
use crate::runtime::{spawn_liveness, LivenessConfig, LivenessHandle, LivenessOutcome};
use crate::session::{FailureCause, OtpReceipt, Phase, Session};
use crate::types::{decode_image, Descriptor};

/// The user record as returned by the backend. Never carries the password
/// hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: Uuid,
    pub full_name: String,
    pub email: String,
    /// Enrolled face image, base64.
    #[serde(default)]
    pub face_image: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OtpGrant {
    pub token: String,
    pub user: Account,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceLoginGrant {
    pub message: String,
    pub token: String,
    pub user: Account,
}

/// Remote half of the login: credential check, code delivery, code check and
/// the final face snapshot.
#[async_trait]
pub trait AuthBackend: Send + Sync {
    async fn verify_credentials(&self, email: &str, password: &str) -> Result<Account, AuthError>;

    async fn issue_otp(&self, email: &str) -> Result<(), AuthError>;

    async fn verify_otp(&self, email: &str, otp: &str) -> Result<OtpGrant, AuthError>;

    async fn submit_snapshot(&self, email: &str, image: &[u8])
        -> Result<FaceLoginGrant, AuthError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Authenticated {
    pub account: Account,
    pub token: String,
}

pub struct AuthFlow<B> {
    backend: B,
    oracle: Arc<dyn LandmarkOracle>,
    config: LivenessConfig,
    cancel: CancellationToken,
    /// `None` while a liveness attempt owns it.
    session: Option<Session>,
    account: Option<Account>,
    token: Option<String>,
}

impl<B: AuthBackend> AuthFlow<B> {
    pub fn new(backend: B, oracle: Arc<dyn LandmarkOracle>, config: LivenessConfig) -> Self {
        Self {
            backend,
            oracle,
            config,
            cancel: CancellationToken::new(),
            session: Some(Session::new()),
            account: None,
            token: None,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn phase(&self) -> Option<Phase> {
        self.session.as_ref().map(Session::phase)
    }

    pub fn challenge_code(&self) -> Option<&str> {
        self.session.as_ref().and_then(Session::challenge_code)
    }

    fn session_in(&mut self, action: &'static str, phase: Phase) -> Result<&mut Session, AuthError> {
        let session = self.session.as_mut().ok_or(AuthError::InvalidTransition {
            action,
            phase: "LIVENESS (attempt running)".into(),
        })?;
        session.require(action, &[phase])?;
        Ok(session)
    }

    /// CREDENTIALS -> OTP_PENDING, then request the first code.
    pub async fn submit_credentials(&mut self, email: &str, password: &str) -> Result<(), AuthError> {
        if email.trim().is_empty() || password.is_empty() {
            return Err(AuthError::Validation("email and password are required".into()));
        }
        self.session_in("submit_credentials", Phase::Credentials)?;

        match self.backend.verify_credentials(email, password).await {
            Ok(account) => {
                self.session_in("submit_credentials", Phase::Credentials)?
                    .credentials_accepted(email)?;
                self.account = Some(account);
            }
            Err(e @ (AuthError::AuthFailure(_) | AuthError::NotFound(_))) => {
                self.session_in("submit_credentials", Phase::Credentials)?
                    .credentials_rejected()?;
                return Err(e);
            }
            Err(e) => {
                if let Some(session) = self.session.as_mut() {
                    session.fail(FailureCause::Transient);
                }
                return Err(e);
            }
        }

        self.resend_otp().await
    }

    /// Request a fresh code. Always issues a new one; the old code stops
    /// verifying.
    pub async fn resend_otp(&mut self) -> Result<(), AuthError> {
        let email = self
            .session_in("resend_otp", Phase::OtpPending)?
            .email()
            .map(str::to_owned)
            .ok_or_else(|| AuthError::Fatal("session has no email".into()))?;

        let issued_at = Utc::now();
        if let Err(e) = self.backend.issue_otp(&email).await {
            tracing::warn!(email = %email, error = %e, "otp delivery failed");
            if let Some(session) = self.session.as_mut() {
                session.fail(FailureCause::Transient);
            }
            return Err(e);
        }
        self.session_in("resend_otp", Phase::OtpPending)?
            .otp_issued(OtpReceipt {
                issued_at,
                expires_at: issued_at + Duration::seconds(DEFAULT_OTP_TTL_SECS),
            })?;
        tracing::info!(email = %email, "otp requested");
        Ok(())
    }

    /// OTP_PENDING -> LIVENESS. Returns the spoken challenge code to display.
    pub async fn submit_otp(&mut self, code: &str) -> Result<String, AuthError> {
        let code = code.trim();
        if code.is_empty() {
            return Err(AuthError::Validation("code is required".into()));
        }
        let email = self
            .session_in("submit_otp", Phase::OtpPending)?
            .email()
            .map(str::to_owned)
            .ok_or_else(|| AuthError::Fatal("session has no email".into()))?;

        let grant = match self.backend.verify_otp(&email, code).await {
            Ok(grant) => grant,
            Err(e @ AuthError::TransientInfra(_)) => return Err(e),
            Err(e) => {
                self.session_in("submit_otp", Phase::OtpPending)?
                    .otp_rejected(&e)?;
                return Err(e);
            }
        };

        let reference = match self.reference_descriptor(&grant.user).await {
            Ok(reference) => reference,
            Err(e) => {
                let cause = match e {
                    AuthError::TransientInfra(_) => FailureCause::OracleUnavailable,
                    _ => FailureCause::Internal,
                };
                if let Some(session) = self.session.as_mut() {
                    session.fail(cause);
                }
                return Err(e);
            }
        };

        let challenge = ChallengeState::issue();
        let challenge_code = challenge.code().to_string();
        self.session_in("submit_otp", Phase::OtpPending)?
            .otp_accepted(reference, challenge)?;
        self.token = Some(grant.token);
        self.account = Some(grant.user);
        Ok(challenge_code)
    }

    /// Embedding of the enrolled image, computed off the async runtime.
    async fn reference_descriptor(&self, account: &Account) -> Result<Descriptor, AuthError> {
        let encoded = account
            .face_image
            .as_deref()
            .ok_or_else(|| AuthError::Validation("account has no enrolled face".into()))?;
        let image = decode_image(encoded)
            .map_err(|e| AuthError::Validation(format!("enrolled face image: {e}")))?;

        let oracle = Arc::clone(&self.oracle);
        let described = tokio::task::spawn_blocking(move || oracle.describe(&image))
            .await
            .map_err(|e| AuthError::Fatal(format!("descriptor task failed: {e}")))??;
        described.ok_or_else(|| AuthError::Validation("no face in enrolled image".into()))
    }

    /// Hand the session to a liveness owner task. The session comes back via
    /// [`AuthFlow::complete_liveness`].
    pub fn start_liveness(
        &mut self,
        camera: Box<dyn Camera>,
        speech: Box<dyn SpeechOracle>,
    ) -> Result<LivenessHandle, AuthError> {
        self.session_in("start_liveness", Phase::Liveness)?;
        let session = self.session.take().ok_or(AuthError::InvalidTransition {
            action: "start_liveness",
            phase: "LIVENESS (attempt running)".into(),
        })?;
        Ok(spawn_liveness(
            session,
            camera,
            Arc::clone(&self.oracle),
            speech,
            self.config.clone(),
            &self.cancel,
        ))
    }

    /// Wait for the liveness attempt and post the final snapshot.
    ///
    /// A failed snapshot post does not undo the local transition: the code
    /// already earned a token and liveness was satisfied locally.
    pub async fn complete_liveness(
        &mut self,
        handle: LivenessHandle,
    ) -> Result<Authenticated, AuthError> {
        let (session, outcome) = handle.finish().await?;
        let email = session.email().map(str::to_owned);
        self.session = Some(session);

        let result = match outcome {
            LivenessOutcome::Satisfied { snapshot } => Ok(snapshot),
            LivenessOutcome::Cancelled => Err(AuthError::AuthFailure("liveness cancelled".into())),
            LivenessOutcome::TimedOut => Err(AuthError::AuthFailure("liveness timed out".into())),
            LivenessOutcome::Failed(e) => Err(e),
        };
        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(e) => {
                // The code's token only stands once liveness succeeds.
                self.token = None;
                return Err(e);
            }
        };

        if let Some(email) = email.as_deref() {
            match self.backend.submit_snapshot(email, &snapshot).await {
                Ok(grant) => {
                    tracing::info!(email, message = %grant.message, "face login accepted");
                    self.token = Some(grant.token);
                    self.account = Some(grant.user);
                }
                Err(e) => tracing::warn!(email, error = %e, "face snapshot post failed"),
            }
        }

        match (self.account.clone(), self.token.clone()) {
            (Some(account), Some(token)) => Ok(Authenticated { account, token }),
            _ => Err(AuthError::Fatal("authenticated without account or token".into())),
        }
    }

    /// Cancel any running attempt and clear all state. Idempotent.
    pub fn logout(&mut self) {
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        if let Some(session) = self.session.as_mut() {
            session.close();
        }
        self.account = None;
        self.token = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::{CameraError, Frame, OracleError};
    use crate::session::tests::{descriptor, landmark_frame};
    use crate::session::Resume;
    use crate::types::encode_image;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    const PASSWORD: &str = "correct horse";

    fn account() -> Account {
        Account {
            id: Uuid::nil(),
            full_name: "Test User".into(),
            email: "user@example.com".into(),
            face_image: Some(format!("data:image/png;base64,{}", encode_image(b"face"))),
            created_at: Utc::now(),
        }
    }

    #[derive(Default)]
    struct MockBackend {
        otp: Mutex<Option<String>>,
        expired: bool,
        snapshot_fails: bool,
        issued: AtomicUsize,
    }

    #[async_trait]
    impl AuthBackend for MockBackend {
        async fn verify_credentials(&self, email: &str, password: &str) -> Result<Account, AuthError> {
            if email != "user@example.com" {
                return Err(AuthError::NotFound("user".into()));
            }
            if password != PASSWORD {
                return Err(AuthError::AuthFailure("invalid password".into()));
            }
            Ok(account())
        }

        async fn issue_otp(&self, _email: &str) -> Result<(), AuthError> {
            self.issued.fetch_add(1, Ordering::SeqCst);
            *self.otp.lock().unwrap() = Some("482913".into());
            Ok(())
        }

        async fn verify_otp(&self, _email: &str, otp: &str) -> Result<OtpGrant, AuthError> {
            if self.expired {
                return Err(AuthError::ExpiredOrConsumed);
            }
            let mut stored = self.otp.lock().unwrap();
            match stored.as_deref() {
                Some(code) if code == otp => {
                    *stored = None;
                    Ok(OtpGrant {
                        token: "otp-token".into(),
                        user: account(),
                    })
                }
                Some(_) => Err(AuthError::AuthFailure("invalid code".into())),
                None => Err(AuthError::ExpiredOrConsumed),
            }
        }

        async fn submit_snapshot(
            &self,
            _email: &str,
            image: &[u8],
        ) -> Result<FaceLoginGrant, AuthError> {
            if self.snapshot_fails || image.is_empty() {
                return Err(AuthError::TransientInfra("connection reset".into()));
            }
            Ok(FaceLoginGrant {
                message: "Face login successful".into(),
                token: "face-token".into(),
                user: account(),
            })
        }
    }

    /// Every frame has an open-eyed matching face except a blink every
    /// fifth frame.
    struct BlinkingOracle {
        calls: AtomicUsize,
    }

    impl LandmarkOracle for BlinkingOracle {
        fn detect(
            &self,
            _frame: &Frame,
        ) -> Result<Option<crate::types::LandmarkFrame>, OracleError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let ear = if n % 5 == 1 || n % 5 == 2 { 0.10 } else { 0.30 };
            Ok(Some(landmark_frame(ear, descriptor())))
        }
    }

    struct StillCamera;

    impl Camera for StillCamera {
        fn open(&mut self) -> Result<(), CameraError> {
            Ok(())
        }

        fn capture(&mut self) -> Result<Option<Frame>, CameraError> {
            Ok(Some(Frame::new(b"snapshot".to_vec())))
        }

        fn release(&mut self) {}
    }

    fn flow(backend: MockBackend) -> AuthFlow<MockBackend> {
        let config = LivenessConfig {
            tick_interval: std::time::Duration::from_millis(2),
            head_interval: std::time::Duration::from_millis(5),
            attempt_timeout: std::time::Duration::from_secs(5),
            ..LivenessConfig::default()
        };
        AuthFlow::new(
            backend,
            Arc::new(BlinkingOracle {
                calls: AtomicUsize::new(0),
            }),
            config,
        )
    }

    async fn run_liveness(flow: &mut AuthFlow<MockBackend>) -> Result<Authenticated, AuthError> {
        let code = flow.challenge_code().unwrap().to_string();
        let (tx, rx) = mpsc::channel(4);
        let handle = flow.start_liveness(Box::new(StillCamera), Box::new(rx))?;
        tx.send(code).await.unwrap();
        flow.complete_liveness(handle).await
    }

    #[tokio::test]
    async fn test_full_login() {
        let mut flow = flow(MockBackend::default());
        flow.submit_credentials("user@example.com", PASSWORD).await.unwrap();
        assert_eq!(flow.phase(), Some(Phase::OtpPending));

        let challenge = flow.submit_otp("482913").await.unwrap();
        assert_eq!(challenge.len(), 4);
        assert_eq!(flow.phase(), Some(Phase::Liveness));

        let auth = run_liveness(&mut flow).await.unwrap();
        assert_eq!(auth.token, "face-token");
        assert_eq!(auth.account.email, "user@example.com");
        assert_eq!(flow.phase(), Some(Phase::Authenticated));
    }

    #[tokio::test]
    async fn test_liveness_listens_from_the_start() {
        let mut flow = flow(MockBackend::default());
        flow.submit_credentials("user@example.com", PASSWORD).await.unwrap();
        let code = flow.submit_otp("482913").await.unwrap();

        let (tx, rx) = mpsc::channel(4);
        let handle = flow.start_liveness(Box::new(StillCamera), Box::new(rx)).unwrap();
        let mut progress = handle.progress();
        tokio::time::timeout(
            std::time::Duration::from_secs(2),
            progress.wait_for(|p| p.listening),
        )
        .await
        .unwrap()
        .unwrap();

        // Restart is allowed after an explicit stop.
        handle.stop_listening().await;
        assert!(handle.start_listening().await.is_ok());

        tx.send(code).await.unwrap();
        let auth = flow.complete_liveness(handle).await.unwrap();
        assert_eq!(auth.token, "face-token");
        assert_eq!(flow.phase(), Some(Phase::Authenticated));
    }

    #[tokio::test]
    async fn test_bad_password_then_retry() {
        let mut flow = flow(MockBackend::default());
        let err = flow
            .submit_credentials("user@example.com", "wrong")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::AuthFailure(_)));
        assert_eq!(
            flow.phase(),
            Some(Phase::Failed {
                cause: FailureCause::BadCredentials,
                resume: Some(Resume::Credentials)
            })
        );
        flow.submit_credentials("user@example.com", PASSWORD).await.unwrap();
        assert_eq!(flow.phase(), Some(Phase::OtpPending));
    }

    #[tokio::test]
    async fn test_otp_before_credentials_is_rejected() {
        let mut flow = flow(MockBackend::default());
        assert!(matches!(
            flow.submit_otp("482913").await,
            Err(AuthError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_expired_otp_then_resend() {
        let mut flow = flow(MockBackend {
            expired: true,
            ..Default::default()
        });
        flow.submit_credentials("user@example.com", PASSWORD).await.unwrap();
        let err = flow.submit_otp("482913").await.unwrap_err();
        assert_eq!(err, AuthError::ExpiredOrConsumed);
        assert!(matches!(
            flow.phase(),
            Some(Phase::Failed {
                cause: FailureCause::ExpiredOtp,
                ..
            })
        ));
        flow.resend_otp().await.unwrap();
        assert_eq!(flow.phase(), Some(Phase::OtpPending));
        assert_eq!(flow.backend().issued.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_snapshot_failure_still_authenticates() {
        let mut flow = flow(MockBackend {
            snapshot_fails: true,
            ..Default::default()
        });
        flow.submit_credentials("user@example.com", PASSWORD).await.unwrap();
        flow.submit_otp("482913").await.unwrap();

        let auth = run_liveness(&mut flow).await.unwrap();
        assert_eq!(auth.token, "otp-token");
        assert_eq!(flow.phase(), Some(Phase::Authenticated));
    }

    #[tokio::test]
    async fn test_timed_out_attempt_drops_token() {
        let mut flow = flow(MockBackend::default());
        flow.config.attempt_timeout = std::time::Duration::from_millis(100);
        flow.submit_credentials("user@example.com", PASSWORD).await.unwrap();
        flow.submit_otp("482913").await.unwrap();
        assert_eq!(flow.token.as_deref(), Some("otp-token"));

        let (_tx, rx) = mpsc::channel::<String>(4);
        let handle = flow
            .start_liveness(Box::new(StillCamera), Box::new(rx))
            .unwrap();
        let err = flow.complete_liveness(handle).await.unwrap_err();
        assert_eq!(err, AuthError::AuthFailure("liveness timed out".into()));
        assert!(flow.token.is_none());
        assert!(matches!(
            flow.phase(),
            Some(Phase::Failed {
                cause: FailureCause::LivenessTimeout,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_logout_cancels_running_attempt() {
        let mut flow = flow(MockBackend::default());
        flow.submit_credentials("user@example.com", PASSWORD).await.unwrap();
        flow.submit_otp("482913").await.unwrap();

        let (_tx, rx) = mpsc::channel::<String>(4);
        let handle = flow
            .start_liveness(Box::new(StillCamera), Box::new(rx))
            .unwrap();
        assert!(flow.start_liveness(Box::new(StillCamera), Box::new(mpsc::channel::<String>(1).1)).is_err());

        flow.logout();
        let err = flow.complete_liveness(handle).await.unwrap_err();
        assert!(matches!(err, AuthError::AuthFailure(_)));
        assert_eq!(flow.phase(), Some(Phase::Closed));
        assert_eq!(flow.challenge_code(), None);
    }
}
