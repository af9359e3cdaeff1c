//! [`AuthBackend`] over the verifaced HTTP API.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use ureq::Agent;
use veriface_core::{encode_image, Account, AuthBackend, AuthError, FaceLoginGrant, OtpGrant};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Deserialize)]
struct LoginResponse {
    user: Account,
}

#[derive(Deserialize)]
struct MessageResponse {
    message: String,
}

pub struct HttpBackend {
    agent: Agent,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: &str) -> Self {
        let agent: Agent = Agent::config_builder()
            .timeout_global(Some(REQUEST_TIMEOUT))
            .http_status_as_error(false)
            .build()
            .into();
        Self {
            agent,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn call<T>(&self, path: &'static str, body: Value) -> Result<T, AuthError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let agent = self.agent.clone();
        let url = format!("{}{path}", self.base_url);
        tokio::task::spawn_blocking(move || post_json(&agent, &url, &body))
            .await
            .map_err(|e| AuthError::Fatal(format!("request task failed: {e}")))?
    }
}

fn post_json<T: DeserializeOwned>(agent: &Agent, url: &str, body: &Value) -> Result<T, AuthError> {
    let mut response = agent
        .post(url)
        .send_json(body)
        .map_err(|e| AuthError::TransientInfra(format!("{url}: {e}")))?;

    let status = response.status().as_u16();
    if (200..300).contains(&status) {
        return response
            .body_mut()
            .read_json::<T>()
            .map_err(|e| AuthError::Fatal(format!("unexpected response from {url}: {e}")));
    }

    let retry_after = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok());
    let message = response
        .body_mut()
        .read_json::<ErrorBody>()
        .map(|b| b.error)
        .unwrap_or_default();
    tracing::debug!(url, status, error = %message, "backend rejected request");
    Err(map_error(status, message, retry_after))
}

/// Map a non-2xx response onto the error taxonomy.
fn map_error(status: u16, message: String, retry_after: Option<u64>) -> AuthError {
    match status {
        429 => AuthError::RateLimited {
            retry_after_secs: retry_after.unwrap_or(0),
        },
        400 => match message.as_str() {
            "User not found" => AuthError::NotFound(message),
            "OTP expired" => AuthError::ExpiredOrConsumed,
            "All fields are required." | "Invalid image data." => AuthError::Validation(message),
            _ => AuthError::AuthFailure(message),
        },
        500..=599 => AuthError::TransientInfra(if message.is_empty() {
            format!("server returned {status}")
        } else {
            message
        }),
        _ => AuthError::Fatal(format!("unexpected status {status}: {message}")),
    }
}

#[async_trait]
impl AuthBackend for HttpBackend {
    async fn verify_credentials(&self, email: &str, password: &str) -> Result<Account, AuthError> {
        let response: LoginResponse = self
            .call("/login", json!({ "email": email, "password": password }))
            .await?;
        Ok(response.user)
    }

    async fn issue_otp(&self, email: &str) -> Result<(), AuthError> {
        let response: MessageResponse = self
            .call("/generate-otp", json!({ "email": email }))
            .await?;
        tracing::debug!(email, message = %response.message, "otp issued");
        Ok(())
    }

    async fn verify_otp(&self, email: &str, otp: &str) -> Result<OtpGrant, AuthError> {
        self.call("/verify-otp", json!({ "email": email, "otp": otp }))
            .await
    }

    async fn submit_snapshot(
        &self,
        email: &str,
        image: &[u8],
    ) -> Result<FaceLoginGrant, AuthError> {
        self.call(
            "/face-login",
            json!({ "email": email, "faceImage": encode_image(image) }),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;

    use super::*;

    /// Serve exactly one canned HTTP response on a loopback port.
    fn serve_once(status: &'static str, body: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut content_length = 0usize;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                if line == "\r\n" || line.is_empty() {
                    break;
                }
                if let Some(v) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                    content_length = v.trim().parse().unwrap();
                }
            }
            let mut request_body = vec![0u8; content_length];
            reader.read_exact(&mut request_body).unwrap();

            let mut stream = stream;
            write!(
                stream,
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            )
            .unwrap();
        });
        format!("http://{addr}")
    }

    const USER: &str = r#"{"id":"6f9619ff-8b86-d011-b42d-00c04fc964ff","fullName":"Test User","email":"user@example.com","faceImage":"AAAA","createdAt":"2024-05-01T12:00:00Z"}"#;

    #[test]
    fn test_error_mapping() {
        assert_eq!(
            map_error(400, "User not found".into(), None),
            AuthError::NotFound("User not found".into())
        );
        assert_eq!(
            map_error(400, "Invalid password".into(), None),
            AuthError::AuthFailure("Invalid password".into())
        );
        assert_eq!(map_error(400, "OTP expired".into(), None), AuthError::ExpiredOrConsumed);
        assert_eq!(
            map_error(429, String::new(), Some(30)),
            AuthError::RateLimited { retry_after_secs: 30 }
        );
        assert!(matches!(
            map_error(500, "Failed to send OTP".into(), None),
            AuthError::TransientInfra(_)
        ));
        assert!(matches!(map_error(404, String::new(), None), AuthError::Fatal(_)));
    }

    #[tokio::test]
    async fn test_verify_credentials_returns_account() {
        let body = format!(r#"{{"user":{USER}}}"#);
        let backend = HttpBackend::new(&serve_once("200 OK", body));
        let account = backend
            .verify_credentials("user@example.com", "hunter22")
            .await
            .unwrap();
        assert_eq!(account.email, "user@example.com");
        assert_eq!(account.full_name, "Test User");
    }

    #[tokio::test]
    async fn test_verify_otp_rejection() {
        let backend = HttpBackend::new(&serve_once("400 Bad Request", r#"{"error":"Invalid OTP"}"#.into()));
        let err = backend
            .verify_otp("user@example.com", "000000")
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::AuthFailure("Invalid OTP".into()));
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_transient() {
        let backend = HttpBackend::new("http://127.0.0.1:9/");
        assert_eq!(backend.base_url(), "http://127.0.0.1:9");
        let err = backend.issue_otp("user@example.com").await.unwrap_err();
        assert!(matches!(err, AuthError::TransientInfra(_)));
    }
}
