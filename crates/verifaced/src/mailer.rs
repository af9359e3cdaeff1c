use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use ureq::Agent;

pub const OTP_SUBJECT: &str = "OTP Code for MFA";

#[derive(Error, Debug)]
pub enum MailError {
    #[error("mail relay unreachable: {0}")]
    Transport(String),
    #[error("mail relay rejected message: status {0}")]
    Rejected(u16),
    #[error("mail task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub fn otp_body(code: &str) -> String {
    format!("Your OTP for MFA is {code}")
}

/// Delivers one-time codes out of band.
#[async_trait]
pub trait OtpMailer: Send + Sync {
    async fn send_otp(&self, to: &str, code: &str) -> Result<(), MailError>;
}

#[derive(Serialize)]
struct RelayMessage<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    text: &'a str,
}

/// Posts messages as JSON to an HTTP mail relay.
pub struct RelayMailer {
    agent: Agent,
    url: String,
    from: String,
}

impl RelayMailer {
    pub fn new(url: &str, from: &str) -> Self {
        let agent: Agent = Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(10)))
            .http_status_as_error(false)
            .build()
            .into();
        Self {
            agent,
            url: url.to_string(),
            from: from.to_string(),
        }
    }
}

#[async_trait]
impl OtpMailer for RelayMailer {
    async fn send_otp(&self, to: &str, code: &str) -> Result<(), MailError> {
        let agent = self.agent.clone();
        let url = self.url.clone();
        let from = self.from.clone();
        let to = to.to_string();
        let text = otp_body(code);

        tokio::task::spawn_blocking(move || {
            let message = RelayMessage {
                from: &from,
                to: &to,
                subject: OTP_SUBJECT,
                text: &text,
            };
            let response = agent
                .post(&url)
                .send_json(&message)
                .map_err(|e| MailError::Transport(e.to_string()))?;
            let status = response.status().as_u16();
            if (200..300).contains(&status) {
                Ok(())
            } else {
                Err(MailError::Rejected(status))
            }
        })
        .await?
    }
}

/// Logs codes instead of sending them. Used when no relay is configured.
pub struct LogMailer;

#[async_trait]
impl OtpMailer for LogMailer {
    async fn send_otp(&self, to: &str, code: &str) -> Result<(), MailError> {
        tracing::warn!(to, code, "no mail relay configured, logging one-time code");
        Ok(())
    }
}
