use std::path::PathBuf;

use anyhow::{bail, Result};

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// HS256 signing secret for session tokens. Required.
    pub jwt_secret: String,
    /// Token lifetime in seconds.
    pub token_ttl_secs: i64,
    /// HTTP mail relay endpoint. Codes are only logged when unset.
    pub mail_relay_url: Option<String>,
    /// Sender address for one-time code emails.
    pub mail_from: String,
    /// The single origin allowed by CORS.
    pub frontend_origin: String,
    pub port: u16,
    /// Base URL of the face inference sidecar.
    pub oracle_url: String,
    /// Descriptor distance below which a face login matches.
    pub match_threshold: f32,
    /// Antispoof score below which a face login is rejected as a spoof.
    pub antispoof_threshold: f32,
    /// One-time code lifetime in seconds.
    pub otp_ttl_secs: i64,
}

impl Config {
    /// Load configuration from `VERIFACE_*` environment variables with
    /// defaults. Fails if no signing secret is configured.
    pub fn from_env() -> Result<Self> {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("veriface");

        let db_path = std::env::var("VERIFACE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("users.db"));

        let jwt_secret = match std::env::var("VERIFACE_JWT_SECRET") {
            Ok(secret) if !secret.trim().is_empty() => secret,
            _ => bail!("VERIFACE_JWT_SECRET must be set"),
        };

        Ok(Self {
            db_path,
            jwt_secret,
            token_ttl_secs: env_i64("VERIFACE_TOKEN_TTL_SECS", 3600),
            mail_relay_url: std::env::var("VERIFACE_MAIL_RELAY_URL")
                .ok()
                .filter(|v| !v.is_empty()),
            mail_from: std::env::var("VERIFACE_MAIL_FROM")
                .unwrap_or_else(|_| "no-reply@veriface.local".to_string()),
            frontend_origin: std::env::var("VERIFACE_FRONTEND_ORIGIN")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            port: env_parse("VERIFACE_PORT", 5000),
            oracle_url: std::env::var("VERIFACE_ORACLE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8700".to_string()),
            match_threshold: env_parse("VERIFACE_MATCH_THRESHOLD", 0.5),
            antispoof_threshold: env_parse("VERIFACE_ANTISPOOF_THRESHOLD", 0.5),
            otp_ttl_secs: env_i64("VERIFACE_OTP_TTL_SECS", 300),
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Positive integer seconds; anything else falls back to the default.
fn env_i64(key: &str, default: i64) -> i64 {
    match env_parse(key, default) {
        v if v > 0 => v,
        _ => default,
    }
}
