use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use veriface_core::{AuthError, AuthFlow, LandmarkOracle, LivenessProgress};
use veriface_oracle::HttpOracle;

mod backend;
mod camera;
mod config;
mod session_file;
mod speech;

use backend::HttpBackend;
use camera::DirectoryCamera;

#[derive(Parser)]
#[command(name = "veriface", version, about = "Multi-factor login with face liveness")]
struct Cli {
    /// Base URL of verifaced.
    #[arg(long, env = "VERIFACE_API_URL", default_value = "http://localhost:5000")]
    api_url: String,

    /// Where the authenticated-session marker is kept.
    #[arg(long, env = "VERIFACE_SESSION_FILE")]
    session_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Password, then one-time code, then face liveness.
    Login {
        #[arg(long)]
        email: Option<String>,
        /// Directory of camera frames (png/jpg), replayed in name order.
        #[arg(long)]
        frames: PathBuf,
        /// Base URL of the face inference sidecar.
        #[arg(long, env = "VERIFACE_ORACLE_URL", default_value = "http://127.0.0.1:8700")]
        oracle_url: String,
    },
    /// Forget the local session.
    Logout,
    /// Show whether a session is active.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let session_path = cli.session_file.unwrap_or_else(session_file::default_path);

    match cli.command {
        Command::Login {
            email,
            frames,
            oracle_url,
        } => login(&cli.api_url, &session_path, email, frames, &oracle_url).await,
        Command::Logout => {
            if session_file::remove(&session_path)? {
                println!("Logged out.");
            } else {
                println!("No active session.");
            }
            Ok(())
        }
        Command::Status => {
            match session_file::load(&session_path)? {
                Some(marker) if marker.status => println!(
                    "Logged in as {} <{}>",
                    marker.account.full_name, marker.account.email
                ),
                _ => println!("Not logged in."),
            }
            Ok(())
        }
    }
}

async fn login(
    api_url: &str,
    session_path: &std::path::Path,
    email: Option<String>,
    frames: PathBuf,
    oracle_url: &str,
) -> Result<()> {
    let mut lines = speech::stdin_lines();
    let email = match email {
        Some(email) => email,
        None => speech::prompt(&mut lines, "Email").await?,
    };
    let password = speech::prompt(&mut lines, "Password").await?;

    let oracle: Arc<dyn LandmarkOracle> = Arc::new(HttpOracle::new(oracle_url));
    let liveness = config::liveness_config_from_env();
    let required_blinks = liveness.blink.required_blinks;
    let mut flow = AuthFlow::new(HttpBackend::new(api_url), oracle, liveness);
    tracing::info!(api = flow.backend().base_url(), email = %email, "starting login");

    flow.submit_credentials(&email, &password).await?;
    eprintln!("A one-time code was sent to {email}.");

    let challenge = loop {
        let code = speech::prompt(&mut lines, "One-time code (or 'resend')").await?;
        if code.eq_ignore_ascii_case("resend") {
            flow.resend_otp().await?;
            eprintln!("A new code was sent.");
            continue;
        }
        match flow.submit_otp(&code).await {
            Ok(challenge) => break challenge,
            Err(AuthError::ExpiredOrConsumed) => {
                eprintln!("That code has expired. Type 'resend' for a new one.");
            }
            Err(e) if e.is_retryable() => eprintln!("{e}"),
            Err(e) => return Err(e.into()),
        }
    };

    eprintln!("Look at the camera, blink {required_blinks} times and say: {challenge}");
    // The attempt starts with the challenge listener already running.
    let handle = flow.start_liveness(Box::new(DirectoryCamera::new(frames)), Box::new(lines))?;

    let mut progress = handle.progress();
    let reporter = tokio::spawn(async move {
        let mut last = LivenessProgress::default();
        while progress.changed().await.is_ok() {
            let current = progress.borrow_and_update().clone();
            report(&last, &current);
            last = current;
        }
    });

    let result = tokio::select! {
        result = flow.complete_liveness(handle) => result,
        _ = tokio::signal::ctrl_c() => {
            flow.logout();
            reporter.abort();
            bail!("login cancelled");
        }
    };
    reporter.abort();

    let authenticated = result?;
    session_file::save(session_path, &authenticated.account)?;
    println!(
        "Authenticated as {} <{}>",
        authenticated.account.full_name, authenticated.account.email
    );
    Ok(())
}

fn report(last: &LivenessProgress, current: &LivenessProgress) {
    if current.face_present != last.face_present {
        eprintln!(
            "{}",
            if current.face_present { "Face found." } else { "Face lost." }
        );
    }
    if current.blink_count > last.blink_count {
        eprintln!("Blink {}.", current.blink_count);
    }
    if current.signals.face_verified && !last.signals.face_verified {
        eprintln!("Face matched.");
    }
    if current.signals.challenge_verified && !last.signals.challenge_verified {
        eprintln!("Code heard.");
    }
}
