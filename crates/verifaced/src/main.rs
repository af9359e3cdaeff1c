use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;
use veriface_core::{FaceMatcher, OtpManager};
use veriface_oracle::HttpOracle;

mod config;
mod engine;
mod error;
mod mailer;
mod password;
mod rate_limiter;
mod routes;
mod store;
mod token;

use config::Config;
use mailer::{LogMailer, OtpMailer, RelayMailer};
use routes::AppState;
use store::UserStore;
use token::TokenIssuer;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("verifaced starting");

    let config = Config::from_env()?;

    let store = UserStore::open(&config.db_path)
        .await
        .with_context(|| format!("opening user store at {}", config.db_path.display()))?;
    tracing::info!(path = %config.db_path.display(), users = store.count_all().await?, "user store opened");

    let oracle = HttpOracle::new(&config.oracle_url);
    tracing::info!(url = oracle.detect_url(), "using inference sidecar");
    let engine = engine::spawn_engine(
        Box::new(oracle),
        FaceMatcher::with_threshold(config.match_threshold),
        config.antispoof_threshold,
    )?;

    let mailer: Arc<dyn OtpMailer> = match &config.mail_relay_url {
        Some(url) => {
            tracing::info!(url = %url, "mail relay configured");
            Arc::new(RelayMailer::new(url, &config.mail_from))
        }
        None => {
            tracing::warn!("VERIFACE_MAIL_RELAY_URL unset, one-time codes will only be logged");
            Arc::new(LogMailer)
        }
    };

    let state = AppState::new(
        store,
        engine,
        OtpManager::with_ttl(chrono::Duration::seconds(config.otp_ttl_secs)),
        TokenIssuer::new(&config.jwt_secret, config.token_ttl_secs),
        mailer,
    );
    let app = routes::router(Arc::new(state)).layer(routes::cors_layer(&config.frontend_origin)?);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("binding port {}", config.port))?;
    tracing::info!(addr = %listener.local_addr()?, origin = %config.frontend_origin, "verifaced ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("verifaced shutting down");
        })
        .await?;

    Ok(())
}
