use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use voicebridge::config::Config;
use voicebridge::server::{router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    if let Err(e) = config.backend_ready() {
        // Not fatal: the webhook answers with the spoken fallback until the
        // credentials appear, but say so loudly at startup.
        tracing::warn!(error = %e, backend = ?config.backend, "voice backend not ready");
    }

    let bind_addr = config.bind_addr.clone();
    let state = AppState {
        config: Arc::new(config),
    };
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!(addr = %bind_addr, "voice bridge listening");
    axum::serve(listener, app)
        .await
        .context("server terminated")?;
    Ok(())
}
