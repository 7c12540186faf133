use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use bandconf::Settings;
use bandstand::generator::shared_client;
use bandstand::llm::NullOracle;
use bandstand::server::{router, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load().context("failed to load settings")?;

    let filter = settings
        .log_level
        .clone()
        .map(EnvFilter::new)
        .unwrap_or_else(|| {
            EnvFilter::try_from_env("BANDSTAND_LOG").unwrap_or_else(|_| EnvFilter::new("info"))
        });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let generator = shared_client(&settings.generator);
    generator.warmup().await;

    let state = AppState {
        // The real tool-calling model is wired in by the deployment;
        // the null oracle fails loudly if a compose arrives without one.
        llm: Arc::new(NullOracle),
        generator,
        settings: settings.clone(),
    };

    let addr = settings.server.bind_addr.clone();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(addr = %addr, "bandstand listening");
    axum::serve(listener, router(state))
        .await
        .context("server error")?;
    Ok(())
}
