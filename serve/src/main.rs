//! Serve binary: load config, build the engine, run the HTTP surface.

use std::sync::Arc;

use marshal::EngineSettings;
use serve::{build_engine, router};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    if let Err(e) = env_config::load_and_apply("marshal", None) {
        tracing::warn!(error = %e, "config load failed, using env only");
    }

    let settings = Arc::new(EngineSettings::from_env());
    let host = env_config::env_string("SERVE_HOST", "0.0.0.0");
    let port = env_config::env_u64("SERVE_PORT", 8090);
    let addr = format!("{host}:{port}");

    let state = build_engine(settings)?;
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "orchestration surface listening");
    axum::serve(listener, app).await?;
    Ok(())
}
