//! Router binary: load config, build the router, serve the axum app.

use std::sync::Arc;

use router::{router_app, AppState, Router, RouterSettings};
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

    let settings = RouterSettings::from_env()?;
    let addr = format!("{}:{}", settings.router_host, settings.router_port);

    let router = Arc::new(Router::new(settings));
    router.startup().await;

    let app = router_app(AppState {
        router: Arc::clone(&router),
    });

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "router listening");
    axum::serve(listener, app).await?;

    router.shutdown();
    Ok(())
}
