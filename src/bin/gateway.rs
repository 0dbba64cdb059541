//! Collaboration Gateway entrypoint.

use colab_backend::config::GatewayConfig;
use colab_backend::gateway::{router, GatewayState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let config = GatewayConfig::from_env();
    tracing::info!(bind_addr = %config.bind_addr, "starting collaboration gateway");

    let state = GatewayState::new(&config).await?;
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
