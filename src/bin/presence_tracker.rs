//! Presence Tracker entrypoint.

use colab_backend::config::PresenceConfig;
use colab_backend::presence::http::router;
use colab_backend::presence::PresenceTracker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let config = PresenceConfig::from_env();
    tracing::info!(bind_addr = %config.bind_addr, "starting presence tracker");

    let tracker = PresenceTracker::connect(&config.redis.url, config.ttl.as_secs()).await?;
    let app = router(tracker);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
