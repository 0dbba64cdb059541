//! Reconciliation Engine entrypoint.

use colab_backend::config::ReconcilerConfig;
use colab_backend::reconciler::Reconciler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let config = ReconcilerConfig::from_env();
    tracing::info!("starting reconciliation engine");

    let reconciler = Reconciler::new(config).await?;
    reconciler.run().await?;
    Ok(())
}
