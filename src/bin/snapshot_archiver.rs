//! Snapshot Archiver entrypoint.

use std::sync::Arc;

use colab_backend::archiver::{router, ArchiverState};
use colab_backend::config::ArchiverConfig;
use object_store::ObjectStore;

/// Build the object store backend from `SNAPSHOT_STORE_URL`, e.g.
/// `s3://bucket`, `gs://bucket`, `az://container`, or `file:///data`.
/// Falls back to a local directory under `./snapshot-data` for
/// development.
fn build_store() -> anyhow::Result<Arc<dyn ObjectStore>> {
    match std::env::var("SNAPSHOT_STORE_URL") {
        Ok(url) => {
            let (store, _path) = object_store::parse_url(&url.parse()?)?;
            Ok(Arc::from(store))
        }
        Err(_) => {
            std::fs::create_dir_all("./snapshot-data")?;
            Ok(Arc::new(object_store::local::LocalFileSystem::new_with_prefix(
                "./snapshot-data",
            )?))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let config = ArchiverConfig::from_env();
    tracing::info!(bind_addr = %config.bind_addr, "starting snapshot archiver");

    let store = build_store()?;
    let state = ArchiverState::new(&config, store).await?;
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
