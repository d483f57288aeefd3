use std::sync::Arc;

use anyhow::Context;
use url::Url;

use blobswarm::conf::{Conf, BLOB_ALGO, LISTEN_PORT};
use blobswarm::engine::{RqbitEngine, TorrentEngine};
use blobswarm::index::IndexClient;
use blobswarm::manager::BlobTaskManager;
use blobswarm::{seed, serve};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();

    let conf = Conf::from_env();
    let registry_base = conf.registry_base();
    Url::parse(&registry_base).context("failed to parse registry URL")?;

    std::fs::create_dir_all(&conf.bt_dir)
        .with_context(|| format!("failed to create BT directory {}", conf.bt_dir.display()))?;

    let engine = Arc::new(
        RqbitEngine::new(&conf.bt_dir)
            .await
            .context("failed to create torrent client")?,
    );
    let manager = BlobTaskManager::new(
        engine.clone(),
        IndexClient::new(conf.index_url.clone()),
        &conf.bt_dir,
        registry_base,
        conf.tracker_url.clone(),
    );

    seed::init_seed(&manager, &conf.blob_dir, BLOB_ALGO).await;

    let addr = format!("0.0.0.0:{LISTEN_PORT}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    log::info!("listening on {addr}");

    axum::serve(listener, serve::router(manager))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    engine.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::warn!("unable to listen for shutdown signal: {e}");
    }
}
