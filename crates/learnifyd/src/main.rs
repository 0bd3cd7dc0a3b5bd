//! learnifyd: headless Learnify host.
//!
//! Shares the local video library with nearby devices and keeps working
//! through the persisted download queue until Ctrl-C.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast::error::RecvError;

use learnify_core::config::LearnifyConfig;
use learnify_services::{
    DesktopClient, Discovery, DownloadManager, FileStore, FsLibrary, MulticastConfig,
    MulticastTransport, NetworkFetcher, PresencePublisher, QueueEvent, ServerConnection,
    SharingSession, TransferClient, TransferServer,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = LearnifyConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = LearnifyConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        LearnifyConfig::default()
    });
    let device = config.device.name.clone();
    let videos_dir = config.downloads.videos_dir.clone();
    tracing::info!(device = %device, videos = %videos_dir.display(), "learnifyd starting");

    // ── Library and desktop pairing ──────────────────────────────────────────

    let library = Arc::new(FsLibrary::new(&videos_dir)?);
    let timeout = config.network.request_timeout();
    let peers = TransferClient::new(&videos_dir, timeout);
    let desktop = DesktopClient::new(&videos_dir, timeout).context("failed to build HTTP client")?;

    let connection = ServerConnection::new();
    if let Some(url) = config.desktop.server_url() {
        connection.set_server_url(url);
        match desktop.get_info(url).await {
            Ok(info) => {
                tracing::info!(server = %info.name, version = %info.version, videos = info.video_count, "desktop server reachable");
                connection.set_server_name(&info.name);
            }
            Err(e) => tracing::warn!(error = %e, "desktop server not reachable"),
        }
    }

    // ── Downloads ────────────────────────────────────────────────────────────

    let store = Arc::new(
        FileStore::new(&config.downloads.state_dir).context("failed to open state dir")?,
    );
    let downloads = DownloadManager::new(
        config.downloads.clone(),
        store,
        Arc::new(NetworkFetcher::new(peers.clone(), desktop)),
        library.clone(),
        Arc::new(connection.clone()),
    );

    let mut events = downloads.subscribe();
    let event_printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(QueueEvent::Updated(item)) => tracing::debug!(
                    video_id = %item.video_id,
                    status = item.status.as_str(),
                    progress = item.progress,
                    "queue item updated"
                ),
                Ok(QueueEvent::Removed(id)) => tracing::debug!(video_id = %id, "queue item removed"),
                Err(RecvError::Lagged(n)) => tracing::debug!(skipped = n, "queue events lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    // ── Sharing ──────────────────────────────────────────────────────────────

    let transport = Arc::new(MulticastTransport::new(MulticastConfig::from(&config.network)));
    let discovery = Arc::new(Discovery::new(device.clone(), transport));
    let presence = Arc::new(PresencePublisher::new(discovery.clone()));
    presence.set_foreground(true);
    presence.set_paired(connection.is_connected());

    let server = Arc::new(TransferServer::new(device, &videos_dir, timeout));
    let session = SharingSession::new(
        server,
        discovery,
        presence,
        peers,
        downloads.clone(),
        config.network.transfer_port,
    );

    let catalog = library.load_catalog().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to read library, sharing nothing");
        Vec::new()
    });
    match session.start_sharing(catalog).await {
        Ok(port) => tracing::info!(port, "sharing local library"),
        Err(e) => tracing::error!(error = %e, "failed to start sharing"),
    }

    // ── Wait for exit ────────────────────────────────────────────────────────

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutting down");

    session.stop_sharing().await;
    session.stop_receiving();
    event_printer.abort();

    Ok(())
}
