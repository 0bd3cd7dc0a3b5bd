//! Share screen coordinator.
//!
//! A device is either offering its videos (server running, presence
//! published), browsing for peers to download from, or doing neither.
//! Downloads picked from a peer go through the regular download queue;
//! the session only remembers which ones it started so it can show their
//! progress.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

use learnify_core::{
    NewDownload, Peer, QueueOrigin, ShareCatalogEntry, SharedVideo, TransferProgress,
};

use crate::client::TransferClient;
use crate::discovery::presence::PresencePublisher;
use crate::discovery::{Discovery, ScanEvent};
use crate::downloads::DownloadManager;
use crate::error::{DownloadError, SharingError};
use crate::server::TransferServer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharingMode {
    Idle,
    Sharing { port: u16 },
    Receiving,
}

#[derive(Debug)]
struct SessionState {
    mode: SharingMode,
    selected: Option<Peer>,
    peer_videos: Vec<ShareCatalogEntry>,
    /// Video ids this session queued, in request order.
    transfers: Vec<String>,
}

pub struct SharingSession {
    server: Arc<TransferServer>,
    discovery: Arc<Discovery>,
    presence: Arc<PresencePublisher>,
    client: TransferClient,
    downloads: DownloadManager,
    port: u16,
    state: Mutex<SessionState>,
}

impl SharingSession {
    pub fn new(
        server: Arc<TransferServer>,
        discovery: Arc<Discovery>,
        presence: Arc<PresencePublisher>,
        client: TransferClient,
        downloads: DownloadManager,
        port: u16,
    ) -> Self {
        Self {
            server,
            discovery,
            presence,
            client,
            downloads,
            port,
            state: Mutex::new(SessionState {
                mode: SharingMode::Idle,
                selected: None,
                peer_videos: Vec::new(),
                transfers: Vec::new(),
            }),
        }
    }

    pub fn mode(&self) -> SharingMode {
        self.lock().mode
    }

    // ── Sharing ──────────────────────────────────────────────────────────────

    /// Offer `videos` to nearby peers.
    ///
    /// While already sharing this only replaces the catalog. Returns the
    /// port the server listens on.
    pub async fn start_sharing(&self, videos: Vec<SharedVideo>) -> Result<u16, SharingError> {
        let count = videos.len() as u32;

        if let SharingMode::Sharing { port } = self.mode() {
            self.server.update_catalog(videos);
            self.presence.set_offer(port, count);
            return Ok(port);
        }
        if self.mode() == SharingMode::Receiving {
            self.stop_receiving();
        }

        let port = self.server.start(videos, self.port).await?;
        self.presence.set_offer(port, count);
        self.lock().mode = SharingMode::Sharing { port };
        tracing::info!(port, videos = count, "sharing started");
        Ok(port)
    }

    pub async fn stop_sharing(&self) {
        self.presence.clear_offer();
        self.server.stop().await;
        let mut state = self.lock();
        if matches!(state.mode, SharingMode::Sharing { .. }) {
            state.mode = SharingMode::Idle;
            tracing::info!("sharing stopped");
        }
    }

    // ── Receiving ────────────────────────────────────────────────────────────

    /// Browse for peers. The discovery registry tracks them; the returned
    /// channel reports each change.
    pub async fn start_receiving(&self) -> mpsc::UnboundedReceiver<ScanEvent> {
        if matches!(self.mode(), SharingMode::Sharing { .. }) {
            self.stop_sharing().await;
        }
        let events = self.discovery.scan();
        self.lock().mode = SharingMode::Receiving;
        tracing::info!("receiving started");
        events
    }

    pub fn stop_receiving(&self) {
        self.discovery.stop();
        let mut state = self.lock();
        state.selected = None;
        state.peer_videos.clear();
        if state.mode == SharingMode::Receiving {
            state.mode = SharingMode::Idle;
        }
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.discovery.peers()
    }

    /// Fetch `peer`'s catalog and make it the download source.
    pub async fn select_peer(&self, peer: &Peer) -> Result<Vec<ShareCatalogEntry>, SharingError> {
        let videos = self.client.get_videos(peer).await?;
        tracing::info!(peer = %peer.name, videos = videos.len(), "peer selected");

        let mut state = self.lock();
        state.selected = Some(peer.clone());
        state.peer_videos = videos.clone();
        Ok(videos)
    }

    pub fn selected_peer(&self) -> Option<Peer> {
        self.lock().selected.clone()
    }

    /// Queue the given videos from the selected peer.
    ///
    /// Ids missing from the peer's catalog, or already in the queue, are
    /// skipped. Returns the progress entries of what was queued.
    pub fn download_from_peer(
        &self,
        video_ids: &[String],
    ) -> Result<Vec<TransferProgress>, SharingError> {
        let (peer, requests) = {
            let state = self.lock();
            let peer = state.selected.clone().ok_or(SharingError::NoPeerSelected)?;
            let requests: Vec<NewDownload> = video_ids
                .iter()
                .filter_map(|id| {
                    let entry = state.peer_videos.iter().find(|v| &v.id == id);
                    if entry.is_none() {
                        tracing::warn!(video_id = %id, peer = %peer.name, "not in peer catalog");
                    }
                    entry
                })
                .map(|entry| NewDownload {
                    video_id: entry.id.clone(),
                    title: entry.title.clone(),
                    channel_title: entry.channel_title.clone(),
                    duration: entry.duration,
                    thumbnail_url: None,
                    origin: QueueOrigin::Peer { peer: peer.clone() },
                })
                .collect();
            (peer, requests)
        };

        let mut queued = Vec::new();
        for request in requests {
            match self.downloads.queue_download(request) {
                Ok(item) => queued.push(item.video_id),
                Err(DownloadError::AlreadyQueued(id)) => {
                    tracing::debug!(video_id = %id, "already queued");
                }
                Err(e) => tracing::warn!(error = %e, "could not queue peer download"),
            }
        }
        tracing::info!(peer = %peer.name, count = queued.len(), "peer downloads queued");

        let mut state = self.lock();
        for id in &queued {
            if !state.transfers.contains(id) {
                state.transfers.push(id.clone());
            }
        }
        drop(state);

        Ok(self
            .transfers()
            .into_iter()
            .filter(|t| queued.contains(&t.video_id))
            .collect())
    }

    /// Progress of every transfer this session started that is still in
    /// the queue.
    pub fn transfers(&self) -> Vec<TransferProgress> {
        let mut state = self.lock();
        let downloads = &self.downloads;
        let mut out = Vec::new();
        state.transfers.retain(|id| match downloads.get(id) {
            Some(item) => {
                out.push(TransferProgress {
                    video_id: item.video_id,
                    title: item.title,
                    progress: item.progress,
                    status: item.status.into(),
                });
                true
            }
            None => false,
        });
        out
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
