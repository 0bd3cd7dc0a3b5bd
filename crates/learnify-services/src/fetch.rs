//! The seam between the download manager and the wire.
//!
//! The manager resolves each item's origin to a `TransferSource` once, when
//! the item starts, and hands it to a `VideoFetcher`. The state machine
//! never looks at which protocol moved the bytes.

use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use learnify_core::{DownloadProgress, Peer, VideoMeta};

use crate::client::TransferClient;
use crate::desktop::DesktopClient;
use crate::error::TransferError;
use crate::library::video_path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferSource {
    Desktop { server_url: String },
    Peer(Peer),
}

impl std::fmt::Display for TransferSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferSource::Desktop { server_url } => write!(f, "desktop {server_url}"),
            TransferSource::Peer(peer) => write!(f, "peer {} ({})", peer.name, peer.authority()),
        }
    }
}

/// A finished transfer: the file on disk and the metadata that goes with it.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedVideo {
    pub local_path: PathBuf,
    pub meta: VideoMeta,
}

pub type ProgressFn = Arc<dyn Fn(DownloadProgress) + Send + Sync>;

pub trait VideoFetcher: Send + Sync {
    /// Move one video's bytes and metadata to local storage.
    ///
    /// Must return `TransferError::Cancelled` promptly once `cancel` fires.
    fn fetch(
        &self,
        source: TransferSource,
        video_id: String,
        on_progress: ProgressFn,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<FetchedVideo, TransferError>>;

    /// Where a (possibly partial) download of `video_id` lands. `None` when
    /// the id cannot name a file in the videos directory.
    fn local_path(&self, video_id: &str) -> Option<PathBuf>;
}

/// Fetcher backed by the peer transfer client and the desktop HTTP client.
#[derive(Clone)]
pub struct NetworkFetcher {
    peers: TransferClient,
    desktop: DesktopClient,
}

impl NetworkFetcher {
    pub fn new(peers: TransferClient, desktop: DesktopClient) -> Self {
        Self { peers, desktop }
    }
}

impl VideoFetcher for NetworkFetcher {
    fn fetch(
        &self,
        source: TransferSource,
        video_id: String,
        on_progress: ProgressFn,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<FetchedVideo, TransferError>> {
        let this = self.clone();
        async move {
            match source {
                TransferSource::Peer(peer) => {
                    this.peers
                        .download_file(&peer, &video_id, &*on_progress, &cancel)
                        .await
                }
                TransferSource::Desktop { server_url } => {
                    this.desktop
                        .download_file(&server_url, &video_id, &*on_progress, &cancel)
                        .await
                }
            }
        }
        .boxed()
    }

    fn local_path(&self, video_id: &str) -> Option<PathBuf> {
        video_path(self.peers.videos_dir(), video_id)
    }
}
