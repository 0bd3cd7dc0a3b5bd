//! Transfer client. Talks to a peer's transfer server.
//!
//! One TCP connection per request, mirroring the server. The JSON calls are
//! bounded by the request timeout end to end. File downloads bound the
//! connect and every individual read by the same timeout, and otherwise run
//! until the body is complete or the caller cancels.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use learnify_core::catalog::VideoList;
use learnify_core::wire::{head_len, Request, ResponseHead, Route, MAX_HEAD_BYTES};
use learnify_core::{DownloadProgress, Peer, PeerInfo, ShareCatalogEntry, VideoMeta};

use crate::error::TransferError;
use crate::fetch::FetchedVideo;
use crate::library::video_path;

const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct TransferClient {
    timeout: Duration,
    videos_dir: PathBuf,
}

/// Open connection with the response head consumed.
struct Response {
    head: ResponseHead,
    stream: TcpStream,
    /// Body bytes that arrived in the same reads as the head.
    prefix: Vec<u8>,
}

impl TransferClient {
    pub fn new(videos_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            timeout,
            videos_dir: videos_dir.into(),
        }
    }

    pub fn videos_dir(&self) -> &Path {
        &self.videos_dir
    }

    pub async fn get_info(&self, peer: &Peer) -> Result<PeerInfo, TransferError> {
        self.get_json(peer, "/info").await
    }

    pub async fn get_videos(&self, peer: &Peer) -> Result<Vec<ShareCatalogEntry>, TransferError> {
        let list: VideoList = self.get_json(peer, "/videos").await?;
        Ok(list.videos)
    }

    pub async fn get_meta(&self, peer: &Peer, video_id: &str) -> Result<VideoMeta, TransferError> {
        self.get_json(peer, &Route::meta_path(video_id)).await
    }

    /// Stream a video into `{videos_dir}/{id}.mp4`, then fetch its metadata.
    ///
    /// Either both the file and the metadata come back or the call fails.
    /// A failed call may leave a partial file behind; removing it is the
    /// caller's job. Ids that would escape `videos_dir` are refused before
    /// any connection is made.
    pub async fn download_file(
        &self,
        peer: &Peer,
        video_id: &str,
        on_progress: &(dyn Fn(DownloadProgress) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<FetchedVideo, TransferError> {
        let local_path = video_path(&self.videos_dir, video_id)
            .ok_or_else(|| TransferError::InvalidVideoId(video_id.to_string()))?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            r = self.stream_to_file(peer, video_id, &local_path, on_progress) => r?,
        }

        let meta = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            r = self.get_meta(peer, video_id) => r?,
        };

        tracing::debug!(peer = %peer.name, video_id, path = %local_path.display(), "peer download complete");
        Ok(FetchedVideo { local_path, meta })
    }

    async fn stream_to_file(
        &self,
        peer: &Peer,
        video_id: &str,
        path: &Path,
        on_progress: &(dyn Fn(DownloadProgress) + Send + Sync),
    ) -> Result<(), TransferError> {
        let addr = peer.authority();
        let Response {
            head,
            mut stream,
            prefix,
        } = timeout(self.timeout, self.send(peer, &Route::file_path(video_id)))
            .await
            .map_err(|_| TransferError::Timeout { addr: addr.clone() })??;

        if !head.is_success() {
            return Err(TransferError::Status(head.status));
        }

        tokio::fs::create_dir_all(&self.videos_dir).await?;
        let mut file = File::create(path).await?;

        let total = head.content_length;
        let mut received = 0u64;

        let take = remaining_chunk(prefix.len(), total, received);
        if take > 0 {
            file.write_all(&prefix[..take]).await?;
            received += take as u64;
            on_progress(DownloadProgress::new(received, total));
        }

        let mut buf = vec![0u8; READ_CHUNK];
        while received < total {
            let n = timeout(self.timeout, stream.read(&mut buf))
                .await
                .map_err(|_| TransferError::Timeout { addr: addr.clone() })??;
            if n == 0 {
                break;
            }
            let n = remaining_chunk(n, total, received);
            file.write_all(&buf[..n]).await?;
            received += n as u64;
            on_progress(DownloadProgress::new(received, total));
        }
        file.flush().await?;

        if received < total {
            return Err(TransferError::Truncated {
                received,
                expected: total,
            });
        }
        Ok(())
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        peer: &Peer,
        path: &str,
    ) -> Result<T, TransferError> {
        timeout(self.timeout, self.read_json(peer, path))
            .await
            .map_err(|_| TransferError::Timeout {
                addr: peer.authority(),
            })?
    }

    async fn read_json<T: DeserializeOwned>(
        &self,
        peer: &Peer,
        path: &str,
    ) -> Result<T, TransferError> {
        let Response {
            head,
            mut stream,
            mut prefix,
        } = self.send(peer, path).await?;
        if !head.is_success() {
            return Err(TransferError::Status(head.status));
        }

        let total = head.content_length;
        prefix.truncate(remaining_chunk(prefix.len(), total, 0));
        let missing = total - prefix.len() as u64;
        (&mut stream).take(missing).read_to_end(&mut prefix).await?;
        if (prefix.len() as u64) < total {
            return Err(TransferError::Truncated {
                received: prefix.len() as u64,
                expected: total,
            });
        }

        serde_json::from_slice(&prefix).map_err(|e| TransferError::Malformed(e.to_string()))
    }

    /// Connect, send a GET, and read up to the end of the response head.
    async fn send(&self, peer: &Peer, path: &str) -> Result<Response, TransferError> {
        let addr = peer.authority();
        let mut stream = TcpStream::connect(&addr)
            .await
            .map_err(|source| TransferError::Unreachable {
                addr: addr.clone(),
                source,
            })?;
        stream.write_all(&Request::get(path).encode(&addr)).await?;
        tracing::trace!(%addr, path, "request sent");

        let mut buf = Vec::with_capacity(1024);
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(end) = head_len(&buf) {
                let head = ResponseHead::parse(&buf[..end])?;
                let prefix = buf.split_off(end);
                return Ok(Response {
                    head,
                    stream,
                    prefix,
                });
            }
            if buf.len() > MAX_HEAD_BYTES {
                return Err(TransferError::Malformed("response head too large".into()));
            }
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(TransferError::Malformed(
                    "connection closed before response head".into(),
                ));
            }
            buf.extend_from_slice(&chunk[..n]);
        }
    }
}

/// How many of `available` bytes still belong to a body of `total` bytes.
fn remaining_chunk(available: usize, total: u64, received: u64) -> usize {
    let left = total.saturating_sub(received);
    usize::try_from(left).map_or(available, |left| available.min(left))
}
