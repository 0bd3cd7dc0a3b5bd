//! HTTP client for the paired desktop server.
//!
//! Same shape as the peer protocol, under an `/api` prefix and spoken over
//! real HTTP. Desktop downloads go through the same download manager as
//! peer downloads.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use learnify_core::{DownloadProgress, VideoMeta};

use crate::error::TransferError;
use crate::fetch::FetchedVideo;
use crate::library::video_path;

/// Body of `GET /api/info`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
    pub video_count: u32,
}

/// One entry of `GET /api/videos`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteVideo {
    pub id: String,
    pub title: String,
    pub channel_title: String,
    pub duration: u32,
    #[serde(default)]
    pub file_size: u64,
    #[serde(default)]
    pub has_transcript: bool,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
}

#[derive(Deserialize)]
struct RemoteVideoList {
    videos: Vec<RemoteVideo>,
}

#[derive(Debug, Clone)]
pub struct DesktopClient {
    http: reqwest::Client,
    timeout: Duration,
    videos_dir: PathBuf,
}

impl DesktopClient {
    pub fn new(videos_dir: impl Into<PathBuf>, timeout: Duration) -> Result<Self, TransferError> {
        let http = reqwest::Client::builder().connect_timeout(timeout).build()?;
        Ok(Self {
            http,
            timeout,
            videos_dir: videos_dir.into(),
        })
    }

    pub async fn get_info(&self, server_url: &str) -> Result<ServerInfo, TransferError> {
        self.get_json(&format!("{server_url}/api/info")).await
    }

    pub async fn get_videos(&self, server_url: &str) -> Result<Vec<RemoteVideo>, TransferError> {
        let list: RemoteVideoList = self.get_json(&format!("{server_url}/api/videos")).await?;
        Ok(list.videos)
    }

    pub async fn get_meta(
        &self,
        server_url: &str,
        video_id: &str,
    ) -> Result<VideoMeta, TransferError> {
        self.get_json(&format!("{server_url}/api/video/{video_id}/meta"))
            .await
    }

    pub fn file_url(server_url: &str, video_id: &str) -> String {
        format!("{server_url}/api/video/{video_id}/file")
    }

    /// Stream `/api/video/{id}/file` into `{videos_dir}/{id}.mp4`, then fetch
    /// the metadata. A failed call may leave a partial file.
    pub async fn download_file(
        &self,
        server_url: &str,
        video_id: &str,
        on_progress: &(dyn Fn(DownloadProgress) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<FetchedVideo, TransferError> {
        let local_path = video_path(&self.videos_dir, video_id)
            .ok_or_else(|| TransferError::InvalidVideoId(video_id.to_string()))?;
        let url = Self::file_url(server_url, video_id);

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            r = self.http.get(&url).send() => r?,
        };
        let response = response.error_for_status()?;
        let total = response.content_length().unwrap_or(0);

        self.write_body(response, &local_path, total, on_progress, cancel)
            .await?;

        let meta = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            r = self.get_meta(server_url, video_id) => r?,
        };

        tracing::debug!(video_id, path = %local_path.display(), "desktop download complete");
        Ok(FetchedVideo { local_path, meta })
    }

    async fn write_body(
        &self,
        response: reqwest::Response,
        path: &Path,
        total: u64,
        on_progress: &(dyn Fn(DownloadProgress) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        tokio::fs::create_dir_all(&self.videos_dir).await?;
        let mut file = tokio::fs::File::create(path).await?;
        let mut body = response.bytes_stream();
        let mut received = 0u64;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                next = body.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            received += chunk.len() as u64;
            on_progress(DownloadProgress::new(received, total));
        }
        file.flush().await?;

        if total > 0 && received < total {
            return Err(TransferError::Truncated {
                received,
                expected: total,
            });
        }
        Ok(())
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, TransferError> {
        let response = self
            .http
            .get(url)
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}
