//! Download queue records and progress snapshots.

use serde::{Deserialize, Serialize};

use crate::peer::Peer;

/// Lifecycle state of a queued download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Queued,
    Downloading,
    /// Reserved for a user pause. The scheduler never produces it and never
    /// picks it up.
    Paused,
    Completed,
    Failed,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Queued => "queued",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Paused => "paused",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Failed => "failed",
        }
    }

    /// Completed and failed items keep their slot but are not worked on.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadStatus::Completed | DownloadStatus::Failed)
    }
}

/// Where an item's bytes come from.
///
/// Desktop items resolve the server URL from the connection at start time;
/// peer items carry the peer they were chosen from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum QueueOrigin {
    Desktop,
    Peer { peer: Peer },
}

/// Display metadata supplied when a video is enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDownload {
    pub video_id: String,
    pub title: String,
    pub channel_title: String,
    /// Duration in seconds.
    pub duration: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    pub origin: QueueOrigin,
}

/// The durable unit of work tracked by the download manager.
///
/// Timestamps are milliseconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub video_id: String,
    pub title: String,
    pub channel_title: String,
    pub duration: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    pub origin: QueueOrigin,
    pub status: DownloadStatus,
    /// 0..=100
    pub progress: u8,
    pub bytes_downloaded: u64,
    pub total_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retry_count: u32,
    pub added_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
}

impl QueueItem {
    pub fn new(request: NewDownload, added_at: u64) -> Self {
        Self {
            video_id: request.video_id,
            title: request.title,
            channel_title: request.channel_title,
            duration: request.duration,
            thumbnail_url: request.thumbnail_url,
            origin: request.origin,
            status: DownloadStatus::Queued,
            progress: 0,
            bytes_downloaded: 0,
            total_bytes: 0,
            error: None,
            retry_count: 0,
            added_at,
            started_at: None,
            completed_at: None,
        }
    }

    /// Clear per-attempt fields and put the item back in line.
    pub fn reset_for_retry(&mut self) {
        self.status = DownloadStatus::Queued;
        self.progress = 0;
        self.bytes_downloaded = 0;
        self.error = None;
        self.started_at = None;
    }
}

/// Byte-level progress of one transfer attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DownloadProgress {
    pub bytes_downloaded: u64,
    /// 0 when the sender did not announce a length.
    pub total_bytes: u64,
}

impl DownloadProgress {
    pub fn new(bytes_downloaded: u64, total_bytes: u64) -> Self {
        Self {
            bytes_downloaded,
            total_bytes,
        }
    }

    /// Whole percent, clamped to 0..=100.
    pub fn percent(&self) -> u8 {
        if self.total_bytes == 0 {
            return 0;
        }
        let pct = self.bytes_downloaded.saturating_mul(100) / self.total_bytes;
        pct.min(100) as u8
    }

    pub fn is_complete(&self) -> bool {
        self.total_bytes > 0 && self.bytes_downloaded >= self.total_bytes
    }
}

/// State of a peer-to-peer transfer as shown on the share screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
}

impl From<DownloadStatus> for TransferStatus {
    fn from(status: DownloadStatus) -> Self {
        match status {
            DownloadStatus::Queued | DownloadStatus::Paused => TransferStatus::Pending,
            DownloadStatus::Downloading => TransferStatus::Downloading,
            DownloadStatus::Completed => TransferStatus::Completed,
            DownloadStatus::Failed => TransferStatus::Failed,
        }
    }
}

/// Ephemeral per-transfer view for peer downloads. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub video_id: String,
    pub title: String,
    pub progress: u8,
    pub status: TransferStatus,
}
