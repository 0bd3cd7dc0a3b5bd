//! Learnify integration test harness.
//!
//! Every test runs real sockets on loopback: a sharing device with a
//! transfer server over a temporary library, and a receiving device that
//! talks to it through the client or the download manager.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use tempfile::TempDir;

use learnify_core::{Peer, SharedVideo, VideoMeta};
use learnify_services::library::video_path;
use learnify_services::TransferServer;

mod downloads;
mod server_client;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// A device offering videos from its own library directory.
pub struct Sharer {
    pub server: TransferServer,
    pub port: u16,
    pub dir: TempDir,
}

impl Sharer {
    /// Start sharing `videos`, writing `(id, bytes)` files into the library
    /// first. Videos without bytes are listed but have no file on disk.
    pub async fn start(videos: &[(&str, Option<Vec<u8>>)]) -> Result<Self> {
        let dir = tempfile::tempdir().context("tempdir")?;
        let mut catalog = Vec::new();
        for (id, bytes) in videos {
            if let Some(bytes) = bytes {
                write_video(dir.path(), id, bytes)?;
            }
            catalog.push(shared(id));
        }

        let server = TransferServer::new("phone", dir.path(), TIMEOUT);
        let port = server.start(catalog, 0).await?;
        Ok(Self { server, port, dir })
    }

    pub fn peer(&self) -> Peer {
        Peer {
            name: "phone".into(),
            host: "127.0.0.1".into(),
            port: self.port,
            item_count: 0,
        }
    }
}

pub fn meta(id: &str) -> VideoMeta {
    VideoMeta {
        id: id.into(),
        title: format!("Lecture {id}"),
        channel_title: "Open Courses".into(),
        duration: 1800,
        transcript: None,
    }
}

pub fn shared(id: &str) -> SharedVideo {
    SharedVideo::new(meta(id))
}

pub fn write_video(dir: &Path, id: &str, bytes: &[u8]) -> Result<()> {
    let path = video_path(dir, id).with_context(|| format!("invalid video id {id:?}"))?;
    std::fs::write(path, bytes).with_context(|| format!("failed to write video {id}"))
}

/// Bytes that are not valid UTF-8 and span several read chunks.
pub fn binary_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8 | 0x80).collect()
}
