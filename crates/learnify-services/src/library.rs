//! Local video library.
//!
//! Layout under the videos directory:
//!   {videos_dir}/{id}.mp4   video bytes
//!   {videos_dir}/{id}.json  `VideoMeta` sidecar
//!
//! A video is part of the library only when both files exist.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use learnify_core::{SharedVideo, VideoMeta};

/// Receives finished downloads.
pub trait LibrarySink: Send + Sync {
    fn add_or_update_video(&self, video_id: &str, meta: &VideoMeta, local_path: &Path)
        -> Result<()>;
}

/// Whether `video_id` can name a file directly inside the videos directory.
///
/// Ids come from peers and the desktop server, so anything that could
/// leave the directory is refused: empty ids, path separators, `..`, and
/// absolute paths.
pub fn is_valid_video_id(video_id: &str) -> bool {
    !video_id.is_empty()
        && !video_id.contains(&['/', '\\', '\0'][..])
        && !video_id.contains("..")
        && !Path::new(video_id).is_absolute()
}

/// Deterministic file name for a video's bytes. Downloading the same id
/// again overwrites it. `None` for ids that fail `is_valid_video_id`.
pub fn video_path(videos_dir: &Path, video_id: &str) -> Option<PathBuf> {
    is_valid_video_id(video_id).then(|| videos_dir.join(format!("{video_id}.mp4")))
}

fn sidecar_path(videos_dir: &Path, video_id: &str) -> Option<PathBuf> {
    is_valid_video_id(video_id).then(|| videos_dir.join(format!("{video_id}.json")))
}

#[derive(Clone)]
pub struct FsLibrary {
    videos_dir: PathBuf,
}

impl FsLibrary {
    pub fn new(videos_dir: impl Into<PathBuf>) -> Result<Self> {
        let videos_dir = videos_dir.into();
        fs::create_dir_all(&videos_dir)
            .with_context(|| format!("failed to create videos dir: {}", videos_dir.display()))?;
        Ok(Self { videos_dir })
    }

    pub fn videos_dir(&self) -> &Path {
        &self.videos_dir
    }

    /// Every complete local video, sorted by id. Unreadable sidecars are
    /// skipped with a warning.
    pub fn load_catalog(&self) -> Result<Vec<SharedVideo>> {
        let entries = fs::read_dir(&self.videos_dir)
            .with_context(|| format!("failed to list {}", self.videos_dir.display()))?;

        let mut catalog = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !video_path(&self.videos_dir, id).is_some_and(|p| p.exists()) {
                continue;
            }
            match read_meta(&path) {
                Ok(meta) => catalog.push(SharedVideo::new(meta)),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping sidecar"),
            }
        }
        catalog.sort_by(|a, b| a.id().cmp(b.id()));
        Ok(catalog)
    }
}

fn read_meta(path: &Path) -> Result<VideoMeta> {
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

impl LibrarySink for FsLibrary {
    fn add_or_update_video(
        &self,
        video_id: &str,
        meta: &VideoMeta,
        local_path: &Path,
    ) -> Result<()> {
        let expected = video_path(&self.videos_dir, video_id)
            .with_context(|| format!("invalid video id {video_id:?}"))?;
        if local_path != expected {
            fs::rename(local_path, &expected).with_context(|| {
                format!("failed to move {} into library", local_path.display())
            })?;
        }

        let path = sidecar_path(&self.videos_dir, video_id)
            .with_context(|| format!("invalid video id {video_id:?}"))?;
        let tmp_path = path.with_extension("json.tmp");
        let text = serde_json::to_string_pretty(meta).context("failed to serialize metadata")?;
        fs::write(&tmp_path, text)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed to rename into {}", path.display()))?;

        tracing::info!(video_id, title = %meta.title, "video added to library");
        Ok(())
    }
}
