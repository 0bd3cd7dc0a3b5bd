//! Persisted download queue.
//!
//! The queue is the single owner of every `QueueItem`. It knows nothing
//! about transfers or timers; the download manager drives it. Every status
//! change is written through to the key-value store. Progress ticks are
//! not, since a restart discards mid-transfer progress anyway.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use learnify_core::{DownloadProgress, DownloadStatus, NewDownload, QueueItem};

use crate::error::DownloadError;
use crate::store::KeyValueStore;

/// Store key the queue is persisted under.
pub const QUEUE_KEY: &str = "learnify-downloads";

#[derive(Serialize, Deserialize, Default)]
struct PersistedQueue {
    queue: Vec<QueueItem>,
}

pub struct DownloadQueue {
    items: Vec<QueueItem>,
    store: Arc<dyn KeyValueStore>,
}

impl DownloadQueue {
    /// Load the persisted queue. Anything left `downloading` by a previous
    /// process is put back in line with its progress cleared.
    ///
    /// A missing or unreadable snapshot yields an empty queue.
    pub fn load(store: Arc<dyn KeyValueStore>) -> Self {
        let persisted = match store.get(QUEUE_KEY) {
            Ok(Some(text)) => match serde_json::from_str::<PersistedQueue>(&text) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(error = %e, "discarding unreadable download queue");
                    PersistedQueue::default()
                }
            },
            Ok(None) => PersistedQueue::default(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to load download queue");
                PersistedQueue::default()
            }
        };

        let mut items = persisted.queue;
        let mut demoted = 0;
        for item in items.iter_mut() {
            if item.status == DownloadStatus::Downloading {
                item.reset_for_retry();
                demoted += 1;
            }
        }

        tracing::info!(items = items.len(), demoted, "download queue loaded");
        let queue = Self { items, store };
        if demoted > 0 {
            queue.save();
        }
        queue
    }

    /// Add a video, or re-queue a completed/failed one under the same key.
    pub fn enqueue(&mut self, request: NewDownload, now: u64) -> Result<QueueItem, DownloadError> {
        let item = QueueItem::new(request, now);
        match self.position(&item.video_id) {
            Some(idx) if !self.items[idx].status.is_terminal() => {
                return Err(DownloadError::AlreadyQueued(item.video_id));
            }
            Some(idx) => self.items[idx] = item.clone(),
            None => self.items.push(item.clone()),
        }
        self.save();
        Ok(item)
    }

    pub fn get(&self, video_id: &str) -> Option<&QueueItem> {
        self.items.iter().find(|i| i.video_id == video_id)
    }

    pub fn items(&self) -> &[QueueItem] {
        &self.items
    }

    pub fn active_count(&self) -> usize {
        self.with_status(DownloadStatus::Downloading).count()
    }

    /// Queued items, oldest first. Ties keep insertion order.
    pub fn queued_oldest_first(&self) -> Vec<&QueueItem> {
        let mut queued: Vec<&QueueItem> = self.with_status(DownloadStatus::Queued).collect();
        queued.sort_by_key(|i| i.added_at);
        queued
    }

    pub fn mark_downloading(&mut self, video_id: &str, now: u64) -> Option<QueueItem> {
        self.update(video_id, true, |item| {
            item.status = DownloadStatus::Downloading;
            item.started_at = Some(now);
        })
    }

    pub fn mark_completed(&mut self, video_id: &str, now: u64) -> Option<QueueItem> {
        self.update(video_id, true, |item| {
            item.status = DownloadStatus::Completed;
            item.progress = 100;
            item.bytes_downloaded = item.bytes_downloaded.max(item.total_bytes);
            item.error = None;
            item.completed_at = Some(now);
        })
    }

    pub fn mark_failed(&mut self, video_id: &str, error: impl Into<String>) -> Option<QueueItem> {
        let error = error.into();
        self.update(video_id, true, |item| {
            item.status = DownloadStatus::Failed;
            item.error = Some(error);
        })
    }

    /// Bump the retry counter and return the new value.
    pub fn increment_retry(&mut self, video_id: &str) -> Option<u32> {
        self.update(video_id, true, |item| item.retry_count += 1)
            .map(|item| item.retry_count)
    }

    /// Back to `queued` with per-attempt fields cleared, whatever the
    /// current state.
    pub fn requeue(&mut self, video_id: &str) -> Option<QueueItem> {
        self.update(video_id, true, QueueItem::reset_for_retry)
    }

    /// Record progress of the current attempt. Never moves backwards.
    pub fn update_progress(
        &mut self,
        video_id: &str,
        progress: DownloadProgress,
    ) -> Option<QueueItem> {
        self.update(video_id, false, |item| {
            item.progress = item.progress.max(progress.percent());
            item.bytes_downloaded = item.bytes_downloaded.max(progress.bytes_downloaded);
            item.total_bytes = progress.total_bytes;
        })
    }

    pub fn remove(&mut self, video_id: &str) -> Option<QueueItem> {
        let idx = self.position(video_id)?;
        let item = self.items.remove(idx);
        self.save();
        Some(item)
    }

    /// Drop every item the predicate rejects. Returns the removed items.
    pub fn retain(&mut self, mut keep: impl FnMut(&QueueItem) -> bool) -> Vec<QueueItem> {
        let (kept, removed): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.items).into_iter().partition(|i| keep(i));
        self.items = kept;
        if !removed.is_empty() {
            self.save();
        }
        removed
    }

    fn with_status(&self, status: DownloadStatus) -> impl Iterator<Item = &QueueItem> {
        self.items.iter().filter(move |i| i.status == status)
    }

    fn position(&self, video_id: &str) -> Option<usize> {
        self.items.iter().position(|i| i.video_id == video_id)
    }

    fn update(
        &mut self,
        video_id: &str,
        persist: bool,
        f: impl FnOnce(&mut QueueItem),
    ) -> Option<QueueItem> {
        let idx = self.position(video_id)?;
        f(&mut self.items[idx]);
        let snapshot = self.items[idx].clone();
        if persist {
            self.save();
        }
        Some(snapshot)
    }

    /// Write the queue to the store. Best-effort, logs on failure.
    fn save(&self) {
        let snapshot = PersistedQueue {
            queue: self.items.clone(),
        };
        let text = match serde_json::to_string(&snapshot) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize download queue");
                return;
            }
        };
        if let Err(e) = self.store.set(QUEUE_KEY, &text) {
            tracing::warn!(error = %e, "failed to persist download queue");
        }
    }
}
