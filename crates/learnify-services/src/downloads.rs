//! Download manager: the queue state machine.
//!
//! ```text
//! queued      -[scheduled]-------------------> downloading
//! downloading -[success]---------------------> completed
//! downloading -[failure, retries left]-------> queued (after backoff)
//! downloading -[failure, exhausted/404]------> failed
//! queued|downloading -[cancel]---------------> removed
//! any         -[retry]-----------------------> queued
//! ```
//!
//! All bookkeeping lives behind one mutex that is never held across an
//! await. Transfers run as spawned tasks and report back through
//! `complete`/`fail`, which re-check the item's cancellation token under the
//! lock so a cancelled transfer can never resurrect a removed item.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use learnify_core::config::DownloadSettings;
use learnify_core::{DownloadProgress, DownloadStatus, NewDownload, QueueItem, QueueOrigin};

use crate::connection::SessionSource;
use crate::error::{DownloadError, TransferError};
use crate::fetch::{FetchedVideo, ProgressFn, TransferSource, VideoFetcher};
use crate::library::{is_valid_video_id, LibrarySink};
use crate::queue::DownloadQueue;
use crate::store::KeyValueStore;

/// Queue change notification for UI layers.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Updated(QueueItem),
    Removed(String),
}

#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<ManagerState>,
    fetcher: Arc<dyn VideoFetcher>,
    library: Arc<dyn LibrarySink>,
    session: Arc<dyn SessionSource>,
    settings: DownloadSettings,
    /// Held for the duration of one scheduling pass.
    processing: AtomicBool,
    /// Set by callers that arrive while a pass is running.
    rescan: AtomicBool,
    events: broadcast::Sender<QueueEvent>,
}

struct ManagerState {
    queue: DownloadQueue,
    /// One token per running transfer.
    active: HashMap<String, CancellationToken>,
    /// Armed backoff timers. An item with a timer is not eligible to start.
    retry_timers: HashMap<String, JoinHandle<()>>,
    last_progress: HashMap<String, Instant>,
}

/// A transfer that was marked `downloading` and must now be spawned.
struct Started {
    video_id: String,
    title: String,
    source: TransferSource,
    cancel: CancellationToken,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Delete a partial download. Best-effort.
fn remove_file_quietly(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "removed partial download"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::debug!(path = %path.display(), error = %e, "failed to remove partial download"),
    }
}

impl DownloadManager {
    /// Restore the persisted queue and run one scheduling pass.
    ///
    /// Items a previous process left `downloading` come back as `queued`.
    /// Must be called from within a Tokio runtime.
    pub fn new(
        settings: DownloadSettings,
        store: Arc<dyn KeyValueStore>,
        fetcher: Arc<dyn VideoFetcher>,
        library: Arc<dyn LibrarySink>,
        session: Arc<dyn SessionSource>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let manager = Self {
            inner: Arc::new(Inner {
                state: Mutex::new(ManagerState {
                    queue: DownloadQueue::load(store),
                    active: HashMap::new(),
                    retry_timers: HashMap::new(),
                    last_progress: HashMap::new(),
                }),
                fetcher,
                library,
                session,
                settings,
                processing: AtomicBool::new(false),
                rescan: AtomicBool::new(false),
                events,
            }),
        };
        manager.process_queue();
        manager
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    pub fn get(&self, video_id: &str) -> Option<QueueItem> {
        self.lock().queue.get(video_id).cloned()
    }

    pub fn list(&self) -> Vec<QueueItem> {
        self.lock().queue.items().to_vec()
    }

    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    pub fn is_downloading(&self, video_id: &str) -> bool {
        self.lock().active.contains_key(video_id)
    }

    // ── Operations ───────────────────────────────────────────────────────────

    /// Add a video to the queue and schedule.
    ///
    /// A completed or failed entry for the same id is reset and re-queued in
    /// place. Any other existing entry is rejected, as is an id that cannot
    /// name a file in the videos directory.
    pub fn queue_download(&self, request: NewDownload) -> Result<QueueItem, DownloadError> {
        if !is_valid_video_id(&request.video_id) {
            tracing::warn!(video_id = ?request.video_id, "refusing invalid video id");
            return Err(DownloadError::InvalidVideoId(request.video_id));
        }
        let item = self.lock().queue.enqueue(request, now_ms())?;
        tracing::info!(video_id = %item.video_id, title = %item.title, "download queued");
        self.emit(QueueEvent::Updated(item.clone()));
        self.process_queue();
        Ok(item)
    }

    /// Start queued items until the concurrency ceiling is reached.
    ///
    /// Safe to call from anywhere, any number of times. A call that arrives
    /// while a pass is running is folded into that pass.
    pub fn process_queue(&self) {
        self.inner.rescan.store(true, Ordering::SeqCst);
        loop {
            if self.inner.processing.swap(true, Ordering::SeqCst) {
                return;
            }
            while self.inner.rescan.swap(false, Ordering::SeqCst) {
                self.schedule_pass();
            }
            self.inner.processing.store(false, Ordering::SeqCst);
            if !self.inner.rescan.load(Ordering::SeqCst) {
                return;
            }
        }
    }

    /// Abort and remove one item. Removing an absent item is a no-op.
    pub fn cancel(&self, video_id: &str) {
        let removed = {
            let mut guard = self.lock();
            let state = &mut *guard;
            if let Some(token) = state.active.remove(video_id) {
                token.cancel();
            }
            if let Some(timer) = state.retry_timers.remove(video_id) {
                timer.abort();
            }
            state.last_progress.remove(video_id);

            let removed = state.queue.remove(video_id);
            if let Some(item) = &removed {
                if item.status != DownloadStatus::Completed {
                    self.remove_partial(video_id);
                }
            }
            removed
        };

        if removed.is_some() {
            tracing::info!(video_id, "download cancelled");
            self.emit(QueueEvent::Removed(video_id.to_string()));
        }
        self.process_queue();
    }

    /// Abort everything and drop every item that is not completed.
    pub fn cancel_all(&self) {
        let removed = {
            let mut guard = self.lock();
            let state = &mut *guard;
            for (video_id, token) in state.active.drain() {
                token.cancel();
                self.remove_partial(&video_id);
            }
            for (_, timer) in state.retry_timers.drain() {
                timer.abort();
            }
            state.last_progress.clear();
            state
                .queue
                .retain(|item| item.status == DownloadStatus::Completed)
        };

        tracing::info!(removed = removed.len(), "all downloads cancelled");
        for item in removed {
            self.emit(QueueEvent::Removed(item.video_id));
        }
    }

    /// Put an item back in line whatever its state, aborting any running
    /// attempt. The retry counter is kept.
    pub fn retry(&self, video_id: &str) -> Result<QueueItem, DownloadError> {
        let item = {
            let mut guard = self.lock();
            let state = &mut *guard;
            if let Some(token) = state.active.remove(video_id) {
                token.cancel();
            }
            if let Some(timer) = state.retry_timers.remove(video_id) {
                timer.abort();
            }
            state.last_progress.remove(video_id);
            state
                .queue
                .requeue(video_id)
                .ok_or_else(|| DownloadError::UnknownVideo(video_id.to_string()))?
        };

        tracing::info!(video_id, "manual retry");
        self.emit(QueueEvent::Updated(item.clone()));
        self.process_queue();
        Ok(item)
    }

    pub fn clear_completed(&self) {
        self.clear(DownloadStatus::Completed);
    }

    pub fn clear_failed(&self) {
        self.clear(DownloadStatus::Failed);
    }

    fn clear(&self, status: DownloadStatus) {
        let removed = self.lock().queue.retain(|item| item.status != status);
        tracing::debug!(status = status.as_str(), removed = removed.len(), "queue cleared");
        for item in removed {
            self.emit(QueueEvent::Removed(item.video_id));
        }
    }

    // ── Scheduling ───────────────────────────────────────────────────────────

    fn schedule_pass(&self) {
        let started = {
            let mut guard = self.lock();
            let state = &mut *guard;

            let active = state.queue.active_count();
            let mut slots = self.inner.settings.max_concurrent.saturating_sub(active);
            let candidates: Vec<String> = state
                .queue
                .queued_oldest_first()
                .into_iter()
                .filter(|item| !state.retry_timers.contains_key(&item.video_id))
                .map(|item| item.video_id.clone())
                .collect();

            tracing::debug!(active, eligible = candidates.len(), slots, "processing queue");
            if slots == 0 || candidates.is_empty() {
                return;
            }

            let mut started = Vec::new();
            for video_id in candidates {
                if slots == 0 {
                    break;
                }
                if let Some(s) = self.start_item(state, &video_id) {
                    started.push(s);
                    slots -= 1;
                }
            }
            started
        };

        for s in started {
            let manager = self.clone();
            tokio::spawn(async move { manager.run_transfer(s).await });
        }
    }

    /// Resolve the source and mark the item `downloading`. Desktop items
    /// with no paired server fail here without consuming a slot.
    fn start_item(&self, state: &mut ManagerState, video_id: &str) -> Option<Started> {
        let item = state.queue.get(video_id)?;
        let title = item.title.clone();
        let source = match &item.origin {
            QueueOrigin::Peer { peer } => TransferSource::Peer(peer.clone()),
            QueueOrigin::Desktop => match self.inner.session.server_url() {
                Some(server_url) => TransferSource::Desktop { server_url },
                None => {
                    tracing::warn!(video_id, "no desktop server, cannot download");
                    let error = TransferError::NotConnected.to_string();
                    if let Some(item) = state.queue.mark_failed(video_id, error) {
                        self.emit(QueueEvent::Updated(item));
                    }
                    return None;
                }
            },
        };

        let cancel = CancellationToken::new();
        state.active.insert(video_id.to_string(), cancel.clone());
        state.last_progress.remove(video_id);
        let item = state.queue.mark_downloading(video_id, now_ms())?;
        self.emit(QueueEvent::Updated(item));

        tracing::info!(video_id, %source, "download starting");
        Some(Started {
            video_id: video_id.to_string(),
            title,
            source,
            cancel,
        })
    }

    async fn run_transfer(self, started: Started) {
        let Started {
            video_id,
            title,
            source,
            cancel,
        } = started;

        let on_progress: ProgressFn = {
            let manager = self.clone();
            let video_id = video_id.clone();
            let cancel = cancel.clone();
            Arc::new(move |progress| {
                if !cancel.is_cancelled() {
                    manager.report_progress(&video_id, progress);
                }
            })
        };

        let result = self
            .inner
            .fetcher
            .fetch(source, video_id.clone(), on_progress, cancel.clone())
            .await;

        match result {
            Ok(fetched) => self.complete(&video_id, &title, &cancel, fetched),
            Err(e) => self.fail(&video_id, &title, &cancel, e),
        }
    }

    fn complete(&self, video_id: &str, title: &str, cancel: &CancellationToken, fetched: FetchedVideo) {
        let item = {
            let mut state = self.lock();
            if cancel.is_cancelled() {
                tracing::debug!(video_id, "transfer finished after cancel, ignoring");
                self.discard_cancelled(&state, video_id);
                return;
            }
            state.active.remove(video_id);
            state.last_progress.remove(video_id);
            state.queue.mark_completed(video_id, now_ms())
        };
        if let Some(item) = item {
            self.emit(QueueEvent::Updated(item));
        }

        if let Err(e) =
            self.inner
                .library
                .add_or_update_video(video_id, &fetched.meta, &fetched.local_path)
        {
            tracing::error!(video_id, error = %e, "failed to add video to library");
        }
        tracing::info!(video_id, title, "download complete");

        self.process_queue();
    }

    fn fail(&self, video_id: &str, title: &str, cancel: &CancellationToken, error: TransferError) {
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            if cancel.is_cancelled() {
                tracing::info!(video_id, "download aborted");
                self.discard_cancelled(state, video_id);
                return;
            }
            state.active.remove(video_id);
            state.last_progress.remove(video_id);
            self.remove_partial(video_id);

            let Some(retry) = state.queue.increment_retry(video_id) else {
                return;
            };
            let max_retries = self.inner.settings.max_retries;

            if error.is_retryable() && retry <= max_retries {
                let delay = self.inner.settings.retry_delay(retry);
                tracing::warn!(
                    video_id,
                    title,
                    retry,
                    max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "download failed, retry scheduled"
                );
                if let Some(item) = state.queue.requeue(video_id) {
                    self.emit(QueueEvent::Updated(item));
                }
                self.arm_retry_timer(state, video_id, delay);
            } else {
                tracing::error!(video_id, title, retry, error = %error, "download failed");
                if let Some(item) = state.queue.mark_failed(video_id, error.to_string()) {
                    self.emit(QueueEvent::Updated(item));
                }
            }
        }

        // Backfill the freed slot. The item itself waits for its timer.
        self.process_queue();
    }

    fn remove_partial(&self, video_id: &str) {
        if let Some(path) = self.inner.fetcher.local_path(video_id) {
            remove_file_quietly(&path);
        }
    }

    /// A cancelled transfer may write after `cancel` already cleaned up.
    /// Its file goes too, unless the id has been queued again since.
    fn discard_cancelled(&self, state: &ManagerState, video_id: &str) {
        if state.queue.get(video_id).is_none() {
            self.remove_partial(video_id);
        }
    }

    fn arm_retry_timer(&self, state: &mut ManagerState, video_id: &str, delay: Duration) {
        let manager = self.clone();
        let id = video_id.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.lock().retry_timers.remove(&id);
            tracing::debug!(video_id = %id, "retry timer fired");
            manager.process_queue();
        });
        if let Some(previous) = state.retry_timers.insert(video_id.to_string(), timer) {
            previous.abort();
        }
    }

    /// Record progress, at most once per throttle window. Completion is
    /// always recorded.
    fn report_progress(&self, video_id: &str, progress: DownloadProgress) {
        let now = Instant::now();
        let throttle = self.inner.settings.progress_throttle();

        let item = {
            let mut guard = self.lock();
            let state = &mut *guard;
            if progress.percent() < 100 {
                if let Some(last) = state.last_progress.get(video_id) {
                    if now.duration_since(*last) < throttle {
                        return;
                    }
                }
            }
            match state.queue.get(video_id) {
                Some(item) if item.status == DownloadStatus::Downloading => {}
                _ => return,
            }
            state.last_progress.insert(video_id.to_string(), now);
            state.queue.update_progress(video_id, progress)
        };

        if let Some(item) = item {
            tracing::trace!(video_id, progress = item.progress, "download progress");
            self.emit(QueueEvent::Updated(item));
        }
    }

    fn emit(&self, event: QueueEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;

    use futures::future::BoxFuture;
    use futures::FutureExt;
    use learnify_core::VideoMeta;

    use crate::library::video_path;
    use crate::queue::QUEUE_KEY;
    use crate::store::MemoryStore;

    const ZERO: Duration = Duration::ZERO;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[derive(Clone)]
    enum Step {
        /// Report each `(delay, bytes)` of a 100-byte body, then succeed.
        Succeed(Vec<(Duration, u64)>),
        /// Fail with an HTTP status after a delay.
        Fail(Duration, u16),
        /// Write a partial file and wait for cancellation.
        Hang,
        /// Write a partial file, then fail with HTTP 500 after a delay.
        PartialThenFail(Duration),
        /// Ignore cancellation long enough to write a file, then report it.
        WriteAfterCancel,
    }

    struct FetcherState {
        dir: PathBuf,
        scripts: Mutex<HashMap<String, VecDeque<Step>>>,
        calls: Mutex<Vec<(String, Instant)>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    #[derive(Clone)]
    struct ScriptedFetcher {
        state: Arc<FetcherState>,
    }

    impl ScriptedFetcher {
        fn new(dir: &Path) -> Self {
            Self {
                state: Arc::new(FetcherState {
                    dir: dir.to_path_buf(),
                    scripts: Mutex::new(HashMap::new()),
                    calls: Mutex::new(Vec::new()),
                    in_flight: AtomicUsize::new(0),
                    max_in_flight: AtomicUsize::new(0),
                }),
            }
        }

        fn script(&self, video_id: &str, steps: Vec<Step>) {
            self.state
                .scripts
                .lock()
                .unwrap()
                .insert(video_id.to_string(), steps.into());
        }

        fn calls(&self) -> Vec<(String, Instant)> {
            self.state.calls.lock().unwrap().clone()
        }

        fn call_ids(&self) -> Vec<String> {
            self.calls().into_iter().map(|(id, _)| id).collect()
        }

        fn in_flight(&self) -> usize {
            self.state.in_flight.load(Ordering::SeqCst)
        }

        fn max_in_flight(&self) -> usize {
            self.state.max_in_flight.load(Ordering::SeqCst)
        }
    }

    fn meta(video_id: &str) -> VideoMeta {
        VideoMeta {
            id: video_id.into(),
            title: format!("Video {video_id}"),
            channel_title: "Channel".into(),
            duration: 60,
            transcript: None,
        }
    }

    async fn run_step(
        dir: &Path,
        video_id: &str,
        step: Step,
        on_progress: &(dyn Fn(DownloadProgress) + Send + Sync),
    ) -> Result<FetchedVideo, TransferError> {
        let path = video_path(dir, video_id).unwrap();
        match step {
            Step::Succeed(ticks) => {
                std::fs::write(&path, b"video").unwrap();
                for (delay, bytes) in ticks {
                    tokio::time::sleep(delay).await;
                    on_progress(DownloadProgress::new(bytes, 100));
                }
                Ok(FetchedVideo {
                    local_path: path,
                    meta: meta(video_id),
                })
            }
            Step::Fail(delay, status) => {
                tokio::time::sleep(delay).await;
                Err(TransferError::Status(status))
            }
            Step::Hang => {
                std::fs::write(&path, b"part").unwrap();
                std::future::pending().await
            }
            Step::PartialThenFail(delay) => {
                std::fs::write(&path, b"part").unwrap();
                tokio::time::sleep(delay).await;
                Err(TransferError::Status(500))
            }
            Step::WriteAfterCancel => unreachable!("handled by the fetcher"),
        }
    }

    impl VideoFetcher for ScriptedFetcher {
        fn fetch(
            &self,
            _source: TransferSource,
            video_id: String,
            on_progress: ProgressFn,
            cancel: CancellationToken,
        ) -> BoxFuture<'static, Result<FetchedVideo, TransferError>> {
            let state = self.state.clone();
            async move {
                let step = state
                    .scripts
                    .lock()
                    .unwrap()
                    .get_mut(&video_id)
                    .and_then(|steps| steps.pop_front())
                    .unwrap_or_else(|| Step::Succeed(vec![(ms(100), 100)]));
                state
                    .calls
                    .lock()
                    .unwrap()
                    .push((video_id.clone(), Instant::now()));
                let running = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                state.max_in_flight.fetch_max(running, Ordering::SeqCst);

                let result = match step {
                    Step::WriteAfterCancel => {
                        cancel.cancelled().await;
                        let path = video_path(&state.dir, &video_id).unwrap();
                        std::fs::write(path, b"late").unwrap();
                        Err(TransferError::Cancelled)
                    }
                    step => tokio::select! {
                        _ = cancel.cancelled() => Err(TransferError::Cancelled),
                        r = run_step(&state.dir, &video_id, step, &*on_progress) => r,
                    },
                };
                state.in_flight.fetch_sub(1, Ordering::SeqCst);
                result
            }
            .boxed()
        }

        fn local_path(&self, video_id: &str) -> Option<PathBuf> {
            video_path(&self.state.dir, video_id)
        }
    }

    #[derive(Default)]
    struct RecordingLibrary {
        added: Mutex<Vec<String>>,
    }

    impl LibrarySink for RecordingLibrary {
        fn add_or_update_video(
            &self,
            video_id: &str,
            _meta: &VideoMeta,
            _local_path: &Path,
        ) -> anyhow::Result<()> {
            self.added.lock().unwrap().push(video_id.to_string());
            Ok(())
        }
    }

    struct FixedSession(Option<String>);

    impl SessionSource for FixedSession {
        fn server_url(&self) -> Option<String> {
            self.0.clone()
        }
    }

    struct Harness {
        manager: DownloadManager,
        fetcher: ScriptedFetcher,
        library: Arc<RecordingLibrary>,
        _tmp: tempfile::TempDir,
    }

    fn settings(max_concurrent: usize) -> DownloadSettings {
        DownloadSettings {
            max_concurrent,
            ..DownloadSettings::default()
        }
    }

    fn harness_with(
        max_concurrent: usize,
        server_url: Option<&str>,
        store: Arc<MemoryStore>,
        scripts: &[(&str, Vec<Step>)],
    ) -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let fetcher = ScriptedFetcher::new(tmp.path());
        for (id, steps) in scripts {
            fetcher.script(id, steps.clone());
        }
        let library = Arc::new(RecordingLibrary::default());
        let manager = DownloadManager::new(
            settings(max_concurrent),
            store,
            Arc::new(fetcher.clone()),
            library.clone(),
            Arc::new(FixedSession(server_url.map(str::to_string))),
        );
        Harness {
            manager,
            fetcher,
            library,
            _tmp: tmp,
        }
    }

    fn harness(max_concurrent: usize) -> Harness {
        harness_with(
            max_concurrent,
            Some("http://desk:8765"),
            Arc::new(MemoryStore::new()),
            &[],
        )
    }

    fn request(video_id: &str) -> NewDownload {
        NewDownload {
            video_id: video_id.into(),
            title: format!("Video {video_id}"),
            channel_title: "Channel".into(),
            duration: 60,
            thumbnail_url: None,
            origin: QueueOrigin::Desktop,
        }
    }

    fn status(manager: &DownloadManager, video_id: &str) -> Option<DownloadStatus> {
        manager.get(video_id).map(|item| item.status)
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..10_000 {
            if cond() {
                return;
            }
            tokio::time::sleep(ms(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_enqueue_is_rejected() {
        let h = harness(2);
        h.fetcher.script("v1", vec![Step::Hang]);
        h.manager.queue_download(request("v1")).unwrap();
        assert!(matches!(
            h.manager.queue_download(request("v1")),
            Err(DownloadError::AlreadyQueued(_))
        ));
        assert_eq!(h.manager.list().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_ids_are_refused_before_any_fetch() {
        let h = harness(2);
        for bad in ["", "../outside", "nested/id", "/abs/path", "..\\up"] {
            assert!(matches!(
                h.manager.queue_download(request(bad)),
                Err(DownloadError::InvalidVideoId(_))
            ));
        }
        tokio::task::yield_now().await;

        assert!(h.manager.list().is_empty());
        assert!(h.fetcher.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_is_bounded_and_fifo() {
        let h = harness(2);
        let ids = ["a", "b", "c", "d", "e"];
        for id in ids {
            h.fetcher.script(id, vec![Step::Succeed(vec![(ms(500), 100)])]);
            h.manager.queue_download(request(id)).unwrap();
            assert!(h.manager.active_count() <= 2);
        }

        wait_until(|| {
            ids.iter()
                .all(|id| status(&h.manager, id) == Some(DownloadStatus::Completed))
        })
        .await;

        assert_eq!(h.fetcher.max_in_flight(), 2);
        assert_eq!(h.fetcher.call_ids(), ids);
        assert_eq!(h.library.added.lock().unwrap().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn two_transient_failures_then_success() {
        let h = harness(2);
        h.fetcher.script(
            "v1",
            vec![
                Step::Fail(ZERO, 500),
                Step::Fail(ZERO, 503),
                Step::Succeed(vec![(ms(50), 100)]),
            ],
        );
        h.manager.queue_download(request("v1")).unwrap();

        wait_until(|| status(&h.manager, "v1") == Some(DownloadStatus::Completed)).await;

        let item = h.manager.get("v1").unwrap();
        assert_eq!(item.retry_count, 2);
        assert_eq!(item.progress, 100);

        let calls = h.fetcher.calls();
        assert_eq!(calls.len(), 3);
        let first_gap = calls[1].1 - calls[0].1;
        let second_gap = calls[2].1 - calls[1].1;
        assert!(first_gap >= ms(1_000) && first_gap < ms(1_100), "{first_gap:?}");
        assert!(second_gap >= ms(3_000) && second_gap < ms(3_100), "{second_gap:?}");
        assert_eq!(*h.library.added.lock().unwrap(), vec!["v1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_exhaust_into_failed() {
        let h = harness(2);
        h.fetcher.script("v1", vec![Step::Fail(ZERO, 500); 6]);
        h.manager.queue_download(request("v1")).unwrap();

        wait_until(|| status(&h.manager, "v1") == Some(DownloadStatus::Failed)).await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        let item = h.manager.get("v1").unwrap();
        assert_eq!(item.status, DownloadStatus::Failed);
        assert_eq!(item.retry_count, 4);
        assert_eq!(item.error.as_deref(), Some("HTTP 500"));
        assert_eq!(h.fetcher.calls().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn not_found_is_not_retried() {
        let h = harness(2);
        h.fetcher.script("v1", vec![Step::Fail(ZERO, 404)]);
        h.manager.queue_download(request("v1")).unwrap();

        wait_until(|| status(&h.manager, "v1") == Some(DownloadStatus::Failed)).await;
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(h.fetcher.calls().len(), 1);
        assert_eq!(h.manager.get("v1").unwrap().retry_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn desktop_item_without_server_fails_immediately() {
        let h = harness_with(2, None, Arc::new(MemoryStore::new()), &[]);
        h.manager.queue_download(request("v1")).unwrap();

        let item = h.manager.get("v1").unwrap();
        assert_eq!(item.status, DownloadStatus::Failed);
        assert_eq!(item.error.as_deref(), Some("Not connected to server"));
        assert_eq!(item.retry_count, 0);
        assert!(h.fetcher.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_idempotent_and_cleans_up() {
        let h = harness(2);
        h.fetcher.script("v1", vec![Step::Hang]);
        let mut events = h.manager.subscribe();
        h.manager.queue_download(request("v1")).unwrap();

        let partial = h.fetcher.local_path("v1").unwrap();
        wait_until(|| partial.exists()).await;
        assert!(h.manager.is_downloading("v1"));

        h.manager.cancel("v1");
        h.manager.cancel("v1");

        assert!(h.manager.get("v1").is_none());
        assert!(!h.manager.is_downloading("v1"));
        assert!(!partial.exists());
        wait_until(|| h.fetcher.in_flight() == 0).await;

        let mut removed = 0;
        while let Ok(event) = events.try_recv() {
            if event == QueueEvent::Removed("v1".into()) {
                removed += 1;
            }
        }
        assert_eq!(removed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn late_write_after_cancel_is_removed() {
        let h = harness(2);
        h.fetcher.script("v1", vec![Step::WriteAfterCancel]);
        h.manager.queue_download(request("v1")).unwrap();
        wait_until(|| h.fetcher.in_flight() == 1).await;

        h.manager.cancel("v1");
        wait_until(|| h.fetcher.in_flight() == 0).await;

        assert!(h.manager.get("v1").is_none());
        assert!(!h.fetcher.local_path("v1").unwrap().exists());
        assert!(h.library.added.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_attempt_removes_partial_before_retry() {
        let h = harness(2);
        h.fetcher
            .script("v1", vec![Step::PartialThenFail(ms(50)), Step::Hang]);
        h.manager.queue_download(request("v1")).unwrap();

        let partial = h.fetcher.local_path("v1").unwrap();
        wait_until(|| partial.exists()).await;
        wait_until(|| {
            h.manager
                .get("v1")
                .is_some_and(|i| i.status == DownloadStatus::Queued && i.retry_count == 1)
        })
        .await;

        // Backoff is 1s; the retry has not started yet.
        assert_eq!(h.fetcher.calls().len(), 1);
        assert!(!partial.exists());

        wait_until(|| h.fetcher.calls().len() == 2).await;
        wait_until(|| partial.exists()).await;
        h.manager.cancel("v1");
        assert!(!partial.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_keeps_completed_history() {
        let h = harness(1);
        h.fetcher.script("done", vec![Step::Succeed(vec![(ms(10), 100)])]);
        h.fetcher.script("x", vec![Step::Hang]);
        h.fetcher.script("y", vec![Step::Hang]);

        h.manager.queue_download(request("done")).unwrap();
        wait_until(|| status(&h.manager, "done") == Some(DownloadStatus::Completed)).await;

        h.manager.queue_download(request("x")).unwrap();
        h.manager.queue_download(request("y")).unwrap();
        wait_until(|| h.manager.is_downloading("x")).await;
        assert_eq!(status(&h.manager, "y"), Some(DownloadStatus::Queued));

        h.manager.cancel_all();

        let ids: Vec<String> = h.manager.list().into_iter().map(|i| i.video_id).collect();
        assert_eq!(ids, vec!["done".to_string()]);
        assert_eq!(h.manager.active_count(), 0);
        wait_until(|| h.fetcher.in_flight() == 0).await;
        assert_eq!(h.fetcher.call_ids(), vec!["done", "x"]);
    }

    #[tokio::test(start_paused = true)]
    async fn progress_is_throttled_but_completion_flushes() {
        let h = harness(2);
        h.fetcher.script(
            "v1",
            vec![Step::Succeed(vec![
                (ms(10), 10),
                (ZERO, 20),
                (ms(300), 30),
                (ZERO, 100),
            ])],
        );
        let mut events = h.manager.subscribe();
        h.manager.queue_download(request("v1")).unwrap();
        wait_until(|| status(&h.manager, "v1") == Some(DownloadStatus::Completed)).await;

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let QueueEvent::Updated(item) = event {
                if item.status == DownloadStatus::Downloading {
                    seen.push(item.progress);
                }
            }
        }
        assert_eq!(seen, vec![0, 10, 30, 100]);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_demotes_interrupted_download() {
        let store = Arc::new(MemoryStore::new());
        let mut item = QueueItem::new(request("v1"), 1);
        item.status = DownloadStatus::Downloading;
        item.progress = 40;
        item.retry_count = 1;
        item.started_at = Some(2);
        store
            .set(
                QUEUE_KEY,
                &serde_json::json!({ "queue": [item] }).to_string(),
            )
            .unwrap();

        let h = harness_with(2, Some("http://desk:8765"), store.clone(), &[]);
        wait_until(|| status(&h.manager, "v1") == Some(DownloadStatus::Completed)).await;

        assert_eq!(h.fetcher.calls().len(), 1);
        assert_eq!(h.manager.get("v1").unwrap().retry_count, 1);
        let persisted = store.get(QUEUE_KEY).unwrap().unwrap();
        assert!(persisted.contains("\"completed\""));
    }

    #[tokio::test(start_paused = true)]
    async fn manual_retry_requeues_failed_item() {
        let h = harness(2);
        h.fetcher.script("v1", vec![Step::Fail(ZERO, 404)]);
        h.manager.queue_download(request("v1")).unwrap();
        wait_until(|| status(&h.manager, "v1") == Some(DownloadStatus::Failed)).await;

        let item = h.manager.retry("v1").unwrap();
        assert!(item.error.is_none());
        wait_until(|| status(&h.manager, "v1") == Some(DownloadStatus::Completed)).await;
        assert_eq!(h.fetcher.calls().len(), 2);

        assert!(matches!(
            h.manager.retry("missing"),
            Err(DownloadError::UnknownVideo(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn clear_removes_only_matching_status() {
        let h = harness(2);
        h.fetcher.script("bad", vec![Step::Fail(ZERO, 404)]);
        h.manager.queue_download(request("good")).unwrap();
        h.manager.queue_download(request("bad")).unwrap();
        wait_until(|| {
            status(&h.manager, "good") == Some(DownloadStatus::Completed)
                && status(&h.manager, "bad") == Some(DownloadStatus::Failed)
        })
        .await;

        h.manager.clear_failed();
        assert!(h.manager.get("bad").is_none());
        h.manager.clear_completed();
        assert!(h.manager.list().is_empty());
    }
}
