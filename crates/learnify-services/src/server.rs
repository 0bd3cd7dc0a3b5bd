//! Transfer server: serves the local share catalog to peers.
//!
//! One request per TCP connection, closed after the response. Anything the
//! server cannot make sense of is answered with a 404. Errors on an accepted
//! connection are logged and stay with that connection.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use learnify_core::catalog::VideoList;
use learnify_core::wire::{
    head_len, Request, ResponseHead, Route, Status, CONTENT_TYPE_JSON, CONTENT_TYPE_TEXT,
    CONTENT_TYPE_VIDEO, MAX_HEAD_BYTES,
};
use learnify_core::{PeerInfo, SharedVideo};

use crate::error::ServerError;
use crate::library::video_path;

type Catalog = Arc<Vec<SharedVideo>>;

/// State every connection handler reads.
struct Shared {
    device_name: String,
    videos_dir: PathBuf,
    request_timeout: Duration,
    catalog: RwLock<Catalog>,
}

impl Shared {
    fn snapshot(&self) -> Catalog {
        self.catalog
            .read()
            .map(|c| c.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    fn replace(&self, catalog: Vec<SharedVideo>) {
        let mut slot = self.catalog.write().unwrap_or_else(|e| e.into_inner());
        *slot = Arc::new(catalog);
    }
}

struct Running {
    port: u16,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct TransferServer {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl TransferServer {
    pub fn new(
        device_name: impl Into<String>,
        videos_dir: impl Into<PathBuf>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                device_name: device_name.into(),
                videos_dir: videos_dir.into(),
                request_timeout,
                catalog: RwLock::new(Arc::new(Vec::new())),
            }),
            running: Mutex::new(None),
        }
    }

    /// Bind on all interfaces and start serving `catalog`.
    ///
    /// Returns the port actually bound. When `port` is taken the OS picks
    /// one instead.
    pub async fn start(&self, catalog: Vec<SharedVideo>, port: u16) -> Result<u16, ServerError> {
        let mut running = self.running.lock().await;
        if let Some(r) = running.as_ref() {
            return Err(ServerError::AlreadyRunning(r.port));
        }

        let listener = match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            Ok(l) => l,
            Err(e) if e.kind() == io::ErrorKind::AddrInUse && port != 0 => {
                tracing::warn!(port, "transfer port busy, letting the OS pick one");
                TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))
                    .await
                    .map_err(|source| ServerError::Bind { port: 0, source })?
            }
            Err(source) => return Err(ServerError::Bind { port, source }),
        };
        let bound = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { port, source })?
            .port();

        let count = catalog.len();
        self.shared.replace(catalog);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(listener, self.shared.clone(), cancel.clone()));
        *running = Some(Running {
            port: bound,
            cancel,
            task,
        });

        tracing::info!(port = bound, videos = count, "transfer server listening");
        Ok(bound)
    }

    /// Close the listener and clear the catalog. Safe to call when stopped.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        running.cancel.cancel();
        let _ = running.task.await;
        self.shared.replace(Vec::new());
        tracing::info!(port = running.port, "transfer server stopped");
    }

    /// Swap the served catalog without touching the listener.
    pub fn update_catalog(&self, catalog: Vec<SharedVideo>) {
        tracing::debug!(videos = catalog.len(), "catalog updated");
        self.shared.replace(catalog);
    }

    pub fn video_count(&self) -> u32 {
        self.shared.snapshot().len() as u32
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub async fn port(&self) -> Option<u16> {
        self.running.lock().await.as_ref().map(|r| r.port)
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let shared = shared.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, &shared).await {
                            tracing::debug!(%addr, error = %e, "connection failed");
                        }
                    });
                }
                Err(e) => tracing::warn!(error = %e, "accept failed"),
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    shared: &Shared,
) -> io::Result<()> {
    let head = match timeout(shared.request_timeout, read_head(&mut stream)).await {
        Ok(head) => head?,
        Err(_) => {
            tracing::debug!(%addr, "request head timed out");
            return Ok(());
        }
    };
    if head.is_empty() {
        return Ok(());
    }

    let route = match Request::parse(&head) {
        Ok(request) => {
            tracing::debug!(%addr, method = %request.method, path = %request.path, "request");
            Route::resolve(&request)
        }
        Err(e) => {
            tracing::debug!(%addr, error = %e, "malformed request");
            Route::NotFound
        }
    };

    let catalog = shared.snapshot();
    match route {
        Route::Info => {
            let info = PeerInfo {
                name: shared.device_name.clone(),
                video_count: catalog.len() as u32,
            };
            respond_json(&mut stream, &info).await?;
        }
        Route::Videos => {
            let list = VideoList {
                videos: catalog.iter().map(SharedVideo::entry).collect(),
            };
            respond_json(&mut stream, &list).await?;
        }
        Route::VideoMeta(id) => match catalog.iter().find(|v| v.id() == id) {
            Some(video) => respond_json(&mut stream, &video.meta).await?,
            None => not_found(&mut stream, "Video not found").await?,
        },
        Route::VideoFile(id) => {
            let path = catalog
                .iter()
                .any(|v| v.id() == id)
                .then(|| video_path(&shared.videos_dir, &id))
                .flatten();
            let file = match path {
                Some(path) => File::open(path).await.ok(),
                None => None,
            };
            match file {
                Some(file) => send_file(&mut stream, file, addr, &id).await?,
                None => not_found(&mut stream, "Video file not found").await?,
            }
        }
        Route::NotFound => not_found(&mut stream, "Not found").await?,
    }

    stream.shutdown().await
}

/// Read until the end of the request head, EOF, or `MAX_HEAD_BYTES`.
/// Whatever arrived is returned; the parser decides if it is usable.
async fn read_head(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    while head_len(&buf).is_none() && buf.len() < MAX_HEAD_BYTES {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Ok(buf)
}

async fn respond(
    stream: &mut TcpStream,
    status: Status,
    content_type: &str,
    body: &[u8],
) -> io::Result<()> {
    let head = ResponseHead::new(status, content_type, body.len() as u64);
    stream.write_all(&head.encode()).await?;
    stream.write_all(body).await
}

async fn respond_json<T: serde::Serialize>(stream: &mut TcpStream, value: &T) -> io::Result<()> {
    match serde_json::to_vec(value) {
        Ok(body) => respond(stream, Status::Ok, CONTENT_TYPE_JSON, &body).await,
        Err(e) => {
            tracing::error!(error = %e, "failed to encode response");
            respond(
                stream,
                Status::InternalServerError,
                CONTENT_TYPE_TEXT,
                b"Internal server error",
            )
            .await
        }
    }
}

async fn not_found(stream: &mut TcpStream, message: &str) -> io::Result<()> {
    respond(stream, Status::NotFound, CONTENT_TYPE_TEXT, message.as_bytes()).await
}

async fn send_file(stream: &mut TcpStream, file: File, addr: SocketAddr, id: &str) -> io::Result<()> {
    let len = file.metadata().await?.len();
    let head = ResponseHead::new(Status::Ok, CONTENT_TYPE_VIDEO, len);
    stream.write_all(&head.encode()).await?;

    let sent = tokio::io::copy(&mut file.take(len), stream).await?;
    tracing::info!(%addr, video_id = %id, bytes = sent, "file sent");
    Ok(())
}
