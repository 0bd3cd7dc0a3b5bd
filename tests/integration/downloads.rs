use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::timeout;

use learnify_core::config::DownloadSettings;
use learnify_core::{DownloadStatus, NewDownload, Peer, QueueItem, QueueOrigin};
use learnify_services::{
    DesktopClient, DownloadManager, FsLibrary, MemoryStore, NetworkFetcher, QueueEvent,
    ServerConnection, TransferClient,
};

use crate::*;

struct Receiver {
    manager: DownloadManager,
    library: Arc<FsLibrary>,
    _dir: TempDir,
}

fn receiver() -> Receiver {
    let dir = tempfile::tempdir().unwrap();
    let library = Arc::new(FsLibrary::new(dir.path()).unwrap());
    let fetcher = NetworkFetcher::new(
        TransferClient::new(dir.path(), TIMEOUT),
        DesktopClient::new(dir.path(), TIMEOUT).unwrap(),
    );
    let manager = DownloadManager::new(
        DownloadSettings::default(),
        Arc::new(MemoryStore::default()),
        Arc::new(fetcher),
        library.clone(),
        Arc::new(ServerConnection::new()),
    );
    Receiver {
        manager,
        library,
        _dir: dir,
    }
}

fn from_peer(id: &str, sharer: &Sharer) -> NewDownload {
    peer_request(id, sharer.peer())
}

fn peer_request(id: &str, peer: Peer) -> NewDownload {
    NewDownload {
        video_id: id.into(),
        title: format!("Lecture {id}"),
        channel_title: "Open Courses".into(),
        duration: 1800,
        thumbnail_url: None,
        origin: QueueOrigin::Peer { peer },
    }
}

/// Wait for `id` to reach a terminal state.
async fn settled(events: &mut broadcast::Receiver<QueueEvent>, id: &str) -> QueueItem {
    timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(QueueEvent::Updated(item)) = events.recv().await {
                if item.video_id == id && item.status.is_terminal() {
                    return item;
                }
            }
        }
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn peer_download_lands_in_the_library() {
    let payload = binary_payload(200_000);
    let sharer = Sharer::start(&[("v1", Some(payload.clone()))]).await.unwrap();
    let rx = receiver();
    let mut events = rx.manager.subscribe();

    rx.manager.queue_download(from_peer("v1", &sharer)).unwrap();
    let item = settled(&mut events, "v1").await;

    assert_eq!(item.status, DownloadStatus::Completed);
    assert_eq!(item.progress, 100);
    assert_eq!(item.bytes_downloaded, payload.len() as u64);

    let catalog = rx.library.load_catalog().unwrap();
    assert_eq!(catalog, vec![shared("v1")]);
    assert_eq!(
        std::fs::read(video_path(rx.library.videos_dir(), "v1").unwrap()).unwrap(),
        payload
    );

    sharer.server.stop().await;
}

#[tokio::test]
async fn missing_peer_file_fails_without_retry() {
    let sharer = Sharer::start(&[("gone", None)]).await.unwrap();
    let rx = receiver();
    let mut events = rx.manager.subscribe();

    rx.manager.queue_download(from_peer("gone", &sharer)).unwrap();
    let item = settled(&mut events, "gone").await;

    assert_eq!(item.status, DownloadStatus::Failed);
    assert!(item.error.unwrap_or_default().contains("404"));
    assert!(!video_path(rx.library.videos_dir(), "gone").unwrap().exists());

    sharer.server.stop().await;
}

#[tokio::test]
async fn queued_videos_share_two_slots() {
    let sharer = Sharer::start(&[
        ("a", Some(binary_payload(50_000))),
        ("b", Some(binary_payload(70_000))),
        ("c", Some(binary_payload(90_000))),
    ])
    .await
    .unwrap();
    let rx = receiver();
    let mut events = rx.manager.subscribe();

    for id in ["a", "b", "c"] {
        rx.manager.queue_download(from_peer(id, &sharer)).unwrap();
    }
    assert!(rx.manager.active_count() <= 2);

    let mut done = Vec::new();
    while done.len() < 3 {
        let item = timeout(Duration::from_secs(10), events.recv())
            .await
            .unwrap()
            .unwrap();
        if let QueueEvent::Updated(item) = item {
            if item.status == DownloadStatus::Completed && !done.contains(&item.video_id) {
                done.push(item.video_id);
            }
        }
    }

    let ids: Vec<String> = rx
        .library
        .load_catalog()
        .unwrap()
        .iter()
        .map(|v| v.id().to_string())
        .collect();
    assert_eq!(ids, ["a", "b", "c"]);

    sharer.server.stop().await;
}

/// A peer that promises 1000 bytes of every file, sends 10, and hangs up.
async fn truncating_peer() -> Peer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let mut head = Vec::new();
            let mut buf = [0u8; 512];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => head.extend_from_slice(&buf[..n]),
                }
            }
            let _ = stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\n\r\n0123456789")
                .await;
        }
    });
    Peer {
        name: "flaky".into(),
        host: "127.0.0.1".into(),
        port,
        item_count: 1,
    }
}

#[tokio::test]
async fn truncated_transfer_leaves_no_partial_file() {
    let peer = truncating_peer().await;
    let rx = receiver();
    let mut events = rx.manager.subscribe();
    let partial = video_path(rx.library.videos_dir(), "v1").unwrap();

    rx.manager.queue_download(peer_request("v1", peer)).unwrap();

    let item = timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(QueueEvent::Updated(item)) = events.recv().await {
                if item.status == DownloadStatus::Queued && item.retry_count == 1 {
                    return item;
                }
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(item.video_id, "v1");
    assert!(!partial.exists());
    assert!(rx.library.load_catalog().unwrap().is_empty());

    rx.manager.cancel("v1");
}
