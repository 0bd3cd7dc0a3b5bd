use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use learnify_core::DownloadProgress;
use learnify_services::{ErrorKind, ServerError, TransferClient, TransferError};

use crate::*;

fn client(dir: &Path) -> TransferClient {
    TransferClient::new(dir, TIMEOUT)
}

#[tokio::test]
async fn info_and_listing_reflect_the_catalog() {
    let sharer = Sharer::start(&[("v1", Some(vec![1, 2, 3])), ("v2", None)])
        .await
        .unwrap();
    let local = tempfile::tempdir().unwrap();
    let client = client(local.path());

    let info = client.get_info(&sharer.peer()).await.unwrap();
    assert_eq!(info.name, "phone");
    assert_eq!(info.video_count, 2);

    let videos = client.get_videos(&sharer.peer()).await.unwrap();
    let ids: Vec<&str> = videos.iter().map(|v| v.id.as_str()).collect();
    assert_eq!(ids, ["v1", "v2"]);
    assert_eq!(videos[0].channel_title, "Open Courses");
    assert!(!videos[0].has_transcript);

    let meta = client.get_meta(&sharer.peer(), "v2").await.unwrap();
    assert_eq!(meta, crate::meta("v2"));

    sharer.server.stop().await;
}

#[tokio::test]
async fn binary_file_arrives_intact_with_progress() {
    let payload = binary_payload(300_000);
    let sharer = Sharer::start(&[("v1", Some(payload.clone()))]).await.unwrap();
    let local = tempfile::tempdir().unwrap();
    let client = client(local.path());

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let on_progress = move |p: DownloadProgress| sink.lock().unwrap().push(p);

    let fetched = client
        .download_file(&sharer.peer(), "v1", &on_progress, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(fetched.meta.id, "v1");
    assert_eq!(fetched.local_path, video_path(local.path(), "v1").unwrap());
    assert_eq!(std::fs::read(&fetched.local_path).unwrap(), payload);

    let seen = seen.lock().unwrap();
    let last = seen.last().unwrap();
    assert_eq!(last.bytes_downloaded, payload.len() as u64);
    assert_eq!(last.total_bytes, payload.len() as u64);
    assert!(seen.windows(2).all(|w| w[0].bytes_downloaded <= w[1].bytes_downloaded));

    sharer.server.stop().await;
}

#[tokio::test]
async fn missing_file_is_not_found() {
    let sharer = Sharer::start(&[("listed-only", None)]).await.unwrap();
    let local = tempfile::tempdir().unwrap();
    let client = client(local.path());

    let err = client
        .download_file(&sharer.peer(), "listed-only", &|_: DownloadProgress| {}, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = client.get_meta(&sharer.peer(), "nope").await.unwrap_err();
    assert!(matches!(err, TransferError::Status(404)));

    sharer.server.stop().await;
}

#[tokio::test]
async fn malformed_request_gets_404_and_listener_survives() {
    let sharer = Sharer::start(&[]).await.unwrap();

    let mut stream = TcpStream::connect(("127.0.0.1", sharer.port)).await.unwrap();
    stream.write_all(b"\x00\x01 not http\r\n\r\n").await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    assert!(response.starts_with(b"HTTP/1.1 404 Not Found\r\n"));

    // A client that connects and leaves without a word.
    drop(TcpStream::connect(("127.0.0.1", sharer.port)).await.unwrap());

    let local = tempfile::tempdir().unwrap();
    let info = client(local.path()).get_info(&sharer.peer()).await.unwrap();
    assert_eq!(info.video_count, 0);

    sharer.server.stop().await;
}

#[tokio::test]
async fn one_server_per_instance_and_hot_swap() {
    let sharer = Sharer::start(&[("v1", None)]).await.unwrap();

    let err = sharer.server.start(Vec::new(), 0).await.unwrap_err();
    assert!(matches!(err, ServerError::AlreadyRunning(port) if port == sharer.port));

    sharer.server.update_catalog(vec![shared("v1"), shared("v2"), shared("v3")]);
    let local = tempfile::tempdir().unwrap();
    let videos = client(local.path()).get_videos(&sharer.peer()).await.unwrap();
    assert_eq!(videos.len(), 3);

    sharer.server.stop().await;
    let err = client(local.path()).get_info(&sharer.peer()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unreachable);
}

#[tokio::test]
async fn ids_outside_the_videos_dir_are_refused() {
    let sharer = Sharer::start(&[("v1", Some(vec![1, 2, 3]))]).await.unwrap();
    let root = tempfile::tempdir().unwrap();
    let videos = root.path().join("videos");
    let client = client(&videos);
    let absolute = root.path().join("outside");

    for id in ["../outside", absolute.to_str().unwrap()] {
        let err = client
            .download_file(&sharer.peer(), id, &|_: DownloadProgress| {}, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidVideoId(_)), "{err:?}");
    }
    assert!(!root.path().join("outside.mp4").exists());
    assert!(!videos.exists());

    sharer.server.stop().await;
}
