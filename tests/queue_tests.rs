//! Queue state machine: bounded concurrency, duplicate rejection, removal
//! and cancellation.
//!
//! Transfers are pointed at a local TCP listener that accepts connections
//! and never answers, so items stay in `downloading` for as long as the
//! test needs them there.

use animarr::clients::sonarr::SonarrClient;
use animarr::db::Store;
use animarr::domain::NotificationEvent;
use animarr::downloads::DownloadQueue;
use animarr::models::queue::{EnqueueRequest, QueueStatus};
use animarr::services::ImportService;
use animarr::settings::SettingsService;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

async fn test_queue(
    tmp: &std::path::Path,
) -> (DownloadQueue, broadcast::Sender<NotificationEvent>) {
    let store = Store::with_pool_options("sqlite::memory:", 1, 1)
        .await
        .expect("in-memory store");

    let settings = Arc::new(SettingsService::new(store.clone()));
    settings.initialize().await.expect("seed settings");

    let (bus, _) = broadcast::channel(100);
    let sonarr = Arc::new(SonarrClient::new(settings.clone()));
    let importer = Arc::new(ImportService::new(
        store,
        settings.clone(),
        sonarr,
        bus.clone(),
    ));

    let queue = DownloadQueue::new(settings, importer, bus.clone(), tmp.to_path_buf());
    (queue, bus)
}

/// Accepts connections and keeps them open without ever responding.
async fn hanging_server() -> (String, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");

    let handle = tokio::spawn(async move {
        let mut sockets = Vec::new();
        loop {
            if let Ok((socket, _)) = listener.accept().await {
                sockets.push(socket);
            }
        }
    });

    (format!("http://{addr}/episode.mp4"), handle)
}

fn request(episode: i32, url: &str) -> EnqueueRequest {
    EnqueueRequest {
        series_id: 1,
        season_id: 1,
        episode_id: episode,
        series_title: "Test Show".to_string(),
        season_number: 1,
        episode_number: episode,
        episode_title: None,
        download_url: url.to_string(),
    }
}

#[tokio::test]
async fn concurrency_bound_duplicates_and_removal() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (queue, _bus) = test_queue(tmp.path()).await;
    let (url, server) = hanging_server().await;

    let _id1 = queue.enqueue(request(1, &url)).await.expect("enqueue 1");
    let _id2 = queue.enqueue(request(2, &url)).await.expect("enqueue 2");
    let id3 = queue.enqueue(request(3, &url)).await.expect("enqueue 3");

    // concurrent_downloads defaults to 2: two in flight, the third waits
    let snapshot = queue.snapshot().await;
    assert_eq!(snapshot.queue_length, 3);
    assert_eq!(snapshot.active_downloads, 2);
    let third = snapshot.items.iter().find(|i| i.id == id3).unwrap();
    assert_eq!(third.status, QueueStatus::Pending);

    // same (series, season, episode) with a non-terminal item is rejected
    assert!(queue.enqueue(request(1, &url)).await.is_err());

    assert!(queue.has_active(1));
    assert!(queue.has_active(3));
    assert!(!queue.has_active(99));

    // only pending items may be removed
    let downloading_id = snapshot
        .items
        .iter()
        .find(|i| i.status == QueueStatus::Downloading)
        .map(|i| i.id.clone())
        .unwrap();
    assert!(queue.remove(&downloading_id).is_err());
    queue.remove(&id3).expect("remove pending");
    assert_eq!(queue.snapshot().await.queue_length, 2);

    server.abort();
}

#[tokio::test]
async fn cancel_marks_failed_and_frees_a_slot() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (queue, bus) = test_queue(tmp.path()).await;
    let (url, server) = hanging_server().await;

    let id1 = queue.enqueue(request(1, &url)).await.expect("enqueue 1");
    let _id2 = queue.enqueue(request(2, &url)).await.expect("enqueue 2");

    let mut rx = bus.subscribe();
    queue.cancel(&id1).await.expect("cancel");

    let snapshot = queue.snapshot().await;
    let cancelled = snapshot.items.iter().find(|i| i.id == id1).unwrap();
    assert_eq!(cancelled.status, QueueStatus::Failed);
    assert_eq!(cancelled.error.as_deref(), Some("Download cancelled by user"));
    assert_eq!(snapshot.active_downloads, 1);

    // cancelling is terminal; a second cancel is an error
    assert!(queue.cancel(&id1).await.is_err());

    // the error event reached the bus for the notification fan-out
    let mut saw_error = false;
    while let Ok(Ok(event)) =
        tokio::time::timeout(Duration::from_millis(500), rx.recv()).await
    {
        if let NotificationEvent::DownloadError {
            episode_number,
            error,
            ..
        } = event
        {
            assert_eq!(episode_number, 1);
            assert_eq!(error, "Download cancelled by user");
            saw_error = true;
            break;
        }
    }
    assert!(saw_error, "expected a DownloadError event after cancel");

    // the freed slot is available for new work
    let id3 = queue.enqueue(request(3, &url)).await.expect("enqueue 3");
    let snapshot = queue.snapshot().await;
    let third = snapshot.items.iter().find(|i| i.id == id3).unwrap();
    assert_eq!(third.status, QueueStatus::Downloading);
    assert_eq!(snapshot.active_downloads, 2);

    // the external episode id can be re-queued once its item is terminal
    assert!(!queue.has_active(1));
    queue.enqueue(request(1, &url)).await.expect("re-enqueue after cancel");

    server.abort();
}
