//! The in-memory download queue.
//!
//! Holds at most `concurrent_downloads` items in `downloading` at any time;
//! starting a download is launch-and-forget, and every state change pumps
//! the queue forward. A single `processing` flag keeps slot-filling serial.

use anyhow::{Result, bail};
use chrono::Utc;
use reqwest::Client;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{CancelSet, DownloadError, transfer};
use crate::domain::NotificationEvent;
use crate::models::queue::{EnqueueRequest, QueueItem, QueueSnapshot, QueueStatus};
use crate::services::import::ImportService;
use crate::settings::SettingsService;

struct QueueState {
    items: Vec<QueueItem>,
    /// Guards slot-filling so queue advancement stays serial.
    processing: bool,
}

struct QueueInner {
    state: Mutex<QueueState>,
    cancel: CancelSet,
    settings: Arc<SettingsService>,
    importer: Arc<ImportService>,
    events: broadcast::Sender<NotificationEvent>,
    client: Client,
    tmp_root: PathBuf,
}

#[derive(Clone)]
pub struct DownloadQueue {
    inner: Arc<QueueInner>,
}

impl DownloadQueue {
    #[must_use]
    pub fn new(
        settings: Arc<SettingsService>,
        importer: Arc<ImportService>,
        events: broadcast::Sender<NotificationEvent>,
        tmp_root: PathBuf,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    items: Vec::new(),
                    processing: false,
                }),
                cancel: CancelSet::new(),
                settings,
                importer,
                events,
                // Chunk reads are unbounded streams; only connecting is bounded.
                client: Client::builder()
                    .connect_timeout(Duration::from_secs(10))
                    .user_agent(concat!("Animarr/", env!("CARGO_PKG_VERSION")))
                    .build()
                    .unwrap_or_else(|_| Client::new()),
                tmp_root,
            }),
        }
    }

    fn emit(&self, event: NotificationEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Adds an episode to the queue. Rejected when a non-terminal item for
    /// the same (series, season, episode) already exists.
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<String> {
        let item = {
            let mut state = self.inner.state.lock().unwrap();

            let duplicate = state.items.iter().any(|i| {
                !i.status.is_terminal()
                    && i.series_id == request.series_id
                    && i.season_id == request.season_id
                    && i.episode_id == request.episode_id
            });
            if duplicate {
                bail!(
                    "episode {} of series {} is already queued",
                    request.episode_number,
                    request.series_title
                );
            }

            let item = QueueItem {
                id: Uuid::new_v4().to_string(),
                series_id: request.series_id,
                season_id: request.season_id,
                episode_id: request.episode_id,
                series_title: request.series_title,
                season_number: request.season_number,
                episode_number: request.episode_number,
                episode_title: request.episode_title,
                download_url: request.download_url,
                status: QueueStatus::Pending,
                progress: 0.0,
                download_speed: None,
                added_at: Utc::now(),
                started_at: None,
                completed_at: None,
                error: None,
            };
            state.items.push(item.clone());
            item
        };

        info!(
            id = %item.id,
            title = %item.series_title,
            episode = item.episode_number,
            "Queued download"
        );
        self.emit(NotificationEvent::DownloadQueued {
            title: NotificationEvent::episode_label(
                &item.series_title,
                item.season_number,
                item.episode_number,
            ),
        });

        self.pump().await;
        Ok(item.id)
    }

    /// Whether a non-terminal item exists for the given external episode id.
    #[must_use]
    pub fn has_active(&self, episode_id: i32) -> bool {
        self.inner
            .state
            .lock()
            .unwrap()
            .items
            .iter()
            .any(|i| i.episode_id == episode_id && !i.status.is_terminal())
    }

    /// Removes a pending item from the queue.
    pub fn remove(&self, id: &str) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        let Some(index) = state.items.iter().position(|i| i.id == id) else {
            bail!("queue item {id} not found");
        };
        if state.items[index].status != QueueStatus::Pending {
            bail!("only pending items can be removed");
        }
        state.items.remove(index);
        Ok(())
    }

    /// Cancels a downloading item: signals the transfer, marks the item
    /// failed, removes its scratch directory and drives the queue forward.
    pub async fn cancel(&self, id: &str) -> Result<()> {
        let item = {
            let mut state = self.inner.state.lock().unwrap();
            let Some(item) = state.items.iter_mut().find(|i| i.id == id) else {
                bail!("queue item {id} not found");
            };
            if item.status != QueueStatus::Downloading {
                bail!("only downloading items can be cancelled");
            }

            self.inner.cancel.insert(id);
            item.status = QueueStatus::Failed;
            item.error = Some(DownloadError::Cancelled.to_string());
            item.completed_at = Some(Utc::now());
            item.download_speed = None;
            item.clone()
        };

        info!(id, title = %item.series_title, "Download cancelled");

        tokio::fs::remove_dir_all(self.inner.tmp_root.join(id))
            .await
            .ok();

        self.emit(NotificationEvent::DownloadError {
            series_title: item.series_title.clone(),
            season_number: item.season_number,
            episode_number: item.episode_number,
            error: DownloadError::Cancelled.to_string(),
        });

        self.pump().await;
        Ok(())
    }

    /// Progress is monotonic: late or out-of-order updates never move it
    /// backwards.
    pub fn progress_update(&self, id: &str, percent: f64, speed: Option<u64>) {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(item) = state.items.iter_mut().find(|i| i.id == id)
            && item.status == QueueStatus::Downloading
        {
            item.progress = item.progress.max(percent.clamp(0.0, 100.0));
            item.download_speed = speed;
            let _ = self.inner.events.send(NotificationEvent::DownloadProgress {
                id: id.to_string(),
                progress: item.progress,
                speed,
            });
        }
    }

    fn complete(&self, id: &str) {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(item) = state.items.iter_mut().find(|i| i.id == id)
            && !item.status.is_terminal()
        {
            item.status = QueueStatus::Completed;
            item.progress = 100.0;
            item.download_speed = None;
            item.completed_at = Some(Utc::now());
        }
    }

    fn fail(&self, id: &str, error: &str) {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(item) = state.items.iter_mut().find(|i| i.id == id)
            && !item.status.is_terminal()
        {
            item.status = QueueStatus::Failed;
            item.error = Some(error.to_string());
            item.download_speed = None;
            item.completed_at = Some(Utc::now());
        }
    }

    pub async fn snapshot(&self) -> QueueSnapshot {
        let max_workers = self.inner.settings.download_max_workers().await.unwrap_or(3);
        let state = self.inner.state.lock().unwrap();
        QueueSnapshot {
            queue_length: state.items.len(),
            active_downloads: state
                .items
                .iter()
                .filter(|i| i.status == QueueStatus::Downloading)
                .count(),
            items: state.items.clone(),
            max_workers,
        }
    }

    /// Fills free downloading slots with pending items and launches their
    /// transfers. Never blocks on the transfers themselves.
    pub async fn pump(&self) {
        let max_active = self.inner.settings.concurrent_downloads().await.unwrap_or(2);
        let max_workers = self.inner.settings.download_max_workers().await.unwrap_or(3);

        let to_start = {
            let mut state = self.inner.state.lock().unwrap();
            if state.processing {
                return;
            }
            state.processing = true;

            let active = state
                .items
                .iter()
                .filter(|i| i.status == QueueStatus::Downloading)
                .count();
            let slots = max_active.saturating_sub(active);

            let mut to_start = Vec::new();
            for item in state
                .items
                .iter_mut()
                .filter(|i| i.status == QueueStatus::Pending)
                .take(slots)
            {
                item.status = QueueStatus::Downloading;
                item.started_at = Some(Utc::now());
                to_start.push(item.clone());
            }

            state.processing = false;
            to_start
        };

        for item in to_start {
            self.spawn_transfer(item, max_workers);
        }
    }

    fn spawn_transfer(&self, item: QueueItem, max_workers: usize) {
        let queue = self.clone();

        tokio::spawn(async move {
            let id = item.id.clone();
            let label = NotificationEvent::episode_label(
                &item.series_title,
                item.season_number,
                item.episode_number,
            );

            queue.emit(NotificationEvent::DownloadStarted {
                title: label.clone(),
            });

            let request = transfer::TransferRequest {
                id: id.clone(),
                url: item.download_url.clone(),
                tmp_dir: queue.inner.tmp_root.join(&id),
                output_dir: queue.inner.tmp_root.clone(),
                max_workers,
            };

            let progress = {
                let queue = queue.clone();
                let id = id.clone();
                Arc::new(move |percent: f64, speed: Option<u64>| {
                    queue.progress_update(&id, percent, speed);
                }) as transfer::ProgressFn
            };

            match transfer::execute(&queue.inner.client, &request, &queue.inner.cancel, progress)
                .await
            {
                Ok(output) => {
                    queue.complete(&id);
                    info!(id = %id, title = %label, "Download completed");
                    queue.inner.importer.finalize(&item, &output).await;
                }
                Err(DownloadError::Cancelled) => {
                    // cancel() already marked the item and cleaned up.
                    debug!(id = %id, "Transfer stopped after cancellation");
                }
                Err(_) if queue.inner.cancel.contains(&id) => {
                    // The abort races the in-flight request; whatever error
                    // surfaces, the user cancelled first.
                    debug!(id = %id, "Transfer aborted after cancellation");
                }
                Err(e) => {
                    warn!(id = %id, title = %label, error = %e, "Download failed");
                    queue.fail(&id, &e.to_string());
                    tokio::fs::remove_dir_all(queue.inner.tmp_root.join(&id))
                        .await
                        .ok();
                    queue.emit(NotificationEvent::DownloadError {
                        series_title: item.series_title.clone(),
                        season_number: item.season_number,
                        episode_number: item.episode_number,
                        error: e.to_string(),
                    });
                }
            }

            queue.inner.cancel.remove(&id);
            queue.pump().await;
        });
    }

    /// Removes chunk directories left behind by a previous run. Called once
    /// at daemon start, before any transfer is launched.
    pub async fn clean_orphaned(&self) {
        let Ok(mut entries) = tokio::fs::read_dir(&self.inner.tmp_root).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            if is_dir {
                debug!(path = %entry.path().display(), "Removing orphaned chunk directory");
                tokio::fs::remove_dir_all(entry.path()).await.ok();
            }
        }
    }
}
