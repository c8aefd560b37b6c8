//! Bounded in-memory ring of user-facing log records.
//!
//! Fed by the event bus; the oldest entry is dropped once the ring holds
//! 500. Progress-type events are never recorded.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::error;

use crate::domain::NotificationEvent;

const RING_CAPACITY: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub category: String,
    pub message: String,
    pub details: Option<String>,
}

struct RingState {
    entries: VecDeque<LogEntry>,
    next_id: u64,
}

pub struct LogRing {
    state: RwLock<RingState>,
}

impl Default for LogRing {
    fn default() -> Self {
        Self::new()
    }
}

impl LogRing {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RingState {
                entries: VecDeque::with_capacity(RING_CAPACITY),
                next_id: 1,
            }),
        }
    }

    pub fn push(&self, level: LogLevel, category: &str, message: &str, details: Option<String>) {
        let mut state = self.state.write().unwrap();
        if state.entries.len() == RING_CAPACITY {
            state.entries.pop_front();
        }
        let id = state.next_id;
        state.next_id += 1;
        state.entries.push_back(LogEntry {
            id,
            timestamp: Utc::now(),
            level,
            category: category.to_string(),
            message: message.to_string(),
            details,
        });
    }

    /// Entries oldest-first, optionally filtered by level and category.
    #[must_use]
    pub fn entries(&self, level: Option<LogLevel>, category: Option<&str>) -> Vec<LogEntry> {
        self.state
            .read()
            .unwrap()
            .entries
            .iter()
            .filter(|e| level.is_none_or(|l| e.level == l))
            .filter(|e| category.is_none_or(|c| e.category == c))
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().unwrap().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribes to the event bus and records everything worth keeping.
    pub fn start_listener(self: Arc<Self>, events: &broadcast::Sender<NotificationEvent>) {
        let mut rx = events.subscribe();
        let ring = self;

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => ring.record(&event),
                    Err(broadcast::error::RecvError::Lagged(count)) => {
                        error!(count, "Log ring listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    fn record(&self, event: &NotificationEvent) {
        let (level, category, message) = match event {
            NotificationEvent::SyncStarted => {
                (LogLevel::Info, "metadata", "Metadata sync started".to_string())
            }
            NotificationEvent::SyncFinished { series, seasons } => (
                LogLevel::Info,
                "metadata",
                format!("Metadata sync finished: {series} series, {seasons} seasons"),
            ),
            NotificationEvent::SeriesSynced { title, .. } => {
                (LogLevel::Info, "metadata", format!("Synced series: {title}"))
            }
            NotificationEvent::MatchNotFound {
                title,
                season_number,
            } => (
                LogLevel::Warn,
                "metadata",
                format!("No source-site match for {title} season {season_number}"),
            ),
            NotificationEvent::WantedCheckStarted => (
                LogLevel::Info,
                "wanted",
                "Wanted-episode check started".to_string(),
            ),
            NotificationEvent::WantedCheckFinished { scanned, enqueued } => (
                LogLevel::Info,
                "wanted",
                format!("Wanted-episode check finished: {scanned} scanned, {enqueued} queued"),
            ),
            NotificationEvent::DownloadQueued { title } => {
                (LogLevel::Info, "download", format!("Queued: {title}"))
            }
            NotificationEvent::DownloadStarted { title } => {
                (LogLevel::Info, "download", format!("Downloading: {title}"))
            }
            NotificationEvent::DownloadSuccess {
                series_title,
                season_number,
                episode_number,
            } => (
                LogLevel::Info,
                "download",
                format!(
                    "Downloaded: {}",
                    NotificationEvent::episode_label(series_title, *season_number, *episode_number)
                ),
            ),
            NotificationEvent::DownloadError {
                series_title,
                season_number,
                episode_number,
                error,
            } => (
                LogLevel::Error,
                "download",
                format!(
                    "Download failed: {}: {error}",
                    NotificationEvent::episode_label(series_title, *season_number, *episode_number)
                ),
            ),
            NotificationEvent::Info { message } => {
                (LogLevel::Info, "system", message.clone())
            }
            NotificationEvent::Error { message } => {
                (LogLevel::Error, "system", message.clone())
            }
            // Transient ticks; keeping them would flush real entries out.
            NotificationEvent::DownloadProgress { .. } => return,
        };

        let details = serde_json::to_string(event).ok();
        self.push(level, category, &message, details);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_is_bounded_and_fifo() {
        let ring = LogRing::new();
        for i in 0..RING_CAPACITY + 20 {
            ring.push(LogLevel::Info, "test", &format!("entry {i}"), None);
        }

        let entries = ring.entries(None, None);
        assert_eq!(entries.len(), RING_CAPACITY);
        // the 20 oldest entries were dropped
        assert_eq!(entries[0].message, "entry 20");
        assert_eq!(entries.last().unwrap().message, format!("entry {}", RING_CAPACITY + 19));
    }

    #[test]
    fn entries_filter_by_level_and_category() {
        let ring = LogRing::new();
        ring.push(LogLevel::Info, "download", "a", None);
        ring.push(LogLevel::Error, "download", "b", None);
        ring.push(LogLevel::Error, "metadata", "c", None);

        assert_eq!(ring.entries(Some(LogLevel::Error), None).len(), 2);
        assert_eq!(ring.entries(None, Some("download")).len(), 2);
        assert_eq!(
            ring.entries(Some(LogLevel::Error), Some("download"))
                .len(),
            1
        );
    }

    #[test]
    fn progress_events_are_not_recorded() {
        let ring = LogRing::new();
        ring.record(&NotificationEvent::DownloadProgress {
            id: "x".to_string(),
            progress: 50.0,
            speed: None,
        });
        assert!(ring.is_empty());

        ring.record(&NotificationEvent::DownloadStarted {
            title: "Show - S01E01".to_string(),
        });
        assert_eq!(ring.len(), 1);
    }
}
