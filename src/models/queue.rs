use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// One entry in the in-memory download queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueItem {
    pub id: String,
    pub series_id: i32,
    pub season_id: i32,
    /// The library manager's episode id; used for duplicate suppression.
    pub episode_id: i32,
    pub series_title: String,
    pub season_number: i32,
    pub episode_number: i32,
    pub episode_title: Option<String>,
    pub download_url: String,
    pub status: QueueStatus,
    /// Percentage in `[0, 100]`, non-decreasing.
    pub progress: f64,
    /// Aggregate bytes per second across all range workers.
    pub download_speed: Option<u64>,
    pub added_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
}

impl QueueStatus {
    /// Completed and failed items never transition again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Everything needed to enqueue one episode download.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub series_id: i32,
    pub season_id: i32,
    pub episode_id: i32,
    pub series_title: String,
    pub season_number: i32,
    pub episode_number: i32,
    pub episode_title: Option<String>,
    pub download_url: String,
}

/// Point-in-time view of the queue plus its effective configuration.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub items: Vec<QueueItem>,
    pub max_workers: usize,
    pub queue_length: usize,
    pub active_downloads: usize,
}
