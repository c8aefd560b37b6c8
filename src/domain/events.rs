//! Process-wide events.
//!
//! Everything of note crosses the broadcast bus as one of these; the log
//! ring and the notification dispatcher are the standing subscribers.

use serde::Serialize;

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum NotificationEvent {
    SyncStarted,
    SyncFinished {
        series: usize,
        seasons: usize,
    },
    SeriesSynced {
        series_id: i32,
        title: String,
    },
    MatchNotFound {
        title: String,
        season_number: i32,
    },

    WantedCheckStarted,
    WantedCheckFinished {
        scanned: usize,
        enqueued: usize,
    },

    DownloadQueued {
        title: String,
    },
    DownloadStarted {
        title: String,
    },
    /// Progress ticks are transient; subscribers that persist events skip them.
    DownloadProgress {
        id: String,
        progress: f64,
        speed: Option<u64>,
    },
    DownloadSuccess {
        series_title: String,
        season_number: i32,
        episode_number: i32,
    },
    DownloadError {
        series_title: String,
        season_number: i32,
        episode_number: i32,
        error: String,
    },

    Info {
        message: String,
    },
    Error {
        message: String,
    },
}

impl NotificationEvent {
    /// Human-readable one-liner for an episode, `"Title - S01E05"`.
    #[must_use]
    pub fn episode_label(series_title: &str, season: i32, episode: i32) -> String {
        format!("{series_title} - S{season:02}E{episode:02}")
    }
}
