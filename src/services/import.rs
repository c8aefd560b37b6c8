//! Hands a finished download over to the library manager.
//!
//! The transfer already succeeded when this runs, so nothing here can demote
//! the queue item: every failure is logged and the item stays `completed`.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::clients::sonarr::SonarrClient;
use crate::db::Store;
use crate::domain::NotificationEvent;
use crate::models::queue::QueueItem;
use crate::models::series::RootFolder;
use crate::settings::SettingsService;

/// How often and how long to poll for the freshly-imported episode file
/// before giving up on the rename.
const RENAME_POLL_ATTEMPTS: u32 = 5;
const RENAME_POLL_DELAY: Duration = Duration::from_secs(2);

pub struct ImportService {
    store: Store,
    settings: Arc<SettingsService>,
    sonarr: Arc<SonarrClient>,
    events: broadcast::Sender<NotificationEvent>,
}

impl ImportService {
    #[must_use]
    pub const fn new(
        store: Store,
        settings: Arc<SettingsService>,
        sonarr: Arc<SonarrClient>,
        events: broadcast::Sender<NotificationEvent>,
    ) -> Self {
        Self {
            store,
            settings,
            sonarr,
            events,
        }
    }

    /// Copies the merged file into the series folder, triggers a rescan and
    /// optionally a rename, then announces the success.
    pub async fn finalize(&self, item: &QueueItem, file: &Path) {
        match self.run(item, file).await {
            Ok(()) => {
                let _ = self.events.send(NotificationEvent::DownloadSuccess {
                    series_title: item.series_title.clone(),
                    season_number: item.season_number,
                    episode_number: item.episode_number,
                });
            }
            Err(e) => {
                warn!(
                    title = %item.series_title,
                    episode = item.episode_number,
                    error = %e,
                    "Finalization failed; downloaded file kept at {}",
                    file.display()
                );
                let _ = self.events.send(NotificationEvent::Error {
                    message: format!(
                        "Could not hand {} over to Sonarr: {e}",
                        NotificationEvent::episode_label(
                            &item.series_title,
                            item.season_number,
                            item.episode_number,
                        )
                    ),
                });
            }
        }
    }

    async fn run(&self, item: &QueueItem, file: &Path) -> Result<()> {
        let series = self
            .store
            .get_series(item.series_id)
            .await?
            .with_context(|| format!("series {} not in local store", item.series_id))?;

        let remote = self
            .sonarr
            .get_series_by_id(series.sonarr_id)
            .await?
            .with_context(|| format!("series {} unknown to Sonarr", series.sonarr_id))?;
        let remote_path = remote
            .path
            .with_context(|| format!("Sonarr has no folder for '{}'", remote.title))?;

        let folders = self.store.list_root_folders().await?;
        let (local_path, matched) = RootFolder::remap(&folders, &remote_path);
        if !matched {
            warn!(
                path = %remote_path,
                "No root-folder mapping matches; using the remote path as-is"
            );
        }

        tokio::fs::create_dir_all(&local_path)
            .await
            .with_context(|| format!("create series folder {local_path}"))?;

        let extension = file
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("mp4");
        let filename = sanitize_filename(&format!(
            "{} - S{:02}E{:02}.{}",
            item.series_title, item.season_number, item.episode_number, extension
        ));
        let destination = Path::new(&local_path).join(&filename);

        tokio::fs::copy(file, &destination)
            .await
            .with_context(|| format!("copy into {}", destination.display()))?;
        tokio::fs::remove_file(file).await.ok();

        info!(
            destination = %destination.display(),
            "Imported episode into library folder"
        );

        self.sonarr.rescan_series(series.sonarr_id).await?;

        if self.settings.auto_rename().await? {
            self.rename_when_indexed(item.episode_id).await;
        }

        Ok(())
    }

    /// The library manager needs a moment to index the new file; poll for
    /// its `episodeFileId` with a short delay instead of renaming blind.
    async fn rename_when_indexed(&self, episode_id: i32) {
        for _ in 0..RENAME_POLL_ATTEMPTS {
            tokio::time::sleep(RENAME_POLL_DELAY).await;

            let episode = match self.sonarr.get_episode(episode_id).await {
                Ok(Some(episode)) => episode,
                Ok(None) => {
                    warn!(episode_id, "Episode vanished from Sonarr before rename");
                    return;
                }
                Err(e) => {
                    warn!(episode_id, error = %e, "Could not fetch episode for rename");
                    return;
                }
            };

            if let Some(file_id) = episode.episode_file_id.filter(|id| *id > 0) {
                if let Err(e) = self.sonarr.rename_episode_file(file_id).await {
                    warn!(episode_id, file_id, error = %e, "Rename command failed");
                }
                return;
            }
        }

        warn!(episode_id, "Sonarr never indexed the new file; skipping rename");
    }
}

fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => ' ',
            c => c,
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_forbidden_filename_characters() {
        assert_eq!(
            sanitize_filename("Re:Zero - S01E05.mp4"),
            "Re Zero - S01E05.mp4"
        );
        assert_eq!(sanitize_filename("A/B\\C - S01E01.mkv"), "A B C - S01E01.mkv");
    }
}
