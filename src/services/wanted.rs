//! The `fetch_wanted` task: turns the library manager's missing-episode
//! list into queue entries.

use anyhow::Result;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::clients::animeworld::AnimeWorldClient;
use crate::clients::sonarr::{SonarrClient, WantedRecord};
use crate::db::Store;
use crate::domain::NotificationEvent;
use crate::downloads::DownloadQueue;
use crate::models::queue::EnqueueRequest;
use crate::models::series::Series;
use crate::services::metadata::{MetadataService, series_passes_filters};
use crate::settings::SettingsService;

const PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Copy, Default)]
pub struct WantedStats {
    pub scanned: usize,
    pub enqueued: usize,
    pub skipped: usize,
}

pub struct WantedService {
    store: Store,
    settings: Arc<SettingsService>,
    sonarr: Arc<SonarrClient>,
    animeworld: Arc<AnimeWorldClient>,
    metadata: Arc<MetadataService>,
    queue: DownloadQueue,
    events: broadcast::Sender<NotificationEvent>,
}

impl WantedService {
    #[must_use]
    pub const fn new(
        store: Store,
        settings: Arc<SettingsService>,
        sonarr: Arc<SonarrClient>,
        animeworld: Arc<AnimeWorldClient>,
        metadata: Arc<MetadataService>,
        queue: DownloadQueue,
        events: broadcast::Sender<NotificationEvent>,
    ) -> Self {
        Self {
            store,
            settings,
            sonarr,
            animeworld,
            metadata,
            queue,
            events,
        }
    }

    /// Pages through wanted-missing (air date ascending) and enqueues every
    /// episode it can resolve to a download URL. Individual records fail
    /// soft; only a missing configuration or an unreachable backend aborts.
    pub async fn fetch_wanted(&self) -> Result<WantedStats> {
        let _ = self.events.send(NotificationEvent::WantedCheckStarted);

        let anime_only = self.settings.anime_only().await?;
        let tags_mode = self.settings.tags_mode().await?;
        let tags = self.settings.tags().await?;

        let mut stats = WantedStats::default();
        // Series synced during this run; avoids re-syncing a series that has
        // many wanted episodes.
        let mut synced: HashSet<i32> = HashSet::new();
        let mut page = 1u32;

        loop {
            let batch = self.sonarr.get_wanted_missing(PAGE_SIZE, page).await?;
            if batch.records.is_empty() {
                break;
            }

            for record in &batch.records {
                stats.scanned += 1;

                let Some(remote_series) = &record.series else {
                    debug!(episode_id = record.episode.id, "Wanted record has no series");
                    continue;
                };
                if !series_passes_filters(remote_series, anime_only, tags_mode, &tags) {
                    continue;
                }

                match self.process_record(record, &mut synced).await {
                    Ok(true) => stats.enqueued += 1,
                    Ok(false) => stats.skipped += 1,
                    Err(e) => {
                        stats.skipped += 1;
                        warn!(
                            title = %remote_series.title,
                            episode = record.episode.episode_number,
                            error = %e,
                            "Wanted record failed"
                        );
                    }
                }
            }

            if u64::from(page) * u64::from(PAGE_SIZE) >= batch.total_records {
                break;
            }
            page += 1;
        }

        info!(
            scanned = stats.scanned,
            enqueued = stats.enqueued,
            skipped = stats.skipped,
            "Wanted-episode check finished"
        );
        let _ = self.events.send(NotificationEvent::WantedCheckFinished {
            scanned: stats.scanned,
            enqueued: stats.enqueued,
        });
        Ok(stats)
    }

    /// Returns `Ok(true)` when the record was enqueued.
    async fn process_record(
        &self,
        record: &WantedRecord,
        synced: &mut HashSet<i32>,
    ) -> Result<bool> {
        let episode = &record.episode;
        let sonarr_id = episode.series_id;

        let series = self.ensure_local_series(sonarr_id, synced).await?;
        let Some(series) = series else {
            debug!(sonarr_id, "Series could not be synced locally, skipping");
            return Ok(false);
        };
        if series.deleted {
            return Ok(false);
        }

        let season_number = if series.absolute { 1 } else { episode.season_number };
        let Some(season) = self.store.find_season(series.id, season_number).await? else {
            debug!(
                title = %series.title,
                season = season_number,
                "No local season record, skipping"
            );
            return Ok(false);
        };
        if season.deleted {
            return Ok(false);
        }

        // Already on its way down.
        if self.queue.has_active(episode.id) {
            return Ok(false);
        }

        let lookup_number = if series.absolute {
            match episode.absolute_episode_number {
                Some(n) if n > 0 => n,
                _ => {
                    warn!(
                        title = %series.title,
                        episode = episode.episode_number,
                        "Absolute series without absolute episode number, skipping"
                    );
                    return Ok(false);
                }
            }
        } else {
            episode.episode_number
        };

        if season.download_urls.is_empty() {
            debug!(
                title = %series.title,
                season = season_number,
                "Season has no source-site identifiers yet"
            );
            return Ok(false);
        }

        let link = self
            .animeworld
            .find_episode_download_link(&season.download_urls, lookup_number as u32)
            .await?;
        let Some(download_url) = link else {
            warn!(
                title = %series.title,
                episode = lookup_number,
                "No download link on the source site yet"
            );
            return Ok(false);
        };

        self.queue
            .enqueue(EnqueueRequest {
                series_id: series.id,
                season_id: season.id,
                episode_id: episode.id,
                series_title: series.title.clone(),
                season_number: episode.season_number,
                episode_number: episode.episode_number,
                episode_title: episode.title.clone(),
                download_url,
            })
            .await?;
        Ok(true)
    }

    /// Fetches the local series, running a one-shot sync the first time an
    /// unknown series id shows up in this run.
    async fn ensure_local_series(
        &self,
        sonarr_id: i32,
        synced: &mut HashSet<i32>,
    ) -> Result<Option<Series>> {
        if let Some(series) = self.store.get_series_by_sonarr_id(sonarr_id).await? {
            return Ok(Some(series));
        }
        if !synced.insert(sonarr_id) {
            return Ok(None);
        }

        info!(sonarr_id, "Unknown series in wanted list, syncing it now");
        self.metadata.sync_series_by_sonarr_id(sonarr_id, false).await
    }
}
