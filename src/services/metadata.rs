//! Reconciles the library manager's series/season view into the local store
//! and resolves each season to its source-site identifiers.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::clients::sonarr::{SonarrClient, SonarrSeries};
use crate::db::{RootFolderUpsert, SeasonUpsert, SeriesUpsert, Store};
use crate::domain::NotificationEvent;
use crate::models::series::{AlternateTitle, SeasonStatus, Series, SeriesStatus};
use crate::services::matcher::{MatchWindow, SeasonMatcher};
use crate::settings::{SettingsService, TagEntry, TagsMode};

/// Posters younger than this are not re-downloaded.
const POSTER_MAX_AGE_HOURS: i64 = 48;

/// Episodes airing further out than this do not extend a season's window.
const AIR_DATE_HORIZON_DAYS: i64 = 14;

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncStats {
    pub series: usize,
    pub seasons: usize,
    pub deleted: usize,
}

/// Monitoring, series-type and tag-policy gate shared by the synchroniser
/// and the wanted-episode ingester.
#[must_use]
pub fn series_passes_filters(
    series: &SonarrSeries,
    anime_only: bool,
    tags_mode: TagsMode,
    tags: &[TagEntry],
) -> bool {
    if !series.monitored {
        return false;
    }
    if anime_only && !series.series_type.eq_ignore_ascii_case("anime") {
        return false;
    }

    let listed = series.tags.iter().any(|t| tags.iter().any(|e| e.value == *t));
    match tags_mode {
        TagsMode::Blacklist => !listed,
        // An empty whitelist means "no restriction", not "nothing".
        TagsMode::Whitelist => tags.is_empty() || listed,
    }
}

pub struct MetadataService {
    store: Store,
    settings: Arc<SettingsService>,
    sonarr: Arc<SonarrClient>,
    matcher: SeasonMatcher,
    events: broadcast::Sender<NotificationEvent>,
    http: Client,
    posters_dir: PathBuf,
}

impl MetadataService {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        store: Store,
        settings: Arc<SettingsService>,
        sonarr: Arc<SonarrClient>,
        matcher: SeasonMatcher,
        events: broadcast::Sender<NotificationEvent>,
        posters_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            settings,
            sonarr,
            matcher,
            events,
            http: Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .user_agent(concat!("Animarr/", env!("CARGO_PKG_VERSION")))
                .build()
                .unwrap_or_else(|_| Client::new()),
            posters_dir,
        }
    }

    fn emit(&self, event: NotificationEvent) {
        let _ = self.events.send(event);
    }

    /// The `update_metadata` task: upserts every eligible series and its
    /// seasons, soft-deletes what the library manager stopped reporting.
    /// Per-series failures never abort the sweep.
    pub async fn full_sync(&self) -> Result<SyncStats> {
        self.emit(NotificationEvent::SyncStarted);

        if let Err(e) = self.sync_root_folders().await {
            warn!(error = %e, "Root-folder sync failed");
        }

        let all_series = self.sonarr.get_all_series().await?;

        let anime_only = self.settings.anime_only().await?;
        let tags_mode = self.settings.tags_mode().await?;
        let tags = self.settings.tags().await?;

        let eligible: Vec<&SonarrSeries> = all_series
            .iter()
            .filter(|s| series_passes_filters(s, anime_only, tags_mode, &tags))
            .collect();

        info!(
            reported = all_series.len(),
            eligible = eligible.len(),
            "Running full metadata sync"
        );

        let mut stats = SyncStats::default();
        for remote in &eligible {
            match self.sync_series(remote, false).await {
                Ok(seasons) => {
                    stats.series += 1;
                    stats.seasons += seasons;
                }
                Err(e) => {
                    warn!(title = %remote.title, error = %e, "Series sync failed");
                }
            }
        }

        let keep: Vec<i32> = eligible.iter().map(|s| s.id).collect();
        stats.deleted = self.store.soft_delete_series_except(&keep).await?;
        if stats.deleted > 0 {
            info!(count = stats.deleted, "Soft-deleted series no longer reported");
        }

        self.emit(NotificationEvent::SyncFinished {
            series: stats.series,
            seasons: stats.seasons,
        });
        Ok(stats)
    }

    /// One-shot sync of a single series by its library-manager id; used when
    /// the wanted list surfaces a series the local store has never seen.
    pub async fn sync_series_by_sonarr_id(
        &self,
        sonarr_id: i32,
        force_refresh: bool,
    ) -> Result<Option<Series>> {
        let Some(remote) = self.sonarr.get_series_by_id(sonarr_id).await? else {
            return Ok(None);
        };
        self.sync_series(&remote, force_refresh).await?;
        self.store.get_series_by_sonarr_id(sonarr_id).await
    }

    /// Upserts the series record, refreshes the poster, reconciles its
    /// seasons and resolves identifiers for any season still missing them.
    /// Returns the number of seasons synced.
    pub async fn sync_series(
        &self,
        remote: &SonarrSeries,
        force_refresh: bool,
    ) -> Result<usize> {
        let upsert = SeriesUpsert {
            sonarr_id: remote.id,
            title: remote.title.clone(),
            description: remote.overview.clone(),
            status: SeriesStatus::from_sonarr(&remote.status),
            total_seasons: remote
                .seasons
                .iter()
                .filter(|s| s.season_number > 0)
                .count() as i32,
            year: remote.year,
            network: remote.network.clone(),
            genres: remote.genres.clone(),
            alternate_titles: remote
                .alternate_titles
                .iter()
                .map(|t| AlternateTitle {
                    title: t.title.clone(),
                    scene_season_number: t.scene_season_number,
                })
                .collect(),
            poster_url: remote.poster_url(),
        };
        let series = self.store.upsert_series(&upsert).await?;

        self.maybe_download_poster(&series).await;

        let seasons = if series.absolute {
            self.sync_absolute_season(&series, remote).await?
        } else {
            self.sync_regular_seasons(&series, remote).await?
        };

        self.match_unresolved_seasons(&series, force_refresh).await?;

        self.emit(NotificationEvent::SeriesSynced {
            series_id: series.id,
            title: series.title.clone(),
        });
        Ok(seasons)
    }

    pub async fn sync_root_folders(&self) -> Result<()> {
        let folders = self.sonarr.get_root_folders().await?;
        for folder in &folders {
            self.store
                .upsert_root_folder(&RootFolderUpsert {
                    sonarr_id: folder.id,
                    path: folder.path.clone(),
                    accessible: folder.accessible,
                    free_space: folder.free_space,
                    total_space: folder.total_space,
                })
                .await?;
        }
        let keep: Vec<i32> = folders.iter().map(|f| f.id).collect();
        self.store.remove_root_folders_except(&keep).await?;
        Ok(())
    }

    async fn sync_regular_seasons(
        &self,
        series: &Series,
        remote: &SonarrSeries,
    ) -> Result<usize> {
        let mut kept = Vec::new();
        let mut count = 0usize;

        for remote_season in &remote.seasons {
            if remote_season.season_number == 0 || !remote_season.monitored {
                continue;
            }

            let info = self
                .sonarr
                .get_season_air_date_info(remote.id, remote_season.season_number)
                .await?;
            if !info.has_valid_air_date {
                debug!(
                    title = %series.title,
                    season = remote_season.season_number,
                    "Season has no aired episode yet, skipping"
                );
                continue;
            }

            let (aired, downloaded) = remote_season
                .statistics
                .as_ref()
                .map(|s| (s.episode_count, s.episode_file_count))
                .unwrap_or((0, 0));
            let missing = (aired - downloaded).max(0);

            self.store
                .upsert_season(&SeasonUpsert {
                    series_id: series.id,
                    season_number: remote_season.season_number,
                    title: Some(format!("Season {}", remote_season.season_number)),
                    total_episodes: aired,
                    missing_episodes: missing,
                    status: SeasonStatus::derive(aired, downloaded),
                    release_date: info.start_date,
                })
                .await?;

            kept.push(remote_season.season_number);
            count += 1;
        }

        self.store
            .soft_delete_seasons_except(series.id, &kept)
            .await?;
        Ok(count)
    }

    /// An absolute-numbered series keeps exactly one local season whose
    /// totals are the series-level aired counts.
    async fn sync_absolute_season(
        &self,
        series: &Series,
        remote: &SonarrSeries,
    ) -> Result<usize> {
        let episodes = self.sonarr.get_series_episodes(remote.id).await?;
        let horizon = Utc::now() + Duration::days(AIR_DATE_HORIZON_DAYS);

        let aired: Vec<_> = episodes
            .iter()
            .filter(|e| e.season_number > 0)
            .filter(|e| e.air_date_utc.is_some_and(|d| d <= horizon))
            .collect();
        let downloaded = aired.iter().filter(|e| e.has_file).count() as i32;
        let aired_count = aired.len() as i32;
        let release_date = aired.iter().filter_map(|e| e.air_date_utc).min();

        self.store
            .upsert_season(&SeasonUpsert {
                series_id: series.id,
                season_number: 1,
                title: Some(series.title.clone()),
                total_episodes: aired_count,
                missing_episodes: (aired_count - downloaded).max(0),
                status: SeasonStatus::derive(aired_count, downloaded),
                release_date,
            })
            .await?;

        self.store.soft_delete_seasons_except(series.id, &[1]).await?;
        Ok(1)
    }

    async fn match_unresolved_seasons(&self, series: &Series, force_refresh: bool) -> Result<()> {
        let language = match series.preferred_language {
            Some(language) => language,
            None => self.settings.preferred_language().await?,
        };

        for season in self.store.list_seasons(series.id).await? {
            if !season.download_urls.is_empty() && !force_refresh {
                continue;
            }

            let Some(window) = self.window_for(series, season.season_number).await? else {
                continue;
            };

            let mut identifiers = match self
                .matcher
                .resolve_season(series, season.season_number, &window, language)
                .await
            {
                Ok(identifiers) => identifiers,
                Err(e) => {
                    warn!(
                        title = %series.title,
                        season = season.season_number,
                        error = %e,
                        "Season matching failed"
                    );
                    Vec::new()
                }
            };

            if identifiers.is_empty() {
                identifiers = self
                    .matcher
                    .resolve_season_fallback(series, season.season_number)
                    .await
                    .unwrap_or_default();
            }

            if identifiers.is_empty() {
                warn!(
                    title = %series.title,
                    season = season.season_number,
                    "No source-site match; will retry on next sync"
                );
                self.emit(NotificationEvent::MatchNotFound {
                    title: series.title.clone(),
                    season_number: season.season_number,
                });
                continue;
            }

            info!(
                title = %series.title,
                season = season.season_number,
                identifiers = ?identifiers,
                "Season resolved"
            );
            self.store
                .set_season_download_urls(season.id, &identifiers)
                .await?;
        }

        Ok(())
    }

    async fn window_for(
        &self,
        series: &Series,
        season_number: i32,
    ) -> Result<Option<MatchWindow>> {
        if series.absolute {
            let episodes = self.sonarr.get_series_episodes(series.sonarr_id).await?;
            let horizon = Utc::now() + Duration::days(AIR_DATE_HORIZON_DAYS);
            let mut dates: Vec<DateTime<Utc>> = episodes
                .iter()
                .filter(|e| e.season_number > 0)
                .filter_map(|e| e.air_date_utc)
                .filter(|d| *d <= horizon)
                .collect();
            dates.sort_unstable();
            return Ok(match (dates.first(), dates.last()) {
                (Some(start), Some(end)) => Some(MatchWindow {
                    start: *start,
                    end: *end,
                }),
                _ => None,
            });
        }

        let info = self
            .sonarr
            .get_season_air_date_info(series.sonarr_id, season_number)
            .await?;
        Ok(match (info.start_date, info.end_date) {
            (Some(start), Some(end)) if info.has_valid_air_date => {
                Some(MatchWindow { start, end })
            }
            _ => None,
        })
    }

    async fn maybe_download_poster(&self, series: &Series) {
        let Some(url) = &series.poster_url else {
            return;
        };

        let fresh = series.poster_downloaded_at.is_some_and(|at| {
            Utc::now().signed_duration_since(at) < Duration::hours(POSTER_MAX_AGE_HOURS)
        });
        if fresh {
            return;
        }

        if let Err(e) = self.download_poster(series, url).await {
            warn!(title = %series.title, error = %e, "Poster download failed");
        }
    }

    async fn download_poster(&self, series: &Series, url: &str) -> Result<()> {
        let extension = url
            .split(['?', '#'])
            .next()
            .and_then(|p| p.rsplit('.').next())
            .filter(|e| e.len() <= 4 && e.chars().all(|c| c.is_ascii_alphanumeric()))
            .unwrap_or("jpg");
        let filename = format!("{}.{extension}", series.id);

        tokio::fs::create_dir_all(&self.posters_dir).await?;
        let path = self.posters_dir.join(&filename);

        let bytes = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        tokio::fs::write(&path, &bytes)
            .await
            .with_context(|| format!("write poster to {}", path.display()))?;

        self.store
            .update_series_poster(series.id, &filename, Utc::now())
            .await?;
        debug!(title = %series.title, file = %filename, "Poster downloaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sonarr_series(monitored: bool, series_type: &str, tags: Vec<i32>) -> SonarrSeries {
        SonarrSeries {
            id: 1,
            title: "Test".to_string(),
            alternate_titles: vec![],
            overview: None,
            status: "continuing".to_string(),
            year: Some(2025),
            network: None,
            genres: vec![],
            tags,
            series_type: series_type.to_string(),
            monitored,
            seasons: vec![],
            images: vec![],
            path: None,
        }
    }

    fn tag(value: i32) -> TagEntry {
        TagEntry {
            value,
            label: format!("tag-{value}"),
        }
    }

    #[test]
    fn filter_requires_monitored_and_anime_type() {
        let tags = vec![];
        assert!(series_passes_filters(
            &sonarr_series(true, "anime", vec![]),
            true,
            TagsMode::Blacklist,
            &tags
        ));
        assert!(!series_passes_filters(
            &sonarr_series(false, "anime", vec![]),
            true,
            TagsMode::Blacklist,
            &tags
        ));
        assert!(!series_passes_filters(
            &sonarr_series(true, "standard", vec![]),
            true,
            TagsMode::Blacklist,
            &tags
        ));
        // anime-only disabled admits other types
        assert!(series_passes_filters(
            &sonarr_series(true, "standard", vec![]),
            false,
            TagsMode::Blacklist,
            &tags
        ));
    }

    #[test]
    fn blacklist_excludes_listed_tags() {
        let tags = vec![tag(7)];
        assert!(!series_passes_filters(
            &sonarr_series(true, "anime", vec![7]),
            true,
            TagsMode::Blacklist,
            &tags
        ));
        assert!(series_passes_filters(
            &sonarr_series(true, "anime", vec![8]),
            true,
            TagsMode::Blacklist,
            &tags
        ));
    }

    #[test]
    fn whitelist_requires_listed_tag_unless_empty() {
        let tags = vec![tag(7)];
        assert!(series_passes_filters(
            &sonarr_series(true, "anime", vec![7]),
            true,
            TagsMode::Whitelist,
            &tags
        ));
        assert!(!series_passes_filters(
            &sonarr_series(true, "anime", vec![8]),
            true,
            TagsMode::Whitelist,
            &tags
        ));
        assert!(series_passes_filters(
            &sonarr_series(true, "anime", vec![8]),
            true,
            TagsMode::Whitelist,
            &[]
        ));
    }
}
