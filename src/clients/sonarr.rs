//! Typed client over the library manager's v3 REST API.
//!
//! Every call is gated on the shared health cell, which the 60 s prober
//! task keeps current; a failed probe makes all calls fail fast with
//! [`SonarrError::BackendUnavailable`] until the next successful probe.

use chrono::{DateTime, Utc};
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::settings::SettingsService;

/// How long cached episode lists and air-date windows stay fresh.
const CACHE_TTL: Duration = Duration::from_secs(300);

/// Episodes airing further out than this do not count as "has a valid air date".
const AIR_DATE_HORIZON_DAYS: i64 = 14;

#[derive(Debug, Error)]
pub enum SonarrError {
    #[error("Sonarr URL or API key is not configured")]
    ConfigMissing,
    #[error("Sonarr backend is unavailable")]
    BackendUnavailable,
    #[error("rate limited by Sonarr")]
    RateLimited,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("Sonarr returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct HealthState {
    pub healthy: bool,
    pub last_check: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SonarrSeries {
    pub id: i32,
    pub title: String,
    #[serde(default)]
    pub alternate_titles: Vec<SonarrAlternateTitle>,
    pub overview: Option<String>,
    #[serde(default)]
    pub status: String,
    pub year: Option<i32>,
    pub network: Option<String>,
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default)]
    pub tags: Vec<i32>,
    #[serde(default)]
    pub series_type: String,
    #[serde(default)]
    pub monitored: bool,
    #[serde(default)]
    pub seasons: Vec<SonarrSeasonInfo>,
    #[serde(default)]
    pub images: Vec<SonarrImage>,
    pub path: Option<String>,
}

impl SonarrSeries {
    /// The remote URL of the poster image, when the series has one.
    #[must_use]
    pub fn poster_url(&self) -> Option<String> {
        self.images
            .iter()
            .find(|i| i.cover_type.eq_ignore_ascii_case("poster"))
            .and_then(|i| i.remote_url.clone().or_else(|| i.url.clone()))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SonarrAlternateTitle {
    pub title: String,
    pub scene_season_number: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SonarrSeasonInfo {
    pub season_number: i32,
    #[serde(default)]
    pub monitored: bool,
    pub statistics: Option<SonarrSeasonStatistics>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SonarrSeasonStatistics {
    #[serde(default)]
    pub episode_count: i32,
    #[serde(default)]
    pub episode_file_count: i32,
    #[serde(default)]
    pub total_episode_count: i32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SonarrImage {
    #[serde(default)]
    pub cover_type: String,
    pub remote_url: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SonarrEpisode {
    pub id: i32,
    pub series_id: i32,
    pub season_number: i32,
    pub episode_number: i32,
    pub absolute_episode_number: Option<i32>,
    pub title: Option<String>,
    pub air_date_utc: Option<DateTime<Utc>>,
    #[serde(default)]
    pub has_file: bool,
    pub episode_file_id: Option<i64>,
    #[serde(default)]
    pub monitored: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WantedRecord {
    #[serde(flatten)]
    pub episode: SonarrEpisode,
    pub series: Option<SonarrSeries>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WantedPage {
    pub page: u32,
    pub page_size: u32,
    #[serde(default)]
    pub total_records: u64,
    #[serde(default)]
    pub records: Vec<WantedRecord>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SonarrRootFolder {
    pub id: i32,
    pub path: String,
    #[serde(default)]
    pub accessible: bool,
    pub free_space: Option<i64>,
    pub total_space: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SonarrTag {
    pub id: i32,
    pub label: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SonarrNotification {
    pub id: i32,
    pub name: String,
    #[serde(default)]
    pub implementation: String,
    #[serde(default)]
    pub on_download: bool,
    #[serde(default)]
    pub fields: Vec<NotificationField>,
}

/// Provider fields are heterogeneous per implementation; values are looked
/// up by name at dispatch time.
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationField {
    pub name: String,
    #[serde(default)]
    pub value: Option<Value>,
}

impl SonarrNotification {
    #[must_use]
    pub fn field_str(&self, name: &str) -> Option<String> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .and_then(|f| f.value.as_ref())
            .and_then(|v| match v {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
    }

    #[must_use]
    pub fn field_str_array(&self, name: &str) -> Vec<String> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .and_then(|f| f.value.as_ref())
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Season air-date window derived from episode air dates. An episode counts
/// only when its air date is at most two weeks in the future.
#[derive(Debug, Clone, Copy)]
pub struct SeasonAirDateInfo {
    pub has_valid_air_date: bool,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

struct CacheSlot<T> {
    fetched_at: Instant,
    value: T,
}

impl<T: Clone> CacheSlot<T> {
    fn fresh(&self) -> Option<T> {
        (self.fetched_at.elapsed() < CACHE_TTL).then(|| self.value.clone())
    }
}

pub struct SonarrClient {
    client: Client,
    settings: Arc<SettingsService>,
    health: RwLock<HealthState>,
    episodes_cache: RwLock<HashMap<i32, CacheSlot<Arc<Vec<SonarrEpisode>>>>>,
    air_date_cache: RwLock<HashMap<(i32, i32), CacheSlot<SeasonAirDateInfo>>>,
}

impl SonarrClient {
    #[must_use]
    pub fn new(settings: Arc<SettingsService>) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .user_agent(concat!("Animarr/", env!("CARGO_PKG_VERSION")))
                .build()
                .unwrap_or_else(|_| Client::new()),
            settings,
            health: RwLock::new(HealthState {
                healthy: false,
                last_check: None,
            }),
            episodes_cache: RwLock::new(HashMap::new()),
            air_date_cache: RwLock::new(HashMap::new()),
        }
    }

    async fn credentials(&self) -> Result<(String, String), SonarrError> {
        let url = self.settings.sonarr_url().await?;
        let token = self.settings.sonarr_token().await?;
        match (url, token) {
            (Some(url), Some(token)) => Ok((url, token)),
            _ => Err(SonarrError::ConfigMissing),
        }
    }

    pub async fn health(&self) -> HealthState {
        *self.health.read().await
    }

    /// Forgets the current health verdict; the caller is expected to follow
    /// up with [`probe`](Self::probe).
    pub async fn reset_health(&self) {
        let mut health = self.health.write().await;
        health.healthy = false;
        health.last_check = None;
    }

    /// Hits `system/status` and records the verdict. Returns the new state.
    pub async fn probe(&self) -> bool {
        let healthy = match self.credentials().await {
            Ok((base, token)) => {
                let url = format!("{base}/api/v3/system/status");
                match self
                    .client
                    .get(&url)
                    .header("X-Api-Key", &token)
                    .send()
                    .await
                {
                    Ok(resp) => resp.status().is_success(),
                    Err(e) => {
                        debug!(error = %e, "Sonarr health probe failed");
                        false
                    }
                }
            }
            Err(_) => false,
        };

        let mut health = self.health.write().await;
        health.healthy = healthy;
        health.last_check = Some(Utc::now());
        healthy
    }

    async fn ensure_healthy(&self) -> Result<(), SonarrError> {
        if self.health.read().await.healthy {
            Ok(())
        } else {
            Err(SonarrError::BackendUnavailable)
        }
    }

    /// One request: network errors retried once, a 429 honored via
    /// `Retry-After` and retried once, any other 4xx surfaced.
    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> Result<T, SonarrError> {
        self.ensure_healthy().await?;
        let (base, token) = self.credentials().await?;
        let url = format!("{base}/api/v3/{path}");

        let mut network_retries = 1u8;
        let mut rate_retries = 1u8;

        loop {
            let mut request = self
                .client
                .request(method.clone(), &url)
                .header("X-Api-Key", &token)
                .query(query);
            if let Some(ref body) = body {
                request = request.json(body);
            }

            let response = match request.send().await {
                Ok(resp) => resp,
                Err(e) => {
                    if network_retries > 0 {
                        network_retries -= 1;
                        debug!(error = %e, url = %url, "Sonarr request failed, retrying once");
                        continue;
                    }
                    return Err(SonarrError::Network(e));
                }
            };

            match response.status() {
                StatusCode::NOT_FOUND => return Err(SonarrError::NotFound(path.to_string())),
                StatusCode::TOO_MANY_REQUESTS => {
                    if rate_retries > 0 {
                        rate_retries -= 1;
                        let delay = retry_after_seconds(&response).unwrap_or(5);
                        warn!(delay, url = %url, "Sonarr rate limited, honoring Retry-After");
                        tokio::time::sleep(Duration::from_secs(delay)).await;
                        continue;
                    }
                    return Err(SonarrError::RateLimited);
                }
                status if !status.is_success() => {
                    let body = response.text().await.unwrap_or_default();
                    return Err(SonarrError::Status {
                        status: status.as_u16(),
                        body,
                    });
                }
                _ => return Ok(response.json().await?),
            }
        }
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, SonarrError> {
        self.request(Method::GET, path, query, None).await
    }

    pub async fn get_all_series(&self) -> Result<Vec<SonarrSeries>, SonarrError> {
        self.get("series", &[]).await
    }

    pub async fn get_series_by_id(&self, id: i32) -> Result<Option<SonarrSeries>, SonarrError> {
        match self.get(&format!("series/{id}"), &[]).await {
            Ok(series) => Ok(Some(series)),
            Err(SonarrError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// All episodes of a series; cached for five minutes per series id.
    pub async fn get_series_episodes(
        &self,
        series_id: i32,
    ) -> Result<Arc<Vec<SonarrEpisode>>, SonarrError> {
        if let Some(cached) = self
            .episodes_cache
            .read()
            .await
            .get(&series_id)
            .and_then(CacheSlot::fresh)
        {
            return Ok(cached);
        }

        let episodes: Vec<SonarrEpisode> = self
            .get("episode", &[("seriesId", series_id.to_string())])
            .await?;
        let episodes = Arc::new(episodes);

        self.episodes_cache.write().await.insert(
            series_id,
            CacheSlot {
                fetched_at: Instant::now(),
                value: episodes.clone(),
            },
        );
        Ok(episodes)
    }

    pub async fn get_episode(&self, episode_id: i32) -> Result<Option<SonarrEpisode>, SonarrError> {
        match self.get(&format!("episode/{episode_id}"), &[]).await {
            Ok(episode) => Ok(Some(episode)),
            Err(SonarrError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// The `[start, end]` air-date window of a season; cached per
    /// (series, season). Episodes airing more than two weeks out are ignored.
    pub async fn get_season_air_date_info(
        &self,
        series_id: i32,
        season_number: i32,
    ) -> Result<SeasonAirDateInfo, SonarrError> {
        let key = (series_id, season_number);
        if let Some(cached) = self
            .air_date_cache
            .read()
            .await
            .get(&key)
            .and_then(CacheSlot::fresh)
        {
            return Ok(cached);
        }

        let episodes = self.get_series_episodes(series_id).await?;
        let horizon = Utc::now() + chrono::Duration::days(AIR_DATE_HORIZON_DAYS);

        let mut dates: Vec<DateTime<Utc>> = episodes
            .iter()
            .filter(|e| e.season_number == season_number)
            .filter_map(|e| e.air_date_utc)
            .filter(|d| *d <= horizon)
            .collect();
        dates.sort_unstable();

        let info = SeasonAirDateInfo {
            has_valid_air_date: !dates.is_empty(),
            start_date: dates.first().copied(),
            end_date: dates.last().copied(),
        };

        self.air_date_cache.write().await.insert(
            key,
            CacheSlot {
                fetched_at: Instant::now(),
                value: info,
            },
        );
        Ok(info)
    }

    /// One page of the wanted-missing list, sorted by air date ascending.
    pub async fn get_wanted_missing(
        &self,
        page_size: u32,
        page: u32,
    ) -> Result<WantedPage, SonarrError> {
        self.get(
            "wanted/missing",
            &[
                ("pageSize", page_size.to_string()),
                ("sortKey", "airDateUtc".to_string()),
                ("sortDirection", "ascending".to_string()),
                ("page", page.to_string()),
                ("includeSeries", "true".to_string()),
                ("monitored", "true".to_string()),
            ],
        )
        .await
    }

    pub async fn get_root_folders(&self) -> Result<Vec<SonarrRootFolder>, SonarrError> {
        self.get("rootfolder", &[]).await
    }

    pub async fn get_tags(&self) -> Result<Vec<SonarrTag>, SonarrError> {
        self.get("tag", &[]).await
    }

    pub async fn get_notifications(&self) -> Result<Vec<SonarrNotification>, SonarrError> {
        self.get("notification", &[]).await
    }

    /// Asks the library manager to rescan a series folder on disk.
    pub async fn rescan_series(&self, series_id: i32) -> Result<(), SonarrError> {
        let _: Value = self
            .request(
                Method::POST,
                "command",
                &[],
                Some(json!({ "name": "RescanSeries", "seriesId": series_id })),
            )
            .await?;
        Ok(())
    }

    /// Asks the library manager to rename an imported episode file to its
    /// configured naming scheme.
    pub async fn rename_episode_file(&self, episode_file_id: i64) -> Result<(), SonarrError> {
        let _: Value = self
            .request(
                Method::POST,
                "command",
                &[],
                Some(json!({ "name": "RenameFiles", "files": [episode_file_id] })),
            )
            .await?;
        Ok(())
    }
}

fn retry_after_seconds(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}
