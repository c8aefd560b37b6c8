use anyhow::{Result, anyhow};
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use super::limiter::RateLimiter;

const ANILIST_API: &str = "https://graphql.anilist.co";

/// AniList allows ~90 requests per minute per client.
const REQUESTS_PER_MINUTE: u32 = 90;

const MEDIA_FIELDS: &str = r"
    id
    idMal
    title { romaji english native }
    format
    episodes
    status
    season
    seasonYear
    startDate { year month day }
    endDate { year month day }
";

#[derive(Serialize)]
struct GraphQLRequest<'a, V: Serialize> {
    query: &'a str,
    variables: V,
}

#[derive(Deserialize)]
struct FuzzyDate {
    year: Option<i32>,
    month: Option<u32>,
    day: Option<u32>,
}

impl FuzzyDate {
    /// Missing month/day default to January 1st; a missing year is no date.
    fn to_utc(&self) -> Option<DateTime<Utc>> {
        let year = self.year?;
        Utc.with_ymd_and_hms(year, self.month.unwrap_or(1), self.day.unwrap_or(1), 0, 0, 0)
            .single()
    }
}

#[derive(Deserialize)]
struct RawMedia {
    id: i64,
    #[serde(rename = "idMal")]
    id_mal: Option<i64>,
    title: RawTitle,
    format: Option<String>,
    episodes: Option<i32>,
    status: Option<String>,
    season: Option<String>,
    #[serde(rename = "seasonYear")]
    season_year: Option<i32>,
    #[serde(rename = "startDate")]
    start_date: Option<FuzzyDate>,
    #[serde(rename = "endDate")]
    end_date: Option<FuzzyDate>,
}

#[derive(Deserialize)]
struct RawTitle {
    romaji: Option<String>,
    english: Option<String>,
    native: Option<String>,
}

/// One media entry as the matcher consumes it: dates normalised to UTC,
/// airing flag derived from the status.
#[derive(Debug, Clone)]
pub struct AniListMedia {
    pub id: i64,
    pub mal_id: Option<i64>,
    pub title_romaji: Option<String>,
    pub title_english: Option<String>,
    pub title_native: Option<String>,
    pub format: Option<String>,
    pub episodes: Option<i32>,
    pub season: Option<String>,
    pub season_year: Option<i32>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub airing: bool,
}

impl AniListMedia {
    fn from_raw(raw: RawMedia) -> Self {
        Self {
            id: raw.id,
            mal_id: raw.id_mal,
            title_romaji: raw.title.romaji,
            title_english: raw.title.english,
            title_native: raw.title.native,
            format: raw.format,
            episodes: raw.episodes,
            season: raw.season,
            season_year: raw.season_year,
            start_date: raw.start_date.as_ref().and_then(FuzzyDate::to_utc),
            end_date: raw.end_date.as_ref().and_then(FuzzyDate::to_utc),
            airing: raw.status.as_deref() == Some("RELEASING"),
        }
    }

    /// Every known title, romaji first, without duplicates.
    #[must_use]
    pub fn titles(&self) -> Vec<String> {
        let mut titles = Vec::new();
        for candidate in [&self.title_romaji, &self.title_english, &self.title_native] {
            if let Some(title) = candidate
                && !titles.contains(title)
            {
                titles.push(title.clone());
            }
        }
        titles
    }
}

#[derive(Clone)]
pub struct AniListClient {
    client: Client,
    limiter: RateLimiter,
}

impl Default for AniListClient {
    fn default() -> Self {
        Self::new()
    }
}

impl AniListClient {
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .user_agent(concat!("Animarr/", env!("CARGO_PKG_VERSION")))
                .build()
                .unwrap_or_else(|_| Client::new()),
            limiter: RateLimiter::per_minute(REQUESTS_PER_MINUTE),
        }
    }

    async fn post_graphql<V: Serialize>(
        &self,
        query: &str,
        variables: V,
    ) -> Result<serde_json::Value> {
        let body = GraphQLRequest { query, variables };

        let mut rate_retries = 1u8;
        loop {
            self.limiter.acquire().await;

            let response = self.client.post(ANILIST_API).json(&body).send().await?;

            if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
                let delay = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(60);
                if rate_retries > 0 {
                    rate_retries -= 1;
                    warn!(delay, "AniList rate limited, honoring Retry-After");
                    self.limiter.penalize(Duration::from_secs(delay)).await;
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                    continue;
                }
                return Err(anyhow!("AniList rate limited twice in a row"));
            }

            if !response.status().is_success() {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                return Err(anyhow!("AniList returned {status}: {text}"));
            }

            return Ok(response.json().await?);
        }
    }

    /// Paginated media search by title. When `years` is given, results whose
    /// season year (or start-date year) falls outside the range are dropped.
    pub async fn search_by_title_and_window(
        &self,
        title: &str,
        years: Option<(i32, i32)>,
    ) -> Result<Vec<AniListMedia>> {
        #[derive(Serialize)]
        struct Vars<'a> {
            search: &'a str,
        }

        let query = format!(
            "query ($search: String) {{
                Page(page: 1, perPage: 10) {{
                    media(search: $search, type: ANIME) {{ {MEDIA_FIELDS} }}
                }}
            }}"
        );

        let value = self.post_graphql(&query, Vars { search: title }).await?;

        let media: Vec<RawMedia> = serde_json::from_value(
            value
                .pointer("/data/Page/media")
                .cloned()
                .unwrap_or(serde_json::Value::Array(vec![])),
        )?;

        let mut results: Vec<AniListMedia> = media.into_iter().map(AniListMedia::from_raw).collect();

        if let Some((from, to)) = years {
            use chrono::Datelike;
            results.retain(|m| {
                let year = m.season_year.or_else(|| m.start_date.map(|d| d.year()));
                year.is_none_or(|y| y >= from && y <= to)
            });
        }

        Ok(results)
    }

    pub async fn lookup_by_id(&self, id: i64) -> Result<Option<AniListMedia>> {
        #[derive(Serialize)]
        struct Vars {
            id: i64,
        }

        let query = format!(
            "query ($id: Int) {{
                Media(id: $id, type: ANIME) {{ {MEDIA_FIELDS} }}
            }}"
        );

        let value = self.post_graphql(&query, Vars { id }).await?;

        let media = value.pointer("/data/Media").cloned();
        match media {
            Some(serde_json::Value::Null) | None => Ok(None),
            Some(raw) => {
                let raw: RawMedia = serde_json::from_value(raw)?;
                Ok(Some(AniListMedia::from_raw(raw)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fuzzy_date_defaults_month_and_day() {
        let date = FuzzyDate {
            year: Some(2025),
            month: None,
            day: None,
        };
        assert_eq!(date.to_utc().unwrap().to_rfc3339(), "2025-01-01T00:00:00+00:00");

        let missing_year = FuzzyDate {
            year: None,
            month: Some(4),
            day: Some(5),
        };
        assert!(missing_year.to_utc().is_none());
    }

    #[test]
    fn titles_deduplicate_preserving_order() {
        let media = AniListMedia {
            id: 1,
            mal_id: None,
            title_romaji: Some("Sakamoto Days".to_string()),
            title_english: Some("Sakamoto Days".to_string()),
            title_native: Some("サカモトデイズ".to_string()),
            format: None,
            episodes: None,
            season: None,
            season_year: None,
            start_date: None,
            end_date: None,
            airing: false,
        };
        assert_eq!(media.titles(), vec!["Sakamoto Days", "サカモトデイズ"]);
    }
}
