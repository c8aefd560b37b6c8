use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

use super::limiter::DualRateLimiter;

const JIKAN_API: &str = "https://api.jikan.moe/v4";

#[derive(Debug, Deserialize)]
struct JikanResponse<T> {
    data: T,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JikanAnime {
    pub mal_id: i64,
    pub title: String,
    pub title_english: Option<String>,
    pub title_japanese: Option<String>,
    pub episodes: Option<i32>,
    pub status: Option<String>,
    #[serde(default)]
    pub airing: bool,
    pub aired: Option<JikanAired>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JikanAired {
    pub from: Option<String>,
    pub to: Option<String>,
}

impl JikanAnime {
    #[must_use]
    pub fn aired_from(&self) -> Option<DateTime<Utc>> {
        self.aired
            .as_ref()
            .and_then(|a| a.from.as_deref())
            .and_then(parse_jikan_date)
    }

    #[must_use]
    pub fn aired_to(&self) -> Option<DateTime<Utc>> {
        self.aired
            .as_ref()
            .and_then(|a| a.to.as_deref())
            .and_then(parse_jikan_date)
    }
}

fn parse_jikan_date(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[derive(Clone)]
pub struct JikanClient {
    client: Client,
    limiter: DualRateLimiter,
}

impl Default for JikanClient {
    fn default() -> Self {
        Self::new()
    }
}

impl JikanClient {
    /// Jikan enforces 3 requests per second and 60 per minute; both buckets
    /// must admit before a request goes out.
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .user_agent(concat!("Animarr/", env!("CARGO_PKG_VERSION")))
                .build()
                .unwrap_or_else(|_| Client::new()),
            limiter: DualRateLimiter::new(3, 60),
        }
    }

    pub async fn lookup_by_id(&self, mal_id: i64) -> Result<Option<JikanAnime>> {
        let url = format!("{JIKAN_API}/anime/{mal_id}");

        let mut rate_retries = 1u8;
        loop {
            self.limiter.acquire().await;

            let response = self.client.get(&url).send().await?;

            match response.status() {
                reqwest::StatusCode::NOT_FOUND => return Ok(None),
                reqwest::StatusCode::TOO_MANY_REQUESTS => {
                    let delay = response
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(3);
                    if rate_retries > 0 {
                        rate_retries -= 1;
                        warn!(delay, "Jikan rate limited, honoring Retry-After");
                        self.limiter.penalize(Duration::from_secs(delay)).await;
                        tokio::time::sleep(Duration::from_secs(delay)).await;
                        continue;
                    }
                    return Err(anyhow!("Jikan rate limited twice in a row"));
                }
                status if !status.is_success() => {
                    let body = response.text().await.unwrap_or_default();
                    return Err(anyhow!("Jikan returned {status}: {body}"));
                }
                _ => {
                    let envelope: JikanResponse<JikanAnime> = response.json().await?;
                    return Ok(Some(envelope.data));
                }
            }
        }
    }
}
