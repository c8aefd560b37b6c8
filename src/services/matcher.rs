//! Resolves a season of a monitored series to its source-site identifiers.
//!
//! The rich path cross-references the site's filtered search with the
//! external anime databases and validates candidates against the season's
//! air-date window before applying the language policy. A last-resort
//! fallback matches by title alone (with the `part` guard) and skips the
//! window checks entirely.

use anyhow::Result;
use chrono::{DateTime, Datelike, Days, Months, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::clients::anilist::{AniListClient, AniListMedia};
use crate::clients::animeworld::{
    AnimeWorldClient, FilterHit, FilterQuery, FilterType, find_best_match_with_parts,
    normalize_title, sanitize_search_title,
};
use crate::clients::jikan::{JikanAnime, JikanClient};
use crate::models::series::{PreferredLanguage, Series};

/// A season's air-date window as the library manager reports it.
#[derive(Debug, Clone, Copy)]
pub struct MatchWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl MatchWindow {
    /// Matching tolerates source-site listings that start up to one month
    /// and ten days before the window.
    #[must_use]
    pub fn earliest_start(&self) -> DateTime<Utc> {
        self.start
            .checked_sub_months(Months::new(1))
            .and_then(|d| d.checked_sub_days(Days::new(10)))
            .unwrap_or(self.start)
    }

    /// ...and end up to one month and ten days after it.
    #[must_use]
    pub fn latest_end(&self) -> DateTime<Utc> {
        self.end
            .checked_add_months(Months::new(1))
            .and_then(|d| d.checked_add_days(Days::new(10)))
            .unwrap_or(self.end)
    }
}

/// The date facts an external anime database contributes to validation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExternalDates {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub airing: bool,
}

impl From<&AniListMedia> for ExternalDates {
    fn from(media: &AniListMedia) -> Self {
        Self {
            start: media.start_date,
            end: media.end_date,
            airing: media.airing,
        }
    }
}

impl From<&JikanAnime> for ExternalDates {
    fn from(anime: &JikanAnime) -> Self {
        Self {
            start: anime.aired_from(),
            end: anime.aired_to(),
            airing: anime.airing,
        }
    }
}

/// Window validation: a candidate needs a start date inside the broadened
/// window, and an end date (inside it too) unless it is still airing.
#[must_use]
pub fn validate_dates(dates: &ExternalDates, window: &MatchWindow) -> bool {
    let Some(start) = dates.start else {
        return false;
    };
    if dates.end.is_none() && !dates.airing {
        return false;
    }

    let earliest = window.earliest_start();
    let latest = window.latest_end();

    if start < earliest || start > latest {
        return false;
    }
    if let Some(end) = dates.end
        && end > latest
    {
        return false;
    }
    true
}

/// A filter hit that survived external-DB validation.
#[derive(Debug, Clone)]
pub struct ValidatedMatch {
    pub identifier: String,
    pub title: String,
    pub dub: bool,
    pub start: DateTime<Utc>,
}

/// Applies the language preference to the validated matches.
///
/// With `dub_fallback_sub`, a subbed entry survives only when no dubbed
/// entry exists for the same (normalised) title.
#[must_use]
pub fn apply_language_policy(
    matches: Vec<ValidatedMatch>,
    language: PreferredLanguage,
) -> Vec<ValidatedMatch> {
    match language {
        PreferredLanguage::Dub => matches.into_iter().filter(|m| m.dub).collect(),
        PreferredLanguage::Sub => matches.into_iter().filter(|m| !m.dub).collect(),
        PreferredLanguage::DubFallbackSub => {
            let dubbed_titles: HashSet<String> = matches
                .iter()
                .filter(|m| m.dub)
                .map(|m| normalize_title(&m.title))
                .collect();
            matches
                .into_iter()
                .filter(|m| m.dub || !dubbed_titles.contains(&normalize_title(&m.title)))
                .collect()
        }
    }
}

/// Search keywords for a season: the series title, the alternates scoped to
/// this season (or to all seasons), and whatever the external DB knows the
/// show as, sanitised and deduplicated preserving order.
#[must_use]
pub fn candidate_titles(series: &Series, season_number: i32, extra: &[String]) -> Vec<String> {
    let mut raw = vec![series.title.clone()];
    raw.extend(
        series
            .alternate_titles
            .iter()
            .filter(|t| {
                t.scene_season_number
                    .is_none_or(|n| n < 0 || n == season_number)
            })
            .map(|t| t.title.clone()),
    );
    raw.extend(extra.iter().cloned());

    let mut seen = HashSet::new();
    let mut titles = Vec::new();
    for title in raw {
        let sanitized = sanitize_search_title(&title);
        if sanitized.is_empty() {
            continue;
        }
        // Non-Latin titles normalise to nothing; fall back to the raw form
        // so they still deduplicate without being dropped.
        let mut key = normalize_title(&sanitized);
        if key.is_empty() {
            key = sanitized.to_lowercase();
        }
        if seen.insert(key) {
            titles.push(sanitized);
        }
    }
    titles
}

pub struct SeasonMatcher {
    anilist: Arc<AniListClient>,
    jikan: Arc<JikanClient>,
    animeworld: Arc<AnimeWorldClient>,
}

impl SeasonMatcher {
    #[must_use]
    pub const fn new(
        anilist: Arc<AniListClient>,
        jikan: Arc<JikanClient>,
        animeworld: Arc<AnimeWorldClient>,
    ) -> Self {
        Self {
            anilist,
            jikan,
            animeworld,
        }
    }

    /// The rich path: filtered search + external-DB date validation +
    /// language policy. Returns identifiers in air-date order; empty when
    /// nothing survives.
    pub async fn resolve_season(
        &self,
        series: &Series,
        season_number: i32,
        window: &MatchWindow,
        language: PreferredLanguage,
    ) -> Result<Vec<String>> {
        let year_from = window.start.year();
        let year_to = window.end.year();

        let db_media = match self
            .anilist
            .search_by_title_and_window(&series.title, Some((year_from - 1, year_to + 1)))
            .await
        {
            Ok(media) => media,
            Err(e) => {
                warn!(title = %series.title, error = %e, "AniList title lookup failed");
                Vec::new()
            }
        };

        let extra_titles: Vec<String> = db_media.iter().take(3).flat_map(|m| m.titles()).collect();
        let is_movie = db_media
            .first()
            .is_some_and(|m| m.format.as_deref() == Some("MOVIE"));
        let types = if is_movie {
            vec![FilterType::Movie]
        } else {
            vec![FilterType::Anime, FilterType::Ona]
        };

        let candidates = candidate_titles(series, season_number, &extra_titles);
        let years: Vec<i32> = (year_from..=year_to).collect();

        let mut dub_variants = Vec::new();
        if language.wants_dub() {
            dub_variants.push(true);
        }
        if language.wants_sub() {
            dub_variants.push(false);
        }

        let mut hits: Vec<FilterHit> = Vec::new();
        for dub in dub_variants {
            for keyword in &candidates {
                let query = FilterQuery {
                    keyword: keyword.clone(),
                    types: types.clone(),
                    dub,
                    years: years.clone(),
                    season: None,
                };
                match self.animeworld.search_with_filter(&query).await {
                    Ok(results) if !results.is_empty() => {
                        debug!(keyword = %keyword, dub, count = results.len(), "Filter search hit");
                        hits.extend(results);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(keyword = %keyword, dub, error = %e, "Filter search failed");
                    }
                }
            }
        }

        let mut validated = Vec::new();
        for hit in hits {
            let Some(dates) = self.external_dates(&hit).await else {
                debug!(identifier = %hit.identifier, "No external metadata, rejecting");
                continue;
            };
            if !validate_dates(&dates, window) {
                debug!(identifier = %hit.identifier, "Outside air-date window, rejecting");
                continue;
            }
            let Some(start) = dates.start else { continue };
            validated.push(ValidatedMatch {
                identifier: hit.identifier,
                title: hit.title,
                dub: hit.dub,
                start,
            });
        }

        let mut kept = apply_language_policy(validated, language);
        kept.sort_by_key(|m| m.start);

        let mut seen = HashSet::new();
        Ok(kept
            .into_iter()
            .filter(|m| seen.insert(m.identifier.clone()))
            .map(|m| m.identifier)
            .collect())
    }

    /// Last-resort matching by plain title search. No air-date checks; the
    /// `part` guard alone keeps later seasons out.
    pub async fn resolve_season_fallback(
        &self,
        series: &Series,
        season_number: i32,
    ) -> Result<Vec<String>> {
        let season_alternate = series
            .alternate_titles
            .iter()
            .find(|t| t.scene_season_number == Some(season_number))
            .map(|t| t.title.clone());

        let keyword = match season_alternate {
            Some(alternate) => sanitize_search_title(&alternate),
            None if season_number <= 1 => sanitize_search_title(&series.title),
            None => format!("{} {}", sanitize_search_title(&series.title), season_number),
        };

        let results = self.animeworld.search(&keyword).await?;
        let matched = find_best_match_with_parts(&results, &keyword);

        let mut seen = HashSet::new();
        Ok(matched
            .into_iter()
            .filter(|h| seen.insert(h.identifier.clone()))
            .map(|h| h.identifier)
            .collect())
    }

    /// External metadata for one hit, preferring AniList over MyAnimeList.
    async fn external_dates(&self, hit: &FilterHit) -> Option<ExternalDates> {
        if let Some(anilist_id) = hit.anilist_id {
            match self.anilist.lookup_by_id(anilist_id).await {
                Ok(Some(media)) => return Some(ExternalDates::from(&media)),
                Ok(None) => {}
                Err(e) => {
                    warn!(anilist_id, error = %e, "AniList lookup failed");
                }
            }
        }

        if let Some(mal_id) = hit.mal_id {
            match self.jikan.lookup_by_id(mal_id).await {
                Ok(Some(anime)) => return Some(ExternalDates::from(&anime)),
                Ok(None) => {}
                Err(e) => {
                    warn!(mal_id, error = %e, "MyAnimeList lookup failed");
                }
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::series::{AlternateTitle, SeriesStatus};
    use chrono::TimeZone;

    fn utc(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn window() -> MatchWindow {
        MatchWindow {
            start: utc(2025, 1, 11),
            end: utc(2025, 4, 5),
        }
    }

    fn series_fixture() -> Series {
        Series {
            id: 1,
            sonarr_id: 100,
            title: "Sakamoto Days (2025)".to_string(),
            alternate_titles: vec![
                AlternateTitle {
                    title: "SAKAMOTO DAYS".to_string(),
                    scene_season_number: Some(-1),
                },
                AlternateTitle {
                    title: "Sakamoto Days Part 2".to_string(),
                    scene_season_number: Some(2),
                },
            ],
            description: None,
            status: SeriesStatus::Ongoing,
            total_seasons: 1,
            year: Some(2025),
            network: None,
            genres: vec![],
            preferred_language: None,
            absolute: false,
            poster_url: None,
            poster_path: None,
            poster_downloaded_at: None,
            deleted: false,
        }
    }

    fn vm(identifier: &str, title: &str, dub: bool, start: DateTime<Utc>) -> ValidatedMatch {
        ValidatedMatch {
            identifier: identifier.to_string(),
            title: title.to_string(),
            dub,
            start,
        }
    }

    #[test]
    fn window_broadened_by_one_month_ten_days() {
        let w = window();
        assert_eq!(w.earliest_start(), utc(2024, 12, 1));
        assert_eq!(w.latest_end(), utc(2025, 5, 15));
    }

    #[test]
    fn validation_requires_start_date() {
        let dates = ExternalDates {
            start: None,
            end: Some(utc(2025, 4, 5)),
            airing: false,
        };
        assert!(!validate_dates(&dates, &window()));
    }

    #[test]
    fn validation_requires_end_date_unless_airing() {
        let finished_without_end = ExternalDates {
            start: Some(utc(2025, 1, 11)),
            end: None,
            airing: false,
        };
        assert!(!validate_dates(&finished_without_end, &window()));

        let still_airing = ExternalDates {
            start: Some(utc(2025, 1, 11)),
            end: None,
            airing: true,
        };
        assert!(validate_dates(&still_airing, &window()));
    }

    #[test]
    fn validation_enforces_broadened_window() {
        let w = window();

        let inside = ExternalDates {
            start: Some(utc(2025, 1, 11)),
            end: Some(utc(2025, 4, 5)),
            airing: false,
        };
        assert!(validate_dates(&inside, &w));

        let starts_too_early = ExternalDates {
            start: Some(utc(2024, 11, 30)),
            end: Some(utc(2025, 4, 5)),
            airing: false,
        };
        assert!(!validate_dates(&starts_too_early, &w));

        let ends_too_late = ExternalDates {
            start: Some(utc(2025, 1, 11)),
            end: Some(utc(2025, 5, 16)),
            airing: false,
        };
        assert!(!validate_dates(&ends_too_late, &w));

        // a whole different season, months later
        let next_season = ExternalDates {
            start: Some(utc(2025, 10, 4)),
            end: Some(utc(2025, 12, 20)),
            airing: false,
        };
        assert!(!validate_dates(&next_season, &w));
    }

    #[test]
    fn language_policy_dub_and_sub_are_strict() {
        let start = utc(2025, 1, 11);
        let matches = vec![
            vm("a.1", "My Show", true, start),
            vm("b.2", "My Show", false, start),
        ];

        let dubs = apply_language_policy(matches.clone(), PreferredLanguage::Dub);
        assert!(dubs.iter().all(|m| m.dub));
        assert_eq!(dubs.len(), 1);

        let subs = apply_language_policy(matches, PreferredLanguage::Sub);
        assert!(subs.iter().all(|m| !m.dub));
        assert_eq!(subs.len(), 1);
    }

    #[test]
    fn language_policy_dub_fallback_prefers_dub_per_title() {
        let start = utc(2025, 1, 11);
        let matches = vec![
            vm("my-show.aa", "My Show", true, start),
            vm("my-show.bb", "My Show", false, start),
            vm("other.cc", "Other Show", false, start),
        ];

        let kept = apply_language_policy(matches, PreferredLanguage::DubFallbackSub);
        let ids: Vec<&str> = kept.iter().map(|m| m.identifier.as_str()).collect();

        // the dubbed variant wins for "My Show"; "Other Show" has no dub and
        // survives as sub
        assert_eq!(ids, vec!["my-show.aa", "other.cc"]);
    }

    #[test]
    fn candidates_are_scoped_sanitized_and_deduped() {
        let series = series_fixture();
        let extra = vec!["Sakamoto Days".to_string(), "サカモトデイズ".to_string()];

        let season1 = candidate_titles(&series, 1, &extra);
        // "(2025)" stripped, the scene-season-2 alternate excluded, the
        // all-seasons alternate deduped against the main title
        assert_eq!(season1, vec!["Sakamoto Days", "サカモトデイズ"]);

        let season2 = candidate_titles(&series, 2, &extra);
        assert!(season2.contains(&"Sakamoto Days Part 2".to_string()));
    }
}
