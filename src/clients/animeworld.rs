//! Session-bootstrapping client for the source streaming site.
//!
//! The site alternates between a JavaScript-set challenge cookie and a CSRF
//! meta tag on first load; the bootstrap tolerates either order over up to
//! two attempts, and every later request reuses the cookie jar plus the
//! `csrf-token` header.

use anyhow::{Context, Result, bail};
use regex::Regex;
use reqwest::{Client, Url, cookie::Jar};
use scraper::{Html, Selector};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::settings::SettingsService;

const SEARCH_PATH: &str = "/api/search/v2";

/// Pre-parsed CSS selectors, built once.
struct PageSelectors {
    csrf_meta: Selector,
    film_name: Selector,
    episode: Selector,
    download_link: Selector,
}

impl PageSelectors {
    fn get() -> Option<&'static Self> {
        static INSTANCE: OnceLock<Option<PageSelectors>> = OnceLock::new();
        INSTANCE
            .get_or_init(|| {
                Some(Self {
                    csrf_meta: Selector::parse(r#"meta[name="csrf-token"]"#).ok()?,
                    film_name: Selector::parse(".film-list .item a.name").ok()?,
                    episode: Selector::parse("ul.episodes li.episode [data-episode-num]").ok()?,
                    download_link: Selector::parse("#download center a[download]").ok()?,
                })
            })
            .as_ref()
    }
}

/// Regexes for the pieces CSS selectors cannot reach.
struct PageRegex {
    js_cookie: Regex,
    mal_id: Regex,
    anilist_id: Regex,
    paren_tag: Regex,
    non_alnum: Regex,
    whitespace: Regex,
    year_or_tv: Regex,
}

impl PageRegex {
    fn get() -> Option<&'static Self> {
        static INSTANCE: OnceLock<Option<PageRegex>> = OnceLock::new();
        INSTANCE
            .get_or_init(|| {
                Some(Self {
                    js_cookie: Regex::new(r#"document\.cookie\s*=\s*"([^=;"]+)=([^;"]+)"#).ok()?,
                    mal_id: Regex::new(r#"(?:myanimelist\.net/anime/|data-mal-id=")(\d+)"#).ok()?,
                    anilist_id: Regex::new(r#"(?:anilist\.co/anime/|data-anilist-id=")(\d+)"#)
                        .ok()?,
                    paren_tag: Regex::new(r"\([^)]*\)").ok()?,
                    non_alnum: Regex::new(r"[^a-z0-9 ]+").ok()?,
                    whitespace: Regex::new(r"\s+").ok()?,
                    year_or_tv: Regex::new(r"(?i)\(\s*(?:(?:19|20)\d{2}|TV)\s*\)").ok()?,
                })
            })
            .as_ref()
    }
}

#[derive(Debug, Clone, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    animes: Vec<ApiAnime>,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiAnime {
    id: i64,
    name: String,
    #[serde(default)]
    jtitle: Option<String>,
    #[serde(default)]
    link: String,
    #[serde(default)]
    identifier: Option<String>,
    #[serde(rename = "anilistId", default)]
    anilist_id: Option<i64>,
    #[serde(rename = "malId", default)]
    mal_id: Option<i64>,
    #[serde(default)]
    dub: u8,
}

/// One hit from the search API.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: i64,
    pub name: String,
    pub jtitle: Option<String>,
    pub link: String,
    /// The `/play/` slug, e.g. `one-piece.12345`.
    pub identifier: String,
    pub anilist_id: Option<i64>,
    pub mal_id: Option<i64>,
    pub dub: bool,
}

/// One hit from the filtered HTML listing, enriched with the external
/// anime-DB ids scraped off its page.
#[derive(Debug, Clone)]
pub struct FilterHit {
    pub title: String,
    pub jtitle: Option<String>,
    pub identifier: String,
    pub dub: bool,
    pub mal_id: Option<i64>,
    pub anilist_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterType {
    Anime,
    Ona,
    Movie,
    Special,
}

impl FilterType {
    const fn as_param(self) -> &'static str {
        match self {
            Self::Anime => "0",
            Self::Ona => "2",
            Self::Movie => "4",
            Self::Special => "3",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FilterQuery {
    pub keyword: String,
    pub types: Vec<FilterType>,
    pub dub: bool,
    pub years: Vec<i32>,
    pub season: Option<String>,
}

struct Session {
    csrf_token: String,
}

pub struct AnimeWorldClient {
    client: Client,
    jar: Arc<Jar>,
    settings: Arc<SettingsService>,
    session: RwLock<Option<Session>>,
}

impl AnimeWorldClient {
    #[must_use]
    pub fn new(settings: Arc<SettingsService>) -> Self {
        let jar = Arc::new(Jar::default());
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .cookie_provider(jar.clone())
                .user_agent(concat!("Animarr/", env!("CARGO_PKG_VERSION")))
                .build()
                .unwrap_or_else(|_| Client::new()),
            jar,
            settings,
            session: RwLock::new(None),
        }
    }

    async fn base_url(&self) -> Result<Url> {
        let base = self.settings.animeworld_base_url().await?;
        Url::parse(&base).with_context(|| format!("invalid source-site base URL: {base}"))
    }

    /// Returns the CSRF token, bootstrapping the session on first use.
    async fn ensure_session(&self) -> Result<String> {
        if let Some(session) = self.session.read().await.as_ref() {
            return Ok(session.csrf_token.clone());
        }
        self.bootstrap().await
    }

    async fn bootstrap(&self) -> Result<String> {
        let base = self.base_url().await?;

        for attempt in 1..=2u8 {
            let body = self
                .client
                .get(base.clone())
                .send()
                .await?
                .text()
                .await?;

            if let Some((name, value)) = parse_js_cookie(&body) {
                debug!(cookie = %name, attempt, "Source site set a challenge cookie");
                self.jar
                    .add_cookie_str(&format!("{name}={value}; Path=/"), &base);
            }

            if let Some(csrf) = parse_csrf_token(&body) {
                *self.session.write().await = Some(Session {
                    csrf_token: csrf.clone(),
                });
                debug!(attempt, "Source-site session established");
                return Ok(csrf);
            }
        }

        bail!("could not establish a source-site session after 2 attempts")
    }

    /// Drops the session so the next call bootstraps again.
    pub async fn reset_session(&self) {
        *self.session.write().await = None;
    }

    /// Full-text search through the site's JSON API.
    pub async fn search(&self, keyword: &str) -> Result<Vec<SearchHit>> {
        let csrf = self.ensure_session().await?;
        let base = self.base_url().await?;
        let url = format!(
            "{}{}?keyword={}",
            base.as_str().trim_end_matches('/'),
            SEARCH_PATH,
            urlencoding::encode(keyword)
        );

        let response: SearchResponse = self
            .client
            .post(&url)
            .header("csrf-token", &csrf)
            .header("x-requested-with", "XMLHttpRequest")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(response
            .animes
            .into_iter()
            .filter_map(|a| {
                let identifier = a
                    .identifier
                    .clone()
                    .or_else(|| identifier_from_link(&a.link))?;
                Some(SearchHit {
                    id: a.id,
                    name: a.name,
                    jtitle: a.jtitle,
                    link: a.link,
                    identifier,
                    anilist_id: a.anilist_id,
                    mal_id: a.mal_id,
                    dub: a.dub != 0,
                })
            })
            .collect())
    }

    /// Search through the HTML filter listing. Each hit's page is fetched to
    /// extract MyAnimeList / AniList ids when present.
    pub async fn search_with_filter(&self, query: &FilterQuery) -> Result<Vec<FilterHit>> {
        self.ensure_session().await?;
        let base = self.base_url().await?;

        let mut url = base.join("/filter")?;
        {
            let mut pairs = url.query_pairs_mut();
            for t in &query.types {
                pairs.append_pair("type", t.as_param());
            }
            pairs.append_pair("dub", if query.dub { "1" } else { "0" });
            pairs.append_pair("sort", "0");
            pairs.append_pair("keyword", &query.keyword);
            for year in &query.years {
                pairs.append_pair("year", &year.to_string());
            }
            if let Some(season) = &query.season {
                pairs.append_pair("season", season);
            }
        }

        let body = self.client.get(url).send().await?.text().await?;
        let listed = parse_filter_page(&body, query.dub);

        let mut hits = Vec::with_capacity(listed.len());
        for mut hit in listed {
            let page_url = base.join(&format!("/play/{}", hit.identifier))?;
            match self.client.get(page_url).send().await {
                Ok(resp) => {
                    let page = resp.text().await.unwrap_or_default();
                    let (mal_id, anilist_id) = parse_external_ids(&page);
                    hit.mal_id = mal_id;
                    hit.anilist_id = anilist_id;
                }
                Err(e) => {
                    warn!(identifier = %hit.identifier, error = %e,
                        "Could not fetch anime page for external ids");
                }
            }
            hits.push(hit);
        }

        Ok(hits)
    }

    /// Episode number → episode page URL for one identifier.
    pub async fn episodes_from_identifier(&self, identifier: &str) -> Result<BTreeMap<u32, String>> {
        self.ensure_session().await?;
        let base = self.base_url().await?;
        let url = base.join(&format!("/play/{identifier}"))?;

        let body = self.client.get(url).send().await?.text().await?;
        Ok(parse_episode_list(&body, &base))
    }

    /// Concatenates the episode maps of a multi-part season with sequential
    /// renumbering: each part is offset by the highest episode number of the
    /// parts before it.
    pub async fn episodes_from_identifiers(
        &self,
        identifiers: &[String],
    ) -> Result<BTreeMap<u32, String>> {
        let mut parts = Vec::with_capacity(identifiers.len());
        for identifier in identifiers {
            parts.push(self.episodes_from_identifier(identifier).await?);
        }
        Ok(merge_parts(&parts))
    }

    /// The direct file URL behind an episode page, when the site offers one.
    pub async fn download_link_for_episode(&self, episode_url: &str) -> Result<Option<String>> {
        self.ensure_session().await?;
        let body = self
            .client
            .get(episode_url)
            .send()
            .await?
            .text()
            .await?;
        Ok(parse_download_link(&body))
    }

    /// Resolves one episode of a (possibly multi-part) season to a direct
    /// download URL.
    pub async fn find_episode_download_link(
        &self,
        identifiers: &[String],
        episode_number: u32,
    ) -> Result<Option<String>> {
        let episodes = self.episodes_from_identifiers(identifiers).await?;
        match episodes.get(&episode_number) {
            Some(episode_url) => self.download_link_for_episode(episode_url).await,
            None => Ok(None),
        }
    }
}

// ----- pure parsing & matching helpers -----

fn identifier_from_link(link: &str) -> Option<String> {
    let idx = link.find("/play/")?;
    let slug = &link[idx + "/play/".len()..];
    let slug = slug.split(['?', '#', '/']).next().unwrap_or(slug);
    (!slug.is_empty()).then(|| slug.to_string())
}

fn parse_js_cookie(body: &str) -> Option<(String, String)> {
    let re = PageRegex::get()?;
    let caps = re.js_cookie.captures(body)?;
    Some((caps[1].trim().to_string(), caps[2].trim().to_string()))
}

fn parse_csrf_token(body: &str) -> Option<String> {
    let selectors = PageSelectors::get()?;
    let document = Html::parse_document(body);
    document
        .select(&selectors.csrf_meta)
        .next()
        .and_then(|el| el.value().attr("content"))
        .map(str::to_string)
}

fn parse_filter_page(body: &str, dub: bool) -> Vec<FilterHit> {
    let Some(selectors) = PageSelectors::get() else {
        return Vec::new();
    };
    let document = Html::parse_document(body);

    document
        .select(&selectors.film_name)
        .filter_map(|el| {
            let title = el.text().collect::<String>().trim().to_string();
            let href = el.value().attr("href")?;
            let identifier = identifier_from_link(href)?;
            let jtitle = el
                .value()
                .attr("data-jtitle")
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty());
            (!title.is_empty()).then_some(FilterHit {
                title,
                jtitle,
                identifier,
                dub,
                mal_id: None,
                anilist_id: None,
            })
        })
        .collect()
}

fn parse_external_ids(body: &str) -> (Option<i64>, Option<i64>) {
    let Some(re) = PageRegex::get() else {
        return (None, None);
    };
    let mal = re
        .mal_id
        .captures(body)
        .and_then(|c| c[1].parse().ok());
    let anilist = re
        .anilist_id
        .captures(body)
        .and_then(|c| c[1].parse().ok());
    (mal, anilist)
}

fn parse_episode_list(body: &str, base: &Url) -> BTreeMap<u32, String> {
    let Some(selectors) = PageSelectors::get() else {
        return BTreeMap::new();
    };
    let document = Html::parse_document(body);

    let mut episodes = BTreeMap::new();
    for el in document.select(&selectors.episode) {
        let Some(number) = el
            .value()
            .attr("data-episode-num")
            .and_then(|n| n.parse::<u32>().ok())
        else {
            continue;
        };
        let Some(href) = el.value().attr("href") else {
            continue;
        };
        let Ok(absolute) = base.join(href) else {
            continue;
        };
        episodes.insert(number, absolute.to_string());
    }
    episodes
}

fn parse_download_link(body: &str) -> Option<String> {
    let selectors = PageSelectors::get()?;
    let document = Html::parse_document(body);
    document
        .select(&selectors.download_link)
        .next()
        .and_then(|el| el.value().attr("href"))
        .map(str::to_string)
}

/// Sequential renumbering across season parts: episode `n` of part `p` maps
/// to `Σ max(episodes of parts 1..p−1) + n`.
#[must_use]
pub fn merge_parts(parts: &[BTreeMap<u32, String>]) -> BTreeMap<u32, String> {
    let mut merged = BTreeMap::new();
    let mut offset = 0u32;
    for part in parts {
        for (number, url) in part {
            merged.insert(offset + number, url.clone());
        }
        offset += part.keys().max().copied().unwrap_or(0);
    }
    merged
}

/// Canonical form used for title comparison: lowercase, parenthesised tags
/// dropped, punctuation stripped, whitespace collapsed.
#[must_use]
pub fn normalize_title(title: &str) -> String {
    let Some(re) = PageRegex::get() else {
        return title.to_lowercase();
    };
    let lowered = title.to_lowercase();
    let without_tags = re.paren_tag.replace_all(&lowered, " ");
    let alnum = re.non_alnum.replace_all(&without_tags, " ");
    re.whitespace.replace_all(&alnum, " ").trim().to_string()
}

/// Strips `(YYYY)` and `(TV)` decorations before a title is used as a
/// search keyword.
#[must_use]
pub fn sanitize_search_title(title: &str) -> String {
    let Some(re) = PageRegex::get() else {
        return title.trim().to_string();
    };
    let stripped = re.year_or_tv.replace_all(title, " ");
    re.whitespace
        .replace_all(&stripped, " ")
        .trim()
        .to_string()
}

/// All results whose normalised title equals the normalised target, followed
/// by every result that reads `<target> part N` / `<target> parte N` (in
/// either title field). The `part` keyword is required so that later seasons
/// are never pulled in. Each group is ordered by ascending result id.
#[must_use]
pub fn find_best_match_with_parts(results: &[SearchHit], target: &str) -> Vec<SearchHit> {
    let normalized_target = normalize_title(target);
    if normalized_target.is_empty() {
        return Vec::new();
    }

    let part_re = Regex::new(&format!(
        r"^{} part[e]? \d+$",
        regex::escape(&normalized_target)
    ))
    .ok();

    let mut exact: Vec<SearchHit> = Vec::new();
    let mut parts: Vec<SearchHit> = Vec::new();

    for hit in results {
        let name = normalize_title(&hit.name);
        let jtitle = hit.jtitle.as_deref().map(normalize_title);

        if name == normalized_target || jtitle.as_deref() == Some(normalized_target.as_str()) {
            exact.push(hit.clone());
        } else if let Some(re) = &part_re
            && (re.is_match(&name) || jtitle.as_deref().is_some_and(|t| re.is_match(t)))
        {
            parts.push(hit.clone());
        }
    }

    exact.sort_by_key(|h| h.id);
    parts.sort_by_key(|h| h.id);
    exact.extend(parts);
    exact
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(id: i64, name: &str) -> SearchHit {
        SearchHit {
            id,
            name: name.to_string(),
            jtitle: None,
            link: format!("/play/slug.{id}"),
            identifier: format!("slug.{id}"),
            anilist_id: None,
            mal_id: None,
            dub: false,
        }
    }

    #[test]
    fn normalizes_titles() {
        assert_eq!(normalize_title("One Piece (ITA)"), "one piece");
        assert_eq!(normalize_title("  Sakamoto  Days!! (Sub ITA)"), "sakamoto days");
        assert_eq!(normalize_title("Frieren: Beyond Journey's End"), "frieren beyond journey s end");
    }

    #[test]
    fn sanitizes_search_titles() {
        assert_eq!(sanitize_search_title("Dr. Stone (2019)"), "Dr. Stone");
        assert_eq!(sanitize_search_title("Haikyuu!! (TV)"), "Haikyuu!!");
        assert_eq!(sanitize_search_title("Plain Title"), "Plain Title");
    }

    #[test]
    fn best_match_keeps_exact_and_guarded_parts() {
        let results = vec![
            hit(30, "One Piece Part 2"),
            hit(10, "One Piece"),
            hit(20, "One Piece (ITA)"),
            hit(40, "One Piece Film Red"),
            hit(50, "One Piece 2"),
        ];

        let matched = find_best_match_with_parts(&results, "One Piece");
        let ids: Vec<i64> = matched.iter().map(|h| h.id).collect();

        // exact matches first by id, then the "part" entries; the bare "2"
        // (a later season, no part keyword) must not appear
        assert_eq!(ids, vec![10, 20, 30]);
    }

    #[test]
    fn best_match_accepts_italian_parte() {
        let results = vec![hit(2, "Vinland Saga Parte 2"), hit(1, "Vinland Saga")];
        let matched = find_best_match_with_parts(&results, "Vinland Saga");
        assert_eq!(matched.len(), 2);
        assert_eq!(matched[0].id, 1);
    }

    #[test]
    fn merges_parts_with_sequential_renumbering() {
        let part1: BTreeMap<u32, String> =
            (1..=13).map(|n| (n, format!("p1/{n}"))).collect();
        let part2: BTreeMap<u32, String> =
            (1..=12).map(|n| (n, format!("p2/{n}"))).collect();

        let merged = merge_parts(&[part1, part2]);

        assert_eq!(merged.len(), 25);
        assert_eq!(merged.get(&13).unwrap(), "p1/13");
        // episode 15 lands on part 2 episode 2
        assert_eq!(merged.get(&15).unwrap(), "p2/2");
        assert_eq!(merged.get(&25).unwrap(), "p2/12");
    }

    #[test]
    fn extracts_identifier_from_link() {
        assert_eq!(
            identifier_from_link("https://example.test/play/one-piece.12345"),
            Some("one-piece.12345".to_string())
        );
        assert_eq!(
            identifier_from_link("/play/sakamoto-days.ABC12?ref=1"),
            Some("sakamoto-days.ABC12".to_string())
        );
        assert_eq!(identifier_from_link("/other/path"), None);
    }

    #[test]
    fn parses_js_cookie_and_csrf() {
        let body = r#"
            <html><head>
            <meta name="csrf-token" content="tok-123">
            <script>document.cookie="SecurityAW-gp=abc123 ; path=/";</script>
            </head></html>
        "#;
        assert_eq!(
            parse_js_cookie(body),
            Some(("SecurityAW-gp".to_string(), "abc123".to_string()))
        );
        assert_eq!(parse_csrf_token(body), Some("tok-123".to_string()));
    }

    #[test]
    fn parses_episode_list_and_download_link() {
        let base = Url::parse("https://example.test").unwrap();
        let body = r#"
            <ul class="episodes">
              <li class="episode"><a data-episode-num="1" href="/play/show.1/ep-1">1</a></li>
              <li class="episode"><a data-episode-num="2" href="/play/show.1/ep-2">2</a></li>
              <li class="episode"><a data-episode-num="oops" href="/x">bad</a></li>
            </ul>
        "#;
        let episodes = parse_episode_list(body, &base);
        assert_eq!(episodes.len(), 2);
        assert_eq!(
            episodes.get(&2).unwrap(),
            "https://example.test/play/show.1/ep-2"
        );

        let page = r#"
            <div id="download"><center>
              <a download href="https://cdn.example.test/file.mp4">Download</a>
            </center></div>
        "#;
        assert_eq!(
            parse_download_link(page),
            Some("https://cdn.example.test/file.mp4".to_string())
        );
    }

    #[test]
    fn parses_filter_page() {
        let body = r#"
            <div class="film-list">
              <div class="item">
                <a class="name" data-jtitle="サカモトデイズ" href="/play/sakamoto-days.ABC12">Sakamoto Days</a>
              </div>
              <div class="item">
                <a class="name" href="/play/other.XYZ">Other Show</a>
              </div>
            </div>
        "#;
        let hits = parse_filter_page(body, false);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].identifier, "sakamoto-days.ABC12");
        assert_eq!(hits[0].jtitle.as_deref(), Some("サカモトデイズ"));
        assert!(!hits[0].dub);
    }

    #[test]
    fn parses_external_ids() {
        let body = r#"
            <a href="https://myanimelist.net/anime/55888">MAL</a>
            <a href="https://anilist.co/anime/177709">AniList</a>
        "#;
        assert_eq!(parse_external_ids(body), (Some(55888), Some(177709)));

        let attrs = r#"<div data-mal-id="10" data-anilist-id="20"></div>"#;
        assert_eq!(parse_external_ids(attrs), (Some(10), Some(20)));
    }
}
