//! Runtime-mutable settings, persisted in the `configs` table.
//!
//! Values are stored JSON-encoded and decoded into typed accessors on read.
//! Reads go through a small in-process cache that is invalidated on every
//! write; defaults are seeded at startup so `list()` always returns the
//! complete key set.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use tracing::debug;

use crate::db::Store;
use crate::models::series::PreferredLanguage;

pub mod keys {
    pub const SONARR_URL: &str = "sonarr_url";
    pub const SONARR_TOKEN: &str = "sonarr_token";
    pub const SONARR_FILTER_ANIME_ONLY: &str = "sonarr_filter_anime_only";
    pub const SONARR_AUTO_RENAME: &str = "sonarr_auto_rename";
    pub const SONARR_TAGS_MODE: &str = "sonarr_tags_mode";
    pub const SONARR_TAGS: &str = "sonarr_tags";
    pub const ANIMEWORLD_BASE_URL: &str = "animeworld_base_url";
    pub const PREFERRED_LANGUAGE: &str = "preferred_language";
    pub const DOWNLOAD_MAX_WORKERS: &str = "download_max_workers";
    pub const CONCURRENT_DOWNLOADS: &str = "concurrent_downloads";
    pub const FETCHWANTED_INTERVAL: &str = "fetchwanted_interval";
    pub const UPDATEMETADATA_INTERVAL: &str = "updatemetadata_interval";
}

/// Default base URL of the source site.
pub const DEFAULT_ANIMEWORLD_URL: &str = "https://www.animeworld.ac";

/// Inclusion policy for the configured tag list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagsMode {
    #[default]
    Blacklist,
    Whitelist,
}

/// One library-manager tag selected in the settings UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagEntry {
    pub value: i32,
    pub label: String,
}

fn defaults() -> Vec<(&'static str, Value)> {
    vec![
        (keys::SONARR_URL, Value::Null),
        (keys::SONARR_TOKEN, Value::Null),
        (keys::SONARR_FILTER_ANIME_ONLY, json!(true)),
        (keys::SONARR_AUTO_RENAME, json!(true)),
        (keys::SONARR_TAGS_MODE, json!("blacklist")),
        (keys::SONARR_TAGS, json!([])),
        (keys::ANIMEWORLD_BASE_URL, json!(DEFAULT_ANIMEWORLD_URL)),
        (keys::PREFERRED_LANGUAGE, json!("sub")),
        (keys::DOWNLOAD_MAX_WORKERS, json!(3)),
        (keys::CONCURRENT_DOWNLOADS, json!(2)),
        (keys::FETCHWANTED_INTERVAL, json!(30)),
        (keys::UPDATEMETADATA_INTERVAL, json!(120)),
    ]
}

pub struct SettingsService {
    store: Store,
    cache: RwLock<HashMap<String, Value>>,
}

impl SettingsService {
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Seeds every recognized key that has no stored row yet.
    pub async fn initialize(&self) -> Result<()> {
        let repo = self.store.settings_repo();
        for (key, value) in defaults() {
            repo.seed(key, &value.to_string()).await?;
        }
        Ok(())
    }

    pub async fn get_value(&self, key: &str) -> Result<Value> {
        if let Some(value) = self.cache.read().await.get(key) {
            return Ok(value.clone());
        }

        let stored = self.store.settings_repo().get(key).await?;
        let value = match stored {
            Some(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("config value for '{key}' is not valid JSON"))?,
            None => defaults()
                .into_iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v)
                .unwrap_or(Value::Null),
        };

        self.cache
            .write()
            .await
            .insert(key.to_string(), value.clone());
        Ok(value)
    }

    /// Writes a value and invalidates the read cache. Hook dispatch for the
    /// Sonarr keys happens in the composition root, which wraps this call.
    pub async fn set_value(&self, key: &str, value: &Value) -> Result<()> {
        self.store.settings_repo().set(key, &value.to_string()).await?;
        self.cache.write().await.remove(key);
        debug!(key, "Setting updated");
        Ok(())
    }

    /// The merged view: defaults overlaid by every stored row.
    pub async fn list(&self) -> Result<BTreeMap<String, Value>> {
        let mut map: BTreeMap<String, Value> = defaults()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();

        for (key, raw) in self.store.settings_repo().list().await? {
            let value = serde_json::from_str(&raw).unwrap_or(Value::Null);
            map.insert(key, value);
        }
        Ok(map)
    }

    async fn get_string(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .get_value(key)
            .await?
            .as_str()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()))
    }

    async fn get_bool(&self, key: &str, fallback: bool) -> Result<bool> {
        Ok(self.get_value(key).await?.as_bool().unwrap_or(fallback))
    }

    async fn get_clamped(&self, key: &str, fallback: u32, min: u32, max: u32) -> Result<u32> {
        let raw = self
            .get_value(key)
            .await?
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(fallback);
        Ok(raw.clamp(min, max))
    }

    // ----- typed accessors -----

    /// Library-manager base URL with trailing slashes stripped.
    pub async fn sonarr_url(&self) -> Result<Option<String>> {
        Ok(self
            .get_string(keys::SONARR_URL)
            .await?
            .map(|u| u.trim_end_matches('/').to_string()))
    }

    pub async fn sonarr_token(&self) -> Result<Option<String>> {
        self.get_string(keys::SONARR_TOKEN).await
    }

    pub async fn anime_only(&self) -> Result<bool> {
        self.get_bool(keys::SONARR_FILTER_ANIME_ONLY, true).await
    }

    pub async fn auto_rename(&self) -> Result<bool> {
        self.get_bool(keys::SONARR_AUTO_RENAME, true).await
    }

    pub async fn tags_mode(&self) -> Result<TagsMode> {
        let value = self.get_value(keys::SONARR_TAGS_MODE).await?;
        Ok(serde_json::from_value(value).unwrap_or_default())
    }

    pub async fn tags(&self) -> Result<Vec<TagEntry>> {
        let value = self.get_value(keys::SONARR_TAGS).await?;
        Ok(serde_json::from_value(value).unwrap_or_default())
    }

    pub async fn animeworld_base_url(&self) -> Result<String> {
        Ok(self
            .get_string(keys::ANIMEWORLD_BASE_URL)
            .await?
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_ANIMEWORLD_URL.to_string()))
    }

    pub async fn preferred_language(&self) -> Result<PreferredLanguage> {
        let value = self.get_value(keys::PREFERRED_LANGUAGE).await?;
        Ok(value
            .as_str()
            .and_then(PreferredLanguage::parse)
            .unwrap_or_default())
    }

    /// Parallel byte-range workers per active download, clamped to 1..=10.
    pub async fn download_max_workers(&self) -> Result<usize> {
        Ok(self
            .get_clamped(keys::DOWNLOAD_MAX_WORKERS, 3, 1, 10)
            .await? as usize)
    }

    /// Parallel downloads in flight, clamped to 1..=10.
    pub async fn concurrent_downloads(&self) -> Result<usize> {
        Ok(self
            .get_clamped(keys::CONCURRENT_DOWNLOADS, 2, 1, 10)
            .await? as usize)
    }

    /// Interval of the `fetch_wanted` task, in minutes.
    pub async fn fetch_wanted_interval(&self) -> Result<u32> {
        self.get_clamped(keys::FETCHWANTED_INTERVAL, 30, 1, u32::MAX)
            .await
    }

    /// Interval of the `update_metadata` task, in minutes.
    pub async fn update_metadata_interval(&self) -> Result<u32> {
        self.get_clamped(keys::UPDATEMETADATA_INTERVAL, 120, 1, u32::MAX)
            .await
    }
}
