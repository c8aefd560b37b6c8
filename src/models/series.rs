use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A series monitored by the library manager, mirrored into the local store.
///
/// Created and updated only by the metadata synchroniser; soft-deleted when
/// the library manager stops reporting it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Series {
    pub id: i32,
    pub sonarr_id: i32,
    pub title: String,
    pub alternate_titles: Vec<AlternateTitle>,
    pub description: Option<String>,
    pub status: SeriesStatus,
    pub total_seasons: i32,
    pub year: Option<i32>,
    pub network: Option<String>,
    pub genres: Vec<String>,
    /// Per-series override; falls back to the global setting when `None`.
    pub preferred_language: Option<PreferredLanguage>,
    /// Episodes of this series are numbered absolutely across all seasons.
    /// User-owned; the synchroniser never overwrites it.
    pub absolute: bool,
    pub poster_url: Option<String>,
    pub poster_path: Option<String>,
    pub poster_downloaded_at: Option<DateTime<Utc>>,
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlternateTitle {
    pub title: String,
    /// Scene season this title applies to; negative means "all seasons".
    pub scene_season_number: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeriesStatus {
    Ongoing,
    Completed,
    Cancelled,
}

impl SeriesStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ongoing => "ongoing",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "completed" => Self::Completed,
            "cancelled" => Self::Cancelled,
            _ => Self::Ongoing,
        }
    }

    /// Maps the library manager's status vocabulary onto ours.
    #[must_use]
    pub fn from_sonarr(s: &str) -> Self {
        match s {
            "ended" => Self::Completed,
            "deleted" => Self::Cancelled,
            _ => Self::Ongoing,
        }
    }
}

impl fmt::Display for SeriesStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audio language preference used when resolving a season on the source site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreferredLanguage {
    Dub,
    #[default]
    Sub,
    DubFallbackSub,
}

impl PreferredLanguage {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dub => "dub",
            Self::Sub => "sub",
            Self::DubFallbackSub => "dub_fallback_sub",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "dub" => Some(Self::Dub),
            "sub" => Some(Self::Sub),
            "dub_fallback_sub" => Some(Self::DubFallbackSub),
            _ => None,
        }
    }

    /// Whether dubbed results are wanted at all under this preference.
    #[must_use]
    pub const fn wants_dub(self) -> bool {
        matches!(self, Self::Dub | Self::DubFallbackSub)
    }

    /// Whether subbed results are wanted at all under this preference.
    #[must_use]
    pub const fn wants_sub(self) -> bool {
        matches!(self, Self::Sub | Self::DubFallbackSub)
    }
}

impl fmt::Display for PreferredLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One season of a monitored series.
///
/// `download_urls` is the ordered list of source-site identifiers covering
/// the season; split-cour seasons have one entry per part, in air-date order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Season {
    pub id: i32,
    pub series_id: i32,
    pub season_number: i32,
    pub title: Option<String>,
    pub total_episodes: i32,
    pub missing_episodes: i32,
    pub status: SeasonStatus,
    pub download_urls: Vec<String>,
    pub release_date: Option<DateTime<Utc>>,
    pub deleted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeasonStatus {
    NotStarted,
    Downloading,
    Completed,
}

impl SeasonStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "downloading" => Self::Downloading,
            "completed" => Self::Completed,
            _ => Self::NotStarted,
        }
    }

    /// Derives the season status from aired/downloaded counts.
    #[must_use]
    pub const fn derive(aired: i32, downloaded: i32) -> Self {
        if aired > 0 && downloaded >= aired {
            Self::Completed
        } else if downloaded > 0 {
            Self::Downloading
        } else {
            Self::NotStarted
        }
    }
}

impl fmt::Display for SeasonStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A download root known to the library manager, with the optional local
/// remapping of its path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootFolder {
    pub id: i32,
    pub sonarr_id: i32,
    /// The path as the library manager sees it.
    pub path: String,
    /// The same folder as this process sees it, when they differ.
    pub mapped_path: Option<String>,
    pub accessible: bool,
    pub free_space: Option<i64>,
    pub total_space: Option<i64>,
}

impl RootFolder {
    /// Translates a library-manager path into the process-local view using
    /// the longest matching root-folder prefix. Returns the input unchanged
    /// when no folder matches or the match has no mapping.
    #[must_use]
    pub fn remap<'a>(folders: &[Self], remote_path: &'a str) -> (String, bool) {
        let best = folders
            .iter()
            .filter(|f| remote_path.starts_with(f.path.as_str()))
            .max_by_key(|f| f.path.len());

        match best {
            Some(folder) => match &folder.mapped_path {
                Some(mapped) => {
                    let rest = &remote_path[folder.path.len()..];
                    (format!("{}{}", mapped.trim_end_matches('/'), rest), true)
                }
                None => (remote_path.to_string(), true),
            },
            None => (remote_path.to_string(), false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn season_status_derivation() {
        assert_eq!(SeasonStatus::derive(12, 0), SeasonStatus::NotStarted);
        assert_eq!(SeasonStatus::derive(12, 5), SeasonStatus::Downloading);
        assert_eq!(SeasonStatus::derive(12, 12), SeasonStatus::Completed);
        assert_eq!(SeasonStatus::derive(0, 0), SeasonStatus::NotStarted);
    }

    #[test]
    fn language_round_trip() {
        for lang in [
            PreferredLanguage::Dub,
            PreferredLanguage::Sub,
            PreferredLanguage::DubFallbackSub,
        ] {
            assert_eq!(PreferredLanguage::parse(lang.as_str()), Some(lang));
        }
        assert_eq!(PreferredLanguage::parse("raw"), None);
    }

    #[test]
    fn root_folder_remap_prefers_longest_prefix() {
        let folders = vec![
            RootFolder {
                id: 1,
                sonarr_id: 1,
                path: "/tv".to_string(),
                mapped_path: Some("/mnt/tv".to_string()),
                accessible: true,
                free_space: None,
                total_space: None,
            },
            RootFolder {
                id: 2,
                sonarr_id: 2,
                path: "/tv/anime".to_string(),
                mapped_path: Some("/mnt/anime".to_string()),
                accessible: true,
                free_space: None,
                total_space: None,
            },
        ];

        let (mapped, matched) = RootFolder::remap(&folders, "/tv/anime/One Piece");
        assert!(matched);
        assert_eq!(mapped, "/mnt/anime/One Piece");

        let (unmapped, matched) = RootFolder::remap(&folders, "/movies/Akira");
        assert!(!matched);
        assert_eq!(unmapped, "/movies/Akira");
    }
}
