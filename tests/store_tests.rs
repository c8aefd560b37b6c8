//! Store round-trips against an in-memory database.

use animarr::db::{RootFolderUpsert, SeasonUpsert, SeriesUpsert, Store};
use animarr::models::series::{AlternateTitle, SeasonStatus, SeriesStatus};
use animarr::settings::{SettingsService, keys};
use serde_json::json;

async fn memory_store() -> Store {
    // One connection: every pooled connection would otherwise get its own
    // private in-memory database.
    Store::with_pool_options("sqlite::memory:", 1, 1)
        .await
        .expect("in-memory store")
}

fn series_upsert(sonarr_id: i32, title: &str) -> SeriesUpsert {
    SeriesUpsert {
        sonarr_id,
        title: title.to_string(),
        description: Some("A test show".to_string()),
        status: SeriesStatus::Ongoing,
        total_seasons: 1,
        year: Some(2025),
        network: Some("Tokyo MX".to_string()),
        genres: vec!["Action".to_string()],
        alternate_titles: vec![AlternateTitle {
            title: format!("{title} ALT"),
            scene_season_number: Some(-1),
        }],
        poster_url: None,
    }
}

fn season_upsert(series_id: i32, number: i32, aired: i32, downloaded: i32) -> SeasonUpsert {
    SeasonUpsert {
        series_id,
        season_number: number,
        title: Some(format!("Season {number}")),
        total_episodes: aired,
        missing_episodes: (aired - downloaded).max(0),
        status: SeasonStatus::derive(aired, downloaded),
        release_date: None,
    }
}

#[tokio::test]
async fn series_round_trip_and_idempotent_upsert() {
    let store = memory_store().await;

    let first = store.upsert_series(&series_upsert(100, "Sakamoto Days")).await.unwrap();
    assert_eq!(first.sonarr_id, 100);
    assert_eq!(first.title, "Sakamoto Days");
    assert_eq!(first.alternate_titles.len(), 1);
    assert!(!first.deleted);
    assert!(!first.absolute);

    // Second upsert with identical data keeps the row and its id.
    let second = store.upsert_series(&series_upsert(100, "Sakamoto Days")).await.unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(store.list_series().await.unwrap().len(), 1);
}

#[tokio::test]
async fn upsert_preserves_locally_owned_fields() {
    let store = memory_store().await;

    let series = store.upsert_series(&series_upsert(7, "One Piece")).await.unwrap();
    store.set_series_absolute(series.id, true).await.unwrap();

    // A later sync must not clobber the user's absolute flag.
    let resynced = store.upsert_series(&series_upsert(7, "One Piece")).await.unwrap();
    assert!(resynced.absolute);
}

#[tokio::test]
async fn season_urls_survive_resync_and_keep_order() {
    let store = memory_store().await;
    let series = store.upsert_series(&series_upsert(1, "Sakamoto Days")).await.unwrap();

    let season = store
        .upsert_season(&season_upsert(series.id, 1, 12, 3))
        .await
        .unwrap();
    assert_eq!(season.status, SeasonStatus::Downloading);
    assert_eq!(season.missing_episodes, 9);
    assert!(season.download_urls.is_empty());

    let urls = vec![
        "sakamoto-days.ABC12".to_string(),
        "sakamoto-days-part-2.DEF34".to_string(),
    ];
    store.set_season_download_urls(season.id, &urls).await.unwrap();

    // A re-sync updates the counts but never the matched identifiers.
    let resynced = store
        .upsert_season(&season_upsert(series.id, 1, 12, 12))
        .await
        .unwrap();
    assert_eq!(resynced.id, season.id);
    assert_eq!(resynced.status, SeasonStatus::Completed);
    assert_eq!(resynced.download_urls, urls);
}

#[tokio::test]
async fn soft_delete_closure_covers_series_and_their_seasons() {
    let store = memory_store().await;

    let kept = store.upsert_series(&series_upsert(1, "Kept")).await.unwrap();
    let dropped = store.upsert_series(&series_upsert(2, "Dropped")).await.unwrap();
    store.upsert_season(&season_upsert(kept.id, 1, 12, 0)).await.unwrap();
    store.upsert_season(&season_upsert(dropped.id, 1, 12, 0)).await.unwrap();

    let removed = store.soft_delete_series_except(&[1]).await.unwrap();
    assert_eq!(removed, 1);

    // Soft-deleted, not gone: still present for audit, never surfaced.
    assert_eq!(store.list_series().await.unwrap().len(), 1);
    assert_eq!(store.list_all_series().await.unwrap().len(), 2);
    assert!(store.get_series(dropped.id).await.unwrap().unwrap().deleted);
    assert!(store.list_seasons(dropped.id).await.unwrap().is_empty());

    // A series that comes back is undeleted by the next upsert.
    let revived = store.upsert_series(&series_upsert(2, "Dropped")).await.unwrap();
    assert!(!revived.deleted);
}

#[tokio::test]
async fn stale_seasons_are_soft_deleted_per_series() {
    let store = memory_store().await;
    let series = store.upsert_series(&series_upsert(1, "Show")).await.unwrap();

    store.upsert_season(&season_upsert(series.id, 1, 12, 0)).await.unwrap();
    store.upsert_season(&season_upsert(series.id, 2, 12, 0)).await.unwrap();

    store.soft_delete_seasons_except(series.id, &[1]).await.unwrap();

    let remaining = store.list_seasons(series.id).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].season_number, 1);
}

#[tokio::test]
async fn root_folder_mapping_survives_resync() {
    let store = memory_store().await;

    let upsert = RootFolderUpsert {
        sonarr_id: 3,
        path: "/tv/anime".to_string(),
        accessible: true,
        free_space: Some(1_000_000),
        total_space: Some(2_000_000),
    };
    store.upsert_root_folder(&upsert).await.unwrap();

    let folder = store.list_root_folders().await.unwrap().remove(0);
    store
        .set_root_folder_mapping(folder.id, Some("/mnt/anime"))
        .await
        .unwrap();

    store.upsert_root_folder(&upsert).await.unwrap();
    let folder = store.list_root_folders().await.unwrap().remove(0);
    assert_eq!(folder.mapped_path.as_deref(), Some("/mnt/anime"));

    store.remove_root_folders_except(&[]).await.unwrap();
    assert!(store.list_root_folders().await.unwrap().is_empty());
}

#[tokio::test]
async fn settings_defaults_and_writes() {
    let store = memory_store().await;
    let settings = SettingsService::new(store);
    settings.initialize().await.unwrap();

    // defaults
    assert_eq!(settings.sonarr_url().await.unwrap(), None);
    assert!(settings.anime_only().await.unwrap());
    assert!(settings.auto_rename().await.unwrap());
    assert_eq!(settings.download_max_workers().await.unwrap(), 3);
    assert_eq!(settings.concurrent_downloads().await.unwrap(), 2);
    assert_eq!(settings.fetch_wanted_interval().await.unwrap(), 30);
    assert_eq!(settings.update_metadata_interval().await.unwrap(), 120);

    // the merged view exposes every recognized key
    let listed = settings.list().await.unwrap();
    assert!(listed.contains_key(keys::SONARR_URL));
    assert!(listed.contains_key(keys::PREFERRED_LANGUAGE));
    assert_eq!(listed.len(), 12);

    // writes invalidate the cache immediately
    settings
        .set_value(keys::SONARR_URL, &json!("http://localhost:8989///"))
        .await
        .unwrap();
    assert_eq!(
        settings.sonarr_url().await.unwrap().as_deref(),
        Some("http://localhost:8989")
    );

    // out-of-range worker counts clamp instead of erroring
    settings
        .set_value(keys::DOWNLOAD_MAX_WORKERS, &json!(99))
        .await
        .unwrap();
    assert_eq!(settings.download_max_workers().await.unwrap(), 10);
}
