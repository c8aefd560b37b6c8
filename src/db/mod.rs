use anyhow::Result;
use chrono::{DateTime, Utc};
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, Statement};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::models::series::{PreferredLanguage, RootFolder, Season, Series};

pub mod migrator;
pub mod repositories;

pub use repositories::root_folder::RootFolderUpsert;
pub use repositories::season::SeasonUpsert;
pub use repositories::series::SeriesUpsert;

#[derive(Clone)]
pub struct Store {
    pub conn: DatabaseConnection,
}

impl Store {
    pub async fn new(db_url: &str) -> Result<Self> {
        Self::with_pool_options(db_url, 5, 1).await
    }

    pub async fn with_pool_options(
        db_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self> {
        use sea_orm_migration::MigratorTrait;

        if !db_url.contains(":memory:") {
            let path_str = db_url.trim_start_matches("sqlite:");
            if let Some(parent) = Path::new(path_str).parent() {
                tokio::fs::create_dir_all(parent).await.ok();
            }
            if !Path::new(path_str).exists() {
                std::fs::File::create(path_str)?;
            }
        }

        let mut opt = ConnectOptions::new(db_url.to_string());
        opt.max_connections(max_connections)
            .min_connections(min_connections)
            .connect_timeout(Duration::from_secs(10))
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(300))
            .max_lifetime(Duration::from_secs(600))
            .sqlx_logging(false);

        let conn = Database::connect(opt).await?;

        migrator::Migrator::up(&conn, None).await?;

        info!(
            "Database connected & migrations applied (pool: {}-{})",
            min_connections, max_connections
        );

        Ok(Self { conn })
    }

    pub async fn ping(&self) -> Result<()> {
        let backend = self.conn.get_database_backend();
        self.conn
            .query_one(Statement::from_string(backend, "SELECT 1".to_string()))
            .await?;
        Ok(())
    }

    fn series_repo(&self) -> repositories::series::SeriesRepository {
        repositories::series::SeriesRepository::new(self.conn.clone())
    }

    fn season_repo(&self) -> repositories::season::SeasonRepository {
        repositories::season::SeasonRepository::new(self.conn.clone())
    }

    fn root_folder_repo(&self) -> repositories::root_folder::RootFolderRepository {
        repositories::root_folder::RootFolderRepository::new(self.conn.clone())
    }

    pub(crate) fn settings_repo(&self) -> repositories::settings::SettingsRepository {
        repositories::settings::SettingsRepository::new(self.conn.clone())
    }

    // ----- series -----

    pub async fn upsert_series(&self, up: &SeriesUpsert) -> Result<Series> {
        self.series_repo().upsert(up).await
    }

    pub async fn get_series(&self, id: i32) -> Result<Option<Series>> {
        self.series_repo().get(id).await
    }

    pub async fn get_series_by_sonarr_id(&self, sonarr_id: i32) -> Result<Option<Series>> {
        self.series_repo().get_by_sonarr_id(sonarr_id).await
    }

    pub async fn list_series(&self) -> Result<Vec<Series>> {
        self.series_repo().list_active().await
    }

    pub async fn list_all_series(&self) -> Result<Vec<Series>> {
        self.series_repo().list_all().await
    }

    /// Marks everything the library manager no longer reports as deleted,
    /// seasons included. Returns the number of series affected.
    pub async fn soft_delete_series_except(&self, keep_sonarr_ids: &[i32]) -> Result<usize> {
        let ids = self
            .series_repo()
            .soft_delete_except(keep_sonarr_ids)
            .await?;
        self.season_repo().soft_delete_for_series(&ids).await?;
        Ok(ids.len())
    }

    pub async fn set_series_absolute(&self, id: i32, absolute: bool) -> Result<()> {
        self.series_repo().set_absolute(id, absolute).await
    }

    pub async fn set_series_preferred_language(
        &self,
        id: i32,
        language: Option<PreferredLanguage>,
    ) -> Result<()> {
        self.series_repo()
            .set_preferred_language(id, language)
            .await
    }

    pub async fn update_series_poster(
        &self,
        id: i32,
        poster_path: &str,
        downloaded_at: DateTime<Utc>,
    ) -> Result<()> {
        self.series_repo()
            .update_poster(id, poster_path, downloaded_at)
            .await
    }

    // ----- seasons -----

    pub async fn upsert_season(&self, up: &SeasonUpsert) -> Result<Season> {
        self.season_repo().upsert(up).await
    }

    pub async fn get_season(&self, id: i32) -> Result<Option<Season>> {
        self.season_repo().get(id).await
    }

    pub async fn find_season(&self, series_id: i32, season_number: i32) -> Result<Option<Season>> {
        self.season_repo().find(series_id, season_number).await
    }

    pub async fn list_seasons(&self, series_id: i32) -> Result<Vec<Season>> {
        self.season_repo().list_for_series(series_id).await
    }

    pub async fn set_season_download_urls(&self, season_id: i32, urls: &[String]) -> Result<()> {
        self.season_repo().set_download_urls(season_id, urls).await
    }

    pub async fn soft_delete_seasons_except(
        &self,
        series_id: i32,
        keep_numbers: &[i32],
    ) -> Result<u64> {
        self.season_repo()
            .soft_delete_except(series_id, keep_numbers)
            .await
    }

    // ----- root folders -----

    pub async fn upsert_root_folder(&self, up: &RootFolderUpsert) -> Result<()> {
        self.root_folder_repo().upsert(up).await
    }

    pub async fn list_root_folders(&self) -> Result<Vec<RootFolder>> {
        self.root_folder_repo().list().await
    }

    pub async fn set_root_folder_mapping(&self, id: i32, mapped_path: Option<&str>) -> Result<()> {
        self.root_folder_repo()
            .set_mapped_path(id, mapped_path)
            .await
    }

    pub async fn remove_root_folders_except(&self, keep_sonarr_ids: &[i32]) -> Result<u64> {
        self.root_folder_repo()
            .remove_except(keep_sonarr_ids)
            .await
    }
}
