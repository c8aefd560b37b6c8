use crate::entities::series::{self, Entity as SeriesEntity};
use crate::models::series::{AlternateTitle, PreferredLanguage, Series, SeriesStatus};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
    sea_query::{Expr, OnConflict},
};
use tracing::debug;

use super::now_ts;

/// The synchroniser's view of a series, as reported by the library manager.
///
/// Locally-owned fields (`absolute`, `preferred_language`, poster state) are
/// deliberately absent: an upsert never touches them.
#[derive(Debug, Clone)]
pub struct SeriesUpsert {
    pub sonarr_id: i32,
    pub title: String,
    pub description: Option<String>,
    pub status: SeriesStatus,
    pub total_seasons: i32,
    pub year: Option<i32>,
    pub network: Option<String>,
    pub genres: Vec<String>,
    pub alternate_titles: Vec<AlternateTitle>,
    pub poster_url: Option<String>,
}

pub struct SeriesRepository {
    conn: DatabaseConnection,
}

impl SeriesRepository {
    #[must_use]
    pub const fn new(conn: DatabaseConnection) -> Self {
        Self { conn }
    }

    fn map_model(model: series::Model) -> Series {
        Series {
            id: model.id,
            sonarr_id: model.sonarr_id,
            title: model.title,
            alternate_titles: model
                .alternate_titles
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or_default(),
            description: model.description,
            status: SeriesStatus::parse(&model.status),
            total_seasons: model.total_seasons,
            year: model.year,
            network: model.network,
            genres: model
                .genres
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or_default(),
            preferred_language: model
                .preferred_language
                .as_deref()
                .and_then(PreferredLanguage::parse),
            absolute: model.absolute,
            poster_url: model.poster_url,
            poster_path: model.poster_path,
            poster_downloaded_at: model
                .poster_downloaded_at
                .as_deref()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
            deleted: model.deleted,
        }
    }

    pub async fn upsert(&self, up: &SeriesUpsert) -> Result<Series> {
        let now = now_ts();
        let active = series::ActiveModel {
            sonarr_id: Set(up.sonarr_id),
            title: Set(up.title.clone()),
            description: Set(up.description.clone()),
            status: Set(up.status.as_str().to_string()),
            total_seasons: Set(up.total_seasons),
            poster_url: Set(up.poster_url.clone()),
            alternate_titles: Set(Some(
                serde_json::to_string(&up.alternate_titles)
                    .context("serialize alternate titles")?,
            )),
            genres: Set(Some(
                serde_json::to_string(&up.genres).context("serialize genres")?,
            )),
            year: Set(up.year),
            network: Set(up.network.clone()),
            absolute: Set(false),
            deleted: Set(false),
            created_at: Set(now.clone()),
            updated_at: Set(now),
            ..Default::default()
        };

        SeriesEntity::insert(active)
            .on_conflict(
                OnConflict::column(series::Column::SonarrId)
                    .update_columns([
                        series::Column::Title,
                        series::Column::Description,
                        series::Column::Status,
                        series::Column::TotalSeasons,
                        series::Column::PosterUrl,
                        series::Column::AlternateTitles,
                        series::Column::Genres,
                        series::Column::Year,
                        series::Column::Network,
                        series::Column::Deleted,
                        series::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(&self.conn)
            .await?;

        debug!(sonarr_id = up.sonarr_id, title = %up.title, "Upserted series");

        self.get_by_sonarr_id(up.sonarr_id)
            .await?
            .context("series missing right after upsert")
    }

    pub async fn get(&self, id: i32) -> Result<Option<Series>> {
        let model = SeriesEntity::find_by_id(id).one(&self.conn).await?;
        Ok(model.map(Self::map_model))
    }

    pub async fn get_by_sonarr_id(&self, sonarr_id: i32) -> Result<Option<Series>> {
        let model = SeriesEntity::find()
            .filter(series::Column::SonarrId.eq(sonarr_id))
            .one(&self.conn)
            .await?;
        Ok(model.map(Self::map_model))
    }

    /// All series still reported by the library manager.
    pub async fn list_active(&self) -> Result<Vec<Series>> {
        let rows = SeriesEntity::find()
            .filter(series::Column::Deleted.eq(false))
            .order_by_asc(series::Column::Title)
            .all(&self.conn)
            .await?;
        Ok(rows.into_iter().map(Self::map_model).collect())
    }

    pub async fn list_all(&self) -> Result<Vec<Series>> {
        let rows = SeriesEntity::find()
            .order_by_asc(series::Column::Title)
            .all(&self.conn)
            .await?;
        Ok(rows.into_iter().map(Self::map_model).collect())
    }

    /// Soft-deletes every series whose `sonarr_id` the library manager no
    /// longer reports. Returns the ids of the series that were marked.
    pub async fn soft_delete_except(&self, keep_sonarr_ids: &[i32]) -> Result<Vec<i32>> {
        let stale = SeriesEntity::find()
            .filter(series::Column::Deleted.eq(false))
            .filter(series::Column::SonarrId.is_not_in(keep_sonarr_ids.iter().copied()))
            .all(&self.conn)
            .await?;

        let ids: Vec<i32> = stale.iter().map(|m| m.id).collect();
        if ids.is_empty() {
            return Ok(ids);
        }

        SeriesEntity::update_many()
            .col_expr(series::Column::Deleted, Expr::value(true))
            .col_expr(series::Column::UpdatedAt, Expr::value(now_ts()))
            .filter(series::Column::Id.is_in(ids.iter().copied()))
            .exec(&self.conn)
            .await?;

        Ok(ids)
    }

    pub async fn set_absolute(&self, id: i32, absolute: bool) -> Result<()> {
        SeriesEntity::update_many()
            .col_expr(series::Column::Absolute, Expr::value(absolute))
            .col_expr(series::Column::UpdatedAt, Expr::value(now_ts()))
            .filter(series::Column::Id.eq(id))
            .exec(&self.conn)
            .await?;
        Ok(())
    }

    pub async fn set_preferred_language(
        &self,
        id: i32,
        language: Option<PreferredLanguage>,
    ) -> Result<()> {
        SeriesEntity::update_many()
            .col_expr(
                series::Column::PreferredLanguage,
                Expr::value(language.map(|l| l.as_str().to_string())),
            )
            .col_expr(series::Column::UpdatedAt, Expr::value(now_ts()))
            .filter(series::Column::Id.eq(id))
            .exec(&self.conn)
            .await?;
        Ok(())
    }

    pub async fn update_poster(
        &self,
        id: i32,
        poster_path: &str,
        downloaded_at: DateTime<Utc>,
    ) -> Result<()> {
        SeriesEntity::update_many()
            .col_expr(
                series::Column::PosterPath,
                Expr::value(poster_path.to_string()),
            )
            .col_expr(
                series::Column::PosterDownloadedAt,
                Expr::value(downloaded_at.to_rfc3339()),
            )
            .col_expr(series::Column::UpdatedAt, Expr::value(now_ts()))
            .filter(series::Column::Id.eq(id))
            .exec(&self.conn)
            .await?;
        Ok(())
    }
}
