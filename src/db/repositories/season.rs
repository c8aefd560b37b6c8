use crate::entities::seasons::{self, Entity as SeasonsEntity};
use crate::models::series::{Season, SeasonStatus};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
    sea_query::{Expr, OnConflict},
};

use super::now_ts;

/// The synchroniser's view of one season. `download_urls` is absent on
/// purpose: matching results are written through [`SeasonRepository::set_download_urls`]
/// and an upsert never clobbers them.
#[derive(Debug, Clone)]
pub struct SeasonUpsert {
    pub series_id: i32,
    pub season_number: i32,
    pub title: Option<String>,
    pub total_episodes: i32,
    pub missing_episodes: i32,
    pub status: SeasonStatus,
    pub release_date: Option<DateTime<Utc>>,
}

pub struct SeasonRepository {
    conn: DatabaseConnection,
}

impl SeasonRepository {
    #[must_use]
    pub const fn new(conn: DatabaseConnection) -> Self {
        Self { conn }
    }

    fn map_model(model: seasons::Model) -> Season {
        Season {
            id: model.id,
            series_id: model.series_id,
            season_number: model.season_number,
            title: model.title,
            total_episodes: model.total_episodes,
            missing_episodes: model.missing_episodes,
            status: SeasonStatus::parse(&model.status),
            download_urls: model
                .download_urls
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or_default(),
            release_date: model
                .release_date
                .as_deref()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
            deleted: model.deleted,
        }
    }

    pub async fn upsert(&self, up: &SeasonUpsert) -> Result<Season> {
        let now = now_ts();
        let active = seasons::ActiveModel {
            series_id: Set(up.series_id),
            season_number: Set(up.season_number),
            title: Set(up.title.clone()),
            total_episodes: Set(up.total_episodes),
            missing_episodes: Set(up.missing_episodes),
            status: Set(up.status.as_str().to_string()),
            release_date: Set(up.release_date.map(|dt| dt.to_rfc3339())),
            deleted: Set(false),
            created_at: Set(now.clone()),
            updated_at: Set(now),
            ..Default::default()
        };

        SeasonsEntity::insert(active)
            .on_conflict(
                OnConflict::columns([seasons::Column::SeriesId, seasons::Column::SeasonNumber])
                    .update_columns([
                        seasons::Column::Title,
                        seasons::Column::TotalEpisodes,
                        seasons::Column::MissingEpisodes,
                        seasons::Column::Status,
                        seasons::Column::ReleaseDate,
                        seasons::Column::Deleted,
                        seasons::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(&self.conn)
            .await?;

        self.find(up.series_id, up.season_number)
            .await?
            .context("season missing right after upsert")
    }

    pub async fn get(&self, id: i32) -> Result<Option<Season>> {
        let model = SeasonsEntity::find_by_id(id).one(&self.conn).await?;
        Ok(model.map(Self::map_model))
    }

    pub async fn find(&self, series_id: i32, season_number: i32) -> Result<Option<Season>> {
        let model = SeasonsEntity::find()
            .filter(seasons::Column::SeriesId.eq(series_id))
            .filter(seasons::Column::SeasonNumber.eq(season_number))
            .one(&self.conn)
            .await?;
        Ok(model.map(Self::map_model))
    }

    /// Non-deleted seasons of a series, in season order.
    pub async fn list_for_series(&self, series_id: i32) -> Result<Vec<Season>> {
        let rows = SeasonsEntity::find()
            .filter(seasons::Column::SeriesId.eq(series_id))
            .filter(seasons::Column::Deleted.eq(false))
            .order_by_asc(seasons::Column::SeasonNumber)
            .all(&self.conn)
            .await?;
        Ok(rows.into_iter().map(Self::map_model).collect())
    }

    pub async fn set_download_urls(&self, season_id: i32, urls: &[String]) -> Result<()> {
        SeasonsEntity::update_many()
            .col_expr(
                seasons::Column::DownloadUrls,
                Expr::value(serde_json::to_string(urls).context("serialize download urls")?),
            )
            .col_expr(seasons::Column::UpdatedAt, Expr::value(now_ts()))
            .filter(seasons::Column::Id.eq(season_id))
            .exec(&self.conn)
            .await?;
        Ok(())
    }

    /// Soft-deletes seasons of a series that the library manager no longer
    /// reports (or that fell out of the monitored set).
    pub async fn soft_delete_except(&self, series_id: i32, keep_numbers: &[i32]) -> Result<u64> {
        let res = SeasonsEntity::update_many()
            .col_expr(seasons::Column::Deleted, Expr::value(true))
            .col_expr(seasons::Column::UpdatedAt, Expr::value(now_ts()))
            .filter(seasons::Column::SeriesId.eq(series_id))
            .filter(seasons::Column::Deleted.eq(false))
            .filter(seasons::Column::SeasonNumber.is_not_in(keep_numbers.iter().copied()))
            .exec(&self.conn)
            .await?;
        Ok(res.rows_affected)
    }

    /// Soft-deletes every season belonging to the given series ids; used when
    /// the series themselves disappear from the library manager.
    pub async fn soft_delete_for_series(&self, series_ids: &[i32]) -> Result<u64> {
        if series_ids.is_empty() {
            return Ok(0);
        }
        let res = SeasonsEntity::update_many()
            .col_expr(seasons::Column::Deleted, Expr::value(true))
            .col_expr(seasons::Column::UpdatedAt, Expr::value(now_ts()))
            .filter(seasons::Column::SeriesId.is_in(series_ids.iter().copied()))
            .filter(seasons::Column::Deleted.eq(false))
            .exec(&self.conn)
            .await?;
        Ok(res.rows_affected)
    }
}
