use crate::entities::root_folders::{self, Entity as RootFoldersEntity};
use crate::models::series::RootFolder;
use anyhow::Result;
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
    sea_query::{Expr, OnConflict},
};

use super::now_ts;

#[derive(Debug, Clone)]
pub struct RootFolderUpsert {
    pub sonarr_id: i32,
    pub path: String,
    pub accessible: bool,
    pub free_space: Option<i64>,
    pub total_space: Option<i64>,
}

pub struct RootFolderRepository {
    conn: DatabaseConnection,
}

impl RootFolderRepository {
    #[must_use]
    pub const fn new(conn: DatabaseConnection) -> Self {
        Self { conn }
    }

    fn map_model(model: root_folders::Model) -> RootFolder {
        RootFolder {
            id: model.id,
            sonarr_id: model.sonarr_id,
            path: model.path,
            mapped_path: model.mapped_path,
            accessible: model.accessible,
            free_space: model.free_space,
            total_space: model.total_space,
        }
    }

    /// Upsert keyed on the library manager's folder id; the locally-owned
    /// `mapped_path` survives.
    pub async fn upsert(&self, up: &RootFolderUpsert) -> Result<()> {
        let now = now_ts();
        let active = root_folders::ActiveModel {
            sonarr_id: Set(up.sonarr_id),
            path: Set(up.path.clone()),
            accessible: Set(up.accessible),
            free_space: Set(up.free_space),
            total_space: Set(up.total_space),
            created_at: Set(now.clone()),
            updated_at: Set(now),
            ..Default::default()
        };

        RootFoldersEntity::insert(active)
            .on_conflict(
                OnConflict::column(root_folders::Column::SonarrId)
                    .update_columns([
                        root_folders::Column::Path,
                        root_folders::Column::Accessible,
                        root_folders::Column::FreeSpace,
                        root_folders::Column::TotalSpace,
                        root_folders::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(&self.conn)
            .await?;
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<RootFolder>> {
        let rows = RootFoldersEntity::find()
            .order_by_asc(root_folders::Column::Path)
            .all(&self.conn)
            .await?;
        Ok(rows.into_iter().map(Self::map_model).collect())
    }

    pub async fn set_mapped_path(&self, id: i32, mapped_path: Option<&str>) -> Result<()> {
        RootFoldersEntity::update_many()
            .col_expr(
                root_folders::Column::MappedPath,
                Expr::value(mapped_path.map(str::to_string)),
            )
            .col_expr(root_folders::Column::UpdatedAt, Expr::value(now_ts()))
            .filter(root_folders::Column::Id.eq(id))
            .exec(&self.conn)
            .await?;
        Ok(())
    }

    pub async fn remove_except(&self, keep_sonarr_ids: &[i32]) -> Result<u64> {
        let res = RootFoldersEntity::delete_many()
            .filter(root_folders::Column::SonarrId.is_not_in(keep_sonarr_ids.iter().copied()))
            .exec(&self.conn)
            .await?;
        Ok(res.rows_affected)
    }
}
