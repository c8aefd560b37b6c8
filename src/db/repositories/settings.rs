use crate::entities::configs::{self, Entity as ConfigsEntity};
use anyhow::Result;
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set, sea_query::OnConflict,
};

use super::now_ts;

pub struct SettingsRepository {
    conn: DatabaseConnection,
}

impl SettingsRepository {
    #[must_use]
    pub const fn new(conn: DatabaseConnection) -> Self {
        Self { conn }
    }

    /// Returns the raw JSON-encoded value for a key.
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let row = ConfigsEntity::find()
            .filter(configs::Column::Key.eq(key))
            .one(&self.conn)
            .await?;
        Ok(row.map(|m| m.value))
    }

    pub async fn set(&self, key: &str, json_value: &str) -> Result<()> {
        let now = now_ts();
        let active = configs::ActiveModel {
            key: Set(key.to_string()),
            value: Set(json_value.to_string()),
            created_at: Set(now.clone()),
            updated_at: Set(now),
            ..Default::default()
        };

        ConfigsEntity::insert(active)
            .on_conflict(
                OnConflict::column(configs::Column::Key)
                    .update_columns([configs::Column::Value, configs::Column::UpdatedAt])
                    .to_owned(),
            )
            .exec(&self.conn)
            .await?;
        Ok(())
    }

    /// Inserts the value only when the key has no stored row yet.
    pub async fn seed(&self, key: &str, json_value: &str) -> Result<()> {
        if self.get(key).await?.is_none() {
            self.set(key, json_value).await?;
        }
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<(String, String)>> {
        let rows = ConfigsEntity::find().all(&self.conn).await?;
        Ok(rows.into_iter().map(|m| (m.key, m.value)).collect())
    }
}
