use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "series")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    #[sea_orm(unique)]
    pub sonarr_id: i32,
    pub title: String,
    pub description: Option<String>,
    pub status: String,
    pub total_seasons: i32,
    pub poster_url: Option<String>,
    pub poster_path: Option<String>,
    pub poster_downloaded_at: Option<String>,
    /// JSON array of `{title, scene_season_number}` objects.
    pub alternate_titles: Option<String>,
    /// JSON array of strings.
    pub genres: Option<String>,
    pub year: Option<i32>,
    pub network: Option<String>,
    pub preferred_language: Option<String>,
    pub absolute: bool,
    pub deleted: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::seasons::Entity")]
    Seasons,
}

impl Related<super::seasons::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Seasons.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
