use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "sessions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub project_id: Option<i64>,
    pub created_at: OffsetDateTime,
    pub last_seen_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
