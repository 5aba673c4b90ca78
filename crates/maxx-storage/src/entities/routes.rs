use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "routes")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    /// 0 means global scope.
    pub project_id: i64,
    pub dialect: String,
    pub provider_id: i64,
    pub position: i32,
    pub enabled: bool,
    pub native: bool,
    pub retry_config_id: Option<i64>,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
