use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "failure_counts")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "failure_scope")]
    pub provider_id: i64,
    #[sea_orm(unique_key = "failure_scope")]
    pub dialect: String,
    #[sea_orm(unique_key = "failure_scope")]
    pub reason: String,
    pub count: i64,
    pub last_failure_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
