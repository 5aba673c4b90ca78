use sea_orm::entity::prelude::*;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "retry_configs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub name: String,
    pub max_retries: i32,
    pub initial_interval_ms: i64,
    pub backoff_rate: f64,
    pub max_interval_ms: i64,
    pub is_default: bool,
}

impl ActiveModelBehavior for ActiveModel {}
