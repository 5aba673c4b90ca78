use sea_orm::entity::prelude::*;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "model_mappings")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub priority: i64,
    pub pattern: String,
    pub target: String,
    /// Empty scope columns match all requests.
    pub dialect: Option<String>,
    pub provider_id: Option<i64>,
    pub project_id: Option<i64>,
    pub route_id: Option<i64>,
    pub token_id: Option<i64>,
    pub enabled: bool,
}

impl ActiveModelBehavior for ActiveModel {}
