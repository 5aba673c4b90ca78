use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "proxy_attempts")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub request_id: String,
    pub route_id: i64,
    pub provider_id: i64,
    pub dialect: String,
    pub mapped_model: String,
    pub status: String,
    pub started_at: OffsetDateTime,
    pub ended_at: Option<OffsetDateTime>,
    pub upstream_request: Option<Vec<u8>>,
    pub upstream_response: Option<Vec<u8>>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost_micro_usd: i64,
    pub error: Option<String>,
}

impl ActiveModelBehavior for ActiveModel {}
