use async_trait::async_trait;
use sea_orm::{
    ActiveModelTrait, ActiveValue, ColumnTrait, Condition, ConnectionTrait, Database,
    DatabaseBackend, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Schema,
};
use time::OffsetDateTime;

use maxx_common::{CooldownReason, Dialect};

use crate::entities;
use crate::rows::{
    AntigravityQuotaRow, ApiTokenRow, CooldownRow, FailureCountRow, MappingScope, ModelMappingRow,
    ProjectRow, ProviderRow, ProxyAttemptRow, ProxyRequestRow, RetryConfigRow, RouteRow,
    SessionRow, StorageSnapshot,
};
use crate::storage::{Storage, StorageResult};

#[derive(Clone)]
pub struct SeaOrmStorage {
    db: DatabaseConnection,
}

impl SeaOrmStorage {
    pub async fn connect(dsn: &str) -> StorageResult<Self> {
        let db = Database::connect(dsn).await?;
        // Sqlite needs this for cascade + integrity.
        if db.get_database_backend() == DatabaseBackend::Sqlite {
            db.execute_unprepared("PRAGMA foreign_keys = ON").await?;
        }
        Ok(Self { db })
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

fn parse_dialect(value: &str) -> Option<Dialect> {
    value.parse().ok()
}

fn parse_reason(value: &str) -> CooldownReason {
    value.parse().unwrap_or(CooldownReason::Unknown)
}

fn provider_from_model(m: entities::providers::Model) -> Option<ProviderRow> {
    Some(ProviderRow {
        id: m.id,
        name: m.name,
        kind: m.kind.parse().ok()?,
        config_json: m.config_json,
        enabled: m.enabled,
        deleted_at: m.deleted_at,
        created_at: m.created_at,
        updated_at: m.updated_at,
    })
}

fn route_from_model(m: entities::routes::Model) -> Option<RouteRow> {
    Some(RouteRow {
        id: m.id,
        project_id: m.project_id,
        dialect: parse_dialect(&m.dialect)?,
        provider_id: m.provider_id,
        position: m.position,
        enabled: m.enabled,
        native: m.native,
        retry_config_id: m.retry_config_id,
        updated_at: m.updated_at,
    })
}

fn project_from_model(m: entities::projects::Model) -> ProjectRow {
    let enabled_dialects = serde_json::from_value::<Vec<String>>(m.enabled_dialects_json)
        .unwrap_or_default()
        .iter()
        .filter_map(|value| parse_dialect(value))
        .collect();
    ProjectRow {
        id: m.id,
        name: m.name,
        slug: m.slug,
        enabled_dialects,
        created_at: m.created_at,
        updated_at: m.updated_at,
    }
}

fn retry_config_from_model(m: entities::retry_configs::Model) -> RetryConfigRow {
    RetryConfigRow {
        id: m.id,
        name: m.name,
        max_retries: u32::try_from(m.max_retries).unwrap_or(0),
        initial_interval_ms: u64::try_from(m.initial_interval_ms).unwrap_or(0),
        backoff_rate: m.backoff_rate,
        max_interval_ms: u64::try_from(m.max_interval_ms).unwrap_or(0),
        is_default: m.is_default,
    }
}

fn mapping_from_model(m: entities::model_mappings::Model) -> ModelMappingRow {
    ModelMappingRow {
        id: m.id,
        priority: m.priority,
        pattern: m.pattern,
        target: m.target,
        dialect: m.dialect.as_deref().and_then(parse_dialect),
        provider_id: m.provider_id,
        project_id: m.project_id,
        route_id: m.route_id,
        token_id: m.token_id,
        enabled: m.enabled,
    }
}

fn cooldown_from_model(m: entities::cooldowns::Model) -> Option<CooldownRow> {
    Some(CooldownRow {
        provider_id: m.provider_id,
        dialect: parse_dialect(&m.dialect)?,
        until_time: m.until_time,
        reason: parse_reason(&m.reason),
        updated_at: m.updated_at,
    })
}

fn proxy_request_from_model(m: entities::proxy_requests::Model) -> Option<ProxyRequestRow> {
    Some(ProxyRequestRow {
        id: m.id,
        dialect: parse_dialect(&m.dialect)?,
        session_id: m.session_id,
        project_id: m.project_id,
        original_model: m.original_model,
        final_model: m.final_model,
        status: m.status.parse().ok()?,
        started_at: m.started_at,
        ended_at: m.ended_at,
        attempt_count: m.attempt_count,
        request_body: m.request_body,
        response_body: m.response_body,
        usage: maxx_common::UsageTotals {
            input_tokens: u64::try_from(m.input_tokens).unwrap_or(0),
            output_tokens: u64::try_from(m.output_tokens).unwrap_or(0),
            cache_read_input_tokens: u64::try_from(m.cache_read_input_tokens).unwrap_or(0),
            cache_creation_input_tokens: 0,
        },
        cost_micro_usd: m.cost_micro_usd,
        error: m.error,
    })
}

fn proxy_attempt_from_model(m: entities::proxy_attempts::Model) -> Option<ProxyAttemptRow> {
    Some(ProxyAttemptRow {
        id: m.id,
        request_id: m.request_id,
        route_id: m.route_id,
        provider_id: m.provider_id,
        dialect: parse_dialect(&m.dialect)?,
        mapped_model: m.mapped_model,
        status: m.status.parse().ok()?,
        started_at: m.started_at,
        ended_at: m.ended_at,
        upstream_request: m.upstream_request,
        upstream_response: m.upstream_response,
        usage: maxx_common::UsageTotals {
            input_tokens: u64::try_from(m.input_tokens).unwrap_or(0),
            output_tokens: u64::try_from(m.output_tokens).unwrap_or(0),
            cache_read_input_tokens: 0,
            cache_creation_input_tokens: 0,
        },
        cost_micro_usd: m.cost_micro_usd,
        error: m.error,
    })
}

fn proxy_request_active(row: &ProxyRequestRow) -> entities::proxy_requests::ActiveModel {
    entities::proxy_requests::ActiveModel {
        id: ActiveValue::Set(row.id.clone()),
        dialect: ActiveValue::Set(row.dialect.as_str().to_string()),
        session_id: ActiveValue::Set(row.session_id.clone()),
        project_id: ActiveValue::Set(row.project_id),
        original_model: ActiveValue::Set(row.original_model.clone()),
        final_model: ActiveValue::Set(row.final_model.clone()),
        status: ActiveValue::Set(row.status.as_str().to_string()),
        started_at: ActiveValue::Set(row.started_at),
        ended_at: ActiveValue::Set(row.ended_at),
        attempt_count: ActiveValue::Set(row.attempt_count),
        request_body: ActiveValue::Set(row.request_body.clone()),
        response_body: ActiveValue::Set(row.response_body.clone()),
        input_tokens: ActiveValue::Set(i64::try_from(row.usage.input_tokens).unwrap_or(i64::MAX)),
        output_tokens: ActiveValue::Set(i64::try_from(row.usage.output_tokens).unwrap_or(i64::MAX)),
        cache_read_input_tokens: ActiveValue::Set(
            i64::try_from(row.usage.cache_read_input_tokens).unwrap_or(i64::MAX),
        ),
        cost_micro_usd: ActiveValue::Set(row.cost_micro_usd),
        error: ActiveValue::Set(row.error.clone()),
    }
}

fn proxy_attempt_active(row: &ProxyAttemptRow) -> entities::proxy_attempts::ActiveModel {
    entities::proxy_attempts::ActiveModel {
        id: ActiveValue::Set(row.id.clone()),
        request_id: ActiveValue::Set(row.request_id.clone()),
        route_id: ActiveValue::Set(row.route_id),
        provider_id: ActiveValue::Set(row.provider_id),
        dialect: ActiveValue::Set(row.dialect.as_str().to_string()),
        mapped_model: ActiveValue::Set(row.mapped_model.clone()),
        status: ActiveValue::Set(row.status.as_str().to_string()),
        started_at: ActiveValue::Set(row.started_at),
        ended_at: ActiveValue::Set(row.ended_at),
        upstream_request: ActiveValue::Set(row.upstream_request.clone()),
        upstream_response: ActiveValue::Set(row.upstream_response.clone()),
        input_tokens: ActiveValue::Set(i64::try_from(row.usage.input_tokens).unwrap_or(i64::MAX)),
        output_tokens: ActiveValue::Set(i64::try_from(row.usage.output_tokens).unwrap_or(i64::MAX)),
        cost_micro_usd: ActiveValue::Set(row.cost_micro_usd),
        error: ActiveValue::Set(row.error.clone()),
    }
}

#[async_trait]
impl Storage for SeaOrmStorage {
    async fn sync(&self) -> StorageResult<()> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::Providers)
            .register(entities::Routes)
            .register(entities::Projects)
            .register(entities::Sessions)
            .register(entities::RetryConfigs)
            .register(entities::ModelMappings)
            .register(entities::Cooldowns)
            .register(entities::FailureCounts)
            .register(entities::AntigravityQuotas)
            .register(entities::Settings)
            .register(entities::ApiTokens)
            .register(entities::ProxyRequests)
            .register(entities::ProxyAttempts)
            .sync(&self.db)
            .await?;
        Ok(())
    }

    async fn load_snapshot(&self) -> StorageResult<StorageSnapshot> {
        use entities::providers::Column as ProviderColumn;

        let providers = entities::Providers::find()
            .filter(ProviderColumn::DeletedAt.is_null())
            .all(&self.db)
            .await?
            .into_iter()
            .filter_map(provider_from_model)
            .collect();
        let routes = entities::Routes::find()
            .all(&self.db)
            .await?
            .into_iter()
            .filter_map(route_from_model)
            .collect();
        let projects = entities::Projects::find()
            .all(&self.db)
            .await?
            .into_iter()
            .map(project_from_model)
            .collect();
        let retry_configs = entities::RetryConfigs::find()
            .all(&self.db)
            .await?
            .into_iter()
            .map(retry_config_from_model)
            .collect();
        let model_mappings = entities::ModelMappings::find()
            .order_by_asc(entities::model_mappings::Column::Priority)
            .order_by_asc(entities::model_mappings::Column::Id)
            .all(&self.db)
            .await?
            .into_iter()
            .map(mapping_from_model)
            .collect();
        let api_tokens = entities::ApiTokens::find()
            .all(&self.db)
            .await?
            .into_iter()
            .map(|m| ApiTokenRow {
                id: m.id,
                token: m.token,
                name: m.name,
                enabled: m.enabled,
                created_at: m.created_at,
            })
            .collect();
        let settings = entities::Settings::find()
            .all(&self.db)
            .await?
            .into_iter()
            .map(|m| (m.key, m.value))
            .collect();

        Ok(StorageSnapshot {
            providers,
            routes,
            projects,
            retry_configs,
            model_mappings,
            api_tokens,
            settings,
        })
    }

    async fn get_provider(&self, id: i64) -> StorageResult<Option<ProviderRow>> {
        let row = entities::Providers::find_by_id(id).one(&self.db).await?;
        Ok(row
            .filter(|m| m.deleted_at.is_none())
            .and_then(provider_from_model))
    }

    async fn upsert_provider(&self, row: &ProviderRow) -> StorageResult<i64> {
        let active = entities::providers::ActiveModel {
            id: if row.id == 0 {
                ActiveValue::NotSet
            } else {
                ActiveValue::Set(row.id)
            },
            name: ActiveValue::Set(row.name.clone()),
            kind: ActiveValue::Set(row.kind.as_str().to_string()),
            config_json: ActiveValue::Set(row.config_json.clone()),
            enabled: ActiveValue::Set(row.enabled),
            deleted_at: ActiveValue::Set(row.deleted_at),
            created_at: ActiveValue::Set(row.created_at),
            updated_at: ActiveValue::Set(row.updated_at),
        };
        if row.id == 0 {
            let inserted = active.insert(&self.db).await?;
            Ok(inserted.id)
        } else {
            active.update(&self.db).await?;
            Ok(row.id)
        }
    }

    async fn soft_delete_provider(&self, id: i64) -> StorageResult<()> {
        let Some(model) = entities::Providers::find_by_id(id).one(&self.db).await? else {
            return Ok(());
        };
        let mut active: entities::providers::ActiveModel = model.into();
        active.deleted_at = ActiveValue::Set(Some(OffsetDateTime::now_utc()));
        active.update(&self.db).await?;
        Ok(())
    }

    async fn get_route(&self, id: i64) -> StorageResult<Option<RouteRow>> {
        let row = entities::Routes::find_by_id(id).one(&self.db).await?;
        Ok(row.and_then(route_from_model))
    }

    async fn list_routes(
        &self,
        dialect: Dialect,
        project_id: i64,
    ) -> StorageResult<Vec<RouteRow>> {
        use entities::routes::Column;
        let rows = entities::Routes::find()
            .filter(Column::Dialect.eq(dialect.as_str()))
            .filter(Column::ProjectId.eq(project_id))
            .filter(Column::Enabled.eq(true))
            .order_by_asc(Column::Position)
            .all(&self.db)
            .await?;
        Ok(rows.into_iter().filter_map(route_from_model).collect())
    }

    async fn upsert_route(&self, row: &RouteRow) -> StorageResult<i64> {
        let active = entities::routes::ActiveModel {
            id: if row.id == 0 {
                ActiveValue::NotSet
            } else {
                ActiveValue::Set(row.id)
            },
            project_id: ActiveValue::Set(row.project_id),
            dialect: ActiveValue::Set(row.dialect.as_str().to_string()),
            provider_id: ActiveValue::Set(row.provider_id),
            position: ActiveValue::Set(row.position),
            enabled: ActiveValue::Set(row.enabled),
            native: ActiveValue::Set(row.native),
            retry_config_id: ActiveValue::Set(row.retry_config_id),
            updated_at: ActiveValue::Set(row.updated_at),
        };
        if row.id == 0 {
            Ok(active.insert(&self.db).await?.id)
        } else {
            active.update(&self.db).await?;
            Ok(row.id)
        }
    }

    async fn delete_route(&self, id: i64) -> StorageResult<()> {
        entities::Routes::delete_by_id(id).exec(&self.db).await?;
        Ok(())
    }

    async fn get_project(&self, id: i64) -> StorageResult<Option<ProjectRow>> {
        let row = entities::Projects::find_by_id(id).one(&self.db).await?;
        Ok(row.map(project_from_model))
    }

    async fn find_project_by_slug(&self, slug: &str) -> StorageResult<Option<ProjectRow>> {
        use entities::projects::Column;
        let row = entities::Projects::find()
            .filter(Column::Slug.eq(slug))
            .one(&self.db)
            .await?;
        Ok(row.map(project_from_model))
    }

    async fn upsert_project(&self, row: &ProjectRow) -> StorageResult<i64> {
        let enabled = serde_json::to_value(
            row.enabled_dialects
                .iter()
                .map(|d| d.as_str())
                .collect::<Vec<_>>(),
        )?;
        let active = entities::projects::ActiveModel {
            id: if row.id == 0 {
                ActiveValue::NotSet
            } else {
                ActiveValue::Set(row.id)
            },
            name: ActiveValue::Set(row.name.clone()),
            slug: ActiveValue::Set(row.slug.clone()),
            enabled_dialects_json: ActiveValue::Set(enabled),
            created_at: ActiveValue::Set(row.created_at),
            updated_at: ActiveValue::Set(row.updated_at),
        };
        if row.id == 0 {
            Ok(active.insert(&self.db).await?.id)
        } else {
            active.update(&self.db).await?;
            Ok(row.id)
        }
    }

    async fn delete_project(&self, id: i64) -> StorageResult<()> {
        entities::Projects::delete_by_id(id).exec(&self.db).await?;
        Ok(())
    }

    async fn get_session(&self, id: &str) -> StorageResult<Option<SessionRow>> {
        let row = entities::Sessions::find_by_id(id.to_string())
            .one(&self.db)
            .await?;
        Ok(row.map(|m| SessionRow {
            id: m.id,
            project_id: m.project_id,
            created_at: m.created_at,
            last_seen_at: m.last_seen_at,
        }))
    }

    async fn upsert_session(&self, row: &SessionRow) -> StorageResult<()> {
        let existing = entities::Sessions::find_by_id(row.id.clone())
            .one(&self.db)
            .await?;
        let active = entities::sessions::ActiveModel {
            id: ActiveValue::Set(row.id.clone()),
            project_id: ActiveValue::Set(row.project_id),
            created_at: ActiveValue::Set(row.created_at),
            last_seen_at: ActiveValue::Set(row.last_seen_at),
        };
        if existing.is_some() {
            active.update(&self.db).await?;
        } else {
            active.insert(&self.db).await?;
        }
        Ok(())
    }

    async fn bind_session_project(&self, session_id: &str, project_id: i64) -> StorageResult<()> {
        let Some(model) = entities::Sessions::find_by_id(session_id.to_string())
            .one(&self.db)
            .await?
        else {
            return Ok(());
        };
        let mut active: entities::sessions::ActiveModel = model.into();
        active.project_id = ActiveValue::Set(Some(project_id));
        active.update(&self.db).await?;
        Ok(())
    }

    async fn delete_session(&self, id: &str) -> StorageResult<()> {
        entities::Sessions::delete_by_id(id.to_string())
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn get_retry_config(&self, id: i64) -> StorageResult<Option<RetryConfigRow>> {
        let row = entities::RetryConfigs::find_by_id(id).one(&self.db).await?;
        Ok(row.map(retry_config_from_model))
    }

    async fn default_retry_config(&self) -> StorageResult<Option<RetryConfigRow>> {
        use entities::retry_configs::Column;
        let row = entities::RetryConfigs::find()
            .filter(Column::IsDefault.eq(true))
            .one(&self.db)
            .await?;
        Ok(row.map(retry_config_from_model))
    }

    async fn upsert_retry_config(&self, row: &RetryConfigRow) -> StorageResult<i64> {
        let active = entities::retry_configs::ActiveModel {
            id: if row.id == 0 {
                ActiveValue::NotSet
            } else {
                ActiveValue::Set(row.id)
            },
            name: ActiveValue::Set(row.name.clone()),
            max_retries: ActiveValue::Set(i32::try_from(row.max_retries).unwrap_or(0)),
            initial_interval_ms: ActiveValue::Set(
                i64::try_from(row.initial_interval_ms).unwrap_or(0),
            ),
            backoff_rate: ActiveValue::Set(row.backoff_rate),
            max_interval_ms: ActiveValue::Set(i64::try_from(row.max_interval_ms).unwrap_or(0)),
            is_default: ActiveValue::Set(row.is_default),
        };
        if row.id == 0 {
            Ok(active.insert(&self.db).await?.id)
        } else {
            active.update(&self.db).await?;
            Ok(row.id)
        }
    }

    async fn list_model_mappings(
        &self,
        scope: &MappingScope,
    ) -> StorageResult<Vec<ModelMappingRow>> {
        use entities::model_mappings::Column;

        fn scope_condition<C: ColumnTrait, V: Into<sea_orm::Value>>(
            column: C,
            value: Option<V>,
        ) -> Condition {
            match value {
                Some(value) => Condition::any()
                    .add(column.is_null())
                    .add(column.eq(value)),
                None => Condition::any().add(column.is_null()),
            }
        }

        let rows = entities::ModelMappings::find()
            .filter(Column::Enabled.eq(true))
            .filter(scope_condition(
                Column::Dialect,
                scope.dialect.map(|d| d.as_str()),
            ))
            .filter(scope_condition(Column::ProviderId, scope.provider_id))
            .filter(scope_condition(Column::ProjectId, scope.project_id))
            .filter(scope_condition(Column::RouteId, scope.route_id))
            .filter(scope_condition(Column::TokenId, scope.token_id))
            .order_by_asc(Column::Priority)
            .order_by_asc(Column::Id)
            .all(&self.db)
            .await?;
        Ok(rows.into_iter().map(mapping_from_model).collect())
    }

    async fn upsert_model_mapping(&self, row: &ModelMappingRow) -> StorageResult<i64> {
        let active = entities::model_mappings::ActiveModel {
            id: if row.id == 0 {
                ActiveValue::NotSet
            } else {
                ActiveValue::Set(row.id)
            },
            priority: ActiveValue::Set(row.priority),
            pattern: ActiveValue::Set(row.pattern.clone()),
            target: ActiveValue::Set(row.target.clone()),
            dialect: ActiveValue::Set(row.dialect.map(|d| d.as_str().to_string())),
            provider_id: ActiveValue::Set(row.provider_id),
            project_id: ActiveValue::Set(row.project_id),
            route_id: ActiveValue::Set(row.route_id),
            token_id: ActiveValue::Set(row.token_id),
            enabled: ActiveValue::Set(row.enabled),
        };
        if row.id == 0 {
            Ok(active.insert(&self.db).await?.id)
        } else {
            active.update(&self.db).await?;
            Ok(row.id)
        }
    }

    async fn delete_model_mapping(&self, id: i64) -> StorageResult<()> {
        entities::ModelMappings::delete_by_id(id)
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn get_cooldown(
        &self,
        provider_id: i64,
        dialect: Dialect,
    ) -> StorageResult<Option<CooldownRow>> {
        use entities::cooldowns::Column;
        let row = entities::Cooldowns::find()
            .filter(Column::ProviderId.eq(provider_id))
            .filter(Column::Dialect.eq(dialect.as_str()))
            .one(&self.db)
            .await?;
        Ok(row.and_then(cooldown_from_model))
    }

    async fn upsert_cooldown(&self, row: &CooldownRow) -> StorageResult<()> {
        use entities::cooldowns::Column;
        let existing = entities::Cooldowns::find()
            .filter(Column::ProviderId.eq(row.provider_id))
            .filter(Column::Dialect.eq(row.dialect.as_str()))
            .one(&self.db)
            .await?;
        match existing {
            Some(model) => {
                let mut active: entities::cooldowns::ActiveModel = model.into();
                active.until_time = ActiveValue::Set(row.until_time);
                active.reason = ActiveValue::Set(row.reason.as_str().to_string());
                active.updated_at = ActiveValue::Set(row.updated_at);
                active.update(&self.db).await?;
            }
            None => {
                let active = entities::cooldowns::ActiveModel {
                    id: ActiveValue::NotSet,
                    provider_id: ActiveValue::Set(row.provider_id),
                    dialect: ActiveValue::Set(row.dialect.as_str().to_string()),
                    until_time: ActiveValue::Set(row.until_time),
                    reason: ActiveValue::Set(row.reason.as_str().to_string()),
                    updated_at: ActiveValue::Set(row.updated_at),
                };
                active.insert(&self.db).await?;
            }
        }
        Ok(())
    }

    async fn delete_cooldown(&self, provider_id: i64, dialect: Dialect) -> StorageResult<()> {
        use entities::cooldowns::Column;
        entities::Cooldowns::delete_many()
            .filter(Column::ProviderId.eq(provider_id))
            .filter(Column::Dialect.eq(dialect.as_str()))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn list_cooldowns(&self) -> StorageResult<Vec<CooldownRow>> {
        let rows = entities::Cooldowns::find().all(&self.db).await?;
        Ok(rows.into_iter().filter_map(cooldown_from_model).collect())
    }

    async fn get_failure_count(
        &self,
        provider_id: i64,
        dialect: Dialect,
        reason: CooldownReason,
    ) -> StorageResult<Option<FailureCountRow>> {
        use entities::failure_counts::Column;
        let row = entities::FailureCounts::find()
            .filter(Column::ProviderId.eq(provider_id))
            .filter(Column::Dialect.eq(dialect.as_str()))
            .filter(Column::Reason.eq(reason.as_str()))
            .one(&self.db)
            .await?;
        Ok(row.map(|m| FailureCountRow {
            provider_id: m.provider_id,
            dialect,
            reason,
            count: m.count,
            last_failure_at: m.last_failure_at,
        }))
    }

    async fn increment_failure_count(
        &self,
        provider_id: i64,
        dialect: Dialect,
        reason: CooldownReason,
        at: OffsetDateTime,
    ) -> StorageResult<i64> {
        use entities::failure_counts::Column;
        let existing = entities::FailureCounts::find()
            .filter(Column::ProviderId.eq(provider_id))
            .filter(Column::Dialect.eq(dialect.as_str()))
            .filter(Column::Reason.eq(reason.as_str()))
            .one(&self.db)
            .await?;
        match existing {
            Some(model) => {
                let next = model.count + 1;
                let mut active: entities::failure_counts::ActiveModel = model.into();
                active.count = ActiveValue::Set(next);
                active.last_failure_at = ActiveValue::Set(at);
                active.update(&self.db).await?;
                Ok(next)
            }
            None => {
                let active = entities::failure_counts::ActiveModel {
                    id: ActiveValue::NotSet,
                    provider_id: ActiveValue::Set(provider_id),
                    dialect: ActiveValue::Set(dialect.as_str().to_string()),
                    reason: ActiveValue::Set(reason.as_str().to_string()),
                    count: ActiveValue::Set(1),
                    last_failure_at: ActiveValue::Set(at),
                };
                active.insert(&self.db).await?;
                Ok(1)
            }
        }
    }

    async fn reset_failure_counts(&self, provider_id: i64, dialect: Dialect) -> StorageResult<()> {
        use entities::failure_counts::Column;
        entities::FailureCounts::delete_many()
            .filter(Column::ProviderId.eq(provider_id))
            .filter(Column::Dialect.eq(dialect.as_str()))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn get_antigravity_quota(
        &self,
        email: &str,
    ) -> StorageResult<Option<AntigravityQuotaRow>> {
        use entities::antigravity_quotas::Column;
        let row = entities::AntigravityQuotas::find()
            .filter(Column::Email.eq(email))
            .one(&self.db)
            .await?;
        Ok(row.map(|m| AntigravityQuotaRow {
            email: m.email,
            payload_json: m.payload_json,
            updated_at: m.updated_at,
        }))
    }

    async fn upsert_antigravity_quota(&self, row: &AntigravityQuotaRow) -> StorageResult<()> {
        use entities::antigravity_quotas::Column;
        let existing = entities::AntigravityQuotas::find()
            .filter(Column::Email.eq(row.email.as_str()))
            .one(&self.db)
            .await?;
        match existing {
            Some(model) => {
                let mut active: entities::antigravity_quotas::ActiveModel = model.into();
                active.payload_json = ActiveValue::Set(row.payload_json.clone());
                active.updated_at = ActiveValue::Set(row.updated_at);
                active.update(&self.db).await?;
            }
            None => {
                let active = entities::antigravity_quotas::ActiveModel {
                    id: ActiveValue::NotSet,
                    email: ActiveValue::Set(row.email.clone()),
                    payload_json: ActiveValue::Set(row.payload_json.clone()),
                    updated_at: ActiveValue::Set(row.updated_at),
                };
                active.insert(&self.db).await?;
            }
        }
        Ok(())
    }

    async fn get_setting(&self, key: &str) -> StorageResult<Option<String>> {
        use entities::settings::Column;
        let row = entities::Settings::find()
            .filter(Column::Key.eq(key))
            .one(&self.db)
            .await?;
        Ok(row.map(|m| m.value))
    }

    async fn set_setting(&self, key: &str, value: &str) -> StorageResult<()> {
        use entities::settings::Column;
        let existing = entities::Settings::find()
            .filter(Column::Key.eq(key))
            .one(&self.db)
            .await?;
        match existing {
            Some(model) => {
                let mut active: entities::settings::ActiveModel = model.into();
                active.value = ActiveValue::Set(value.to_string());
                active.updated_at = ActiveValue::Set(OffsetDateTime::now_utc());
                active.update(&self.db).await?;
            }
            None => {
                let active = entities::settings::ActiveModel {
                    id: ActiveValue::NotSet,
                    key: ActiveValue::Set(key.to_string()),
                    value: ActiveValue::Set(value.to_string()),
                    updated_at: ActiveValue::Set(OffsetDateTime::now_utc()),
                };
                active.insert(&self.db).await?;
            }
        }
        Ok(())
    }

    async fn find_api_token(&self, token: &str) -> StorageResult<Option<ApiTokenRow>> {
        use entities::api_tokens::Column;
        let row = entities::ApiTokens::find()
            .filter(Column::Token.eq(token))
            .filter(Column::Enabled.eq(true))
            .one(&self.db)
            .await?;
        Ok(row.map(|m| ApiTokenRow {
            id: m.id,
            token: m.token,
            name: m.name,
            enabled: m.enabled,
            created_at: m.created_at,
        }))
    }

    async fn upsert_api_token(&self, row: &ApiTokenRow) -> StorageResult<i64> {
        let active = entities::api_tokens::ActiveModel {
            id: if row.id == 0 {
                ActiveValue::NotSet
            } else {
                ActiveValue::Set(row.id)
            },
            token: ActiveValue::Set(row.token.clone()),
            name: ActiveValue::Set(row.name.clone()),
            enabled: ActiveValue::Set(row.enabled),
            created_at: ActiveValue::Set(row.created_at),
        };
        if row.id == 0 {
            Ok(active.insert(&self.db).await?.id)
        } else {
            active.update(&self.db).await?;
            Ok(row.id)
        }
    }

    async fn insert_proxy_request(&self, row: &ProxyRequestRow) -> StorageResult<()> {
        proxy_request_active(row).insert(&self.db).await?;
        Ok(())
    }

    async fn update_proxy_request(&self, row: &ProxyRequestRow) -> StorageResult<()> {
        proxy_request_active(row).update(&self.db).await?;
        Ok(())
    }

    async fn get_proxy_request(&self, id: &str) -> StorageResult<Option<ProxyRequestRow>> {
        let row = entities::ProxyRequests::find_by_id(id.to_string())
            .one(&self.db)
            .await?;
        Ok(row.and_then(proxy_request_from_model))
    }

    async fn insert_proxy_attempt(&self, row: &ProxyAttemptRow) -> StorageResult<()> {
        proxy_attempt_active(row).insert(&self.db).await?;
        Ok(())
    }

    async fn update_proxy_attempt(&self, row: &ProxyAttemptRow) -> StorageResult<()> {
        proxy_attempt_active(row).update(&self.db).await?;
        Ok(())
    }

    async fn list_proxy_attempts(&self, request_id: &str) -> StorageResult<Vec<ProxyAttemptRow>> {
        use entities::proxy_attempts::Column;
        let rows = entities::ProxyAttempts::find()
            .filter(Column::RequestId.eq(request_id))
            .order_by_asc(Column::StartedAt)
            .all(&self.db)
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(proxy_attempt_from_model)
            .collect())
    }
}
