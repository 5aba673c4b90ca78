use async_trait::async_trait;
use time::OffsetDateTime;

use maxx_common::{CooldownReason, Dialect};

use crate::rows::{
    AntigravityQuotaRow, ApiTokenRow, CooldownRow, FailureCountRow, MappingScope, ModelMappingRow,
    ProjectRow, ProviderRow, ProxyAttemptRow, ProxyRequestRow, RetryConfigRow, RouteRow,
    SessionRow, StorageSnapshot,
};

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("db error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("serde json error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Persistence contract of the gateway.
///
/// The hot path reads routes/mappings/settings from in-memory snapshots;
/// the trait is hit for request/attempt records, cooldowns and counters.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Entity-first schema sync, run once at bootstrap.
    async fn sync(&self) -> StorageResult<()>;

    async fn load_snapshot(&self) -> StorageResult<StorageSnapshot>;

    // Providers (soft delete via deleted_at).
    async fn get_provider(&self, id: i64) -> StorageResult<Option<ProviderRow>>;
    async fn upsert_provider(&self, row: &ProviderRow) -> StorageResult<i64>;
    async fn soft_delete_provider(&self, id: i64) -> StorageResult<()>;

    // Routes.
    async fn get_route(&self, id: i64) -> StorageResult<Option<RouteRow>>;
    /// Enabled routes for (dialect, project), ordered by position.
    async fn list_routes(&self, dialect: Dialect, project_id: i64)
    -> StorageResult<Vec<RouteRow>>;
    async fn upsert_route(&self, row: &RouteRow) -> StorageResult<i64>;
    async fn delete_route(&self, id: i64) -> StorageResult<()>;

    // Projects.
    async fn get_project(&self, id: i64) -> StorageResult<Option<ProjectRow>>;
    async fn find_project_by_slug(&self, slug: &str) -> StorageResult<Option<ProjectRow>>;
    async fn upsert_project(&self, row: &ProjectRow) -> StorageResult<i64>;
    async fn delete_project(&self, id: i64) -> StorageResult<()>;

    // Sessions.
    async fn get_session(&self, id: &str) -> StorageResult<Option<SessionRow>>;
    async fn upsert_session(&self, row: &SessionRow) -> StorageResult<()>;
    async fn bind_session_project(&self, session_id: &str, project_id: i64) -> StorageResult<()>;
    async fn delete_session(&self, id: &str) -> StorageResult<()>;

    // Retry configs.
    async fn get_retry_config(&self, id: i64) -> StorageResult<Option<RetryConfigRow>>;
    async fn default_retry_config(&self) -> StorageResult<Option<RetryConfigRow>>;
    async fn upsert_retry_config(&self, row: &RetryConfigRow) -> StorageResult<i64>;

    // Model mappings, filtered by scope, ordered by (priority, id).
    async fn list_model_mappings(
        &self,
        scope: &MappingScope,
    ) -> StorageResult<Vec<ModelMappingRow>>;
    async fn upsert_model_mapping(&self, row: &ModelMappingRow) -> StorageResult<i64>;
    async fn delete_model_mapping(&self, id: i64) -> StorageResult<()>;

    // Cooldowns.
    async fn get_cooldown(
        &self,
        provider_id: i64,
        dialect: Dialect,
    ) -> StorageResult<Option<CooldownRow>>;
    async fn upsert_cooldown(&self, row: &CooldownRow) -> StorageResult<()>;
    async fn delete_cooldown(&self, provider_id: i64, dialect: Dialect) -> StorageResult<()>;
    async fn list_cooldowns(&self) -> StorageResult<Vec<CooldownRow>>;

    // Failure counters.
    async fn get_failure_count(
        &self,
        provider_id: i64,
        dialect: Dialect,
        reason: CooldownReason,
    ) -> StorageResult<Option<FailureCountRow>>;
    /// Increment and return the new count.
    async fn increment_failure_count(
        &self,
        provider_id: i64,
        dialect: Dialect,
        reason: CooldownReason,
        at: OffsetDateTime,
    ) -> StorageResult<i64>;
    async fn reset_failure_counts(&self, provider_id: i64, dialect: Dialect) -> StorageResult<()>;

    // Antigravity quotas, keyed by account email.
    async fn get_antigravity_quota(&self, email: &str)
    -> StorageResult<Option<AntigravityQuotaRow>>;
    async fn upsert_antigravity_quota(&self, row: &AntigravityQuotaRow) -> StorageResult<()>;

    // Settings.
    async fn get_setting(&self, key: &str) -> StorageResult<Option<String>>;
    async fn set_setting(&self, key: &str, value: &str) -> StorageResult<()>;

    // API tokens.
    async fn find_api_token(&self, token: &str) -> StorageResult<Option<ApiTokenRow>>;
    async fn upsert_api_token(&self, row: &ApiTokenRow) -> StorageResult<i64>;

    // Proxy request / attempt records.
    async fn insert_proxy_request(&self, row: &ProxyRequestRow) -> StorageResult<()>;
    async fn update_proxy_request(&self, row: &ProxyRequestRow) -> StorageResult<()>;
    async fn get_proxy_request(&self, id: &str) -> StorageResult<Option<ProxyRequestRow>>;
    async fn insert_proxy_attempt(&self, row: &ProxyAttemptRow) -> StorageResult<()>;
    async fn update_proxy_attempt(&self, row: &ProxyAttemptRow) -> StorageResult<()>;
    async fn list_proxy_attempts(&self, request_id: &str) -> StorageResult<Vec<ProxyAttemptRow>>;
}
