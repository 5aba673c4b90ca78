use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use time::OffsetDateTime;

use maxx_common::{CooldownReason, Dialect};

use crate::rows::{
    AntigravityQuotaRow, ApiTokenRow, CooldownRow, FailureCountRow, MappingScope, ModelMappingRow,
    ProjectRow, ProviderRow, ProxyAttemptRow, ProxyRequestRow, RetryConfigRow, RouteRow,
    SessionRow, StorageSnapshot,
};
use crate::storage::{Storage, StorageResult};

/// In-process storage backing unit tests and the zero-config dev mode.
#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    next_id: i64,
    providers: Vec<ProviderRow>,
    routes: Vec<RouteRow>,
    projects: Vec<ProjectRow>,
    sessions: HashMap<String, SessionRow>,
    retry_configs: Vec<RetryConfigRow>,
    model_mappings: Vec<ModelMappingRow>,
    cooldowns: HashMap<(i64, Dialect), CooldownRow>,
    failure_counts: HashMap<(i64, Dialect, CooldownReason), FailureCountRow>,
    quotas: HashMap<String, AntigravityQuotaRow>,
    settings: HashMap<String, String>,
    api_tokens: Vec<ApiTokenRow>,
    proxy_requests: HashMap<String, ProxyRequestRow>,
    proxy_attempts: Vec<ProxyAttemptRow>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let mut inner = self.inner.lock().expect("memory storage lock");
        f(&mut inner)
    }

    fn next_id(inner: &mut Inner) -> i64 {
        inner.next_id += 1;
        inner.next_id
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn sync(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn load_snapshot(&self) -> StorageResult<StorageSnapshot> {
        Ok(self.with(|inner| StorageSnapshot {
            providers: inner
                .providers
                .iter()
                .filter(|p| p.deleted_at.is_none())
                .cloned()
                .collect(),
            routes: inner.routes.clone(),
            projects: inner.projects.clone(),
            retry_configs: inner.retry_configs.clone(),
            model_mappings: inner.model_mappings.clone(),
            api_tokens: inner.api_tokens.clone(),
            settings: inner
                .settings
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }))
    }

    async fn get_provider(&self, id: i64) -> StorageResult<Option<ProviderRow>> {
        Ok(self.with(|inner| {
            inner
                .providers
                .iter()
                .find(|p| p.id == id && p.deleted_at.is_none())
                .cloned()
        }))
    }

    async fn upsert_provider(&self, row: &ProviderRow) -> StorageResult<i64> {
        Ok(self.with(|inner| {
            if let Some(existing) = inner.providers.iter_mut().find(|p| p.id == row.id) {
                *existing = row.clone();
                return row.id;
            }
            let mut row = row.clone();
            if row.id == 0 {
                row.id = Self::next_id(inner);
            }
            let id = row.id;
            inner.providers.push(row);
            id
        }))
    }

    async fn soft_delete_provider(&self, id: i64) -> StorageResult<()> {
        self.with(|inner| {
            if let Some(p) = inner.providers.iter_mut().find(|p| p.id == id) {
                p.deleted_at = Some(OffsetDateTime::now_utc());
            }
        });
        Ok(())
    }

    async fn get_route(&self, id: i64) -> StorageResult<Option<RouteRow>> {
        Ok(self.with(|inner| inner.routes.iter().find(|r| r.id == id).cloned()))
    }

    async fn list_routes(
        &self,
        dialect: Dialect,
        project_id: i64,
    ) -> StorageResult<Vec<RouteRow>> {
        Ok(self.with(|inner| {
            let mut routes: Vec<RouteRow> = inner
                .routes
                .iter()
                .filter(|r| r.enabled && r.dialect == dialect && r.project_id == project_id)
                .cloned()
                .collect();
            routes.sort_by_key(|r| r.position);
            routes
        }))
    }

    async fn upsert_route(&self, row: &RouteRow) -> StorageResult<i64> {
        Ok(self.with(|inner| {
            if let Some(existing) = inner.routes.iter_mut().find(|r| r.id == row.id) {
                *existing = row.clone();
                return row.id;
            }
            let mut row = row.clone();
            if row.id == 0 {
                row.id = Self::next_id(inner);
            }
            let id = row.id;
            inner.routes.push(row);
            id
        }))
    }

    async fn delete_route(&self, id: i64) -> StorageResult<()> {
        self.with(|inner| inner.routes.retain(|r| r.id != id));
        Ok(())
    }

    async fn get_project(&self, id: i64) -> StorageResult<Option<ProjectRow>> {
        Ok(self.with(|inner| inner.projects.iter().find(|p| p.id == id).cloned()))
    }

    async fn find_project_by_slug(&self, slug: &str) -> StorageResult<Option<ProjectRow>> {
        Ok(self.with(|inner| inner.projects.iter().find(|p| p.slug == slug).cloned()))
    }

    async fn upsert_project(&self, row: &ProjectRow) -> StorageResult<i64> {
        Ok(self.with(|inner| {
            if let Some(existing) = inner.projects.iter_mut().find(|p| p.id == row.id) {
                *existing = row.clone();
                return row.id;
            }
            let mut row = row.clone();
            if row.id == 0 {
                row.id = Self::next_id(inner);
            }
            let id = row.id;
            inner.projects.push(row);
            id
        }))
    }

    async fn delete_project(&self, id: i64) -> StorageResult<()> {
        self.with(|inner| inner.projects.retain(|p| p.id != id));
        Ok(())
    }

    async fn get_session(&self, id: &str) -> StorageResult<Option<SessionRow>> {
        Ok(self.with(|inner| inner.sessions.get(id).cloned()))
    }

    async fn upsert_session(&self, row: &SessionRow) -> StorageResult<()> {
        self.with(|inner| inner.sessions.insert(row.id.clone(), row.clone()));
        Ok(())
    }

    async fn bind_session_project(&self, session_id: &str, project_id: i64) -> StorageResult<()> {
        self.with(|inner| {
            if let Some(session) = inner.sessions.get_mut(session_id) {
                session.project_id = Some(project_id);
            }
        });
        Ok(())
    }

    async fn delete_session(&self, id: &str) -> StorageResult<()> {
        self.with(|inner| inner.sessions.remove(id));
        Ok(())
    }

    async fn get_retry_config(&self, id: i64) -> StorageResult<Option<RetryConfigRow>> {
        Ok(self.with(|inner| inner.retry_configs.iter().find(|c| c.id == id).cloned()))
    }

    async fn default_retry_config(&self) -> StorageResult<Option<RetryConfigRow>> {
        Ok(self.with(|inner| inner.retry_configs.iter().find(|c| c.is_default).cloned()))
    }

    async fn upsert_retry_config(&self, row: &RetryConfigRow) -> StorageResult<i64> {
        Ok(self.with(|inner| {
            if let Some(existing) = inner.retry_configs.iter_mut().find(|c| c.id == row.id) {
                *existing = row.clone();
                return row.id;
            }
            let mut row = row.clone();
            if row.id == 0 {
                row.id = Self::next_id(inner);
            }
            let id = row.id;
            inner.retry_configs.push(row);
            id
        }))
    }

    async fn list_model_mappings(
        &self,
        scope: &MappingScope,
    ) -> StorageResult<Vec<ModelMappingRow>> {
        Ok(self.with(|inner| {
            let mut rules: Vec<ModelMappingRow> = inner
                .model_mappings
                .iter()
                .filter(|rule| rule.enabled && rule.matches_scope(scope))
                .cloned()
                .collect();
            rules.sort_by_key(|rule| (rule.priority, rule.id));
            rules
        }))
    }

    async fn upsert_model_mapping(&self, row: &ModelMappingRow) -> StorageResult<i64> {
        Ok(self.with(|inner| {
            if let Some(existing) = inner.model_mappings.iter_mut().find(|m| m.id == row.id) {
                *existing = row.clone();
                return row.id;
            }
            let mut row = row.clone();
            if row.id == 0 {
                row.id = Self::next_id(inner);
            }
            let id = row.id;
            inner.model_mappings.push(row);
            id
        }))
    }

    async fn delete_model_mapping(&self, id: i64) -> StorageResult<()> {
        self.with(|inner| inner.model_mappings.retain(|m| m.id != id));
        Ok(())
    }

    async fn get_cooldown(
        &self,
        provider_id: i64,
        dialect: Dialect,
    ) -> StorageResult<Option<CooldownRow>> {
        Ok(self.with(|inner| inner.cooldowns.get(&(provider_id, dialect)).cloned()))
    }

    async fn upsert_cooldown(&self, row: &CooldownRow) -> StorageResult<()> {
        self.with(|inner| {
            inner
                .cooldowns
                .insert((row.provider_id, row.dialect), row.clone())
        });
        Ok(())
    }

    async fn delete_cooldown(&self, provider_id: i64, dialect: Dialect) -> StorageResult<()> {
        self.with(|inner| inner.cooldowns.remove(&(provider_id, dialect)));
        Ok(())
    }

    async fn list_cooldowns(&self) -> StorageResult<Vec<CooldownRow>> {
        Ok(self.with(|inner| inner.cooldowns.values().cloned().collect()))
    }

    async fn get_failure_count(
        &self,
        provider_id: i64,
        dialect: Dialect,
        reason: CooldownReason,
    ) -> StorageResult<Option<FailureCountRow>> {
        Ok(self.with(|inner| {
            inner
                .failure_counts
                .get(&(provider_id, dialect, reason))
                .cloned()
        }))
    }

    async fn increment_failure_count(
        &self,
        provider_id: i64,
        dialect: Dialect,
        reason: CooldownReason,
        at: OffsetDateTime,
    ) -> StorageResult<i64> {
        Ok(self.with(|inner| {
            let entry = inner
                .failure_counts
                .entry((provider_id, dialect, reason))
                .or_insert(FailureCountRow {
                    provider_id,
                    dialect,
                    reason,
                    count: 0,
                    last_failure_at: at,
                });
            entry.count += 1;
            entry.last_failure_at = at;
            entry.count
        }))
    }

    async fn reset_failure_counts(&self, provider_id: i64, dialect: Dialect) -> StorageResult<()> {
        self.with(|inner| {
            inner
                .failure_counts
                .retain(|(p, d, _), _| !(*p == provider_id && *d == dialect))
        });
        Ok(())
    }

    async fn get_antigravity_quota(
        &self,
        email: &str,
    ) -> StorageResult<Option<AntigravityQuotaRow>> {
        Ok(self.with(|inner| inner.quotas.get(email).cloned()))
    }

    async fn upsert_antigravity_quota(&self, row: &AntigravityQuotaRow) -> StorageResult<()> {
        self.with(|inner| inner.quotas.insert(row.email.clone(), row.clone()));
        Ok(())
    }

    async fn get_setting(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.with(|inner| inner.settings.get(key).cloned()))
    }

    async fn set_setting(&self, key: &str, value: &str) -> StorageResult<()> {
        self.with(|inner| inner.settings.insert(key.to_string(), value.to_string()));
        Ok(())
    }

    async fn find_api_token(&self, token: &str) -> StorageResult<Option<ApiTokenRow>> {
        Ok(self.with(|inner| {
            inner
                .api_tokens
                .iter()
                .find(|t| t.enabled && t.token == token)
                .cloned()
        }))
    }

    async fn upsert_api_token(&self, row: &ApiTokenRow) -> StorageResult<i64> {
        Ok(self.with(|inner| {
            if let Some(existing) = inner.api_tokens.iter_mut().find(|t| t.id == row.id) {
                *existing = row.clone();
                return row.id;
            }
            let mut row = row.clone();
            if row.id == 0 {
                row.id = Self::next_id(inner);
            }
            let id = row.id;
            inner.api_tokens.push(row);
            id
        }))
    }

    async fn insert_proxy_request(&self, row: &ProxyRequestRow) -> StorageResult<()> {
        self.with(|inner| inner.proxy_requests.insert(row.id.clone(), row.clone()));
        Ok(())
    }

    async fn update_proxy_request(&self, row: &ProxyRequestRow) -> StorageResult<()> {
        self.with(|inner| inner.proxy_requests.insert(row.id.clone(), row.clone()));
        Ok(())
    }

    async fn get_proxy_request(&self, id: &str) -> StorageResult<Option<ProxyRequestRow>> {
        Ok(self.with(|inner| inner.proxy_requests.get(id).cloned()))
    }

    async fn insert_proxy_attempt(&self, row: &ProxyAttemptRow) -> StorageResult<()> {
        self.with(|inner| inner.proxy_attempts.push(row.clone()));
        Ok(())
    }

    async fn update_proxy_attempt(&self, row: &ProxyAttemptRow) -> StorageResult<()> {
        self.with(|inner| {
            if let Some(existing) = inner.proxy_attempts.iter_mut().find(|a| a.id == row.id) {
                *existing = row.clone();
            }
        });
        Ok(())
    }

    async fn list_proxy_attempts(&self, request_id: &str) -> StorageResult<Vec<ProxyAttemptRow>> {
        Ok(self.with(|inner| {
            inner
                .proxy_attempts
                .iter()
                .filter(|a| a.request_id == request_id)
                .cloned()
                .collect()
        }))
    }
}
