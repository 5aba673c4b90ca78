use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use maxx_common::{
    AttemptStatus, CooldownReason, Dialect, ProviderKind, RequestStatus, UsageTotals,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRow {
    pub id: i64,
    pub name: String,
    pub kind: ProviderKind,
    pub config_json: serde_json::Value,
    pub enabled: bool,
    pub deleted_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteRow {
    pub id: i64,
    /// 0 means global scope.
    pub project_id: i64,
    pub dialect: Dialect,
    pub provider_id: i64,
    pub position: i32,
    pub enabled: bool,
    pub native: bool,
    pub retry_config_id: Option<i64>,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectRow {
    pub id: i64,
    pub name: String,
    pub slug: String,
    /// Dialects routed through project-scoped routes instead of global ones.
    pub enabled_dialects: Vec<Dialect>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRow {
    pub id: String,
    pub project_id: Option<i64>,
    pub created_at: OffsetDateTime,
    pub last_seen_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfigRow {
    pub id: i64,
    pub name: String,
    pub max_retries: u32,
    pub initial_interval_ms: u64,
    pub backoff_rate: f64,
    pub max_interval_ms: u64,
    pub is_default: bool,
}

impl RetryConfigRow {
    /// Zero-retry config used when neither route nor default exist.
    pub fn none() -> Self {
        Self {
            id: 0,
            name: "none".to_string(),
            max_retries: 0,
            initial_interval_ms: 0,
            backoff_rate: 1.0,
            max_interval_ms: 0,
            is_default: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMappingRow {
    pub id: i64,
    pub priority: i64,
    pub pattern: String,
    pub target: String,
    pub dialect: Option<Dialect>,
    pub provider_id: Option<i64>,
    pub project_id: Option<i64>,
    pub route_id: Option<i64>,
    pub token_id: Option<i64>,
    pub enabled: bool,
}

/// Request-side values a mapping rule's scope columns are matched against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MappingScope {
    pub dialect: Option<Dialect>,
    pub provider_id: Option<i64>,
    pub project_id: Option<i64>,
    pub route_id: Option<i64>,
    pub token_id: Option<i64>,
}

impl ModelMappingRow {
    pub fn matches_scope(&self, scope: &MappingScope) -> bool {
        fn field<T: PartialEq + Copy>(rule: Option<T>, request: Option<T>) -> bool {
            match rule {
                None => true,
                Some(value) => request == Some(value),
            }
        }
        field(self.dialect, scope.dialect)
            && field(self.provider_id, scope.provider_id)
            && field(self.project_id, scope.project_id)
            && field(self.route_id, scope.route_id)
            && field(self.token_id, scope.token_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CooldownRow {
    pub provider_id: i64,
    pub dialect: Dialect,
    pub until_time: OffsetDateTime,
    pub reason: CooldownReason,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureCountRow {
    pub provider_id: i64,
    pub dialect: Dialect,
    pub reason: CooldownReason,
    pub count: i64,
    pub last_failure_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AntigravityQuotaRow {
    pub email: String,
    pub payload_json: serde_json::Value,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiTokenRow {
    pub id: i64,
    pub token: String,
    pub name: Option<String>,
    pub enabled: bool,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyRequestRow {
    pub id: String,
    pub dialect: Dialect,
    pub session_id: Option<String>,
    pub project_id: Option<i64>,
    pub original_model: String,
    pub final_model: Option<String>,
    pub status: RequestStatus,
    pub started_at: OffsetDateTime,
    pub ended_at: Option<OffsetDateTime>,
    pub attempt_count: i32,
    pub request_body: Option<Vec<u8>>,
    pub response_body: Option<Vec<u8>>,
    pub usage: UsageTotals,
    pub cost_micro_usd: i64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyAttemptRow {
    pub id: String,
    pub request_id: String,
    pub route_id: i64,
    pub provider_id: i64,
    pub dialect: Dialect,
    pub mapped_model: String,
    pub status: AttemptStatus,
    pub started_at: OffsetDateTime,
    pub ended_at: Option<OffsetDateTime>,
    pub upstream_request: Option<Vec<u8>>,
    pub upstream_response: Option<Vec<u8>>,
    pub usage: UsageTotals,
    pub cost_micro_usd: i64,
    pub error: Option<String>,
}

/// Read-mostly state loaded at bootstrap and refreshed on admin writes.
#[derive(Debug, Clone, Default)]
pub struct StorageSnapshot {
    pub providers: Vec<ProviderRow>,
    pub routes: Vec<RouteRow>,
    pub projects: Vec<ProjectRow>,
    pub retry_configs: Vec<RetryConfigRow>,
    pub model_mappings: Vec<ModelMappingRow>,
    pub api_tokens: Vec<ApiTokenRow>,
    pub settings: Vec<(String, String)>,
}

impl StorageSnapshot {
    pub fn setting(&self, key: &str) -> Option<&str> {
        self.settings
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(project_id: Option<i64>) -> ModelMappingRow {
        ModelMappingRow {
            id: 1,
            priority: 0,
            pattern: "*".to_string(),
            target: "target".to_string(),
            dialect: None,
            provider_id: None,
            project_id,
            route_id: None,
            token_id: None,
            enabled: true,
        }
    }

    #[test]
    fn empty_scope_matches_all() {
        let scope = MappingScope {
            dialect: Some(Dialect::Claude),
            project_id: Some(7),
            ..Default::default()
        };
        assert!(rule(None).matches_scope(&scope));
    }

    #[test]
    fn scoped_rule_never_fires_for_other_project() {
        let scope = MappingScope {
            project_id: Some(9),
            ..Default::default()
        };
        assert!(!rule(Some(7)).matches_scope(&scope));
        assert!(rule(Some(9)).matches_scope(&scope));
    }
}
