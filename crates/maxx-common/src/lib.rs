use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The four chat/completion dialects the gateway speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Claude,
    OpenAI,
    Codex,
    Gemini,
}

impl Dialect {
    pub const ALL: [Dialect; 4] = [
        Dialect::Claude,
        Dialect::OpenAI,
        Dialect::Codex,
        Dialect::Gemini,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::Claude => "claude",
            Dialect::OpenAI => "openai",
            Dialect::Codex => "codex",
            Dialect::Gemini => "gemini",
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown dialect: {0}")]
pub struct ParseDialectError(String);

impl FromStr for Dialect {
    type Err = ParseDialectError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "claude" => Ok(Dialect::Claude),
            "openai" => Ok(Dialect::OpenAI),
            "codex" => Ok(Dialect::Codex),
            "gemini" => Ok(Dialect::Gemini),
            other => Err(ParseDialectError(other.to_string())),
        }
    }
}

/// Provider type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Custom,
    Antigravity,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Custom => "custom",
            ProviderKind::Antigravity => "antigravity",
        }
    }
}

/// Why a (provider, dialect) pair is quarantined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CooldownReason {
    ServerError,
    NetworkError,
    QuotaExhausted,
    RateLimit,
    ConcurrentLimit,
    Unknown,
}

impl CooldownReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CooldownReason::ServerError => "server_error",
            CooldownReason::NetworkError => "network_error",
            CooldownReason::QuotaExhausted => "quota_exhausted",
            CooldownReason::RateLimit => "rate_limit",
            CooldownReason::ConcurrentLimit => "concurrent_limit",
            CooldownReason::Unknown => "unknown",
        }
    }
}

impl fmt::Display for CooldownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CooldownReason {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "server_error" => Ok(CooldownReason::ServerError),
            "network_error" => Ok(CooldownReason::NetworkError),
            "quota_exhausted" => Ok(CooldownReason::QuotaExhausted),
            "rate_limit" => Ok(CooldownReason::RateLimit),
            "concurrent_limit" => Ok(CooldownReason::ConcurrentLimit),
            _ => Ok(CooldownReason::Unknown),
        }
    }
}

/// Lifecycle of a proxied client request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    Rejected,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestStatus::Pending | RequestStatus::InProgress)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "PENDING",
            RequestStatus::InProgress => "IN_PROGRESS",
            RequestStatus::Completed => "COMPLETED",
            RequestStatus::Failed => "FAILED",
            RequestStatus::Cancelled => "CANCELLED",
            RequestStatus::Rejected => "REJECTED",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown status: {0}")]
pub struct ParseStatusError(String);

impl FromStr for RequestStatus {
    type Err = ParseStatusError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "PENDING" => Ok(RequestStatus::Pending),
            "IN_PROGRESS" => Ok(RequestStatus::InProgress),
            "COMPLETED" => Ok(RequestStatus::Completed),
            "FAILED" => Ok(RequestStatus::Failed),
            "CANCELLED" => Ok(RequestStatus::Cancelled),
            "REJECTED" => Ok(RequestStatus::Rejected),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// Lifecycle of a single upstream attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptStatus {
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::InProgress => "IN_PROGRESS",
            AttemptStatus::Completed => "COMPLETED",
            AttemptStatus::Failed => "FAILED",
            AttemptStatus::Cancelled => "CANCELLED",
        }
    }
}

impl FromStr for AttemptStatus {
    type Err = ParseStatusError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "IN_PROGRESS" => Ok(AttemptStatus::InProgress),
            "COMPLETED" => Ok(AttemptStatus::Completed),
            "FAILED" => Ok(AttemptStatus::Failed),
            "CANCELLED" => Ok(AttemptStatus::Cancelled),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown provider kind: {0}")]
pub struct ParseProviderKindError(String);

impl FromStr for ProviderKind {
    type Err = ParseProviderKindError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "custom" => Ok(ProviderKind::Custom),
            "antigravity" => Ok(ProviderKind::Antigravity),
            other => Err(ParseProviderKindError(other.to_string())),
        }
    }
}

/// Token counts extracted from a client-visible response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub cache_creation_input_tokens: u64,
}

impl UsageTotals {
    pub fn is_empty(&self) -> bool {
        *self == UsageTotals::default()
    }
}

/// Settings keys read by the hot path.
pub mod settings {
    pub const FORCE_PROJECT_BINDING: &str = "force_project_binding";
    pub const FORCE_PROJECT_TIMEOUT: &str = "force_project_timeout";
    pub const COOLDOWN_POLICY: &str = "cooldown_policy";
    pub const FAILURE_COUNT_IDLE_SECS: &str = "failure_count_idle_secs";
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayConfigError {
    #[error("missing required config field: {0}")]
    MissingField(&'static str),
}

/// Final, merged process configuration.
///
/// Merge order: CLI > ENV > defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Database DSN used for this process.
    pub dsn: String,
    /// Optional outbound proxy (for upstream egress).
    pub proxy: Option<String>,
}

/// Optional layer used for merging gateway config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewayConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub dsn: Option<String>,
    pub proxy: Option<String>,
}

impl GatewayConfigPatch {
    pub fn overlay(&mut self, other: GatewayConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.dsn.is_some() {
            self.dsn = other.dsn;
        }
        if other.proxy.is_some() {
            self.proxy = other.proxy;
        }
    }

    pub fn into_config(self) -> Result<GatewayConfig, GatewayConfigError> {
        Ok(GatewayConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(8788),
            dsn: self.dsn.ok_or(GatewayConfigError::MissingField("dsn"))?,
            proxy: self.proxy,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialect_round_trip() {
        for dialect in Dialect::ALL {
            assert_eq!(dialect.as_str().parse::<Dialect>().unwrap(), dialect);
        }
    }

    #[test]
    fn cooldown_reason_falls_back_to_unknown() {
        let reason: CooldownReason = "weird".parse().unwrap();
        assert_eq!(reason, CooldownReason::Unknown);
    }

    #[test]
    fn config_patch_overlay_prefers_latest() {
        let mut base = GatewayConfigPatch {
            host: Some("127.0.0.1".to_string()),
            port: Some(9000),
            dsn: Some("sqlite::memory:".to_string()),
            proxy: None,
        };
        base.overlay(GatewayConfigPatch {
            port: Some(9100),
            ..Default::default()
        });
        let config = base.into_config().unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.host, "127.0.0.1");
    }
}
