use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use maxx_common::Dialect;

use crate::error::UpstreamError;

/// Typed view of a provider row's `config_json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProviderConfig {
    Custom(CustomConfig),
    Antigravity(AntigravityConfig),
}

impl ProviderConfig {
    pub fn parse(config_json: &serde_json::Value) -> Result<Self, UpstreamError> {
        serde_json::from_value(config_json.clone())
            .map_err(|err| UpstreamError::protocol(format!("invalid provider config: {err}")))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomConfig {
    pub base_url: String,
    /// Per-dialect base URL overrides.
    #[serde(default)]
    pub dialect_base_urls: HashMap<Dialect, String>,
    pub api_key: String,
    /// Dialects the endpoint accepts without translation.
    #[serde(default)]
    pub native_dialects: Vec<Dialect>,
}

impl CustomConfig {
    pub fn base_url_for(&self, dialect: Dialect) -> &str {
        self.dialect_base_urls
            .get(&dialect)
            .map(String::as_str)
            .unwrap_or(self.base_url.as_str())
    }

    pub fn is_native(&self, dialect: Dialect) -> bool {
        self.native_dialects.contains(&dialect)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AntigravityConfig {
    pub refresh_token: String,
    pub project_id: String,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Stronger model substituted for haiku-class requests.
    #[serde(default)]
    pub haiku_target: Option<String>,
    /// Account email used for quota lookups.
    #[serde(default)]
    pub email: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn custom_config_parses_with_dialect_overrides() {
        let value = json!({
            "type": "custom",
            "base_url": "https://api.example.com",
            "api_key": "sk-test",
            "dialect_base_urls": {"gemini": "https://gemini.example.com"},
            "native_dialects": ["claude", "gemini"]
        });
        let config = ProviderConfig::parse(&value).unwrap();
        let ProviderConfig::Custom(config) = config else {
            panic!("expected custom config");
        };
        assert!(config.is_native(Dialect::Claude));
        assert!(!config.is_native(Dialect::OpenAI));
        assert_eq!(
            config.base_url_for(Dialect::Gemini),
            "https://gemini.example.com"
        );
        assert_eq!(
            config.base_url_for(Dialect::Claude),
            "https://api.example.com"
        );
    }

    #[test]
    fn antigravity_config_parses() {
        let value = json!({
            "type": "antigravity",
            "refresh_token": "1//refresh",
            "project_id": "proj-1",
            "haiku_target": "gemini-3-pro-high"
        });
        let config = ProviderConfig::parse(&value).unwrap();
        assert!(matches!(config, ProviderConfig::Antigravity(_)));
    }
}
