use serde::{Deserialize, Serialize};

use crate::JsonObject;

use super::types::{Content, GenerationConfig, SafetySetting, Tool, ToolConfig};

/// The `{model}:{verb}` pair parsed from a Gemini request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratePath {
    pub model: String,
    pub stream: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    #[serde(default)]
    pub contents: Vec<Content>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_config: Option<ToolConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety_settings: Option<Vec<SafetySetting>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(default, flatten)]
    pub extra: JsonObject,
}
