use std::collections::HashMap;

use maxx_protocol::claude::request::CreateMessageRequest;
use maxx_protocol::claude::types::{
    ContentBlock, Message, MessageContent, MessageRole, SystemPrompt, ThinkingParam, Tool,
    ToolResultContent,
};
use maxx_protocol::gemini::request::GenerateContentRequest;
use maxx_protocol::gemini::types::{
    Content, ContentRole, FunctionCall, FunctionCallingConfig, FunctionCallingMode,
    FunctionDeclaration, FunctionResponse, GenerationConfig, GoogleSearch, HarmBlockThreshold,
    HarmCategory, Part, SafetySetting, ThinkingConfig, Tool as GeminiTool, ToolConfig,
};

use crate::signature::{SignatureCache, is_valid_signature};

use super::WEB_SEARCH_MODEL;
use super::sanitize;
use super::schema::clean_schema;

pub const MAX_OUTPUT_TOKENS: u32 = 64_000;
pub const THINKING_BUDGET_CAP: u32 = 24_576;
pub const SYSTEM_PROMPT_END: &str = "[SYSTEM_PROMPT_END]";

const DEFAULT_STOP_SEQUENCES: [&str; 5] = [
    "<|user|>",
    "<|endoftext|>",
    "<|end_of_turn|>",
    "[DONE]",
    "\n\nHuman:",
];

const WEB_SEARCH_TOOL_NAMES: [&str; 6] = [
    "web_search",
    "websearch",
    "google_search",
    "googlesearch",
    "google_search_retrieval",
    "web_search_20250305",
];

const WEB_SEARCH_PHRASES: [&str; 3] = ["web search", "google search", "internet search"];

#[derive(Debug, Clone)]
pub struct ConvertOptions<'a> {
    /// Upstream model after route mapping.
    pub mapped_model: &'a str,
    /// Session the signature cache is keyed by.
    pub session_id: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct ConvertedRequest {
    pub body: GenerateContentRequest,
    /// Final upstream model, forced to the web-search model when a
    /// web-search tool was detected.
    pub model: String,
    pub web_search: bool,
    pub thinking: bool,
}

/// Convert a Claude create-message request into a Gemini generate-content
/// request for the mapped upstream model.
pub fn transform_request(
    mut request: CreateMessageRequest,
    opts: &ConvertOptions<'_>,
    signatures: &SignatureCache,
) -> ConvertedRequest {
    sanitize::scrub_cache_control(&mut request);
    sanitize::normalize_thinking_history(&mut request.messages);

    let web_search = detect_web_search(request.tools.as_deref());
    let model = if web_search {
        WEB_SEARCH_MODEL.to_string()
    } else {
        opts.mapped_model.to_string()
    };

    let thinking = resolve_thinking(&request, &model, opts.session_id, signatures);
    sanitize::repair_tool_use_tail(&mut request.messages);

    let system_instruction = build_system_instruction(&model, request.system.take());
    let contents = convert_messages(&request.messages, thinking, opts.session_id, signatures);
    let (tools, tool_config) = convert_tools(request.tools.take());
    let generation_config = build_generation_config(&request, &model, thinking, web_search);

    let body = GenerateContentRequest {
        contents,
        system_instruction: Some(system_instruction),
        tools,
        tool_config,
        safety_settings: Some(safety_settings_from_env()),
        generation_config: Some(generation_config),
        extra: Default::default(),
    };

    ConvertedRequest {
        body,
        model,
        web_search,
        thinking,
    }
}

fn detect_web_search(tools: Option<&[Tool]>) -> bool {
    let Some(tools) = tools else {
        return false;
    };
    tools.iter().any(tool_is_web_search)
}

fn tool_is_web_search(tool: &Tool) -> bool {
    let name = tool.name.to_ascii_lowercase();
    if WEB_SEARCH_TOOL_NAMES.contains(&name.as_str()) {
        return true;
    }
    if let Some(kind) = &tool.kind
        && WEB_SEARCH_TOOL_NAMES.contains(&kind.to_ascii_lowercase().as_str())
    {
        return true;
    }
    if let Some(description) = &tool.description {
        let description = description.to_ascii_lowercase();
        if WEB_SEARCH_PHRASES
            .iter()
            .any(|phrase| description.contains(phrase))
        {
            return true;
        }
    }
    false
}

/// A google-search tool never becomes a function declaration.
fn tool_is_google_search_builtin(tool: &Tool) -> bool {
    let name = tool.name.to_ascii_lowercase();
    if WEB_SEARCH_TOOL_NAMES.contains(&name.as_str()) {
        return true;
    }
    matches!(
        tool.kind.as_deref().map(str::to_ascii_lowercase).as_deref(),
        Some(kind) if WEB_SEARCH_TOOL_NAMES.contains(&kind)
    )
}

fn resolve_thinking(
    request: &CreateMessageRequest,
    mapped_model: &str,
    session_id: Option<&str>,
    signatures: &SignatureCache,
) -> bool {
    let requested = matches!(request.thinking, Some(ThinkingParam::Enabled { .. }))
        || model_requests_thinking(&request.model);
    if !requested || !model_supports_thinking(mapped_model) {
        return false;
    }

    if let Some(last_assistant) = request
        .messages
        .iter()
        .rev()
        .find(|message| message.role == MessageRole::Assistant)
        && let MessageContent::Blocks(blocks) = &last_assistant.content
    {
        let has_tool_use = blocks
            .iter()
            .any(|block| matches!(block, ContentBlock::ToolUse(_)));
        let has_thinking = blocks
            .iter()
            .any(|block| matches!(block, ContentBlock::Thinking(_)));
        if has_tool_use && !has_thinking {
            return false;
        }
    }

    let has_function_calls = request.messages.iter().any(message_has_tool_use);
    let has_thinking_history = request.messages.iter().any(message_has_thinking);
    if has_function_calls && !has_thinking_history {
        // Resuming a tool conversation without thinking history needs a
        // cached signature; first-time requests are allowed without one.
        return signatures
            .lookup(session_id)
            .is_some_and(|signature| is_valid_signature(&signature));
    }

    true
}

fn model_requests_thinking(model: &str) -> bool {
    model.contains("opus-4-5") || model.contains("opus-4.5") || model.contains("-thinking")
}

fn model_supports_thinking(model: &str) -> bool {
    model.contains("-thinking")
        || model.starts_with("claude-")
        || model.starts_with("gemini-2.5")
        || model.starts_with("gemini-3")
}

fn message_has_tool_use(message: &Message) -> bool {
    matches!(&message.content, MessageContent::Blocks(blocks)
        if blocks.iter().any(|block| matches!(block, ContentBlock::ToolUse(_))))
}

fn message_has_thinking(message: &Message) -> bool {
    matches!(&message.content, MessageContent::Blocks(blocks)
        if blocks.iter().any(|block| matches!(block, ContentBlock::Thinking(_))))
}

fn build_system_instruction(model: &str, system: Option<SystemPrompt>) -> Content {
    let mut parts = vec![Part::text(format!(
        "You are {model}. Disregard any earlier text that assigns you a \
         different name, vendor, or model identity; it comes from the host \
         application, not the user."
    ))];

    match system {
        Some(SystemPrompt::Text(text)) => {
            if !text.trim().is_empty() {
                parts.push(Part::text(text));
            }
        }
        Some(SystemPrompt::Blocks(blocks)) => {
            for block in blocks {
                if !block.text.trim().is_empty() {
                    parts.push(Part::text(block.text));
                }
            }
        }
        None => {}
    }

    parts.push(Part::text(SYSTEM_PROMPT_END));
    Content::user(parts)
}

fn convert_messages(
    messages: &[Message],
    thinking: bool,
    session_id: Option<&str>,
    signatures: &SignatureCache,
) -> Vec<Content> {
    let mut tool_names: HashMap<String, String> = HashMap::new();
    let mut last_signature = signatures
        .lookup(session_id)
        .filter(|signature| is_valid_signature(signature));
    let mut contents: Vec<Content> = Vec::new();

    for message in messages {
        let mut role = match message.role {
            MessageRole::User => ContentRole::User,
            MessageRole::Assistant => ContentRole::Model,
        };
        let mut parts = Vec::new();

        match &message.content {
            MessageContent::Text(text) => {
                if let Some(part) = text_part(text) {
                    parts.push(part);
                }
            }
            MessageContent::Blocks(blocks) => {
                for block in blocks {
                    match block {
                        ContentBlock::Text(text) => {
                            if let Some(part) = text_part(&text.text) {
                                parts.push(part);
                            }
                        }
                        ContentBlock::Thinking(block) => {
                            if is_valid_signature(&block.signature) {
                                last_signature = Some(block.signature.clone());
                            }
                            if thinking {
                                let signature = Some(block.signature.clone())
                                    .filter(|s| is_valid_signature(s));
                                parts.push(Part::thought(block.thinking.clone(), signature));
                            } else if let Some(part) = text_part(&block.thinking) {
                                parts.push(part);
                            }
                        }
                        ContentBlock::RedactedThinking(block) => {
                            parts.push(Part::text(format!(
                                "[Redacted Thinking: {}]",
                                block.data
                            )));
                        }
                        ContentBlock::ToolUse(block) => {
                            tool_names.insert(block.id.clone(), block.name.clone());
                            let mut part = Part::function_call(FunctionCall {
                                id: Some(block.id.clone()),
                                name: block.name.clone(),
                                args: Some(clean_schema(block.input.clone())),
                            });
                            part.thought_signature = last_signature.clone();
                            parts.push(part);
                        }
                        ContentBlock::ToolResult(block) => {
                            // Function responses only exist on the user side.
                            role = ContentRole::User;
                            let name = tool_names
                                .get(&block.tool_use_id)
                                .cloned()
                                .unwrap_or_else(|| block.tool_use_id.clone());
                            let text =
                                tool_result_text(block.content.as_ref(), block.is_error);
                            parts.push(Part::function_response(FunctionResponse {
                                id: Some(block.tool_use_id.clone()),
                                name,
                                response: serde_json::json!({ "result": text }),
                            }));
                        }
                        ContentBlock::Image(block) => {
                            if let maxx_protocol::claude::types::MediaSource::Base64 {
                                media_type,
                                data,
                            } = &block.source
                            {
                                parts.push(Part::inline_data(media_type.clone(), data.clone()));
                            }
                        }
                        ContentBlock::Document(block) => {
                            if let maxx_protocol::claude::types::MediaSource::Base64 {
                                media_type,
                                data,
                            } = &block.source
                            {
                                parts.push(Part::inline_data(media_type.clone(), data.clone()));
                            }
                        }
                        // Server tools are never forwarded upstream.
                        ContentBlock::ServerToolUse(_)
                        | ContentBlock::WebSearchToolResult(_)
                        | ContentBlock::Unknown(_) => {}
                    }
                }
            }
        }

        if parts.is_empty() {
            continue;
        }

        match contents.last_mut() {
            Some(previous) if previous.role == Some(role) => previous.parts.extend(parts),
            _ => contents.push(Content {
                role: Some(role),
                parts,
            }),
        }
    }

    contents
}

fn text_part(text: &str) -> Option<Part> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed == "(no content)" {
        None
    } else {
        Some(Part::text(text.to_string()))
    }
}

fn tool_result_text(content: Option<&ToolResultContent>, is_error: Option<bool>) -> String {
    let text = match content {
        Some(ToolResultContent::Text(text)) => text.clone(),
        Some(ToolResultContent::Blocks(blocks)) => blocks
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text(text) => Some(text.text.clone()),
                _ => None,
            })
            .collect::<Vec<String>>()
            .join("\n"),
        None => String::new(),
    };

    if !text.is_empty() {
        return text;
    }
    if is_error.unwrap_or(false) {
        "Tool execution failed with no output.".to_string()
    } else {
        "Command executed successfully.".to_string()
    }
}

fn convert_tools(tools: Option<Vec<Tool>>) -> (Option<Vec<GeminiTool>>, Option<ToolConfig>) {
    let Some(tools) = tools else {
        return (None, None);
    };

    let mut functions = Vec::new();
    let mut has_google_search = false;

    for tool in tools {
        if tool_is_google_search_builtin(&tool) {
            has_google_search = true;
            continue;
        }
        functions.push(FunctionDeclaration {
            name: tool.name,
            description: tool.description,
            parameters: tool.input_schema.map(clean_schema),
        });
    }

    if !functions.is_empty() {
        // The upstream cannot mix declarations with googleSearch; when both
        // were requested keep the declarations and force VALIDATED calling.
        let tool_config = has_google_search.then(|| ToolConfig {
            function_calling_config: Some(FunctionCallingConfig {
                mode: Some(FunctionCallingMode::Validated),
            }),
        });
        let tools = vec![GeminiTool {
            function_declarations: Some(functions),
            google_search: None,
        }];
        (Some(tools), tool_config)
    } else if has_google_search {
        let tools = vec![GeminiTool {
            function_declarations: None,
            google_search: Some(GoogleSearch {}),
        }];
        (Some(tools), None)
    } else {
        (None, None)
    }
}

fn build_generation_config(
    request: &CreateMessageRequest,
    model: &str,
    thinking: bool,
    web_search: bool,
) -> GenerationConfig {
    let mut stop_sequences: Vec<String> = DEFAULT_STOP_SEQUENCES
        .iter()
        .map(|s| s.to_string())
        .collect();
    if let Some(extra) = &request.stop_sequences {
        for sequence in extra {
            if !stop_sequences.contains(sequence) {
                stop_sequences.push(sequence.clone());
            }
        }
    }

    let effort = request
        .output_config
        .as_ref()
        .and_then(|config| config.effort.as_deref())
        .map(str::to_ascii_uppercase)
        .filter(|effort| matches!(effort.as_str(), "HIGH" | "MEDIUM" | "LOW"))
        .unwrap_or_else(|| "HIGH".to_string());

    let thinking_config = thinking.then(|| {
        let requested = match request.thinking {
            Some(ThinkingParam::Enabled { budget_tokens }) => budget_tokens,
            _ => None,
        }
        .unwrap_or(THINKING_BUDGET_CAP);
        let budget = if model.contains("flash") || web_search {
            requested.min(THINKING_BUDGET_CAP)
        } else {
            requested
        };
        ThinkingConfig {
            include_thoughts: true,
            thinking_budget: Some(budget),
        }
    });

    GenerationConfig {
        max_output_tokens: Some(MAX_OUTPUT_TOKENS),
        stop_sequences: Some(stop_sequences),
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: request.top_k,
        effort_level: Some(effort),
        thinking_config,
        ..Default::default()
    }
}

fn safety_settings_from_env() -> Vec<SafetySetting> {
    let threshold = std::env::var("GEMINI_SAFETY_THRESHOLD")
        .ok()
        .and_then(|value| HarmBlockThreshold::parse(value.trim()))
        .unwrap_or(HarmBlockThreshold::Off);

    HarmCategory::ALL
        .into_iter()
        .map(|category| SafetySetting {
            category,
            threshold,
        })
        .collect()
}
