use maxx_protocol::claude::response::{MessageResponse, MessageType};
use maxx_protocol::claude::types::{
    ContentBlock, MessageRole, StopReason, TextBlock, ThinkingBlock, ToolUseBlock, Usage,
};
use maxx_protocol::gemini::response::GenerateContentResponse;
use maxx_protocol::gemini::types::{FinishReason, UsageMetadata};

use super::sanitize::deep_clean_undefined;

/// Convert a non-streaming Gemini response into a Claude message.
pub fn transform_response(
    response: GenerateContentResponse,
    requested_model: &str,
) -> MessageResponse {
    let mut content = Vec::new();
    let mut tool_counter: u32 = 0;
    let mut has_tool_use = false;
    let mut finish_reason = None;

    if let Some(candidate) = response.candidates.first() {
        finish_reason = candidate.finish_reason;
        if let Some(candidate_content) = &candidate.content {
            for part in &candidate_content.parts {
                if let Some(call) = &part.function_call {
                    tool_counter += 1;
                    has_tool_use = true;
                    let mut input = call.args.clone().unwrap_or_else(
                        || serde_json::Value::Object(Default::default()),
                    );
                    deep_clean_undefined(&mut input);
                    content.push(ContentBlock::ToolUse(ToolUseBlock {
                        id: call
                            .id
                            .clone()
                            .unwrap_or_else(|| format!("{}-{}", call.name, tool_counter)),
                        name: call.name.clone(),
                        input,
                        cache_control: None,
                    }));
                } else if part.thought == Some(true) {
                    if let Some(text) = &part.text {
                        content.push(ContentBlock::Thinking(ThinkingBlock {
                            thinking: text.clone(),
                            signature: part.thought_signature.clone().unwrap_or_default(),
                        }));
                    }
                } else if let Some(text) = &part.text {
                    content.push(ContentBlock::Text(TextBlock::new(text.clone())));
                }
            }
        }
    }

    let stop_reason = match finish_reason {
        Some(FinishReason::MaxTokens) => StopReason::MaxTokens,
        _ if has_tool_use => StopReason::ToolUse,
        _ => StopReason::EndTurn,
    };

    let model = response
        .model_version
        .as_deref()
        .map(|model| model.strip_prefix("models/").unwrap_or(model).to_string())
        .unwrap_or_else(|| requested_model.to_string());

    MessageResponse {
        id: response
            .response_id
            .clone()
            .unwrap_or_else(|| format!("msg_{}", uuid::Uuid::new_v4().simple())),
        kind: MessageType::Message,
        role: MessageRole::Assistant,
        model,
        content,
        stop_reason: Some(stop_reason),
        stop_sequence: None,
        usage: map_usage(response.usage_metadata.as_ref()),
    }
}

pub(crate) fn map_usage(usage: Option<&UsageMetadata>) -> Usage {
    let prompt = usage.and_then(|u| u.prompt_token_count).unwrap_or(0);
    let cached = usage.and_then(|u| u.cached_content_token_count).unwrap_or(0);
    let output = usage.and_then(|u| u.candidates_token_count).unwrap_or(0);

    Usage {
        input_tokens: prompt.saturating_sub(cached),
        output_tokens: output,
        cache_read_input_tokens: (cached > 0).then_some(cached),
        cache_creation_input_tokens: Some(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maxx_protocol::gemini::response::Candidate;
    use maxx_protocol::gemini::types::{Content, FunctionCall, Part};
    use serde_json::json;

    fn response_with_parts(parts: Vec<Part>, finish: Option<FinishReason>) -> GenerateContentResponse {
        GenerateContentResponse {
            candidates: vec![Candidate {
                content: Some(Content::model(parts)),
                finish_reason: finish,
                index: Some(0),
            }],
            usage_metadata: Some(UsageMetadata {
                prompt_token_count: Some(12),
                candidates_token_count: Some(5),
                cached_content_token_count: Some(4),
                thoughts_token_count: None,
                total_token_count: Some(17),
            }),
            model_version: Some("models/gemini-2.5-pro".to_string()),
            response_id: Some("resp-1".to_string()),
        }
    }

    #[test]
    fn text_candidate_maps_to_end_turn_message() {
        let message = transform_response(
            response_with_parts(vec![Part::text("hi")], Some(FinishReason::Stop)),
            "claude-sonnet-4-5",
        );
        assert_eq!(message.id, "resp-1");
        assert_eq!(message.model, "gemini-2.5-pro");
        assert_eq!(message.stop_reason, Some(StopReason::EndTurn));
        assert_eq!(
            message.content,
            vec![ContentBlock::Text(TextBlock::new("hi"))]
        );
        assert_eq!(message.usage.input_tokens, 8);
        assert_eq!(message.usage.output_tokens, 5);
        assert_eq!(message.usage.cache_read_input_tokens, Some(4));
    }

    #[test]
    fn function_call_wins_stop_reason() {
        let message = transform_response(
            response_with_parts(
                vec![Part::function_call(FunctionCall {
                    id: None,
                    name: "search".to_string(),
                    args: Some(json!({"q": "x"})),
                })],
                Some(FinishReason::Stop),
            ),
            "claude-sonnet-4-5",
        );
        assert_eq!(message.stop_reason, Some(StopReason::ToolUse));
        match &message.content[0] {
            ContentBlock::ToolUse(tool) => {
                assert_eq!(tool.id, "search-1");
                assert_eq!(tool.input, json!({"q": "x"}));
            }
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[test]
    fn thought_parts_become_thinking_blocks() {
        let message = transform_response(
            response_with_parts(
                vec![
                    Part::thought("chain", Some("signature-abc".to_string())),
                    Part::text("answer"),
                ],
                Some(FinishReason::Stop),
            ),
            "claude-sonnet-4-5",
        );
        assert!(matches!(
            &message.content[0],
            ContentBlock::Thinking(t) if t.thinking == "chain" && t.signature == "signature-abc"
        ));
    }

    #[test]
    fn max_tokens_maps_through() {
        let message = transform_response(
            response_with_parts(vec![Part::text("partial")], Some(FinishReason::MaxTokens)),
            "claude-sonnet-4-5",
        );
        assert_eq!(message.stop_reason, Some(StopReason::MaxTokens));
    }

    #[test]
    fn missing_response_id_generates_msg_prefix() {
        let mut response = response_with_parts(vec![Part::text("x")], Some(FinishReason::Stop));
        response.response_id = None;
        response.model_version = None;
        let message = transform_response(response, "claude-sonnet-4-5");
        assert!(message.id.starts_with("msg_"));
        assert_eq!(message.model, "claude-sonnet-4-5");
    }
}
