use maxx_common::{Dialect, UsageTotals};
use maxx_protocol::claude::response::MessageResponse;
use maxx_protocol::claude::stream::StreamEvent;
use maxx_protocol::claude::types::Usage as ClaudeUsage;
use maxx_protocol::codex::{Response as CodexResponse, ResponseStreamFrame};
use maxx_protocol::gemini::response::GenerateContentResponse;
use maxx_protocol::gemini::types::UsageMetadata;
use maxx_protocol::openai::{ChatCompletionChunk, ChatCompletionResponse, ChatUsage};
use maxx_protocol::sse::SseParser;

/// Extract token counts from the client-visible response body.
///
/// The captured body is what the client saw, so streamed responses are
/// scanned frame by frame in their own dialect's framing.
pub fn extract_usage(dialect: Dialect, body: &[u8], is_stream: bool) -> Option<UsageTotals> {
    if is_stream {
        extract_stream_usage(dialect, body)
    } else {
        extract_body_usage(dialect, body)
    }
}

fn extract_body_usage(dialect: Dialect, body: &[u8]) -> Option<UsageTotals> {
    match dialect {
        Dialect::Claude => {
            let message: MessageResponse = serde_json::from_slice(body).ok()?;
            Some(from_claude(&message.usage))
        }
        Dialect::OpenAI => {
            let response: ChatCompletionResponse = serde_json::from_slice(body).ok()?;
            response.usage.as_ref().map(from_openai)
        }
        Dialect::Codex => {
            let response: CodexResponse = serde_json::from_slice(body).ok()?;
            response.usage.map(|usage| UsageTotals {
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                cache_read_input_tokens: usage
                    .input_tokens_details
                    .map(|d| d.cached_tokens)
                    .unwrap_or(0),
                cache_creation_input_tokens: 0,
            })
        }
        Dialect::Gemini => {
            let response: GenerateContentResponse = serde_json::from_slice(body).ok()?;
            response.usage_metadata.as_ref().map(from_gemini)
        }
    }
}

fn extract_stream_usage(dialect: Dialect, body: &[u8]) -> Option<UsageTotals> {
    let mut parser = SseParser::new();
    let text = String::from_utf8_lossy(body);
    let mut events = parser.push_str(&text);
    events.extend(parser.finish());

    let mut totals: Option<UsageTotals> = None;
    for event in events {
        if event.data.is_empty() || event.data == "[DONE]" {
            continue;
        }
        let found = match dialect {
            Dialect::Claude => claude_event_usage(&event.data),
            Dialect::OpenAI => serde_json::from_str::<ChatCompletionChunk>(&event.data)
                .ok()
                .and_then(|chunk| chunk.usage.as_ref().map(from_openai)),
            Dialect::Codex => serde_json::from_str::<ResponseStreamFrame>(&event.data)
                .ok()
                .and_then(|frame| frame.response)
                .and_then(|response| response.usage)
                .map(|usage| UsageTotals {
                    input_tokens: usage.input_tokens,
                    output_tokens: usage.output_tokens,
                    cache_read_input_tokens: usage
                        .input_tokens_details
                        .map(|d| d.cached_tokens)
                        .unwrap_or(0),
                    cache_creation_input_tokens: 0,
                }),
            Dialect::Gemini => serde_json::from_str::<GenerateContentResponse>(&event.data)
                .ok()
                .and_then(|chunk| chunk.usage_metadata.as_ref().map(from_gemini)),
        };
        if let Some(found) = found {
            totals = Some(merge(totals, found));
        }
    }
    totals
}

/// Claude streams split usage across message_start (input) and
/// message_delta (output).
fn claude_event_usage(data: &str) -> Option<UsageTotals> {
    let event: StreamEvent = serde_json::from_str(data).ok()?;
    match event {
        StreamEvent::MessageStart { message } => Some(from_claude(&message.usage)),
        StreamEvent::MessageDelta { usage, .. } => usage.as_ref().map(from_claude),
        _ => None,
    }
}

fn merge(current: Option<UsageTotals>, found: UsageTotals) -> UsageTotals {
    match current {
        None => found,
        Some(current) => UsageTotals {
            input_tokens: current.input_tokens.max(found.input_tokens),
            output_tokens: current.output_tokens.max(found.output_tokens),
            cache_read_input_tokens: current
                .cache_read_input_tokens
                .max(found.cache_read_input_tokens),
            cache_creation_input_tokens: current
                .cache_creation_input_tokens
                .max(found.cache_creation_input_tokens),
        },
    }
}

fn from_claude(usage: &ClaudeUsage) -> UsageTotals {
    UsageTotals {
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        cache_read_input_tokens: usage.cache_read_input_tokens.unwrap_or(0),
        cache_creation_input_tokens: usage.cache_creation_input_tokens.unwrap_or(0),
    }
}

fn from_openai(usage: &ChatUsage) -> UsageTotals {
    UsageTotals {
        input_tokens: usage.prompt_tokens,
        output_tokens: usage.completion_tokens,
        cache_read_input_tokens: usage
            .prompt_tokens_details
            .as_ref()
            .map(|d| d.cached_tokens)
            .unwrap_or(0),
        cache_creation_input_tokens: 0,
    }
}

fn from_gemini(usage: &UsageMetadata) -> UsageTotals {
    let prompt = usage.prompt_token_count.unwrap_or(0);
    let cached = usage.cached_content_token_count.unwrap_or(0);
    UsageTotals {
        input_tokens: prompt.saturating_sub(cached),
        output_tokens: usage.candidates_token_count.unwrap_or(0),
        cache_read_input_tokens: cached,
        cache_creation_input_tokens: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maxx_protocol::sse::format_event;

    #[test]
    fn claude_body_usage_extracted() {
        let body = serde_json::json!({
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "model": "claude-sonnet-4-5",
            "content": [],
            "usage": {"input_tokens": 12, "output_tokens": 7}
        });
        let totals = extract_usage(Dialect::Claude, body.to_string().as_bytes(), false).unwrap();
        assert_eq!(totals.input_tokens, 12);
        assert_eq!(totals.output_tokens, 7);
    }

    #[test]
    fn claude_stream_usage_merges_start_and_delta() {
        let start = serde_json::json!({
            "type": "message_start",
            "message": {
                "id": "msg_1",
                "type": "message",
                "role": "assistant",
                "model": "m",
                "content": [],
                "usage": {"input_tokens": 20, "output_tokens": 0}
            }
        });
        let delta = serde_json::json!({
            "type": "message_delta",
            "delta": {"stop_reason": "end_turn"},
            "usage": {"input_tokens": 20, "output_tokens": 9}
        });
        let mut body = format_event("message_start", &start.to_string());
        body.push_str(&format_event("message_delta", &delta.to_string()));
        body.push_str(&format_event("message_stop", "{\"type\":\"message_stop\"}"));

        let totals = extract_usage(Dialect::Claude, body.as_bytes(), true).unwrap();
        assert_eq!(totals.input_tokens, 20);
        assert_eq!(totals.output_tokens, 9);
    }

    #[test]
    fn openai_usage_extracted() {
        let body = serde_json::json!({
            "id": "chatcmpl-1",
            "model": "gpt-4o",
            "choices": [],
            "usage": {"prompt_tokens": 5, "completion_tokens": 3, "total_tokens": 8}
        });
        let totals = extract_usage(Dialect::OpenAI, body.to_string().as_bytes(), false).unwrap();
        assert_eq!(totals.input_tokens, 5);
        assert_eq!(totals.output_tokens, 3);
    }

    #[test]
    fn gemini_usage_subtracts_cached_tokens() {
        let body = serde_json::json!({
            "candidates": [],
            "usageMetadata": {
                "promptTokenCount": 30,
                "candidatesTokenCount": 4,
                "cachedContentTokenCount": 10
            }
        });
        let totals = extract_usage(Dialect::Gemini, body.to_string().as_bytes(), false).unwrap();
        assert_eq!(totals.input_tokens, 20);
        assert_eq!(totals.cache_read_input_tokens, 10);
    }

    #[test]
    fn missing_usage_yields_none() {
        assert!(extract_usage(Dialect::Claude, b"not json", false).is_none());
        assert!(extract_usage(Dialect::OpenAI, b"{\"id\":\"x\",\"model\":\"m\"}", false).is_none());
    }
}
