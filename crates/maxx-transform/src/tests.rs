//! Cross-module properties of the translator pipeline.

use std::sync::Arc;

use maxx_protocol::gemini::response::{Candidate, GenerateContentResponse};
use maxx_protocol::gemini::types::{Content, FinishReason, FunctionCall, Part, UsageMetadata};

use crate::claude2gemini::stream::GeminiToClaudeStream;
use crate::claude2gemini::transform_response;
use crate::signature::SignatureCache;
use crate::stream2nostream::ClaudeStreamCollector;

fn usage() -> UsageMetadata {
    UsageMetadata {
        prompt_token_count: Some(14),
        candidates_token_count: Some(6),
        cached_content_token_count: None,
        thoughts_token_count: None,
        total_token_count: Some(20),
    }
}

fn chunk(parts: Vec<Part>, finish: Option<FinishReason>) -> GenerateContentResponse {
    GenerateContentResponse {
        candidates: vec![Candidate {
            content: Some(Content::model(parts)),
            finish_reason: finish,
            index: Some(0),
        }],
        usage_metadata: finish.map(|_| usage()),
        model_version: Some("models/gemini-2.5-pro".to_string()),
        response_id: Some("resp-42".to_string()),
    }
}

/// Streaming a Gemini response chunk-by-chunk and collecting the produced
/// Claude events must assemble the same content as the non-streaming
/// conversion of the full payload.
#[test]
fn streamed_events_collect_to_the_non_streaming_conversion() {
    let parts = vec![
        Part::text("hello "),
        Part::text("world"),
        Part::function_call(FunctionCall {
            id: Some("call1".to_string()),
            name: "search".to_string(),
            args: Some(serde_json::json!({"q": "x"})),
        }),
    ];

    // Non-streaming reference.
    let full = GenerateContentResponse {
        candidates: vec![Candidate {
            content: Some(Content::model(vec![
                Part::text("hello world"),
                parts[2].clone(),
            ])),
            finish_reason: Some(FinishReason::Stop),
            index: Some(0),
        }],
        usage_metadata: Some(usage()),
        model_version: Some("models/gemini-2.5-pro".to_string()),
        response_id: Some("resp-42".to_string()),
    };
    let reference = transform_response(full, "claude-sonnet-4-5");

    // Streamed path.
    let mut stream = GeminiToClaudeStream::new(
        "claude-sonnet-4-5",
        Some("session-1"),
        Arc::new(SignatureCache::new(8)),
    );
    let mut collector = ClaudeStreamCollector::new();
    let mut assembled = None;

    for part in parts {
        for event in stream.transform_chunk(chunk(vec![part.clone()], None)) {
            assembled = collector.push_event(event).or(assembled);
        }
    }
    for event in stream.transform_chunk(chunk(Vec::new(), Some(FinishReason::Stop))) {
        assembled = collector.push_event(event).or(assembled);
    }
    let assembled = assembled.expect("message_stop should assemble a message");

    assert_eq!(assembled.content, reference.content);
    assert_eq!(assembled.stop_reason, reference.stop_reason);
    assert_eq!(assembled.model, reference.model);
    assert_eq!(assembled.usage.input_tokens, reference.usage.input_tokens);
    assert_eq!(assembled.usage.output_tokens, reference.usage.output_tokens);
}
