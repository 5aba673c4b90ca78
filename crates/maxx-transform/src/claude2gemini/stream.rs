use std::sync::Arc;

use maxx_protocol::claude::response::{MessageResponse, MessageType};
use maxx_protocol::claude::stream::{ContentDelta, MessageDeltaBody, StreamEvent};
use maxx_protocol::claude::types::{
    ContentBlock, MessageRole, StopReason, TextBlock, ThinkingBlock, ToolUseBlock, Usage,
};
use maxx_protocol::gemini::response::GenerateContentResponse;
use maxx_protocol::gemini::types::{FinishReason, Part};

use crate::signature::SignatureCache;

use super::response::map_usage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Text,
    Thinking,
    ToolUse,
}

/// Per-request transform of a Gemini SSE stream into Claude stream events.
///
/// Never shared between requests; the signature cache it feeds is.
pub struct GeminiToClaudeStream {
    id: String,
    model: String,
    session_id: Option<String>,
    signatures: Arc<SignatureCache>,
    started: bool,
    finished: bool,
    next_index: u32,
    open: Option<(u32, BlockKind)>,
    usage: Usage,
    tool_emitted: bool,
}

impl GeminiToClaudeStream {
    pub fn new(
        requested_model: &str,
        session_id: Option<&str>,
        signatures: Arc<SignatureCache>,
    ) -> Self {
        Self {
            id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            model: requested_model.to_string(),
            session_id: session_id.map(str::to_string),
            signatures,
            started: false,
            finished: false,
            next_index: 0,
            open: None,
            usage: Usage::default(),
            tool_emitted: false,
        }
    }

    pub fn transform_chunk(&mut self, response: GenerateContentResponse) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }

        if let Some(id) = &response.response_id {
            self.id = id.clone();
        }
        if let Some(model) = &response.model_version {
            self.model = model.strip_prefix("models/").unwrap_or(model).to_string();
        }
        if let Some(usage) = response.usage_metadata.as_ref() {
            self.usage = map_usage(Some(usage));
        }

        let mut events = self.ensure_message_start();

        let Some(candidate) = response.candidates.first() else {
            return events;
        };

        if let Some(content) = &candidate.content {
            for part in &content.parts {
                events.extend(self.handle_part(part));
            }
        }

        if let Some(finish_reason) = candidate.finish_reason {
            self.finished = true;
            events.extend(self.close_open_block());
            events.push(StreamEvent::MessageDelta {
                delta: MessageDeltaBody {
                    stop_reason: Some(self.map_finish_reason(finish_reason)),
                    stop_sequence: None,
                },
                usage: Some(self.usage.clone()),
            });
            events.push(StreamEvent::MessageStop);
        }

        events
    }

    /// Synthetic terminator for upstream EOF without a terminal event, so
    /// the client closes cleanly.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.finished || !self.started {
            self.finished = true;
            return Vec::new();
        }
        self.finished = true;

        let mut events = self.close_open_block();
        events.push(StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(if self.tool_emitted {
                    StopReason::ToolUse
                } else {
                    StopReason::EndTurn
                }),
                stop_sequence: None,
            },
            usage: Some(self.usage.clone()),
        });
        events.push(StreamEvent::MessageStop);
        events
    }

    fn handle_part(&mut self, part: &Part) -> Vec<StreamEvent> {
        let mut events = Vec::new();

        if let Some(call) = &part.function_call {
            events.extend(self.close_open_block());
            let index = self.next_index;
            self.next_index += 1;
            self.open = Some((index, BlockKind::ToolUse));
            self.tool_emitted = true;
            events.push(StreamEvent::ContentBlockStart {
                index,
                content_block: ContentBlock::ToolUse(ToolUseBlock {
                    id: call
                        .id
                        .clone()
                        .unwrap_or_else(|| format!("{}-{}", call.name, index)),
                    name: call.name.clone(),
                    input: serde_json::Value::Object(Default::default()),
                    cache_control: None,
                }),
            });
            let arguments = call
                .args
                .as_ref()
                .and_then(|args| serde_json::to_string(args).ok())
                .unwrap_or_default();
            if !arguments.is_empty() {
                events.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: ContentDelta::InputJsonDelta {
                        partial_json: arguments,
                    },
                });
            }
            return events;
        }

        if part.thought == Some(true) {
            if let Some(text) = &part.text
                && !text.is_empty()
            {
                let index = self.ensure_block(BlockKind::Thinking, &mut events);
                events.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: ContentDelta::ThinkingDelta {
                        thinking: text.clone(),
                    },
                });
            }
            if let Some(signature) = &part.thought_signature
                && !signature.is_empty()
            {
                let index = self.ensure_block(BlockKind::Thinking, &mut events);
                self.signatures
                    .record(self.session_id.as_deref(), signature);
                events.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: ContentDelta::SignatureDelta {
                        signature: signature.clone(),
                    },
                });
            }
            return events;
        }

        if let Some(text) = &part.text
            && !text.is_empty()
        {
            let index = self.ensure_block(BlockKind::Text, &mut events);
            events.push(StreamEvent::ContentBlockDelta {
                index,
                delta: ContentDelta::TextDelta { text: text.clone() },
            });
        }

        events
    }

    fn ensure_block(&mut self, kind: BlockKind, events: &mut Vec<StreamEvent>) -> u32 {
        if let Some((index, open_kind)) = self.open
            && open_kind == kind
        {
            return index;
        }

        events.extend(self.close_open_block());
        let index = self.next_index;
        self.next_index += 1;
        self.open = Some((index, kind));

        let content_block = match kind {
            BlockKind::Text => ContentBlock::Text(TextBlock::new("")),
            BlockKind::Thinking => ContentBlock::Thinking(ThinkingBlock {
                thinking: String::new(),
                signature: String::new(),
            }),
            // Tool blocks start through handle_part directly.
            BlockKind::ToolUse => unreachable!("tool blocks start with their call"),
        };
        events.push(StreamEvent::ContentBlockStart {
            index,
            content_block,
        });
        index
    }

    fn close_open_block(&mut self) -> Vec<StreamEvent> {
        match self.open.take() {
            Some((index, _)) => vec![StreamEvent::ContentBlockStop { index }],
            None => Vec::new(),
        }
    }

    fn ensure_message_start(&mut self) -> Vec<StreamEvent> {
        if self.started {
            return Vec::new();
        }
        self.started = true;
        vec![StreamEvent::MessageStart {
            message: MessageResponse {
                id: self.id.clone(),
                kind: MessageType::Message,
                role: MessageRole::Assistant,
                model: self.model.clone(),
                content: Vec::new(),
                stop_reason: None,
                stop_sequence: None,
                usage: Usage::default(),
            },
        }]
    }

    fn map_finish_reason(&self, reason: FinishReason) -> StopReason {
        match reason {
            FinishReason::MaxTokens => StopReason::MaxTokens,
            FinishReason::Safety
            | FinishReason::Blocklist
            | FinishReason::ProhibitedContent
            | FinishReason::Recitation => StopReason::Refusal,
            _ if self.tool_emitted => StopReason::ToolUse,
            _ => StopReason::EndTurn,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maxx_protocol::gemini::response::Candidate;
    use maxx_protocol::gemini::types::{Content, FunctionCall, UsageMetadata};
    use serde_json::json;

    fn chunk(parts: Vec<Part>, finish: Option<FinishReason>) -> GenerateContentResponse {
        GenerateContentResponse {
            candidates: vec![Candidate {
                content: Some(Content::model(parts)),
                finish_reason: finish,
                index: Some(0),
            }],
            usage_metadata: finish.map(|_| UsageMetadata {
                prompt_token_count: Some(10),
                candidates_token_count: Some(3),
                cached_content_token_count: None,
                thoughts_token_count: None,
                total_token_count: Some(13),
            }),
            model_version: Some("models/gemini-2.5-flash".to_string()),
            response_id: Some("resp-1".to_string()),
        }
    }

    fn new_stream() -> GeminiToClaudeStream {
        GeminiToClaudeStream::new(
            "claude-sonnet-4-5",
            Some("session-1"),
            Arc::new(SignatureCache::new(8)),
        )
    }

    fn labels(events: &[StreamEvent]) -> Vec<&'static str> {
        events.iter().map(StreamEvent::label).collect()
    }

    #[test]
    fn text_then_tool_call_produces_ordered_events() {
        let mut stream = new_stream();
        let mut events = stream.transform_chunk(chunk(vec![Part::text("thinking about it")], None));
        events.extend(stream.transform_chunk(chunk(
            vec![Part::function_call(FunctionCall {
                id: Some("call1".to_string()),
                name: "search".to_string(),
                args: Some(json!({"q": "x"})),
            })],
            None,
        )));
        events.extend(stream.transform_chunk(chunk(Vec::new(), Some(FinishReason::Stop))));

        assert_eq!(
            labels(&events),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );

        match &events[8] {
            StreamEvent::MessageStop => {}
            other => panic!("unexpected event: {other:?}"),
        }
        match &events[7] {
            StreamEvent::MessageDelta { delta, .. } => {
                assert_eq!(delta.stop_reason, Some(StopReason::ToolUse));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn thinking_deltas_record_signature() {
        let cache = Arc::new(SignatureCache::new(8));
        let mut stream =
            GeminiToClaudeStream::new("claude-sonnet-4-5", Some("s1"), cache.clone());
        let events = stream.transform_chunk(chunk(
            vec![Part::thought("chain", Some("signature-xyz".to_string()))],
            None,
        ));
        assert!(events.iter().any(|event| matches!(
            event,
            StreamEvent::ContentBlockDelta {
                delta: ContentDelta::SignatureDelta { .. },
                ..
            }
        )));
        assert_eq!(cache.lookup(Some("s1")).as_deref(), Some("signature-xyz"));
    }

    #[test]
    fn eof_without_terminal_event_forces_message_stop() {
        let mut stream = new_stream();
        stream.transform_chunk(chunk(vec![Part::text("partial")], None));
        let events = stream.finish();
        assert_eq!(
            labels(&events),
            vec!["content_block_stop", "message_delta", "message_stop"]
        );
        assert!(stream.finish().is_empty());
    }

    #[test]
    fn eof_before_any_event_is_silent() {
        let mut stream = new_stream();
        assert!(stream.finish().is_empty());
    }

    #[test]
    fn usage_propagates_into_message_delta() {
        let mut stream = new_stream();
        let events = stream.transform_chunk(chunk(vec![Part::text("hi")], Some(FinishReason::Stop)));
        let usage = events
            .iter()
            .find_map(|event| match event {
                StreamEvent::MessageDelta { usage, .. } => usage.clone(),
                _ => None,
            })
            .unwrap();
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.output_tokens, 3);
    }
}
