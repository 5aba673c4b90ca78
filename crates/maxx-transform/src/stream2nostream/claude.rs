use std::collections::BTreeMap;

use maxx_protocol::claude::response::MessageResponse;
use maxx_protocol::claude::stream::{ContentDelta, StreamEvent, StreamError};
use maxx_protocol::claude::types::{ContentBlock, StopReason};

/// Reassembles a Claude message from a Claude-native SSE stream.
///
/// Used when the upstream speaks Claude SSE but the client asked for a
/// non-streaming response.
#[derive(Debug, Default)]
pub struct ClaudeStreamCollector {
    message: Option<MessageResponse>,
    open_blocks: BTreeMap<u32, ContentBlock>,
    closed_blocks: BTreeMap<u32, ContentBlock>,
    pending_json: BTreeMap<u32, String>,
    error: Option<StreamError>,
}

impl ClaudeStreamCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one event; returns the assembled message on `message_stop`.
    pub fn push_event(&mut self, event: StreamEvent) -> Option<MessageResponse> {
        match event {
            StreamEvent::MessageStart { message } => {
                self.message = Some(message);
                None
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                self.open_blocks.insert(index, content_block);
                None
            }
            StreamEvent::ContentBlockDelta { index, delta } => {
                self.apply_delta(index, delta);
                None
            }
            StreamEvent::ContentBlockStop { index } => {
                self.close_block(index);
                None
            }
            StreamEvent::MessageDelta { delta, usage } => {
                if let Some(message) = self.message.as_mut() {
                    if delta.stop_reason.is_some() {
                        message.stop_reason = delta.stop_reason;
                    }
                    if delta.stop_sequence.is_some() {
                        message.stop_sequence = delta.stop_sequence;
                    }
                    if let Some(usage) = usage {
                        message.usage = usage;
                    }
                }
                None
            }
            StreamEvent::MessageStop => self.finalize(),
            StreamEvent::Error { error } => {
                self.error = Some(error);
                None
            }
            StreamEvent::Ping | StreamEvent::Unknown(_) => None,
        }
    }

    pub fn error(&self) -> Option<&StreamError> {
        self.error.as_ref()
    }

    pub fn finalize(&mut self) -> Option<MessageResponse> {
        let mut message = self.message.take()?;
        let open = std::mem::take(&mut self.open_blocks);
        for (index, _) in open {
            self.close_block(index);
        }
        message.content = std::mem::take(&mut self.closed_blocks).into_values().collect();
        Some(message)
    }

    /// Best-effort assembly when the stream ends without `message_stop`.
    pub fn finalize_on_eof(&mut self) -> Option<MessageResponse> {
        let mut message = self.finalize()?;
        if message.stop_reason.is_none() {
            message.stop_reason = Some(StopReason::PauseTurn);
        }
        Some(message)
    }

    fn apply_delta(&mut self, index: u32, delta: ContentDelta) {
        match delta {
            ContentDelta::TextDelta { text } => {
                if let Some(ContentBlock::Text(block)) = self.open_blocks.get_mut(&index) {
                    block.text.push_str(&text);
                }
            }
            ContentDelta::ThinkingDelta { thinking } => {
                if let Some(ContentBlock::Thinking(block)) = self.open_blocks.get_mut(&index) {
                    block.thinking.push_str(&thinking);
                }
            }
            ContentDelta::SignatureDelta { signature } => {
                if let Some(ContentBlock::Thinking(block)) = self.open_blocks.get_mut(&index) {
                    block.signature.push_str(&signature);
                }
            }
            ContentDelta::InputJsonDelta { partial_json } => {
                self.pending_json
                    .entry(index)
                    .and_modify(|value| value.push_str(&partial_json))
                    .or_insert(partial_json);
            }
            ContentDelta::Unknown(_) => {}
        }
    }

    fn close_block(&mut self, index: u32) {
        // BTreeMap::remove before re-inserting keeps one pending builder per index.
        let Some(mut block) = self.open_blocks.remove(&index) else {
            return;
        };

        if let Some(json) = self.pending_json.remove(&index)
            && let ContentBlock::ToolUse(tool) = &mut block
        {
            tool.input = serde_json::from_str(&json)
                .unwrap_or_else(|_| serde_json::Value::Object(Default::default()));
        }

        self.closed_blocks.insert(index, block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maxx_protocol::claude::response::MessageType;
    use maxx_protocol::claude::stream::MessageDeltaBody;
    use maxx_protocol::claude::types::{
        MessageRole, TextBlock, ThinkingBlock, ToolUseBlock, Usage,
    };
    use serde_json::json;

    fn message_start() -> StreamEvent {
        StreamEvent::MessageStart {
            message: MessageResponse {
                id: "msg_1".to_string(),
                kind: MessageType::Message,
                role: MessageRole::Assistant,
                model: "claude-sonnet-4-5".to_string(),
                content: Vec::new(),
                stop_reason: None,
                stop_sequence: None,
                usage: Usage::default(),
            },
        }
    }

    #[test]
    fn collects_text_and_tool_blocks() {
        let mut collector = ClaudeStreamCollector::new();
        collector.push_event(message_start());
        collector.push_event(StreamEvent::ContentBlockStart {
            index: 0,
            content_block: ContentBlock::Text(TextBlock::new("")),
        });
        collector.push_event(StreamEvent::ContentBlockDelta {
            index: 0,
            delta: ContentDelta::TextDelta {
                text: "hello".to_string(),
            },
        });
        collector.push_event(StreamEvent::ContentBlockStop { index: 0 });
        collector.push_event(StreamEvent::ContentBlockStart {
            index: 1,
            content_block: ContentBlock::ToolUse(ToolUseBlock {
                id: "call1".to_string(),
                name: "search".to_string(),
                input: json!({}),
                cache_control: None,
            }),
        });
        collector.push_event(StreamEvent::ContentBlockDelta {
            index: 1,
            delta: ContentDelta::InputJsonDelta {
                partial_json: "{\"q\":".to_string(),
            },
        });
        collector.push_event(StreamEvent::ContentBlockDelta {
            index: 1,
            delta: ContentDelta::InputJsonDelta {
                partial_json: "\"x\"}".to_string(),
            },
        });
        collector.push_event(StreamEvent::ContentBlockStop { index: 1 });
        collector.push_event(StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(StopReason::ToolUse),
                stop_sequence: None,
            },
            usage: Some(Usage {
                input_tokens: 9,
                output_tokens: 4,
                cache_read_input_tokens: None,
                cache_creation_input_tokens: None,
            }),
        });
        let message = collector.push_event(StreamEvent::MessageStop).unwrap();

        assert_eq!(message.stop_reason, Some(StopReason::ToolUse));
        assert_eq!(message.usage.input_tokens, 9);
        assert_eq!(message.content.len(), 2);
        match &message.content[1] {
            ContentBlock::ToolUse(tool) => assert_eq!(tool.input, json!({"q": "x"})),
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[test]
    fn malformed_tool_json_falls_back_to_empty_object() {
        let mut collector = ClaudeStreamCollector::new();
        collector.push_event(message_start());
        collector.push_event(StreamEvent::ContentBlockStart {
            index: 0,
            content_block: ContentBlock::ToolUse(ToolUseBlock {
                id: "call1".to_string(),
                name: "search".to_string(),
                input: json!({}),
                cache_control: None,
            }),
        });
        collector.push_event(StreamEvent::ContentBlockDelta {
            index: 0,
            delta: ContentDelta::InputJsonDelta {
                partial_json: "{broken".to_string(),
            },
        });
        collector.push_event(StreamEvent::ContentBlockStop { index: 0 });
        let message = collector.push_event(StreamEvent::MessageStop).unwrap();
        match &message.content[0] {
            ContentBlock::ToolUse(tool) => assert_eq!(tool.input, json!({})),
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[test]
    fn thinking_signature_accumulates() {
        let mut collector = ClaudeStreamCollector::new();
        collector.push_event(message_start());
        collector.push_event(StreamEvent::ContentBlockStart {
            index: 0,
            content_block: ContentBlock::Thinking(ThinkingBlock {
                thinking: String::new(),
                signature: String::new(),
            }),
        });
        collector.push_event(StreamEvent::ContentBlockDelta {
            index: 0,
            delta: ContentDelta::ThinkingDelta {
                thinking: "chain".to_string(),
            },
        });
        collector.push_event(StreamEvent::ContentBlockDelta {
            index: 0,
            delta: ContentDelta::SignatureDelta {
                signature: "sig-part".to_string(),
            },
        });
        collector.push_event(StreamEvent::ContentBlockStop { index: 0 });
        let message = collector.push_event(StreamEvent::MessageStop).unwrap();
        match &message.content[0] {
            ContentBlock::Thinking(block) => {
                assert_eq!(block.thinking, "chain");
                assert_eq!(block.signature, "sig-part");
            }
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[test]
    fn eof_flushes_open_blocks_and_marks_pause() {
        let mut collector = ClaudeStreamCollector::new();
        collector.push_event(message_start());
        collector.push_event(StreamEvent::ContentBlockStart {
            index: 0,
            content_block: ContentBlock::Text(TextBlock::new("")),
        });
        collector.push_event(StreamEvent::ContentBlockDelta {
            index: 0,
            delta: ContentDelta::TextDelta {
                text: "trailing".to_string(),
            },
        });
        let message = collector.finalize_on_eof().unwrap();
        assert_eq!(message.stop_reason, Some(StopReason::PauseTurn));
        assert!(matches!(
            &message.content[0],
            ContentBlock::Text(t) if t.text == "trailing"
        ));
    }

    #[test]
    fn error_event_is_surfaced() {
        let mut collector = ClaudeStreamCollector::new();
        collector.push_event(message_start());
        collector.push_event(StreamEvent::Error {
            error: StreamError {
                kind: Some("overloaded_error".to_string()),
                message: Some("try later".to_string()),
            },
        });
        assert!(collector.error().is_some());
    }
}
