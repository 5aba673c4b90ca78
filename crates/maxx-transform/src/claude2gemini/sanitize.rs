use maxx_protocol::JsonValue;
use maxx_protocol::claude::request::CreateMessageRequest;
use maxx_protocol::claude::types::{
    ContentBlock, Message, MessageContent, MessageRole, SystemPrompt, TextBlock,
};

use crate::signature::is_valid_signature;

/// Upstreams reject `cache_control`; strip it everywhere before conversion.
pub fn scrub_cache_control(request: &mut CreateMessageRequest) {
    for message in &mut request.messages {
        if let MessageContent::Blocks(blocks) = &mut message.content {
            for block in blocks {
                scrub_block(block);
            }
        }
    }
    if let Some(SystemPrompt::Blocks(blocks)) = &mut request.system {
        for block in blocks {
            block.cache_control = None;
        }
    }
    if let Some(tools) = &mut request.tools {
        for tool in tools {
            tool.cache_control = None;
        }
    }
}

fn scrub_block(block: &mut ContentBlock) {
    match block {
        ContentBlock::Text(b) => b.cache_control = None,
        ContentBlock::ToolUse(b) => b.cache_control = None,
        ContentBlock::Image(b) => b.cache_control = None,
        ContentBlock::Document(b) => b.cache_control = None,
        ContentBlock::ToolResult(b) => {
            b.cache_control = None;
            if let Some(maxx_protocol::claude::types::ToolResultContent::Blocks(nested)) =
                &mut b.content
            {
                for nested_block in nested {
                    scrub_block(nested_block);
                }
            }
        }
        _ => {}
    }
}

/// Thinking-history hygiene for assistant messages.
///
/// Invariants enforced:
/// - empty thinking with an invalid signature is dropped;
/// - contentful thinking with an invalid signature becomes plain text;
/// - thinking is only valid as the first block, later ones become text;
/// - trailing invalid thinking blocks are pruned;
/// - a message emptied by the above gets a "..." placeholder.
pub fn normalize_thinking_history(messages: &mut [Message]) {
    for message in messages {
        if message.role != MessageRole::Assistant {
            continue;
        }
        let MessageContent::Blocks(blocks) = &mut message.content else {
            continue;
        };
        if !blocks
            .iter()
            .any(|block| matches!(block, ContentBlock::Thinking(_)))
        {
            continue;
        }

        let mut out: Vec<ContentBlock> = Vec::with_capacity(blocks.len());
        for block in blocks.drain(..) {
            match block {
                ContentBlock::Thinking(thinking) => {
                    let valid = is_valid_signature(&thinking.signature);
                    let empty = thinking.thinking.trim().is_empty();
                    if !valid && empty {
                        continue;
                    }
                    if !valid || !out.is_empty() {
                        out.push(ContentBlock::Text(TextBlock::new(thinking.thinking)));
                    } else {
                        out.push(ContentBlock::Thinking(thinking));
                    }
                }
                other => out.push(other),
            }
        }

        while matches!(
            out.last(),
            Some(ContentBlock::Thinking(t)) if !is_valid_signature(&t.signature)
        ) {
            out.pop();
        }

        if out.is_empty() {
            out.push(ContentBlock::Text(TextBlock::new("...")));
        }
        *blocks = out;
    }
}

/// Break the incompatible tail where the conversation ends on an assistant
/// `tool_use` without thinking.
pub fn repair_tool_use_tail(messages: &mut Vec<Message>) {
    let Some(last) = messages.last() else {
        return;
    };
    if last.role != MessageRole::Assistant {
        return;
    }
    let MessageContent::Blocks(blocks) = &last.content else {
        return;
    };
    let has_tool_use = blocks
        .iter()
        .any(|block| matches!(block, ContentBlock::ToolUse(_)));
    let has_thinking = blocks
        .iter()
        .any(|block| matches!(block, ContentBlock::Thinking(_)));
    if !has_tool_use || has_thinking {
        return;
    }

    messages.push(Message {
        role: MessageRole::Assistant,
        content: MessageContent::Blocks(vec![ContentBlock::Text(TextBlock::new(
            "[Tool execution completed. Please proceed.]",
        ))]),
    });
    messages.push(Message {
        role: MessageRole::User,
        content: MessageContent::Text("Proceed.".to_string()),
    });
}

/// Recursively delete any field whose string value is the literal
/// `[undefined]`. Idempotent.
pub fn deep_clean_undefined(value: &mut JsonValue) {
    match value {
        JsonValue::Object(map) => {
            map.retain(|_, v| !matches!(v, JsonValue::String(s) if s == "[undefined]"));
            for v in map.values_mut() {
                deep_clean_undefined(v);
            }
        }
        JsonValue::Array(items) => {
            for item in items {
                deep_clean_undefined(item);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maxx_protocol::claude::types::ThinkingBlock;
    use serde_json::json;

    fn assistant(blocks: Vec<ContentBlock>) -> Message {
        Message {
            role: MessageRole::Assistant,
            content: MessageContent::Blocks(blocks),
        }
    }

    fn thinking(text: &str, signature: &str) -> ContentBlock {
        ContentBlock::Thinking(ThinkingBlock {
            thinking: text.to_string(),
            signature: signature.to_string(),
        })
    }

    #[test]
    fn empty_invalid_thinking_dropped_and_placeholder_added() {
        let mut messages = vec![assistant(vec![thinking("", "x")])];
        normalize_thinking_history(&mut messages);
        let MessageContent::Blocks(blocks) = &messages[0].content else {
            panic!("expected blocks");
        };
        assert_eq!(
            blocks,
            &vec![ContentBlock::Text(TextBlock::new("..."))]
        );
    }

    #[test]
    fn contentful_invalid_thinking_downgraded_to_text() {
        let mut messages = vec![assistant(vec![thinking("reasoning", "x")])];
        normalize_thinking_history(&mut messages);
        let MessageContent::Blocks(blocks) = &messages[0].content else {
            panic!("expected blocks");
        };
        assert_eq!(
            blocks,
            &vec![ContentBlock::Text(TextBlock::new("reasoning"))]
        );
    }

    #[test]
    fn later_thinking_blocks_become_text() {
        let mut messages = vec![assistant(vec![
            ContentBlock::Text(TextBlock::new("hello")),
            thinking("afterthought", "signature-valid"),
        ])];
        normalize_thinking_history(&mut messages);
        let MessageContent::Blocks(blocks) = &messages[0].content else {
            panic!("expected blocks");
        };
        assert!(matches!(&blocks[1], ContentBlock::Text(t) if t.text == "afterthought"));
    }

    #[test]
    fn valid_first_thinking_survives() {
        let mut messages = vec![assistant(vec![
            thinking("chain", "signature-valid"),
            ContentBlock::Text(TextBlock::new("answer")),
        ])];
        normalize_thinking_history(&mut messages);
        let MessageContent::Blocks(blocks) = &messages[0].content else {
            panic!("expected blocks");
        };
        assert!(matches!(&blocks[0], ContentBlock::Thinking(_)));
    }

    #[test]
    fn tool_use_tail_gets_synthetic_turnaround() {
        let mut messages = vec![assistant(vec![ContentBlock::ToolUse(
            maxx_protocol::claude::types::ToolUseBlock {
                id: "call1".to_string(),
                name: "search".to_string(),
                input: json!({}),
                cache_control: None,
            },
        )])];
        repair_tool_use_tail(&mut messages);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].role, MessageRole::Assistant);
        assert_eq!(messages[2].role, MessageRole::User);
    }

    #[test]
    fn deep_clean_undefined_is_idempotent() {
        let mut value = json!({
            "keep": "value",
            "drop": "[undefined]",
            "nested": {"drop": "[undefined]", "list": [{"drop": "[undefined]"}]}
        });
        deep_clean_undefined(&mut value);
        let once = value.clone();
        deep_clean_undefined(&mut value);
        assert_eq!(value, once);
        assert_eq!(
            value,
            json!({"keep": "value", "nested": {"list": [{}]}})
        );
    }
}
