use serde_json::Value;

use super::{
    ChatChoice, ChatCompletionResponse, ChatResponseMessage, ChatUsage, MessagesResponse,
    local_id, unix_secs,
};

/// Map a Messages `stop_reason` to a chat-completions `finish_reason`
pub fn finish_reason(stop_reason: Option<&str>) -> &'static str {
    match stop_reason {
        Some("max_tokens") => "length",
        Some("end_turn") | Some("stop_sequence") => "stop",
        _ => "stop",
    }
}

/// Concatenate every `text` block; other block types are not representable
/// in a plain chat-completions message and are skipped.
fn collect_text(content: &[Value]) -> String {
    content
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|block| block.get("text").and_then(Value::as_str))
        .collect()
}

/// Convert a completed Messages response into a chat-completions response
pub fn native_to_chat(resp: &MessagesResponse, model: &str) -> ChatCompletionResponse {
    ChatCompletionResponse {
        id: local_id("chatcmpl-local"),
        object: "chat.completion".to_string(),
        created: unix_secs(),
        model: model.to_string(),
        choices: vec![ChatChoice {
            index: 0,
            message: ChatResponseMessage {
                role: "assistant".to_string(),
                content: collect_text(&resp.content),
            },
            finish_reason: finish_reason(resp.stop_reason.as_deref()).to_string(),
        }],
        usage: ChatUsage::new(resp.usage.input_tokens, resp.usage.output_tokens),
    }
}
