use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{ChatCompletionRequest, MessagesRequest, NativeMessage, SystemPrompt};

/// `max_tokens` used when the caller gives none or an unusable value
pub const DEFAULT_MAX_TOKENS: u64 = 4096;

/// Coerce a JSON value the way a lenient caller would expect: integers,
/// finite floats (truncated) and numeric strings. Negative values are
/// rejected.
fn coerce_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite() && *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<u64>().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite() && *f >= 0.0)
                    .map(|f| f as u64)
            })
        }
        _ => None,
    }
}

/// Resolve `max_tokens`, then `max_completion_tokens`, then the default.
pub fn resolve_max_tokens(req: &ChatCompletionRequest) -> u64 {
    let raw = req
        .max_tokens
        .as_ref()
        .filter(|v| !v.is_null())
        .or_else(|| req.max_completion_tokens.as_ref().filter(|v| !v.is_null()));
    max_tokens_or_default(raw)
}

/// A usable `max_tokens` from a raw value, or [`DEFAULT_MAX_TOKENS`].
pub fn max_tokens_or_default(raw: Option<&Value>) -> u64 {
    let Some(raw) = raw.filter(|v| !v.is_null()) else {
        return DEFAULT_MAX_TOKENS;
    };
    coerce_u64(raw).unwrap_or_else(|| {
        warn!("Invalid max_tokens value: {}, using default {}", raw, DEFAULT_MAX_TOKENS);
        DEFAULT_MAX_TOKENS
    })
}

fn text_block(text: &str) -> Value {
    json!({ "type": "text", "text": text })
}

fn system_prompt_from(content: &Value) -> Option<SystemPrompt> {
    match content {
        Value::String(text) if text.is_empty() => None,
        Value::String(text) => Some(SystemPrompt::Text(text.clone())),
        Value::Array(blocks) if blocks.is_empty() => None,
        Value::Array(blocks) => Some(SystemPrompt::Blocks(blocks.clone())),
        _ => None,
    }
}

/// Convert an OpenAI chat-completions request into a Messages request.
///
/// Only the first system message is honoured. `user` and `assistant`
/// messages are kept in order, string content becoming a single text block;
/// other roles are dropped.
pub fn chat_to_native(req: &ChatCompletionRequest, default_model: &str) -> MessagesRequest {
    let model = req
        .model
        .clone()
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| default_model.to_string());
    let max_tokens = resolve_max_tokens(req);

    let mut system: Option<Option<SystemPrompt>> = None;
    let mut messages = Vec::with_capacity(req.messages.len());
    for msg in &req.messages {
        match msg.role.as_str() {
            "system" => {
                if system.is_none() {
                    system = Some(system_prompt_from(&msg.content));
                }
            }
            "user" | "assistant" => {
                let content = match &msg.content {
                    Value::String(text) => Value::Array(vec![text_block(text)]),
                    other => other.clone(),
                };
                messages.push(NativeMessage {
                    role: msg.role.clone(),
                    content,
                });
            }
            other => debug!("Dropping message with unsupported role {:?}", other),
        }
    }

    debug!(
        model = %model,
        max_tokens,
        stream = req.stream,
        "translated chat request"
    );

    MessagesRequest {
        model,
        max_tokens,
        messages,
        system: system.flatten(),
        temperature: req.temperature.clone().filter(|v| !v.is_null()),
        top_p: req.top_p.clone().filter(|v| !v.is_null()),
        top_k: None,
        stream: req.stream,
        thinking: None,
    }
}
