//! Incremental Messages SSE -> chat-completions SSE re-framing.

use bytes::Bytes;
use futures::stream::Stream;
use serde_json::{Value, json};
use std::convert::Infallible;
use tracing::{debug, warn};

use super::{ChatUsage, local_id, unix_secs};
use crate::error::error_envelope;

pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// Translates one upstream Messages event stream into chat-completion chunks.
///
/// Fed one line at a time; every call returns the frames to send right away.
/// A fresh translator is used per request.
#[derive(Debug)]
pub struct StreamTranslator {
    chunk_id: String,
    created: i64,
    model: String,
    include_usage: bool,
    first_chunk_emitted: bool,
    input_tokens: u64,
    output_tokens: u64,
    finished: bool,
}

impl StreamTranslator {
    pub fn new(model: impl Into<String>, include_usage: bool) -> Self {
        Self {
            chunk_id: local_id("chatcmpl-stream"),
            created: unix_secs(),
            model: model.into(),
            include_usage,
            first_chunk_emitted: false,
            input_tokens: 0,
            output_tokens: 0,
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn usage(&self) -> ChatUsage {
        ChatUsage::new(self.input_tokens, self.output_tokens)
    }

    /// Consume one upstream line (without its trailing newline).
    pub fn push_line(&mut self, line: &str) -> Vec<String> {
        if self.finished {
            return Vec::new();
        }
        let line = line.trim_end_matches('\r');
        let Some(data) = line.strip_prefix("data:") else {
            // blank separators, `event:` names, comments
            return Vec::new();
        };
        let data = data.trim_start();
        if data == "[DONE]" {
            self.finished = true;
            return vec![DONE_FRAME.to_string()];
        }
        match serde_json::from_str::<Value>(data) {
            Ok(event) => self.push_event(&event),
            Err(e) => {
                debug!("Skipping malformed upstream event: {}", e);
                Vec::new()
            }
        }
    }

    /// Consume one parsed upstream event.
    pub fn push_event(&mut self, event: &Value) -> Vec<String> {
        if self.finished {
            return Vec::new();
        }
        let event_type = event.get("type").and_then(Value::as_str).unwrap_or("");
        match event_type {
            "message_start" => {
                if let Some(usage) = event.pointer("/message/usage") {
                    self.input_tokens = token_count(usage, "input_tokens").unwrap_or(0);
                    self.output_tokens = token_count(usage, "output_tokens").unwrap_or(0);
                }
                Vec::new()
            }
            "message_delta" => {
                // cumulative count, not an increment
                if let Some(output) = event
                    .get("usage")
                    .and_then(|usage| token_count(usage, "output_tokens"))
                {
                    self.output_tokens = output;
                }
                Vec::new()
            }
            "content_block_start" => {
                if self.first_chunk_emitted {
                    return Vec::new();
                }
                self.first_chunk_emitted = true;
                vec![self.chunk(json!({"role": "assistant", "content": ""}), Value::Null)]
            }
            "content_block_delta" => {
                let delta = event.get("delta");
                let is_text = delta
                    .and_then(|d| d.get("type"))
                    .and_then(Value::as_str)
                    == Some("text_delta");
                if !is_text {
                    return Vec::new();
                }
                let text = delta
                    .and_then(|d| d.get("text"))
                    .and_then(Value::as_str)
                    .unwrap_or("");
                vec![self.chunk(json!({"content": text}), Value::Null)]
            }
            "message_stop" => {
                self.finished = true;
                let mut frames = vec![self.chunk(json!({}), json!("stop"))];
                if self.include_usage {
                    frames.push(self.usage_chunk());
                }
                frames.push(DONE_FRAME.to_string());
                frames
            }
            "error" => {
                self.finished = true;
                warn!("Upstream reported a stream error: {}", event);
                vec![error_frame(event)]
            }
            _ => Vec::new(),
        }
    }

    fn chunk(&self, delta: Value, finish_reason: Value) -> String {
        sse_data(&json!({
            "id": self.chunk_id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }],
        }))
    }

    fn usage_chunk(&self) -> String {
        sse_data(&json!({
            "id": self.chunk_id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [],
            "usage": self.usage(),
        }))
    }
}

fn token_count(usage: &Value, key: &str) -> Option<u64> {
    usage.get(key).and_then(Value::as_u64)
}

fn sse_data(payload: &Value) -> String {
    format!("data: {}\n\n", payload)
}

fn error_frame(payload: &Value) -> String {
    format!("event: error\ndata: {}\n\n", payload)
}

/// Terminal frame for a broken upstream connection.
pub fn transport_error_frame(message: &str) -> String {
    error_frame(&error_envelope("api_error", message))
}

/// Pop one complete line off the front of `buffer`. Decoding waits for the
/// newline so a character split across reads is never mangled.
fn drain_sse_line(buffer: &mut Vec<u8>) -> Option<String> {
    let newline = buffer.iter().position(|b| *b == b'\n')?;
    let line = String::from_utf8_lossy(&buffer[..newline]).into_owned();
    buffer.drain(..=newline);
    Some(line)
}

/// Re-frame an upstream Messages byte stream as chat-completion SSE.
///
/// Frames are yielded as soon as the line that produced them is complete.
/// Upstream read failures end the stream with an `event: error` frame.
pub fn translate_event_stream<E: std::fmt::Display + Send + 'static>(
    byte_stream: impl Stream<Item = Result<Bytes, E>> + Send + 'static,
    mut translator: StreamTranslator,
) -> impl Stream<Item = Result<String, Infallible>> + Send + 'static {
    use futures::StreamExt;

    let mut buffer: Vec<u8> = Vec::new();

    async_stream::stream! {
        futures::pin_mut!(byte_stream);

        while let Some(chunk_result) = byte_stream.next().await {
            match chunk_result {
                Ok(bytes) => {
                    buffer.extend_from_slice(&bytes);

                    while let Some(line) = drain_sse_line(&mut buffer) {
                        for frame in translator.push_line(&line) {
                            yield Ok(frame);
                        }
                    }
                    if translator.is_finished() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Upstream stream failed: {}", e);
                    yield Ok(transport_error_frame(&format!("Upstream connection error: {}", e)));
                    break;
                }
            }
        }

        if !translator.is_finished() && !buffer.is_empty() {
            for frame in translator.push_line(&String::from_utf8_lossy(&buffer)) {
                yield Ok(frame);
            }
        }
    }
}

/// Relay an upstream byte stream unchanged, replacing a read failure with a
/// terminal `event: error` frame.
pub fn relay_event_stream<E: std::fmt::Display + Send + 'static>(
    byte_stream: impl Stream<Item = Result<Bytes, E>> + Send + 'static,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    use futures::StreamExt;

    async_stream::stream! {
        futures::pin_mut!(byte_stream);

        while let Some(chunk_result) = byte_stream.next().await {
            match chunk_result {
                Ok(bytes) => yield Ok(bytes),
                Err(e) => {
                    warn!("Upstream stream failed: {}", e);
                    yield Ok(Bytes::from(transport_error_frame(&format!(
                        "Upstream connection error: {}",
                        e
                    ))));
                    break;
                }
            }
        }
    }
}
