//! Local proxy that serves OpenAI chat-completions and native Anthropic
//! Messages requests using a user's OAuth login instead of an API key.

pub mod cli;
pub mod config;
pub mod error;
pub mod oauth;
pub mod proxy;
pub mod sanitize;
pub mod storage;
pub mod translate;
