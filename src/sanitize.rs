//! Enforce the Messages API parameter constraints on an outgoing request.
//!
//! Works on the raw JSON object so values a typed struct could not even
//! represent (strings where numbers belong, explicit nulls) are cleaned up
//! instead of rejected. Applying it twice gives the same result as once.

use serde_json::{Map, Value};
use tracing::debug;

/// Minimum room left for the visible answer on top of the thinking budget
pub const MIN_RESPONSE_TOKENS: u64 = 1024;
/// Budget assumed when `thinking.budget_tokens` is missing
pub const DEFAULT_THINKING_BUDGET: u64 = 16_000;

pub fn sanitize_request(request: &mut Map<String, Value>) {
    if let Some(top_p) = request.get("top_p")
        && !top_p.as_f64().is_some_and(|v| (0.0..=1.0).contains(&v))
    {
        debug!("Removing invalid top_p value: {}", top_p);
        request.remove("top_p");
    }

    if let Some(temperature) = request.get("temperature")
        && !temperature.is_number()
    {
        debug!("Removing invalid temperature value: {}", temperature);
        request.remove("temperature");
    }

    if let Some(top_k) = request.get("top_k")
        && !top_k.as_i64().is_some_and(|v| v > 0)
    {
        debug!("Removing invalid top_k value: {}", top_k);
        request.remove("top_k");
    }

    if let Some(tools) = request.get("tools")
        && !tools.as_array().is_some_and(|t| !t.is_empty())
    {
        debug!("Removing null, empty or non-list tools parameter");
        request.remove("tools");
    }

    match request.get("thinking") {
        Some(Value::Null) => {
            debug!("Removing null thinking parameter");
            request.remove("thinking");
        }
        Some(thinking) if is_thinking_enabled(thinking) => {
            let budget = thinking
                .get("budget_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(DEFAULT_THINKING_BUDGET);
            apply_thinking_constraints(request, budget);
        }
        _ => {}
    }
}

pub fn is_thinking_enabled(thinking: &Value) -> bool {
    thinking.get("type").and_then(Value::as_str) == Some("enabled")
}

fn apply_thinking_constraints(request: &mut Map<String, Value>, budget: u64) {
    if let Some(temperature) = request.get_mut("temperature")
        && temperature.as_f64() != Some(1.0)
    {
        debug!("Adjusting temperature from {} to 1.0 (thinking enabled)", temperature);
        *temperature = Value::from(1.0);
    }

    if let Some(top_p) = request.get_mut("top_p")
        && let Some(value) = top_p.as_f64()
        && !(0.95..=1.0).contains(&value)
    {
        let adjusted = value.clamp(0.95, 1.0);
        debug!("Adjusting top_p from {} to {} (thinking enabled)", value, adjusted);
        *top_p = Value::from(adjusted);
    }

    if request.remove("top_k").is_some() {
        debug!("Removing top_k parameter (not allowed with thinking)");
    }

    let required = budget.saturating_add(MIN_RESPONSE_TOKENS);
    let current = request.get("max_tokens").and_then(Value::as_u64).unwrap_or(0);
    if current < required {
        debug!("Increasing max_tokens from {} to {} (thinking budget)", current, required);
        request.insert("max_tokens".to_string(), Value::from(required));
    }
}
