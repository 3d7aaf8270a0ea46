//! Helper functions shared by the provider adapters and the loop engine:
//! assistant-content cleanup, model-id prefix handling, schema sanitising
//! for backends that reject standard JSON-Schema keywords, and tool-call
//! signatures for duplicate suppression.

use serde_json::Value;

use super::provider::AssistantToolCall;

/// Strip surrounding fenced-JSON markers from assistant content.
///
/// Models asked for structured output frequently wrap the JSON body in a
/// Markdown code fence. The caller always receives the bare payload.
pub fn strip_json_fences(content: &str) -> String {
    let trimmed = content.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    let without_close = without_open.strip_suffix("```").unwrap_or(without_open);
    without_close.trim().to_string()
}

/// Remove a backend route prefix (`"groq/llama-3.3-70b"` -> `"llama-3.3-70b"`).
pub fn strip_model_prefix<'a>(model: &'a str, prefix: Option<&str>) -> &'a str {
    match prefix {
        Some(p) => model.strip_prefix(p).unwrap_or(model),
        None => model,
    }
}

/// JSON-Schema keywords the Gemini API rejects in `parameters` /
/// `responseSchema` blocks.
const UNSUPPORTED_SCHEMA_KEYWORDS: &[&str] = &[
    "additionalProperties",
    "$schema",
    "$id",
    "$defs",
    "definitions",
    "examples",
    "default",
    "exclusiveMinimum",
    "exclusiveMaximum",
];

/// Recursively drop schema keywords the target backend does not accept.
/// Returns a cleaned copy; the input is not modified.
pub fn sanitize_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => {
            let mut cleaned = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                if UNSUPPORTED_SCHEMA_KEYWORDS.contains(&key.as_str()) {
                    continue;
                }
                cleaned.insert(key.clone(), sanitize_schema(value));
            }
            Value::Object(cleaned)
        }
        Value::Array(items) => Value::Array(items.iter().map(sanitize_schema).collect()),
        other => other.clone(),
    }
}

/// Signature used for duplicate-call suppression: the raw argument string is
/// part of the key, so reordered-but-equivalent JSON is a distinct call.
pub fn tool_call_signature(call: &AssistantToolCall) -> String {
    format!("{}-{}", call.name, call.arguments)
}
