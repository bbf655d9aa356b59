//! Parsing of the model's JSON reply.
//!
//! The model is asked for `{assistant_text, actions, is_final}`. Actions may
//! come either with a nested `payload` or with their fields flattened next to
//! `type`; both are normalized to `ModelAction { kind, payload, note }`.

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::warn;

use crate::jobs::model::ModelAction;

/// Text returned when the model's reply cannot be understood.
pub const UNPARSABLE_REPLY_TEXT: &str =
    "The model reply could not be parsed. Please try rephrasing the question.";

#[derive(Debug, Deserialize)]
struct RawReply {
    assistant_text: Value,
    #[serde(default)]
    actions: Vec<Map<String, Value>>,
    #[serde(default)]
    is_final: bool,
}

/// Parsed reply parts: text, actions, is_final.
pub type ParsedReply = (String, Vec<ModelAction>, bool);

/// Parse the raw JSON text produced by the model.
///
/// Never fails: a reply that is not valid JSON or lacks `assistant_text` is
/// degraded to a non-final reply asking the user to rephrase.
pub fn parse_model_reply(raw: &str) -> ParsedReply {
    let raw = strip_code_fence(raw);
    match serde_json::from_str::<RawReply>(raw) {
        Ok(reply) => {
            let text = match reply.assistant_text {
                Value::String(s) => s,
                Value::Null => String::new(),
                other => other.to_string(),
            };
            let actions = reply.actions.into_iter().filter_map(normalize_action).collect();
            (text, actions, reply.is_final)
        }
        Err(e) => {
            warn!(error = %e, len = raw.len(), "Model reply failed validation");
            (
                UNPARSABLE_REPLY_TEXT.to_string(),
                vec![ModelAction {
                    kind: "request_files".to_string(),
                    payload: Some(serde_json::json!({ "items": [] })),
                    note: Some("reply validation failed".to_string()),
                }],
                false,
            )
        }
    }
}

fn normalize_action(mut fields: Map<String, Value>) -> Option<ModelAction> {
    let kind = match fields.remove("type") {
        Some(Value::String(kind)) => kind,
        _ => return None,
    };
    let note = match fields.remove("note") {
        Some(Value::String(note)) => Some(note),
        _ => None,
    };
    let payload = match fields.remove("payload") {
        Some(Value::Null) | None if fields.is_empty() => None,
        Some(Value::Null) | None => Some(Value::Object(fields)),
        Some(payload) => Some(payload),
    };
    Some(ModelAction {
        kind,
        payload,
        note,
    })
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed)
}
