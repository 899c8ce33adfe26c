//! Conversation and message model.
//!
//! A conversation is a durable container for one chat thread. Messages are
//! turn-structured: dense 1-based sequences, a `(role, type)` pair from the
//! allowed table, and a parts payload that is never empty on disk.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Roles and message types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The side of the exchange a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "model" => Some(Role::Model),
            _ => None,
        }
    }
}

/// What a message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    UserMessage,
    ModelMessage,
    FunctionCall,
    FunctionResponse,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::UserMessage => "user_message",
            MessageType::ModelMessage => "model_message",
            MessageType::FunctionCall => "function_call",
            MessageType::FunctionResponse => "function_response",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user_message" => Some(MessageType::UserMessage),
            "model_message" => Some(MessageType::ModelMessage),
            "function_call" => Some(MessageType::FunctionCall),
            "function_response" => Some(MessageType::FunctionResponse),
            _ => None,
        }
    }
}

/// The allowed `(role, type)` pairings.
///
/// | role  | type              |
/// |-------|-------------------|
/// | user  | user_message      |
/// | user  | function_response |
/// | model | model_message     |
/// | model | function_call     |
pub fn role_type_allowed(role: Role, message_type: MessageType) -> bool {
    matches!(
        (role, message_type),
        (Role::User, MessageType::UserMessage)
            | (Role::User, MessageType::FunctionResponse)
            | (Role::Model, MessageType::ModelMessage)
            | (Role::Model, MessageType::FunctionCall)
    )
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Parts
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A model-emitted tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

/// Tool output fed back to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub response: Value,
}

/// Smallest addressable unit of a message.
///
/// Wire shape is an object with exactly one of the three keys, e.g.
/// `{"text":"hi"}` or `{"function_call":{"name":"Search","args":{...}}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Part {
    Text { text: String },
    FunctionCall { function_call: FunctionCall },
    FunctionResponse { function_response: FunctionResponse },
}

// ── Convenience constructors ───────────────────────────────────────

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }

    pub fn function_call(
        id: Option<String>,
        name: impl Into<String>,
        args: Value,
    ) -> Self {
        Part::FunctionCall {
            function_call: FunctionCall {
                id,
                name: name.into(),
                args,
            },
        }
    }

    pub fn function_response(
        id: Option<String>,
        name: impl Into<String>,
        response: Value,
    ) -> Self {
        Part::FunctionResponse {
            function_response: FunctionResponse {
                id,
                name: name.into(),
                response,
            },
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Part::Text { text } => Some(text.as_str()),
            _ => None,
        }
    }

    pub fn as_function_call(&self) -> Option<&FunctionCall> {
        match self {
            Part::FunctionCall { function_call } => Some(function_call),
            _ => None,
        }
    }

    pub fn as_function_response(&self) -> Option<&FunctionResponse> {
        match self {
            Part::FunctionResponse { function_response } => Some(function_response),
            _ => None,
        }
    }
}

/// Join the text of all text parts, in order.
pub fn collect_text(parts: &[Part]) -> String {
    parts
        .iter()
        .filter_map(Part::as_text)
        .collect::<Vec<_>>()
        .concat()
}

// ── Payload normalization ──────────────────────────────────────────

/// Serialize parts for storage.
///
/// Degenerate payloads (`""`, `"null"`, `"[]"`, no parts) are stored as
/// `"{}"` so the column never carries an empty or null-ish literal.
pub fn encode_parts(parts: &[Part]) -> crate::error::Result<String> {
    if parts.is_empty() {
        return Ok("{}".to_string());
    }
    let raw = serde_json::to_string(parts)?;
    Ok(normalize_parts_json(raw))
}

/// Apply the degenerate-payload rule to an already-serialized payload.
pub fn normalize_parts_json(raw: String) -> String {
    match raw.trim() {
        "" | "null" | "[]" => "{}".to_string(),
        _ => raw,
    }
}

/// Rehydrate a stored payload. The `"{}"` sentinel decodes to no parts;
/// anything unreadable is treated the same way rather than failing the
/// whole history fetch.
pub fn decode_parts(raw: &str) -> Vec<Part> {
    match raw.trim() {
        "" | "null" | "[]" | "{}" => Vec::new(),
        trimmed => serde_json::from_str::<Vec<Part>>(trimmed).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "unreadable parts payload, dropping");
            Vec::new()
        }),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stored records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A persisted message row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub conversation_id: String,
    /// 1-based, dense, unique per conversation.
    pub sequence: i64,
    pub role: Role,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub parts: Vec<Part>,
    /// Correlates a function_call with its function_response(s).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    /// The function id carried by this message, falling back to the id
    /// embedded in its first call/response part.
    pub fn effective_function_id(&self) -> Option<&str> {
        if let Some(fid) = self.function_id.as_deref() {
            return Some(fid);
        }
        self.parts.iter().find_map(|p| match p {
            Part::FunctionCall { function_call } => function_call.id.as_deref(),
            Part::FunctionResponse { function_response } => function_response.id.as_deref(),
            _ => None,
        })
    }
}

/// A conversation row. `message_count` is advisory — authoritative counts
/// are computed from the messages table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub conversation_id: String,
    pub user_id: String,
    pub title: String,
    pub message_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Transient tool output handed back into the loop as the next request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_id: String,
    pub tool_name: String,
    /// Opaque serialized payload (usually a JSON object).
    pub tool_output: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn role_type_table() {
        assert!(role_type_allowed(Role::User, MessageType::UserMessage));
        assert!(role_type_allowed(Role::User, MessageType::FunctionResponse));
        assert!(role_type_allowed(Role::Model, MessageType::ModelMessage));
        assert!(role_type_allowed(Role::Model, MessageType::FunctionCall));

        assert!(!role_type_allowed(Role::User, MessageType::ModelMessage));
        assert!(!role_type_allowed(Role::User, MessageType::FunctionCall));
        assert!(!role_type_allowed(Role::Model, MessageType::UserMessage));
        assert!(!role_type_allowed(Role::Model, MessageType::FunctionResponse));
    }

    #[test]
    fn part_wire_shape_text() {
        let part = Part::text("hi");
        let json = serde_json::to_value(&part).unwrap();
        assert_eq!(json, json!({"text": "hi"}));
    }

    #[test]
    fn part_wire_shape_function_call() {
        let part = Part::function_call(None, "GetWeather", json!({"city": "NYC"}));
        let json = serde_json::to_value(&part).unwrap();
        assert_eq!(
            json,
            json!({"function_call": {"name": "GetWeather", "args": {"city": "NYC"}}})
        );
    }

    #[test]
    fn part_roundtrip_function_response() {
        let part = Part::function_response(Some("f1".into()), "GetWeather", json!({"temp": 72}));
        let encoded = serde_json::to_string(&part).unwrap();
        let decoded: Part = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, part);
    }

    #[test]
    fn encode_parts_empty_becomes_object() {
        assert_eq!(encode_parts(&[]).unwrap(), "{}");
    }

    #[test]
    fn normalize_degenerate_payloads() {
        assert_eq!(normalize_parts_json(String::new()), "{}");
        assert_eq!(normalize_parts_json("null".into()), "{}");
        assert_eq!(normalize_parts_json("[]".into()), "{}");
        assert_eq!(normalize_parts_json("  []  ".into()), "{}");
        assert_eq!(
            normalize_parts_json(r#"[{"text":"x"}]"#.into()),
            r#"[{"text":"x"}]"#
        );
    }

    #[test]
    fn decode_parts_sentinel_and_garbage() {
        assert!(decode_parts("{}").is_empty());
        assert!(decode_parts("").is_empty());
        assert!(decode_parts("not json").is_empty());
        let parts = decode_parts(r#"[{"text":"hello"}]"#);
        assert_eq!(parts, vec![Part::text("hello")]);
    }

    #[test]
    fn collect_text_skips_non_text() {
        let parts = vec![
            Part::text("a"),
            Part::function_call(None, "t", json!({})),
            Part::text("b"),
        ];
        assert_eq!(collect_text(&parts), "ab");
    }

    #[test]
    fn effective_function_id_prefers_column() {
        let msg = StoredMessage {
            id: 1,
            conversation_id: "c".into(),
            sequence: 1,
            role: Role::Model,
            message_type: MessageType::FunctionCall,
            parts: vec![Part::function_call(Some("inner".into()), "t", json!({}))],
            function_id: Some("outer".into()),
            created_at: Utc::now(),
        };
        assert_eq!(msg.effective_function_id(), Some("outer"));

        let msg = StoredMessage {
            function_id: None,
            ..msg
        };
        assert_eq!(msg.effective_function_id(), Some("inner"));
    }
}
