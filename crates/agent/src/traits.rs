//! Request/response types and the core agent trait.

use std::pin::Pin;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use parley_domain::error::{Error, Result};
use parley_domain::message::{FunctionCall, Part, StoredMessage, ToolResult};

/// A boxed async stream, used for streaming model responses.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// The stream produced by [`Agent::run_stream`].
///
/// Chunks and errors share one stream: `Ok` items are partial responses,
/// an `Err` item reports a stream failure, and plain end-of-stream is
/// normal completion. Dropping the stream is the cooperative cancel
/// request.
pub type AgentStream = BoxStream<'static, Result<ModelChunk>>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Message parts wrapper, mirroring the wire shape
/// `{"content":{"parts":[...]}}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
}

/// A user submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    #[serde(default)]
    pub content: Content,
    /// Legacy clients send free-form text instead of parts; it is
    /// normalized to a single text part.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl UserMessage {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            content: Content {
                parts: vec![Part::text(text)],
            },
            text: None,
        }
    }

    /// The effective parts, applying the legacy text normalization.
    pub fn parts(&self) -> Vec<Part> {
        if !self.content.parts.is_empty() {
            return self.content.parts.clone();
        }
        match self.text.as_deref() {
            Some(text) if !text.is_empty() => vec![Part::text(text)],
            _ => Vec::new(),
        }
    }
}

/// One turn's input to the agent: exactly one of the two fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_message: Option<UserMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_results: Option<Vec<ToolResult>>,
}

impl ChatRequest {
    pub fn from_user_text(text: impl Into<String>) -> Self {
        Self {
            user_message: Some(UserMessage::from_text(text)),
            tool_results: None,
        }
    }

    pub fn from_tool_results(results: Vec<ToolResult>) -> Self {
        Self {
            user_message: None,
            tool_results: Some(results),
        }
    }

    /// Exactly one of `user_message` / `tool_results` must be present.
    pub fn validate(&self) -> Result<()> {
        match (&self.user_message, &self.tool_results) {
            (Some(_), Some(_)) => Err(Error::Validation(
                "request must carry either user_message or tool_results, not both".into(),
            )),
            (None, None) => Err(Error::Validation(
                "request must carry user_message or tool_results".into(),
            )),
            _ => Ok(()),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One streamed partial response. The union of all chunks' parts equals
/// the final response's parts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelChunk {
    pub parts: Vec<Part>,
}

/// The model's full output for one iteration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub parts: Vec<Part>,
}

impl ModelResponse {
    /// Concatenated text of all text parts.
    pub fn text(&self) -> String {
        parley_domain::message::collect_text(&self.parts)
    }

    pub fn function_calls(&self) -> Vec<&FunctionCall> {
        self.parts.iter().filter_map(Part::as_function_call).collect()
    }

    pub fn push_chunk(&mut self, chunk: ModelChunk) {
        self.parts.extend(chunk.parts);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Uniform surface over a model, consumed by the session core.
///
/// `history` is the sanitized conversation context including the
/// just-persisted incoming message; the `request` tells the agent what
/// kind of turn triggered the call.
#[async_trait::async_trait]
pub trait Agent: Send + Sync {
    /// Blocking single-shot completion.
    async fn run(&self, request: &ChatRequest, history: &[StoredMessage])
        -> Result<ModelResponse>;

    /// Streaming completion.
    async fn run_stream(
        &self,
        request: &ChatRequest,
        history: &[StoredMessage],
    ) -> Result<AgentStream>;

    /// Policy decision for a tool call. Does not execute.
    async fn approve_tool(&self, name: &str, args: &Value) -> Result<bool>;

    /// Execute a tool synchronously, returning its serialized output.
    /// Frontend tool names are routed to the connected client when
    /// `session_id` resolves to an open connection.
    async fn execute_tool(&self, name: &str, args: &Value, session_id: &str) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_requires_exactly_one_field() {
        assert!(ChatRequest::default().validate().is_err());
        assert!(ChatRequest::from_user_text("hi").validate().is_ok());
        assert!(ChatRequest::from_tool_results(vec![]).validate().is_ok());

        let both = ChatRequest {
            user_message: Some(UserMessage::from_text("hi")),
            tool_results: Some(vec![]),
        };
        assert!(both.validate().is_err());
    }

    #[test]
    fn legacy_text_normalizes_to_one_part() {
        let msg = UserMessage {
            content: Content::default(),
            text: Some("hello".into()),
        };
        assert_eq!(msg.parts(), vec![Part::text("hello")]);
    }

    #[test]
    fn parts_win_over_legacy_text() {
        let msg = UserMessage {
            content: Content {
                parts: vec![Part::text("parts")],
            },
            text: Some("legacy".into()),
        };
        assert_eq!(msg.parts(), vec![Part::text("parts")]);
    }

    #[test]
    fn inbound_frame_shape_deserializes() {
        let frame = json!({"user_message": {"content": {"parts": [{"text": "hi"}]}}});
        let req: ChatRequest = serde_json::from_value(frame).unwrap();
        assert_eq!(req.user_message.unwrap().parts(), vec![Part::text("hi")]);
    }

    #[test]
    fn response_accumulates_chunks_in_order() {
        let mut response = ModelResponse::default();
        response.push_chunk(ModelChunk {
            parts: vec![Part::text("a")],
        });
        response.push_chunk(ModelChunk {
            parts: vec![
                Part::function_call(None, "Search", json!({"q": "x"})),
                Part::text("b"),
            ],
        });

        assert_eq!(response.text(), "ab");
        assert_eq!(response.function_calls().len(), 1);
    }
}
