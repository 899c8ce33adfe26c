//! Tool-execution trace records.
//!
//! Every tool dispatch in the session loop produces a span of trace
//! records: `start`, optional `progress`, then `end` or `error`. Records
//! are appended to the trace store and also emitted through `tracing` so
//! operators can follow a conversation live.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Lifecycle stage of a trace record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceStatus {
    Start,
    Progress,
    End,
    Error,
}

impl TraceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceStatus::Start => "start",
            TraceStatus::Progress => "progress",
            TraceStatus::End => "end",
            TraceStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "start" => Some(TraceStatus::Start),
            "progress" => Some(TraceStatus::Progress),
            "end" => Some(TraceStatus::End),
            "error" => Some(TraceStatus::Error),
            _ => None,
        }
    }
}

/// One append-only tool-execution trace record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionTrace {
    pub conversation_id: String,
    pub tool_call_id: String,
    pub trace_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub tool: String,
    pub operation: String,
    pub status: TraceStatus,
    pub label: String,
    pub details: Map<String, Value>,
    /// Unix timestamp in nanoseconds.
    pub timestamp_ns: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl ExecutionTrace {
    fn record(
        conversation_id: &str,
        tool_call_id: &str,
        tool: &str,
        operation: &str,
        status: TraceStatus,
        label: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.to_owned(),
            tool_call_id: tool_call_id.to_owned(),
            trace_id: Uuid::new_v4().to_string(),
            parent_id: None,
            tool: tool.to_owned(),
            operation: operation.to_owned(),
            status,
            label: label.into(),
            details: Map::new(),
            timestamp_ns: Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            duration_ms: None,
        }
    }

    pub fn start(conversation_id: &str, tool_call_id: &str, tool: &str, operation: &str) -> Self {
        Self::record(
            conversation_id,
            tool_call_id,
            tool,
            operation,
            TraceStatus::Start,
            format!("{tool} started"),
        )
    }

    pub fn end(
        conversation_id: &str,
        tool_call_id: &str,
        tool: &str,
        operation: &str,
        duration_ms: u64,
    ) -> Self {
        let mut t = Self::record(
            conversation_id,
            tool_call_id,
            tool,
            operation,
            TraceStatus::End,
            format!("{tool} completed"),
        );
        t.duration_ms = Some(duration_ms);
        t
    }

    pub fn error(
        conversation_id: &str,
        tool_call_id: &str,
        tool: &str,
        operation: &str,
        message: &str,
    ) -> Self {
        let mut t = Self::record(
            conversation_id,
            tool_call_id,
            tool,
            operation,
            TraceStatus::Error,
            format!("{tool} failed"),
        );
        t.details
            .insert("error".into(), Value::String(message.to_owned()));
        t
    }

    pub fn with_detail(mut self, key: &str, value: Value) -> Self {
        self.details.insert(key.to_owned(), value);
        self
    }

    /// Log the record through `tracing` (store persistence is separate).
    pub fn emit(&self) {
        tracing::info!(
            conversation_id = %self.conversation_id,
            tool_call_id = %self.tool_call_id,
            tool = %self.tool,
            status = %self.status.as_str(),
            label = %self.label,
            "tool trace"
        );
    }
}
