//! Session runtime — the orchestrator that ties history, model
//! invocation, tool dispatch, frontend round-trips, and persistence into
//! one deterministic loop.
//!
//! Entry points: [`session::SessionRuntime::run_single_shot`] and
//! [`session::SessionRuntime::run_streaming`].

pub mod cancel;
pub mod frontend;
pub mod session;
pub mod writer;

pub use cancel::{CancelMap, CancelToken};
pub use frontend::{ConnectionRegistry, FrontendBridge};
pub use session::{SessionRuntime, TurnParams};
pub use writer::{ChunkedWriter, CollectingWriter, SessionWriter, SocketWriter};

use serde_json::{json, Value};

use parley_domain::message::FunctionCall;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Call identity and deduplication
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub(crate) fn mint_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4())
}

/// Deduplication key: `name + "|" + stable_serialized(args)`.
///
/// `serde_json` object keys are ordered, so serialization is already a
/// canonical form.
pub(crate) fn dedupe_key(name: &str, args: &Value) -> String {
    format!("{}|{}", name, args)
}

/// Collapse duplicate calls within one iteration, preserving first-
/// appearance order. The first occurrence wins; an explicit model id is
/// kept, otherwise a fresh one is minted.
pub(crate) fn dedupe_calls(calls: &[&FunctionCall]) -> Vec<FunctionCall> {
    let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();
    let mut out = Vec::new();

    for call in calls {
        let key = dedupe_key(&call.name, &call.args);
        if !seen.insert(key) {
            continue;
        }
        out.push(FunctionCall {
            id: Some(call.id.clone().unwrap_or_else(mint_call_id)),
            name: call.name.clone(),
            args: call.args.clone(),
        });
    }

    out
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Payload shaping
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Shape a tool's serialized output into the mapping persisted inside a
/// function_response part. Non-object outputs are wrapped.
pub(crate) fn response_mapping(output: &str) -> Value {
    match serde_json::from_str::<Value>(output) {
        Ok(v) if v.is_object() => v,
        Ok(v) => json!({ "output": v }),
        Err(_) => json!({ "output": output }),
    }
}

/// The `tool_result` frame emitted after each executed (or failed) call.
pub(crate) fn tool_result_frame(
    function_name: &str,
    function_id: &str,
    result: &Value,
    result_json: &str,
) -> Value {
    json!({
        "type": "tool_result",
        "function_name": function_name,
        "function_id": function_id,
        "result": result,
        "result_json": result_json,
    })
}

pub(crate) fn truncate_str(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) && end > 0 {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
