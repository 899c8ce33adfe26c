//! Frontend-tool bridge.
//!
//! The three browser tools are implemented as a round-trip to the
//! connected client: one `frontend_tool_prompt` frame out through the
//! session's outbound channel, then the loop parks on a [`ResponseWaiter`]
//! until the client's reply (or the deadline, or disconnect). A waiter is
//! a single-slot, single-use rendezvous — one is created per invocation
//! and discarded after, so replies can never cross between calls.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};

use parley_agent::tools::{FrontendRouter, BROWSER_ALERT, BROWSER_CONFIRM, BROWSER_PROMPT};
use parley_domain::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Connection registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct SessionConnection {
    outbound: mpsc::Sender<Value>,
    /// At most one frontend call is in flight per session; its reply slot
    /// lives here until the client answers or the connection closes.
    waiter: Mutex<Option<oneshot::Sender<Value>>>,
}

/// Live client connections keyed by session id.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Arc<SessionConnection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session_id: &str, outbound: mpsc::Sender<Value>) {
        self.connections.write().insert(
            session_id.to_owned(),
            Arc::new(SessionConnection {
                outbound,
                waiter: Mutex::new(None),
            }),
        );
    }

    /// Remove a closed connection. Dropping the pending waiter sender (if
    /// any) wakes the parked loop with `ok = false`.
    pub fn remove(&self, session_id: &str) {
        if let Some(conn) = self.connections.write().remove(session_id) {
            conn.waiter.lock().take();
        }
    }

    pub fn is_connected(&self, session_id: &str) -> bool {
        self.connections.read().contains_key(session_id)
    }

    /// Hand a client-originated value to the session's pending waiter.
    /// Returns `false` when no waiter is parked.
    pub fn deliver(&self, session_id: &str, value: Value) -> bool {
        let conn = match self.connections.read().get(session_id) {
            Some(c) => c.clone(),
            None => return false,
        };
        let taken = conn.waiter.lock().take();
        match taken {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    pub fn has_waiter(&self, session_id: &str) -> bool {
        self.connections
            .read()
            .get(session_id)
            .is_some_and(|c| c.waiter.lock().is_some())
    }

    fn get(&self, session_id: &str) -> Option<Arc<SessionConnection>> {
        self.connections.read().get(session_id).cloned()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ResponseWaiter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Single-slot rendezvous for one client reply.
pub struct ResponseWaiter {
    rx: oneshot::Receiver<Value>,
}

impl ResponseWaiter {
    /// Wait for the reply. `ok = false` means the deadline elapsed or the
    /// connection closed before the client answered.
    pub async fn wait(self, deadline: Duration) -> (Value, bool) {
        match tokio::time::timeout(deadline, self.rx).await {
            Ok(Ok(value)) => (value, true),
            Ok(Err(_)) | Err(_) => (Value::Null, false),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Bridge
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Routes frontend tool calls to the connected client.
///
/// Default prompt text used when the model passes an empty message:
/// alert — "The assistant sent an alert.", prompt — "The assistant
/// requests your input.", confirm — "Please confirm.".
pub struct FrontendBridge {
    registry: Arc<ConnectionRegistry>,
    timeout: Duration,
}

impl FrontendBridge {
    pub fn new(registry: Arc<ConnectionRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    async fn invoke(
        &self,
        conn: &SessionConnection,
        session_id: &str,
        tool: &str,
        args: &Value,
    ) -> Result<String> {
        let message = validate_message_arg(tool, args)?;
        let message = if message.is_empty() {
            default_prompt_text(tool).to_owned()
        } else {
            message
        };

        let action = match tool {
            BROWSER_ALERT => "alert",
            BROWSER_PROMPT => "prompt",
            BROWSER_CONFIRM => "confirm",
            _ => unreachable!("route() only passes frontend tool names"),
        };

        // Install the waiter before the frame goes out so a reply can
        // never arrive into an empty slot.
        let (tx, rx) = oneshot::channel();
        *conn.waiter.lock() = Some(tx);
        let waiter = ResponseWaiter { rx };

        let frame = json!({
            "type": "frontend_tool_prompt",
            "tool": tool,
            "action": action,
            "data": { "message": message },
        });
        if conn.outbound.send(frame).await.is_err() {
            conn.waiter.lock().take();
            return Err(Error::ToolExecution {
                tool: tool.to_owned(),
                message: "client connection closed before prompt was sent".into(),
            });
        }

        let (value, ok) = waiter.wait(self.timeout).await;
        // Clear a stale slot after a timeout so a late reply is dropped
        // instead of answering a future call.
        conn.waiter.lock().take();

        if !ok {
            tracing::warn!(
                session_id = %session_id,
                tool = %tool,
                "frontend tool wait ended without a reply"
            );
            return Err(Error::ToolExecution {
                tool: tool.to_owned(),
                message: "client did not respond".into(),
            });
        }

        let payload = match tool {
            BROWSER_ALERT => json!({
                "alert_shown": true,
                "message_shown": message,
                "ack": value,
                "success": true,
            }),
            BROWSER_PROMPT => json!({
                "user_response": value_as_string(&value),
                "prompt_shown": message,
                "success": true,
            }),
            BROWSER_CONFIRM => json!({
                "user_confirmed": value_as_bool(&value),
                "confirm_shown": message,
                "success": true,
            }),
            _ => unreachable!(),
        };
        serde_json::to_string(&payload).map_err(Error::Json)
    }
}

#[async_trait::async_trait]
impl FrontendRouter for FrontendBridge {
    async fn route(&self, session_id: &str, tool: &str, args: &Value) -> Option<Result<String>> {
        let conn = self.registry.get(session_id)?;
        Some(self.invoke(&conn, session_id, tool, args).await)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Frontend tools take exactly one argument, string-typed.
fn validate_message_arg(tool: &str, args: &Value) -> Result<String> {
    let obj = args.as_object().ok_or_else(|| {
        Error::Validation(format!("{tool} arguments must be an object"))
    })?;
    if obj.len() != 1 {
        return Err(Error::Validation(format!(
            "{tool} takes exactly one argument, got {}",
            obj.len()
        )));
    }
    let (key, value) = obj.iter().next().expect("len checked above");
    if key != "message" {
        return Err(Error::Validation(format!(
            "{tool} takes a single 'message' argument, got '{key}'"
        )));
    }
    match value.as_str() {
        Some(s) => Ok(s.to_owned()),
        None => Err(Error::Validation(format!(
            "{tool} 'message' argument must be a string"
        ))),
    }
}

fn default_prompt_text(tool: &str) -> &'static str {
    match tool {
        BROWSER_ALERT => "The assistant sent an alert.",
        BROWSER_PROMPT => "The assistant requests your input.",
        _ => "Please confirm.",
    }
}

fn value_as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn value_as_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => {
            matches!(s.to_ascii_lowercase().as_str(), "true" | "yes" | "ok" | "1")
        }
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        _ => false,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn bridge_with_session(
        session_id: &str,
    ) -> (Arc<ConnectionRegistry>, FrontendBridge, mpsc::Receiver<Value>) {
        let registry = Arc::new(ConnectionRegistry::new());
        let (tx, rx) = mpsc::channel(8);
        registry.register(session_id, tx);
        let bridge = FrontendBridge::new(registry.clone(), Duration::from_secs(5));
        (registry, bridge, rx)
    }

    #[tokio::test]
    async fn route_unknown_session_returns_none() {
        let registry = Arc::new(ConnectionRegistry::new());
        let bridge = FrontendBridge::new(registry, Duration::from_secs(1));
        let out = bridge
            .route("ghost", BROWSER_PROMPT, &json!({"message": "hi"}))
            .await;
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn prompt_round_trip() {
        let (registry, bridge, mut rx) = bridge_with_session("s1");

        let route = tokio::spawn(async move {
            bridge
                .route("s1", BROWSER_PROMPT, &json!({"message": "name?"}))
                .await
                .unwrap()
        });

        // The client sees one frontend_tool_prompt frame...
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame["type"], "frontend_tool_prompt");
        assert_eq!(frame["tool"], BROWSER_PROMPT);
        assert_eq!(frame["action"], "prompt");
        assert_eq!(frame["data"]["message"], "name?");

        // ...and replies once.
        assert!(registry.has_waiter("s1"));
        assert!(registry.deliver("s1", json!("Ada")));

        let payload = route.await.unwrap().unwrap();
        let parsed: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(
            parsed,
            json!({"user_response": "Ada", "prompt_shown": "name?", "success": true})
        );
    }

    #[tokio::test]
    async fn alert_round_trip_includes_ack() {
        let (registry, bridge, mut rx) = bridge_with_session("s1");

        let route = tokio::spawn(async move {
            bridge
                .route("s1", BROWSER_ALERT, &json!({"message": "heads up"}))
                .await
                .unwrap()
        });

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame["action"], "alert");
        registry.deliver("s1", json!(true));

        let parsed: Value = serde_json::from_str(&route.await.unwrap().unwrap()).unwrap();
        assert_eq!(parsed["alert_shown"], true);
        assert_eq!(parsed["message_shown"], "heads up");
        assert_eq!(parsed["ack"], true);
        assert_eq!(parsed["success"], true);
    }

    #[tokio::test]
    async fn confirm_coerces_reply_to_bool() {
        for (reply, expected) in [
            (json!(true), true),
            (json!("yes"), true),
            (json!("no"), false),
            (json!(0), false),
            (json!(null), false),
        ] {
            let (registry, bridge, mut rx) = bridge_with_session("s1");
            let route = tokio::spawn(async move {
                bridge
                    .route("s1", BROWSER_CONFIRM, &json!({"message": "sure?"}))
                    .await
                    .unwrap()
            });
            rx.recv().await.unwrap();
            registry.deliver("s1", reply);

            let parsed: Value =
                serde_json::from_str(&route.await.unwrap().unwrap()).unwrap();
            assert_eq!(parsed["user_confirmed"], expected, "reply case failed");
        }
    }

    #[tokio::test]
    async fn empty_message_gets_default_text() {
        let (registry, bridge, mut rx) = bridge_with_session("s1");
        let route = tokio::spawn(async move {
            bridge
                .route("s1", BROWSER_ALERT, &json!({"message": ""}))
                .await
                .unwrap()
        });

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame["data"]["message"], "The assistant sent an alert.");
        registry.deliver("s1", json!("ok"));
        route.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn bad_arguments_are_validation_errors() {
        let (_registry, bridge, _rx) = bridge_with_session("s1");

        for args in [
            json!({}),
            json!({"message": "a", "extra": "b"}),
            json!({"text": "a"}),
            json!({"message": 42}),
            json!("not an object"),
        ] {
            let err = bridge
                .route("s1", BROWSER_PROMPT, &args)
                .await
                .unwrap()
                .unwrap_err();
            assert!(matches!(err, Error::Validation(_)), "args: {args}");
        }
    }

    #[tokio::test]
    async fn timeout_surfaces_as_tool_error() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (tx, mut rx) = mpsc::channel(8);
        registry.register("s1", tx);
        let bridge = FrontendBridge::new(registry.clone(), Duration::from_millis(20));

        let out = bridge
            .route("s1", BROWSER_PROMPT, &json!({"message": "q"}))
            .await
            .unwrap();
        let err = out.unwrap_err();
        assert!(matches!(err, Error::ToolExecution { .. }));
        assert!(!err.is_fatal_to_session());

        // The prompt frame was still sent; the stale waiter is cleared.
        assert!(rx.recv().await.is_some());
        assert!(!registry.has_waiter("s1"));
    }

    #[tokio::test]
    async fn disconnect_wakes_waiter_with_failure() {
        let (registry, bridge, mut rx) = bridge_with_session("s1");

        let route = tokio::spawn(async move {
            bridge
                .route("s1", BROWSER_PROMPT, &json!({"message": "q"}))
                .await
                .unwrap()
        });
        rx.recv().await.unwrap();

        registry.remove("s1");
        let err = route.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::ToolExecution { .. }));
    }

    #[tokio::test]
    async fn deliver_without_waiter_returns_false() {
        let (registry, _bridge, _rx) = bridge_with_session("s1");
        assert!(!registry.deliver("s1", json!("x")));
        assert!(!registry.deliver("ghost", json!("x")));
    }
}
