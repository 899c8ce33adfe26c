//! Tool registry and frontend-tool routing seam.
//!
//! In-process tools implement [`Tool`] and register by name. The three
//! browser tools are not executed here at all — their implementation is a
//! round-trip to the connected client, reached through the
//! [`FrontendRouter`] installed by the gateway.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use parley_domain::error::Result;

/// Frontend tool names. Their semantics are part of the session loop.
pub const BROWSER_ALERT: &str = "Browser_Alert";
pub const BROWSER_PROMPT: &str = "Browser_Prompt";
pub const BROWSER_CONFIRM: &str = "Browser_Confirm";

pub fn is_frontend_tool(name: &str) -> bool {
    matches!(name, BROWSER_ALERT | BROWSER_PROMPT | BROWSER_CONFIRM)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Definitions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Tool definition advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's parameters.
    pub parameters: Value,
}

fn message_only_schema(description: &str) -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "message": { "type": "string", "description": description }
        },
        "required": ["message"]
    })
}

/// Definitions for the three built-in browser tools.
pub fn frontend_tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: BROWSER_ALERT.into(),
            description: "Display an alert dialog in the user's browser and wait for \
                          acknowledgement."
                .into(),
            parameters: message_only_schema("The alert text to display"),
        },
        ToolDefinition {
            name: BROWSER_PROMPT.into(),
            description: "Ask the user a question via a browser prompt and return their reply."
                .into(),
            parameters: message_only_schema("The question to ask the user"),
        },
        ToolDefinition {
            name: BROWSER_CONFIRM.into(),
            description: "Ask the user to confirm or reject via a browser dialog.".into(),
            parameters: message_only_schema("The confirmation text to display"),
        },
    ]
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// In-process tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An in-process tool the model may invoke.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters(&self) -> Value;

    /// Run the tool. The returned string is the serialized payload fed
    /// back to the model as the function response.
    async fn execute(&self, args: &Value) -> Result<String>;
}

/// Name-keyed registry of in-process tools.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_owned(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Definitions for every registered tool plus the built-in frontend
    /// tools, the full set advertised to the model.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_owned(),
                description: t.description().to_owned(),
                parameters: t.parameters(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs.extend(frontend_tool_definitions());
        defs
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Frontend routing seam
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Routes a frontend tool call to the client owning a session.
///
/// Implemented by the gateway's connection registry; the agent only knows
/// the seam. `route` returns `None` when the session id does not resolve
/// to an open client connection, in which case the call fails as a normal
/// tool error.
#[async_trait::async_trait]
pub trait FrontendRouter: Send + Sync {
    async fn route(&self, session_id: &str, tool: &str, args: &Value) -> Option<Result<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_domain::error::Error;

    struct Echo;

    #[async_trait::async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "Echo"
        }
        fn description(&self) -> &str {
            "Echoes its arguments"
        }
        fn parameters(&self) -> Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, args: &Value) -> Result<String> {
            serde_json::to_string(args).map_err(Error::Json)
        }
    }

    #[test]
    fn frontend_names_are_recognized() {
        assert!(is_frontend_tool(BROWSER_ALERT));
        assert!(is_frontend_tool(BROWSER_PROMPT));
        assert!(is_frontend_tool(BROWSER_CONFIRM));
        assert!(!is_frontend_tool("Search"));
    }

    #[tokio::test]
    async fn registry_dispatch() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Echo));

        let tool = registry.get("Echo").unwrap();
        let out = tool
            .execute(&serde_json::json!({"a": 1}))
            .await
            .unwrap();
        assert_eq!(out, r#"{"a":1}"#);
        assert!(registry.get("Missing").is_none());
    }

    #[test]
    fn definitions_include_frontend_tools() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Echo));

        let defs = registry.definitions();
        let names: Vec<&str> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["Echo", BROWSER_ALERT, BROWSER_PROMPT, BROWSER_CONFIRM]
        );
    }

    #[test]
    fn frontend_definitions_take_one_string_argument() {
        for def in frontend_tool_definitions() {
            let required = def.parameters["required"].as_array().unwrap();
            assert_eq!(required.len(), 1);
            assert_eq!(required[0], "message");
            assert_eq!(def.parameters["properties"]["message"]["type"], "string");
        }
    }
}
