//! Gemini-flavored model backend.
//!
//! Implements the `generateContent` / `streamGenerateContent?alt=sse`
//! wire protocol. History is converted 1:1 — the stored part model is
//! already shaped like the provider's (text / functionCall /
//! functionResponse) — and streamed candidates come back as
//! [`ModelChunk`]s. Tool dispatch goes to the in-process registry, except
//! for the browser tools, which round-trip to the client through the
//! injected [`FrontendRouter`].

use std::sync::Arc;

use serde_json::{json, Value};

use parley_domain::config::ModelConfig;
use parley_domain::error::{Error, Result};
use parley_domain::message::{Part, StoredMessage};

use crate::policy::ApprovalPolicy;
use crate::tools::{is_frontend_tool, FrontendRouter, ToolRegistry};
use crate::traits::{Agent, AgentStream, ChatRequest, ModelChunk, ModelResponse};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Backend struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct GeminiAgent {
    base_url: String,
    api_key: Option<String>,
    model: String,
    client: reqwest::Client,
    tools: Arc<ToolRegistry>,
    policy: ApprovalPolicy,
    frontend: Option<Arc<dyn FrontendRouter>>,
}

impl GeminiAgent {
    pub fn from_config(
        cfg: &ModelConfig,
        tools: Arc<ToolRegistry>,
        policy: ApprovalPolicy,
        frontend: Option<Arc<dyn FrontendRouter>>,
    ) -> Result<Self> {
        let api_key = std::env::var(&cfg.api_key_env).ok().filter(|k| !k.is_empty());
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;

        Ok(Self {
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: cfg.default_model.clone(),
            client,
            tools,
            policy,
            frontend,
        })
    }

    // ── Internal helpers ───────────────────────────────────────────

    fn api_key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .ok_or_else(|| Error::Agent("model API key is not configured".into()))
    }

    fn generate_url(&self, api_key: &str) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url, self.model, api_key
        )
    }

    fn stream_url(&self, api_key: &str) -> String {
        format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url, self.model, api_key
        )
    }

    fn build_body(&self, history: &[StoredMessage]) -> Value {
        let contents = history_to_contents(history);
        let mut body = json!({ "contents": contents });

        let declarations: Vec<Value> = self
            .tools
            .definitions()
            .iter()
            .map(|d| {
                json!({
                    "name": d.name,
                    "description": d.description,
                    "parameters": d.parameters,
                })
            })
            .collect();
        if !declarations.is_empty() {
            body["tools"] = json!([{ "functionDeclarations": declarations }]);
        }

        body
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire mapping
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn history_to_contents(history: &[StoredMessage]) -> Vec<Value> {
    history
        .iter()
        .filter_map(|msg| {
            let parts: Vec<Value> = msg.parts.iter().map(part_to_wire).collect();
            if parts.is_empty() {
                return None;
            }
            Some(json!({ "role": msg.role.as_str(), "parts": parts }))
        })
        .collect()
}

fn part_to_wire(part: &Part) -> Value {
    match part {
        Part::Text { text } => json!({ "text": text }),
        Part::FunctionCall { function_call } => json!({
            "functionCall": {
                "name": function_call.name,
                "args": function_call.args,
            }
        }),
        Part::FunctionResponse { function_response } => json!({
            "functionResponse": {
                "name": function_response.name,
                "response": function_response.response,
            }
        }),
    }
}

/// Parts of the first candidate. Function calls come back without ids —
/// correlation ids are minted by the session loop.
fn parse_candidate_parts(body: &Value) -> Vec<Part> {
    let mut out = Vec::new();
    let parts = body
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array());

    if let Some(parts) = parts {
        for part in parts {
            if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                if !text.is_empty() {
                    out.push(Part::text(text));
                }
            }
            if let Some(fc) = part.get("functionCall") {
                let name = fc
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let args = fc
                    .get("args")
                    .cloned()
                    .unwrap_or(Value::Object(Default::default()));
                out.push(Part::function_call(None, name, args));
            }
        }
    }

    out
}

fn parse_sse_data(data: &str) -> Vec<Result<ModelChunk>> {
    let body: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => return vec![Err(Error::Json(e))],
    };

    if let Some(err) = body.get("error") {
        let message = err
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("model stream error");
        return vec![Err(Error::Agent(message.to_string()))];
    }

    let parts = parse_candidate_parts(&body);
    if parts.is_empty() {
        return Vec::new();
    }
    vec![Ok(ModelChunk { parts })]
}

/// Strip the API key from a URL before logging it.
fn redact_url_key(url: &str) -> String {
    match url.find("key=") {
        Some(idx) => {
            let prefix = &url[..idx + 4];
            let rest = &url[idx + 4..];
            let end = rest.find('&').unwrap_or(rest.len());
            format!("{prefix}[REDACTED]{}", &rest[end..])
        }
        None => url.to_string(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl Agent for GeminiAgent {
    async fn run(
        &self,
        request: &ChatRequest,
        history: &[StoredMessage],
    ) -> Result<ModelResponse> {
        request.validate()?;
        let api_key = self.api_key()?.to_owned();
        let url = self.generate_url(&api_key);
        let body = self.build_body(history);

        tracing::debug!(url = %redact_url_key(&url), "model request");

        let resp = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| Error::Http(e.to_string()))?;
        if !status.is_success() {
            return Err(Error::Agent(format!("HTTP {} - {}", status.as_u16(), text)));
        }

        let body: Value = serde_json::from_str(&text)?;
        Ok(ModelResponse {
            parts: parse_candidate_parts(&body),
        })
    }

    async fn run_stream(
        &self,
        request: &ChatRequest,
        history: &[StoredMessage],
    ) -> Result<AgentStream> {
        request.validate()?;
        let api_key = self.api_key()?.to_owned();
        let url = self.stream_url(&api_key);
        let body = self.build_body(history);

        tracing::debug!(url = %redact_url_key(&url), "model stream request");

        let resp = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.map_err(|e| Error::Http(e.to_string()))?;
            return Err(Error::Agent(format!("HTTP {} - {}", status.as_u16(), text)));
        }

        Ok(crate::sse::sse_response_stream(resp, parse_sse_data))
    }

    async fn approve_tool(&self, name: &str, _args: &Value) -> Result<bool> {
        Ok(self.policy.is_auto_approved(name))
    }

    async fn execute_tool(&self, name: &str, args: &Value, session_id: &str) -> Result<String> {
        if is_frontend_tool(name) {
            if let Some(frontend) = &self.frontend {
                if let Some(result) = frontend.route(session_id, name, args).await {
                    return result;
                }
            }
            return Err(Error::ToolExecution {
                tool: name.to_owned(),
                message: format!("no open client connection for session {session_id}"),
            });
        }

        let tool = self.tools.get(name).ok_or_else(|| Error::ToolExecution {
            tool: name.to_owned(),
            message: "unknown tool".into(),
        })?;
        tool.execute(args).await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use parley_domain::message::{MessageType, Role};

    fn stored(role: Role, message_type: MessageType, parts: Vec<Part>) -> StoredMessage {
        StoredMessage {
            id: 0,
            conversation_id: "c".into(),
            sequence: 1,
            role,
            message_type,
            parts,
            function_id: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn history_maps_to_wire_contents() {
        let history = vec![
            stored(Role::User, MessageType::UserMessage, vec![Part::text("hi")]),
            stored(
                Role::Model,
                MessageType::FunctionCall,
                vec![Part::function_call(
                    Some("f1".into()),
                    "GetWeather",
                    json!({"city": "NYC"}),
                )],
            ),
            stored(
                Role::User,
                MessageType::FunctionResponse,
                vec![Part::function_response(
                    Some("f1".into()),
                    "GetWeather",
                    json!({"temp": 72}),
                )],
            ),
        ];

        let contents = history_to_contents(&history);
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[0]["parts"][0]["text"], "hi");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[1]["parts"][0]["functionCall"]["name"], "GetWeather");
        assert_eq!(
            contents[2]["parts"][0]["functionResponse"]["response"]["temp"],
            72
        );
    }

    #[test]
    fn empty_part_messages_are_skipped() {
        let history = vec![stored(Role::User, MessageType::UserMessage, vec![])];
        assert!(history_to_contents(&history).is_empty());
    }

    #[test]
    fn sse_data_with_text_parses_to_chunk() {
        let data = r#"{"candidates":[{"content":{"parts":[{"text":"hello"}]}}]}"#;
        let chunks = parse_sse_data(data);
        assert_eq!(chunks.len(), 1);
        let chunk = chunks.into_iter().next().unwrap().unwrap();
        assert_eq!(chunk.parts, vec![Part::text("hello")]);
    }

    #[test]
    fn sse_data_with_function_call_parses_to_chunk() {
        let data = r#"{"candidates":[{"content":{"parts":[
            {"functionCall":{"name":"Search","args":{"q":"x"}}}]}}]}"#;
        let chunks = parse_sse_data(data);
        let chunk = chunks.into_iter().next().unwrap().unwrap();
        let call = chunk.parts[0].as_function_call().unwrap();
        assert_eq!(call.name, "Search");
        assert_eq!(call.args, json!({"q": "x"}));
        assert!(call.id.is_none(), "ids are minted by the loop, not here");
    }

    #[test]
    fn sse_error_payload_becomes_agent_error() {
        let data = r#"{"error":{"message":"quota exhausted"}}"#;
        let chunks = parse_sse_data(data);
        assert!(matches!(&chunks[0], Err(Error::Agent(m)) if m == "quota exhausted"));
    }

    #[test]
    fn sse_empty_candidate_yields_nothing() {
        let data = r#"{"candidates":[{"finishReason":"STOP"}]}"#;
        assert!(parse_sse_data(data).is_empty());
    }

    #[test]
    fn redact_hides_key() {
        let url = "https://x.test/v1beta/models/m:generateContent?key=secret&alt=sse";
        assert_eq!(
            redact_url_key(url),
            "https://x.test/v1beta/models/m:generateContent?key=[REDACTED]&alt=sse"
        );
    }

    #[tokio::test]
    async fn execute_unknown_tool_is_a_tool_error() {
        let agent = GeminiAgent {
            base_url: "http://localhost".into(),
            api_key: Some("k".into()),
            model: "m".into(),
            client: reqwest::Client::new(),
            tools: Arc::new(ToolRegistry::new()),
            policy: ApprovalPolicy::permissive(),
            frontend: None,
        };
        let err = agent
            .execute_tool("Nope", &json!({}), "s1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ToolExecution { .. }));
    }

    #[tokio::test]
    async fn frontend_tool_without_connection_is_a_tool_error() {
        let agent = GeminiAgent {
            base_url: "http://localhost".into(),
            api_key: Some("k".into()),
            model: "m".into(),
            client: reqwest::Client::new(),
            tools: Arc::new(ToolRegistry::new()),
            policy: ApprovalPolicy::permissive(),
            frontend: None,
        };
        let err = agent
            .execute_tool(crate::tools::BROWSER_PROMPT, &json!({"message": "hi"}), "s1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ToolExecution { .. }));
    }

    #[tokio::test]
    async fn frontend_tool_routes_through_router() {
        struct FixedRouter;

        #[async_trait::async_trait]
        impl FrontendRouter for FixedRouter {
            async fn route(
                &self,
                session_id: &str,
                tool: &str,
                _args: &Value,
            ) -> Option<Result<String>> {
                assert_eq!(session_id, "s1");
                assert_eq!(tool, crate::tools::BROWSER_PROMPT);
                Some(Ok(r#"{"user_response":"Ada"}"#.into()))
            }
        }

        let agent = GeminiAgent {
            base_url: "http://localhost".into(),
            api_key: Some("k".into()),
            model: "m".into(),
            client: reqwest::Client::new(),
            tools: Arc::new(ToolRegistry::new()),
            policy: ApprovalPolicy::permissive(),
            frontend: Some(Arc::new(FixedRouter)),
        };

        let out = agent
            .execute_tool(crate::tools::BROWSER_PROMPT, &json!({"message": "hi"}), "s1")
            .await
            .unwrap();
        assert_eq!(out, r#"{"user_response":"Ada"}"#);
    }
}
