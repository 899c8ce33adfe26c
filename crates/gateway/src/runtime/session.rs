//! The interaction loop.
//!
//! One state machine drives both session flavors: validate the request,
//! persist the incoming turn, fetch sanitized history, invoke the agent,
//! accumulate its output, then either commit a terminal text turn or
//! pivot into tool execution and re-enter the model with the results.
//! The flavors differ only in the writer and in whether intermediate
//! chunks leave the process.

use std::sync::Arc;
use std::time::Instant;

use futures_util::StreamExt;
use serde_json::json;

use parley_agent::traits::{Agent, ChatRequest, ModelResponse};
use parley_domain::config::SessionConfig;
use parley_domain::error::{Error, Result};
use parley_domain::message::{FunctionCall, MessageType, Part, Role, ToolResult};
use parley_domain::trace::ExecutionTrace;
use parley_store::{MessageStore, TraceStore};

use super::cancel::CancelToken;
use super::writer::{CollectingWriter, SessionWriter};
use super::{dedupe_calls, response_mapping, tool_result_frame, truncate_str};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Parameters
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Identity of one user-initiated request.
#[derive(Debug, Clone)]
pub struct TurnParams {
    pub conversation_id: String,
    /// Recorded on the conversation row when it is created lazily.
    pub user_id: Option<String>,
    /// Identifies the transport connection; frontend tools route through
    /// it when it resolves to an open client connection.
    pub session_id: String,
}

/// Which agent surface the loop drives.
#[derive(Clone, Copy, PartialEq)]
enum Mode {
    SingleShot,
    Streaming,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runtime
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Shared session orchestrator. One instance serves all sessions; each
/// request runs on its caller's task with its own writer and token.
pub struct SessionRuntime {
    store: MessageStore,
    traces: TraceStore,
    agent: Arc<dyn Agent>,
    history_limit: usize,
    max_tool_loops: usize,
}

impl SessionRuntime {
    pub fn new(
        store: MessageStore,
        traces: TraceStore,
        agent: Arc<dyn Agent>,
        config: &SessionConfig,
    ) -> Self {
        Self {
            store,
            traces,
            agent,
            history_limit: config.history_limit,
            max_tool_loops: config.max_tool_loops.max(1),
        }
    }

    /// Single-shot flavor: run all iterations to completion and return
    /// the final response. Nothing leaves the process while running.
    pub async fn run_single_shot(
        &self,
        params: &TurnParams,
        request: ChatRequest,
        cancel: &CancelToken,
    ) -> Result<ModelResponse> {
        let mut writer = CollectingWriter::new();
        self.run_loop(params, request, cancel, &mut writer, Mode::SingleShot)
            .await
    }

    /// Persistent-connection flavor: every chunk and tool event is
    /// forwarded to the writer as it happens; returns when the loop
    /// terminates (after the `done` marker).
    pub async fn run_streaming<W: SessionWriter>(
        &self,
        params: &TurnParams,
        request: ChatRequest,
        cancel: &CancelToken,
        writer: &mut W,
    ) -> Result<ModelResponse> {
        self.run_loop(params, request, cancel, writer, Mode::Streaming)
            .await
    }

    // ── The state machine ──────────────────────────────────────────

    async fn run_loop<W: SessionWriter>(
        &self,
        params: &TurnParams,
        request: ChatRequest,
        cancel: &CancelToken,
        writer: &mut W,
        mode: Mode,
    ) -> Result<ModelResponse> {
        let result = self
            .run_loop_inner(params, request, cancel, writer, mode)
            .await;

        // One error frame per failed request. Cancellation is an orderly
        // stop, and a dead writer cannot carry a frame anyway.
        if let Err(e) = &result {
            if !matches!(e, Error::Cancelled(_) | Error::Writer(_)) {
                let _ = writer.write_error(&e.to_string()).await;
            }
        }
        result
    }

    async fn run_loop_inner<W: SessionWriter>(
        &self,
        params: &TurnParams,
        request: ChatRequest,
        cancel: &CancelToken,
        writer: &mut W,
        mode: Mode,
    ) -> Result<ModelResponse> {
        // S0: validate.
        request.validate()?;

        // S1: persist the incoming turn. Persistence inside the loop is
        // best-effort: a failed save lags the history, it does not fail
        // the request.
        self.persist_incoming(params, &request).await;

        let mut request = request;

        for loop_idx in 0..self.max_tool_loops {
            tracing::debug!(
                conversation_id = %params.conversation_id,
                loop_idx,
                "loop iteration"
            );
            if cancel.is_cancelled() {
                return Err(Error::Cancelled("request cancelled".into()));
            }

            // S2: fetch + sanitize history. Fatal to the request.
            let history = self
                .store
                .fetch_history(&params.conversation_id, self.history_limit)
                .await?;

            // S3/S4: invoke the agent and accumulate its parts.
            let response = match mode {
                Mode::SingleShot => self.agent.run(&request, &history).await?,
                Mode::Streaming => {
                    self.consume_stream(params, &request, &history, cancel, writer)
                        .await?
                }
            };

            let text = response.text();
            let raw_calls: Vec<&FunctionCall> = response.function_calls();

            // S5: no calls — commit the terminal text turn. An empty
            // response (zero parts) is terminal with empty text.
            if raw_calls.is_empty() {
                if !text.is_empty() {
                    self.persist_best_effort(
                        params,
                        Role::Model,
                        MessageType::ModelMessage,
                        &[Part::text(&text)],
                        None,
                    )
                    .await;
                }
                writer.write_done().await?;
                return Ok(response);
            }

            // S6: dedupe calls, mint missing ids, persist. Text emitted
            // alongside calls is committed first so it stays in history.
            let calls = dedupe_calls(&raw_calls);
            if !text.is_empty() {
                self.persist_best_effort(
                    params,
                    Role::Model,
                    MessageType::ModelMessage,
                    &[Part::text(&text)],
                    None,
                )
                .await;
            }
            for call in &calls {
                let id = call.id.clone();
                self.persist_best_effort(
                    params,
                    Role::Model,
                    MessageType::FunctionCall,
                    &[Part::function_call(id.clone(), &call.name, call.args.clone())],
                    id,
                )
                .await;
            }

            // S7–S9: approve, execute, persist, emit — in first-
            // appearance order. One call's failure never aborts the rest.
            let mut results: Vec<ToolResult> = Vec::new();
            for call in &calls {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled("request cancelled during tool dispatch".into()));
                }
                if let Some(result) = self.dispatch_call(params, call, writer).await? {
                    results.push(result);
                }
            }

            // S10: re-enter with the tool results, or terminate when the
            // iteration executed nothing successfully.
            if results.is_empty() {
                writer.write_done().await?;
                let parts = if text.is_empty() {
                    Vec::new()
                } else {
                    vec![Part::text(&text)]
                };
                return Ok(ModelResponse { parts });
            }
            request = ChatRequest::from_tool_results(results);

            if loop_idx == self.max_tool_loops - 1 {
                writer
                    .write_error(&format!(
                        "tool loop limit reached ({} iterations)",
                        self.max_tool_loops
                    ))
                    .await?;
            }
        }

        writer.write_done().await?;
        Ok(ModelResponse::default())
    }

    // ── S3/S4 (streaming): consume chunks, forwarding verbatim ─────

    async fn consume_stream<W: SessionWriter>(
        &self,
        params: &TurnParams,
        request: &ChatRequest,
        history: &[parley_domain::message::StoredMessage],
        cancel: &CancelToken,
        writer: &mut W,
    ) -> Result<ModelResponse> {
        let mut stream = self.agent.run_stream(request, history).await?;

        let mut response = ModelResponse::default();
        while let Some(item) = stream.next().await {
            if cancel.is_cancelled() {
                // Dropping the stream is the cooperative cancel request.
                drop(stream);
                return Err(Error::Cancelled("request cancelled mid-stream".into()));
            }
            match item {
                Ok(chunk) => {
                    writer.write_event(json!({ "parts": chunk.parts })).await?;
                    response.push_chunk(chunk);
                }
                Err(e) => {
                    tracing::warn!(
                        conversation_id = %params.conversation_id,
                        error = %e,
                        "agent stream error"
                    );
                    return Err(e);
                }
            }
        }
        Ok(response)
    }

    // ── S7–S9: one call through approve → execute → persist → emit ─

    /// Returns `Ok(Some(result))` for a successful execution, `Ok(None)`
    /// when the call was denied or failed (already persisted and traced),
    /// and `Err` only for writer failures.
    async fn dispatch_call<W: SessionWriter>(
        &self,
        params: &TurnParams,
        call: &FunctionCall,
        writer: &mut W,
    ) -> Result<Option<ToolResult>> {
        let call_id = call.id.clone().expect("dedupe_calls assigns every id");

        let approved = match self.agent.approve_tool(&call.name, &call.args).await {
            Ok(approved) => approved,
            Err(e) => {
                tracing::warn!(tool = %call.name, error = %e, "approval check failed");
                false
            }
        };
        if !approved {
            let payload = json!({ "error": "tool not approved" });
            self.record_trace(ExecutionTrace::error(
                &params.conversation_id,
                &call_id,
                &call.name,
                "approve",
                "tool not approved",
            ))
            .await;
            self.persist_response(params, call, &call_id, payload.clone()).await;
            writer
                .write_event(tool_result_frame(
                    &call.name,
                    &call_id,
                    &payload,
                    &payload.to_string(),
                ))
                .await?;
            return Ok(None);
        }

        self.record_trace(ExecutionTrace::start(
            &params.conversation_id,
            &call_id,
            &call.name,
            "execute",
        ))
        .await;
        let started = Instant::now();

        match self
            .agent
            .execute_tool(&call.name, &call.args, &params.session_id)
            .await
        {
            Ok(output) => {
                let elapsed = started.elapsed().as_millis() as u64;
                self.record_trace(
                    ExecutionTrace::end(
                        &params.conversation_id,
                        &call_id,
                        &call.name,
                        "execute",
                        elapsed,
                    )
                    .with_detail("output_preview", json!(truncate_str(&output, 200))),
                )
                .await;

                let mapping = response_mapping(&output);
                self.persist_response(params, call, &call_id, mapping.clone()).await;
                writer
                    .write_event(tool_result_frame(&call.name, &call_id, &mapping, &output))
                    .await?;

                Ok(Some(ToolResult {
                    tool_id: call_id,
                    tool_name: call.name.clone(),
                    tool_output: output,
                }))
            }
            Err(e) => {
                // Tool failure is conversation content, not a loop error:
                // the {error} payload is persisted as the function
                // response and the call drops out of the next iteration.
                self.record_trace(ExecutionTrace::error(
                    &params.conversation_id,
                    &call_id,
                    &call.name,
                    "execute",
                    &e.to_string(),
                ))
                .await;

                let payload = json!({ "error": e.to_string() });
                self.persist_response(params, call, &call_id, payload.clone()).await;
                writer
                    .write_event(tool_result_frame(
                        &call.name,
                        &call_id,
                        &payload,
                        &payload.to_string(),
                    ))
                    .await?;
                Ok(None)
            }
        }
    }

    // ── Persistence helpers (best-effort inside the loop) ──────────

    async fn persist_incoming(&self, params: &TurnParams, request: &ChatRequest) {
        if let Some(user_message) = &request.user_message {
            self.persist_best_effort(
                params,
                Role::User,
                MessageType::UserMessage,
                &user_message.parts(),
                None,
            )
            .await;
        }
        if let Some(results) = &request.tool_results {
            for result in results {
                let mapping = response_mapping(&result.tool_output);
                self.persist_best_effort(
                    params,
                    Role::User,
                    MessageType::FunctionResponse,
                    &[Part::function_response(
                        Some(result.tool_id.clone()),
                        &result.tool_name,
                        mapping,
                    )],
                    Some(result.tool_id.clone()),
                )
                .await;
            }
        }
    }

    async fn persist_response(
        &self,
        params: &TurnParams,
        call: &FunctionCall,
        call_id: &str,
        payload: serde_json::Value,
    ) {
        self.persist_best_effort(
            params,
            Role::User,
            MessageType::FunctionResponse,
            &[Part::function_response(
                Some(call_id.to_owned()),
                &call.name,
                payload,
            )],
            Some(call_id.to_owned()),
        )
        .await;
    }

    async fn persist_best_effort(
        &self,
        params: &TurnParams,
        role: Role,
        message_type: MessageType,
        parts: &[Part],
        function_id: Option<String>,
    ) {
        if let Err(e) = self
            .store
            .save_message(
                &params.conversation_id,
                params.user_id.as_deref(),
                role,
                message_type,
                parts,
                function_id,
            )
            .await
        {
            tracing::warn!(
                conversation_id = %params.conversation_id,
                error = %e,
                "failed to persist message; continuing with lagged history"
            );
        }
    }

    async fn record_trace(&self, trace: ExecutionTrace) {
        if let Err(e) = self.traces.record(trace).await {
            tracing::warn!(error = %e, "failed to record trace");
        }
    }
}
