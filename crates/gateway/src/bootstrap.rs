//! AppState construction — the shared boot path.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use parley_agent::{ApprovalPolicy, GeminiAgent, ToolRegistry};
use parley_domain::config::{Config, ConfigSeverity};
use parley_store::{MessageStore, TraceStore};

use crate::runtime::{CancelMap, ConnectionRegistry, FrontendBridge, SessionRuntime};
use crate::state::AppState;

/// Validate config, initialize every subsystem, and return a fully-wired
/// [`AppState`].
pub async fn build_app_state(config: Arc<Config>) -> anyhow::Result<AppState> {
    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── Storage ──────────────────────────────────────────────────────
    if let Some(parent) = config.storage.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).context("creating database directory")?;
        }
    }
    let store = MessageStore::connect(config.storage.db_path.clone())
        .await
        .context("opening message store")?;
    let traces = TraceStore::connect(config.storage.db_path.clone())
        .await
        .context("opening trace store")?;
    tracing::info!(path = %config.storage.db_path.display(), "stores ready");

    // ── Connections + frontend bridge ────────────────────────────────
    let connections = Arc::new(ConnectionRegistry::new());
    let bridge = Arc::new(FrontendBridge::new(
        connections.clone(),
        Duration::from_secs(config.session.frontend_tool_timeout_secs),
    ));
    tracing::info!(
        timeout_secs = config.session.frontend_tool_timeout_secs,
        "frontend bridge ready"
    );

    // ── Agent ────────────────────────────────────────────────────────
    let tools = Arc::new(ToolRegistry::new());
    let policy = ApprovalPolicy::from_patterns(
        &config.tools.auto_approve_patterns,
        &config.tools.denied_patterns,
    )
    .context("compiling tool approval patterns")?;
    let router = bridge as Arc<dyn parley_agent::FrontendRouter>;
    let agent = Arc::new(
        GeminiAgent::from_config(&config.model, tools, policy, Some(router))
            .context("initializing model backend")?,
    );
    tracing::info!(model = %config.model.default_model, "agent ready");

    // ── Session runtime ──────────────────────────────────────────────
    let runtime = Arc::new(SessionRuntime::new(
        store.clone(),
        traces.clone(),
        agent,
        &config.session,
    ));
    let cancels = Arc::new(CancelMap::new());
    tracing::info!(
        history_limit = config.session.history_limit,
        max_tool_loops = config.session.max_tool_loops,
        "session runtime ready"
    );

    Ok(AppState {
        config,
        store,
        traces,
        runtime,
        connections,
        cancels,
    })
}
