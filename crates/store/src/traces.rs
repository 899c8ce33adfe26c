//! Append-only tool-execution trace log.
//!
//! Records are buffered in memory and written in batches to keep the hot
//! loop off the driver; queries and deletes flush the buffer first so
//! readers always observe every record appended before the call.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use parking_lot::Mutex as PlMutex;
use rusqlite::{params, Connection};
use serde_json::{Map, Value};

use parley_domain::error::{Error, Result};
use parley_domain::trace::{ExecutionTrace, TraceStatus};

/// Buffered records are written once this many have accumulated.
const BATCH_SIZE: usize = 100;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS execution_traces (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id TEXT NOT NULL,
    tool_call_id    TEXT NOT NULL,
    trace_id        TEXT NOT NULL,
    parent_id       TEXT,
    tool            TEXT NOT NULL,
    operation       TEXT NOT NULL,
    status          TEXT NOT NULL,
    label           TEXT NOT NULL,
    details         TEXT NOT NULL,
    timestamp_ns    INTEGER NOT NULL,
    duration_ms     INTEGER
);

CREATE INDEX IF NOT EXISTS idx_traces_conversation
    ON execution_traces(conversation_id, timestamp_ns);
CREATE INDEX IF NOT EXISTS idx_traces_call
    ON execution_traces(tool_call_id);
"#;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone)]
pub struct TraceStore {
    conn: Arc<Mutex<Connection>>,
    buffer: Arc<PlMutex<Vec<ExecutionTrace>>>,
}

impl TraceStore {
    pub async fn connect(path: PathBuf) -> Result<Self> {
        let conn = tokio::task::spawn_blocking(move || -> rusqlite::Result<Connection> {
            let conn = Connection::open(&path)?;
            conn.execute_batch(SCHEMA)?;
            Ok(conn)
        })
        .await
        .map_err(|e| Error::Storage(format!("blocking task failed: {e}")))?
        .map_err(storage_err)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            buffer: Arc::new(PlMutex::new(Vec::new())),
        })
    }

    pub async fn connect_in_memory() -> Result<Self> {
        let conn = tokio::task::spawn_blocking(|| -> rusqlite::Result<Connection> {
            let conn = Connection::open_in_memory()?;
            conn.execute_batch(SCHEMA)?;
            Ok(conn)
        })
        .await
        .map_err(|e| Error::Storage(format!("blocking task failed: {e}")))?
        .map_err(storage_err)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            buffer: Arc::new(PlMutex::new(Vec::new())),
        })
    }

    async fn run_blocking<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().expect("trace store mutex poisoned");
            f(&mut conn)
        })
        .await
        .map_err(|e| Error::Storage(format!("blocking task failed: {e}")))?
        .map_err(storage_err)
    }

    // ── Appends ────────────────────────────────────────────────────

    /// Buffer one record; the batch is written once it reaches
    /// [`BATCH_SIZE`]. Also logs the record through `tracing`.
    pub async fn record(&self, trace: ExecutionTrace) -> Result<()> {
        trace.emit();
        let flush_now = {
            let mut buffer = self.buffer.lock();
            buffer.push(trace);
            buffer.len() >= BATCH_SIZE
        };
        if flush_now {
            self.flush().await?;
        }
        Ok(())
    }

    /// Write all buffered records.
    pub async fn flush(&self) -> Result<()> {
        let drained: Vec<ExecutionTrace> = {
            let mut buffer = self.buffer.lock();
            std::mem::take(&mut *buffer)
        };
        if drained.is_empty() {
            return Ok(());
        }

        self.run_blocking(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO execution_traces
                         (conversation_id, tool_call_id, trace_id, parent_id, tool,
                          operation, status, label, details, timestamp_ns, duration_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                )?;
                for t in &drained {
                    let details = Value::Object(t.details.clone()).to_string();
                    stmt.execute(params![
                        t.conversation_id,
                        t.tool_call_id,
                        t.trace_id,
                        t.parent_id,
                        t.tool,
                        t.operation,
                        t.status.as_str(),
                        t.label,
                        details,
                        t.timestamp_ns,
                        t.duration_ms.map(|d| d as i64),
                    ])?;
                }
            }
            tx.commit()
        })
        .await
    }

    /// Number of records waiting in the batch buffer.
    pub fn buffered(&self) -> usize {
        self.buffer.lock().len()
    }

    // ── Queries ────────────────────────────────────────────────────

    pub async fn traces_for_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<ExecutionTrace>> {
        self.flush().await?;
        let conversation_id = conversation_id.to_owned();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT conversation_id, tool_call_id, trace_id, parent_id, tool,
                        operation, status, label, details, timestamp_ns, duration_ms
                 FROM execution_traces
                 WHERE conversation_id = ?1
                 ORDER BY timestamp_ns ASC",
            )?;
            let rows = stmt
                .query_map(params![conversation_id], row_to_trace)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn traces_for_call(&self, tool_call_id: &str) -> Result<Vec<ExecutionTrace>> {
        self.flush().await?;
        let tool_call_id = tool_call_id.to_owned();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT conversation_id, tool_call_id, trace_id, parent_id, tool,
                        operation, status, label, details, timestamp_ns, duration_ms
                 FROM execution_traces
                 WHERE tool_call_id = ?1
                 ORDER BY timestamp_ns ASC",
            )?;
            let rows = stmt
                .query_map(params![tool_call_id], row_to_trace)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    /// Remove all traces for a conversation, buffered ones included.
    pub async fn delete_for_conversation(&self, conversation_id: &str) -> Result<()> {
        {
            let mut buffer = self.buffer.lock();
            buffer.retain(|t| t.conversation_id != conversation_id);
        }
        self.flush().await?;
        let conversation_id = conversation_id.to_owned();
        self.run_blocking(move |conn| {
            conn.execute(
                "DELETE FROM execution_traces WHERE conversation_id = ?1",
                params![conversation_id],
            )?;
            Ok(())
        })
        .await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Row mapping
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn row_to_trace(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionTrace> {
    let status_str: String = row.get(6)?;
    let details_raw: String = row.get(8)?;

    let status = TraceStatus::parse(&status_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            6,
            rusqlite::types::Type::Text,
            format!("unknown trace status {status_str:?}").into(),
        )
    })?;
    let details: Map<String, Value> = serde_json::from_str(&details_raw).unwrap_or_default();

    Ok(ExecutionTrace {
        conversation_id: row.get(0)?,
        tool_call_id: row.get(1)?,
        trace_id: row.get(2)?,
        parent_id: row.get(3)?,
        tool: row.get(4)?,
        operation: row.get(5)?,
        status,
        label: row.get(7)?,
        details,
        timestamp_ns: row.get(9)?,
        duration_ms: row.get::<_, Option<i64>>(10)?.map(|d| d as u64),
    })
}

fn storage_err(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> TraceStore {
        TraceStore::connect_in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn records_buffer_until_batch_size() {
        let store = store().await;
        for i in 0..(BATCH_SIZE - 1) {
            store
                .record(ExecutionTrace::start("c1", &format!("call_{i}"), "Search", "execute"))
                .await
                .unwrap();
        }
        assert_eq!(store.buffered(), BATCH_SIZE - 1);

        store
            .record(ExecutionTrace::start("c1", "call_last", "Search", "execute"))
            .await
            .unwrap();
        assert_eq!(store.buffered(), 0, "hitting the batch size flushes");

        let traces = store.traces_for_conversation("c1").await.unwrap();
        assert_eq!(traces.len(), BATCH_SIZE);
    }

    #[tokio::test]
    async fn query_flushes_buffer_first() {
        let store = store().await;
        store
            .record(ExecutionTrace::start("c1", "call_1", "Search", "execute"))
            .await
            .unwrap();
        store
            .record(ExecutionTrace::end("c1", "call_1", "Search", "execute", 7))
            .await
            .unwrap();

        let traces = store.traces_for_conversation("c1").await.unwrap();
        assert_eq!(traces.len(), 2);
        assert_eq!(traces[0].status, TraceStatus::Start);
        assert_eq!(traces[1].status, TraceStatus::End);
        assert_eq!(traces[1].duration_ms, Some(7));
    }

    #[tokio::test]
    async fn details_roundtrip_through_text() {
        let store = store().await;
        let trace = ExecutionTrace::error("c1", "call_1", "Search", "execute", "boom")
            .with_detail("attempt", serde_json::json!(2));
        store.record(trace).await.unwrap();

        let traces = store.traces_for_call("call_1").await.unwrap();
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].details.get("error"), Some(&serde_json::json!("boom")));
        assert_eq!(traces[0].details.get("attempt"), Some(&serde_json::json!(2)));
    }

    #[tokio::test]
    async fn delete_for_conversation_covers_buffered_records() {
        let store = store().await;
        store
            .record(ExecutionTrace::start("keep", "call_a", "Search", "execute"))
            .await
            .unwrap();
        store
            .record(ExecutionTrace::start("drop", "call_b", "Search", "execute"))
            .await
            .unwrap();

        store.delete_for_conversation("drop").await.unwrap();

        assert!(store.traces_for_conversation("drop").await.unwrap().is_empty());
        assert_eq!(store.traces_for_conversation("keep").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn traces_ordered_by_timestamp() {
        let store = store().await;
        for i in 0..5 {
            store
                .record(ExecutionTrace::start("c1", &format!("call_{i}"), "T", "execute"))
                .await
                .unwrap();
        }
        let traces = store.traces_for_conversation("c1").await.unwrap();
        let stamps: Vec<i64> = traces.iter().map(|t| t.timestamp_ns).collect();
        let mut sorted = stamps.clone();
        sorted.sort_unstable();
        assert_eq!(stamps, sorted);
    }
}
