//! Output writer adapters.
//!
//! The session loop writes frames through one narrow contract; the two
//! transport variants differ only in how bytes leave the process. Writers
//! are not concurrent-safe — exactly one loop task writes per session.
//! Each writer logs time-to-first-event once per session.

use std::time::Instant;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use parley_domain::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Contract
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Sink for one session's outbound frames.
#[async_trait::async_trait]
pub trait SessionWriter: Send {
    /// Serialize and emit one frame.
    async fn write_event(&mut self, event: Value) -> Result<()>;

    /// Emit an error frame.
    async fn write_error(&mut self, message: &str) -> Result<()>;

    /// Emit the terminal marker.
    async fn write_done(&mut self) -> Result<()>;

    /// Force buffered bytes to the peer. No-op for frame-oriented
    /// transports.
    async fn flush(&mut self) -> Result<()>;
}

/// Logs the latency from session start to the first emitted event.
struct FirstEventTimer {
    session_id: String,
    started: Instant,
    logged: bool,
}

impl FirstEventTimer {
    fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_owned(),
            started: Instant::now(),
            logged: false,
        }
    }

    fn observe(&mut self) {
        if self.logged {
            return;
        }
        self.logged = true;
        tracing::info!(
            session_id = %self.session_id,
            first_event_ms = self.started.elapsed().as_millis() as u64,
            "first event written"
        );
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Persistent-connection writer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Sends structured frames into the connection's outbound channel; the
/// socket task owns actual wire writes. A closed channel means the peer
/// is gone, which is fatal to the session.
pub struct SocketWriter {
    outbound: mpsc::Sender<Value>,
    timer: FirstEventTimer,
}

impl SocketWriter {
    pub fn new(session_id: &str, outbound: mpsc::Sender<Value>) -> Self {
        Self {
            outbound,
            timer: FirstEventTimer::new(session_id),
        }
    }

    async fn send(&self, frame: Value) -> Result<()> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| Error::Writer("client connection closed".into()))
    }
}

#[async_trait::async_trait]
impl SessionWriter for SocketWriter {
    async fn write_event(&mut self, event: Value) -> Result<()> {
        self.timer.observe();
        self.send(event).await
    }

    async fn write_error(&mut self, message: &str) -> Result<()> {
        self.send(json!({ "error": message })).await
    }

    async fn write_done(&mut self) -> Result<()> {
        self.send(json!({ "type": "done" })).await
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Chunked-response writer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Writes each frame as one serialized line (`\n` record separator) into
/// the response-body channel, flushing after every frame.
pub struct ChunkedWriter {
    body: mpsc::Sender<String>,
    buffer: String,
    timer: FirstEventTimer,
}

impl ChunkedWriter {
    pub fn new(session_id: &str, body: mpsc::Sender<String>) -> Self {
        Self {
            body,
            buffer: String::new(),
            timer: FirstEventTimer::new(session_id),
        }
    }

    fn buffer_frame(&mut self, frame: &Value) {
        self.buffer.push_str(&frame.to_string());
        self.buffer.push('\n');
    }
}

#[async_trait::async_trait]
impl SessionWriter for ChunkedWriter {
    async fn write_event(&mut self, event: Value) -> Result<()> {
        self.timer.observe();
        self.buffer_frame(&event);
        self.flush().await
    }

    async fn write_error(&mut self, message: &str) -> Result<()> {
        self.buffer_frame(&json!({ "error": message }));
        self.flush().await
    }

    async fn write_done(&mut self) -> Result<()> {
        self.buffer_frame(&json!({ "type": "done" }));
        self.flush().await
    }

    async fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::take(&mut self.buffer);
        self.body
            .send(chunk)
            .await
            .map_err(|_| Error::Writer("client disconnected".into()))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Collecting writer (single-shot flavor)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Retains frames in memory; nothing leaves the process until the loop
/// returns. Used by the single-shot entry point and by tests.
#[derive(Default)]
pub struct CollectingWriter {
    pub events: Vec<Value>,
    pub errors: Vec<String>,
    pub done: bool,
}

impl CollectingWriter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl SessionWriter for CollectingWriter {
    async fn write_event(&mut self, event: Value) -> Result<()> {
        self.events.push(event);
        Ok(())
    }

    async fn write_error(&mut self, message: &str) -> Result<()> {
        self.errors.push(message.to_owned());
        Ok(())
    }

    async fn write_done(&mut self) -> Result<()> {
        self.done = true;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
