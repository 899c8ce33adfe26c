//! Shared application state handed to every handler.

use std::sync::Arc;

use parley_domain::config::Config;
use parley_store::{MessageStore, TraceStore};

use crate::runtime::{CancelMap, ConnectionRegistry, SessionRuntime};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: MessageStore,
    pub traces: TraceStore,
    pub runtime: Arc<SessionRuntime>,
    /// Live persistent connections, keyed by session id. Also the routing
    /// table for frontend tools.
    pub connections: Arc<ConnectionRegistry>,
    /// Cancellation tokens for running turns, keyed by conversation id.
    pub cancels: Arc<CancelMap>,
}
