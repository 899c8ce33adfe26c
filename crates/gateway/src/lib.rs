//! Parley gateway — the session orchestration service.
//!
//! Drives multi-turn interactions with a generative model, mediates tool
//! calls (including browser tools that round-trip to the connected
//! client), persists turn-structured history, and fans streaming output
//! over WebSocket and chunked-HTTP transports.

pub mod api;
pub mod bootstrap;
pub mod cli;
pub mod runtime;
pub mod state;
