//! Shared domain types for Parley.
//!
//! The conversation/message model, trace records, configuration, and the
//! error type every other crate builds on.

pub mod config;
pub mod error;
pub mod message;
pub mod trace;

pub use error::{Error, Result};
pub use message::{
    collect_text, decode_parts, encode_parts, role_type_allowed, Conversation, FunctionCall,
    FunctionResponse, MessageType, Part, Role, StoredMessage, ToolResult,
};
pub use trace::{ExecutionTrace, TraceStatus};
