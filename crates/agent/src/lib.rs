//! The agent contract and its default backend.
//!
//! The session core consumes a uniform surface over a model: blocking
//! single-shot, streaming, tool approval, and tool dispatch. This crate
//! defines that surface ([`Agent`]), the tool registry and approval
//! policy behind dispatch, and a Gemini-flavored streaming backend.

pub mod gemini;
pub mod policy;
pub mod tools;
pub mod traits;
pub(crate) mod sse;

pub use gemini::GeminiAgent;
pub use policy::ApprovalPolicy;
pub use tools::{
    frontend_tool_definitions, is_frontend_tool, FrontendRouter, Tool, ToolDefinition,
    ToolRegistry, BROWSER_ALERT, BROWSER_CONFIRM, BROWSER_PROMPT,
};
pub use traits::{Agent, AgentStream, BoxStream, ChatRequest, Content, ModelChunk, ModelResponse, UserMessage};
