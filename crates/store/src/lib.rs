//! Persistence for Parley.
//!
//! Turn-structured conversation records in SQLite, the history sanitizer
//! that keeps retrieved slices valid for model turn-structure rules, and
//! the append-only tool-execution trace log.

pub mod messages;
pub mod sanitize;
pub mod traces;

pub use messages::MessageStore;
pub use sanitize::sanitize_history;
pub use traces::TraceStore;
