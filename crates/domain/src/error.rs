/// Shared error type used across all Parley crates.
///
/// The first six variants map onto the orchestration failure classes the
/// session loop distinguishes: validation stops a request before the loop
/// starts, storage is best-effort inside the loop, agent errors terminate
/// the current request, tool errors are folded into the conversation,
/// writer errors are fatal to the session, and cancellation is an orderly
/// stop rather than a failure.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("validation: {0}")]
    Validation(String),

    #[error("storage: {0}")]
    Storage(String),

    #[error("agent: {0}")]
    Agent(String),

    #[error("tool {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("writer: {0}")]
    Writer(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("config: {0}")]
    Config(String),
}

impl Error {
    /// True when the session owning the failed request must be torn down.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(self, Error::Writer(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_errors_are_session_fatal() {
        assert!(Error::Writer("peer gone".into()).is_fatal_to_session());
        assert!(!Error::Validation("bad".into()).is_fatal_to_session());
        assert!(!Error::ToolExecution {
            tool: "Search".into(),
            message: "boom".into()
        }
        .is_fatal_to_session());
    }
}
