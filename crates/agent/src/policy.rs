//! Tool approval policy.
//!
//! Approval is a pure policy decision over the tool name: denied patterns
//! win over auto-approve patterns, and a tool matching neither set is not
//! auto-approved. Patterns are compiled once at boot.

use regex::RegexSet;

use parley_domain::error::{Error, Result};

#[derive(Debug)]
pub struct ApprovalPolicy {
    auto_approve: RegexSet,
    denied: RegexSet,
}

impl ApprovalPolicy {
    pub fn from_patterns(auto_approve: &[String], denied: &[String]) -> Result<Self> {
        Ok(Self {
            auto_approve: RegexSet::new(auto_approve)
                .map_err(|e| Error::Config(format!("auto_approve_patterns: {e}")))?,
            denied: RegexSet::new(denied)
                .map_err(|e| Error::Config(format!("denied_patterns: {e}")))?,
        })
    }

    /// Approve everything. Used by tests and the default config.
    pub fn permissive() -> Self {
        Self {
            auto_approve: RegexSet::new([".*"]).expect("static pattern"),
            denied: RegexSet::empty(),
        }
    }

    pub fn is_auto_approved(&self, tool_name: &str) -> bool {
        if self.denied.is_match(tool_name) {
            return false;
        }
        self.auto_approve.is_match(tool_name)
    }
}
