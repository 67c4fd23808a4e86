//! Configuration-level failures of the execution core.
//!
//! Candidate-code problems (security rejections, runtime exceptions,
//! resource kills) are never errors: they are returned as
//! [`ExecutionOutcome`](crate::outcome::ExecutionOutcome) data. Only setup
//! problems the caller must fix surface through this type.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SandboxError>;

#[derive(Error, Debug)]
pub enum SandboxError {
    /// The requested policy name is neither registered nor an alias.
    #[error("unknown policy: {0}")]
    UnknownPolicy(String),

    /// A policy document is internally inconsistent.
    #[error("invalid policy '{name}': {reason}")]
    InvalidPolicy { name: String, reason: String },

    /// The request violates a precondition (non-positive limit, bad entry point, ...).
    #[error("invalid execution request: {0}")]
    InvalidRequest(String),

    /// Sandboxed execution was switched off in the configuration.
    #[error("sandboxed execution is disabled by configuration")]
    Disabled,

    #[error("failed to parse policy document: {0}")]
    PolicyDocument(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    pub(crate) fn invalid_policy(name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidPolicy {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}
