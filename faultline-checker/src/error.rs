//! Checker errors.

use thiserror::Error;

/// Errors from checker runs. Composites demote these to `Unknown` results;
/// a bare checker surfaces them to the caller.
#[derive(Error, Debug)]
pub enum CheckerError {
    /// The checker could not produce a verdict.
    #[error("checker failed: {0}")]
    Failed(String),

    /// The history is missing something the checker requires.
    #[error("history unsuitable: {0}")]
    Unsuitable(String),

    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}
