//! Error types for the core data model.

use thiserror::Error;

/// Errors raised by history validation and context bookkeeping.
#[derive(Error, Debug)]
pub enum CoreError {
    /// A history broke one of the structural invariants.
    #[error("history invariant violated at index {index}: {reason}")]
    History { index: i64, reason: String },

    /// A context operation referenced a thread outside the table.
    #[error("unknown thread slot {0}")]
    UnknownThread(usize),
}
