//! Generator errors.

use faultline_core::Op;
use thiserror::Error;

/// Errors surfaced while driving a generator. The scheduler aborts the run
/// on any of these.
#[derive(Error, Debug)]
pub enum GeneratorError {
    /// A generator emitted an op violating the emission contract.
    #[error("invalid op from generator: {}; op: {op:?}", violations.join("; "))]
    InvalidOp { violations: Vec<String>, op: Box<Op> },

    /// A generator failed, annotated with its rendering and the context it
    /// saw so the failure is reconstructible from the log alone.
    #[error("generator failed: {source}\n  in generator: {generator}\n  with context: {context}")]
    WithContext {
        generator: String,
        context: String,
        #[source]
        source: Box<GeneratorError>,
    },

    /// Failure inside user-supplied generator code.
    #[error("{0}")]
    User(String),
}
