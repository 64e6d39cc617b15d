//! The faultline engine: turns a test plan into a history.
//!
//! The interpreter owns the authoritative [`faultline_core::Context`], asks
//! the root generator for ops, dispatches them to per-thread workers over
//! bounded channels, and journals every invocation and completion into the
//! history. Completions are always serviced before new invocations so the
//! recorded timeline stays faithful to the wall clock.

pub mod client;
pub mod error;
pub mod fifo;
pub mod interpreter;
pub mod worker;

pub use client::{Client, ClientFactory, Nemesis, NoopNemesis};
pub use error::EngineError;
pub use fifo::{run_fifo, FifoOptions};
pub use interpreter::{run, TestPlan, TestReport};

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
