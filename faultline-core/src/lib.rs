//! Core data model for the faultline test harness.
//!
//! A test run produces a [`History`]: a totally ordered, densely indexed
//! sequence of [`Op`] records describing every client and nemesis event. The
//! scheduler threads an immutable [`Context`] through every generator call,
//! tracking which worker threads are free and which logical process each
//! thread currently speaks for.

pub mod bitset;
pub mod clock;
pub mod context;
pub mod error;
pub mod history;
pub mod op;
pub mod test;

pub use bitset::BitSet;
pub use clock::Clock;
pub use context::{Context, ThreadMask};
pub use error::CoreError;
pub use history::History;
pub use op::{Kind, Op, Process, Thread};
pub use test::Test;
