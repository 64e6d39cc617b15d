//! Engine errors.

use thiserror::Error;

/// Errors that abort a run. On any of these the interpreter asks every
/// worker to exit and force-cancels stragglers at most once.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Generator(#[from] faultline_gen::GeneratorError),

    #[error(transparent)]
    Checker(#[from] faultline_checker::CheckerError),

    /// A worker or its channel vanished mid-run.
    #[error("worker failure: {0}")]
    Worker(String),

    /// The FIFO driver saw something it cannot recover from (watcher
    /// overflow, unexpected event, malformed filename).
    #[error("fifo driver failure: {0}")]
    Fifo(String),

    #[error("io failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("watch failure: {0}")]
    Watch(#[from] notify::Error),
}
