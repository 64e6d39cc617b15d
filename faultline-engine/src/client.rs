//! Contracts the engine consumes: database clients and the nemesis.
//!
//! Implementations live with the system under test; the engine only drives
//! them. A client's `invoke` returns the completed op (`ok`, `fail`, or
//! `info` kind, same `f` and `process`); returning an error means the
//! operation's effect is unknown, and the worker records an indeterminate
//! `info` completion.

use async_trait::async_trait;
use faultline_core::{Op, Test};

/// A connection to one node of the system under test.
#[async_trait]
pub trait Client: Send {
    /// One-time per-connection initialization.
    async fn setup(&mut self, test: &Test) -> anyhow::Result<()>;

    /// Applies `op` and returns its completion.
    async fn invoke(&mut self, test: &Test, op: Op) -> anyhow::Result<Op>;

    /// Releases any state created in `setup`.
    async fn teardown(&mut self, test: &Test) -> anyhow::Result<()>;

    /// Closes the connection. Infallible: close failures are not
    /// actionable during shutdown.
    async fn close(&mut self, test: &Test);
}

/// Opens client connections, one per worker, bound to a node.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn open(&self, test: &Test, node: Option<&str>) -> anyhow::Result<Box<dyn Client>>;
}

/// The fault injector. Runs on its own dedicated thread; its completions
/// are always `info`, since fault effects are not request/response shaped.
#[async_trait]
pub trait Nemesis: Send {
    async fn setup(&mut self, test: &Test) -> anyhow::Result<()>;

    async fn invoke(&mut self, test: &Test, op: Op) -> anyhow::Result<Op>;

    async fn teardown(&mut self, test: &Test) -> anyhow::Result<()>;
}

/// A nemesis that injects nothing and acknowledges everything.
#[derive(Debug, Default)]
pub struct NoopNemesis;

#[async_trait]
impl Nemesis for NoopNemesis {
    async fn setup(&mut self, _test: &Test) -> anyhow::Result<()> {
        Ok(())
    }

    async fn invoke(&mut self, _test: &Test, op: Op) -> anyhow::Result<Op> {
        Ok(op.complete(faultline_core::Kind::Info))
    }

    async fn teardown(&mut self, _test: &Test) -> anyhow::Result<()> {
        Ok(())
    }
}
