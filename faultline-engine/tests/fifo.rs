//! FIFO composer-protocol tests, using plain files in a temp directory in
//! place of real named pipes.

use async_trait::async_trait;
use faultline_core::{Kind, Op, Test};
use faultline_engine::{run_fifo, Client, ClientFactory, FifoOptions, TestPlan};
use faultline_gen::{clients, limit, nothing, repeat};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

struct EchoClient;

#[async_trait]
impl Client for EchoClient {
    async fn setup(&mut self, _test: &Test) -> anyhow::Result<()> {
        Ok(())
    }

    async fn invoke(&mut self, _test: &Test, op: Op) -> anyhow::Result<Op> {
        Ok(op.complete(Kind::Ok).with_value(7))
    }

    async fn teardown(&mut self, _test: &Test) -> anyhow::Result<()> {
        Ok(())
    }

    async fn close(&mut self, _test: &Test) {}
}

struct EchoFactory;

#[async_trait]
impl ClientFactory for EchoFactory {
    async fn open(&self, _test: &Test, _node: Option<&str>) -> anyhow::Result<Box<dyn Client>> {
        Ok(Box::new(EchoClient))
    }
}

/// Polls until `path` holds non-empty content, or panics after ~5s.
async fn await_reply(path: &Path) -> String {
    for _ in 0..500 {
        if let Ok(body) = std::fs::read_to_string(path) {
            if !body.is_empty() {
                return body;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no reply written to {:?}", path);
}

#[tokio::test]
async fn test_op_tokens_drive_single_operations() {
    let dir = tempfile::tempdir().unwrap();
    let fifo_dir = dir.path().join("fifos");

    let plan = TestPlan::new(
        Test::new("fifo", 2),
        clients(repeat(Op::invoke("poke"))),
        Arc::new(EchoFactory),
    );
    let options = FifoOptions {
        dir: fifo_dir.clone(),
        final_generator: Box::new(nothing()),
    };
    let driver = tokio::spawn(run_fifo(plan, options));

    // Give the watcher a moment to arm before the first token.
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Each op-<N> file buys exactly one operation, answered in place.
    let op0 = fifo_dir.join("op-0");
    std::fs::write(&op0, "").unwrap();
    let reply: Op = serde_json::from_str(&await_reply(&op0).await).unwrap();
    assert_eq!(reply.kind, Kind::Ok);
    assert!(reply.f_is("poke"));

    let op1 = fifo_dir.join("op-1");
    std::fs::write(&op1, "").unwrap();
    let reply: Op = serde_json::from_str(&await_reply(&op1).await).unwrap();
    assert_eq!(reply.kind, Kind::Ok);

    // `check` ends the main phase; the driver answers `checked` after the
    // checker runs and the run returns.
    let check = fifo_dir.join("check");
    std::fs::write(&check, "").unwrap();
    assert_eq!(await_reply(&check).await, "checked");

    let report = driver.await.unwrap().expect("fifo run failed");
    // Two granted ops, invoke + completion each.
    assert_eq!(report.history.len(), 4);
    report.history.validate(2).expect("history invariants");
    assert!(report.is_valid());
}

#[tokio::test]
async fn test_final_generator_runs_after_check() {
    let dir = tempfile::tempdir().unwrap();
    let fifo_dir = dir.path().join("fifos");

    let plan = TestPlan::new(
        Test::new("fifo-final", 1),
        clients(repeat(Op::invoke("poke"))),
        Arc::new(EchoFactory),
    );
    let options = FifoOptions {
        dir: fifo_dir.clone(),
        final_generator: Box::new(clients(limit(3, repeat(Op::invoke("drain"))))),
    };
    let driver = tokio::spawn(run_fifo(plan, options));

    tokio::time::sleep(Duration::from_millis(200)).await;
    let check = fifo_dir.join("check");
    std::fs::write(&check, "").unwrap();
    assert_eq!(await_reply(&check).await, "checked");

    let report = driver.await.unwrap().expect("fifo run failed");
    // No main-phase ops were granted; the final phase ran to exhaustion.
    assert_eq!(report.history.len(), 6);
    assert!(report.history.iter().all(|op| op.f_is("drain")));
}

#[tokio::test]
async fn test_stale_files_are_cleared_at_startup() {
    let dir = tempfile::tempdir().unwrap();
    let fifo_dir = dir.path().join("fifos");
    std::fs::create_dir_all(&fifo_dir).unwrap();
    std::fs::write(fifo_dir.join("op-99"), "stale").unwrap();

    let plan = TestPlan::new(
        Test::new("fifo-clean", 1),
        clients(repeat(Op::invoke("poke"))),
        Arc::new(EchoFactory),
    );
    let options = FifoOptions {
        dir: fifo_dir.clone(),
        final_generator: Box::new(nothing()),
    };
    let driver = tokio::spawn(run_fifo(plan, options));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(
        !fifo_dir.join("op-99").exists(),
        "startup should empty the fifo directory"
    );

    std::fs::write(fifo_dir.join("check"), "").unwrap();
    assert_eq!(await_reply(&fifo_dir.join("check")).await, "checked");
    let report = driver.await.unwrap().expect("fifo run failed");
    assert!(report.history.is_empty());
}
