//! Per-thread workers: the only code that touches clients.
//!
//! A worker owns one inbound queue of invocations and reports completions
//! on the shared completion channel. Workers never consult the generator;
//! all scheduling is central. Lifecycle: `setup → running → teardown`.

use crate::client::{Client, ClientFactory, Nemesis};
use faultline_core::{Kind, Op, Test, Thread};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Messages the interpreter sends a worker.
#[derive(Debug)]
pub(crate) enum WorkerMsg {
    Invoke(Op),
    Exit,
}

/// A completion reported back to the interpreter.
#[derive(Debug)]
pub(crate) struct Completion {
    pub thread: Thread,
    pub op: Op,
}

/// Inbound capacity: one in-flight invocation plus an exit request.
const INBOX_CAPACITY: usize = 2;

pub(crate) struct WorkerHandle {
    pub thread: Thread,
    pub inbox: mpsc::Sender<WorkerMsg>,
    pub join: JoinHandle<()>,
    /// Workers are force-cancelled at most once so teardown is never
    /// interrupted twice.
    pub cancelled: bool,
}

impl WorkerHandle {
    /// Force-cancels the worker task if it has not been cancelled before.
    pub fn cancel_once(&mut self) {
        if !self.cancelled {
            self.cancelled = true;
            self.join.abort();
        }
    }
}

pub(crate) fn spawn_client_worker(
    index: usize,
    test: Arc<Test>,
    factory: Arc<dyn ClientFactory>,
    completions: mpsc::Sender<Completion>,
) -> WorkerHandle {
    let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
    let thread = Thread::Client(index);
    let join = tokio::spawn(async move {
        client_worker(index, test, factory, rx, completions).await;
    });
    WorkerHandle {
        thread,
        inbox: tx,
        join,
        cancelled: false,
    }
}

pub(crate) fn spawn_nemesis_worker(
    test: Arc<Test>,
    nemesis: Box<dyn Nemesis>,
    completions: mpsc::Sender<Completion>,
) -> WorkerHandle {
    let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
    let join = tokio::spawn(async move {
        nemesis_worker(test, nemesis, rx, completions).await;
    });
    WorkerHandle {
        thread: Thread::Nemesis,
        inbox: tx,
        join,
        cancelled: false,
    }
}

/// Opens and sets up a client. A failed open degrades the worker to
/// no-client mode; each later invocation retries.
async fn open_client(
    index: usize,
    test: &Test,
    factory: &Arc<dyn ClientFactory>,
) -> Option<Box<dyn Client>> {
    let node = test.node_for(index).map(str::to_owned);
    match factory.open(test, node.as_deref()).await {
        Ok(mut client) => match client.setup(test).await {
            Ok(()) => Some(client),
            Err(e) => {
                warn!(worker = index, error = %e, "client setup failed");
                None
            }
        },
        Err(e) => {
            warn!(worker = index, error = %e, "client open failed");
            None
        }
    }
}

async fn client_worker(
    index: usize,
    test: Arc<Test>,
    factory: Arc<dyn ClientFactory>,
    mut inbox: mpsc::Receiver<WorkerMsg>,
    completions: mpsc::Sender<Completion>,
) {
    let thread = Thread::Client(index);
    let mut client = open_client(index, &test, &factory).await;
    debug!(worker = index, connected = client.is_some(), "worker running");

    while let Some(msg) = inbox.recv().await {
        let op = match msg {
            WorkerMsg::Exit => break,
            WorkerMsg::Invoke(op) => op,
        };

        let completion = match op.kind {
            Kind::Sleep | Kind::Log => run_pseudo_op(op).await,
            _ => {
                if client.is_none() {
                    client = open_client(index, &test, &factory).await;
                }
                match &mut client {
                    None => op
                        .complete(Kind::Fail)
                        .with_error("no-client"),
                    Some(c) => invoke_client(c.as_mut(), &test, op).await,
                }
            }
        };

        if completions
            .send(Completion {
                thread,
                op: completion,
            })
            .await
            .is_err()
        {
            // Interpreter is gone; nothing left to report to.
            break;
        }
    }

    if let Some(mut c) = client {
        if let Err(e) = c.teardown(&test).await {
            warn!(worker = index, error = %e, "client teardown failed");
        }
        c.close(&test).await;
    }
    debug!(worker = index, "worker closed");
}

/// Invokes the client, translating errors and panics into indeterminate
/// completions and validating well-formed ones.
async fn invoke_client(client: &mut dyn Client, test: &Test, op: Op) -> Op {
    let outcome = AssertUnwindSafe(client.invoke(test, op.clone()))
        .catch_unwind()
        .await;
    match outcome {
        Ok(Ok(completion)) => validate_completion(&op, completion, false),
        Ok(Err(e)) => op
            .complete(Kind::Info)
            .with_error(format!("indeterminate: {}", e)),
        Err(panic) => op
            .complete(Kind::Info)
            .with_error(format!("indeterminate: {}", panic_message(panic))),
    }
}

/// Checks a returned completion against its invocation: same family, same
/// process, and a legal completion kind. Anything else is recorded as
/// indeterminate, since the client evidently lost track of the op.
fn validate_completion(op: &Op, completion: Op, nemesis: bool) -> Op {
    let kind_ok = if nemesis {
        completion.kind == Kind::Info
    } else {
        completion.kind.is_completion()
    };
    if kind_ok && completion.f == op.f && completion.process == op.process {
        completion
    } else {
        op.complete(Kind::Info).with_error(format!(
            "malformed completion: kind {:?}, f {:?}, process {:?}",
            completion.kind, completion.f, completion.process
        ))
    }
}

/// Sleep and log pseudo-ops run on the worker itself, never the client.
async fn run_pseudo_op(op: Op) -> Op {
    match op.kind {
        Kind::Sleep => {
            let seconds = op.value.as_ref().and_then(|v| v.as_f64()).unwrap_or(0.0);
            tokio::time::sleep(Duration::from_secs_f64(seconds.max(0.0))).await;
        }
        Kind::Log => {
            let message = op.value.as_ref().and_then(|v| v.as_str()).unwrap_or("");
            info!(target: "faultline", "{}", message);
        }
        _ => {}
    }
    op
}

async fn nemesis_worker(
    test: Arc<Test>,
    mut nemesis: Box<dyn Nemesis>,
    mut inbox: mpsc::Receiver<WorkerMsg>,
    completions: mpsc::Sender<Completion>,
) {
    if let Err(e) = nemesis.setup(&test).await {
        warn!(error = %e, "nemesis setup failed");
    }

    while let Some(msg) = inbox.recv().await {
        let op = match msg {
            WorkerMsg::Exit => break,
            WorkerMsg::Invoke(op) => op,
        };

        let completion = match op.kind {
            Kind::Sleep | Kind::Log => run_pseudo_op(op).await,
            _ => {
                let outcome = AssertUnwindSafe(nemesis.invoke(&test, op.clone()))
                    .catch_unwind()
                    .await;
                match outcome {
                    Ok(Ok(completion)) => validate_completion(&op, completion, true),
                    Ok(Err(e)) => op
                        .complete(Kind::Info)
                        .with_error(format!("indeterminate: {}", e)),
                    Err(panic) => op
                        .complete(Kind::Info)
                        .with_error(format!("indeterminate: {}", panic_message(panic))),
                }
            }
        };

        if completions
            .send(Completion {
                thread: Thread::Nemesis,
                op: completion,
            })
            .await
            .is_err()
        {
            break;
        }
    }

    if let Err(e) = nemesis.teardown(&test).await {
        warn!(error = %e, "nemesis teardown failed");
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "worker panicked".to_string())
}
