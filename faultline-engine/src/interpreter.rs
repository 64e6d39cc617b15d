//! The interpreter main loop.
//!
//! One task owns the context, the history, and the generator. Workers only
//! ever see the invocations handed to them. Completions take priority over
//! new invocations: a delayed completion would falsely inflate concurrency
//! in the history, so the loop drains the completion channel before asking
//! the generator for more work.

use crate::client::{ClientFactory, Nemesis, NoopNemesis};
use crate::worker::{
    spawn_client_worker, spawn_nemesis_worker, Completion, WorkerHandle, WorkerMsg,
};
use crate::{EngineError, EngineResult};
use faultline_checker::{unbridled_optimism, CheckOpts, CheckResult, Checker};
use faultline_core::{Clock, Context, History, Kind, Op, Test, Thread};
use faultline_gen::{validate, with_context, Emit, Generator};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info};

/// How long to wait before re-asking a pending or blocked generator.
pub(crate) const MAX_PENDING_INTERVAL: Duration = Duration::from_millis(10);

/// How long a worker gets to exit gracefully before it is cancelled.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Everything needed to run one test: static facts, behavior, and the
/// final judge.
pub struct TestPlan {
    pub test: Test,
    pub generator: Box<dyn Generator>,
    pub client: Arc<dyn ClientFactory>,
    pub nemesis: Box<dyn Nemesis>,
    pub checker: Box<dyn Checker>,
}

impl TestPlan {
    pub fn new(
        test: Test,
        generator: impl Generator + 'static,
        client: Arc<dyn ClientFactory>,
    ) -> Self {
        TestPlan {
            test,
            generator: Box::new(generator),
            client,
            nemesis: Box::new(NoopNemesis),
            checker: unbridled_optimism(),
        }
    }

    pub fn with_nemesis(mut self, nemesis: impl Nemesis + 'static) -> Self {
        self.nemesis = Box::new(nemesis);
        self
    }

    pub fn with_checker(mut self, checker: Box<dyn Checker>) -> Self {
        self.checker = checker;
        self
    }
}

/// The outcome of a run: the full history and the checker's verdict.
#[derive(Debug)]
pub struct TestReport {
    pub test: Test,
    pub history: History,
    pub result: CheckResult,
}

impl TestReport {
    pub fn is_valid(&self) -> bool {
        self.result.valid.is_valid()
    }
}

/// Runs a plan to completion: drive the generator dry, join the workers,
/// then check the history.
pub async fn run(plan: TestPlan) -> EngineResult<TestReport> {
    let TestPlan {
        test,
        generator,
        client,
        nemesis,
        checker,
    } = plan;
    let test = Arc::new(test);
    let mut interpreter = Interpreter::new(test.clone(), client, nemesis);
    let root: Box<dyn Generator> = Box::new(with_context(validate(generator)));

    let outcome = interpreter.drive(root).await;
    interpreter.shutdown().await;
    outcome?;

    let history = interpreter.into_history();
    let result = check_in_background(checker, &test, &history).await?;
    Ok(TestReport {
        test: Arc::try_unwrap(test).unwrap_or_else(|arc| (*arc).clone()),
        history,
        result,
    })
}

/// Checkers may fan out with rayon internally; keep them off the async
/// runtime's reactor threads.
pub(crate) async fn check_in_background(
    checker: Box<dyn Checker>,
    test: &Arc<Test>,
    history: &History,
) -> EngineResult<CheckResult> {
    let test = (**test).clone();
    let history = history.clone();
    let result = tokio::task::spawn_blocking(move || {
        checker.check(&test, &history, &CheckOpts::new())
    })
    .await
    .map_err(|e| EngineError::Worker(format!("checker task died: {}", e)))??;
    Ok(result)
}

/// Owns the live run: context, history, op indices, and worker handles.
pub(crate) struct Interpreter {
    pub(crate) test: Arc<Test>,
    pub(crate) clock: Clock,
    pub(crate) ctx: Context,
    history: History,
    op_index: i64,
    pub(crate) outstanding: usize,
    workers: Vec<WorkerHandle>,
    pub(crate) completions: mpsc::Receiver<Completion>,
}

impl Interpreter {
    /// Spawns one worker per client thread plus the nemesis.
    pub(crate) fn new(
        test: Arc<Test>,
        client: Arc<dyn ClientFactory>,
        nemesis: Box<dyn Nemesis>,
    ) -> Self {
        let concurrency = test.concurrency;
        let (tx, rx) = mpsc::channel(concurrency + 1);
        let mut workers: Vec<WorkerHandle> = (0..concurrency)
            .map(|i| spawn_client_worker(i, test.clone(), client.clone(), tx.clone()))
            .collect();
        workers.push(spawn_nemesis_worker(test.clone(), nemesis, tx));
        info!(
            test = %test.name,
            run_id = %test.run_id,
            concurrency,
            "interpreter started"
        );
        Interpreter {
            test,
            clock: Clock::start(),
            ctx: Context::new(concurrency),
            history: History::new(),
            op_index: 0,
            outstanding: 0,
            workers,
            completions: rx,
        }
    }

    /// The standard top loop; the FIFO driver runs its own variant.
    async fn drive(&mut self, mut gen: Box<dyn Generator>) -> EngineResult<()> {
        let test = self.test.clone();
        let mut poll = Duration::ZERO;
        loop {
            if let Some(completion) = self.next_completion(poll).await? {
                let op = self.handle_completion(completion);
                gen = gen.update(&test, &self.ctx, &op)?;
                poll = Duration::ZERO;
                continue;
            }

            let now = self.clock.now_nanos();
            let ctx_now = self.ctx.with_time(now);
            match gen.op(&test, &ctx_now)? {
                None => {
                    if self.outstanding == 0 {
                        debug!("generator exhausted, all workers idle");
                        return Ok(());
                    }
                    poll = MAX_PENDING_INTERVAL;
                }
                Some((Emit::Pending, _)) => {
                    poll = MAX_PENDING_INTERVAL;
                }
                Some((Emit::Op(op), gen_next)) => {
                    let due = op.time.unwrap_or(now);
                    if due > now {
                        // Not yet; retry with the unadvanced generator once
                        // the moment arrives or a completion lands.
                        poll = Duration::from_nanos((due - now) as u64);
                    } else {
                        match self.dispatch(op).await? {
                            Some(invocation) => {
                                gen = gen_next;
                                gen = gen.update(&test, &self.ctx, &invocation)?;
                                poll = Duration::ZERO;
                            }
                            None => poll = MAX_PENDING_INTERVAL,
                        }
                    }
                }
            }
        }
    }

    /// Completion-first polling. `Duration::ZERO` means a non-blocking
    /// check; anything else bounds the wait.
    pub(crate) async fn next_completion(
        &mut self,
        poll: Duration,
    ) -> EngineResult<Option<Completion>> {
        if poll.is_zero() {
            return Ok(self.completions.try_recv().ok());
        }
        match timeout(poll, self.completions.recv()).await {
            Ok(Some(completion)) => Ok(Some(completion)),
            Ok(None) => Err(EngineError::Worker(
                "completion channel closed mid-run".to_string(),
            )),
            Err(_elapsed) => Ok(None),
        }
    }

    /// Journals a completion, frees its thread, and retires the process on
    /// indeterminate results. Returns the journaled op for generator
    /// updates.
    pub(crate) fn handle_completion(&mut self, completion: Completion) -> Op {
        let Completion { thread, mut op } = completion;
        let now = self.clock.now_nanos();
        op.time = Some(now);
        if op.kind.journaled() {
            op.index = Some(self.op_index);
            self.op_index += 1;
            self.history.append(op.clone());
        }
        self.ctx = self.ctx.free_thread(now, thread);
        if op.kind == Kind::Info {
            self.ctx = self.ctx.with_next_process(thread);
        }
        self.outstanding = self.outstanding.saturating_sub(1);
        op
    }

    /// Assigns process/index/time and hands the op to its worker. Returns
    /// the journaled invocation, or `None` when no process is free to take
    /// an unassigned op.
    pub(crate) async fn dispatch(&mut self, mut op: Op) -> EngineResult<Option<Op>> {
        let process = match op.process.or_else(|| self.ctx.some_free_process()) {
            Some(p) => p,
            None => return Ok(None),
        };
        op.process = Some(process);
        let thread = process.thread(self.test.concurrency);
        let now = self.clock.now_nanos();
        op.time = Some(now);
        if op.kind.journaled() {
            op.index = Some(self.op_index);
            self.op_index += 1;
            self.history.append(op.clone());
        }

        let worker = self.worker_mut(thread);
        worker
            .inbox
            .send(WorkerMsg::Invoke(op.clone()))
            .await
            .map_err(|_| EngineError::Worker(format!("worker {:?} is gone", thread)))?;

        self.ctx = self.ctx.busy_thread(now, thread);
        self.outstanding += 1;
        Ok(Some(op))
    }

    fn worker_mut(&mut self, thread: Thread) -> &mut WorkerHandle {
        let slot = match thread {
            Thread::Client(i) => i,
            Thread::Nemesis => self.workers.len() - 1,
        };
        &mut self.workers[slot]
    }

    /// Asks every worker to exit, waits out the grace period, and cancels
    /// stragglers, each at most once.
    pub(crate) async fn shutdown(&mut self) {
        for worker in &self.workers {
            let _ = worker.inbox.try_send(WorkerMsg::Exit);
        }
        for worker in &mut self.workers {
            if timeout(SHUTDOWN_GRACE, &mut worker.join).await.is_err() {
                debug!(thread = ?worker.thread, "worker unresponsive, cancelling");
                worker.cancel_once();
                let _ = (&mut worker.join).await;
            }
        }
        debug!("all workers closed");
    }

    pub(crate) fn into_history(self) -> History {
        self.history
    }
}
