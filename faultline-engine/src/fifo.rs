//! The external test-composer driver.
//!
//! An out-of-process controller drops FIFO files into a watched directory:
//! `op-<N>` grants the interpreter one operation from the main generator,
//! and the op's completion is written back into that same FIFO as JSON.
//! `check` ends the main phase: a shared atomic phase flag flips, the main
//! branch of the generator runs dry, the final generator drains, checkers
//! run, and the literal string `checked` is written back.

use crate::interpreter::{check_in_background, Interpreter, TestPlan, TestReport, MAX_PENDING_INTERVAL};
use crate::{EngineError, EngineResult};
use faultline_core::{Context, Op, Test, Thread};
use faultline_gen::{seq, validate, with_context, Emit, Generator, OpResult, UpdateResult};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

const PHASE_MAIN: u8 = 0;
const PHASE_FINAL: u8 = 1;

/// Configuration for the FIFO-driven loop.
pub struct FifoOptions {
    /// Watched directory; created if absent and emptied at startup.
    pub dir: PathBuf,
    /// Generator for the final phase, run after `check` arrives.
    pub final_generator: Box<dyn Generator>,
}

/// Forwards its generator during the main phase; once the shared flag flips
/// to the final phase it reports exhaustion, letting the surrounding
/// sequence advance.
#[derive(Debug, Clone)]
struct PhaseFilter {
    phase: Arc<AtomicU8>,
    gen: Box<dyn Generator>,
}

impl Generator for PhaseFilter {
    fn op(&self, test: &Test, ctx: &Context) -> OpResult {
        if self.phase.load(Ordering::SeqCst) == PHASE_FINAL {
            return Ok(None);
        }
        Ok(self.gen.op(test, ctx)?.map(|(emit, gen)| {
            (
                emit,
                Box::new(PhaseFilter {
                    phase: self.phase.clone(),
                    gen,
                }) as Box<dyn Generator>,
            )
        }))
    }

    fn update(self: Box<Self>, test: &Test, ctx: &Context, event: &Op) -> UpdateResult {
        let mut this = self;
        this.gen = this.gen.update(test, ctx, event)?;
        Ok(this)
    }

    fn weight(&self, ctx: &Context) -> usize {
        self.gen.weight(ctx)
    }
}

/// What the watcher saw.
enum FifoEvent {
    /// `op-<N>`: permission to run one main-phase op, answered through the
    /// named file.
    OpToken(PathBuf),
    /// `check`: end the main phase.
    Check(PathBuf),
}

fn classify(path: &Path) -> EngineResult<FifoEvent> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| EngineError::Fifo(format!("unreadable fifo name: {:?}", path)))?;
    if name == "check" {
        return Ok(FifoEvent::Check(path.to_path_buf()));
    }
    if let Some(n) = name.strip_prefix("op-") {
        if !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(FifoEvent::OpToken(path.to_path_buf()));
        }
    }
    Err(EngineError::Fifo(format!("unexpected fifo file: {}", name)))
}

/// Creates the directory if needed and removes any stale entries.
fn prepare_dir(dir: &Path) -> EngineResult<()> {
    std::fs::create_dir_all(dir)?;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            return Err(EngineError::Fifo(format!(
                "unexpected directory in fifo dir: {:?}",
                entry.path()
            )));
        }
        std::fs::remove_file(entry.path())?;
    }
    Ok(())
}

/// Writes a reply into a FIFO and closes it. Opening a pipe for writing
/// can block until the composer reads, so this happens off the reactor.
async fn write_reply(path: PathBuf, contents: String) -> EngineResult<()> {
    tokio::task::spawn_blocking(move || std::fs::write(&path, contents))
        .await
        .map_err(|e| EngineError::Fifo(format!("reply writer died: {}", e)))??;
    Ok(())
}

/// Runs a plan under external drive. The plan's generator serves the main
/// phase, one op per `op-<N>` token; `options.final_generator` takes over
/// after `check`.
pub async fn run_fifo(plan: TestPlan, options: FifoOptions) -> EngineResult<TestReport> {
    let TestPlan {
        test,
        generator,
        client,
        nemesis,
        checker,
    } = plan;
    prepare_dir(&options.dir)?;

    let phase = Arc::new(AtomicU8::new(PHASE_MAIN));
    let root: Box<dyn Generator> = Box::new(with_context(validate(seq(vec![
        Box::new(PhaseFilter {
            phase: phase.clone(),
            gen: generator,
        }) as Box<dyn Generator>,
        options.final_generator,
    ]))));

    // Bridge watcher callbacks onto a channel the async loop can drain.
    let (watch_tx, mut watch_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher = RecommendedWatcher::new(
        move |event| {
            let _ = watch_tx.send(event);
        },
        Config::default(),
    )?;
    watcher.watch(&options.dir, RecursiveMode::NonRecursive)?;
    info!(dir = %options.dir.display(), "fifo driver watching");

    let test = Arc::new(test);
    let mut interpreter = Interpreter::new(test.clone(), client, nemesis);
    let outcome = drive_fifo(
        &mut interpreter,
        &test,
        root,
        &phase,
        &mut watch_rx,
    )
    .await;
    interpreter.shutdown().await;
    let check_fifo = outcome?;

    let history = interpreter.into_history();
    let result = check_in_background(checker, &test, &history).await?;
    if let Some(path) = check_fifo {
        write_reply(path, "checked".to_string()).await?;
    }
    Ok(TestReport {
        test: Arc::try_unwrap(test).unwrap_or_else(|arc| (*arc).clone()),
        history,
        result,
    })
}

/// The FIFO variant of the main loop. Returns the `check` FIFO path once
/// the generator is dry, so the caller can acknowledge after checking.
async fn drive_fifo(
    interpreter: &mut Interpreter,
    test: &Arc<Test>,
    mut gen: Box<dyn Generator>,
    phase: &Arc<AtomicU8>,
    watch_rx: &mut mpsc::UnboundedReceiver<notify::Result<Event>>,
) -> EngineResult<Option<PathBuf>> {
    // Granted-but-unused op tokens, in arrival order, and the FIFO each
    // in-flight op answers to.
    let mut tokens: VecDeque<PathBuf> = VecDeque::new();
    let mut in_flight: HashMap<Thread, PathBuf> = HashMap::new();
    let mut check_fifo: Option<PathBuf> = None;
    let mut poll = Duration::ZERO;

    loop {
        // Watcher events first: they can only grant work or end the phase.
        while let Ok(event) = watch_rx.try_recv() {
            let event = event?;
            if event.need_rescan() {
                return Err(EngineError::Fifo(
                    "watch queue overflowed; events were lost".to_string(),
                ));
            }
            if !matches!(event.kind, EventKind::Create(_)) {
                // Our own replies generate modify events; only creations
                // carry protocol meaning.
                continue;
            }
            for path in &event.paths {
                match classify(path)? {
                    FifoEvent::OpToken(path) => {
                        debug!(fifo = %path.display(), "op token granted");
                        tokens.push_back(path);
                    }
                    FifoEvent::Check(path) => {
                        info!("check requested; entering final phase");
                        phase.store(PHASE_FINAL, Ordering::SeqCst);
                        check_fifo = Some(path);
                    }
                }
            }
        }

        if let Some(completion) = interpreter.next_completion(poll).await? {
            let thread = completion.thread;
            let op = interpreter.handle_completion(completion);
            gen = gen.update(test, &interpreter.ctx, &op)?;
            if let Some(path) = in_flight.remove(&thread) {
                let body = serde_json::to_string(&op)
                    .map_err(|e| EngineError::Fifo(format!("unprintable op: {}", e)))?;
                write_reply(path, body).await?;
            }
            poll = Duration::ZERO;
            continue;
        }

        // In the main phase every op costs a token; the final phase runs
        // free. With no token in hand there is nothing to do but wait for
        // completions or the composer.
        if phase.load(Ordering::SeqCst) == PHASE_MAIN && tokens.is_empty() {
            poll = MAX_PENDING_INTERVAL;
            continue;
        }

        let now = interpreter.clock.now_nanos();
        let ctx_now = interpreter.ctx.with_time(now);
        match gen.op(test, &ctx_now)? {
            None => {
                if interpreter.outstanding == 0 {
                    return Ok(check_fifo);
                }
                poll = MAX_PENDING_INTERVAL;
            }
            Some((Emit::Pending, _)) => {
                poll = MAX_PENDING_INTERVAL;
            }
            Some((Emit::Op(op), gen_next)) => {
                let due = op.time.unwrap_or(now);
                if due > now {
                    poll = Duration::from_nanos((due - now) as u64);
                } else {
                    match interpreter.dispatch(op).await? {
                        Some(invocation) => {
                            if phase.load(Ordering::SeqCst) == PHASE_MAIN {
                                if let (Some(process), Some(path)) =
                                    (invocation.process, tokens.pop_front())
                                {
                                    in_flight
                                        .insert(process.thread(test.concurrency), path);
                                }
                            }
                            gen = gen_next;
                            gen = gen.update(test, &interpreter.ctx, &invocation)?;
                            poll = Duration::ZERO;
                        }
                        None => poll = MAX_PENDING_INTERVAL,
                    }
                }
            }
        }
    }
}
