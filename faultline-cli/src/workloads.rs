//! Demo workloads against an in-memory store with injectable faults.
//!
//! These exist so the harness can be exercised end to end without a real
//! database: the store misbehaves on demand (indeterminate results, a
//! nemesis-controlled partition, and an optional write-losing bug) so every
//! checker verdict is reachable.

use async_trait::async_trait;
use clap::ValueEnum;
use faultline_checker::{
    compose, counter as counter_checker, set as set_checker, set_full, stats,
    total_queue, unique_ids, Checker, SetFullOptions,
};
use faultline_core::{Kind, Op, Test};
use faultline_engine::{Client, ClientFactory, Nemesis, TestPlan};
use faultline_gen::{
    boxed, clients, delay, flip_flop, limit, mix, nemesis as on_nemesis, phases, repeat,
    stagger, time_limit, FnGen, Generator,
};
use parking_lot::Mutex;
use rand::Rng;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

/// The demo workloads the CLI can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Workload {
    /// Grow-only set: staggered adds, one final read.
    Set,
    /// A single register: writes, reads, and compare-and-set.
    Register,
    /// Increment-only counter with interleaved reads.
    Counter,
    /// FIFO queue with a final drain.
    Queue,
    /// Unique id generation.
    UniqueIds,
}

/// Effective settings for one run, after flag/config merging.
#[derive(Debug, Clone)]
pub struct Settings {
    pub concurrency: usize,
    pub time_limit: f64,
    pub rate: f64,
    pub nemesis_interval: f64,
    pub fault_probability: f64,
    pub buggy: bool,
    pub nodes: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            concurrency: 5,
            time_limit: 10.0,
            rate: 20.0,
            nemesis_interval: 2.0,
            fault_probability: 0.05,
            buggy: false,
            nodes: vec![],
        }
    }
}

/// Shared in-memory state behind every demo client.
struct Store {
    set: Mutex<Vec<i64>>,
    queue: Mutex<VecDeque<i64>>,
    counter: Mutex<i64>,
    register: Mutex<i64>,
    next_id: AtomicI64,
    partitioned: AtomicBool,
    fault_probability: f64,
    buggy: bool,
}

impl Store {
    fn new(settings: &Settings) -> Self {
        Store {
            set: Mutex::new(Vec::new()),
            queue: Mutex::new(VecDeque::new()),
            counter: Mutex::new(0),
            register: Mutex::new(0),
            next_id: AtomicI64::new(0),
            partitioned: AtomicBool::new(false),
            fault_probability: settings.fault_probability,
            buggy: settings.buggy,
        }
    }

    /// The buggy store silently drops roughly one write in ten.
    fn drops_write(&self) -> bool {
        self.buggy && rand::thread_rng().gen_bool(0.1)
    }
}

struct StoreClient {
    store: Arc<Store>,
}

#[async_trait]
impl Client for StoreClient {
    async fn setup(&mut self, _test: &Test) -> anyhow::Result<()> {
        Ok(())
    }

    async fn invoke(&mut self, _test: &Test, op: Op) -> anyhow::Result<Op> {
        if self.store.partitioned.load(Ordering::SeqCst) {
            anyhow::bail!("partitioned: request timed out");
        }
        // An indeterminate fault: the effect may or may not land, and the
        // client only sees a dropped connection. Reads and drains stay
        // reliable so the observation phases of a workload can conclude.
        let fallible = !matches!(op.f.as_deref(), Some("read" | "read-register" | "drain"));
        if fallible && rand::thread_rng().gen_bool(self.store.fault_probability) {
            let applied = rand::thread_rng().gen_bool(0.5);
            if applied {
                self.apply(&op);
            }
            anyhow::bail!("connection reset");
        }
        Ok(self.apply(&op))
    }

    async fn teardown(&mut self, _test: &Test) -> anyhow::Result<()> {
        Ok(())
    }

    async fn close(&mut self, _test: &Test) {}
}

impl StoreClient {
    fn apply(&self, op: &Op) -> Op {
        let store = &self.store;
        let int_value = op.value.as_ref().and_then(Value::as_i64);
        match op.f.as_deref() {
            Some("add") => {
                if let Some(v) = int_value {
                    if !store.drops_write() {
                        // Set adds and counter adds share a family name;
                        // both stores grow, and only one checker looks.
                        store.set.lock().push(v);
                        *store.counter.lock() += v;
                    }
                }
                op.complete(Kind::Ok)
            }
            Some("read") => {
                let mut elements = store.set.lock().clone();
                elements.sort_unstable();
                elements.dedup();
                let counter = *store.counter.lock();
                // The set checker wants the element list; the counter
                // checker wants the sum. Reads carry whichever matches the
                // invoke's request, defaulting to the set.
                if op.ext.get("object").and_then(Value::as_str) == Some("counter") {
                    op.complete(Kind::Ok).with_value(counter)
                } else {
                    op.complete(Kind::Ok).with_value(json!(elements))
                }
            }
            Some("enqueue") => {
                if let Some(v) = int_value {
                    if !store.drops_write() {
                        store.queue.lock().push_back(v);
                    }
                }
                op.complete(Kind::Ok)
            }
            Some("dequeue") => match store.queue.lock().pop_front() {
                Some(v) => op.complete(Kind::Ok).with_value(v),
                None => op.complete(Kind::Fail).with_error("empty"),
            },
            Some("drain") => {
                let drained: Vec<i64> = store.queue.lock().drain(..).collect();
                op.complete(Kind::Ok).with_value(json!(drained))
            }
            Some("generate") => {
                let id = if store.buggy && rand::thread_rng().gen_bool(0.05) {
                    store.next_id.load(Ordering::SeqCst)
                } else {
                    store.next_id.fetch_add(1, Ordering::SeqCst) + 1
                };
                op.complete(Kind::Ok).with_value(id)
            }
            Some("write") => {
                if let Some(v) = int_value {
                    *store.register.lock() = v;
                }
                op.complete(Kind::Ok)
            }
            Some("read-register") => {
                let v = *store.register.lock();
                op.complete(Kind::Ok).with_value(v)
            }
            Some("cas") => {
                if let Some(Value::Array(pair)) = &op.value {
                    let (expected, new) = (
                        pair.first().and_then(Value::as_i64),
                        pair.get(1).and_then(Value::as_i64),
                    );
                    if let (Some(expected), Some(new)) = (expected, new) {
                        let mut register = store.register.lock();
                        if *register == expected {
                            *register = new;
                            return op.complete(Kind::Ok);
                        }
                    }
                }
                op.complete(Kind::Fail).with_error("precondition")
            }
            _ => op
                .complete(Kind::Fail)
                .with_error(format!("unknown op {:?}", op.f)),
        }
    }
}

struct StoreFactory {
    store: Arc<Store>,
}

#[async_trait]
impl ClientFactory for StoreFactory {
    async fn open(&self, _test: &Test, _node: Option<&str>) -> anyhow::Result<Box<dyn Client>> {
        Ok(Box::new(StoreClient {
            store: self.store.clone(),
        }))
    }
}

/// Toggles the store's partition flag on `partition-start` /
/// `partition-stop`.
struct StoreNemesis {
    store: Arc<Store>,
}

#[async_trait]
impl Nemesis for StoreNemesis {
    async fn setup(&mut self, _test: &Test) -> anyhow::Result<()> {
        Ok(())
    }

    async fn invoke(&mut self, _test: &Test, op: Op) -> anyhow::Result<Op> {
        match op.f.as_deref() {
            Some("partition-start") => {
                self.store.partitioned.store(true, Ordering::SeqCst);
                Ok(op.complete(Kind::Info).with_value("cut"))
            }
            Some("partition-stop") => {
                self.store.partitioned.store(false, Ordering::SeqCst);
                Ok(op.complete(Kind::Info).with_value("healed"))
            }
            _ => Ok(op.complete(Kind::Info)),
        }
    }

    async fn teardown(&mut self, _test: &Test) -> anyhow::Result<()> {
        self.store.partitioned.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Endless `add` invocations carrying 0, 1, 2, ...
fn numbered(f: &'static str) -> FnGen {
    let next = Arc::new(AtomicI64::new(0));
    FnGen::new(move |_, _| {
        let n = next.fetch_add(1, Ordering::SeqCst);
        Some(boxed(Op::invoke_v(f, n)))
    })
}

/// Counter adds with a random amount.
fn random_adds() -> FnGen {
    FnGen::new(|_, _| {
        let amount: i64 = rand::thread_rng().gen_range(1..=5);
        Some(boxed(Op::invoke_v("add", amount)))
    })
}

fn counter_read() -> Op {
    let mut op = Op::invoke("read");
    op.ext.insert("object".into(), Value::from("counter"));
    op
}

fn register_op() -> FnGen {
    FnGen::new(|_, _| {
        let mut rng = rand::thread_rng();
        let op = match rng.gen_range(0..3) {
            0 => Op::invoke_v("write", rng.gen_range(0..8)),
            1 => Op::invoke("read-register"),
            _ => Op::invoke_v("cas", json!([rng.gen_range(0..8), rng.gen_range(0..8)])),
        };
        Some(boxed(op))
    })
}

/// The periodic partition toggle, alternating start and stop so the store
/// always heals eventually.
fn partition_schedule(interval: f64) -> Box<dyn Generator> {
    boxed(on_nemesis(delay(
        interval,
        flip_flop(
            repeat(Op::invoke("partition-start")),
            repeat(Op::invoke("partition-stop")),
        ),
    )))
}

/// One nemesis op forcing the partition closed, for phase boundaries.
fn heal() -> Box<dyn Generator> {
    boxed(on_nemesis(limit(1, repeat(Op::invoke("partition-stop")))))
}

/// The per-op traffic, the observation tail run after the main phase, and
/// the checker for one workload.
fn workload_parts(workload: Workload) -> (Box<dyn Generator>, Box<dyn Generator>, Box<dyn Checker>) {
    match workload {
        Workload::Set => (
            boxed(numbered("add")),
            boxed(clients(limit(1, repeat(Op::invoke("read"))))),
            compose(vec![
                ("stats".into(), stats()),
                ("set".into(), set_checker()),
                (
                    "set_full".into(),
                    set_full(SetFullOptions {
                        linearizable: false,
                    }),
                ),
            ]),
        ),
        Workload::Register => (
            boxed(register_op()),
            boxed(faultline_gen::nothing()),
            compose(vec![("stats".into(), stats())]),
        ),
        Workload::Counter => (
            boxed(mix(vec![
                boxed(random_adds()) as Box<dyn Generator>,
                boxed(repeat(counter_read())),
            ])),
            boxed(faultline_gen::nothing()),
            compose(vec![
                ("stats".into(), stats()),
                ("counter".into(), counter_checker()),
            ]),
        ),
        Workload::Queue => (
            boxed(mix(vec![
                boxed(numbered("enqueue")) as Box<dyn Generator>,
                boxed(repeat(Op::invoke("dequeue"))),
            ])),
            boxed(clients(limit(1, repeat(Op::invoke("drain"))))),
            compose(vec![
                ("stats".into(), stats()),
                ("queue".into(), total_queue()),
            ]),
        ),
        Workload::UniqueIds => (
            boxed(repeat(Op::invoke("generate"))),
            boxed(faultline_gen::nothing()),
            compose(vec![
                ("stats".into(), stats()),
                ("unique_ids".into(), unique_ids()),
            ]),
        ),
    }
}

fn base_plan(
    workload: Workload,
    settings: &Settings,
    generator: Box<dyn Generator>,
    checker: Box<dyn Checker>,
    store: Arc<Store>,
) -> TestPlan {
    let name = format!("{:?}", workload).to_lowercase();
    let test = Test::new(name, settings.concurrency)
        .with_nodes(settings.nodes.clone())
        .with_param("rate", json!(settings.rate))
        .with_param("time_limit", json!(settings.time_limit));
    TestPlan {
        test,
        generator,
        client: Arc::new(StoreFactory {
            store: store.clone(),
        }),
        nemesis: Box::new(StoreNemesis { store }),
        checker,
    }
}

/// Interleaves the nemesis schedule with client traffic.
fn with_schedule(traffic: Box<dyn Generator>, interval: f64) -> Box<dyn Generator> {
    if interval > 0.0 {
        boxed(faultline_gen::any(vec![
            traffic,
            partition_schedule(interval),
        ]))
    } else {
        traffic
    }
}

/// Builds the full plan for a workload: a time-limited, staggered main
/// phase, then a heal and the observation tail behind an idle barrier.
pub fn plan(workload: Workload, settings: &Settings) -> TestPlan {
    let store = Arc::new(Store::new(settings));
    let dt = 1.0 / settings.rate.max(0.001);
    let (ops, tail, checker) = workload_parts(workload);

    let traffic = boxed(clients(stagger(dt, ops)));
    let main = boxed(time_limit(
        settings.time_limit,
        with_schedule(traffic, settings.nemesis_interval),
    ));
    let finale = boxed(faultline_gen::seq(vec![heal(), tail]));
    let generator = boxed(phases(vec![main, finale]));

    base_plan(workload, settings, generator, checker, store)
}

/// Builds a plan for external drive: the composer paces the main phase, so
/// it carries no time limit or stagger; the returned final generator heals
/// and observes once `check` arrives.
pub fn fifo_plan(workload: Workload, settings: &Settings) -> (TestPlan, Box<dyn Generator>) {
    let store = Arc::new(Store::new(settings));
    let (ops, tail, checker) = workload_parts(workload);

    let main = with_schedule(boxed(clients(ops)), settings.nemesis_interval);
    let finale = boxed(phases(vec![
        boxed(faultline_gen::seq(vec![heal(), tail])) as Box<dyn Generator>,
    ]));

    (
        base_plan(workload, settings, main, checker, store),
        finale,
    )
}
