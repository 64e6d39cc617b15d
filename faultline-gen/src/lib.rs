//! The generator algebra: a pure, composable language for deciding which
//! operation each worker thread performs, and when.
//!
//! A [`Generator`] is an immutable value. Asking it for an op never commits
//! anything: [`Generator::op`] returns the emission together with the
//! *successor* generator, and the scheduler adopts the successor only when it
//! actually dispatches the op. When an emitted op is scheduled in the future,
//! the scheduler simply retries later with the original value. Completions
//! and invocations flow back in through [`Generator::update`], which is how
//! stateful combinators such as [`until_ok`] observe the world.
//!
//! Generators never sleep and never perform I/O. To defer, they emit an op
//! whose `time` lies in the future, or return [`Emit::Pending`] to say
//! "nothing right now, ask again".

pub mod error;
pub mod flow;
pub mod leaves;
pub mod scope;
pub mod select;
pub mod time;
pub mod wrap;

use faultline_core::{Context, Op, Test};

pub use error::GeneratorError;
pub use flow::{
    concat, cycle, filter, flip_flop, limit, map, phases, repeat, repeat_n, seq, synchronize,
    until_ok,
};
pub use leaves::{nothing, promise, FnGen, Nothing, Promise, PromiseHandle, Seq};
pub use select::{any, mix};
pub use scope::{clients, each_thread, nemesis, on_threads, reserve};
pub use time::{cycle_times, delay, log, sleep, stagger, time_limit};
pub use wrap::{validate, with_context};

/// What a generator has to offer right now.
#[derive(Debug, Clone, PartialEq)]
pub enum Emit {
    /// Nothing at the moment, but possibly later; the scheduler retries
    /// within a bounded poll interval.
    Pending,
    /// A (partially specified) operation. The scheduler fills in `index`;
    /// leaves fill in `process` and `time` from the context they see.
    Op(Op),
}

/// A generator emission paired with the successor generator state.
pub type Step = Option<(Emit, Box<dyn Generator>)>;

/// Result of asking a generator for an op. `Ok(None)` means permanently
/// exhausted: every later call on the states it returned must also yield
/// `None`.
pub type OpResult = Result<Step, GeneratorError>;

/// Result of feeding an event back into a generator.
pub type UpdateResult = Result<Box<dyn Generator>, GeneratorError>;

/// Object-safe clone support for boxed generators. Blanket-implemented for
/// every `Clone` generator; combinators rely on it to retain unchosen
/// children unchanged.
pub trait CloneGenerator {
    fn clone_box(&self) -> Box<dyn Generator>;
}

impl<G> CloneGenerator for G
where
    G: Generator + Clone + 'static,
{
    fn clone_box(&self) -> Box<dyn Generator> {
        Box::new(self.clone())
    }
}

impl Clone for Box<dyn Generator> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// The generator protocol. See the module docs for the contract.
pub trait Generator: std::fmt::Debug + Send + CloneGenerator {
    /// What would this generator do now? Pure: commits nothing.
    fn op(&self, test: &Test, ctx: &Context) -> OpResult;

    /// Observe an invocation or completion. Must not block; generators that
    /// do not care return themselves.
    fn update(self: Box<Self>, _test: &Test, _ctx: &Context, _event: &Op) -> UpdateResult;

    /// How many threads stand behind this generator in the given context.
    /// Soonest-op selection breaks ties in proportion to this, so a
    /// generator scoped to one thread is drawn one-in-n against a pool of
    /// n - 1, not half the time. Scoping combinators override it with their
    /// restricted pool size; wrappers delegate to their inner generator.
    fn weight(&self, ctx: &Context) -> usize {
        ctx.all_thread_count()
    }
}

// A boxed generator is itself a generator, so combinators accept both
// concrete values and type-erased ones.
impl Generator for Box<dyn Generator> {
    fn op(&self, test: &Test, ctx: &Context) -> OpResult {
        (**self).op(test, ctx)
    }

    fn update(self: Box<Self>, test: &Test, ctx: &Context, event: &Op) -> UpdateResult {
        (*self).update(test, ctx, event)
    }

    fn weight(&self, ctx: &Context) -> usize {
        (**self).weight(ctx)
    }
}

/// Boxes a concrete generator.
pub fn boxed(gen: impl Generator + 'static) -> Box<dyn Generator> {
    Box::new(gen)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared helpers for the combinator tests: a tiny synchronous harness
    //! that drives a generator to exhaustion the way the scheduler would.

    use super::*;
    use faultline_core::{Kind, Thread};

    pub fn test_fixture(concurrency: usize) -> (Test, Context) {
        (Test::new("gen-test", concurrency), Context::new(concurrency))
    }

    /// Drives `gen` with every thread free, marking each emitted op
    /// immediately complete, until exhaustion or `max` ops.
    pub fn collect_ops(gen: Box<dyn Generator>, max: usize) -> Vec<Op> {
        let (test, ctx) = test_fixture(4);
        collect_ops_in(gen, test, ctx, max)
    }

    pub fn collect_ops_in(
        mut gen: Box<dyn Generator>,
        test: Test,
        mut ctx: Context,
        max: usize,
    ) -> Vec<Op> {
        let mut ops = Vec::new();
        let mut pending_budget = 32;
        while ops.len() < max {
            match gen.op(&test, &ctx).expect("generator failed") {
                None => break,
                Some((Emit::Pending, _)) => {
                    pending_budget -= 1;
                    if pending_budget == 0 {
                        break;
                    }
                    // Pretend time passes.
                    ctx = ctx.with_time(ctx.time() + 1_000_000);
                }
                Some((Emit::Op(op), gen_prime)) => {
                    gen = gen_prime;
                    // Advance the clock to the op's scheduled moment.
                    if let Some(t) = op.time {
                        if t > ctx.time() {
                            ctx = ctx.with_time(t);
                        }
                    }
                    let mut invoked = op.clone();
                    invoked.time = Some(ctx.time());
                    gen = gen
                        .update(&test, &ctx, &invoked)
                        .expect("update failed");
                    // Completions come straight back: every op succeeds.
                    if invoked.kind == Kind::Invoke {
                        let completion = invoked.complete(Kind::Ok);
                        gen = gen
                            .update(&test, &ctx, &completion)
                            .expect("update failed");
                    }
                    ops.push(op);
                }
            }
        }
        ops
    }

    /// A context in which only the given client threads are free.
    pub fn ctx_with_free(concurrency: usize, free: &[usize]) -> Context {
        let mut ctx = Context::new(concurrency);
        for i in 0..concurrency {
            if !free.contains(&i) {
                ctx = ctx.busy_thread(0, Thread::Client(i));
            }
        }
        ctx = ctx.busy_thread(0, Thread::Nemesis);
        ctx
    }
}
