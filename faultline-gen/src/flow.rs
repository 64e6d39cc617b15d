//! Flow-control combinators: bounding, repetition, phasing, and
//! event-driven switching.

use crate::leaves::Seq;
use crate::{boxed, Emit, Generator, OpResult, UpdateResult};
use faultline_core::{Context, Kind, Op, Test};
use std::sync::Arc;

/// Forwards at most `remaining` ops from the wrapped generator.
#[derive(Debug, Clone)]
pub struct Limit {
    remaining: usize,
    gen: Box<dyn Generator>,
}

/// Forwards at most `n` ops from `gen`.
pub fn limit(n: usize, gen: impl Generator + 'static) -> Limit {
    Limit {
        remaining: n,
        gen: boxed(gen),
    }
}

impl Generator for Limit {
    fn op(&self, test: &Test, ctx: &Context) -> OpResult {
        if self.remaining == 0 {
            return Ok(None);
        }
        Ok(self.gen.op(test, ctx)?.map(|(emit, gen)| {
            let remaining = match emit {
                Emit::Op(_) => self.remaining - 1,
                Emit::Pending => self.remaining,
            };
            (emit, boxed(Limit { remaining, gen }))
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

/// Replays the head op of the wrapped generator over and over. The inner
/// generator is never advanced, so `repeat(some_op)` is the idiomatic
/// endless stream of one operation.
#[derive(Debug, Clone)]
pub struct Repeat {
    /// `None` = forever.
    remaining: Option<usize>,
    gen: Box<dyn Generator>,
}

/// Replays `gen`'s head op forever.
pub fn repeat(gen: impl Generator + 'static) -> Repeat {
    Repeat {
        remaining: None,
        gen: boxed(gen),
    }
}

/// Replays `gen`'s head op `n` times.
pub fn repeat_n(n: usize, gen: impl Generator + 'static) -> Repeat {
    Repeat {
        remaining: Some(n),
        gen: boxed(gen),
    }
}

impl Generator for Repeat {
    fn op(&self, test: &Test, ctx: &Context) -> OpResult {
        if self.remaining == Some(0) {
            return Ok(None);
        }
        Ok(self.gen.op(test, ctx)?.map(|(emit, _advanced)| {
            let remaining = match emit {
                Emit::Op(_) => self.remaining.map(|r| r - 1),
                Emit::Pending => self.remaining,
            };
            (
                emit,
                boxed(Repeat {
                    remaining,
                    gen: self.gen.clone(),
                }),
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

/// Restarts the wrapped generator from its original state whenever the
/// current copy is exhausted. Holding original and current separately keeps
/// the value acyclic.
#[derive(Debug, Clone)]
pub struct Cycle {
    original: Box<dyn Generator>,
    current: Box<dyn Generator>,
}

/// Endlessly restarts `gen` on exhaustion.
pub fn cycle(gen: impl Generator + Clone + 'static) -> Cycle {
    Cycle {
        original: boxed(gen.clone()),
        current: boxed(gen),
    }
}

impl Generator for Cycle {
    fn op(&self, test: &Test, ctx: &Context) -> OpResult {
        if let Some((emit, current)) = self.current.op(test, ctx)? {
            return Ok(Some((
                emit,
                boxed(Cycle {
                    original: self.original.clone(),
                    current,
                }),
            )));
        }
        // Exhausted: restart from the original. If even a fresh copy is
        // exhausted, so is the cycle.
        Ok(self.original.op(test, ctx)?.map(|(emit, current)| {
            (
                emit,
                boxed(Cycle {
                    original: self.original.clone(),
                    current,
                }) as Box<dyn Generator>,
            )
        }))
    }

    fn update(self: Box<Self>, test: &Test, ctx: &Context, event: &Op) -> UpdateResult {
        let mut this = self;
        this.current = this.current.update(test, ctx, event)?;
        Ok(this)
    }

    fn weight(&self, ctx: &Context) -> usize {
        self.current.weight(ctx)
    }
}

/// Holds the wrapped generator back until every worker in the current view
/// is free, then steps aside.
#[derive(Debug, Clone)]
pub struct Synchronize {
    gen: Box<dyn Generator>,
}

/// Waits for all workers to go idle before forwarding `gen`.
pub fn synchronize(gen: impl Generator + 'static) -> Synchronize {
    Synchronize { gen: boxed(gen) }
}

impl Generator for Synchronize {
    fn op(&self, test: &Test, ctx: &Context) -> OpResult {
        if ctx.all_free() {
            // Barrier passed; the successor sheds the wrapper entirely.
            self.gen.op(test, ctx)
        } else {
            Ok(Some((Emit::Pending, boxed(self.clone()))))
        }
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

/// Runs each generator as a phase: a phase begins only once every worker is
/// idle, and the next starts after the previous is exhausted.
pub fn phases(gens: impl IntoIterator<Item = Box<dyn Generator>>) -> Seq {
    Seq::new(
        gens.into_iter()
            .map(|g| boxed(Synchronize { gen: g }) as Box<dyn Generator>),
    )
}

/// An ordered sequence of generators.
pub fn seq(gens: impl IntoIterator<Item = Box<dyn Generator>>) -> Seq {
    Seq::new(gens)
}

/// Alias for [`seq`]: concatenates generators end to end.
pub fn concat(gens: impl IntoIterator<Item = Box<dyn Generator>>) -> Seq {
    Seq::new(gens)
}

/// Forwards ops until any one of them completes `ok`, observed via
/// `update`; from then on the generator is exhausted.
#[derive(Debug, Clone)]
pub struct UntilOk {
    done: bool,
    gen: Box<dyn Generator>,
}

/// Stops emitting as soon as any op completes ok.
pub fn until_ok(gen: impl Generator + 'static) -> UntilOk {
    UntilOk {
        done: false,
        gen: boxed(gen),
    }
}

impl Generator for UntilOk {
    fn op(&self, test: &Test, ctx: &Context) -> OpResult {
        if self.done {
            return Ok(None);
        }
        Ok(self.gen.op(test, ctx)?.map(|(emit, gen)| {
            (
                emit,
                boxed(UntilOk {
                    done: false,
                    gen,
                }) as Box<dyn Generator>,
            )
        }))
    }

    fn update(self: Box<Self>, test: &Test, ctx: &Context, event: &Op) -> UpdateResult {
        let mut this = self;
        if event.kind == Kind::Ok {
            this.done = true;
        }
        this.gen = this.gen.update(test, ctx, event)?;
        Ok(this)
    }

    fn weight(&self, ctx: &Context) -> usize {
        self.gen.weight(ctx)
    }
}

/// Alternates ops between two generators, one for one. Exhausted as soon as
/// either side is.
#[derive(Debug, Clone)]
pub struct FlipFlop {
    next: usize,
    gens: [Box<dyn Generator>; 2],
}

/// Alternates between `a` and `b`, starting with `a`.
pub fn flip_flop(a: impl Generator + 'static, b: impl Generator + 'static) -> FlipFlop {
    FlipFlop {
        next: 0,
        gens: [boxed(a), boxed(b)],
    }
}

impl Generator for FlipFlop {
    fn op(&self, test: &Test, ctx: &Context) -> OpResult {
        match self.gens[self.next].op(test, ctx)? {
            None => Ok(None),
            Some((emit, gen)) => {
                let mut gens = self.gens.clone();
                gens[self.next] = gen;
                let next = match emit {
                    Emit::Op(_) => 1 - self.next,
                    Emit::Pending => self.next,
                };
                Ok(Some((emit, boxed(FlipFlop { next, gens }))))
            }
        }
    }

    fn update(self: Box<Self>, test: &Test, ctx: &Context, event: &Op) -> UpdateResult {
        let mut this = self;
        for gen in &mut this.gens {
            let owned = std::mem::replace(gen, boxed(crate::leaves::Nothing));
            *gen = owned.update(test, ctx, event)?;
        }
        Ok(this)
    }
}

/// Transforms every op emitted by the wrapped generator.
#[derive(Clone)]
pub struct Map {
    f: Arc<dyn Fn(Op) -> Op + Send + Sync>,
    gen: Box<dyn Generator>,
}

/// Applies `f` to each op `gen` emits.
pub fn map(f: impl Fn(Op) -> Op + Send + Sync + 'static, gen: impl Generator + 'static) -> Map {
    Map {
        f: Arc::new(f),
        gen: boxed(gen),
    }
}

impl std::fmt::Debug for Map {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Map").field("gen", &self.gen).finish_non_exhaustive()
    }
}

impl Generator for Map {
    fn op(&self, test: &Test, ctx: &Context) -> OpResult {
        Ok(self.gen.op(test, ctx)?.map(|(emit, gen)| {
            let emit = match emit {
                Emit::Op(op) => Emit::Op((self.f)(op)),
                Emit::Pending => Emit::Pending,
            };
            (
                emit,
                boxed(Map {
                    f: self.f.clone(),
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

/// Drops emitted ops failing a predicate. Skipped ops advance the wrapped
/// generator exactly as if they had been consumed.
#[derive(Clone)]
pub struct Filter {
    pred: Arc<dyn Fn(&Op) -> bool + Send + Sync>,
    gen: Box<dyn Generator>,
}

/// Keeps only ops satisfying `pred`.
pub fn filter(
    pred: impl Fn(&Op) -> bool + Send + Sync + 'static,
    gen: impl Generator + 'static,
) -> Filter {
    Filter {
        pred: Arc::new(pred),
        gen: boxed(gen),
    }
}

impl std::fmt::Debug for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filter")
            .field("gen", &self.gen)
            .finish_non_exhaustive()
    }
}

impl Generator for Filter {
    fn op(&self, test: &Test, ctx: &Context) -> OpResult {
        let mut gen = self.gen.clone();
        loop {
            match gen.op(test, ctx)? {
                None => return Ok(None),
                Some((Emit::Pending, gen_prime)) => {
                    return Ok(Some((
                        Emit::Pending,
                        boxed(Filter {
                            pred: self.pred.clone(),
                            gen: gen_prime,
                        }),
                    )));
                }
                Some((Emit::Op(op), gen_prime)) => {
                    if (self.pred)(&op) {
                        return Ok(Some((
                            Emit::Op(op),
                            boxed(Filter {
                                pred: self.pred.clone(),
                                gen: gen_prime,
                            }),
                        )));
                    }
                    gen = gen_prime;
                }
            }
        }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{collect_ops, collect_ops_in, test_fixture};
    use faultline_core::Thread;
    use serde_json::Value;

    #[test]
    fn test_limit_caps_repeat() {
        let ops = collect_ops(boxed(limit(3, repeat(Op::invoke_v("inc", 1)))), 100);
        assert_eq!(ops.len(), 3);
        assert!(ops.iter().all(|o| o.f_is("inc")));
    }

    #[test]
    fn test_limit_zero_is_exhausted() {
        assert!(collect_ops(boxed(limit(0, repeat(Op::invoke("r")))), 10).is_empty());
    }

    #[test]
    fn test_repeat_n() {
        let ops = collect_ops(boxed(repeat_n(5, Op::invoke("r"))), 100);
        assert_eq!(ops.len(), 5);
    }

    #[test]
    fn test_repeat_replays_head() {
        // A sequence would normally move on after `a`; repeat pins it.
        let inner = seq(vec![
            boxed(Op::invoke("a")) as Box<dyn Generator>,
            boxed(Op::invoke("b")),
        ]);
        let ops = collect_ops(boxed(repeat_n(3, inner)), 100);
        assert_eq!(
            ops.iter().map(|o| o.f.clone().unwrap()).collect::<Vec<_>>(),
            vec!["a", "a", "a"]
        );
    }

    #[test]
    fn test_cycle_restarts() {
        let inner = limit(2, repeat(Op::invoke("r")));
        let ops = collect_ops(boxed(limit(7, cycle(inner))), 100);
        assert_eq!(ops.len(), 7);
    }

    #[test]
    fn test_until_ok_stops_after_success() {
        let ops = collect_ops(boxed(until_ok(repeat(Op::invoke("claim")))), 100);
        // The harness completes every op ok, so exactly one op is emitted
        // before the generator shuts off.
        assert_eq!(ops.len(), 1);
    }

    #[test]
    fn test_flip_flop_alternates() {
        let gen = limit(
            6,
            flip_flop(repeat(Op::invoke("a")), repeat(Op::invoke("b"))),
        );
        let ops = collect_ops(boxed(gen), 100);
        assert_eq!(
            ops.iter().map(|o| o.f.clone().unwrap()).collect::<Vec<_>>(),
            vec!["a", "b", "a", "b", "a", "b"]
        );
    }

    #[test]
    fn test_map_transforms_ops() {
        let gen = map(
            |op| op.with_value(42),
            limit(2, repeat(Op::invoke_v("w", 0))),
        );
        let ops = collect_ops(boxed(gen), 100);
        assert_eq!(ops.len(), 2);
        assert!(ops.iter().all(|o| o.value == Some(Value::from(42))));
    }

    #[test]
    fn test_filter_drops_ops() {
        let mut n = 0;
        let source = FnGenCounter::new();
        let gen = filter(
            |op| op.value.as_ref().and_then(Value::as_i64).unwrap_or(0) % 2 == 0,
            source,
        );
        let ops = collect_ops(boxed(limit(3, gen)), 100);
        assert_eq!(ops.len(), 3);
        for op in &ops {
            let v = op.value.as_ref().and_then(Value::as_i64).unwrap();
            assert_eq!(v % 2, 0);
            assert!(v > n);
            n = v;
        }
    }

    #[test]
    fn test_synchronize_waits_for_idle() {
        let (test, ctx) = test_fixture(2);
        let busy = ctx.busy_thread(0, Thread::Client(0));
        let gen = synchronize(Op::invoke("r"));
        match gen.op(&test, &busy).unwrap() {
            Some((Emit::Pending, _)) => {}
            other => panic!("expected pending, got {:?}", other.map(|(e, _)| e)),
        }
        match gen.op(&test, &ctx).unwrap() {
            Some((Emit::Op(op), _)) => assert!(op.f_is("r")),
            other => panic!("expected op, got {:?}", other.map(|(e, _)| e)),
        }
    }

    #[test]
    fn test_phases_run_in_order() {
        let gen = phases(vec![
            boxed(limit(2, repeat(Op::invoke("p1")))) as Box<dyn Generator>,
            boxed(limit(1, repeat(Op::invoke("p2")))),
        ]);
        let (test, ctx) = test_fixture(2);
        let ops = collect_ops_in(boxed(gen), test, ctx, 100);
        assert_eq!(
            ops.iter().map(|o| o.f.clone().unwrap()).collect::<Vec<_>>(),
            vec!["p1", "p1", "p2"]
        );
    }

    /// Emits invokes of `f: "n"` with values 1, 2, 3, and so on: a
    /// generator whose state visibly advances, for filter/repeat tests.
    #[derive(Debug, Clone)]
    struct FnGenCounter {
        next: i64,
    }

    impl FnGenCounter {
        fn new() -> Self {
            FnGenCounter { next: 1 }
        }
    }

    impl Generator for FnGenCounter {
        fn op(&self, _test: &Test, ctx: &Context) -> OpResult {
            let op = Op::invoke_v("n", self.next)
                .with_time(ctx.time())
                .with_process(match ctx.some_free_process() {
                    Some(p) => p,
                    None => return Ok(Some((Emit::Pending, boxed(self.clone())))),
                });
            Ok(Some((
                Emit::Op(op),
                boxed(FnGenCounter {
                    next: self.next + 1,
                }),
            )))
        }

        fn update(self: Box<Self>, _test: &Test, _ctx: &Context, _event: &Op) -> UpdateResult {
            Ok(self)
        }
    }
}
