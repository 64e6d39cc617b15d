//! Leaf generators: the ground terms of the algebra.

use crate::{boxed, Emit, Generator, OpResult, UpdateResult};
use faultline_core::{Context, Op, Test};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Fills in the fields a partially specified op leaves open: `process` from
/// some free process in the context, `time` from the context clock. Returns
/// `Pending` when no process is free to run the op.
pub(crate) fn fill_in(op: &Op, ctx: &Context) -> Emit {
    let mut op = op.clone();
    if op.process.is_none() {
        match ctx.some_free_process() {
            Some(p) => op.process = Some(p),
            None => return Emit::Pending,
        }
    }
    if op.time.is_none() {
        op.time = Some(ctx.time());
    }
    Emit::Op(op)
}

/// A literal op is a generator that emits itself once, then is exhausted.
/// Wrap it in [`crate::repeat`] for an endless supply.
impl Generator for Op {
    fn op(&self, _test: &Test, ctx: &Context) -> OpResult {
        Ok(Some((fill_in(self, ctx), boxed(Nothing))))
    }

    fn update(self: Box<Self>, _test: &Test, _ctx: &Context, _event: &Op) -> UpdateResult {
        Ok(self)
    }
}

/// The empty generator: always exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nothing;

impl Generator for Nothing {
    fn op(&self, _test: &Test, _ctx: &Context) -> OpResult {
        Ok(None)
    }

    fn update(self: Box<Self>, _test: &Test, _ctx: &Context, _event: &Op) -> UpdateResult {
        Ok(self)
    }
}

/// The empty generator.
pub fn nothing() -> Nothing {
    Nothing
}

/// An ordered sequence of sub-generators: produces from the head until it is
/// exhausted, then moves on.
#[derive(Debug, Clone, Default)]
pub struct Seq {
    gens: VecDeque<Box<dyn Generator>>,
}

impl Seq {
    pub fn new(gens: impl IntoIterator<Item = Box<dyn Generator>>) -> Self {
        Seq {
            gens: gens.into_iter().collect(),
        }
    }
}

impl Generator for Seq {
    fn op(&self, test: &Test, ctx: &Context) -> OpResult {
        let mut rest = self.gens.clone();
        while let Some(head) = rest.pop_front() {
            match head.op(test, ctx)? {
                None => continue,
                Some((emit, head_prime)) => {
                    let mut gens = rest;
                    gens.push_front(head_prime);
                    return Ok(Some((emit, boxed(Seq { gens }))));
                }
            }
        }
        Ok(None)
    }

    fn update(self: Box<Self>, test: &Test, ctx: &Context, event: &Op) -> UpdateResult {
        let mut this = self;
        if let Some(head) = this.gens.pop_front() {
            this.gens.push_front(head.update(test, ctx, event)?);
        }
        Ok(this)
    }

    fn weight(&self, ctx: &Context) -> usize {
        match self.gens.front() {
            Some(head) => head.weight(ctx),
            None => ctx.all_thread_count(),
        }
    }
}

/// A generator built from a function. The function is called with the test
/// and context and returns a generator; that generator is drained before the
/// function is consulted again. A function returning `None` ends the stream.
#[derive(Clone)]
pub struct FnGen {
    f: Arc<dyn Fn(&Test, &Context) -> Option<Box<dyn Generator>> + Send + Sync>,
    current: Option<Box<dyn Generator>>,
}

impl FnGen {
    pub fn new(
        f: impl Fn(&Test, &Context) -> Option<Box<dyn Generator>> + Send + Sync + 'static,
    ) -> Self {
        FnGen {
            f: Arc::new(f),
            current: None,
        }
    }
}

impl std::fmt::Debug for FnGen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnGen")
            .field("current", &self.current)
            .finish_non_exhaustive()
    }
}

impl Generator for FnGen {
    fn op(&self, test: &Test, ctx: &Context) -> OpResult {
        if let Some(current) = &self.current {
            if let Some((emit, current_prime)) = current.op(test, ctx)? {
                return Ok(Some((
                    emit,
                    boxed(FnGen {
                        f: self.f.clone(),
                        current: Some(current_prime),
                    }),
                )));
            }
        }
        // Current generator (if any) is exhausted: ask the function for the
        // next one. A single attempt: a function whose product is stillborn
        // ends the stream rather than looping.
        let Some(next) = (self.f)(test, ctx) else {
            return Ok(None);
        };
        match next.op(test, ctx)? {
            None => Ok(None),
            Some((emit, next_prime)) => Ok(Some((
                emit,
                boxed(FnGen {
                    f: self.f.clone(),
                    current: Some(next_prime),
                }),
            ))),
        }
    }

    fn update(self: Box<Self>, test: &Test, ctx: &Context, event: &Op) -> UpdateResult {
        let mut this = self;
        if let Some(current) = this.current.take() {
            this.current = Some(current.update(test, ctx, event)?);
        }
        Ok(this)
    }

    fn weight(&self, ctx: &Context) -> usize {
        match &self.current {
            Some(current) => current.weight(ctx),
            None => ctx.all_thread_count(),
        }
    }
}

impl<F> From<F> for FnGen
where
    F: Fn(&Test, &Context) -> Option<Box<dyn Generator>> + Send + Sync + 'static,
{
    fn from(f: F) -> Self {
        FnGen::new(f)
    }
}

/// A generator whose contents arrive later. Emits `Pending` until the
/// matching [`PromiseHandle`] is fulfilled, then behaves as the delivered
/// generator.
#[derive(Clone)]
pub struct Promise {
    cell: Arc<Mutex<Option<Box<dyn Generator>>>>,
}

/// Write side of a [`Promise`].
pub struct PromiseHandle {
    cell: Arc<Mutex<Option<Box<dyn Generator>>>>,
}

impl PromiseHandle {
    /// Delivers the generator. Later deliveries are ignored.
    pub fn fulfill(&self, gen: impl Generator + 'static) {
        let mut slot = self.cell.lock();
        if slot.is_none() {
            *slot = Some(boxed(gen));
        }
    }
}

/// Creates an unfulfilled promise generator and its write handle.
pub fn promise() -> (Promise, PromiseHandle) {
    let cell = Arc::new(Mutex::new(None));
    (
        Promise { cell: cell.clone() },
        PromiseHandle { cell },
    )
}

impl std::fmt::Debug for Promise {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = if self.cell.lock().is_some() {
            "fulfilled"
        } else {
            "pending"
        };
        f.debug_struct("Promise").field("state", &state).finish()
    }
}

impl Generator for Promise {
    fn op(&self, test: &Test, ctx: &Context) -> OpResult {
        let delivered = self.cell.lock().clone();
        match delivered {
            // Once fulfilled, the promise is transparently replaced by its
            // contents.
            Some(gen) => gen.op(test, ctx),
            None => Ok(Some((Emit::Pending, boxed(self.clone())))),
        }
    }

    fn update(self: Box<Self>, test: &Test, ctx: &Context, event: &Op) -> UpdateResult {
        let delivered = self.cell.lock().clone();
        match delivered {
            Some(gen) => gen.update(test, ctx, event),
            None => Ok(self),
        }
    }

    fn weight(&self, ctx: &Context) -> usize {
        match &*self.cell.lock() {
            Some(gen) => gen.weight(ctx),
            None => ctx.all_thread_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{collect_ops, test_fixture};
    use faultline_core::Kind;

    #[test]
    fn test_literal_emits_once() {
        let ops = collect_ops(boxed(Op::invoke_v("write", 1)), 10);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].f.as_deref(), Some("write"));
        assert!(ops[0].process.is_some(), "leaf fills in a process");
        assert!(ops[0].time.is_some(), "leaf fills in a time");
    }

    #[test]
    fn test_literal_pending_when_no_free_process() {
        let (test, _) = test_fixture(2);
        let ctx = crate::testing::ctx_with_free(2, &[]);
        let gen = Op::invoke("read");
        match gen.op(&test, &ctx).unwrap() {
            Some((Emit::Pending, _)) => {}
            other => panic!("expected pending, got {:?}", other.map(|(e, _)| e)),
        }
    }

    #[test]
    fn test_nothing_is_exhausted() {
        assert!(collect_ops(boxed(nothing()), 10).is_empty());
    }

    #[test]
    fn test_seq_runs_in_order() {
        let gen = Seq::new(vec![
            boxed(Op::invoke_v("a", 1)),
            boxed(nothing()),
            boxed(Op::invoke_v("b", 2)),
        ]);
        let ops = collect_ops(boxed(gen), 10);
        assert_eq!(
            ops.iter().map(|o| o.f.clone().unwrap()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
    }

    #[test]
    fn test_fn_gen_refills_until_none() {
        let counter = Arc::new(Mutex::new(0));
        let gen = FnGen::new(move |_, _| {
            let mut n = counter.lock();
            *n += 1;
            if *n <= 3 {
                Some(boxed(Op::invoke_v("tick", *n)))
            } else {
                None
            }
        });
        let ops = collect_ops(boxed(gen), 10);
        assert_eq!(ops.len(), 3);
        assert!(ops.iter().all(|o| o.kind == Kind::Invoke));
    }

    #[test]
    fn test_promise_pending_then_contents() {
        let (gen, handle) = promise();
        let (test, ctx) = test_fixture(2);
        match gen.op(&test, &ctx).unwrap() {
            Some((Emit::Pending, _)) => {}
            other => panic!("expected pending, got {:?}", other.map(|(e, _)| e)),
        }

        handle.fulfill(Op::invoke_v("late", 1));
        match gen.op(&test, &ctx).unwrap() {
            Some((Emit::Op(op), _)) => assert_eq!(op.f.as_deref(), Some("late")),
            other => panic!("expected op, got {:?}", other.map(|(e, _)| e)),
        }
    }
}
