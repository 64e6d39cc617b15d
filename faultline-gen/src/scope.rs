//! Thread-scoping combinators: restricting which threads may consume from a
//! generator, partitioning the thread pool, and per-thread instantiation.

use crate::select::{pick_weighted, soonest_indices};
use crate::{boxed, Emit, Generator, OpResult, UpdateResult};
use faultline_core::{Context, Op, Test, Thread, ThreadMask};
use std::collections::HashMap;
use std::sync::Arc;

/// How a scope describes its thread set. Compiled to a [`ThreadMask`] once
/// per concurrency and cached, so restriction stays a word-level
/// intersection on the hot path.
#[derive(Clone)]
enum MaskSpec {
    Clients,
    Nemesis,
    Pred(Arc<dyn Fn(Thread) -> bool + Send + Sync>),
}

impl MaskSpec {
    fn compile(&self, concurrency: usize) -> ThreadMask {
        match self {
            MaskSpec::Clients => ThreadMask::clients(concurrency),
            MaskSpec::Nemesis => ThreadMask::nemesis(concurrency),
            MaskSpec::Pred(p) => {
                let p = p.clone();
                ThreadMask::from_fn(concurrency, move |t| p(t))
            }
        }
    }
}

impl std::fmt::Debug for MaskSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MaskSpec::Clients => write!(f, "clients"),
            MaskSpec::Nemesis => write!(f, "nemesis"),
            MaskSpec::Pred(_) => write!(f, "pred"),
        }
    }
}

/// Restricts the wrapped generator to the threads matching a mask. Ops are
/// drawn, and updates delivered, through the restricted context view.
#[derive(Clone)]
pub struct OnThreads {
    spec: MaskSpec,
    mask: Option<ThreadMask>,
    gen: Box<dyn Generator>,
}

impl std::fmt::Debug for OnThreads {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnThreads")
            .field("spec", &self.spec)
            .field("gen", &self.gen)
            .finish()
    }
}

/// Only threads satisfying `pred` may consume from `gen`.
pub fn on_threads(
    pred: impl Fn(Thread) -> bool + Send + Sync + 'static,
    gen: impl Generator + 'static,
) -> OnThreads {
    OnThreads {
        spec: MaskSpec::Pred(Arc::new(pred)),
        mask: None,
        gen: boxed(gen),
    }
}

/// Restricts `gen` to client threads.
pub fn clients(gen: impl Generator + 'static) -> OnThreads {
    OnThreads {
        spec: MaskSpec::Clients,
        mask: None,
        gen: boxed(gen),
    }
}

/// Restricts `gen` to the nemesis thread.
pub fn nemesis(gen: impl Generator + 'static) -> OnThreads {
    OnThreads {
        spec: MaskSpec::Nemesis,
        mask: None,
        gen: boxed(gen),
    }
}

impl OnThreads {
    fn mask_for(&self, concurrency: usize) -> ThreadMask {
        match &self.mask {
            Some(m) if m.concurrency() == concurrency => m.clone(),
            _ => self.spec.compile(concurrency),
        }
    }
}

impl Generator for OnThreads {
    fn op(&self, test: &Test, ctx: &Context) -> OpResult {
        let mask = self.mask_for(ctx.concurrency());
        let view = ctx.restrict(&mask);
        Ok(self.gen.op(test, &view)?.map(|(emit, gen)| {
            (
                emit,
                boxed(OnThreads {
                    spec: self.spec.clone(),
                    mask: Some(mask),
                    gen,
                }) as Box<dyn Generator>,
            )
        }))
    }

    fn update(self: Box<Self>, test: &Test, ctx: &Context, event: &Op) -> UpdateResult {
        let mut this = self;
        let mask = this.mask_for(ctx.concurrency());
        let matches = event
            .process
            .map(|p| mask.contains(p.thread(ctx.concurrency())))
            .unwrap_or(false);
        if matches {
            let view = ctx.restrict(&mask);
            this.gen = this.gen.update(test, &view, event)?;
        }
        this.mask = Some(mask);
        Ok(this)
    }

    fn weight(&self, ctx: &Context) -> usize {
        let mask = self.mask_for(ctx.concurrency());
        let view = ctx.restrict(&mask);
        self.gen.weight(&view)
    }
}

/// Partitions client threads into fixed-size pools, each served by its own
/// generator; every thread not in a reserved pool (the nemesis included)
/// consults the default generator. Selection among pools follows the
/// soonest-op rule, with ties weighted by pool size so a small pool is not
/// starved beside a large one.
#[derive(Debug, Clone)]
pub struct Reserve {
    counts: Vec<usize>,
    gens: Vec<Box<dyn Generator>>,
    default: Box<dyn Generator>,
    masks: Option<ReserveMasks>,
}

#[derive(Debug, Clone)]
struct ReserveMasks {
    concurrency: usize,
    pools: Vec<ThreadMask>,
    default: ThreadMask,
}

/// Reserves `count` threads per `(count, gen)` pool, remaining threads using
/// `default`.
pub fn reserve(
    pools: Vec<(usize, Box<dyn Generator>)>,
    default: impl Generator + 'static,
) -> Reserve {
    let (counts, gens) = pools.into_iter().unzip();
    Reserve {
        counts,
        gens,
        default: boxed(default),
        masks: None,
    }
}

impl Reserve {
    fn masks_for(&self, concurrency: usize) -> ReserveMasks {
        if let Some(m) = &self.masks {
            if m.concurrency == concurrency {
                return m.clone();
            }
        }
        let mut pools = Vec::with_capacity(self.counts.len());
        let mut lo = 0usize;
        for &count in &self.counts {
            let hi = (lo + count).min(concurrency);
            let range = lo..hi;
            pools.push(ThreadMask::from_fn(concurrency, move |t| {
                matches!(t, Thread::Client(i) if range.contains(&i))
            }));
            lo = hi;
        }
        let taken = lo;
        let default = ThreadMask::from_fn(concurrency, move |t| match t {
            Thread::Client(i) => i >= taken,
            Thread::Nemesis => true,
        });
        ReserveMasks {
            concurrency,
            pools,
            default,
        }
    }

    fn pool_of(&self, masks: &ReserveMasks, thread: Thread) -> Option<usize> {
        masks.pools.iter().position(|m| m.contains(thread))
    }
}

impl Generator for Reserve {
    fn op(&self, test: &Test, ctx: &Context) -> OpResult {
        let masks = self.masks_for(ctx.concurrency());

        // One candidate per pool plus the default, each probed through its
        // restricted view.
        let mut steps = Vec::with_capacity(self.gens.len() + 1);
        let mut weights = Vec::with_capacity(self.gens.len() + 1);
        for (gen, mask) in self.gens.iter().zip(&masks.pools) {
            let view = ctx.restrict(mask);
            steps.push(gen.op(test, &view)?);
            weights.push(gen.weight(&view));
        }
        {
            let view = ctx.restrict(&masks.default);
            steps.push(self.default.op(test, &view)?);
            weights.push(self.default.weight(&view));
        }

        let best = soonest_indices(&steps, ctx);
        if !best.is_empty() {
            let weighted: Vec<(usize, usize)> =
                best.into_iter().map(|i| (i, weights[i])).collect();
            let chosen = pick_weighted(&weighted);
            let mut emit_out = Emit::Pending;
            let mut next = self.clone();
            next.masks = Some(masks);
            for (i, step) in steps.into_iter().enumerate() {
                if i != chosen {
                    continue;
                }
                if let Some((emit, gen)) = step {
                    emit_out = emit;
                    if i < next.gens.len() {
                        next.gens[i] = gen;
                    } else {
                        next.default = gen;
                    }
                }
            }
            Ok(Some((emit_out, boxed(next))))
        } else if steps.iter().any(|s| s.is_some()) {
            Ok(Some((Emit::Pending, boxed(self.clone()))))
        } else {
            Ok(None)
        }
    }

    fn update(self: Box<Self>, test: &Test, ctx: &Context, event: &Op) -> UpdateResult {
        let mut this = self;
        let masks = this.masks_for(ctx.concurrency());
        let Some(process) = event.process else {
            return Ok(this);
        };
        let thread = process.thread(ctx.concurrency());
        if let Some(pool) = this.pool_of(&masks, thread) {
            let view = ctx.restrict(&masks.pools[pool]);
            let gen = std::mem::replace(&mut this.gens[pool], boxed(crate::leaves::Nothing));
            this.gens[pool] = gen.update(test, &view, event)?;
        } else {
            let view = ctx.restrict(&masks.default);
            let gen = std::mem::replace(&mut this.default, boxed(crate::leaves::Nothing));
            this.default = gen.update(test, &view, event)?;
        }
        this.masks = Some(masks);
        Ok(this)
    }
}

/// Maintains an independent copy of a template generator for every thread.
#[derive(Debug, Clone)]
pub struct EachThread {
    template: Box<dyn Generator>,
    states: HashMap<Thread, Box<dyn Generator>>,
}

/// An independent copy of `gen` per thread.
pub fn each_thread(gen: impl Generator + 'static) -> EachThread {
    EachThread {
        template: boxed(gen),
        states: HashMap::new(),
    }
}

impl EachThread {
    fn state_of(&self, thread: Thread) -> Box<dyn Generator> {
        self.states
            .get(&thread)
            .cloned()
            .unwrap_or_else(|| self.template.clone())
    }
}

impl Generator for EachThread {
    fn op(&self, test: &Test, ctx: &Context) -> OpResult {
        let threads: Vec<Thread> = ctx.free_threads().collect();
        let mut steps = Vec::with_capacity(threads.len());
        for &thread in &threads {
            let mask = ThreadMask::of_threads(ctx.concurrency(), [thread]);
            let view = ctx.restrict(&mask);
            steps.push(self.state_of(thread).op(test, &view)?);
        }

        let best = soonest_indices(&steps, ctx);
        if !best.is_empty() {
            let weighted: Vec<(usize, usize)> = best.into_iter().map(|i| (i, 1)).collect();
            let chosen = pick_weighted(&weighted);
            let mut emit_out = Emit::Pending;
            let mut states = self.states.clone();
            for (i, step) in steps.into_iter().enumerate() {
                if i == chosen {
                    if let Some((emit, gen)) = step {
                        emit_out = emit;
                        states.insert(threads[i], gen);
                    }
                }
            }
            return Ok(Some((
                emit_out,
                boxed(EachThread {
                    template: self.template.clone(),
                    states,
                }),
            )));
        }

        if steps.iter().any(|s| s.is_some()) {
            return Ok(Some((Emit::Pending, boxed(self.clone()))));
        }
        // Every free thread's copy is exhausted. If someone is still busy,
        // their copies may yet produce; otherwise the whole family is done.
        if ctx.all_free() {
            Ok(None)
        } else {
            Ok(Some((Emit::Pending, boxed(self.clone()))))
        }
    }

    fn update(self: Box<Self>, test: &Test, ctx: &Context, event: &Op) -> UpdateResult {
        let mut this = self;
        let Some(process) = event.process else {
            return Ok(this);
        };
        let thread = process.thread(ctx.concurrency());
        let mask = ThreadMask::of_threads(ctx.concurrency(), [thread]);
        let view = ctx.restrict(&mask);
        let state = this.state_of(thread).update(test, &view, event)?;
        this.states.insert(thread, state);
        Ok(this)
    }
}
