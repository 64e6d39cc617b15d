//! Selection combinators: choosing among several sub-generators.

use crate::{boxed, Emit, Generator, OpResult, UpdateResult};
use faultline_core::{Context, Op, Test};
use rand::Rng;

/// Effective time of a candidate op: ops without an explicit time are due
/// right now.
fn effective_time(op: &Op, ctx: &Context) -> i64 {
    op.time.unwrap_or_else(|| ctx.time())
}

/// Picks among weighted candidate indices sharing the soonest time. Returns
/// the chosen index. Ties are broken randomly in proportion to weight, so a
/// candidate backed by many threads wins proportionally more often than a
/// small reserved pool next to it.
pub(crate) fn pick_weighted(candidates: &[(usize, usize)]) -> usize {
    debug_assert!(!candidates.is_empty());
    let total: usize = candidates.iter().map(|(_, w)| *w.max(&1)).sum();
    let mut roll = rand::thread_rng().gen_range(0..total);
    for (idx, w) in candidates {
        let w = *w.max(&1);
        if roll < w {
            return *idx;
        }
        roll -= w;
    }
    candidates[candidates.len() - 1].0
}

/// Selects, among steps produced by several sources, the index set of
/// concrete ops sharing the minimum effective time.
pub(crate) fn soonest_indices(
    steps: &[Option<(Emit, Box<dyn Generator>)>],
    ctx: &Context,
) -> Vec<usize> {
    let mut best_time = i64::MAX;
    let mut best: Vec<usize> = Vec::new();
    for (i, step) in steps.iter().enumerate() {
        if let Some((Emit::Op(op), _)) = step {
            let t = effective_time(op, ctx);
            if t < best_time {
                best_time = t;
                best = vec![i];
            } else if t == best_time {
                best.push(i);
            }
        }
    }
    best
}

/// Emits from whichever sub-generator offers the earliest op. A `nil`
/// candidate loses to anything; `pending` loses to a concrete op; among
/// concrete ops the lowest time wins, ties broken at random.
#[derive(Debug, Clone)]
pub struct Any {
    gens: Vec<Box<dyn Generator>>,
}

/// The earliest op from any of `gens`.
pub fn any(gens: impl IntoIterator<Item = Box<dyn Generator>>) -> Any {
    Any {
        gens: gens.into_iter().collect(),
    }
}

impl Generator for Any {
    fn op(&self, test: &Test, ctx: &Context) -> OpResult {
        let steps: Vec<_> = self
            .gens
            .iter()
            .map(|g| g.op(test, ctx))
            .collect::<Result<_, _>>()?;

        let best = soonest_indices(&steps, ctx);
        if !best.is_empty() {
            // Ties go to each candidate in proportion to the threads behind
            // it, so a single-thread source next to a large pool is drawn
            // one-in-n, not half the time.
            let weighted: Vec<(usize, usize)> = best
                .into_iter()
                .map(|i| (i, self.gens[i].weight(ctx)))
                .collect();
            let chosen = pick_weighted(&weighted);
            let mut emit_out = Emit::Pending;
            let mut gens = Vec::with_capacity(self.gens.len());
            for (i, step) in steps.into_iter().enumerate() {
                match step {
                    // Children observed exhausted drop out for good.
                    None => {}
                    Some((emit, gen)) if i == chosen => {
                        emit_out = emit;
                        gens.push(gen);
                    }
                    Some(_) => gens.push(self.gens[i].clone()),
                }
            }
            Ok(Some((emit_out, boxed(Any { gens }))))
        } else if steps.iter().any(|s| s.is_some()) {
            Ok(Some((Emit::Pending, boxed(self.clone()))))
        } else {
            Ok(None)
        }
    }

    fn update(self: Box<Self>, test: &Test, ctx: &Context, event: &Op) -> UpdateResult {
        let mut this = self;
        let gens = std::mem::take(&mut this.gens);
        this.gens = gens
            .into_iter()
            .map(|g| g.update(test, ctx, event))
            .collect::<Result<_, _>>()?;
        Ok(this)
    }

    fn weight(&self, ctx: &Context) -> usize {
        self.gens.iter().map(|g| g.weight(ctx)).sum::<usize>().max(1)
    }
}

/// Emits from a uniformly chosen sub-generator, re-choosing after every op.
/// Exhausted members drop out; the mix is exhausted when all are. Updates
/// are not routed to members: which member produced an op is deliberately
/// forgotten, so members needing completion feedback belong under a
/// different combinator.
#[derive(Debug, Clone)]
pub struct Mix {
    gens: Vec<Box<dyn Generator>>,
}

/// A uniform random mixture of `gens`.
pub fn mix(gens: impl IntoIterator<Item = Box<dyn Generator>>) -> Mix {
    Mix {
        gens: gens.into_iter().collect(),
    }
}

impl Generator for Mix {
    fn op(&self, test: &Test, ctx: &Context) -> OpResult {
        let mut alive: Vec<usize> = (0..self.gens.len()).collect();
        let mut exhausted: Vec<usize> = Vec::new();
        let mut rng = rand::thread_rng();
        while !alive.is_empty() {
            let pos = rng.gen_range(0..alive.len());
            let idx = alive[pos];
            match self.gens[idx].op(test, ctx)? {
                None => {
                    alive.swap_remove(pos);
                    exhausted.push(idx);
                }
                Some((Emit::Pending, _)) => {
                    return Ok(Some((Emit::Pending, boxed(self.clone()))));
                }
                Some((Emit::Op(op), gen)) => {
                    let gens = self
                        .gens
                        .iter()
                        .enumerate()
                        .filter(|(i, _)| !exhausted.contains(i))
                        .map(|(i, g)| if i == idx { gen.clone() } else { g.clone() })
                        .collect();
                    return Ok(Some((Emit::Op(op), boxed(Mix { gens }))));
                }
            }
        }
        Ok(None)
    }

    fn update(self: Box<Self>, _test: &Test, _ctx: &Context, _event: &Op) -> UpdateResult {
        Ok(self)
    }
}
