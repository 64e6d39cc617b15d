//! Time-shaping combinators: rate limiting, deadlines, and time-sliced
//! rotation.

use crate::{boxed, Emit, Generator, OpResult, UpdateResult};
use faultline_core::clock::secs_to_nanos;
use faultline_core::{Context, Op, Test};
use rand::Rng;
use std::collections::VecDeque;

/// A single `Sleep` pseudo-op: the worker that receives it pauses for
/// `seconds`, without touching the client.
pub fn sleep(seconds: f64) -> Op {
    Op::sleep(seconds)
}

/// A single `Log` pseudo-op: the receiving worker logs `message`.
pub fn log(message: impl Into<String>) -> Op {
    Op::log(message)
}

/// Forwards only ops scheduled within `dt` of the first op observed; later
/// ops end the generator.
#[derive(Debug, Clone)]
pub struct TimeLimit {
    limit_nanos: i64,
    cutoff: Option<i64>,
    gen: Box<dyn Generator>,
}

/// Cuts `gen` off `dt_seconds` after its first emitted op.
pub fn time_limit(dt_seconds: f64, gen: impl Generator + 'static) -> TimeLimit {
    TimeLimit {
        limit_nanos: secs_to_nanos(dt_seconds),
        cutoff: None,
        gen: boxed(gen),
    }
}

impl Generator for TimeLimit {
    fn op(&self, test: &Test, ctx: &Context) -> OpResult {
        match self.gen.op(test, ctx)? {
            None => Ok(None),
            Some((Emit::Pending, gen)) => Ok(Some((
                Emit::Pending,
                boxed(TimeLimit {
                    limit_nanos: self.limit_nanos,
                    cutoff: self.cutoff,
                    gen,
                }),
            ))),
            Some((Emit::Op(op), gen)) => {
                let t = op.time.unwrap_or_else(|| ctx.time());
                let cutoff = self.cutoff.unwrap_or(t + self.limit_nanos);
                if t < cutoff {
                    Ok(Some((
                        Emit::Op(op),
                        boxed(TimeLimit {
                            limit_nanos: self.limit_nanos,
                            cutoff: Some(cutoff),
                            gen,
                        }),
                    )))
                } else {
                    Ok(None)
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

/// Spaces successive ops by a uniformly random interval in `[0, 2·dt)`, so
/// the mean inter-op gap converges to `dt` without the lockstep rhythm an
/// exact delay produces.
#[derive(Debug, Clone)]
pub struct Stagger {
    dt_nanos: i64,
    next_time: Option<i64>,
    gen: Box<dyn Generator>,
}

/// Roughly one op per `dt_seconds`, jittered.
pub fn stagger(dt_seconds: f64, gen: impl Generator + 'static) -> Stagger {
    Stagger {
        dt_nanos: secs_to_nanos(dt_seconds).max(1),
        next_time: None,
        gen: boxed(gen),
    }
}

impl Generator for Stagger {
    fn op(&self, test: &Test, ctx: &Context) -> OpResult {
        match self.gen.op(test, ctx)? {
            None => Ok(None),
            Some((Emit::Pending, gen)) => Ok(Some((
                Emit::Pending,
                boxed(Stagger {
                    dt_nanos: self.dt_nanos,
                    next_time: self.next_time,
                    gen,
                }),
            ))),
            Some((Emit::Op(mut op), gen)) => {
                // If the schedule fell behind the clock, restart it from now
                // rather than emitting a burst of overdue ops.
                let scheduled = self.next_time.unwrap_or_else(|| ctx.time()).max(ctx.time());
                op.time = Some(op.time.map_or(scheduled, |t| t.max(scheduled)));
                let jitter = rand::thread_rng().gen_range(0..2 * self.dt_nanos);
                Ok(Some((
                    Emit::Op(op),
                    boxed(Stagger {
                        dt_nanos: self.dt_nanos,
                        next_time: Some(scheduled + jitter),
                        gen,
                    }),
                )))
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

/// Spaces successive op times exactly `dt` apart.
#[derive(Debug, Clone)]
pub struct Delay {
    dt_nanos: i64,
    last_time: Option<i64>,
    gen: Box<dyn Generator>,
}

/// Exactly one op per `dt_seconds`.
pub fn delay(dt_seconds: f64, gen: impl Generator + 'static) -> Delay {
    Delay {
        dt_nanos: secs_to_nanos(dt_seconds).max(1),
        last_time: None,
        gen: boxed(gen),
    }
}

impl Generator for Delay {
    fn op(&self, test: &Test, ctx: &Context) -> OpResult {
        match self.gen.op(test, ctx)? {
            None => Ok(None),
            Some((Emit::Pending, gen)) => Ok(Some((
                Emit::Pending,
                boxed(Delay {
                    dt_nanos: self.dt_nanos,
                    last_time: self.last_time,
                    gen,
                }),
            ))),
            Some((Emit::Op(mut op), gen)) => {
                let scheduled = self
                    .last_time
                    .map(|t| t + self.dt_nanos)
                    .unwrap_or_else(|| ctx.time())
                    .max(ctx.time());
                op.time = Some(op.time.map_or(scheduled, |t| t.max(scheduled)));
                let assigned = op.time.unwrap_or(scheduled);
                Ok(Some((
                    Emit::Op(op),
                    boxed(Delay {
                        dt_nanos: self.dt_nanos,
                        last_time: Some(assigned),
                        gen,
                    }),
                )))
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

/// Rotates through sub-generators on a wall-clock schedule: the first runs
/// for its slice of seconds, then the second, wrapping around forever.
/// Members are expected to be infinite; an exhausted member ends the whole
/// rotation.
#[derive(Debug, Clone)]
pub struct CycleTimes {
    /// Relative time at which the current head's slice ends.
    deadline: Option<i64>,
    entries: VecDeque<(i64, Box<dyn Generator>)>,
}

/// Time-sliced rotation over `(seconds, gen)` entries.
pub fn cycle_times(entries: Vec<(f64, Box<dyn Generator>)>) -> CycleTimes {
    CycleTimes {
        deadline: None,
        entries: entries
            .into_iter()
            .map(|(secs, gen)| (secs_to_nanos(secs).max(1), gen))
            .collect(),
    }
}

impl CycleTimes {
    /// Rotates entries until the head's slice covers `now`.
    fn rotated(&self, now: i64) -> (i64, VecDeque<(i64, Box<dyn Generator>)>) {
        let mut entries = self.entries.clone();
        let mut deadline = match self.deadline {
            Some(d) => d,
            None => now + entries.front().map(|(dt, _)| *dt).unwrap_or(0),
        };
        while deadline <= now {
            if let Some(head) = entries.pop_front() {
                deadline += entries.front().map(|(dt, _)| *dt).unwrap_or(head.0);
                entries.push_back(head);
            }
        }
        (deadline, entries)
    }
}

impl Generator for CycleTimes {
    fn op(&self, test: &Test, ctx: &Context) -> OpResult {
        if self.entries.is_empty() {
            return Ok(None);
        }
        let (deadline, mut entries) = self.rotated(ctx.time());
        let Some((dt, head)) = entries.pop_front() else {
            return Ok(None);
        };
        match head.op(test, ctx)? {
            None => Ok(None),
            Some((emit, head_prime)) => {
                entries.push_front((dt, head_prime));
                Ok(Some((
                    emit,
                    boxed(CycleTimes {
                        deadline: Some(deadline),
                        entries,
                    }),
                )))
            }
        }
    }

    fn update(self: Box<Self>, test: &Test, ctx: &Context, event: &Op) -> UpdateResult {
        let mut this = self;
        if let Some((dt, head)) = this.entries.pop_front() {
            this.entries.push_front((dt, head.update(test, ctx, event)?));
        }
        Ok(this)
    }
}
