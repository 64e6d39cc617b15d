//! The scheduler's view of time, threads, and process identity.
//!
//! A [`Context`] is an immutable value: transitions return new contexts.
//! The scheduler owns the authoritative context for a live run; generators
//! receive restricted views built with [`Context::restrict`], which happens
//! on nearly every scheduling step and therefore works on precompiled
//! [`ThreadMask`] bitsets instead of walking the thread table.

use crate::bitset::BitSet;
use crate::op::{Process, Thread};
use rand::Rng;
use serde_json::{Map, Value};
use std::sync::Arc;

/// A precompiled thread predicate: the set of thread-table slots matching.
///
/// Slots `0..concurrency` are client threads; slot `concurrency` is the
/// nemesis. Restriction is a word-wise intersection, so its cost is bounded
/// by the table width regardless of how the mask was described.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadMask {
    bits: BitSet,
}

impl ThreadMask {
    /// Every thread, nemesis included.
    pub fn all(concurrency: usize) -> Self {
        ThreadMask {
            bits: BitSet::full(concurrency + 1),
        }
    }

    /// Client threads only.
    pub fn clients(concurrency: usize) -> Self {
        let mut bits = BitSet::full(concurrency + 1);
        bits.remove(concurrency);
        ThreadMask { bits }
    }

    /// The nemesis thread only.
    pub fn nemesis(concurrency: usize) -> Self {
        let mut bits = BitSet::with_capacity(concurrency + 1);
        bits.insert(concurrency);
        ThreadMask { bits }
    }

    /// The threads for which `pred` holds. The predicate runs once per slot
    /// at construction; restriction afterwards never re-evaluates it.
    pub fn from_fn(concurrency: usize, pred: impl Fn(Thread) -> bool) -> Self {
        let mut bits = BitSet::with_capacity(concurrency + 1);
        for slot in 0..=concurrency {
            if pred(slot_thread(slot, concurrency)) {
                bits.insert(slot);
            }
        }
        ThreadMask { bits }
    }

    /// An explicit set of threads.
    pub fn of_threads(
        concurrency: usize,
        threads: impl IntoIterator<Item = Thread>,
    ) -> Self {
        let mut bits = BitSet::with_capacity(concurrency + 1);
        for t in threads {
            bits.insert(thread_slot(t, concurrency));
        }
        ThreadMask { bits }
    }

    /// The concurrency this mask was compiled against.
    pub fn concurrency(&self) -> usize {
        self.bits.capacity() - 1
    }

    pub fn contains(&self, thread: Thread) -> bool {
        self.bits.contains(thread_slot(thread, self.concurrency()))
    }
}

fn thread_slot(thread: Thread, concurrency: usize) -> usize {
    match thread {
        Thread::Client(i) => i,
        Thread::Nemesis => concurrency,
    }
}

fn slot_thread(slot: usize, concurrency: usize) -> Thread {
    if slot == concurrency {
        Thread::Nemesis
    } else {
        Thread::Client(slot)
    }
}

/// Immutable record of the current relative time, the active and free thread
/// sets, and the thread-to-process assignment.
#[derive(Clone, Debug)]
pub struct Context {
    time: i64,
    concurrency: usize,
    all: BitSet,
    free: BitSet,
    /// Current process number per client slot; copy-on-write, since it only
    /// changes on retirement.
    processes: Arc<Vec<i64>>,
    ext: Arc<Map<String, Value>>,
}

impl Context {
    /// A fresh context with all `concurrency` client threads plus the
    /// nemesis active and free, each client thread speaking for the process
    /// equal to its own index.
    pub fn new(concurrency: usize) -> Self {
        Context {
            time: 0,
            concurrency,
            all: BitSet::full(concurrency + 1),
            free: BitSet::full(concurrency + 1),
            processes: Arc::new((0..concurrency as i64).collect()),
            ext: Arc::new(Map::new()),
        }
    }

    /// Relative time in nanoseconds.
    pub fn time(&self) -> i64 {
        self.time
    }

    pub fn with_time(&self, time: i64) -> Self {
        Context {
            time,
            ..self.clone()
        }
    }

    /// Number of client threads (the nemesis is extra).
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn all_threads(&self) -> impl Iterator<Item = Thread> + '_ {
        self.all.iter().map(|s| slot_thread(s, self.concurrency))
    }

    pub fn free_threads(&self) -> impl Iterator<Item = Thread> + '_ {
        self.free.iter().map(|s| slot_thread(s, self.concurrency))
    }

    pub fn all_thread_count(&self) -> usize {
        self.all.len()
    }

    pub fn free_thread_count(&self) -> usize {
        self.free.len()
    }

    /// Whether every active thread in this view is currently free.
    pub fn all_free(&self) -> bool {
        self.free == self.all
    }

    pub fn is_free(&self, thread: Thread) -> bool {
        self.free.contains(thread_slot(thread, self.concurrency))
    }

    pub fn is_active(&self, thread: Thread) -> bool {
        self.all.contains(thread_slot(thread, self.concurrency))
    }

    /// Marks `thread` free at `time`.
    pub fn free_thread(&self, time: i64, thread: Thread) -> Self {
        let mut next = self.with_time(time);
        next.free.insert(thread_slot(thread, self.concurrency));
        next
    }

    /// Marks `thread` busy at `time`.
    pub fn busy_thread(&self, time: i64, thread: Thread) -> Self {
        let mut next = self.with_time(time);
        next.free.remove(thread_slot(thread, self.concurrency));
        next
    }

    /// The process `thread` currently speaks for.
    pub fn thread_process(&self, thread: Thread) -> Process {
        match thread {
            Thread::Nemesis => Process::Nemesis,
            Thread::Client(i) => Process::Id(self.processes[i]),
        }
    }

    /// The thread currently speaking for `process`, if any. A process whose
    /// number has been retired maps to no thread.
    pub fn process_thread(&self, process: Process) -> Option<Thread> {
        match process {
            Process::Nemesis => Some(Thread::Nemesis),
            Process::Id(p) => {
                let thread = process.thread(self.concurrency);
                match thread {
                    Thread::Client(i) if self.processes[i] == p => Some(thread),
                    _ => None,
                }
            }
        }
    }

    /// Retires `thread`'s current process, assigning `process + concurrency`.
    /// The nemesis never rotates.
    pub fn with_next_process(&self, thread: Thread) -> Self {
        match thread {
            Thread::Nemesis => self.clone(),
            Thread::Client(i) => {
                let mut next = self.clone();
                Arc::make_mut(&mut next.processes)[i] += self.concurrency as i64;
                next
            }
        }
    }

    /// Some free process, chosen fairly: the scan starts at a random slot,
    /// so no free thread is starved behind numerically smaller ones.
    pub fn some_free_process(&self) -> Option<Process> {
        self.some_free_thread().map(|t| self.thread_process(t))
    }

    /// Some free thread, chosen fairly.
    pub fn some_free_thread(&self) -> Option<Thread> {
        if self.free.is_empty() {
            return None;
        }
        let start = rand::thread_rng().gen_range(0..self.concurrency + 1);
        self.free
            .next_from(start)
            .map(|s| slot_thread(s, self.concurrency))
    }

    /// A view whose active and free thread sets are intersected with `mask`.
    /// Restricting an already restricted context with the same mask is a
    /// no-op.
    pub fn restrict(&self, mask: &ThreadMask) -> Self {
        debug_assert_eq!(mask.concurrency(), self.concurrency);
        let mut next = self.clone();
        next.all.intersect_with(&mask.bits);
        next.free.intersect_with(&mask.bits);
        next
    }

    /// User extension value by key.
    pub fn ext(&self, key: &str) -> Option<&Value> {
        self.ext.get(key)
    }

    pub fn with_ext(&self, key: impl Into<String>, value: Value) -> Self {
        let mut next = self.clone();
        Arc::make_mut(&mut next.ext).insert(key.into(), value);
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_fresh_context() {
        let ctx = Context::new(3);
        assert_eq!(ctx.all_thread_count(), 4);
        assert_eq!(ctx.free_thread_count(), 4);
        assert!(ctx.all_free());
        assert_eq!(ctx.thread_process(Thread::Client(2)), Process::Id(2));
        assert_eq!(ctx.thread_process(Thread::Nemesis), Process::Nemesis);
    }

    #[test]
    fn test_busy_free_transitions() {
        let ctx = Context::new(2);
        let ctx = ctx.busy_thread(10, Thread::Client(0));
        assert_eq!(ctx.time(), 10);
        assert!(!ctx.is_free(Thread::Client(0)));
        assert!(ctx.is_free(Thread::Client(1)));
        assert_eq!(ctx.free_thread_count(), 2);

        let ctx = ctx.free_thread(20, Thread::Client(0));
        assert_eq!(ctx.time(), 20);
        assert!(ctx.is_free(Thread::Client(0)));
        assert!(ctx.all_free());
    }

    #[test]
    fn test_process_rotation() {
        let ctx = Context::new(4);
        let ctx = ctx.with_next_process(Thread::Client(1));
        assert_eq!(ctx.thread_process(Thread::Client(1)), Process::Id(5));
        assert_eq!(ctx.process_thread(Process::Id(5)), Some(Thread::Client(1)));
        // The retired process no longer maps to a thread.
        assert_eq!(ctx.process_thread(Process::Id(1)), None);

        let ctx = ctx.with_next_process(Thread::Client(1));
        assert_eq!(ctx.thread_process(Thread::Client(1)), Process::Id(9));
    }

    #[test]
    fn test_restrict_clients() {
        let ctx = Context::new(3).busy_thread(0, Thread::Client(0));
        let mask = ThreadMask::clients(3);
        let view = ctx.restrict(&mask);
        assert_eq!(view.all_thread_count(), 3);
        assert_eq!(view.free_thread_count(), 2);
        assert!(!view.is_active(Thread::Nemesis));
        // The parent context is unchanged.
        assert!(ctx.is_active(Thread::Nemesis));
    }

    #[test]
    fn test_restrict_idempotent() {
        let ctx = Context::new(5).busy_thread(3, Thread::Client(4));
        let mask = ThreadMask::from_fn(5, |t| matches!(t, Thread::Client(i) if i % 2 == 0));
        let once = ctx.restrict(&mask);
        let twice = once.restrict(&mask);
        assert_eq!(
            once.all_threads().collect::<Vec<_>>(),
            twice.all_threads().collect::<Vec<_>>()
        );
        assert_eq!(
            once.free_threads().collect::<Vec<_>>(),
            twice.free_threads().collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_some_free_process_fair() {
        let ctx = Context::new(8);
        let mut seen = HashSet::new();
        for _ in 0..2000 {
            if let Some(Process::Id(p)) = ctx.some_free_process() {
                seen.insert(p);
            }
        }
        // With a random scan start, every free client process (and not just
        // the smallest) is eventually chosen.
        assert!(seen.len() >= 8, "only saw processes {:?}", seen);
    }

    #[test]
    fn test_some_free_process_none_when_all_busy() {
        let mut ctx = Context::new(2);
        ctx = ctx.busy_thread(0, Thread::Client(0));
        ctx = ctx.busy_thread(0, Thread::Client(1));
        ctx = ctx.busy_thread(0, Thread::Nemesis);
        assert_eq!(ctx.some_free_process(), None);
    }

    #[test]
    fn test_nemesis_mask() {
        let ctx = Context::new(2);
        let view = ctx.restrict(&ThreadMask::nemesis(2));
        assert_eq!(view.all_threads().collect::<Vec<_>>(), vec![Thread::Nemesis]);
        assert_eq!(view.some_free_process(), Some(Process::Nemesis));
    }
}
