//! The append-only, totally ordered journal of a run.

use crate::error::CoreError;
use crate::op::{Kind, Op, Process};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A totally ordered sequence of ops with dense, monotone indices.
///
/// The scheduler appends during the run; checkers read afterwards. Order is
/// by index, never by wall time: two ops may share a time but never an
/// index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    ops: Vec<Op>,
}

impl History {
    pub fn new() -> Self {
        History::default()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Appends an op, which must already carry its index.
    pub fn append(&mut self, op: Op) {
        debug_assert_eq!(op.index, Some(self.ops.len() as i64));
        self.ops.push(op);
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Op> {
        self.ops.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Op> {
        self.ops.get(index)
    }

    pub fn invokes(&self) -> impl Iterator<Item = &Op> {
        self.ops.iter().filter(|op| op.is_invoke())
    }

    pub fn completions(&self) -> impl Iterator<Item = &Op> {
        self.ops.iter().filter(|op| op.is_completion())
    }

    pub fn oks(&self) -> impl Iterator<Item = &Op> {
        self.of_kind(Kind::Ok)
    }

    pub fn infos(&self) -> impl Iterator<Item = &Op> {
        self.of_kind(Kind::Info)
    }

    pub fn of_kind(&self, kind: Kind) -> impl Iterator<Item = &Op> + '_ {
        self.ops.iter().filter(move |op| op.kind == kind)
    }

    /// Ops of the given family, invocations and completions alike.
    pub fn of_f<'a>(&'a self, f: &'a str) -> impl Iterator<Item = &'a Op> + 'a {
        self.ops.iter().filter(move |op| op.f_is(f))
    }

    /// Pairs each invocation's position with the position of its completion,
    /// if one exists. Completions match on process: a process has at most
    /// one outstanding invocation at a time.
    pub fn pairs(&self) -> Vec<(usize, Option<usize>)> {
        let mut pairs: Vec<(usize, Option<usize>)> = Vec::new();
        // Position into `pairs` per open invocation.
        let mut open: HashMap<Process, usize> = HashMap::new();

        for (pos, op) in self.ops.iter().enumerate() {
            let Some(process) = op.process else { continue };
            if op.is_invoke() {
                open.insert(process, pairs.len());
                pairs.push((pos, None));
            } else if op.is_completion() {
                if let Some(pi) = open.remove(&process) {
                    pairs[pi].1 = Some(pos);
                }
            }
        }
        pairs
    }

    /// Checks the structural invariants every faultline history satisfies:
    /// dense indices, one completion per invocation with matching process
    /// and family, no concurrent invocations on one process, no reuse of a
    /// process after an indeterminate completion, and non-decreasing times
    /// per process.
    pub fn validate(&self, concurrency: usize) -> Result<(), CoreError> {
        let mut open: HashMap<Process, &Op> = HashMap::new();
        let mut retired: HashMap<Process, usize> = HashMap::new();
        let mut last_time: HashMap<Process, i64> = HashMap::new();

        for (pos, op) in self.ops.iter().enumerate() {
            let err = |reason: String| CoreError::History {
                index: pos as i64,
                reason,
            };

            if op.index != Some(pos as i64) {
                return Err(err(format!(
                    "index {:?} breaks density, expected {}",
                    op.index, pos
                )));
            }
            let Some(process) = op.process else {
                return Err(err("journaled op without a process".into()));
            };
            if let Some(&r) = retired.get(&process) {
                return Err(err(format!(
                    "process {} was retired at index {} but acts again",
                    process, r
                )));
            }
            if let Some(time) = op.time {
                if let Some(&prev) = last_time.get(&process) {
                    if time < prev {
                        return Err(err(format!(
                            "time {} regressed below {} for process {}",
                            time, prev, process
                        )));
                    }
                }
                last_time.insert(process, time);
            }

            match op.kind {
                Kind::Invoke => {
                    if open.contains_key(&process) {
                        return Err(err(format!(
                            "process {} invoked concurrently with itself",
                            process
                        )));
                    }
                    open.insert(process, op);
                }
                k if k.is_completion() => {
                    let Some(invocation) = open.remove(&process) else {
                        return Err(err(format!(
                            "completion for process {} without an open invocation",
                            process
                        )));
                    };
                    if invocation.f != op.f {
                        return Err(err(format!(
                            "completion family {:?} does not match invocation {:?}",
                            op.f, invocation.f
                        )));
                    }
                    // An indeterminate completion retires a client process;
                    // the nemesis keeps its identity forever.
                    if k == Kind::Info {
                        if let Process::Id(p) = process {
                            retired.insert(process, pos);
                            // The thread continues under process +
                            // concurrency; that identity must be new.
                            let next = Process::Id(p + concurrency as i64);
                            if retired.contains_key(&next) {
                                return Err(err(format!(
                                    "successor process {} already retired",
                                    next
                                )));
                            }
                        }
                    }
                }
                _ => {
                    return Err(err(format!("kind {:?} is never journaled", op.kind)));
                }
            }
        }
        Ok(())
    }
}

impl From<Vec<Op>> for History {
    fn from(ops: Vec<Op>) -> Self {
        History { ops }
    }
}

impl<'a> IntoIterator for &'a History {
    type Item = &'a Op;
    type IntoIter = std::slice::Iter<'a, Op>;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.iter()
    }
}

impl std::ops::Index<usize> for History {
    type Output = Op;

    fn index(&self, index: usize) -> &Op {
        &self.ops[index]
    }
}
