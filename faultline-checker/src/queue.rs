//! Queue workload checker: multiset accounting over enqueues and dequeues.

use crate::{CheckOpts, CheckResult, Checker, CheckerResult, Validity};
use faultline_core::{History, Kind, Test};
use serde_json::Value;
use std::collections::BTreeMap;

fn vkey(v: &Value) -> String {
    v.to_string()
}

/// A multiset of JSON values keyed canonically.
#[derive(Debug, Default)]
struct Multiset {
    entries: BTreeMap<String, (Value, u64)>,
}

impl Multiset {
    fn add(&mut self, v: &Value) {
        self.entries
            .entry(vkey(v))
            .or_insert_with(|| (v.clone(), 0))
            .1 += 1;
    }

    fn count(&self, key: &str) -> u64 {
        self.entries.get(key).map(|(_, n)| *n).unwrap_or(0)
    }

    fn iter(&self) -> impl Iterator<Item = (&String, &Value, u64)> {
        self.entries.iter().map(|(k, (v, n))| (k, v, *n))
    }
}

struct TotalQueue;

/// Checks a queue against the full history: every acknowledged enqueue must
/// eventually be dequeued (`lost` otherwise), nothing may be dequeued that
/// was never enqueued (`unexpected`), values dequeued more often than
/// enqueued are `duplicated`, and indeterminate enqueues that surface are
/// `recovered`. A successful `drain` completion carries the remaining
/// elements and counts as dequeues of each.
pub fn total_queue() -> Box<dyn Checker> {
    Box::new(TotalQueue)
}

impl Checker for TotalQueue {
    fn check(&self, _test: &Test, history: &History, _opts: &CheckOpts) -> CheckerResult {
        let mut attempts = Multiset::default();
        let mut acknowledged = Multiset::default();
        let mut dequeued = Multiset::default();

        for op in history.iter() {
            match (op.kind, op.f.as_deref()) {
                (Kind::Invoke, Some("enqueue")) => {
                    if let Some(v) = &op.value {
                        attempts.add(v);
                    }
                }
                (Kind::Ok, Some("enqueue")) => {
                    if let Some(v) = &op.value {
                        acknowledged.add(v);
                    }
                }
                (Kind::Ok, Some("dequeue")) => {
                    if let Some(v) = &op.value {
                        dequeued.add(v);
                    }
                }
                (Kind::Ok, Some("drain")) => {
                    if let Some(Value::Array(vs)) = &op.value {
                        for v in vs {
                            dequeued.add(v);
                        }
                    }
                }
                _ => {}
            }
        }

        let mut lost: Vec<Value> = Vec::new();
        let mut recovered: Vec<Value> = Vec::new();
        let mut unexpected: Vec<Value> = Vec::new();
        let mut duplicated: Vec<Value> = Vec::new();

        for (key, value, acked) in acknowledged.iter() {
            let seen = dequeued.count(key);
            for _ in seen..acked {
                lost.push(value.clone());
            }
        }
        for (key, value, seen) in dequeued.iter() {
            let attempted = attempts.count(key);
            let acked = acknowledged.count(key);
            if attempted == 0 {
                for _ in 0..seen {
                    unexpected.push(value.clone());
                }
                continue;
            }
            if seen > attempted {
                for _ in attempted..seen {
                    duplicated.push(value.clone());
                }
            }
            if acked < attempted && seen > 0 {
                recovered.push(value.clone());
            }
        }

        let valid = Validity::from_bool(lost.is_empty() && unexpected.is_empty());
        Ok(CheckResult::new(valid)
            .with("attempt_count", attempts.iter().map(|(_, _, n)| n).sum::<u64>())
            .with(
                "acknowledged_count",
                acknowledged.iter().map(|(_, _, n)| n).sum::<u64>(),
            )
            .with("ok_count", dequeued.iter().map(|(_, _, n)| n).sum::<u64>())
            .with("lost_count", lost.len())
            .with("recovered_count", recovered.len())
            .with("unexpected_count", unexpected.len())
            .with("duplicated_count", duplicated.len())
            .with("lost", lost)
            .with("recovered", recovered)
            .with("unexpected", unexpected)
            .with("duplicated", duplicated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faultline_core::{Op, Process};
    use serde_json::json;

    fn journaled(ops: Vec<Op>) -> History {
        let mut out = Vec::new();
        for (i, mut op) in ops.into_iter().enumerate() {
            op.index = Some(i as i64);
            op.time = Some(i as i64);
            out.push(op);
        }
        History::from(out)
    }

    fn enq(v: &str) -> Op {
        Op::invoke_v("enqueue", v).with_process(Process::Id(0))
    }

    fn deq(v: &str) -> Op {
        Op::invoke("dequeue")
            .with_process(Process::Id(1))
            .with_value(v)
    }

    #[test]
    fn test_queue_balanced_with_drain() {
        // S4: enqueue a, b, c; dequeue a, b; drain yields c.
        let h = journaled(vec![
            enq("a"),
            enq("a").complete(Kind::Ok),
            enq("b"),
            enq("b").complete(Kind::Ok),
            enq("c"),
            enq("c").complete(Kind::Ok),
            deq("a"),
            deq("a").complete(Kind::Ok),
            deq("b"),
            deq("b").complete(Kind::Ok),
            Op::invoke("drain").with_process(Process::Id(0)),
            Op::invoke("drain")
                .with_process(Process::Id(0))
                .with_value(json!(["c"]))
                .complete(Kind::Ok),
        ]);
        let result = total_queue()
            .check(&Test::new("t", 2), &h, &CheckOpts::new())
            .unwrap();
        assert_eq!(result.valid, Validity::Valid);
        assert_eq!(result.field("lost"), Some(&json!([])));
        assert_eq!(result.field("unexpected"), Some(&json!([])));
    }

    #[test]
    fn test_queue_lost_and_unexpected() {
        let h = journaled(vec![
            enq("a"),
            enq("a").complete(Kind::Ok),
            deq("z"),
            deq("z").complete(Kind::Ok),
        ]);
        let result = total_queue()
            .check(&Test::new("t", 2), &h, &CheckOpts::new())
            .unwrap();
        assert_eq!(result.valid, Validity::Invalid);
        assert_eq!(result.field("lost"), Some(&json!(["a"])));
        assert_eq!(result.field("unexpected"), Some(&json!(["z"])));
    }

    #[test]
    fn test_queue_duplicates() {
        let h = journaled(vec![
            enq("a"),
            enq("a").complete(Kind::Ok),
            deq("a"),
            deq("a").complete(Kind::Ok),
            deq("a"),
            deq("a").complete(Kind::Ok),
        ]);
        let result = total_queue()
            .check(&Test::new("t", 2), &h, &CheckOpts::new())
            .unwrap();
        // Duplicates are reported but do not themselves invalidate.
        assert_eq!(result.valid, Validity::Valid);
        assert_eq!(result.field("duplicated"), Some(&json!(["a"])));
        assert_eq!(result.field("duplicated_count"), Some(&json!(1)));
    }

    #[test]
    fn test_queue_recovered() {
        let h = journaled(vec![
            enq("a"),
            enq("a").complete(Kind::Info),
            deq("a"),
            deq("a").complete(Kind::Ok),
        ]);
        let result = total_queue()
            .check(&Test::new("t", 2), &h, &CheckOpts::new())
            .unwrap();
        assert_eq!(result.valid, Validity::Valid);
        assert_eq!(result.field("recovered"), Some(&json!(["a"])));
    }
}
