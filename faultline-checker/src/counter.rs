//! Monotone counter checker.

use crate::{CheckOpts, CheckResult, Checker, CheckerResult, Validity};
use faultline_core::{History, Kind, Process, Test};
use serde_json::{json, Value};
use std::collections::HashMap;

struct Counter;

/// Checks an increment-only counter. Walking the history in order, each
/// completed read must fall within `[lower, upper]`, where `lower` is the
/// sum of adds acknowledged before the read was invoked and `upper` the sum
/// of adds attempted (and not known failed) by the time the read completed.
/// Decrements are not supported: a negative add makes the whole analysis
/// unsound, so the checker refuses with `Unknown` rather than guessing.
pub fn counter() -> Box<dyn Checker> {
    Box::new(Counter)
}

impl Checker for Counter {
    fn check(&self, _test: &Test, history: &History, _opts: &CheckOpts) -> CheckerResult {
        let mut lower: i64 = 0;
        let mut upper: i64 = 0;
        // Lower bound snapshot per open read, by process.
        let mut open_reads: HashMap<Process, i64> = HashMap::new();
        let mut reads: Vec<Value> = Vec::new();
        let mut errors: Vec<Value> = Vec::new();

        for op in history.iter() {
            let value = op.value.as_ref().and_then(Value::as_i64);
            match (op.kind, op.f.as_deref()) {
                (Kind::Invoke, Some("add")) => {
                    let Some(v) = value else { continue };
                    if v < 0 {
                        return Ok(CheckResult::new(Validity::Unknown)
                            .with("error", "decrements are not supported"));
                    }
                    upper += v;
                }
                (Kind::Fail, Some("add")) => {
                    // A definite failure never happened; retract it from the
                    // upper bound. Info completions stay forever possible.
                    if let Some(v) = value {
                        upper -= v;
                    }
                }
                (Kind::Ok, Some("add")) => {
                    if let Some(v) = value {
                        lower += v;
                    }
                }
                (Kind::Invoke, Some("read")) => {
                    if let Some(p) = op.process {
                        open_reads.insert(p, lower);
                    }
                }
                (Kind::Ok, Some("read")) => {
                    let Some(v) = value else { continue };
                    let lo = op
                        .process
                        .and_then(|p| open_reads.remove(&p))
                        .unwrap_or(0);
                    let hi = upper;
                    reads.push(json!([lo, v, hi]));
                    if v < lo || hi < v {
                        errors.push(json!([lo, v, hi]));
                    }
                }
                _ => {}
            }
        }

        let valid = Validity::from_bool(errors.is_empty());
        Ok(CheckResult::new(valid)
            .with("reads", reads)
            .with("errors", errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faultline_core::Op;
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

    fn add(v: i64) -> Op {
        Op::invoke_v("add", v).with_process(Process::Id(0))
    }

    fn read() -> Op {
        Op::invoke("read").with_process(Process::Id(1))
    }

    #[test]
    fn test_read_outside_bounds() {
        // S2: after an acknowledged add of 3, a read of 1 cannot happen.
        let h = journaled(vec![
            add(3),
            add(3).complete(Kind::Ok),
            read(),
            read().with_value(1).complete(Kind::Ok),
        ]);
        let result = counter()
            .check(&Test::new("t", 2), &h, &CheckOpts::new())
            .unwrap();
        assert_eq!(result.valid, Validity::Invalid);
        assert_eq!(result.field("errors"), Some(&json!([[3, 1, 3]])));
    }

    #[test]
    fn test_read_during_concurrent_add() {
        // The read opens before the add completes: anything between 0 and 5
        // is acceptable.
        let h = journaled(vec![
            add(5),
            read(),
            read().with_value(0).complete(Kind::Ok),
            add(5).complete(Kind::Ok),
            read(),
            read().with_value(5).complete(Kind::Ok),
        ]);
        let result = counter()
            .check(&Test::new("t", 2), &h, &CheckOpts::new())
            .unwrap();
        assert_eq!(result.valid, Validity::Valid);
        assert_eq!(result.field("reads"), Some(&json!([[0, 0, 5], [5, 5, 5]])));
    }

    #[test]
    fn test_failed_add_retracts_upper() {
        let h = journaled(vec![
            add(7),
            add(7).complete(Kind::Fail),
            read(),
            read().with_value(7).complete(Kind::Ok),
        ]);
        let result = counter()
            .check(&Test::new("t", 2), &h, &CheckOpts::new())
            .unwrap();
        assert_eq!(result.valid, Validity::Invalid);
    }

    #[test]
    fn test_indeterminate_add_widens_upper() {
        let h = journaled(vec![
            add(2),
            add(2).complete(Kind::Info),
            read(),
            read().with_value(2).complete(Kind::Ok),
            read().with_process(Process::Id(5)),
            read()
                .with_process(Process::Id(5))
                .with_value(0)
                .complete(Kind::Ok),
        ]);
        let result = counter()
            .check(&Test::new("t", 2), &h, &CheckOpts::new())
            .unwrap();
        // Both 0 and 2 are fine: the add may or may not have landed.
        assert_eq!(result.valid, Validity::Valid);
    }

    #[test]
    fn test_decrement_refused() {
        let h = journaled(vec![add(-1)]);
        let result = counter()
            .check(&Test::new("t", 2), &h, &CheckOpts::new())
            .unwrap();
        assert_eq!(result.valid, Validity::Unknown);
    }
}
