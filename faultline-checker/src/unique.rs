//! Unique-id generation checker.

use crate::{CheckOpts, CheckResult, Checker, CheckerResult, Validity};
use faultline_core::{History, Kind, Test};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

struct UniqueIds;

/// Every successful `generate` must return a value nobody else received.
/// Duplicates are reported as a map from value to how many times it was
/// handed out.
pub fn unique_ids() -> Box<dyn Checker> {
    Box::new(UniqueIds)
}

impl Checker for UniqueIds {
    fn check(&self, _test: &Test, history: &History, _opts: &CheckOpts) -> CheckerResult {
        let mut attempted: u64 = 0;
        let mut acknowledged: u64 = 0;
        let mut seen: BTreeMap<String, u64> = BTreeMap::new();
        let mut range: Option<(f64, f64)> = None;

        for op in history.of_f("generate") {
            match op.kind {
                Kind::Invoke => attempted += 1,
                Kind::Ok => {
                    acknowledged += 1;
                    if let Some(v) = &op.value {
                        *seen.entry(v.to_string()).or_default() += 1;
                        if let Some(n) = v.as_f64() {
                            range = Some(match range {
                                None => (n, n),
                                Some((lo, hi)) => (lo.min(n), hi.max(n)),
                            });
                        }
                    }
                }
                _ => {}
            }
        }

        let duplicated: Map<String, Value> = seen
            .iter()
            .filter(|(_, &n)| n > 1)
            .map(|(k, &n)| (k.clone(), Value::from(n)))
            .collect();

        let valid = Validity::from_bool(duplicated.is_empty());
        let mut result = CheckResult::new(valid)
            .with("attempted_count", attempted)
            .with("acknowledged_count", acknowledged)
            .with("duplicated_count", duplicated.len())
            .with("duplicated", Value::Object(duplicated));
        if let Some((lo, hi)) = range {
            result = result.with("range", Value::from(vec![lo, hi]));
        }
        Ok(result)
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

    fn generate() -> Op {
        Op::invoke("generate").with_process(Process::Id(0))
    }

    #[test]
    fn test_duplicate_ids_detected() {
        // S3: the same id handed out twice.
        let h = journaled(vec![
            generate(),
            generate().with_value(1).complete(Kind::Ok),
            generate(),
            generate().with_value(1).complete(Kind::Ok),
        ]);
        let result = unique_ids()
            .check(&Test::new("t", 1), &h, &CheckOpts::new())
            .unwrap();
        assert_eq!(result.valid, Validity::Invalid);
        assert_eq!(result.field("duplicated_count"), Some(&json!(1)));
        assert_eq!(result.field("duplicated"), Some(&json!({"1": 2})));
    }

    #[test]
    fn test_distinct_ids_pass() {
        let h = journaled(vec![
            generate(),
            generate().with_value(1).complete(Kind::Ok),
            generate(),
            generate().with_value(2).complete(Kind::Ok),
        ]);
        let result = unique_ids()
            .check(&Test::new("t", 1), &h, &CheckOpts::new())
            .unwrap();
        assert_eq!(result.valid, Validity::Valid);
        assert_eq!(result.field("range"), Some(&json!([1.0, 2.0])));
    }
}
