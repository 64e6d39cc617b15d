//! Set workload checkers: does a final read contain what was acknowledged?

use crate::{CheckOpts, CheckResult, Checker, CheckerResult, Validity};
use faultline_core::{History, Kind, Op, Test};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Canonical key for a JSON value, used to treat values as set elements.
fn vkey(v: &Value) -> String {
    v.to_string()
}

fn values(map: &BTreeMap<String, Value>) -> Vec<Value> {
    map.values().cloned().collect()
}

struct Set;

/// Checks a grow-only set: `add` ops insert elements and a final `read`
/// returns the whole set. Acknowledged adds must be present (else `lost`),
/// and nothing unattempted may appear (else `unexpected`). Elements whose
/// add was indeterminate but which surface anyway are merely `recovered`.
pub fn set() -> Box<dyn Checker> {
    Box::new(Set)
}

impl Checker for Set {
    fn check(&self, _test: &Test, history: &History, _opts: &CheckOpts) -> CheckerResult {
        let mut attempts: BTreeMap<String, Value> = BTreeMap::new();
        let mut acknowledged: BTreeMap<String, Value> = BTreeMap::new();
        let mut final_read: Option<Vec<Value>> = None;

        for op in history.iter() {
            match (op.kind, op.f.as_deref()) {
                (Kind::Invoke, Some("add")) => {
                    if let Some(v) = &op.value {
                        attempts.insert(vkey(v), v.clone());
                    }
                }
                (Kind::Ok, Some("add")) => {
                    if let Some(v) = &op.value {
                        acknowledged.insert(vkey(v), v.clone());
                    }
                }
                (Kind::Ok, Some("read")) => {
                    if let Some(Value::Array(elements)) = &op.value {
                        final_read = Some(elements.clone());
                    }
                }
                _ => {}
            }
        }

        let Some(read) = final_read else {
            return Ok(CheckResult::new(Validity::Unknown)
                .with("error", "no known read of the set"));
        };
        let read: BTreeMap<String, Value> =
            read.into_iter().map(|v| (vkey(&v), v)).collect();

        let mut ok = BTreeMap::new();
        let mut lost = BTreeMap::new();
        let mut unexpected = BTreeMap::new();
        let mut recovered = BTreeMap::new();

        for (k, v) in &acknowledged {
            if read.contains_key(k) {
                ok.insert(k.clone(), v.clone());
            } else {
                lost.insert(k.clone(), v.clone());
            }
        }
        for (k, v) in &read {
            if !attempts.contains_key(k) {
                unexpected.insert(k.clone(), v.clone());
            } else if !acknowledged.contains_key(k) {
                recovered.insert(k.clone(), v.clone());
            }
        }

        let valid = Validity::from_bool(lost.is_empty() && unexpected.is_empty());
        Ok(CheckResult::new(valid)
            .with("attempt_count", attempts.len())
            .with("acknowledged_count", acknowledged.len())
            .with("ok_count", ok.len())
            .with("lost_count", lost.len())
            .with("recovered_count", recovered.len())
            .with("unexpected_count", unexpected.len())
            .with("lost", values(&lost))
            .with("recovered", values(&recovered))
            .with("unexpected", values(&unexpected)))
    }
}

/// Options for [`set_full`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SetFullOptions {
    /// When set, a read that misses an element already known to be present
    /// (a stale read) invalidates the history even if the element turns up
    /// again later.
    pub linearizable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Outcome {
    Stable,
    Lost,
    NeverRead,
}

struct SetFull {
    options: SetFullOptions,
}

/// A finer-grained set checker tracking each element's timeline across
/// every read, not just the final one. Elements come out `stable`, `lost`,
/// or `never_read`; stale reads are reported, and latency quantiles show
/// how long elements took to settle.
pub fn set_full(options: SetFullOptions) -> Box<dyn Checker> {
    Box::new(SetFull { options })
}

struct ReadWindow {
    invoke_time: i64,
    elements: BTreeMap<String, ()>,
}

struct Element {
    value: Value,
    add_invoke_time: i64,
    add_ok_time: Option<i64>,
}

fn op_time(op: &Op) -> i64 {
    op.time.unwrap_or(0)
}

impl Checker for SetFull {
    fn check(&self, _test: &Test, history: &History, _opts: &CheckOpts) -> CheckerResult {
        let mut elements: BTreeMap<String, Element> = BTreeMap::new();
        let mut reads: Vec<ReadWindow> = Vec::new();

        for (invoke_pos, complete_pos) in history.pairs() {
            let invoke = &history[invoke_pos];
            let Some(complete_pos) = complete_pos else { continue };
            let complete = &history[complete_pos];
            match invoke.f.as_deref() {
                Some("add") => {
                    let Some(v) = &invoke.value else { continue };
                    let e = elements.entry(vkey(v)).or_insert_with(|| Element {
                        value: v.clone(),
                        add_invoke_time: op_time(invoke),
                        add_ok_time: None,
                    });
                    if complete.kind == Kind::Ok {
                        e.add_ok_time = Some(op_time(complete));
                    }
                }
                Some("read") if complete.kind == Kind::Ok => {
                    if let Some(Value::Array(vs)) = &complete.value {
                        reads.push(ReadWindow {
                            invoke_time: op_time(invoke),
                            elements: vs.iter().map(|v| (vkey(v), ())).collect(),
                        });
                    }
                }
                _ => {}
            }
        }

        if reads.is_empty() {
            return Ok(CheckResult::new(Validity::Unknown)
                .with("error", "no known read of the set"));
        }
        reads.sort_by_key(|r| r.invoke_time);

        let mut counts: BTreeMap<Outcome, usize> = BTreeMap::new();
        let mut lost: Vec<Value> = Vec::new();
        let mut stale: Vec<Value> = Vec::new();
        let mut stable_latencies: Vec<i64> = Vec::new();
        let mut lost_latencies: Vec<i64> = Vec::new();

        for (key, element) in &elements {
            // The element is known present from its acknowledged add, or
            // from the first read that surfaces it.
            let first_seen = reads
                .iter()
                .find(|r| r.elements.contains_key(key))
                .map(|r| r.invoke_time);
            let known_time = match (element.add_ok_time, first_seen) {
                (Some(a), Some(b)) => a.min(b),
                (Some(a), None) => a,
                (None, Some(b)) => b,
                // Indeterminate add, never surfaced: nothing to judge.
                (None, None) => {
                    *counts.entry(Outcome::NeverRead).or_default() += 1;
                    continue;
                }
            };

            let after: Vec<&ReadWindow> = reads
                .iter()
                .filter(|r| r.invoke_time >= known_time)
                .collect();
            if after.is_empty() {
                *counts.entry(Outcome::NeverRead).or_default() += 1;
                continue;
            }

            let last_present = after
                .iter()
                .filter(|r| r.elements.contains_key(key))
                .map(|r| r.invoke_time)
                .max();
            let last_absent = after
                .iter()
                .filter(|r| !r.elements.contains_key(key))
                .map(|r| r.invoke_time)
                .max();

            let outcome = match (last_present, last_absent) {
                (None, _) => Outcome::Lost,
                (Some(_), None) => Outcome::Stable,
                (Some(p), Some(a)) if p > a => Outcome::Stable,
                _ => Outcome::Lost,
            };
            *counts.entry(outcome).or_default() += 1;

            match outcome {
                Outcome::Stable => {
                    // A read in the middle that missed the element saw stale
                    // state.
                    if last_absent.is_some() {
                        stale.push(element.value.clone());
                    }
                    let stable_time = after
                        .iter()
                        .filter(|r| {
                            r.elements.contains_key(key)
                                && last_absent.map_or(true, |a| r.invoke_time > a)
                        })
                        .map(|r| r.invoke_time)
                        .min()
                        .unwrap_or(known_time);
                    stable_latencies.push((stable_time - element.add_invoke_time).max(0));
                }
                Outcome::Lost => {
                    lost.push(element.value.clone());
                    let lost_time = last_absent.unwrap_or(known_time);
                    lost_latencies.push((lost_time - element.add_invoke_time).max(0));
                }
                Outcome::NeverRead => {}
            }
        }

        let lost_count = counts.get(&Outcome::Lost).copied().unwrap_or(0);
        let valid = if lost_count > 0 {
            Validity::Invalid
        } else if self.options.linearizable && !stale.is_empty() {
            Validity::Invalid
        } else {
            Validity::Valid
        };

        Ok(CheckResult::new(valid)
            .with("attempt_count", elements.len())
            .with(
                "stable_count",
                counts.get(&Outcome::Stable).copied().unwrap_or(0),
            )
            .with("lost_count", lost_count)
            .with(
                "never_read_count",
                counts.get(&Outcome::NeverRead).copied().unwrap_or(0),
            )
            .with("stale_count", stale.len())
            .with("stale", stale)
            .with("lost", lost)
            .with("stable_latencies", quantile_map(&mut stable_latencies))
            .with("lost_latencies", quantile_map(&mut lost_latencies)))
    }
}

/// Latency quantiles in milliseconds at the conventional points.
fn quantile_map(latencies: &mut Vec<i64>) -> Value {
    latencies.sort_unstable();
    let mut out = Map::new();
    if latencies.is_empty() {
        return Value::Object(out);
    }
    for (label, q) in [
        ("0", 0.0),
        ("0.5", 0.5),
        ("0.95", 0.95),
        ("0.99", 0.99),
        ("1", 1.0),
    ] {
        let idx = ((latencies.len() - 1) as f64 * q).round() as usize;
        let ms = latencies[idx] as f64 / 1e6;
        out.insert(label.to_string(), Value::from(ms));
    }
    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use faultline_core::Process;
    use serde_json::json;

    fn journaled(ops: Vec<Op>) -> History {
        let mut out = Vec::new();
        for (i, mut op) in ops.into_iter().enumerate() {
            op.index = Some(i as i64);
            if op.time.is_none() {
                op.time = Some(i as i64 * 1_000_000);
            }
            out.push(op);
        }
        History::from(out)
    }

    fn add(v: i64) -> Op {
        Op::invoke_v("add", v).with_process(Process::Id(0))
    }

    fn read(vs: Value) -> Op {
        Op::invoke("read").with_process(Process::Id(1)).with_value(vs)
    }

    #[test]
    fn test_set_loses_unread_ack() {
        // S1: both adds acknowledged, final read contains only 1.
        let h = journaled(vec![
            add(1),
            add(1).complete(Kind::Ok),
            add(2),
            add(2).complete(Kind::Ok),
            read(json!(null)),
            read(json!([1])).complete(Kind::Ok),
        ]);
        let result = set()
            .check(&Test::new("t", 2), &h, &CheckOpts::new())
            .unwrap();
        assert_eq!(result.valid, Validity::Invalid);
        assert_eq!(result.field("lost"), Some(&json!([2])));
        assert_eq!(result.field("unexpected"), Some(&json!([])));
        assert_eq!(result.field("ok_count"), Some(&json!(1)));
    }

    #[test]
    fn test_set_round_trip_valid() {
        let h = journaled(vec![
            add(1),
            add(1).complete(Kind::Ok),
            add(2),
            add(2).complete(Kind::Ok),
            read(json!(null)),
            read(json!([1, 2])).complete(Kind::Ok),
        ]);
        let result = set()
            .check(&Test::new("t", 2), &h, &CheckOpts::new())
            .unwrap();
        assert_eq!(result.valid, Validity::Valid);
        assert_eq!(result.field("lost"), Some(&json!([])));
        assert_eq!(result.field("unexpected"), Some(&json!([])));
    }

    #[test]
    fn test_set_unexpected_and_recovered() {
        let h = journaled(vec![
            add(1),
            add(1).complete(Kind::Info),
            read(json!(null)),
            read(json!([1, 9])).complete(Kind::Ok),
        ]);
        let result = set()
            .check(&Test::new("t", 2), &h, &CheckOpts::new())
            .unwrap();
        // 9 was never attempted; 1 was indeterminate but surfaced.
        assert_eq!(result.valid, Validity::Invalid);
        assert_eq!(result.field("unexpected"), Some(&json!([9])));
        assert_eq!(result.field("recovered"), Some(&json!([1])));
    }

    #[test]
    fn test_set_unknown_without_read() {
        let h = journaled(vec![add(1), add(1).complete(Kind::Ok)]);
        let result = set()
            .check(&Test::new("t", 2), &h, &CheckOpts::new())
            .unwrap();
        assert_eq!(result.valid, Validity::Unknown);
    }

    #[test]
    fn test_set_full_stable_and_lost() {
        let h = journaled(vec![
            add(1),
            add(1).complete(Kind::Ok),
            add(2),
            add(2).complete(Kind::Ok),
            read(json!(null)),
            read(json!([1])).complete(Kind::Ok),
            read(json!(null)),
            read(json!([1])).complete(Kind::Ok),
        ]);
        let result = set_full(SetFullOptions::default())
            .check(&Test::new("t", 2), &h, &CheckOpts::new())
            .unwrap();
        assert_eq!(result.valid, Validity::Invalid);
        assert_eq!(result.field("stable_count"), Some(&json!(1)));
        assert_eq!(result.field("lost_count"), Some(&json!(1)));
        assert_eq!(result.field("lost"), Some(&json!([2])));
    }

    #[test]
    fn test_set_full_stale_read_linearizable() {
        // Element 1 acked, missing from the first read, back in the second:
        // fine for an eventually consistent set, fatal under linearizable.
        let ops = vec![
            add(1),
            add(1).complete(Kind::Ok),
            read(json!(null)),
            read(json!([])).complete(Kind::Ok),
            read(json!(null)),
            read(json!([1])).complete(Kind::Ok),
        ];
        let h = journaled(ops);
        let relaxed = set_full(SetFullOptions::default())
            .check(&Test::new("t", 2), &h, &CheckOpts::new())
            .unwrap();
        assert_eq!(relaxed.valid, Validity::Valid);
        assert_eq!(relaxed.field("stale"), Some(&json!([1])));

        let strict = set_full(SetFullOptions { linearizable: true })
            .check(&Test::new("t", 2), &h, &CheckOpts::new())
            .unwrap();
        assert_eq!(strict.valid, Validity::Invalid);
    }
}
