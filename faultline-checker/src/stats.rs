//! Completion statistics, overall and per operation family.

use crate::{CheckOpts, CheckResult, Checker, CheckerResult, Validity};
use faultline_core::{History, Kind, Process, Test};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Default, Clone, Serialize)]
struct Counts {
    count: u64,
    ok_count: u64,
    fail_count: u64,
    info_count: u64,
}

impl Counts {
    fn record(&mut self, kind: Kind) {
        self.count += 1;
        match kind {
            Kind::Ok => self.ok_count += 1,
            Kind::Fail => self.fail_count += 1,
            Kind::Info => self.info_count += 1,
            _ => {}
        }
    }
}

struct Stats;

/// Counts ok/fail/info completions overall and per `f`. The verdict is
/// `Unknown` when some family never succeeded: that usually means the test
/// exercised nothing, not that the system misbehaved.
pub fn stats() -> Box<dyn Checker> {
    Box::new(Stats)
}

impl Checker for Stats {
    fn check(&self, _test: &Test, history: &History, _opts: &CheckOpts) -> CheckerResult {
        let mut total = Counts::default();
        let mut by_f: BTreeMap<String, Counts> = BTreeMap::new();

        // Nemesis completions are always info; counting them would demote
        // every faulted run to unknown.
        for op in history.completions() {
            if op.process == Some(Process::Nemesis) {
                continue;
            }
            total.record(op.kind);
            let f = op.f.clone().unwrap_or_default();
            by_f.entry(f).or_default().record(op.kind);
        }

        let valid = if by_f.values().all(|c| c.ok_count > 0) {
            Validity::Valid
        } else {
            Validity::Unknown
        };

        let mut result = CheckResult::new(valid)
            .with("count", total.count)
            .with("ok_count", total.ok_count)
            .with("fail_count", total.fail_count)
            .with("info_count", total.info_count);
        let by_f_value: BTreeMap<&String, Value> = by_f
            .iter()
            .map(|(f, c)| (f, serde_json::to_value(c).unwrap_or(Value::Null)))
            .collect();
        result = result.with(
            "by_f",
            serde_json::to_value(by_f_value).unwrap_or(Value::Null),
        );
        Ok(result)
    }
}
