//! Checkers consume a completed [`History`] and judge it: valid, invalid,
//! or unknown. Combinators compose small checkers into a verdict for a
//! whole test.
//!
//! Validity combines by severity: an invalid sub-result dominates unknown,
//! which dominates valid. Checkers are pure analysis; anything that throws
//! is demoted to `Unknown` by [`check_safe`] rather than taking down the
//! other checkers in a composite.

pub mod counter;
pub mod error;
pub mod linearizable;
pub mod queue;
pub mod semaphore;
pub mod set;
pub mod stats;
pub mod unique;

use faultline_core::{History, Test};
use rayon::prelude::*;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

pub use counter::counter;
pub use error::CheckerError;
pub use linearizable::{linearizable, Analysis, Analyzer};
pub use queue::total_queue;
pub use semaphore::FifoSemaphore;
pub use set::{set, set_full, SetFullOptions};
pub use stats::stats;
pub use unique::unique_ids;

/// A checker's verdict. Combination severity: `Invalid > Unknown > Valid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    Valid,
    Unknown,
    Invalid,
}

impl Validity {
    /// Combines two verdicts, keeping the more severe.
    pub fn and(self, other: Validity) -> Validity {
        use Validity::*;
        match (self, other) {
            (Invalid, _) | (_, Invalid) => Invalid,
            (Unknown, _) | (_, Unknown) => Unknown,
            (Valid, Valid) => Valid,
        }
    }

    pub fn is_valid(self) -> bool {
        self == Validity::Valid
    }

    /// `true` when the outcome is definitely valid, `false` when definitely
    /// not.
    pub fn from_bool(ok: bool) -> Validity {
        if ok {
            Validity::Valid
        } else {
            Validity::Invalid
        }
    }
}

// Serialized as `true` / `false` / `"unknown"` so result JSON reads
// naturally.
impl Serialize for Validity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Validity::Valid => serializer.serialize_bool(true),
            Validity::Invalid => serializer.serialize_bool(false),
            Validity::Unknown => serializer.serialize_str("unknown"),
        }
    }
}

impl<'de> Deserialize<'de> for Validity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Bool(true) => Ok(Validity::Valid),
            Value::Bool(false) => Ok(Validity::Invalid),
            Value::String(s) if s == "unknown" => Ok(Validity::Unknown),
            other => Err(D::Error::custom(format!("not a validity: {}", other))),
        }
    }
}

/// The outcome of one checker: a verdict plus named diagnostic fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub valid: Validity,
    #[serde(flatten, default)]
    pub fields: Map<String, Value>,
}

impl CheckResult {
    pub fn new(valid: Validity) -> Self {
        CheckResult {
            valid,
            fields: Map::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Options passed through to checkers.
pub type CheckOpts = Map<String, Value>;

/// Result alias for checker runs.
pub type CheckerResult = Result<CheckResult, CheckerError>;

/// Judges a completed history.
pub trait Checker: Send + Sync {
    fn check(&self, test: &Test, history: &History, opts: &CheckOpts) -> CheckerResult;
}

struct FnChecker<F>(F);

impl<F> Checker for FnChecker<F>
where
    F: Fn(&Test, &History, &CheckOpts) -> CheckerResult + Send + Sync,
{
    fn check(&self, test: &Test, history: &History, opts: &CheckOpts) -> CheckerResult {
        (self.0)(test, history, opts)
    }
}

/// Wraps a plain function as a checker.
pub fn from_fn<F>(f: F) -> Box<dyn Checker>
where
    F: Fn(&Test, &History, &CheckOpts) -> CheckerResult + Send + Sync + 'static,
{
    Box::new(FnChecker(f))
}

/// A checker that always passes and reports nothing.
pub fn noop() -> Box<dyn Checker> {
    from_fn(|_, _, _| Ok(CheckResult::new(Validity::Valid)))
}

/// Ignores the history entirely and declares victory. For dry runs.
pub fn unbridled_optimism() -> Box<dyn Checker> {
    from_fn(|_, _, _| Ok(CheckResult::new(Validity::Valid)))
}

/// Runs `checker`, demoting errors and panics to an `Unknown` verdict
/// carrying the failure text.
pub fn check_safe(checker: Box<dyn Checker>) -> Box<dyn Checker> {
    Box::new(CheckSafe { checker })
}

struct CheckSafe {
    checker: Box<dyn Checker>,
}

impl Checker for CheckSafe {
    fn check(&self, test: &Test, history: &History, opts: &CheckOpts) -> CheckerResult {
        let outcome = catch_unwind(AssertUnwindSafe(|| self.checker.check(test, history, opts)));
        let error = match outcome {
            Ok(Ok(result)) => return Ok(result),
            Ok(Err(e)) => e.to_string(),
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "checker panicked".to_string());
                format!("panic: {}", msg)
            }
        };
        tracing::warn!(error = %error, "checker crashed; reporting unknown");
        Ok(CheckResult::new(Validity::Unknown).with("error", error))
    }
}

/// Composes named checkers. Sub-checkers run in parallel, each behind
/// [`check_safe`]; the composite verdict is the most severe sub-verdict,
/// and each sub-result appears under its name in `results`.
pub fn compose(checkers: Vec<(String, Box<dyn Checker>)>) -> Box<dyn Checker> {
    Box::new(Compose {
        checkers: checkers
            .into_iter()
            .map(|(name, c)| (name, check_safe(c)))
            .collect(),
    })
}

struct Compose {
    checkers: Vec<(String, Box<dyn Checker>)>,
}

impl Checker for Compose {
    fn check(&self, test: &Test, history: &History, opts: &CheckOpts) -> CheckerResult {
        let results: Vec<(String, CheckResult)> = self
            .checkers
            .par_iter()
            .map(|(name, checker)| {
                let result = match checker.check(test, history, opts) {
                    Ok(r) => r,
                    // check_safe already absorbs failures; this arm only
                    // fires for a checker composed without it.
                    Err(e) => CheckResult::new(Validity::Unknown).with("error", e.to_string()),
                };
                (name.clone(), result)
            })
            .collect();

        let valid = results
            .iter()
            .fold(Validity::Valid, |acc, (_, r)| acc.and(r.valid));
        let mut sub = Map::new();
        for (name, result) in results {
            sub.insert(name, result.to_value());
        }
        Ok(CheckResult::new(valid).with("results", Value::Object(sub)))
    }
}

/// Bounds how many concurrent `check` calls may run inside `checker`,
/// arbitrated by a FIFO semaphore so waiting callers are served in arrival
/// order.
pub fn concurrency_limit(limit: usize, checker: Box<dyn Checker>) -> Box<dyn Checker> {
    Box::new(ConcurrencyLimit {
        semaphore: Arc::new(FifoSemaphore::new(limit)),
        checker,
    })
}

struct ConcurrencyLimit {
    semaphore: Arc<FifoSemaphore>,
    checker: Box<dyn Checker>,
}

impl Checker for ConcurrencyLimit {
    fn check(&self, test: &Test, history: &History, opts: &CheckOpts) -> CheckerResult {
        let _permit = self.semaphore.acquire();
        self.checker.check(test, history, opts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn fixed(valid: Validity) -> Box<dyn Checker> {
        from_fn(move |_, _, _| Ok(CheckResult::new(valid)))
    }

    fn failing() -> Box<dyn Checker> {
        from_fn(|_, _, _| Err(CheckerError::Failed("boom".to_string())))
    }

    #[test_case(Validity::Valid, Validity::Valid => Validity::Valid)]
    #[test_case(Validity::Valid, Validity::Unknown => Validity::Unknown)]
    #[test_case(Validity::Unknown, Validity::Invalid => Validity::Invalid)]
    #[test_case(Validity::Valid, Validity::Invalid => Validity::Invalid)]
    #[test_case(Validity::Invalid, Validity::Invalid => Validity::Invalid)]
    fn test_validity_priority(a: Validity, b: Validity) -> Validity {
        a.and(b)
    }

    #[test]
    fn test_validity_serde() {
        assert_eq!(serde_json::to_value(Validity::Valid).unwrap(), Value::Bool(true));
        assert_eq!(
            serde_json::to_value(Validity::Unknown).unwrap(),
            Value::String("unknown".into())
        );
        let v: Validity = serde_json::from_value(Value::Bool(false)).unwrap();
        assert_eq!(v, Validity::Invalid);
    }

    #[test]
    fn test_compose_takes_most_severe() {
        let test = Test::new("t", 1);
        let history = History::new();
        let composite = compose(vec![
            ("a".to_string(), fixed(Validity::Valid)),
            ("b".to_string(), fixed(Validity::Unknown)),
            ("c".to_string(), fixed(Validity::Invalid)),
        ]);
        let result = composite.check(&test, &history, &CheckOpts::new()).unwrap();
        assert_eq!(result.valid, Validity::Invalid);
        let subs = result.field("results").unwrap();
        assert_eq!(subs["a"]["valid"], Value::Bool(true));
        assert_eq!(subs["c"]["valid"], Value::Bool(false));
    }

    #[test]
    fn test_compose_absorbs_errors() {
        let test = Test::new("t", 1);
        let history = History::new();
        let composite = compose(vec![
            ("good".to_string(), fixed(Validity::Valid)),
            ("bad".to_string(), failing()),
        ]);
        let result = composite.check(&test, &history, &CheckOpts::new()).unwrap();
        assert_eq!(result.valid, Validity::Unknown);
        let subs = result.field("results").unwrap();
        assert!(subs["bad"]["error"].as_str().unwrap().contains("boom"));
    }

    #[test]
    fn test_check_safe_catches_panic() {
        let test = Test::new("t", 1);
        let history = History::new();
        let panicky: Box<dyn Checker> = from_fn(|_, _, _| panic!("kaboom"));
        let result = check_safe(panicky)
            .check(&test, &history, &CheckOpts::new())
            .unwrap();
        assert_eq!(result.valid, Validity::Unknown);
        assert!(result.field("error").unwrap().as_str().unwrap().contains("kaboom"));
    }

    #[test]
    fn test_concurrency_limit_passes_through() {
        let test = Test::new("t", 1);
        let history = History::new();
        let limited = concurrency_limit(2, fixed(Validity::Valid));
        let result = limited.check(&test, &history, &CheckOpts::new()).unwrap();
        assert!(result.valid.is_valid());
    }
}
