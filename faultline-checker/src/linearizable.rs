//! Linearizability checking, delegated to an external analysis kernel.
//!
//! Deciding linearizability is NP-hard and lives outside this crate. The
//! checker here owns only the plumbing: it hands the history to an
//! [`Analyzer`] and reshapes the verdict into a [`CheckResult`].

use crate::{CheckOpts, CheckResult, Checker, CheckerError, CheckerResult, Validity};
use faultline_core::{History, Test};
use serde_json::Value;
use std::sync::Arc;

/// The outcome of a linearizability analysis.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub valid: Validity,
    /// Final reachable model configurations, or the point of divergence.
    pub configs: Value,
    /// The operation paths still viable at the end of the search.
    pub final_paths: Value,
}

/// An external decision procedure for linearizability.
pub trait Analyzer: Send + Sync {
    fn analyze(
        &self,
        test: &Test,
        history: &History,
        opts: &CheckOpts,
    ) -> Result<Analysis, CheckerError>;
}

struct Linearizable {
    analyzer: Arc<dyn Analyzer>,
}

/// Wraps an analysis kernel as a checker.
pub fn linearizable(analyzer: Arc<dyn Analyzer>) -> Box<dyn Checker> {
    Box::new(Linearizable { analyzer })
}

impl Checker for Linearizable {
    fn check(&self, test: &Test, history: &History, opts: &CheckOpts) -> CheckerResult {
        let analysis = self.analyzer.analyze(test, history, opts)?;
        Ok(CheckResult::new(analysis.valid)
            .with("configs", analysis.configs)
            .with("final_paths", analysis.final_paths))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FixedAnalyzer {
        valid: Validity,
    }

    impl Analyzer for FixedAnalyzer {
        fn analyze(
            &self,
            _test: &Test,
            _history: &History,
            _opts: &CheckOpts,
        ) -> Result<Analysis, CheckerError> {
            Ok(Analysis {
                valid: self.valid,
                configs: json!([{"model": {"value": 3}}]),
                final_paths: json!([]),
            })
        }
    }

    #[test]
    fn test_delegates_to_analyzer() {
        let checker = linearizable(Arc::new(FixedAnalyzer {
            valid: Validity::Invalid,
        }));
        let result = checker
            .check(&Test::new("t", 1), &History::new(), &CheckOpts::new())
            .unwrap();
        assert_eq!(result.valid, Validity::Invalid);
        assert!(result.field("configs").is_some());
        assert!(result.field("final_paths").is_some());
    }
}
