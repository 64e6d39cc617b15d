//! Wrappers the scheduler installs around the root generator: op-contract
//! validation and error annotation.

use crate::{boxed, Emit, Generator, GeneratorError, OpResult, UpdateResult};
use faultline_core::{Context, Kind, Op, Test};
use std::sync::Arc;

/// Renders contract violations into a message. Pluggable so embedders with
/// their own reporting conventions can swap the wording without touching
/// validation itself.
pub type ViolationFormatter = Arc<dyn Fn(&[String], &Op) -> Vec<String> + Send + Sync>;

fn default_formatter(violations: &[String], _op: &Op) -> Vec<String> {
    violations.to_vec()
}

/// Enforces the emission contract on every op produced by the wrapped
/// generator: completion kinds are never emitted, named processes must be
/// free, times may not precede the context, and invocations carry an `f`.
#[derive(Clone)]
pub struct Validate {
    gen: Box<dyn Generator>,
    format: ViolationFormatter,
}

/// Validates every op emitted by `gen`.
pub fn validate(gen: impl Generator + 'static) -> Validate {
    Validate {
        gen: boxed(gen),
        format: Arc::new(default_formatter),
    }
}

impl Validate {
    pub fn with_formatter(mut self, format: ViolationFormatter) -> Self {
        self.format = format;
        self
    }

    fn violations(op: &Op, ctx: &Context) -> Vec<String> {
        let mut violations = Vec::new();
        if !matches!(op.kind, Kind::Invoke | Kind::Info | Kind::Sleep | Kind::Log) {
            violations.push(format!(
                "kind {:?} is not one of invoke, info, sleep, log",
                op.kind
            ));
        }
        if let Some(process) = op.process {
            match ctx.process_thread(process) {
                Some(thread) if ctx.is_free(thread) => {}
                Some(_) => violations.push(format!("process {} is not free", process)),
                None => violations.push(format!(
                    "process {} does not belong to any live thread",
                    process
                )),
            }
        }
        if let Some(t) = op.time {
            if t < ctx.time() {
                violations.push(format!(
                    "time {} is earlier than the context time {}",
                    t,
                    ctx.time()
                ));
            }
        }
        if op.kind == Kind::Invoke && op.f.is_none() {
            violations.push("invoke op without an f".to_string());
        }
        violations
    }
}

impl std::fmt::Debug for Validate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Validate").field("gen", &self.gen).finish_non_exhaustive()
    }
}

impl Generator for Validate {
    fn op(&self, test: &Test, ctx: &Context) -> OpResult {
        match self.gen.op(test, ctx)? {
            None => Ok(None),
            Some((emit, gen)) => {
                if let Emit::Op(op) = &emit {
                    let violations = Self::violations(op, ctx);
                    if !violations.is_empty() {
                        return Err(GeneratorError::InvalidOp {
                            violations: (self.format)(&violations, op),
                            op: Box::new(op.clone()),
                        });
                    }
                }
                Ok(Some((
                    emit,
                    boxed(Validate {
                        gen,
                        format: self.format.clone(),
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

/// Annotates any error from the wrapped generator with the generator's
/// rendering and the context in play, so a failure deep inside a combinator
/// stack is reconstructible from the error alone.
#[derive(Debug, Clone)]
pub struct WithContext {
    gen: Box<dyn Generator>,
}

/// Adds generator/context annotations to errors from `gen`.
pub fn with_context(gen: impl Generator + 'static) -> WithContext {
    WithContext { gen: boxed(gen) }
}

fn annotate(gen: &dyn std::fmt::Debug, ctx: &Context, source: GeneratorError) -> GeneratorError {
    // Avoid stacking annotations when errors bubble through nested wrappers.
    if matches!(source, GeneratorError::WithContext { .. }) {
        return source;
    }
    GeneratorError::WithContext {
        generator: format!("{:?}", gen),
        context: format!(
            "time={} free={}/{} threads",
            ctx.time(),
            ctx.free_thread_count(),
            ctx.all_thread_count()
        ),
        source: Box::new(source),
    }
}

impl Generator for WithContext {
    fn op(&self, test: &Test, ctx: &Context) -> OpResult {
        match self.gen.op(test, ctx) {
            Err(e) => Err(annotate(&self.gen, ctx, e)),
            Ok(None) => Ok(None),
            Ok(Some((emit, gen))) => Ok(Some((emit, boxed(WithContext { gen })))),
        }
    }

    fn update(self: Box<Self>, test: &Test, ctx: &Context, event: &Op) -> UpdateResult {
        let mut this = self;
        match this.gen.clone().update(test, ctx, event) {
            Err(e) => Err(annotate(&this.gen, ctx, e)),
            Ok(gen) => {
                this.gen = gen;
                Ok(this)
            }
        }
    }

    fn weight(&self, ctx: &Context) -> usize {
        self.gen.weight(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::repeat;
    use crate::testing::test_fixture;
    use faultline_core::Process;

    #[test]
    fn test_validate_passes_clean_ops() {
        let (test, ctx) = test_fixture(2);
        let gen = validate(repeat(Op::invoke("r")));
        match gen.op(&test, &ctx).unwrap() {
            Some((Emit::Op(op), _)) => assert!(op.f_is("r")),
            other => panic!("expected op, got {:?}", other.map(|(e, _)| e)),
        }
    }

    #[test]
    fn test_validate_rejects_completion_kind() {
        let (test, ctx) = test_fixture(2);
        let bad = Op::invoke("r")
            .complete(faultline_core::Kind::Ok)
            .with_process(Process::Id(0));
        let gen = validate(repeat(bad));
        match gen.op(&test, &ctx) {
            Err(GeneratorError::InvalidOp { violations, .. }) => {
                assert!(violations.iter().any(|v| v.contains("kind")));
            }
            other => panic!("expected invalid-op error, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn test_validate_rejects_busy_process() {
        let (test, ctx) = test_fixture(2);
        let ctx = ctx.busy_thread(0, faultline_core::Thread::Client(0));
        let gen = validate(repeat(Op::invoke("r").with_process(Process::Id(0))));
        assert!(gen.op(&test, &ctx).is_err());
    }

    #[test]
    fn test_validate_rejects_stale_time() {
        let (test, ctx) = test_fixture(2);
        let ctx = ctx.with_time(1_000_000);
        let gen = validate(repeat(Op::invoke("r").with_time(5)));
        assert!(gen.op(&test, &ctx).is_err());
    }

    #[test]
    fn test_with_context_annotates() {
        let (test, ctx) = test_fixture(2);
        let bad = Op::invoke("r")
            .complete(faultline_core::Kind::Fail)
            .with_process(Process::Id(0));
        let gen = with_context(validate(repeat(bad)));
        match gen.op(&test, &ctx) {
            Err(GeneratorError::WithContext { generator, context, .. }) => {
                assert!(generator.contains("Validate"));
                assert!(context.contains("free=3/3"));
            }
            other => panic!("expected annotated error, got {:?}", other.is_ok()),
        }
    }
}
