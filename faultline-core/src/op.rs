//! History elements: operations, their kinds, and process identity.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The kind of a history element.
///
/// `Invoke` opens an operation; `Ok`, `Fail`, and `Info` close one. `Info`
/// means the operation's effect is indeterminate: it may or may not have
/// taken place, and the invoking process identifier is retired. `Sleep` and
/// `Log` are scheduling pseudo-ops executed by a worker but never journaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Invoke,
    Ok,
    Fail,
    Info,
    Sleep,
    Log,
}

impl Kind {
    /// Completion kinds close a previously invoked operation.
    pub fn is_completion(self) -> bool {
        matches!(self, Kind::Ok | Kind::Fail | Kind::Info)
    }

    /// Whether ops of this kind are journaled into the history.
    pub fn journaled(self) -> bool {
        !matches!(self, Kind::Sleep | Kind::Log)
    }
}

/// A logical actor in the history.
///
/// Client processes are integers; the fault injector is `Nemesis`. A process
/// executes at most one operation at a time, and a retired process number is
/// never reused: when thread `t`'s process ends in `Info`, the thread is
/// reassigned process `p + concurrency`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Process {
    #[serde(rename = "nemesis")]
    Nemesis,
    #[serde(untagged)]
    Id(i64),
}

impl Process {
    /// The worker thread that speaks for this process.
    pub fn thread(self, concurrency: usize) -> Thread {
        match self {
            Process::Nemesis => Thread::Nemesis,
            Process::Id(p) => Thread::Client((p.rem_euclid(concurrency as i64)) as usize),
        }
    }
}

impl std::fmt::Display for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Process::Nemesis => write!(f, "nemesis"),
            Process::Id(p) => write!(f, "{}", p),
        }
    }
}

/// A physical worker identity: one of `concurrency` client threads, or the
/// dedicated nemesis thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Thread {
    #[serde(rename = "nemesis")]
    Nemesis,
    #[serde(untagged)]
    Client(usize),
}

impl Thread {
    pub fn is_nemesis(self) -> bool {
        matches!(self, Thread::Nemesis)
    }
}

/// A single history element.
///
/// `index` and `time` are assigned by the scheduler when the op is journaled;
/// generators emit ops with both unset (or with `time` in the future to
/// schedule ahead). `ext` carries arbitrary user fields and round-trips
/// through serialization flattened into the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Op {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub index: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub time: Option<i64>,
    pub kind: Kind,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub process: Option<Process>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub f: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    #[serde(flatten, default)]
    pub ext: Map<String, Value>,
}

impl Op {
    /// A bare op of the given kind with everything else unset.
    pub fn of_kind(kind: Kind) -> Self {
        Op {
            index: None,
            time: None,
            kind,
            process: None,
            f: None,
            value: None,
            error: None,
            ext: Map::new(),
        }
    }

    /// An invocation of operation family `f` with no value.
    pub fn invoke(f: impl Into<String>) -> Self {
        Op {
            f: Some(f.into()),
            ..Op::of_kind(Kind::Invoke)
        }
    }

    /// An invocation of `f` carrying `value`.
    pub fn invoke_v(f: impl Into<String>, value: impl Into<Value>) -> Self {
        Op {
            value: Some(value.into()),
            ..Op::invoke(f)
        }
    }

    /// A `Sleep` pseudo-op pausing the owning worker for `seconds`.
    pub fn sleep(seconds: f64) -> Self {
        Op {
            value: Some(Value::from(seconds)),
            ..Op::of_kind(Kind::Sleep)
        }
    }

    /// A `Log` pseudo-op emitting `message` through the worker's logger.
    pub fn log(message: impl Into<String>) -> Self {
        Op {
            value: Some(Value::from(message.into())),
            ..Op::of_kind(Kind::Log)
        }
    }

    pub fn with_value(mut self, value: impl Into<Value>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_process(mut self, process: Process) -> Self {
        self.process = Some(process);
        self
    }

    pub fn with_time(mut self, time: i64) -> Self {
        self.time = Some(time);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// The completion of this invocation with the given kind, preserving
    /// `f`, `process`, and `value`.
    pub fn complete(&self, kind: Kind) -> Self {
        debug_assert!(kind.is_completion());
        Op {
            index: None,
            time: None,
            kind,
            ..self.clone()
        }
    }

    pub fn is_invoke(&self) -> bool {
        self.kind == Kind::Invoke
    }

    pub fn is_completion(&self) -> bool {
        self.kind.is_completion()
    }

    /// Whether this op belongs to the given operation family.
    pub fn f_is(&self, f: &str) -> bool {
        self.f.as_deref() == Some(f)
    }
}
