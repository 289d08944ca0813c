//! Per-query runtime state and the function plugin contract.

use compact_str::CompactString;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::sequence::{Sequence, Value};

/// Machine-checkable classification of evaluation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A `$variable` reference with no binding in scope.
    UndefinedVariable,
    /// A call to a function name with no registration.
    UnknownFunction,
    /// An `import` declaration the caller provided no implementation for.
    UnresolvedImport,
    /// A relative step or predicate evaluated without an established focus.
    MissingFocus,
    /// A reverse step or structural edit that would cross the tree root.
    RootConstraint,
    /// A function applied to arguments it cannot work with.
    InvalidArgument,
    /// The engine was asked for something its current state cannot provide.
    InvalidState,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UndefinedVariable => "undefined variable",
            ErrorKind::UnknownFunction => "unknown function",
            ErrorKind::UnresolvedImport => "unresolved import",
            ErrorKind::MissingFocus => "missing focus",
            ErrorKind::RootConstraint => "root constraint",
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::InvalidState => "invalid state",
        }
    }
}

/// An evaluation failure. Aborts the current `run`; the engine does not
/// retry or recover internally.
#[derive(Debug, Clone, thiserror::Error)]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
    /// Query source line of the offending node, where known.
    pub line: Option<u32>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            line: None,
        }
    }

    pub fn at_line(kind: ErrorKind, message: impl Into<String>, line: u32) -> Self {
        Self {
            kind,
            message: message.into(),
            line: Some(line),
        }
    }

    pub fn undefined_variable(name: &str, line: u32) -> Self {
        Self::at_line(
            ErrorKind::UndefinedVariable,
            format!("variable ${name} not initialized"),
            line,
        )
    }

    pub fn unknown_function(name: &str, line: u32) -> Self {
        Self::at_line(
            ErrorKind::UnknownFunction,
            format!("function {name} not found"),
            line,
        )
    }

    pub fn unresolved_import(name: &str, line: u32) -> Self {
        Self::at_line(
            ErrorKind::UnresolvedImport,
            format!("no implementation provided for imported function {name}"),
            line,
        )
    }

    pub fn missing_focus(line: Option<u32>) -> Self {
        Self {
            kind: ErrorKind::MissingFocus,
            message: "attempted to evaluate a path expression without focus".to_string(),
            line,
        }
    }

    pub fn no_parent(line: u32) -> Self {
        Self::at_line(ErrorKind::RootConstraint, "item has no parent", line)
    }

    pub fn root_edit(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RootConstraint, message)
    }

    pub fn invalid_argument(function: &str, message: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::InvalidArgument,
            format!("{function}: {}", message.into()),
        )
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidState, message)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "error, line {line}: {}", self.message),
            None => write!(f, "error: {}", self.message),
        }
    }
}

type Frame = HashMap<CompactString, Sequence>;

/// The run-time environment of one query: lexical scope frames for
/// `let`/`for` bindings and the focus stack for path evaluation.
///
/// Every push is paired with a pop on the same control path; scope-bounded
/// evaluation captures the body result before propagating errors so frames
/// cannot leak.
#[derive(Debug, Default)]
pub struct Environment {
    frames: SmallVec<[Frame; 4]>,
    focus: SmallVec<[Sequence; 8]>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_scope(&mut self) {
        self.frames.push(Frame::default());
    }

    pub fn pop_scope(&mut self) {
        self.frames.pop();
    }

    /// Bind `name` in the innermost frame, opening one if none exists.
    pub fn set_variable(&mut self, name: &str, value: Sequence) {
        if self.frames.is_empty() {
            self.push_scope();
        }
        if let Some(frame) = self.frames.last_mut() {
            frame.insert(name.into(), value);
        }
    }

    /// Look `name` up from the innermost frame outwards.
    pub fn variable(&self, name: &str) -> Option<&Sequence> {
        self.frames.iter().rev().find_map(|frame| frame.get(name))
    }

    pub fn push_focus(&mut self, focus: Sequence) {
        self.focus.push(focus);
    }

    pub fn pop_focus(&mut self) -> Option<Sequence> {
        self.focus.pop()
    }

    pub fn peek_focus(&self) -> Option<&Sequence> {
        self.focus.last()
    }

    /// Swap the top of the focus stack, used by predicate filtering.
    pub fn replace_focus(&mut self, focus: Sequence) {
        self.focus.pop();
        self.focus.push(focus);
    }
}

/// The contract for functions callable from queries.
///
/// Built-ins implement this, and callers can provide further implementations
/// either directly ([`crate::Engine::register_function`]) or as the
/// capability pool that query `import` declarations draw from
/// ([`crate::Engine::register_external`]).
pub trait XformFunction: Send + Sync {
    /// The name the function is callable under.
    fn name(&self) -> &str;

    /// Apply the function to its already-evaluated arguments. Each argument
    /// is a [`Value`] exactly as the corresponding expression produced it.
    fn apply(&self, args: &[Value]) -> Result<Value, Error>;
}

/// Name → implementation table for one engine.
///
/// Constructed once per engine from the built-in set; `import` declarations
/// extend it for the lifetime of the engine, so registrations accumulate
/// across runs.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<dyn XformFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under the implementation's self-reported name, replacing any
    /// previous registration.
    pub fn register(&mut self, function: Arc<dyn XformFunction>) {
        self.functions.insert(function.name().to_string(), function);
    }

    pub fn resolve(&self, name: &str) -> Option<&Arc<dyn XformFunction>> {
        self.functions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.functions.keys()).finish()
    }
}
