//! Declarative query and rewrite engine for generic abstract syntax trees.
//!
//! The engine consumes an already-parsed [`Query`] together with a source
//! [`GNode`] tree, evaluates path expressions, predicates, set operators,
//! binding forms, and mutation operators against a mutable shadow of the
//! tree, and returns the results. After a mutating run, the transformed AST
//! is available via [`Engine::ast_root`].

pub mod engine;
pub mod functions;
pub mod item;
pub mod query;
pub mod runtime;
pub mod sequence;
pub mod tree;

pub use engine::{Engine, Output};
pub use item::Item;
pub use query::{Binding, Expr, FunctionCall, Import, ItemTest, PathAnchor, Query, StepOp};
pub use runtime::{Environment, Error, ErrorKind, FunctionRegistry, XformFunction};
pub use sequence::{Sequence, Value};
pub use tree::{GNode, GValue, Location};
