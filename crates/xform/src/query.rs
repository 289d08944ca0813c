//! Typed AST for XForm queries (types only; the textual grammar and its
//! parser live with the surrounding tooling and hand the engine this tree).
//!
//! The node-kind set is closed: the evaluator dispatches with a single
//! exhaustive `match`, so adding a kind is a compile-checked change.
//! Nodes whose evaluation can fail with a source-line diagnostic (variable
//! references, parent steps, function calls, imports) carry the line they
//! were parsed from.

/// A parsed query: optional import declarations followed by the body
/// expression. Input is expected to be stripped of formatting and comment
/// metadata by the parser.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub imports: Vec<Import>,
    pub body: Expr,
}

impl Query {
    pub fn new(body: Expr) -> Self {
        Self {
            imports: Vec::new(),
            body,
        }
    }

    pub fn with_imports(imports: Vec<Import>, body: Expr) -> Self {
        Self { imports, body }
    }
}

/// An `import` declaration naming an externally provided function.
#[derive(Debug, Clone, PartialEq)]
pub struct Import {
    pub name: String,
    pub line: u32,
}

impl Import {
    pub fn new(name: impl Into<String>, line: u32) -> Self {
        Self {
            name: name.into(),
            line,
        }
    }
}

/// One `$name in <source>` (or `$name := <source>`) binding.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub name: String,
    pub source: Expr,
}

impl Binding {
    pub fn new(name: impl Into<String>, source: Expr) -> Self {
        Self {
            name: name.into(),
            source,
        }
    }
}

/// A call to a registered function.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    pub args: Vec<Expr>,
    pub line: u32,
}

impl FunctionCall {
    pub fn new(name: impl Into<String>, args: Vec<Expr>, line: u32) -> Self {
        Self {
            name: name.into(),
            args,
            line,
        }
    }
}

/// How a path expression establishes its initial focus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathAnchor {
    /// `/`: start at the tree root.
    Root,
    /// `//`: consider every node of the tree, top-down.
    AllNodes,
    /// Reversed breadth-first order over the whole tree, leaf levels first.
    InsideOut,
    /// Continue from whatever the current focus is.
    Implicit,
}

/// The separator between two chained path segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOp {
    /// `/`: the next step works on the previous segment's result.
    Direct,
    /// `//`: the next step searches every node of the tree, top-down.
    Descend,
}

/// The per-step selection rule.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemTest {
    /// Child-name match, case-sensitive.
    Name(String),
    /// `*`
    Wildcard,
    /// `.`
    Current,
    /// `..`
    Parent { line: u32 },
    /// A quoted string literal, stored as written.
    Literal(String),
    /// `$name`
    Var { name: String, line: u32 },
    Call(FunctionCall),
    /// A parenthesized sub-expression.
    Expr(Box<Expr>),
}

impl ItemTest {
    pub fn name(name: impl Into<String>) -> Self {
        ItemTest::Name(name.into())
    }

    pub fn literal(raw: impl Into<String>) -> Self {
        ItemTest::Literal(raw.into())
    }

    pub fn var(name: impl Into<String>, line: u32) -> Self {
        ItemTest::Var {
            name: name.into(),
            line,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A comma-separated expression list; every element's value is pushed as
    /// focus for the elements after it.
    Compound(Vec<Expr>),
    Let {
        bindings: Vec<Binding>,
        body: Box<Expr>,
    },
    /// Cartesian-product iteration, rightmost binding fastest.
    For {
        bindings: Vec<Binding>,
        body: Box<Expr>,
    },
    /// Lock-step iteration, stopping with the shortest source.
    CFor {
        bindings: Vec<Binding>,
        body: Box<Expr>,
    },
    If {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    /// First non-empty operand, left to right.
    Or(Vec<Expr>),
    /// Concatenation of all operands, or the first empty one.
    And(Vec<Expr>),
    Union(Box<Expr>, Box<Expr>),
    Intersect(Box<Expr>, Box<Expr>),
    Difference(Box<Expr>, Box<Expr>),
    Replace {
        targets: Box<Expr>,
        replacements: Box<Expr>,
    },
    InsertBefore {
        insertions: Box<Expr>,
        targets: Box<Expr>,
    },
    InsertAfter {
        insertions: Box<Expr>,
        targets: Box<Expr>,
    },
    Remove {
        targets: Box<Expr>,
    },
    /// Append evaluated children to every target.
    Add {
        children: Box<Expr>,
        targets: Box<Expr>,
    },
    /// Wraps a template (`NewNode`, `Null`, or a string literal) into a
    /// singleton sequence.
    NewItem(Box<Expr>),
    /// A node template: a fresh composite node with evaluated children.
    NewNode {
        name: String,
        children: Vec<Expr>,
    },
    Null,
    /// A quoted string literal, stored as written.
    Str(String),
    Int(i64),
    Path {
        anchor: PathAnchor,
        expr: Box<Expr>,
    },
    /// Left-nested chain of path segments.
    RelPath {
        head: Box<Expr>,
        op: StepOp,
        tail: Box<Expr>,
    },
    Step {
        test: ItemTest,
        predicates: Vec<Expr>,
    },
}

impl Expr {
    pub fn step(test: ItemTest) -> Expr {
        Expr::Step {
            test,
            predicates: Vec::new(),
        }
    }

    pub fn step_with(test: ItemTest, predicates: Vec<Expr>) -> Expr {
        Expr::Step { test, predicates }
    }

    pub fn path(anchor: PathAnchor, expr: Expr) -> Expr {
        Expr::Path {
            anchor,
            expr: Box::new(expr),
        }
    }

    /// A single-step path: `anchor` + one test without predicates.
    pub fn select(anchor: PathAnchor, test: ItemTest) -> Expr {
        Expr::path(anchor, Expr::step(test))
    }

    pub fn chain(head: Expr, op: StepOp, tail: Expr) -> Expr {
        Expr::RelPath {
            head: Box::new(head),
            op,
            tail: Box::new(tail),
        }
    }
}
