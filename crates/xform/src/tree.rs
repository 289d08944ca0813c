//! Generic abstract syntax tree shared by the engine and its callers.
//!
//! A tree is made of named composite nodes ([`GNode`]) whose ordered child
//! slots hold either another node, a plain string, or null ([`GValue`]).
//! Nodes are immutable and cheap to clone (`Arc`-backed); equality is handle
//! identity, so an unmodified query run can return the very same root it was
//! given. Structural comparison is available separately via
//! [`GNode::structural_eq`].
//!
//! Example:
//! ```
//! use xform::tree::node;
//!
//! // Program(Decl("x"), Decl("y"), Stmt())
//! let ast = node("Program")
//!     .child(node("Decl").child("x"))
//!     .child(node("Decl").child("y"))
//!     .child(node("Stmt"))
//!     .build();
//!
//! assert_eq!(ast.name(), "Program");
//! assert_eq!(ast.size(), 3);
//! ```

use compact_str::CompactString;
use std::fmt;
use std::sync::Arc;

/// Position of a node in its original source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub line: u32,
    pub column: u32,
}

impl Location {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)
    }
}

/// A child slot of a composite node: another node, a plain string, or null.
///
/// Node values compare by handle identity, text values by content.
#[derive(Debug, Clone, PartialEq)]
pub enum GValue {
    Node(GNode),
    Text(String),
    Null,
}

impl GValue {
    pub fn as_node(&self) -> Option<&GNode> {
        match self {
            GValue::Node(node) => Some(node),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, GValue::Null)
    }

    /// Deep comparison by node names, child order, and text content.
    pub fn structural_eq(&self, other: &GValue) -> bool {
        match (self, other) {
            (GValue::Node(a), GValue::Node(b)) => a.structural_eq(b),
            (GValue::Text(a), GValue::Text(b)) => a == b,
            (GValue::Null, GValue::Null) => true,
            _ => false,
        }
    }
}

impl From<GNode> for GValue {
    fn from(node: GNode) -> Self {
        GValue::Node(node)
    }
}

impl From<GNodeBuilder> for GValue {
    fn from(builder: GNodeBuilder) -> Self {
        GValue::Node(builder.build())
    }
}

impl From<&str> for GValue {
    fn from(text: &str) -> Self {
        GValue::Text(text.to_string())
    }
}

impl From<String> for GValue {
    fn from(text: String) -> Self {
        GValue::Text(text)
    }
}

#[derive(Debug)]
struct GNodeInner {
    name: CompactString,
    children: Vec<GValue>,
    location: Option<Location>,
}

/// A named composite node with ordered children.
#[derive(Clone)]
pub struct GNode(Arc<GNodeInner>);

impl PartialEq for GNode {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for GNode {}

impl fmt::Debug for GNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GNode")
            .field("name", &self.0.name)
            .field("children", &self.0.children)
            .finish()
    }
}

impl GNode {
    pub fn new(name: impl Into<CompactString>, children: Vec<GValue>) -> Self {
        GNode(Arc::new(GNodeInner {
            name: name.into(),
            children,
            location: None,
        }))
    }

    pub fn with_location(
        name: impl Into<CompactString>,
        children: Vec<GValue>,
        location: Location,
    ) -> Self {
        GNode(Arc::new(GNodeInner {
            name: name.into(),
            children,
            location: Some(location),
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn location(&self) -> Option<Location> {
        self.0.location
    }

    pub fn size(&self) -> usize {
        self.0.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.children.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&GValue> {
        self.0.children.get(index)
    }

    pub fn children(&self) -> &[GValue] {
        &self.0.children
    }

    /// Deep comparison by node names, child order, and text content,
    /// ignoring handle identity and locations.
    pub fn structural_eq(&self, other: &GNode) -> bool {
        self.0.name == other.0.name
            && self.0.children.len() == other.0.children.len()
            && self
                .0
                .children
                .iter()
                .zip(other.0.children.iter())
                .all(|(a, b)| a.structural_eq(b))
    }
}

/// Builder for concise tree construction in tests and embedding code.
pub struct GNodeBuilder {
    name: CompactString,
    children: Vec<GValue>,
    location: Option<Location>,
}

impl GNodeBuilder {
    pub fn child(mut self, child: impl Into<GValue>) -> Self {
        self.children.push(child.into());
        self
    }

    pub fn children<I: IntoIterator<Item = GValue>>(mut self, children: I) -> Self {
        self.children.extend(children);
        self
    }

    pub fn null(mut self) -> Self {
        self.children.push(GValue::Null);
        self
    }

    pub fn at(mut self, line: u32, column: u32) -> Self {
        self.location = Some(Location::new(line, column));
        self
    }

    pub fn build(self) -> GNode {
        match self.location {
            Some(location) => GNode::with_location(self.name, self.children, location),
            None => GNode::new(self.name, self.children),
        }
    }
}

/// Start building a composite node with the given name.
pub fn node(name: &str) -> GNodeBuilder {
    GNodeBuilder {
        name: name.into(),
        children: Vec::new(),
        location: None,
    }
}
