//! The query engine: shadow-tree construction, query evaluation, and final
//! tree regeneration.
//!
//! [`Engine::run`] mirrors the source AST into an [`Item`] tree, walks the
//! query AST with a recursive evaluator, and returns the de-sequenced
//! results. Structural edits only touch the item tree; [`Engine::ast_root`]
//! regenerates a fresh AST from it when (and only when) a mutation happened.
//!
//! One engine may be reused across runs: every `run` call resets the
//! environment, item tree, and modification/caching state. Only the function
//! table survives, accumulating `import` registrations.
//!
//! Mutations are not transactional. A failing run can leave the shadow tree
//! partially edited, so the engine poisons it on error and `ast_root`
//! refuses to serve it afterwards.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::functions::default_function_registry;
use crate::item::Item;
use crate::query::{Binding, Expr, FunctionCall, ItemTest, PathAnchor, Query, StepOp};
use crate::runtime::{Environment, Error, ErrorKind, FunctionRegistry, XformFunction};
use crate::sequence::{Sequence, Value};
use crate::tree::{GNode, GValue};

/// A single top-level query result, with items unwrapped to their payloads
/// and nested sequences to nested lists.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Node(GNode),
    Text(String),
    Null,
    Int(i64),
    List(Vec<Output>),
}

impl Output {
    pub fn as_node(&self) -> Option<&GNode> {
        match self {
            Output::Node(node) => Some(node),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Output::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// The XForm query engine.
pub struct Engine {
    functions: FunctionRegistry,
    externals: HashMap<String, Arc<dyn XformFunction>>,
    source: Option<GNode>,
    item_tree: Option<Item>,
    modified: bool,
    poisoned: bool,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// An engine with the built-in function library registered.
    pub fn new() -> Self {
        Self {
            functions: default_function_registry(),
            externals: HashMap::new(),
            source: None,
            item_tree: None,
            modified: false,
            poisoned: false,
        }
    }

    /// Register a function under its self-reported name, making it callable
    /// from queries without an `import`.
    pub fn register_function(&mut self, function: Arc<dyn XformFunction>) {
        self.functions.register(function);
    }

    pub fn with_function(mut self, function: Arc<dyn XformFunction>) -> Self {
        self.register_function(function);
        self
    }

    /// Provide an implementation that query `import` declarations may load
    /// under `name`. Nothing is callable until a query imports it.
    pub fn register_external(&mut self, name: impl Into<String>, function: Arc<dyn XformFunction>) {
        self.externals.insert(name.into(), function);
    }

    pub fn with_external(mut self, name: impl Into<String>, function: Arc<dyn XformFunction>) -> Self {
        self.register_external(name, function);
        self
    }

    /// Whether the most recent run structurally edited the tree.
    pub fn modified(&self) -> bool {
        self.modified
    }

    /// Perform a query on an AST, returning the flattened top-level results.
    pub fn run(&mut self, query: &Query, ast: &GNode) -> Result<Vec<Output>, Error> {
        debug!(imports = query.imports.len(), "running query");
        self.source = Some(ast.clone());
        self.modified = false;
        self.poisoned = false;
        let root = gen_item_tree(&GValue::Node(ast.clone()));
        self.item_tree = Some(root.clone());
        match self.run_rooted(query, root) {
            Ok(outputs) => Ok(outputs),
            Err(error) => {
                self.poisoned = true;
                Err(error)
            }
        }
    }

    fn run_rooted(&mut self, query: &Query, root: Item) -> Result<Vec<Output>, Error> {
        for import in &query.imports {
            let function = self
                .externals
                .get(&import.name)
                .cloned()
                .ok_or_else(|| Error::unresolved_import(&import.name, import.line))?;
            debug!(name = import.name.as_str(), "registering imported function");
            self.functions.register(function);
        }
        let mut evaluator = Evaluator {
            functions: &self.functions,
            env: Environment::new(),
            focus: FocusMode::Implicit,
            root,
            modified: false,
            inside_out: None,
        };
        evaluator.env.push_scope();
        let value = evaluator.eval(&query.body)?;
        self.modified = evaluator.modified;
        self.item_tree = Some(evaluator.root);
        Ok(object_list(&into_sequence(value)))
    }

    /// The (possibly transformed) source AST of the most recent run.
    ///
    /// Returns the original root (the very same handle) when no mutation
    /// happened; a freshly regenerated tree when one did; an error when no
    /// query has run yet or the last run failed.
    pub fn ast_root(&self) -> Result<GNode, Error> {
        if self.poisoned {
            return Err(Error::invalid_state(
                "previous run failed; the shadow tree may be partially edited",
            ));
        }
        let (source, item_tree) = match (&self.source, &self.item_tree) {
            (Some(source), Some(item_tree)) => (source, item_tree),
            _ => return Err(Error::invalid_state("no query has been run")),
        };
        if !self.modified {
            return Ok(source.clone());
        }
        match gen_final_tree(item_tree) {
            GValue::Node(node) => Ok(node),
            _ => Err(Error::invalid_state("the transformed root is not a node")),
        }
    }
}

/// Mirror a source value into an item subtree.
fn gen_item_tree(value: &GValue) -> Item {
    let item = Item::new(value.clone());
    if let GValue::Node(node) = value {
        for child in node.children() {
            item.add_child(gen_item_tree(child));
        }
    }
    item
}

/// Rebuild a plain tree value from a (possibly mutated) item subtree.
fn gen_final_tree(item: &Item) -> GValue {
    match item.value() {
        GValue::Node(node) => {
            let children = item.children().iter().map(gen_final_tree).collect();
            GValue::Node(GNode::new(node.name(), children))
        }
        other => other.clone(),
    }
}

/// Unwrap items to payloads, nested sequences to nested lists. Top-level
/// structure is preserved, not flattened.
fn object_list(seq: &Sequence) -> Vec<Output> {
    seq.iter()
        .map(|value| match value {
            Value::Item(item) => match item.value() {
                GValue::Node(node) => Output::Node(node.clone()),
                GValue::Text(text) => Output::Text(text.clone()),
                GValue::Null => Output::Null,
            },
            Value::Int(int) => Output::Int(*int),
            Value::Seq(nested) => Output::List(object_list(nested)),
        })
        .collect()
}

fn into_sequence(value: Value) -> Sequence {
    match value {
        Value::Seq(seq) => seq,
        other => Sequence::singleton(other),
    }
}

fn item_of(value: &Value) -> Result<&Item, Error> {
    match value {
        Value::Item(item) => Ok(item),
        other => Err(Error::new(
            ErrorKind::InvalidArgument,
            format!("expected a tree item, found {other:?}"),
        )),
    }
}

/// Remove the surrounding quote characters from a literal as written.
fn strip_quotes(raw: &str) -> &str {
    let quoted = raw.len() >= 2
        && ((raw.starts_with('"') && raw.ends_with('"'))
            || (raw.starts_with('\'') && raw.ends_with('\'')));
    if quoted { &raw[1..raw.len() - 1] } else { raw }
}

fn test_line(test: &ItemTest) -> Option<u32> {
    match test {
        ItemTest::Parent { line } => Some(*line),
        ItemTest::Var { line, .. } => Some(*line),
        ItemTest::Call(call) => Some(call.line),
        _ => None,
    }
}

/// How the next step establishes its candidate set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FocusMode {
    /// Start from the tree root.
    Root,
    /// Search every node of the tree, recursing through all levels.
    All,
    /// The step supplies its own value (variable, call, sub-expression) or
    /// filters the surrounding focus.
    Implicit,
    /// Continue from the previous segment's result.
    Continuing,
    /// Walk the cached reversed breadth-first linearization.
    InsideOut,
}

struct Evaluator<'e> {
    functions: &'e FunctionRegistry,
    env: Environment,
    focus: FocusMode,
    root: Item,
    modified: bool,
    inside_out: Option<Sequence>,
}

impl Evaluator<'_> {
    fn eval(&mut self, expr: &Expr) -> Result<Value, Error> {
        match expr {
            Expr::Compound(exprs) => self.eval_compound(exprs),
            Expr::Let { bindings, body } => {
                self.env.push_scope();
                let result = self.eval_let(bindings, body);
                self.env.pop_scope();
                result
            }
            Expr::For { bindings, body } => {
                self.env.push_scope();
                let result = self.eval_for(bindings, body);
                self.env.pop_scope();
                result
            }
            Expr::CFor { bindings, body } => {
                self.env.push_scope();
                let result = self.eval_cfor(bindings, body);
                self.env.pop_scope();
                result
            }
            Expr::If {
                cond,
                then,
                otherwise,
            } => {
                let conditional = self.eval_seq(cond)?;
                if !conditional.is_empty() {
                    self.eval(then)
                } else {
                    self.eval(otherwise)
                }
            }
            Expr::Or(operands) => self.eval_or(operands),
            Expr::And(operands) => self.eval_and(operands),
            Expr::Union(left, right) => {
                let left = self.eval_seq(left)?;
                let right = self.eval_seq(right)?;
                Ok(Value::Seq(union(&left, &right)))
            }
            Expr::Intersect(left, right) => {
                let left = self.eval_seq(left)?;
                let right = self.eval_seq(right)?;
                Ok(Value::Seq(intersection(&left, &right)))
            }
            Expr::Difference(left, right) => {
                let left = self.eval_seq(left)?;
                let right = self.eval_seq(right)?;
                Ok(Value::Seq(difference(&left, &right)))
            }
            Expr::Replace {
                targets,
                replacements,
            } => self.eval_replace(targets, replacements),
            Expr::InsertBefore {
                insertions,
                targets,
            } => self.eval_insert(insertions, targets, true),
            Expr::InsertAfter {
                insertions,
                targets,
            } => self.eval_insert(insertions, targets, false),
            Expr::Remove { targets } => self.eval_remove(targets),
            Expr::Add { children, targets } => self.eval_add(children, targets),
            Expr::NewItem(template) => {
                let item = self.eval_template(template)?;
                Ok(Value::Seq(Sequence::singleton(item)))
            }
            Expr::NewNode { name, children } => {
                self.eval_new_node(name, children).map(Value::Item)
            }
            Expr::Null => Ok(Value::Item(Item::new(GValue::Null))),
            Expr::Str(raw) => Ok(Value::Item(Item::new(GValue::Text(
                strip_quotes(raw).to_string(),
            )))),
            Expr::Int(int) => Ok(Value::Int(*int)),
            Expr::Path { anchor, expr } => {
                self.focus = match anchor {
                    PathAnchor::Root => FocusMode::Root,
                    PathAnchor::AllNodes => FocusMode::All,
                    PathAnchor::InsideOut => FocusMode::InsideOut,
                    PathAnchor::Implicit => FocusMode::Implicit,
                };
                self.eval(expr)
            }
            Expr::RelPath { head, op, tail } => self.eval_rel_path(head, *op, tail),
            Expr::Step { test, predicates } => self.eval_step(test, predicates),
        }
    }

    fn eval_seq(&mut self, expr: &Expr) -> Result<Sequence, Error> {
        self.eval(expr).map(into_sequence)
    }

    /// Evaluate a node template into its single item.
    fn eval_template(&mut self, expr: &Expr) -> Result<Item, Error> {
        match self.eval(expr)? {
            Value::Item(item) => Ok(item),
            other => Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("a node template must produce a single item, found {other:?}"),
            )),
        }
    }

    fn eval_compound(&mut self, exprs: &[Expr]) -> Result<Value, Error> {
        let mut value = Sequence::new();
        let mut pushes = 0;
        let mut failure = None;
        for expr in exprs {
            match self.eval_seq(expr) {
                Ok(current) => {
                    value.add(Value::Seq(current.clone()));
                    self.env.push_focus(current);
                    pushes += 1;
                }
                Err(error) => {
                    failure = Some(error);
                    break;
                }
            }
        }
        for _ in 0..pushes {
            self.env.pop_focus();
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(Value::Seq(value)),
        }
    }

    fn eval_let(&mut self, bindings: &[Binding], body: &Expr) -> Result<Value, Error> {
        for binding in bindings {
            let bound = self.eval_seq(&binding.source)?;
            self.env.set_variable(&binding.name, bound);
        }
        self.eval(body)
    }

    /// Cartesian-product iteration: an odometer over the flattened binding
    /// sources, rightmost variable advancing fastest. An empty source makes
    /// the whole result empty.
    fn eval_for(&mut self, bindings: &[Binding], body: &Expr) -> Result<Value, Error> {
        let mut sources: Vec<(&str, Vec<Value>)> = Vec::with_capacity(bindings.len());
        for binding in bindings {
            let seq = self.eval_seq(&binding.source)?;
            let values: Vec<Value> = seq.flat_iter().cloned().collect();
            if values.is_empty() {
                return Ok(Value::Seq(Sequence::new()));
            }
            sources.push((binding.name.as_str(), values));
        }
        let mut result = Sequence::new();
        let mut odometer = vec![0usize; sources.len()];
        loop {
            for ((name, values), &position) in sources.iter().zip(odometer.iter()) {
                self.env
                    .set_variable(name, Sequence::singleton(values[position].clone()));
            }
            for value in self.eval_seq(body)? {
                result.add(value);
            }
            let mut slot = sources.len();
            loop {
                if slot == 0 {
                    return Ok(Value::Seq(result));
                }
                slot -= 1;
                odometer[slot] += 1;
                if odometer[slot] < sources[slot].1.len() {
                    break;
                }
                odometer[slot] = 0;
            }
        }
    }

    /// Lock-step iteration: all variables advance together, stopping with
    /// the shortest source.
    fn eval_cfor(&mut self, bindings: &[Binding], body: &Expr) -> Result<Value, Error> {
        let mut sources: Vec<(&str, Vec<Value>)> = Vec::with_capacity(bindings.len());
        for binding in bindings {
            let seq = self.eval_seq(&binding.source)?;
            let values: Vec<Value> = seq.flat_iter().cloned().collect();
            sources.push((binding.name.as_str(), values));
        }
        let rounds = sources
            .iter()
            .map(|(_, values)| values.len())
            .min()
            .unwrap_or(0);
        let mut result = Sequence::new();
        for round in 0..rounds {
            for (name, values) in &sources {
                self.env
                    .set_variable(name, Sequence::singleton(values[round].clone()));
            }
            for value in self.eval_seq(body)? {
                result.add(value);
            }
        }
        Ok(Value::Seq(result))
    }

    fn eval_or(&mut self, operands: &[Expr]) -> Result<Value, Error> {
        let mut value = Sequence::new();
        for operand in operands {
            value = self.eval_seq(operand)?;
            if !value.is_empty() {
                break;
            }
        }
        Ok(Value::Seq(value))
    }

    fn eval_and(&mut self, operands: &[Expr]) -> Result<Value, Error> {
        let mut result = Sequence::new();
        for operand in operands {
            let value = self.eval_seq(operand)?;
            if value.is_empty() {
                return Ok(Value::Seq(value));
            }
            for element in value {
                result.add(element);
            }
        }
        Ok(Value::Seq(result))
    }

    fn eval_remove(&mut self, targets: &Expr) -> Result<Value, Error> {
        self.mark_modified();
        let targets = self.eval_seq(targets)?;
        for value in targets.flat_iter() {
            let target = item_of(value)?;
            let parent = target
                .parent()
                .ok_or_else(|| Error::root_edit("cannot remove the tree root"))?;
            parent.remove_child(target.index());
        }
        Ok(Value::Seq(targets))
    }

    fn eval_add(&mut self, children: &Expr, targets: &Expr) -> Result<Value, Error> {
        self.mark_modified();
        let targets = self.eval_seq(targets)?;
        if targets.is_empty() {
            return Ok(Value::Seq(targets));
        }
        let additions = self.eval_seq(children)?;
        let mut added = Sequence::new();
        for value in targets.flat_iter() {
            let target = item_of(value)?;
            for addition in additions.flat_iter() {
                let addition = item_of(addition)?;
                target.add_child(addition.clone());
                added.add(target.clone());
            }
        }
        Ok(Value::Seq(added))
    }

    fn eval_replace(&mut self, targets: &Expr, replacements: &Expr) -> Result<Value, Error> {
        let targets = self.eval_seq(targets)?;
        if targets.is_empty() {
            return Ok(Value::Seq(targets));
        }
        let replacements = self.eval_seq(replacements)?;
        self.replace(&targets, replacements)
    }

    /// Replace each target with the replacement items. A parentless target
    /// must be the tree root: it can only be swapped for a single item.
    fn replace(&mut self, targets: &Sequence, replacements: Sequence) -> Result<Value, Error> {
        self.mark_modified();
        let mut items: Vec<Item> = Vec::new();
        for value in replacements.flat_iter() {
            items.push(item_of(value)?.clone());
        }
        for value in targets.flat_iter() {
            let target = item_of(value)?;
            match target.parent() {
                None => {
                    if items.len() > 1 {
                        return Err(Error::root_edit(
                            "the tree root can only be replaced by a single item",
                        ));
                    }
                    let replacement = items.first().ok_or_else(|| {
                        Error::root_edit("the tree root cannot be replaced by an empty sequence")
                    })?;
                    self.root = replacement.clone();
                }
                Some(parent) => {
                    let index = target.index();
                    if items.len() == 1 {
                        parent.replace_child(index, items[0].clone());
                    } else {
                        parent.splice_child(index, items.clone());
                    }
                }
            }
        }
        Ok(Value::Seq(replacements))
    }

    fn eval_insert(
        &mut self,
        insertions: &Expr,
        targets: &Expr,
        before: bool,
    ) -> Result<Value, Error> {
        self.mark_modified();
        let targets = self.eval_seq(targets)?;
        if targets.is_empty() {
            return Ok(Value::Seq(targets));
        }
        let mut spliced = Sequence::new();
        for value in targets.flat_iter() {
            let target = item_of(value)?;
            let parent = target.parent().ok_or_else(|| {
                Error::root_edit(if before {
                    "cannot insert before the tree root"
                } else {
                    "cannot insert after the tree root"
                })
            })?;
            let index = target.index();
            // evaluated once per target, so each splice gets its own items
            let inserted = self.eval_seq(insertions)?;
            let mut list: Vec<Item> = Vec::new();
            if before {
                for value in inserted.flat_iter() {
                    list.push(item_of(value)?.clone());
                }
                list.push(target.clone());
            } else {
                list.push(target.clone());
                for value in inserted.flat_iter() {
                    list.push(item_of(value)?.clone());
                }
            }
            parent.splice_child(index, list.clone());
            spliced = list.into_iter().map(Value::Item).collect();
        }
        Ok(Value::Seq(spliced))
    }

    /// Instantiate a node template: evaluated children are duplicated into
    /// the template so later edits to the originals cannot reach into it.
    fn eval_new_node(&mut self, name: &str, children: &[Expr]) -> Result<Item, Error> {
        let mut child_list = Sequence::new();
        for child in children {
            match self.eval(child)? {
                Value::Seq(seq) => {
                    for value in seq {
                        child_list.add(value);
                    }
                }
                other => {
                    child_list.add(other);
                }
            }
        }
        let mut child_items: Vec<Item> = Vec::new();
        for value in child_list.flat_iter() {
            child_items.push(item_of(value)?.duplicate());
        }
        let payload_children: Vec<GValue> = child_items
            .iter()
            .map(|item| item.value().clone())
            .collect();
        let node = GNode::new(name, payload_children);
        let item = Item::new(GValue::Node(node));
        item.add_children(child_items);
        Ok(item)
    }

    fn eval_rel_path(&mut self, head: &Expr, op: StepOp, tail: &Expr) -> Result<Value, Error> {
        let outer = self.eval_seq(head)?;
        self.env.push_focus(outer);
        self.focus = match op {
            StepOp::Direct => FocusMode::Continuing,
            StepOp::Descend => FocusMode::All,
        };
        let inner = self.eval(tail);
        self.env.pop_focus();
        inner
    }

    fn eval_step(&mut self, test: &ItemTest, predicates: &[Expr]) -> Result<Value, Error> {
        let result = self.collect(test)?;
        if predicates.is_empty() {
            return Ok(Value::Seq(result));
        }
        self.env.push_focus(result);
        let filtered = self.apply_predicates(predicates);
        self.env.pop_focus();
        Ok(Value::Seq(filtered?))
    }

    /// Narrow the step result by each predicate in turn, replacing the focus
    /// with the running intersection. Empty short-circuits.
    fn apply_predicates(&mut self, predicates: &[Expr]) -> Result<Sequence, Error> {
        let mut filtered = self.env.peek_focus().cloned().unwrap_or_default();
        for predicate in predicates {
            let value = self.eval_predicate(predicate)?;
            filtered = intersection(&filtered, &value);
            if filtered.is_empty() {
                break;
            }
            self.env.replace_focus(filtered.clone());
        }
        Ok(filtered)
    }

    /// A purely numeric predicate value selects the n-th focus item,
    /// 1-based; anything else filters by intersection.
    fn eval_predicate(&mut self, predicate: &Expr) -> Result<Sequence, Error> {
        let mut value = self.eval(predicate)?;
        if let Value::Seq(seq) = &value {
            if let Some(Value::Int(int)) = seq.first() {
                value = Value::Int(*int);
            }
        }
        match value {
            Value::Int(position) => {
                let outer = self.env.peek_focus().cloned().unwrap_or_default();
                let mut selected = Sequence::new();
                if position >= 1 {
                    if let Some(found) = outer.get(position as usize - 1) {
                        selected.add(found.clone());
                    }
                }
                Ok(selected)
            }
            other => Ok(into_sequence(other)),
        }
    }

    /// Collect the items satisfying an item test under the current focus
    /// mode.
    fn collect(&mut self, test: &ItemTest) -> Result<Sequence, Error> {
        let mode = self.focus;
        let outer = match mode {
            FocusMode::Root | FocusMode::All => Sequence::singleton(self.root.clone()),
            FocusMode::InsideOut => self.inside_out_focus(),
            FocusMode::Implicit if !matches!(test, ItemTest::Current) => {
                return self.collect_implicit(test);
            }
            _ => self
                .env
                .peek_focus()
                .cloned()
                .ok_or_else(|| Error::missing_focus(test_line(test)))?,
        };
        if mode == FocusMode::All {
            return self.test(test, &outer);
        }
        match test {
            ItemTest::Current => Ok(outer),
            ItemTest::Call(call) => {
                let value = self.eval_call(call)?;
                Ok(into_sequence(value))
            }
            ItemTest::Parent { line } => {
                let mut parents = Sequence::new();
                for value in outer.flat_iter() {
                    let item = item_of(value)?;
                    let parent = item.parent().ok_or_else(|| Error::no_parent(*line))?;
                    parents.add_unique(parent);
                }
                Ok(parents)
            }
            _ => {
                // gather the children of every focus item, then test them
                let mut child_items = Sequence::new();
                for value in outer.flat_iter() {
                    if let Value::Item(item) = value {
                        if matches!(item.value(), GValue::Node(_)) {
                            for child in item.children() {
                                child_items.add_unique(child);
                            }
                        }
                    }
                }
                let tested = self.test(test, &child_items)?;
                Ok(union(&Sequence::new(), &tested))
            }
        }
    }

    /// Steps that carry their own value when the focus is implicit:
    /// variables, sub-expressions, and calls produce it outright, while a
    /// name test filters the surrounding focus down to the items that have a
    /// matching-named child.
    fn collect_implicit(&mut self, test: &ItemTest) -> Result<Sequence, Error> {
        match test {
            ItemTest::Var { name, line } => self
                .env
                .variable(name)
                .cloned()
                .ok_or_else(|| Error::undefined_variable(name, *line)),
            ItemTest::Expr(inner) => self.eval_paren(inner),
            ItemTest::Call(call) => {
                let value = self.eval_call(call)?;
                let mut out = Sequence::new();
                match value {
                    Value::Seq(seq) => {
                        for element in seq {
                            out.add(element);
                        }
                    }
                    other => {
                        out.add(other);
                    }
                }
                Ok(out)
            }
            ItemTest::Name(name) => {
                let focus = self
                    .env
                    .peek_focus()
                    .cloned()
                    .ok_or_else(|| Error::missing_focus(None))?;
                let mut matching = Sequence::new();
                for value in focus.flat_iter() {
                    if let Value::Item(item) = value {
                        for child in item.children() {
                            if let GValue::Node(node) = child.value() {
                                if node.name() == name {
                                    matching.add(item.clone());
                                }
                            }
                        }
                    }
                }
                Ok(matching)
            }
            // wildcard, parent and literal steps need an enclosing focus
            _ => Err(Error::missing_focus(test_line(test))),
        }
    }

    /// Apply an item test to a candidate sequence. Under the all-nodes
    /// focus this recurses into the candidates' children, searching the
    /// whole subtree.
    fn test(&mut self, test: &ItemTest, items: &Sequence) -> Result<Sequence, Error> {
        let mut value = Sequence::new();
        match test {
            ItemTest::Parent { line } => {
                for candidate in items.flat_iter() {
                    let item = item_of(candidate)?;
                    let parent = item.parent().ok_or_else(|| Error::no_parent(*line))?;
                    value.add_unique(parent);
                }
            }
            ItemTest::Wildcard | ItemTest::Current => {
                value = items.clone();
            }
            ItemTest::Name(name) => {
                for candidate in items.flat_iter() {
                    if let Value::Item(item) = candidate {
                        if let GValue::Node(node) = item.value() {
                            if node.name() == name {
                                value.add_unique(candidate.clone());
                            }
                        }
                    }
                }
            }
            ItemTest::Literal(raw) => {
                let literal = strip_quotes(raw);
                for candidate in items.flat_iter() {
                    if let Value::Item(item) = candidate {
                        if let GValue::Text(text) = item.value() {
                            if text == literal {
                                value.add_unique(candidate.clone());
                            }
                        }
                    }
                }
            }
            ItemTest::Call(call) => {
                self.env.push_focus(items.clone());
                let result = self.eval_call(call);
                self.env.pop_focus();
                value = into_sequence(result?);
            }
            ItemTest::Var { name, line } => {
                let bound = self
                    .env
                    .variable(name)
                    .cloned()
                    .ok_or_else(|| Error::undefined_variable(name, *line))?;
                value = intersection(items, &bound);
            }
            ItemTest::Expr(inner) => {
                let inner_value = self.eval_paren(inner)?;
                value = intersection(items, &inner_value);
            }
        }
        if self.focus == FocusMode::All {
            let mut child_items = Sequence::new();
            for candidate in items.flat_iter() {
                if let Value::Item(item) = candidate {
                    if matches!(item.value(), GValue::Node(_)) {
                        for child in item.children() {
                            child_items.add(child);
                        }
                    }
                }
            }
            if !child_items.is_empty() {
                let deeper = self.test(test, &child_items)?;
                value = union(&value, &deeper);
            }
        }
        Ok(value)
    }

    /// A parenthesized sub-expression evaluates under its own focus mode
    /// and restores the surrounding one afterwards.
    fn eval_paren(&mut self, expr: &Expr) -> Result<Sequence, Error> {
        let saved = self.focus;
        let value = self.eval(expr);
        self.focus = saved;
        Ok(into_sequence(value?))
    }

    fn eval_call(&mut self, call: &FunctionCall) -> Result<Value, Error> {
        let mut args = Vec::with_capacity(call.args.len());
        for arg in &call.args {
            args.push(self.eval(arg)?);
        }
        let function = self
            .functions
            .resolve(&call.name)
            .ok_or_else(|| Error::unknown_function(&call.name, call.line))?;
        function.apply(&args)
    }

    fn mark_modified(&mut self) {
        if !self.modified {
            trace!("tree marked modified");
        }
        self.modified = true;
        self.inside_out = None;
    }

    /// The reversed breadth-first linearization of the whole tree, computed
    /// lazily and cached until a mutation invalidates it.
    fn inside_out_focus(&mut self) -> Sequence {
        if let Some(cached) = &self.inside_out {
            return cached.clone();
        }
        trace!("computing inside-out traversal");
        let linearized = reverse_breadth_first(&self.root);
        self.inside_out = Some(linearized.clone());
        linearized
    }
}

/// Duplicate-avoiding append of `b`'s items onto `a`, preserving first-seen
/// order.
fn union(a: &Sequence, b: &Sequence) -> Sequence {
    let mut out = Sequence::new();
    for value in a.iter() {
        out.add(value.clone());
    }
    for value in b.flat_iter() {
        out.add_unique(value.clone());
    }
    out
}

/// The items of `a` present (by value equality) in `b`.
fn intersection(a: &Sequence, b: &Sequence) -> Sequence {
    let mut out = Sequence::new();
    for value in a.flat_iter() {
        if b.contains(value) {
            out.add(value.clone());
        }
    }
    out
}

/// The items of `a` absent from `b`, in `a`'s order. Always builds a fresh
/// sequence; the inputs are never edited in place.
fn difference(a: &Sequence, b: &Sequence) -> Sequence {
    let mut out = Sequence::new();
    for value in a.flat_iter() {
        if !b.contains(value) {
            out.add(value.clone());
        }
    }
    out
}

/// Flatten the tree into reversed breadth-first order: the deepest level
/// first, the root last.
fn reverse_breadth_first(root: &Item) -> Sequence {
    let mut pending: VecDeque<Item> = VecDeque::new();
    let mut ordered: VecDeque<Item> = VecDeque::new();
    pending.push_back(root.clone());
    while let Some(item) = pending.pop_front() {
        for child in item.children() {
            pending.push_front(child);
        }
        ordered.push_front(item);
    }
    let mut seq = Sequence::new();
    for item in ordered {
        seq.add(item);
    }
    seq
}
