// The built-in function library, direct registration, and query imports.
use rstest::rstest;
use std::sync::Arc;
use xform::tree::{node, GNode, GValue};
use xform::{
    Engine, Error, ErrorKind, Expr, FunctionCall, Import, Item, ItemTest, Output, PathAnchor,
    Query, Sequence, Value, XformFunction,
};

fn program() -> GNode {
    node("Program")
        .child(node("Decl").child("x"))
        .child(node("Decl").child("y"))
        .child(node("Stmt"))
        .build()
}

fn run(body: Expr, ast: &GNode) -> Vec<Output> {
    Engine::new().run(&Query::new(body), ast).unwrap()
}

fn all(name: &str) -> Expr {
    Expr::select(PathAnchor::AllNodes, ItemTest::name(name))
}

fn every() -> Expr {
    Expr::select(PathAnchor::AllNodes, ItemTest::Wildcard)
}

fn call(name: &str, args: Vec<Expr>) -> Expr {
    Expr::select(
        PathAnchor::Implicit,
        ItemTest::Call(FunctionCall::new(name, args, 1)),
    )
}

fn quoted(value: &str) -> Expr {
    Expr::Str(format!("\"{value}\""))
}

#[rstest]
fn count_and_last_report_the_sequence_size() {
    assert_eq!(run(call("count", vec![all("Decl")]), &program()), vec![Output::Int(2)]);
    assert_eq!(run(call("last", vec![all("Decl")]), &program()), vec![Output::Int(2)]);
    assert_eq!(run(call("count", vec![all("Missing")]), &program()), vec![Output::Int(0)]);
}

#[rstest]
fn empty_selects_childless_nodes() {
    let out = run(call("empty", vec![every()]), &program());
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].as_node().unwrap().name(), "Stmt");
}

#[rstest]
fn is_null_returns_the_argument_or_nothing() {
    // isNull over null templates keeps the argument
    let nulls = Expr::Compound(vec![Expr::NewItem(Box::new(Expr::Null))]);
    let out = run(call("isNull", vec![nulls]), &program());
    assert_eq!(out, vec![Output::List(vec![Output::Null])]);

    // any non-null item empties the result
    assert!(run(call("isNull", vec![all("Decl")]), &program()).is_empty());
}

#[rstest]
fn subsequence_takes_a_one_based_inclusive_range() {
    // //* is (Program, Decl, Decl, Stmt, "x", "y")
    let out = run(
        call("subsequence", vec![every(), Expr::Int(2), Expr::Int(3)]),
        &program(),
    );
    assert_eq!(out.len(), 2);
    assert!(out.iter().all(|o| o.as_node().unwrap().name() == "Decl"));
}

#[rstest]
fn concat_joins_leading_string_items() {
    let out = run(
        call("concat", vec![quoted("foo"), quoted("bar")]),
        &program(),
    );
    assert_eq!(out, vec![Output::Text("foobar".to_string())]);
}

#[rstest]
fn case_conversions_produce_fresh_string_items() {
    let out = run(call("uppercase", vec![quoted("mixed")]), &program());
    assert_eq!(out, vec![Output::Text("MIXED".to_string())]);

    let out = run(call("lowercase", vec![quoted("MiXeD")]), &program());
    assert_eq!(out, vec![Output::Text("mixed".to_string())]);
}

#[rstest]
fn substring_is_zero_based() {
    let out = run(
        call("substring", vec![quoted("hello"), Expr::Int(1)]),
        &program(),
    );
    assert_eq!(out, vec![Output::Text("ello".to_string())]);

    let out = run(
        call("substring", vec![quoted("hello"), Expr::Int(1), Expr::Int(3)]),
        &program(),
    );
    assert_eq!(out, vec![Output::Text("ell".to_string())]);
}

#[rstest]
fn similar_compares_payloads_regardless_of_position() {
    // both Decl text leaves, judged against a fresh "x" item
    let leaves = Expr::path(
        PathAnchor::AllNodes,
        Expr::chain(
            Expr::step(ItemTest::name("Decl")),
            xform::StepOp::Direct,
            Expr::step(ItemTest::Wildcard),
        ),
    );
    let values = Expr::Compound(vec![Expr::NewItem(Box::new(quoted("x")))]);
    let out = run(call("similar", vec![leaves, values]), &program());
    assert_eq!(out, vec![Output::Text("x".to_string())]);
}

#[rstest]
fn test_function_passes_its_argument_through() {
    let out = run(call("testFunction", vec![all("Decl")]), &program());
    assert_eq!(out.len(), 2);
}

#[rstest]
fn lines_returns_its_argument() {
    let ast = node("Program")
        .child(node("Decl").at(4, 2).child("x"))
        .build();
    let out = run(call("lines", vec![all("Decl")]), &ast);
    assert_eq!(out.len(), 1);
}

#[rstest]
fn unknown_function_reports_name_and_line() {
    let body = Expr::select(
        PathAnchor::Implicit,
        ItemTest::Call(FunctionCall::new("nosuch", Vec::new(), 4)),
    );
    let err = Engine::new().run(&Query::new(body), &program()).unwrap_err();
    assert_eq!(err.kind, ErrorKind::UnknownFunction);
    assert_eq!(err.line, Some(4));
    assert!(err.to_string().contains("nosuch"));
}

/// Reverses the leading string item; exercises the plugin contract.
struct Reverse;

impl XformFunction for Reverse {
    fn name(&self) -> &str {
        "reverse"
    }

    fn apply(&self, args: &[Value]) -> Result<Value, Error> {
        let text = match args.first() {
            Some(Value::Seq(seq)) => match seq.first() {
                Some(Value::Item(item)) => match item.value() {
                    GValue::Text(text) => text.clone(),
                    _ => return Err(Error::invalid_argument("reverse", "expected a string item")),
                },
                _ => return Err(Error::invalid_argument("reverse", "expected a string item")),
            },
            Some(Value::Item(item)) => match item.value() {
                GValue::Text(text) => text.clone(),
                _ => return Err(Error::invalid_argument("reverse", "expected a string item")),
            },
            _ => return Err(Error::invalid_argument("reverse", "expected a string item")),
        };
        let reversed: String = text.chars().rev().collect();
        Ok(Value::Seq(Sequence::singleton(Item::new(GValue::Text(
            reversed,
        )))))
    }
}

#[rstest]
fn registered_functions_are_callable_without_import() {
    let mut engine = Engine::new().with_function(Arc::new(Reverse));
    let out = engine
        .run(&Query::new(call("reverse", vec![quoted("abc")])), &program())
        .unwrap();
    assert_eq!(out, vec![Output::Text("cba".to_string())]);
}

#[rstest]
fn imports_load_externals_by_qualified_name() {
    let mut engine = Engine::new().with_external("org.example.Reverse", Arc::new(Reverse));

    // without the import the name is unknown
    let body = call("reverse", vec![quoted("abc")]);
    let err = engine.run(&Query::new(body.clone()), &program()).unwrap_err();
    assert_eq!(err.kind, ErrorKind::UnknownFunction);

    // the import makes it callable under its self-reported name
    let query = Query::with_imports(vec![Import::new("org.example.Reverse", 1)], body.clone());
    let out = engine.run(&query, &program()).unwrap();
    assert_eq!(out, vec![Output::Text("cba".to_string())]);

    // registrations stick for later runs of the same engine
    let out = engine.run(&Query::new(body), &program()).unwrap();
    assert_eq!(out, vec![Output::Text("cba".to_string())]);
}

#[rstest]
fn unresolved_imports_fail_before_evaluation() {
    let mut engine = Engine::new();
    let query = Query::with_imports(
        vec![Import::new("org.example.Missing", 2)],
        call("count", vec![all("Decl")]),
    );
    let err = engine.run(&query, &program()).unwrap_err();
    assert_eq!(err.kind, ErrorKind::UnresolvedImport);
    assert_eq!(err.line, Some(2));
}
