// Set operators: union, intersection, difference.
use rstest::rstest;
use xform::tree::{node, GNode};
use xform::{Engine, Expr, ItemTest, Output, PathAnchor, Query};

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

fn names(outputs: &[Output]) -> Vec<String> {
    outputs
        .iter()
        .map(|output| match output {
            Output::Node(node) => node.name().to_string(),
            Output::Text(text) => format!("\"{text}\""),
            other => panic!("unexpected output {other:?}"),
        })
        .collect()
}

fn all(name: &str) -> Expr {
    Expr::select(PathAnchor::AllNodes, ItemTest::name(name))
}

fn every() -> Expr {
    Expr::select(PathAnchor::AllNodes, ItemTest::Wildcard)
}

#[rstest]
fn union_keeps_each_position_once() {
    let body = Expr::Union(Box::new(all("Decl")), Box::new(all("Decl")));
    assert_eq!(names(&run(body, &program())), vec!["Decl", "Decl"]);

    let body = Expr::Union(Box::new(all("Decl")), Box::new(all("Stmt")));
    assert_eq!(names(&run(body, &program())), vec!["Decl", "Decl", "Stmt"]);
}

#[rstest]
fn union_is_left_biased_in_order() {
    let body = Expr::Union(Box::new(all("Stmt")), Box::new(all("Decl")));
    assert_eq!(names(&run(body, &program())), vec!["Stmt", "Decl", "Decl"]);
}

#[rstest]
fn intersection_retains_shared_positions() {
    let body = Expr::Intersect(Box::new(every()), Box::new(all("Decl")));
    assert_eq!(names(&run(body, &program())), vec!["Decl", "Decl"]);

    let body = Expr::Intersect(Box::new(all("Decl")), Box::new(all("Stmt")));
    assert!(run(body, &program()).is_empty());
}

#[rstest]
fn difference_is_left_biased_and_non_destructive() {
    let body = Expr::Difference(Box::new(every()), Box::new(all("Decl")));
    assert_eq!(
        names(&run(body, &program())),
        vec!["Program", "Stmt", "\"x\"", "\"y\""]
    );

    // subtracting everything leaves nothing
    let body = Expr::Difference(Box::new(all("Decl")), Box::new(every()));
    assert!(run(body, &program()).is_empty());
}

#[rstest]
fn set_operators_compose() {
    // (//* difference //Decl) intersect //Stmt
    let body = Expr::Intersect(
        Box::new(Expr::Difference(Box::new(every()), Box::new(all("Decl")))),
        Box::new(all("Stmt")),
    );
    assert_eq!(names(&run(body, &program())), vec!["Stmt"]);
}
