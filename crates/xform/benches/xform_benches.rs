use criterion::{Criterion, black_box, criterion_group, criterion_main};
use xform::tree::{node, GNode};
use xform::{Engine, Expr, ItemTest, PathAnchor, Query};

/// A balanced tree of `Scope` nodes with `Decl` leaves.
fn build_tree(depth: usize, width: usize) -> GNode {
    if depth == 0 {
        return node("Decl").child("leaf").build();
    }
    let mut builder = node("Scope");
    for _ in 0..width {
        builder = builder.child(build_tree(depth - 1, width));
    }
    builder.build()
}

fn benchmark_selection(c: &mut Criterion) {
    let ast = build_tree(5, 4);
    let query = Query::new(Expr::select(PathAnchor::AllNodes, ItemTest::name("Decl")));
    let mut engine = Engine::new();
    c.bench_function("engine/select_all_decls", |b| {
        b.iter(|| {
            let out = engine.run(black_box(&query), black_box(&ast)).unwrap();
            black_box(out);
        })
    });
}

fn benchmark_inside_out(c: &mut Criterion) {
    let ast = build_tree(5, 4);
    let query = Query::new(Expr::select(PathAnchor::InsideOut, ItemTest::name("Decl")));
    let mut engine = Engine::new();
    c.bench_function("engine/inside_out_decls", |b| {
        b.iter(|| {
            let out = engine.run(black_box(&query), black_box(&ast)).unwrap();
            black_box(out);
        })
    });
}

fn benchmark_rewrite(c: &mut Criterion) {
    let ast = build_tree(4, 4);
    let query = Query::new(Expr::Replace {
        targets: Box::new(Expr::select(PathAnchor::AllNodes, ItemTest::name("Decl"))),
        replacements: Box::new(Expr::NewItem(Box::new(Expr::NewNode {
            name: "Renamed".to_string(),
            children: Vec::new(),
        }))),
    });
    let mut engine = Engine::new();
    c.bench_function("engine/replace_and_regenerate", |b| {
        b.iter(|| {
            engine.run(black_box(&query), black_box(&ast)).unwrap();
            let root = engine.ast_root().unwrap();
            black_box(root);
        })
    });
}

criterion_group!(
    benches,
    benchmark_selection,
    benchmark_inside_out,
    benchmark_rewrite
);
criterion_main!(benches);
