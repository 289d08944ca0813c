// Shadow-tree bookkeeping: reindexing across every mutation, equality,
// and template duplication.
use rstest::rstest;
use xform::tree::{node, GValue};
use xform::Item;

fn text_item(value: &str) -> Item {
    Item::new(GValue::Text(value.to_string()))
}

fn parent_with(labels: &[&str]) -> Item {
    let parent = Item::new(GValue::Node(node("P").build()));
    for label in labels {
        parent.add_child(text_item(label));
    }
    parent
}

fn labels(parent: &Item) -> Vec<String> {
    parent
        .children()
        .iter()
        .map(|child| match child.value() {
            GValue::Text(text) => text.clone(),
            other => panic!("unexpected payload {other:?}"),
        })
        .collect()
}

fn assert_indexed(parent: &Item) {
    for (position, child) in parent.children().iter().enumerate() {
        assert_eq!(child.index(), position);
        assert!(child.parent().is_some());
    }
}

#[rstest]
fn add_child_assigns_parent_and_index() {
    let parent = parent_with(&["a", "b", "c"]);
    assert_eq!(parent.child_count(), 3);
    assert_indexed(&parent);
}

#[rstest]
fn insert_child_renumbers_later_siblings() {
    let parent = parent_with(&["a", "c"]);
    parent.insert_child(1, text_item("b"));
    assert_eq!(labels(&parent), vec!["a", "b", "c"]);
    assert_indexed(&parent);
}

#[rstest]
fn remove_child_renumbers_later_siblings() {
    let parent = parent_with(&["a", "b", "c"]);
    let removed = parent.remove_child(1);
    assert_eq!(labels(&parent), vec!["a", "c"]);
    assert_indexed(&parent);
    // the removed item keeps its stale bookkeeping
    assert_eq!(removed.index(), 1);
}

#[rstest]
fn replace_child_is_a_slot_write() {
    let parent = parent_with(&["a", "b", "c"]);
    parent.replace_child(1, text_item("B"));
    assert_eq!(labels(&parent), vec!["a", "B", "c"]);
    assert_indexed(&parent);
}

#[rstest]
fn splice_child_replaces_one_slot_with_many() {
    let parent = parent_with(&["a", "b", "c"]);
    parent.splice_child(1, vec![text_item("x"), text_item("y"), text_item("z")]);
    assert_eq!(labels(&parent), vec!["a", "x", "y", "z", "c"]);
    assert_indexed(&parent);

    // splicing in nothing is a plain removal
    parent.splice_child(0, Vec::new());
    assert_eq!(labels(&parent), vec!["x", "y", "z", "c"]);
    assert_indexed(&parent);
}

#[rstest]
fn insert_children_renumbers_once() {
    let parent = parent_with(&["a", "d"]);
    parent.insert_children(1, vec![text_item("b"), text_item("c")]);
    assert_eq!(labels(&parent), vec!["a", "b", "c", "d"]);
    assert_indexed(&parent);
}

#[rstest]
fn equality_is_positional() {
    let parent = parent_with(&["a", "b"]);
    let first = parent.children()[0].clone();

    // a clone of the handle is equal to itself
    assert_eq!(first, parent.children()[0]);
    // a sibling with a different payload and index is not
    assert_ne!(first, parent.children()[1]);

    // same text payload, but no parent: not the same tree position
    assert_ne!(first, text_item("a"));

    // node payloads compare by handle identity, not structure
    let shared = node("N").build();
    let left = Item::new(GValue::Node(shared.clone()));
    let right = Item::new(GValue::Node(shared));
    assert_eq!(left, right);
    let rebuilt = Item::new(GValue::Node(node("N").build()));
    assert_ne!(left, rebuilt);
}

#[rstest]
fn duplicate_reparents_the_source_children() {
    let parent = parent_with(&["a", "b"]);
    let copy = parent.duplicate();
    assert_eq!(copy.child_count(), 2);
    assert_indexed(&copy);
    assert_eq!(labels(&copy), vec!["a", "b"]);
}
