//! The shadow tree mirrored from the source AST for the duration of a query.
//!
//! Each [`Item`] wraps one tree value and keeps the bookkeeping the source
//! tree cannot: a parent back-reference, the position among its siblings, and
//! an owned, mutable child list. Structural edits happen here; the source
//! tree is never touched, and a fresh AST is regenerated from the items once
//! a run that mutated the tree finishes.
//!
//! Ownership is strictly downward: an item owns its children (`Arc`), while
//! the parent link is a non-owning `Weak`, so dropping a root releases the
//! whole tree.

use std::fmt;
use std::sync::{Arc, RwLock, Weak};

use crate::tree::GValue;

#[derive(Debug)]
struct ItemInner {
    value: GValue,
    parent: RwLock<Option<Weak<ItemInner>>>,
    index: RwLock<usize>,
    children: RwLock<Vec<Item>>,
}

/// One node of the shadow tree: a payload plus parent/index/children
/// bookkeeping.
///
/// Cloning an `Item` clones the handle, not the subtree. Equality is
/// positional, deliberately weaker than structural comparison: two items are
/// equal when they carry the same payload (by node identity or text
/// content), hang off the same parent, and sit at the same child index. This
/// is what lets sequences detect "same tree position" during set operations.
#[derive(Clone)]
pub struct Item(Arc<ItemInner>);

impl Item {
    pub fn new(value: GValue) -> Self {
        Item(Arc::new(ItemInner {
            value,
            parent: RwLock::new(None),
            index: RwLock::new(0),
            children: RwLock::new(Vec::new()),
        }))
    }

    pub fn value(&self) -> &GValue {
        &self.0.value
    }

    pub fn parent(&self) -> Option<Item> {
        self.0
            .parent
            .read()
            .unwrap()
            .as_ref()
            .and_then(Weak::upgrade)
            .map(Item)
    }

    pub fn index(&self) -> usize {
        *self.0.index.read().unwrap()
    }

    pub fn children(&self) -> Vec<Item> {
        self.0.children.read().unwrap().clone()
    }

    pub fn child_count(&self) -> usize {
        self.0.children.read().unwrap().len()
    }

    fn set_parent(&self, parent: &Item) {
        *self.0.parent.write().unwrap() = Some(Arc::downgrade(&parent.0));
    }

    fn set_index(&self, index: usize) {
        *self.0.index.write().unwrap() = index;
    }

    /// Append a child, adopting it.
    pub fn add_child(&self, child: Item) {
        child.set_parent(self);
        let mut children = self.0.children.write().unwrap();
        child.set_index(children.len());
        children.push(child);
    }

    /// Insert a child at `index`, shifting and renumbering later siblings.
    /// `index` must be within `0..=child_count`.
    pub fn insert_child(&self, index: usize, child: Item) {
        child.set_parent(self);
        child.set_index(index);
        let mut children = self.0.children.write().unwrap();
        children.insert(index, child);
        for (position, sibling) in children.iter().enumerate().skip(index + 1) {
            sibling.set_index(position);
        }
    }

    /// Append several children, numbering them once.
    pub fn add_children(&self, items: Vec<Item>) {
        let mut children = self.0.children.write().unwrap();
        let mut index = children.len();
        for item in items {
            item.set_parent(self);
            item.set_index(index);
            children.push(item);
            index += 1;
        }
    }

    /// Insert several children at `index`, renumbering everything after the
    /// insertion point once. `index` must be within `0..=child_count`.
    pub fn insert_children(&self, index: usize, items: Vec<Item>) {
        let mut children = self.0.children.write().unwrap();
        for (offset, item) in items.iter().enumerate() {
            item.set_parent(self);
            item.set_index(index + offset);
        }
        let inserted = items.len();
        // the replaced range is empty, so the returned iterator is too
        let _ = children.splice(index..index, items);
        for (position, sibling) in children.iter().enumerate().skip(index + inserted) {
            sibling.set_index(position);
        }
    }

    /// Remove and return the child at `index`, renumbering later siblings.
    /// The removed item keeps its old parent link and index.
    pub fn remove_child(&self, index: usize) -> Item {
        let mut children = self.0.children.write().unwrap();
        let removed = children.remove(index);
        for (position, sibling) in children.iter().enumerate().skip(index) {
            sibling.set_index(position);
        }
        removed
    }

    /// Swap the child at `index` for another item. Sibling indices are
    /// untouched; this is the single-for-single fast path.
    pub fn replace_child(&self, index: usize, item: Item) {
        item.set_parent(self);
        item.set_index(index);
        let mut children = self.0.children.write().unwrap();
        children[index] = item;
    }

    /// Replace the child at `index` with several items: remove, then bulk
    /// insert at the same position.
    pub fn splice_child(&self, index: usize, items: Vec<Item>) {
        self.remove_child(index);
        self.insert_children(index, items);
    }

    /// Copy this item for template instantiation: same payload, parent link,
    /// and index, with the source's children re-adopted by the copy.
    pub fn duplicate(&self) -> Item {
        let copy = Item(Arc::new(ItemInner {
            value: self.0.value.clone(),
            parent: RwLock::new(self.0.parent.read().unwrap().clone()),
            index: RwLock::new(self.index()),
            children: RwLock::new(Vec::new()),
        }));
        copy.add_children(self.children());
        copy
    }
}

impl PartialEq for Item {
    fn eq(&self, other: &Self) -> bool {
        if self.0.value != other.0.value {
            return false;
        }
        let parents_match = {
            let ours = self.0.parent.read().unwrap();
            let theirs = other.0.parent.read().unwrap();
            match (ours.as_ref(), theirs.as_ref()) {
                (None, None) => true,
                (Some(a), Some(b)) => Weak::ptr_eq(a, b),
                _ => false,
            }
        };
        parents_match && self.index() == other.index()
    }
}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Item")
            .field("value", &self.0.value)
            .field("index", &self.index())
            .field("children", &self.child_count())
            .finish()
    }
}
