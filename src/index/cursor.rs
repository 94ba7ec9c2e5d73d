//! In-order traversal with an explicit ancestor stack.

use super::rbtree::{NodeId, OrderedIndex, LEFT, MAX_HEIGHT, RIGHT};
use super::IndexPolicy;

/// Bidirectional traversal position inside an [`OrderedIndex`].
///
/// The cursor borrows the tree, so the tree cannot change underneath it.
/// Callers that evict while walking collect the keys first and remove them
/// once the cursor is dropped.
pub struct Cursor<'a, T, P: IndexPolicy<T>> {
    tree: &'a OrderedIndex<T, P>,
    it: Option<NodeId>,
    path: Vec<NodeId>,
}

impl<'a, T, P: IndexPolicy<T>> Cursor<'a, T, P> {
    pub(super) fn new(tree: &'a OrderedIndex<T, P>) -> Self {
        Self {
            tree,
            it: None,
            path: Vec::with_capacity(MAX_HEIGHT),
        }
    }

    /// Move to the smallest item.
    pub fn first(&mut self) -> Option<&'a T> {
        self.start(LEFT)
    }

    /// Move to the largest item.
    pub fn last(&mut self) -> Option<&'a T> {
        self.start(RIGHT)
    }

    /// Move to the next item in ascending order.
    pub fn next(&mut self) -> Option<&'a T> {
        self.step(RIGHT)
    }

    /// Move to the next item in descending order.
    pub fn prev(&mut self) -> Option<&'a T> {
        self.step(LEFT)
    }

    /// Item under the cursor.
    pub fn current(&self) -> Option<&'a T> {
        let tree = self.tree;
        self.it.map(|id| tree.item(id))
    }

    fn push(&mut self, id: NodeId) {
        if self.path.len() == MAX_HEIGHT {
            panic!("traversal deeper than {MAX_HEIGHT} levels: index corrupted");
        }
        self.path.push(id);
    }

    fn start(&mut self, dir: usize) -> Option<&'a T> {
        self.path.clear();
        self.it = self.tree.root();

        if let Some(mut id) = self.it {
            while let Some(child) = self.tree.child(id, dir) {
                self.push(id);
                id = child;
            }
            self.it = Some(id);
        }
        self.current()
    }

    fn step(&mut self, dir: usize) -> Option<&'a T> {
        let cur = self.it?;

        if let Some(child) = self.tree.child(cur, dir) {
            // Leftmost (or rightmost) node of the subtree on `dir`.
            self.push(cur);
            let mut id = child;
            while let Some(next) = self.tree.child(id, 1 - dir) {
                self.push(id);
                id = next;
            }
            self.it = Some(id);
        } else {
            // Climb until we arrive from the other side.
            let mut last = cur;
            self.it = None;
            while let Some(parent) = self.path.pop() {
                if self.tree.child(parent, dir) != Some(last) {
                    self.it = Some(parent);
                    break;
                }
                last = parent;
            }
        }
        self.current()
    }
}

/// Ascending iterator over an [`OrderedIndex`].
pub struct Iter<'a, T, P: IndexPolicy<T>> {
    cursor: Cursor<'a, T, P>,
    started: bool,
}

impl<'a, T, P: IndexPolicy<T>> Iter<'a, T, P> {
    pub(super) fn new(cursor: Cursor<'a, T, P>) -> Self {
        Self {
            cursor,
            started: false,
        }
    }
}

impl<'a, T, P: IndexPolicy<T>> Iterator for Iter<'a, T, P> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        if self.started {
            self.cursor.next()
        } else {
            self.started = true;
            self.cursor.first()
        }
    }
}
