//! Arena-allocated red-black tree with single-pass top-down insert and remove.
//!
//! Nodes live in a `Slab` and refer to each other by index. The tree keeps a
//! false root (`head`) whose right link is the real root; the sentinel index
//! `HEAD` addresses it so rotations at the top of the tree need no special
//! casing.

use super::cursor::{Cursor, Iter};
use super::IndexPolicy;
use slab::Slab;
use std::cmp::Ordering;
use std::mem;
use tracing::debug;

/// Tallest tree a traversal cursor can walk.
///
/// A red-black tree of height 64 holds far more nodes than fit in memory, so
/// exceeding it means the tree is corrupted.
pub const MAX_HEIGHT: usize = 64;

pub(super) type NodeId = usize;

pub(super) const LEFT: usize = 0;
pub(super) const RIGHT: usize = 1;

/// Sentinel index of the false root.
const HEAD: NodeId = usize::MAX;

struct Node<T> {
    item: T,
    red: bool,
    link: [Option<NodeId>; 2],
}

impl<T> Node<T> {
    fn new(item: T) -> Self {
        Self {
            item,
            red: true,
            link: [None, None],
        }
    }
}

/// Ordered container of unique items.
pub struct OrderedIndex<T, P: IndexPolicy<T>> {
    nodes: Slab<Node<T>>,
    /// False root; `head[RIGHT]` is the real root and `head[LEFT]` stays empty.
    head: [Option<NodeId>; 2],
    policy: P,
    /// Maximum number of items (`None` = unbounded).
    limit: Option<usize>,
}

#[cold]
fn corrupted(what: &str) -> ! {
    panic!("red-black tree corrupted: {what}");
}

impl<T, P: IndexPolicy<T>> OrderedIndex<T, P> {
    /// Create an empty, unbounded index.
    pub fn new(policy: P) -> Self {
        Self {
            nodes: Slab::new(),
            head: [None, None],
            policy,
            limit: None,
        }
    }

    /// Create an empty index that refuses inserts beyond `limit` items.
    pub fn with_limit(policy: P, limit: usize) -> Self {
        Self {
            nodes: Slab::with_capacity(limit.min(1024)),
            head: [None, None],
            policy,
            limit: Some(limit),
        }
    }

    /// Number of items in the index.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.limit.map_or(false, |limit| self.nodes.len() >= limit)
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Find the item stored under `key`.
    pub fn search(&self, key: &P::Key) -> Option<&T> {
        let mut it = self.root();
        while let Some(id) = it {
            let node = &self.nodes[id];
            match self.policy.compare(self.policy.key(&node.item), key) {
                Ordering::Equal => return Some(&node.item),
                ord => it = node.link[(ord == Ordering::Less) as usize],
            }
        }
        None
    }

    pub fn contains(&self, key: &P::Key) -> bool {
        self.search(key).is_some()
    }

    /// Insert an item. Returns `false` if its key is already present or the
    /// index is full; the tree is left untouched in both cases.
    pub fn insert(&mut self, item: T) -> bool {
        self.try_insert(item).is_ok()
    }

    /// Insert an item, handing it back if it could not be stored.
    pub fn try_insert(&mut self, item: T) -> Result<(), T> {
        if self.is_full() || self.contains(self.policy.key(&item)) {
            return Err(item);
        }

        let new = self.nodes.insert(Node::new(item));
        let Some(root) = self.root() else {
            self.head[RIGHT] = Some(new);
            self.set_red(new, false);
            return Ok(());
        };

        // Great-grandparent, grandparent, parent and iterator.
        let mut t = HEAD;
        let mut g: Option<NodeId> = None;
        let mut p: Option<NodeId> = None;
        let mut q = Some(root);
        let mut dir = LEFT;
        let mut last = LEFT;

        loop {
            let (qid, attached) = match q {
                None => {
                    let parent = p.unwrap_or_else(|| corrupted("null link above the root"));
                    self.set_link(parent, dir, Some(new));
                    (new, true)
                }
                Some(id) => {
                    if self.is_red(self.link(id, LEFT)) && self.is_red(self.link(id, RIGHT)) {
                        // Colour flip pushes the red violation upwards.
                        self.set_red(id, true);
                        self.paint(self.link(id, LEFT), false);
                        self.paint(self.link(id, RIGHT), false);
                    }
                    (id, false)
                }
            };

            if let Some(pid) = p {
                if self.is_red(Some(qid)) && self.is_red(Some(pid)) {
                    let gid = g.unwrap_or_else(|| corrupted("red child of a red root"));
                    let dir2 = (self.link(t, RIGHT) == Some(gid)) as usize;
                    let top = if self.link(pid, last) == Some(qid) {
                        self.rotate_single(gid, 1 - last)
                    } else {
                        self.rotate_double(gid, 1 - last)
                    };
                    self.set_link(t, dir2, Some(top));
                }
            }

            if attached {
                break;
            }

            let ord = self.policy.compare(
                self.policy.key(&self.nodes[qid].item),
                self.policy.key(&self.nodes[new].item),
            );
            last = dir;
            dir = (ord == Ordering::Less) as usize;

            if let Some(gid) = g {
                t = gid;
            }
            g = p;
            p = Some(qid);
            q = self.link(qid, dir);
        }

        self.blacken_root();
        Ok(())
    }

    /// Remove the item stored under `key`, handing it to the policy's
    /// destructor. Returns `false` if the key is absent.
    pub fn remove(&mut self, key: &P::Key) -> bool {
        match self.take(key) {
            Some(item) => {
                self.policy.destroy(item);
                true
            }
            None => false,
        }
    }

    /// Remove the item stored under `key` and return it to the caller
    /// without running the destructor.
    pub fn take(&mut self, key: &P::Key) -> Option<T> {
        self.root()?;

        let mut q = HEAD;
        let mut p = HEAD;
        let mut g = HEAD;
        let mut found = None;
        let mut dir = RIGHT;

        // Push a red node down so the node finally unlinked is red.
        while let Some(next) = self.link(q, dir) {
            let last = dir;
            g = p;
            p = q;
            q = next;

            let ord = self
                .policy
                .compare(self.policy.key(&self.nodes[q].item), key);
            dir = (ord == Ordering::Less) as usize;
            if ord == Ordering::Equal {
                found = Some(q);
            }

            if self.is_red(Some(q)) || self.is_red(self.link(q, dir)) {
                continue;
            }

            if self.is_red(self.link(q, 1 - dir)) {
                let top = self.rotate_single(q, dir);
                self.set_link(p, last, Some(top));
                p = top;
            } else if let Some(s) = self.link(p, 1 - last) {
                if !self.is_red(self.link(s, 1 - last)) && !self.is_red(self.link(s, last)) {
                    self.set_red(p, false);
                    self.set_red(s, true);
                    self.set_red(q, true);
                } else {
                    let dir2 = (self.link(g, RIGHT) == Some(p)) as usize;
                    let top = if self.is_red(self.link(s, last)) {
                        self.rotate_double(p, last)
                    } else {
                        self.rotate_single(p, last)
                    };
                    self.set_link(g, dir2, Some(top));

                    self.set_red(q, true);
                    self.set_red(top, true);
                    self.paint(self.link(top, LEFT), false);
                    self.paint(self.link(top, RIGHT), false);
                }
            }
        }

        let removed = found.map(|f| {
            // `q` is the last node visited and has at most one child.
            let side = (self.link(p, RIGHT) == Some(q)) as usize;
            let child = self.link(q, self.link(q, LEFT).is_none() as usize);
            self.set_link(p, side, child);

            let leaf = self.nodes.remove(q);
            if f == q {
                leaf.item
            } else {
                mem::replace(&mut self.nodes[f].item, leaf.item)
            }
        });

        self.blacken_root();
        removed
    }

    /// Remove every item, running the destructor on each exactly once.
    ///
    /// Left links are rotated away so the tree is consumed like a list,
    /// without recursion.
    pub fn clear(&mut self) {
        let mut it = self.head[RIGHT].take();
        while let Some(id) = it {
            match self.nodes[id].link[LEFT] {
                None => {
                    let node = self.nodes.remove(id);
                    it = node.link[RIGHT];
                    self.policy.destroy(node.item);
                }
                Some(save) => {
                    self.nodes[id].link[LEFT] = self.nodes[save].link[RIGHT];
                    self.nodes[save].link[RIGHT] = Some(id);
                    it = Some(save);
                }
            }
        }
    }

    /// A cursor positioned before the first item.
    pub fn cursor(&self) -> Cursor<'_, T, P> {
        Cursor::new(self)
    }

    /// Items in ascending key order.
    pub fn iter(&self) -> Iter<'_, T, P> {
        Iter::new(self.cursor())
    }

    /// Log every item through the policy's describer.
    pub fn dump(&self, label: &str) {
        for item in self.iter() {
            debug!(index = label, item = %self.policy.describe(item), "Index entry");
        }
    }

    pub(super) fn root(&self) -> Option<NodeId> {
        self.head[RIGHT]
    }

    pub(super) fn child(&self, id: NodeId, dir: usize) -> Option<NodeId> {
        self.nodes[id].link[dir]
    }

    pub(super) fn item(&self, id: NodeId) -> &T {
        &self.nodes[id].item
    }

    fn link(&self, id: NodeId, dir: usize) -> Option<NodeId> {
        if id == HEAD {
            self.head[dir]
        } else {
            self.nodes[id].link[dir]
        }
    }

    fn set_link(&mut self, id: NodeId, dir: usize, to: Option<NodeId>) {
        if id == HEAD {
            self.head[dir] = to;
        } else {
            self.nodes[id].link[dir] = to;
        }
    }

    fn is_red(&self, id: Option<NodeId>) -> bool {
        id.and_then(|id| self.nodes.get(id)).map_or(false, |n| n.red)
    }

    fn set_red(&mut self, id: NodeId, red: bool) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.red = red;
        }
    }

    fn paint(&mut self, id: Option<NodeId>, red: bool) {
        if let Some(id) = id {
            self.set_red(id, red);
        }
    }

    fn blacken_root(&mut self) {
        if let Some(root) = self.root() {
            self.set_red(root, false);
        }
    }

    /// Rotate `root` towards `dir`; returns the new subtree root.
    fn rotate_single(&mut self, root: NodeId, dir: usize) -> NodeId {
        let save = self
            .link(root, 1 - dir)
            .unwrap_or_else(|| corrupted("rotation without a child"));
        let inner = self.link(save, dir);
        self.set_link(root, 1 - dir, inner);
        self.set_link(save, dir, Some(root));

        self.set_red(root, true);
        self.set_red(save, false);
        save
    }

    fn rotate_double(&mut self, root: NodeId, dir: usize) -> NodeId {
        let child = self
            .link(root, 1 - dir)
            .unwrap_or_else(|| corrupted("double rotation without a child"));
        let top = self.rotate_single(child, 1 - dir);
        self.set_link(root, 1 - dir, Some(top));
        self.rotate_single(root, dir)
    }

    /// Verify every red-black invariant and return the black height.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) -> usize {
        assert!(!self.is_red(self.root()), "root must be black");
        assert!(self.head[LEFT].is_none(), "false root grew a left link");
        let height = self.check_subtree(self.root());

        let mut count = 0;
        let mut prev: Option<&T> = None;
        for item in self.iter() {
            if let Some(prev) = prev {
                assert_eq!(
                    self.policy
                        .compare(self.policy.key(prev), self.policy.key(item)),
                    Ordering::Less,
                    "in-order traversal must be strictly increasing"
                );
            }
            prev = Some(item);
            count += 1;
        }
        assert_eq!(count, self.len(), "traversal must visit every item once");
        height
    }

    #[cfg(test)]
    fn check_subtree(&self, id: Option<NodeId>) -> usize {
        let Some(id) = id else { return 1 };
        let node = &self.nodes[id];
        if node.red {
            assert!(
                !self.is_red(node.link[LEFT]) && !self.is_red(node.link[RIGHT]),
                "red node with a red child"
            );
        }
        for (dir, child) in node.link.iter().enumerate() {
            if let Some(child) = child {
                let ord = self.policy.compare(
                    self.policy.key(&self.nodes[*child].item),
                    self.policy.key(&node.item),
                );
                let expected = if dir == LEFT {
                    Ordering::Less
                } else {
                    Ordering::Greater
                };
                assert_eq!(ord, expected, "search-tree order violated");
            }
        }
        let left = self.check_subtree(node.link[LEFT]);
        let right = self.check_subtree(node.link[RIGHT]);
        assert_eq!(left, right, "black height mismatch");
        left + usize::from(!node.red)
    }
}

impl<T, P: IndexPolicy<T>> Drop for OrderedIndex<T, P> {
    fn drop(&mut self) {
        self.clear();
    }
}
