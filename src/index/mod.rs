//! Ordered index backed by a top-down red-black tree.
//!
//! The same structure serves two roles in the server:
//! - the response cache, keyed by resource path
//! - the connection timer set, keyed by connection token
//!
//! Each role supplies an [`IndexPolicy`] that tells the tree how to extract
//! and compare keys, how to dispose of items that leave the tree, and how to
//! describe an item for diagnostics.
//!
//! The tree itself is not synchronized; owners wrap it in a `Mutex`.

mod cursor;
mod rbtree;

pub use cursor::{Cursor, Iter};
pub use rbtree::{OrderedIndex, MAX_HEIGHT};

use std::cmp::Ordering;

/// Capabilities the index needs from the items it stores.
pub trait IndexPolicy<T> {
    /// Key type items are ordered by.
    type Key: ?Sized;

    /// Borrow the key of an item.
    fn key<'a>(&self, item: &'a T) -> &'a Self::Key;

    /// Total order over keys. `Equal` means "same key".
    fn compare(&self, a: &Self::Key, b: &Self::Key) -> Ordering;

    /// Dispose of an item removed from the index.
    fn destroy(&self, item: T) {
        drop(item);
    }

    /// Short human-readable description used when dumping the index.
    fn describe(&self, item: &T) -> String;
}
