//! Insertion-ordered dedup by URL for sources and images (spec.md §4.E):
//! a `Vec` paired with a `HashSet<String>` seen-set, since a plain pair of
//! std collections is all this needs over pulling in `indexmap`.

use std::collections::HashSet;

pub struct OrderedDedup<T> {
    seen: HashSet<String>,
    items: Vec<T>,
}

impl<T> Default for OrderedDedup<T> {
    fn default() -> Self {
        Self {
            seen: HashSet::new(),
            items: Vec::new(),
        }
    }
}

impl<T> OrderedDedup<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `item` keyed by `url` if not already seen. Returns `true` if
    /// it was newly inserted.
    pub fn insert(&mut self, url: &str, item: T) -> bool {
        if self.seen.insert(url.to_string()) {
            self.items.push(item);
            true
        } else {
            false
        }
    }

    pub fn into_items(self) -> Vec<T> {
        self.items
    }
}
