//! Ordered view of active locations keyed by assignment load.
//!
//! The sort key is `(active_count, id)`, which changes under mutation; every
//! rekey goes through remove-then-reinsert so the set never observes a key
//! change in place.

use crate::location::LocationId;
use std::collections::BTreeSet;

/// Ordered set of `(active_count, id)` entries over the currently active
/// locations. A location is absent exactly while it is removed and not yet
/// re-added.
#[derive(Debug, Default)]
pub struct BalanceOrdering {
    entries: BTreeSet<(u32, LocationId)>,
}

impl BalanceOrdering {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, count: u32, id: LocationId) {
        self.entries.insert((count, id));
    }

    /// Removes the entry for `id` at `count`. Returns whether it was present.
    pub fn remove(&mut self, count: u32, id: &LocationId) -> bool {
        self.entries.remove(&(count, id.clone()))
    }

    pub fn contains(&self, count: u32, id: &LocationId) -> bool {
        self.entries.contains(&(count, id.clone()))
    }

    /// Rekeys `id` from `old_count` to `new_count`.
    pub fn update(&mut self, id: &LocationId, old_count: u32, new_count: u32) {
        let removed = self.entries.remove(&(old_count, id.clone()));
        debug_assert!(removed, "ordering out of sync for {}", id);
        self.entries.insert((new_count, id.clone()));
    }

    pub fn min(&self) -> Option<&(u32, LocationId)> {
        self.entries.first()
    }

    pub fn max(&self) -> Option<&(u32, LocationId)> {
        self.entries.last()
    }

    pub fn pop_min(&mut self) -> Option<(u32, LocationId)> {
        self.entries.pop_first()
    }

    /// Entries in `(count, id)` order.
    pub fn iter(&self) -> impl Iterator<Item = &(u32, LocationId)> {
        self.entries.iter()
    }
}
