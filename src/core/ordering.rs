//! Ordering index - the single canonical display sequence.
//!
//! Backed by an `IndexSet` kept in discovery order (oldest at set index 0).
//! Display order is newest-first, so display index `i` maps to set index
//! `len - 1 - i`. Prepending is an O(1) push; lookup by id is O(1).

use indexmap::IndexSet;

use super::item::ItemId;

#[derive(Debug, Default)]
pub struct OrderingIndex {
    ids: IndexSet<ItemId>,
}

impl OrderingIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put `id` at the front of the display order.
    /// Returns false (and changes nothing) if already present.
    pub fn push_front(&mut self, id: ItemId) -> bool {
        self.ids.insert(id)
    }

    /// Remove `id`, preserving the relative order of the rest
    pub fn remove(&mut self, id: &ItemId) -> bool {
        self.ids.shift_remove(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Identifier at display index (0 = newest)
    pub fn get(&self, index: usize) -> Option<&ItemId> {
        let len = self.ids.len();
        if index >= len {
            return None;
        }
        self.ids.get_index(len - 1 - index)
    }

    /// Display index of `id`
    pub fn position(&self, id: &ItemId) -> Option<usize> {
        self.ids.get_index_of(id).map(|i| self.ids.len() - 1 - i)
    }

    /// Iterate newest-first
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &ItemId> + ExactSizeIterator {
        self.ids.iter().rev()
    }

    /// Owned newest-first copy for handing to the UI
    pub fn to_vec(&self) -> Vec<ItemId> {
        self.iter().cloned().collect()
    }
}
