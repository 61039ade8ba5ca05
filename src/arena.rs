//! Dense atom index
//!
//! Interns atom ids into stable `u32` slots so per-atom tables can live in
//! plain vectors. A slot is never reassigned to a different id, even after
//! the table entry it points to has been cleared.

use std::collections::HashMap;

use crate::atom::AtomId;

/// Stable slot handed out by [`AtomIndex`]
pub type Slot = u32;

/// Atom id → slot interner
#[derive(Debug, Default)]
pub struct AtomIndex {
    ids: Vec<AtomId>,
    lookup: HashMap<AtomId, Slot>,
}

impl AtomIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the slot for `id`, allocating one on first sight
    pub fn intern(&mut self, id: &str) -> Slot {
        if let Some(slot) = self.lookup.get(id) {
            return *slot;
        }
        let slot = self.ids.len() as Slot;
        self.ids.push(id.to_string());
        self.lookup.insert(id.to_string(), slot);
        slot
    }

    /// Slot for `id` if it has been interned
    pub fn get(&self, id: &str) -> Option<Slot> {
        self.lookup.get(id).copied()
    }

    /// Atom id stored at `slot`
    pub fn id(&self, slot: Slot) -> Option<&str> {
        self.ids.get(slot as usize).map(String::as_str)
    }

    /// Number of interned ids
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether nothing has been interned
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Vector of optional values addressed by [`AtomIndex`] slots
#[derive(Debug)]
pub struct SlotTable<T> {
    index: AtomIndex,
    values: Vec<Option<T>>,
}

impl<T> Default for SlotTable<T> {
    fn default() -> Self {
        Self {
            index: AtomIndex::new(),
            values: Vec::new(),
        }
    }
}

impl<T> SlotTable<T> {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the value for `id`, returning the previous one
    pub fn insert(&mut self, id: &str, value: T) -> Option<T> {
        let slot = self.index.intern(id) as usize;
        if slot >= self.values.len() {
            self.values.resize_with(slot + 1, || None);
        }
        self.values[slot].replace(value)
    }

    /// Value for `id`
    pub fn get(&self, id: &str) -> Option<&T> {
        let slot = self.index.get(id)? as usize;
        self.values.get(slot)?.as_ref()
    }

    /// Mutable value for `id`
    pub fn get_mut(&mut self, id: &str) -> Option<&mut T> {
        let slot = self.index.get(id)? as usize;
        self.values.get_mut(slot)?.as_mut()
    }

    /// Clear the value for `id`; the slot stays reserved
    pub fn remove(&mut self, id: &str) -> Option<T> {
        let slot = self.index.get(id)? as usize;
        self.values.get_mut(slot)?.take()
    }

    /// Iterate over occupied entries in slot order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.values.iter().enumerate().filter_map(move |(slot, value)| {
            let value = value.as_ref()?;
            let id = self.index.id(slot as Slot)?;
            Some((id, value))
        })
    }

    /// Number of occupied entries
    pub fn len(&self) -> usize {
        self.values.iter().filter(|v| v.is_some()).count()
    }

    /// Whether no entry is occupied
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_is_stable() {
        let mut index = AtomIndex::new();
        let a = index.intern("a");
        let b = index.intern("b");
        assert_eq!(index.intern("a"), a);
        assert_ne!(a, b);
        assert_eq!(index.id(b), Some("b"));
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_slot_survives_removal() {
        let mut table = SlotTable::new();
        table.insert("x", 1);
        table.insert("y", 2);
        assert_eq!(table.remove("x"), Some(1));
        assert!(table.get("x").is_none());
        assert_eq!(table.len(), 1);

        table.insert("x", 3);
        assert_eq!(table.get("x"), Some(&3));
        let ids: Vec<&str> = table.iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["x", "y"]);
    }
}
