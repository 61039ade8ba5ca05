//! Local Atom Store
//!
//! Single-node atom storage. The distributed facade wraps an implementation
//! of [`AtomStore`] and is the only component that calls its mutating
//! methods while the node is running.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::atom::{Atom, AtomId, TruthValue};
use crate::error::{Error, Result};

/// Local single-node atom store
pub trait AtomStore: Send + Sync {
    /// Create a node-shaped atom and return it with its assigned id
    fn add_node(&self, atom_type: &str, name: &str, truth_value: TruthValue) -> Result<Atom>;

    /// Create a link-shaped atom; every outgoing id must already exist
    fn add_link(&self, atom_type: &str, outgoing: Vec<AtomId>, truth_value: TruthValue) -> Result<Atom>;

    /// Insert or fully replace an atom; returns true when it was new
    fn put_atom(&self, atom: Atom) -> Result<bool>;

    /// Delete an atom; returns true when it existed
    fn remove_atom(&self, id: &str) -> Result<bool>;

    /// Fetch one atom
    fn get_atom(&self, id: &str) -> Option<Atom>;

    /// Fetch every atom, ordered by id
    fn get_all_atoms(&self) -> Vec<Atom>;

    /// Number of stored atoms
    fn len(&self) -> usize;

    /// Whether the store is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory [`AtomStore`]
#[derive(Debug, Default)]
pub struct MemoryAtomStore {
    atoms: RwLock<BTreeMap<AtomId, Atom>>,
}

impl MemoryAtomStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-loaded with atoms (e.g. from a snapshot)
    pub fn with_atoms(atoms: impl IntoIterator<Item = Atom>) -> Self {
        let map = atoms.into_iter().map(|a| (a.id.clone(), a)).collect();
        Self {
            atoms: RwLock::new(map),
        }
    }

    // A panicking writer cannot leave a half-written BTreeMap entry behind,
    // so a poisoned lock is still safe to use.
    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<AtomId, Atom>> {
        self.atoms.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<AtomId, Atom>> {
        self.atoms.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl AtomStore for MemoryAtomStore {
    fn add_node(&self, atom_type: &str, name: &str, truth_value: TruthValue) -> Result<Atom> {
        let atom = Atom::node(atom_type, name, truth_value);
        atom.validate()?;
        self.write().insert(atom.id.clone(), atom.clone());
        Ok(atom)
    }

    fn add_link(&self, atom_type: &str, outgoing: Vec<AtomId>, truth_value: TruthValue) -> Result<Atom> {
        let atom = Atom::link(atom_type, outgoing, truth_value);
        atom.validate()?;

        let mut atoms = self.write();
        if let Some(missing) = atom.outgoing.iter().find(|id| !atoms.contains_key(*id)) {
            return Err(Error::Validation(format!(
                "link references unknown atom {}",
                missing
            )));
        }
        atoms.insert(atom.id.clone(), atom.clone());
        Ok(atom)
    }

    fn put_atom(&self, atom: Atom) -> Result<bool> {
        atom.validate()?;
        Ok(self.write().insert(atom.id.clone(), atom).is_none())
    }

    fn remove_atom(&self, id: &str) -> Result<bool> {
        Ok(self.write().remove(id).is_some())
    }

    fn get_atom(&self, id: &str) -> Option<Atom> {
        self.read().get(id).cloned()
    }

    fn get_all_atoms(&self) -> Vec<Atom> {
        self.read().values().cloned().collect()
    }

    fn len(&self) -> usize {
        self.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_get() {
        let store = MemoryAtomStore::new();
        let cat = store.add_node("ConceptNode", "cat", TruthValue::default()).unwrap();
        let animal = store.add_node("ConceptNode", "animal", TruthValue::default()).unwrap();
        let link = store
            .add_link("InheritanceLink", vec![cat.id.clone(), animal.id.clone()], TruthValue::default())
            .unwrap();

        assert_eq!(store.len(), 3);
        assert_eq!(store.get_atom(&link.id).unwrap().outgoing, vec![cat.id, animal.id]);
    }

    #[test]
    fn test_link_to_unknown_atom_rejected() {
        let store = MemoryAtomStore::new();
        let result = store.add_link("ListLink", vec!["missing".into()], TruthValue::default());
        assert!(matches!(result, Err(Error::Validation(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn test_put_and_remove_are_idempotent() {
        let store = MemoryAtomStore::new();
        let atom = Atom::node("ConceptNode", "dog", TruthValue::default());

        assert!(store.put_atom(atom.clone()).unwrap());
        assert!(!store.put_atom(atom.clone()).unwrap());
        assert!(store.remove_atom(&atom.id).unwrap());
        assert!(!store.remove_atom(&atom.id).unwrap());
    }

    #[test]
    fn test_put_rejects_invalid_truth_value() {
        let store = MemoryAtomStore::new();
        let mut atom = Atom::node("ConceptNode", "dog", TruthValue::default());
        atom.truth_value.strength = 2.0;
        assert!(store.put_atom(atom).is_err());
    }
}
