//! Atom Model
//!
//! Atoms are the typed, identity-bearing vertices and edges of the shared
//! graph. Node-shaped atoms carry a name, link-shaped atoms an ordered
//! outgoing set. Both carry a truth value.

pub mod hash;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use hash::{consistency_hash, AtomHash};

/// Stable atom identifier, assigned at creation and never reused
pub type AtomId = String;

/// Opaque cluster node identifier
pub type NodeId = String;

/// Strength/confidence pair attached to every atom
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TruthValue {
    /// Probability-like strength in [0, 1]
    pub strength: f64,
    /// Confidence in the strength, in [0, 1]
    pub confidence: f64,
}

impl TruthValue {
    /// Create a truth value, rejecting out-of-range or NaN components
    pub fn new(strength: f64, confidence: f64) -> Result<Self> {
        let tv = Self { strength, confidence };
        tv.validate()?;
        Ok(tv)
    }

    /// Check that both components lie in [0, 1]
    pub fn validate(&self) -> Result<()> {
        let in_range = |v: f64| (0.0..=1.0).contains(&v);
        if !in_range(self.strength) || !in_range(self.confidence) {
            return Err(Error::Validation(format!(
                "truth value ({}, {}) out of range [0, 1]",
                self.strength, self.confidence
            )));
        }
        Ok(())
    }
}

impl Default for TruthValue {
    fn default() -> Self {
        Self {
            strength: 1.0,
            confidence: 0.0,
        }
    }
}

/// A graph atom
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Atom {
    /// Stable identity
    pub id: AtomId,
    /// Type tag, e.g. "ConceptNode" or "InheritanceLink"
    pub atom_type: String,
    /// Name of a node-shaped atom
    #[serde(default)]
    pub name: Option<String>,
    /// Truth value
    pub truth_value: TruthValue,
    /// Ordered outgoing set of a link-shaped atom
    #[serde(default)]
    pub outgoing: Vec<AtomId>,
}

impl Atom {
    /// Create a node-shaped atom with a fresh id
    pub fn node(atom_type: impl Into<String>, name: impl Into<String>, truth_value: TruthValue) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            atom_type: atom_type.into(),
            name: Some(name.into()),
            truth_value,
            outgoing: Vec::new(),
        }
    }

    /// Create a link-shaped atom with a fresh id
    pub fn link(atom_type: impl Into<String>, outgoing: Vec<AtomId>, truth_value: TruthValue) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            atom_type: atom_type.into(),
            name: None,
            truth_value,
            outgoing,
        }
    }

    /// Whether this atom is link-shaped
    pub fn is_link(&self) -> bool {
        self.name.is_none()
    }

    /// Copy of this atom with a replaced truth value
    pub fn with_truth_value(&self, truth_value: TruthValue) -> Self {
        Self {
            truth_value,
            ..self.clone()
        }
    }

    /// Structural validation applied before any local write
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::Validation("atom id cannot be empty".into()));
        }
        if self.atom_type.is_empty() {
            return Err(Error::Validation(format!("atom {} has an empty type", self.id)));
        }
        if self.name.is_some() && !self.outgoing.is_empty() {
            return Err(Error::Validation(format!(
                "atom {} is both named and has an outgoing set",
                self.id
            )));
        }
        self.truth_value.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truth_value_bounds() {
        assert!(TruthValue::new(0.5, 0.9).is_ok());
        assert!(TruthValue::new(1.5, 0.9).is_err());
        assert!(TruthValue::new(0.5, -0.1).is_err());
        assert!(TruthValue::new(f64::NAN, 0.5).is_err());
    }

    #[test]
    fn test_node_and_link_shapes() {
        let cat = Atom::node("ConceptNode", "cat", TruthValue::default());
        let animal = Atom::node("ConceptNode", "animal", TruthValue::default());
        let link = Atom::link(
            "InheritanceLink",
            vec![cat.id.clone(), animal.id.clone()],
            TruthValue::default(),
        );

        assert!(!cat.is_link());
        assert!(link.is_link());
        assert_ne!(cat.id, animal.id);
        assert!(link.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_type() {
        let mut atom = Atom::node("ConceptNode", "x", TruthValue::default());
        atom.atom_type.clear();
        assert!(matches!(atom.validate(), Err(Error::Validation(_))));
    }
}
