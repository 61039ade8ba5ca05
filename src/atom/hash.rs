//! Consistency hashing
//!
//! Digest over the semantic fields of an atom: id, type and truth value.
//! The outgoing set and the node name are not part of the digest, so
//! divergence in link contents alone is invisible to the audit.

use sha2::{Digest, Sha256};

use super::Atom;

/// Hex-encoded SHA-256 consistency digest
pub type AtomHash = String;

/// Compute the consistency hash of an atom
pub fn consistency_hash(atom: &Atom) -> AtomHash {
    let mut hasher = Sha256::new();

    // Length prefixes keep ("ab", "c") and ("a", "bc") apart
    hasher.update((atom.id.len() as u64).to_le_bytes());
    hasher.update(atom.id.as_bytes());
    hasher.update((atom.atom_type.len() as u64).to_le_bytes());
    hasher.update(atom.atom_type.as_bytes());
    hasher.update(canonical_bits(atom.truth_value.strength).to_le_bytes());
    hasher.update(canonical_bits(atom.truth_value.confidence).to_le_bytes());

    hex::encode(hasher.finalize())
}

/// -0.0 and 0.0 compare equal and must hash equal
fn canonical_bits(value: f64) -> u64 {
    if value == 0.0 {
        0.0f64.to_bits()
    } else {
        value.to_bits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::TruthValue;

    fn sample() -> Atom {
        Atom {
            id: "a-1".to_string(),
            atom_type: "ConceptNode".to_string(),
            name: Some("cat".to_string()),
            truth_value: TruthValue { strength: 0.8, confidence: 0.4 },
            outgoing: Vec::new(),
        }
    }

    #[test]
    fn test_hash_is_deterministic() {
        let atom = sample();
        assert_eq!(consistency_hash(&atom), consistency_hash(&atom.clone()));
        assert_eq!(consistency_hash(&atom).len(), 64);
    }

    #[test]
    fn test_hash_covers_truth_value() {
        let atom = sample();
        let changed = atom.with_truth_value(TruthValue { strength: 0.81, confidence: 0.4 });
        assert_ne!(consistency_hash(&atom), consistency_hash(&changed));
    }

    #[test]
    fn test_hash_ignores_outgoing_set() {
        let mut a = sample();
        a.name = None;
        let mut b = a.clone();
        a.outgoing = vec!["x".into()];
        b.outgoing = vec!["y".into(), "z".into()];
        assert_eq!(consistency_hash(&a), consistency_hash(&b));
    }

    #[test]
    fn test_negative_zero_hashes_like_zero() {
        let a = sample().with_truth_value(TruthValue { strength: 0.0, confidence: 0.5 });
        let b = sample().with_truth_value(TruthValue { strength: -0.0, confidence: 0.5 });
        assert_eq!(consistency_hash(&a), consistency_hash(&b));
    }

    #[test]
    fn test_length_prefix_separates_fields() {
        let mut a = sample();
        a.id = "ab".into();
        a.atom_type = "c".into();
        let mut b = sample();
        b.id = "a".into();
        b.atom_type = "bc".into();
        assert_ne!(consistency_hash(&a), consistency_hash(&b));
    }
}
