//! Snapshot Persistence
//!
//! Atoms are loaded from a JSON snapshot at process start and written back
//! at stop. Replica sets and the update log are never persisted.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::atom::Atom;
use crate::error::Result;

/// On-disk snapshot layout
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    node_id: String,
    saved_at: chrono::DateTime<chrono::Utc>,
    atoms: Vec<Atom>,
}

/// JSON atom snapshot at a fixed path
#[derive(Debug, Clone)]
pub struct Snapshot {
    path: PathBuf,
}

impl Snapshot {
    /// Create a snapshot handle
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Snapshot path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load atoms; a missing file is an empty snapshot
    pub fn load(&self) -> Result<Vec<Atom>> {
        if !self.path.exists() {
            tracing::info!("No snapshot at {:?}, starting empty", self.path);
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(&self.path)?;
        let file: SnapshotFile = serde_json::from_str(&content)?;
        tracing::info!(
            "Loaded {} atoms from snapshot written by {} at {}",
            file.atoms.len(),
            file.node_id,
            file.saved_at
        );
        Ok(file.atoms)
    }

    /// Write atoms, replacing the previous snapshot atomically
    pub fn save(&self, node_id: &str, atoms: Vec<Atom>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = SnapshotFile {
            node_id: node_id.to_string(),
            saved_at: chrono::Utc::now(),
            atoms,
        };
        let body = serde_json::to_string_pretty(&file)?;

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &self.path)?;

        tracing::info!("Saved {} atoms to {:?}", file.atoms.len(), self.path);
        Ok(())
    }
}
