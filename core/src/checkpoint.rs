//! Tree and checkpoint persistence.
//!
//! Trees are stored as pretty-printed JSON. A checkpoint pairs the full
//! variable tree with the number of steps taken to produce it.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::tree::VariableTree;

// ---------------------------------------------------------------------------
// Tree persistence
// ---------------------------------------------------------------------------

/// Save a tree to a JSON file.
pub fn save_tree(tree: &VariableTree, path: &Path) -> Result<(), StoreError> {
    let json = serde_json::to_string_pretty(tree)?;
    std::fs::write(path, json)?;
    Ok(())
}

/// Load a tree from a JSON file.
pub fn load_tree(path: &Path) -> Result<VariableTree, StoreError> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Save only if the tree differs from `last_saved`.
///
/// Returns `true` when a file was written; `last_saved` then holds the new
/// tree.
pub fn save_if_changed(
    tree: &VariableTree,
    path: &Path,
    last_saved: &mut Option<VariableTree>,
) -> Result<bool, StoreError> {
    if last_saved.as_ref() == Some(tree) {
        return Ok(false);
    }
    save_tree(tree, path)?;
    *last_saved = Some(tree.clone());
    Ok(true)
}

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

/// The variables of a run after `step` optimizer steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub step: u64,
    pub variables: VariableTree,
}

impl Checkpoint {
    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
