//! Leaf-level diff between two variable trees.
//!
//! Used to report what a step changed: which running statistics moved,
//! which parameters were updated, and by how much.

use serde::{Deserialize, Serialize};

use super::node::VariableTree;

// ---------------------------------------------------------------------------
// LeafChange
// ---------------------------------------------------------------------------

/// A change to a single leaf present in both trees.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeafChange {
    pub path: String,
    /// Largest absolute element-wise difference. `None` when the shape changed.
    pub max_abs_delta: Option<f64>,
    pub old_shape: Vec<usize>,
    pub new_shape: Vec<usize>,
}

impl LeafChange {
    pub fn shape_changed(&self) -> bool {
        self.old_shape != self.new_shape
    }
}

// ---------------------------------------------------------------------------
// TreeDiff
// ---------------------------------------------------------------------------

/// The complete diff between two trees.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TreeDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<LeafChange>,
}

impl TreeDiff {
    /// Compute the diff between two trees. Leaves are compared exactly.
    pub fn compute(old: &VariableTree, new: &VariableTree) -> Self {
        let old_leaves = old.flatten();
        let new_leaves = new.flatten();

        let added = new_leaves
            .keys()
            .filter(|k| !old_leaves.contains_key(*k))
            .cloned()
            .collect();
        let removed = old_leaves
            .keys()
            .filter(|k| !new_leaves.contains_key(*k))
            .cloned()
            .collect();

        let mut changed = Vec::new();
        for (path, before) in &old_leaves {
            let after = match new_leaves.get(path) {
                Some(a) => a,
                None => continue,
            };
            if before == after {
                continue;
            }
            changed.push(LeafChange {
                path: path.clone(),
                max_abs_delta: before.max_abs_diff(after).ok(),
                old_shape: before.shape().to_vec(),
                new_shape: after.shape().to_vec(),
            });
        }

        TreeDiff {
            added,
            removed,
            changed,
        }
    }

    /// Whether the diff contains no changes at all.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    pub fn change_count(&self) -> usize {
        self.added.len() + self.removed.len() + self.changed.len()
    }

    /// Changed leaves that belong to `collection`.
    pub fn changed_in<'a>(&'a self, collection: &'a str) -> impl Iterator<Item = &'a LeafChange> {
        self.changed.iter().filter(move |c| {
            c.path
                .split('/')
                .next()
                .map(|first| first == collection)
                .unwrap_or(false)
        })
    }

    /// Produce a human-readable summary of the diff.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if !self.added.is_empty() {
            parts.push(format!("{} leaf(s) added", self.added.len()));
        }
        if !self.removed.is_empty() {
            parts.push(format!("{} leaf(s) removed", self.removed.len()));
        }
        if !self.changed.is_empty() {
            let reshaped = self.changed.iter().filter(|c| c.shape_changed()).count();
            if reshaped > 0 {
                parts.push(format!(
                    "{} leaf(s) changed ({} reshaped)",
                    self.changed.len(),
                    reshaped
                ));
            } else {
                parts.push(format!("{} leaf(s) changed", self.changed.len()));
            }
        }
        if parts.is_empty() {
            "no changes".to_string()
        } else {
            parts.join(", ")
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
