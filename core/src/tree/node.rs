//! The variable tree: named collections of nested arrays.
//!
//! A `VariableTree` maps collection names (`params`, `batch_stats`, ...) to
//! nodes. A node is either a leaf `Array` or a branch of further named
//! nodes. All lookups go through explicit key paths and return `Result`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::array::Array;
use super::path::{self, KeyPath};
use crate::error::TreeError;

/// Branch contents, ordered by key.
pub type Branch = BTreeMap<String, Node>;

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// A value in the tree: a leaf array or a branch of named children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Node {
    Leaf(Array),
    Branch(Branch),
}

impl Node {
    /// An empty branch.
    pub fn branch() -> Self {
        Node::Branch(BTreeMap::new())
    }

    pub fn as_leaf(&self) -> Option<&Array> {
        match self {
            Node::Leaf(a) => Some(a),
            Node::Branch(_) => None,
        }
    }

    pub fn as_branch(&self) -> Option<&Branch> {
        match self {
            Node::Branch(b) => Some(b),
            Node::Leaf(_) => None,
        }
    }

    /// Number of leaves under this node (1 for a leaf).
    pub fn leaf_count(&self) -> usize {
        match self {
            Node::Leaf(_) => 1,
            Node::Branch(b) => b.values().map(Node::leaf_count).sum(),
        }
    }

    /// Total number of array elements under this node.
    pub fn element_count(&self) -> usize {
        match self {
            Node::Leaf(a) => a.len(),
            Node::Branch(b) => b.values().map(Node::element_count).sum(),
        }
    }
}

impl From<Array> for Node {
    fn from(a: Array) -> Self {
        Node::Leaf(a)
    }
}

// ---------------------------------------------------------------------------
// VariableTree
// ---------------------------------------------------------------------------

/// All named values owned by a computation, grouped into collections.
///
/// Collection names are unique by construction. Equality ignores insertion
/// order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "Branch", into = "Branch")]
pub struct VariableTree {
    collections: Branch,
}

impl TryFrom<Branch> for VariableTree {
    type Error = TreeError;

    fn try_from(collections: Branch) -> Result<Self, Self::Error> {
        fn check(branch: &Branch) -> Result<(), TreeError> {
            for (key, node) in branch {
                path::validate_key(key)?;
                if let Node::Branch(children) = node {
                    check(children)?;
                }
            }
            Ok(())
        }
        check(&collections)?;
        Ok(VariableTree { collections })
    }
}

impl From<VariableTree> for Branch {
    fn from(tree: VariableTree) -> Self {
        tree.collections
    }
}

impl VariableTree {
    /// Create an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// A tree holding a single collection.
    pub fn from_collection(name: &str, node: impl Into<Node>) -> Result<Self, TreeError> {
        let mut tree = Self::new();
        tree.insert_collection(name, node)?;
        Ok(tree)
    }

    /// Insert or replace a whole collection, returning the previous one.
    pub fn insert_collection(
        &mut self,
        name: &str,
        node: impl Into<Node>,
    ) -> Result<Option<Node>, TreeError> {
        path::validate_key(name)?;
        Ok(self.collections.insert(name.to_string(), node.into()))
    }

    pub fn collection(&self, name: &str) -> Option<&Node> {
        self.collections.get(name)
    }

    pub fn remove_collection(&mut self, name: &str) -> Option<Node> {
        self.collections.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.collections.contains_key(name)
    }

    /// Collection names in sorted order.
    pub fn collection_names(&self) -> Vec<&str> {
        self.collections.keys().map(String::as_str).collect()
    }

    /// Iterate over `(collection name, node)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.collections.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of collections.
    pub fn len(&self) -> usize {
        self.collections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }

    pub(crate) fn into_collections(self) -> Branch {
        self.collections
    }

    pub(crate) fn from_collections(collections: Branch) -> Self {
        VariableTree { collections }
    }

    // -------------------------------------------------------------------
    // Path access
    // -------------------------------------------------------------------

    /// Node at a concrete path.
    pub fn get(&self, path: &str) -> Result<&Node, TreeError> {
        let parsed = KeyPath::parse_concrete(path)?;
        self.node_at(&parsed.keys())
    }

    /// Leaf array at a concrete path.
    pub fn get_leaf(&self, path: &str) -> Result<&Array, TreeError> {
        self.get(path)?
            .as_leaf()
            .ok_or_else(|| TreeError::NotALeaf(path.to_string()))
    }

    /// Set the node at a concrete path, creating intermediate branches.
    /// Returns the node previously stored there.
    pub fn set(&mut self, path: &str, node: impl Into<Node>) -> Result<Option<Node>, TreeError> {
        let parsed = KeyPath::parse_concrete(path)?;
        let keys = parsed.keys();
        for key in &keys {
            path::validate_key(key)?;
        }
        self.set_keys(&keys, node.into())
    }

    /// Remove the node at a concrete path.
    pub fn remove(&mut self, path: &str) -> Result<Node, TreeError> {
        let parsed = KeyPath::parse_concrete(path)?;
        let keys = parsed.keys();
        let (last, parents) = match keys.split_last() {
            Some(split) => split,
            None => return Err(TreeError::invalid_path(path, "empty path")),
        };
        if parents.is_empty() {
            return self
                .collections
                .remove(*last)
                .ok_or_else(|| TreeError::PathNotFound(path.to_string()));
        }
        let parent = self.node_at_mut(parents)?;
        match parent {
            Node::Branch(children) => children
                .remove(*last)
                .ok_or_else(|| TreeError::PathNotFound(path.to_string())),
            Node::Leaf(_) => Err(TreeError::NotABranch(path::join(parents))),
        }
    }

    pub(crate) fn node_at(&self, keys: &[&str]) -> Result<&Node, TreeError> {
        let (first, rest) = match keys.split_first() {
            Some(split) => split,
            None => return Err(TreeError::invalid_path("", "empty path")),
        };
        let mut cur = self
            .collections
            .get(*first)
            .ok_or_else(|| TreeError::PathNotFound(path::join(keys)))?;
        for (i, key) in rest.iter().enumerate() {
            cur = match cur {
                Node::Branch(children) => children
                    .get(*key)
                    .ok_or_else(|| TreeError::PathNotFound(path::join(keys)))?,
                Node::Leaf(_) => return Err(TreeError::NotABranch(path::join(&keys[..=i]))),
            };
        }
        Ok(cur)
    }

    fn node_at_mut(&mut self, keys: &[&str]) -> Result<&mut Node, TreeError> {
        let (first, rest) = match keys.split_first() {
            Some(split) => split,
            None => return Err(TreeError::invalid_path("", "empty path")),
        };
        let mut cur = self
            .collections
            .get_mut(*first)
            .ok_or_else(|| TreeError::PathNotFound(path::join(keys)))?;
        for (i, key) in rest.iter().enumerate() {
            cur = match cur {
                Node::Branch(children) => children
                    .get_mut(*key)
                    .ok_or_else(|| TreeError::PathNotFound(path::join(keys)))?,
                Node::Leaf(_) => return Err(TreeError::NotABranch(path::join(&keys[..=i]))),
            };
        }
        Ok(cur)
    }

    pub(crate) fn set_keys(&mut self, keys: &[&str], node: Node) -> Result<Option<Node>, TreeError> {
        let (last, parents) = match keys.split_last() {
            Some(split) => split,
            None => return Err(TreeError::invalid_path("", "empty path")),
        };
        let (first, middle) = match parents.split_first() {
            Some(split) => split,
            None => return Ok(self.collections.insert(last.to_string(), node)),
        };
        let mut cur = self
            .collections
            .entry(first.to_string())
            .or_insert_with(Node::branch);
        for (i, key) in middle.iter().enumerate() {
            cur = match cur {
                Node::Branch(children) => children
                    .entry(key.to_string())
                    .or_insert_with(Node::branch),
                Node::Leaf(_) => return Err(TreeError::NotABranch(path::join(&parents[..=i]))),
            };
        }
        match cur {
            Node::Branch(children) => Ok(children.insert(last.to_string(), node)),
            Node::Leaf(_) => Err(TreeError::NotABranch(path::join(parents))),
        }
    }

    // -------------------------------------------------------------------
    // Flattening
    // -------------------------------------------------------------------

    /// All leaves keyed by their full path. Empty branches do not appear.
    pub fn flatten(&self) -> BTreeMap<String, Array> {
        let mut out = BTreeMap::new();
        for (name, node) in &self.collections {
            flatten_into(name.clone(), node, &mut out);
        }
        out
    }

    /// Rebuild a tree from `(path, leaf)` pairs.
    pub fn unflatten<I, S>(leaves: I) -> Result<Self, TreeError>
    where
        I: IntoIterator<Item = (S, Array)>,
        S: AsRef<str>,
    {
        let mut tree = VariableTree::new();
        for (p, leaf) in leaves {
            let p = p.as_ref();
            if let Ok(existing) = tree.get(p) {
                if existing.as_branch().is_some() {
                    return Err(TreeError::NotALeaf(p.to_string()));
                }
                return Err(TreeError::KeyConflict(p.to_string()));
            }
            tree.set(p, leaf)?;
        }
        Ok(tree)
    }

    /// Leaves whose path matches `pattern`.
    pub fn select(&self, pattern: &str) -> Result<BTreeMap<String, Array>, TreeError> {
        let pattern = KeyPath::parse(pattern)?;
        let mut out = BTreeMap::new();
        for (p, leaf) in self.flatten() {
            let concrete = KeyPath::parse(&p)?;
            if pattern.matches(&concrete) {
                out.insert(p, leaf);
            }
        }
        Ok(out)
    }

    // -------------------------------------------------------------------
    // Leaf-wise transforms
    // -------------------------------------------------------------------

    /// A tree of the same structure with `f` applied to every leaf.
    pub fn map_leaves(&self, f: impl Fn(&str, &Array) -> Array) -> VariableTree {
        let mut prefix = Vec::new();
        let collections = self
            .collections
            .iter()
            .map(|(name, node)| {
                prefix.push(name.as_str());
                let mapped = map_node(node, &mut prefix, &f);
                prefix.pop();
                (name.clone(), mapped)
            })
            .collect();
        VariableTree { collections }
    }

    /// Combine two trees of identical structure leaf by leaf.
    pub fn try_zip_leaves(
        &self,
        other: &VariableTree,
        f: impl Fn(&str, &Array, &Array) -> Result<Array, TreeError>,
    ) -> Result<VariableTree, TreeError> {
        let mut prefix = Vec::new();
        let collections = zip_branch(&self.collections, &other.collections, &mut prefix, &f)?;
        Ok(VariableTree { collections })
    }

    /// Total number of leaves.
    pub fn leaf_count(&self) -> usize {
        self.collections.values().map(Node::leaf_count).sum()
    }

    /// Total number of array elements.
    pub fn element_count(&self) -> usize {
        self.collections.values().map(Node::element_count).sum()
    }
}

impl fmt::Display for VariableTree {
    /// A table of leaves followed by one summary line per collection.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let leaves = self.flatten();
        let width = leaves.keys().map(String::len).max().unwrap_or(4).max(4);
        writeln!(f, "{:<width$}  {:<12}  {:>8}", "path", "shape", "size", width = width)?;
        for (p, leaf) in &leaves {
            let shape = format!("{:?}", leaf.shape());
            writeln!(f, "{:<width$}  {:<12}  {:>8}", p, shape, leaf.len(), width = width)?;
        }
        for (name, node) in &self.collections {
            writeln!(
                f,
                "{}: {} leaves, {} elements",
                name,
                node.leaf_count(),
                node.element_count()
            )?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Internal
// ---------------------------------------------------------------------------

fn flatten_into(prefix: String, node: &Node, out: &mut BTreeMap<String, Array>) {
    match node {
        Node::Leaf(a) => {
            out.insert(prefix, a.clone());
        }
        Node::Branch(children) => {
            for (key, child) in children {
                flatten_into(format!("{}/{}", prefix, key), child, out);
            }
        }
    }
}

fn map_node<'a>(node: &'a Node, prefix: &mut Vec<&'a str>, f: &impl Fn(&str, &Array) -> Array) -> Node {
    match node {
        Node::Leaf(a) => Node::Leaf(f(&path::join(prefix), a)),
        Node::Branch(children) => {
            let mut out = BTreeMap::new();
            for (key, child) in children {
                prefix.push(key);
                out.insert(key.clone(), map_node(child, prefix, f));
                prefix.pop();
            }
            Node::Branch(out)
        }
    }
}

fn zip_branch<'a>(
    a: &'a Branch,
    b: &'a Branch,
    prefix: &mut Vec<&'a str>,
    f: &impl Fn(&str, &Array, &Array) -> Result<Array, TreeError>,
) -> Result<Branch, TreeError> {
    if a.len() != b.len() || a.keys().zip(b.keys()).any(|(x, y)| x != y) {
        let missing = a
            .keys()
            .find(|k| !b.contains_key(*k))
            .or_else(|| b.keys().find(|k| !a.contains_key(*k)))
            .map(String::as_str)
            .unwrap_or("?");
        prefix.push(missing);
        let at = path::join(prefix);
        prefix.pop();
        return Err(TreeError::StructureMismatch(at));
    }
    let mut out = BTreeMap::new();
    for ((key, x), y) in a.iter().zip(b.values()) {
        prefix.push(key);
        let node = match (x, y) {
            (Node::Leaf(l), Node::Leaf(r)) => Node::Leaf(f(&path::join(prefix), l, r)?),
            (Node::Branch(l), Node::Branch(r)) => Node::Branch(zip_branch(l, r, prefix, f)?),
            _ => return Err(TreeError::StructureMismatch(path::join(prefix))),
        };
        prefix.pop();
        out.insert(key.clone(), node);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
