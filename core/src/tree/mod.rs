//! Variable trees: nested, named arrays grouped into collections.
//!
//! Provides the leaf `Array` type, `/`-separated key paths with wildcard
//! matching, the `VariableTree` container itself, and leaf-level diffs.

pub mod array;
pub mod diff;
pub mod node;
pub mod path;

pub use array::Array;
pub use diff::{LeafChange, TreeDiff};
pub use node::{Branch, Node, VariableTree};
pub use path::{KeyPath, PathSegment};
