//! Error types for tree operations and file persistence.

use thiserror::Error;

// ---------------------------------------------------------------------------
// TreeError
// ---------------------------------------------------------------------------

/// Errors raised by in-memory tree operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TreeError {
    /// A collection named for extraction does not exist.
    #[error("collection not found: {0}")]
    KeyNotFound(String),
    /// Two trees being merged both define the same collection.
    #[error("collection defined twice: {0}")]
    KeyConflict(String),
    /// No node exists at the given path.
    #[error("no value at path: {0}")]
    PathNotFound(String),
    /// The path resolves to a branch where a leaf was required.
    #[error("not a leaf: {0}")]
    NotALeaf(String),
    /// The path descends through a leaf.
    #[error("not a branch: {0}")]
    NotABranch(String),
    /// The path string could not be parsed.
    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },
    /// A process tried to write a collection it was not allowed to mutate.
    #[error("collection '{0}' is immutable in this step")]
    ImmutableCollection(String),
    /// Two trees that must share a structure do not.
    #[error("tree structure mismatch at {0}")]
    StructureMismatch(String),
    #[error("shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    /// An array whose data length disagrees with its shape.
    #[error("invalid array: {0}")]
    InvalidArray(String),
    /// An initializer whose distribution parameters cannot be sampled.
    #[error("invalid initializer: {0}")]
    InvalidInitializer(String),
    /// A training step produced a non-finite loss, gradient or parameter.
    #[error("training diverged at step {step}: loss {loss}, grad norm {grad_norm}")]
    Diverged { step: u64, loss: f64, grad_norm: f64 },
}

impl TreeError {
    pub(crate) fn invalid_path(path: &str, reason: impl Into<String>) -> Self {
        TreeError::InvalidPath {
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// StoreError
// ---------------------------------------------------------------------------

/// Errors raised while reading or writing trees, checkpoints and config.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}
