//! Variable trees for trainable models.
//!
//! All state of a model lives in one `VariableTree` whose top-level keys are
//! collections (`params`, `batch_stats`, ...). `partition` splits and merges
//! trees by collection, `apply` runs a process with a chosen set of mutable
//! collections, and `train` builds a gradient-descent loop on top of both.

pub mod apply;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod init;
pub mod layers;
pub mod partition;
pub mod train;
pub mod tree;

pub use apply::{apply, apply_step, init, init_with_output, Mutability, Process, Scope, BATCH_STATS, PARAMS};
pub use checkpoint::Checkpoint;
pub use config::TrainConfig;
pub use error::{StoreError, TreeError};
pub use init::Initializer;
pub use partition::{merge, merge_all, split, split_many, update_collections};
pub use tree::{Array, KeyPath, Node, TreeDiff, VariableTree};
