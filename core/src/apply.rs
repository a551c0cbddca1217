//! Running computations against a variable tree.
//!
//! A `Process` reads variables through a `Scope`. The scope owns a private
//! copy of the tree and only lets the process write the collections named
//! as mutable for this run. `apply_step` hands back the output together
//! with the mutated collections; the caller's tree is never modified.
//!
//! # Usage
//!
//! ```ignore
//! let variables = init(&model, seed, &sample_input)?;
//! let (params, state) = split(variables, PARAMS)?;
//! let mutable = Mutability::collections([BATCH_STATS]);
//! let (output, updates) = apply_step(&model, &batch, &mutable, &merge(params, state)?)?;
//! ```

use std::collections::BTreeSet;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

use crate::error::TreeError;
use crate::init::Initializer;
use crate::tree::{path, Array, Node, VariableTree};

/// Collection holding optimizable parameters.
pub const PARAMS: &str = "params";

/// Collection holding running statistics.
pub const BATCH_STATS: &str = "batch_stats";

// ---------------------------------------------------------------------------
// Mutability
// ---------------------------------------------------------------------------

/// Which collections a process may write during one run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Mutability {
    /// Nothing may be written.
    #[default]
    Immutable,
    /// Only the named collections may be written.
    Collections(BTreeSet<String>),
    /// Every collection may be written, including new ones.
    All,
}

impl Mutability {
    pub fn collections<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Mutability::Collections(names.into_iter().map(Into::into).collect())
    }

    /// Whether `collection` may be written.
    pub fn allows(&self, collection: &str) -> bool {
        match self {
            Mutability::Immutable => false,
            Mutability::Collections(names) => names.contains(collection),
            Mutability::All => true,
        }
    }

    /// Keep only the collections of `tree` this mutability allows.
    fn restrict(&self, tree: VariableTree) -> VariableTree {
        match self {
            Mutability::All => tree,
            Mutability::Immutable => VariableTree::new(),
            Mutability::Collections(names) => {
                let kept = tree
                    .into_collections()
                    .into_iter()
                    .filter(|(name, _)| names.contains(name))
                    .collect();
                VariableTree::from_collections(kept)
            }
        }
    }
}

impl From<bool> for Mutability {
    fn from(all: bool) -> Self {
        if all {
            Mutability::All
        } else {
            Mutability::Immutable
        }
    }
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// Read/write access to the variables during one run of a process.
#[derive(Debug, Clone)]
pub struct Scope {
    variables: VariableTree,
    mutable: Mutability,
    rng: Option<StdRng>,
}

impl Scope {
    pub fn new(variables: VariableTree, mutable: Mutability) -> Self {
        Scope {
            variables,
            mutable,
            rng: None,
        }
    }

    /// Attach a seeded RNG. A scope with an RNG is initializing: missing
    /// parameters are created instead of reported.
    pub fn with_rng(mut self, seed: u64) -> Self {
        self.rng = Some(StdRng::seed_from_u64(seed));
        self
    }

    pub fn is_initializing(&self) -> bool {
        self.rng.is_some()
    }

    pub fn is_mutable(&self, collection: &str) -> bool {
        self.mutable.allows(collection)
    }

    /// Node at a concrete path. Every collection is readable.
    pub fn get(&self, path: &str) -> Result<&Node, TreeError> {
        self.variables.get(path)
    }

    /// Leaf at a concrete path.
    pub fn leaf(&self, path: &str) -> Result<&Array, TreeError> {
        self.variables.get_leaf(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.variables.get(path).is_ok()
    }

    /// Write a leaf. Fails with `ImmutableCollection` if the path's
    /// collection is not mutable in this run.
    pub fn put(&mut self, path: &str, value: Array) -> Result<(), TreeError> {
        let parsed = path::KeyPath::parse_concrete(path)?;
        let collection = parsed
            .collection()
            .ok_or_else(|| TreeError::invalid_path(path, "missing collection"))?;
        if !self.mutable.allows(collection) {
            return Err(TreeError::ImmutableCollection(collection.to_string()));
        }
        self.variables.set(path, value)?;
        Ok(())
    }

    /// Read the parameter at `params/<name>`, creating it while initializing.
    pub fn param(
        &mut self,
        name: &str,
        shape: &[usize],
        init: Initializer,
    ) -> Result<Array, TreeError> {
        let full = format!("{}/{}", PARAMS, name);
        if let Ok(existing) = self.variables.get_leaf(&full) {
            existing.expect_shape(shape)?;
            return Ok(existing.clone());
        }
        if !self.is_mutable(PARAMS) {
            return Err(TreeError::PathNotFound(full));
        }
        let value = match self.rng.as_mut() {
            Some(rng) => init.sample(shape, rng)?,
            None => return Err(TreeError::PathNotFound(full)),
        };
        self.variables.set(&full, value.clone())?;
        Ok(value)
    }

    /// Read the variable at `<collection>/<name>`, creating it with `init`
    /// when the collection is mutable.
    pub fn variable(
        &mut self,
        collection: &str,
        name: &str,
        init: impl FnOnce() -> Array,
    ) -> Result<Array, TreeError> {
        let full = format!("{}/{}", collection, name);
        if let Ok(existing) = self.variables.get_leaf(&full) {
            return Ok(existing.clone());
        }
        if !self.is_mutable(collection) {
            return Err(TreeError::PathNotFound(full));
        }
        let value = init();
        self.variables.set(&full, value.clone())?;
        Ok(value)
    }

    pub fn variables(&self) -> &VariableTree {
        &self.variables
    }

    pub fn into_variables(self) -> VariableTree {
        self.variables
    }
}

// ---------------------------------------------------------------------------
// Process
// ---------------------------------------------------------------------------

/// A computation run under a `Scope`.
pub trait Process<I> {
    type Output;

    fn run(&self, scope: &mut Scope, inputs: &I) -> Result<Self::Output, TreeError>;
}

impl<I, O, F> Process<I> for F
where
    F: Fn(&mut Scope, &I) -> Result<O, TreeError>,
{
    type Output = O;

    fn run(&self, scope: &mut Scope, inputs: &I) -> Result<O, TreeError> {
        self(scope, inputs)
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Run `process` with every collection mutable and a seeded RNG, returning
/// the variables it created.
pub fn init<I, P: Process<I>>(process: &P, seed: u64, inputs: &I) -> Result<VariableTree, TreeError> {
    init_with_output(process, seed, inputs).map(|(_, variables)| variables)
}

/// Like `init`, but also returns the output of the initializing run.
pub fn init_with_output<I, P: Process<I>>(
    process: &P,
    seed: u64,
    inputs: &I,
) -> Result<(P::Output, VariableTree), TreeError> {
    let mut scope = Scope::new(VariableTree::new(), Mutability::All).with_rng(seed);
    let output = process.run(&mut scope, inputs)?;
    let variables = scope.into_variables();
    debug!(
        seed,
        collections = ?variables.collection_names(),
        leaves = variables.leaf_count(),
        "initialized variables"
    );
    Ok((output, variables))
}

/// Run `process` read-only and return its output.
pub fn apply<I, P: Process<I>>(process: &P, inputs: &I, state: &VariableTree) -> Result<P::Output, TreeError> {
    let mut scope = Scope::new(state.clone(), Mutability::Immutable);
    process.run(&mut scope, inputs)
}

/// Run `process` with read access to every collection and write access to
/// the `mutable` ones.
///
/// Returns the output and a tree holding only the mutable collections as
/// they stand after the run. `state` itself is left untouched.
pub fn apply_step<I, P: Process<I>>(
    process: &P,
    inputs: &I,
    mutable: &Mutability,
    state: &VariableTree,
) -> Result<(P::Output, VariableTree), TreeError> {
    let mut scope = Scope::new(state.clone(), mutable.clone());
    let output = process.run(&mut scope, inputs)?;
    let updated = mutable.restrict(scope.into_variables());
    debug!(
        mutable = ?mutable,
        returned = ?updated.collection_names(),
        "applied step"
    );
    Ok((output, updated))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tree(v: serde_json::Value) -> VariableTree {
        serde_json::from_value(v).unwrap()
    }

    /// Adds `params/bias` to the input and counts calls in `batch_stats/calls`.
    fn counter(scope: &mut Scope, x: &f64) -> Result<f64, TreeError> {
        let bias = scope.param("bias", &[], Initializer::Constant { value: 1.0 })?;
        let calls = scope.variable(BATCH_STATS, "calls", || Array::scalar(0.0))?;
        let next = calls.as_scalar().unwrap_or(0.0) + 1.0;
        if !scope.is_initializing() {
            scope.put("batch_stats/calls", Array::scalar(next))?;
        }
        Ok(x + bias.as_scalar().unwrap_or(0.0))
    }

    #[test]
    fn init_creates_all_collections() {
        let variables = init(&counter, 0, &1.0).unwrap();
        assert_eq!(
            variables,
            tree(json!({"params": {"bias": 1.0}, "batch_stats": {"calls": 0.0}}))
        );
    }

    #[test]
    fn init_with_output_returns_output() {
        let (out, _) = init_with_output(&counter, 0, &2.0).unwrap();
        assert_eq!(out, 3.0);
    }

    #[test]
    fn apply_step_returns_only_mutable_collections() {
        let state = init(&counter, 0, &0.0).unwrap();
        let mutable = Mutability::collections([BATCH_STATS]);
        let (out, updated) = apply_step(&counter, &5.0, &mutable, &state).unwrap();
        assert_eq!(out, 6.0);
        assert_eq!(updated, tree(json!({"batch_stats": {"calls": 1.0}})));
    }

    #[test]
    fn apply_step_leaves_input_untouched() {
        let state = init(&counter, 0, &0.0).unwrap();
        let before = state.clone();
        let mutable = Mutability::collections([BATCH_STATS]);
        apply_step(&counter, &5.0, &mutable, &state).unwrap();
        assert_eq!(state, before);
    }

    #[test]
    fn writing_immutable_collection_fails() {
        let state = init(&counter, 0, &0.0).unwrap();
        match apply_step(&counter, &5.0, &Mutability::Immutable, &state) {
            Err(TreeError::ImmutableCollection(c)) => assert_eq!(c, BATCH_STATS),
            other => panic!("expected ImmutableCollection, got {:?}", other),
        }
        assert!(apply(&counter, &5.0, &state).is_err());
    }

    #[test]
    fn all_mutable_returns_everything() {
        let state = init(&counter, 0, &0.0).unwrap();
        let (_, updated) = apply_step(&counter, &5.0, &Mutability::All, &state).unwrap();
        assert_eq!(updated.collection_names(), vec!["batch_stats", "params"]);
    }

    #[test]
    fn missing_param_is_reported_outside_init() {
        let state = tree(json!({"batch_stats": {"calls": 0}}));
        let mutable = Mutability::collections([BATCH_STATS]);
        match apply_step(&counter, &1.0, &mutable, &state) {
            Err(TreeError::PathNotFound(p)) => assert_eq!(p, "params/bias"),
            other => panic!("expected PathNotFound, got {:?}", other),
        }
    }

    #[test]
    fn mutable_collection_is_created_on_demand() {
        let state = tree(json!({"params": {"bias": 0.5}}));
        let mutable = Mutability::collections([BATCH_STATS]);
        let (out, updated) = apply_step(&counter, &1.0, &mutable, &state).unwrap();
        assert_eq!(out, 1.5);
        assert_eq!(updated, tree(json!({"batch_stats": {"calls": 1.0}})));
    }

    #[test]
    fn param_shape_is_checked() {
        let state = tree(json!({"params": {"bias": {"shape": [2], "data": [0, 0]}}}));
        let r = apply(&counter, &0.0, &state);
        assert!(matches!(r, Err(TreeError::ShapeMismatch { .. })));
    }

    #[test]
    fn closures_are_processes() {
        let read = |scope: &mut Scope, _: &()| -> Result<f64, TreeError> {
            Ok(scope.leaf("params/w")?.sum())
        };
        let state = tree(json!({"params": {"w": {"shape": [3], "data": [1, 2, 3]}}}));
        assert_eq!(apply(&read, &(), &state).unwrap(), 6.0);
    }

    #[test]
    fn mutability_from_bool() {
        assert_eq!(Mutability::from(true), Mutability::All);
        assert_eq!(Mutability::from(false), Mutability::Immutable);
        assert!(Mutability::collections(["a"]).allows("a"));
        assert!(!Mutability::collections(["a"]).allows("b"));
    }
}
