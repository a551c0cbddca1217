//! Splitting a variable tree into collections and merging it back.
//!
//! The trainable collection is split off after initialization, the rest of
//! the tree travels alongside it, and the two are merged again whenever a
//! step needs to read everything. `merge(split(t, k))` always reproduces
//! `t`.

use tracing::debug;

use crate::error::TreeError;
use crate::tree::VariableTree;

/// Split one collection off a tree.
///
/// Returns `(selected, rest)` where `selected` holds only `key`. Fails with
/// `KeyNotFound` if the tree has no such collection.
pub fn split(tree: VariableTree, key: &str) -> Result<(VariableTree, VariableTree), TreeError> {
    split_many(tree, &[key])
}

/// Split several collections off a tree at once.
///
/// Every key must exist; the first missing one is reported. Repeated keys
/// are ignored.
pub fn split_many(
    tree: VariableTree,
    keys: &[&str],
) -> Result<(VariableTree, VariableTree), TreeError> {
    if let Some(missing) = keys.iter().find(|k| !tree.contains(k)) {
        return Err(TreeError::KeyNotFound(missing.to_string()));
    }
    let mut rest = tree.into_collections();
    let mut selected = crate::tree::Branch::new();
    for key in keys {
        if let Some(node) = rest.remove(*key) {
            selected.insert(key.to_string(), node);
        }
    }
    debug!(selected = ?keys, remaining = rest.len(), "split variable tree");
    Ok((
        VariableTree::from_collections(selected),
        VariableTree::from_collections(rest),
    ))
}

/// Merge two trees with disjoint collections.
///
/// Fails with `KeyConflict` naming the first collection present in both.
pub fn merge(a: VariableTree, b: VariableTree) -> Result<VariableTree, TreeError> {
    if let Some(dup) = b.collection_names().into_iter().find(|k| a.contains(k)) {
        return Err(TreeError::KeyConflict(dup.to_string()));
    }
    let mut collections = a.into_collections();
    collections.extend(b.into_collections());
    Ok(VariableTree::from_collections(collections))
}

/// Merge any number of trees, left to right.
pub fn merge_all<I>(trees: I) -> Result<VariableTree, TreeError>
where
    I: IntoIterator<Item = VariableTree>,
{
    trees.into_iter().try_fold(VariableTree::new(), merge)
}

/// Replace every collection of `tree` that also appears in `updates`.
///
/// Collections only in `updates` are added. This carries the state
/// returned by a step forward without touching the other collections.
pub fn update_collections(tree: VariableTree, updates: VariableTree) -> VariableTree {
    let mut collections = tree.into_collections();
    for (name, node) in updates.into_collections() {
        collections.insert(name, node);
    }
    VariableTree::from_collections(collections)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{Array, Node};
    use proptest::prelude::*;
    use serde_json::json;
    use test_strategy::proptest;

    fn tree(v: serde_json::Value) -> VariableTree {
        serde_json::from_value(v).unwrap()
    }

    fn example() -> VariableTree {
        tree(json!({"params": {"bias": 0}, "batch_stats": {"mean": 0}}))
    }

    #[test]
    fn split_params_from_batch_stats() {
        let (params, rest) = split(example(), "params").unwrap();
        assert_eq!(params, tree(json!({"params": {"bias": 0}})));
        assert_eq!(rest, tree(json!({"batch_stats": {"mean": 0}})));
    }

    #[test]
    fn merge_of_split_is_identity() {
        let original = example();
        for key in ["params", "batch_stats"] {
            let (a, b) = split(original.clone(), key).unwrap();
            assert_eq!(merge(a, b).unwrap(), original);
        }
    }

    #[test]
    fn merge_is_order_insensitive() {
        let (a, b) = split(example(), "params").unwrap();
        assert_eq!(merge(b, a).unwrap(), example());
    }

    #[test]
    fn split_missing_key() {
        match split(example(), "cache") {
            Err(TreeError::KeyNotFound(k)) => assert_eq!(k, "cache"),
            other => panic!("expected KeyNotFound, got {:?}", other),
        }
    }

    #[test]
    fn split_does_not_match_nested_keys() {
        assert!(matches!(
            split(example(), "bias"),
            Err(TreeError::KeyNotFound(_))
        ));
    }

    #[test]
    fn split_only_collection_leaves_empty_rest() {
        let t = tree(json!({"params": {"bias": 0}}));
        let (params, rest) = split(t.clone(), "params").unwrap();
        assert_eq!(params, t);
        assert!(rest.is_empty());
    }

    #[test]
    fn merge_conflict() {
        let a = tree(json!({"params": {"bias": 0}}));
        let b = tree(json!({"params": {"kernel": 1}, "batch_stats": {"mean": 0}}));
        match merge(a, b) {
            Err(TreeError::KeyConflict(k)) => assert_eq!(k, "params"),
            other => panic!("expected KeyConflict, got {:?}", other),
        }
    }

    #[test]
    fn merge_with_empty() {
        assert_eq!(merge(example(), VariableTree::new()).unwrap(), example());
        assert_eq!(merge(VariableTree::new(), example()).unwrap(), example());
    }

    #[test]
    fn split_many_and_merge_all() {
        let t = tree(json!({
            "params": {"w": 1},
            "batch_stats": {"mean": 0},
            "cache": {"k": 2}
        }));
        let (selected, rest) = split_many(t.clone(), &["params", "cache", "params"]).unwrap();
        assert_eq!(selected.collection_names(), vec!["cache", "params"]);
        assert_eq!(rest.collection_names(), vec!["batch_stats"]);
        assert_eq!(merge_all(vec![rest, selected]).unwrap(), t);
        assert!(matches!(
            split_many(t, &["params", "missing"]),
            Err(TreeError::KeyNotFound(_))
        ));
    }

    #[test]
    fn merge_all_reports_conflict() {
        let r = merge_all(vec![example(), tree(json!({"batch_stats": {"var": 1}}))]);
        assert!(matches!(r, Err(TreeError::KeyConflict(k)) if k == "batch_stats"));
    }

    #[test]
    fn update_collections_replaces_wholesale() {
        let state = tree(json!({"batch_stats": {"mean": 0, "var": 1}, "cache": {"k": 3}}));
        let mut updates = VariableTree::new();
        updates
            .set("batch_stats/mean", Array::scalar(0.5))
            .unwrap();
        let next = update_collections(state, updates);
        assert_eq!(next.get_leaf("batch_stats/mean").unwrap(), &Array::scalar(0.5));
        assert!(next.get("batch_stats/var").is_err());
        assert_eq!(next.get_leaf("cache/k").unwrap(), &Array::scalar(3.0));
    }

    // Generated trees: lowercase keys never collide with `Absent`.

    fn key() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_]{0,5}"
    }

    fn node() -> impl Strategy<Value = Node> {
        let leaf = prop::collection::vec(-1e3f64..1e3, 0..4)
            .prop_map(|data| Node::Leaf(Array::new(vec![data.len()], data).unwrap()));
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop::collection::btree_map(key(), inner, 0..4).prop_map(Node::Branch)
        })
    }

    fn variables() -> impl Strategy<Value = VariableTree> {
        prop::collection::btree_map(key(), node(), 1..5).prop_map(VariableTree::from_collections)
    }

    #[proptest(cases = 64)]
    fn split_then_merge_is_identity(
        #[strategy(variables())] vars: VariableTree,
        #[strategy(0usize..8)] pick: usize,
    ) {
        let names = vars.collection_names();
        let key = names[pick % names.len()].to_string();

        let (selected, rest) = split(vars.clone(), &key).unwrap();
        assert_eq!(selected.collection_names(), vec![key.as_str()]);
        assert!(rest.collection_names().iter().all(|n| !selected.contains(n)));
        assert_eq!(selected.len() + rest.len(), vars.len());
        assert_eq!(merge(selected.clone(), rest.clone()).unwrap(), vars);
        assert_eq!(merge(rest, selected).unwrap(), vars);
    }

    #[proptest(cases = 64)]
    fn split_on_absent_key_fails(#[strategy(variables())] vars: VariableTree) {
        assert_eq!(
            split(vars, "Absent").unwrap_err(),
            TreeError::KeyNotFound("Absent".into())
        );
    }

    #[proptest(cases = 64)]
    fn merge_with_shared_key_fails(
        #[strategy(variables())] vars: VariableTree,
        #[strategy(0usize..8)] pick: usize,
    ) {
        let names = vars.collection_names();
        let key = names[pick % names.len()].to_string();
        let clash = VariableTree::from_collection(&key, Node::branch()).unwrap();
        assert_eq!(
            merge(vars.clone(), clash.clone()).unwrap_err(),
            TreeError::KeyConflict(key.clone())
        );
        assert_eq!(merge(clash, vars).unwrap_err(), TreeError::KeyConflict(key));
    }
}
