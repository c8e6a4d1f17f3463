//! Property-based test generators using proptest.
//!
//! Keys come from a small alphabet so that generated paths collide often
//! and writes overlap as ancestors, descendants and siblings.

use canopy_value::{Node, Path};
use proptest::prelude::*;
use serde_json::{json, Map, Value};

/// Strategy for child keys, integer-like keys included.
pub fn key_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["a", "b", "c", "1", "10"]).prop_map(str::to_string)
}

/// Strategy for paths up to three segments deep, the root included.
pub fn path_strategy() -> impl Strategy<Value = Path> {
    prop::collection::vec(key_strategy(), 0..=3).prop_map(Path::from_segments)
}

/// Strategy for leaf JSON values.
pub fn leaf_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        (-50i64..50).prop_map(|n| json!(n)),
        "[a-z]{0,4}".prop_map(Value::String),
    ]
}

/// Strategy for JSON values up to two levels deep.
pub fn json_value_strategy() -> impl Strategy<Value = Value> {
    leaf_strategy().prop_recursive(2, 12, 3, |inner| {
        prop::collection::vec((key_strategy(), inner), 1..=3).prop_map(|pairs| {
            let map: Map<String, Value> = pairs.into_iter().collect();
            Value::Object(map)
        })
    })
}

/// Strategy for values with an optional priority attached.
pub fn node_strategy() -> impl Strategy<Value = Node> {
    (
        json_value_strategy(),
        prop_oneof![Just(Value::Null), (0i64..5).prop_map(|n| json!(n)), Just(json!("p"))],
    )
        .prop_map(|(value, priority)| Node::from_json_with_priority(&value, &priority))
}

/// One step of a randomized overlay scenario.
#[derive(Debug, Clone)]
pub enum OverlayOp {
    /// The authority replaces the value at a path.
    ServerOverwrite(Path, Node),
    /// A local overwrite.
    UserOverwrite(Path, Node),
    /// A local merge of relative children.
    UserMerge(Path, Vec<(Path, Node)>),
    /// Revert the pending write at this position, modulo the number of
    /// pending writes.
    Revert(usize),
}

/// Strategy for a single overlay step.
pub fn overlay_op_strategy() -> impl Strategy<Value = OverlayOp> {
    prop_oneof![
        2 => (path_strategy(), node_strategy()).prop_map(|(p, n)| OverlayOp::ServerOverwrite(p, n)),
        3 => (path_strategy(), node_strategy()).prop_map(|(p, n)| OverlayOp::UserOverwrite(p, n)),
        2 => (
            path_strategy(),
            prop::collection::btree_map(key_strategy(), json_value_strategy(), 1..=3),
        )
            .prop_map(|(p, children)| {
                let children = children
                    .into_iter()
                    .map(|(k, v)| (Path::parse(&k), Node::from_json(&v)))
                    .collect();
                OverlayOp::UserMerge(p, children)
            }),
        1 => any::<usize>().prop_map(OverlayOp::Revert),
    ]
}

/// Strategy for a sequence of overlay steps.
pub fn overlay_ops_strategy(max_len: usize) -> impl Strategy<Value = Vec<OverlayOp>> {
    prop::collection::vec(overlay_op_strategy(), 1..=max_len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::strategy::ValueTree;
    use proptest::test_runner::TestRunner;

    #[test]
    fn generated_paths_are_shallow() {
        let mut runner = TestRunner::default();
        for _ in 0..50 {
            let path = path_strategy().new_tree(&mut runner).unwrap().current();
            assert!(path.len() <= 3);
        }
    }

    #[test]
    fn generated_values_are_valid() {
        let mut runner = TestRunner::default();
        for _ in 0..50 {
            let value = json_value_strategy().new_tree(&mut runner).unwrap().current();
            canopy_value::validation::validate_data(&value, &Path::root()).unwrap();
        }
    }
}
