//! Child orderings used by queries and event generation.

use crate::key::{compare_keys, MAX_NAME, MIN_NAME};
use crate::node::{Leaf, Node, Priority};
use crate::path::Path;
use serde_json::Value;
use std::cmp::Ordering;

/// A child name paired with its node.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedNode {
    /// Child key.
    pub name: String,
    /// Child value.
    pub node: Node,
}

impl NamedNode {
    /// Creates a named node.
    pub fn new(name: impl Into<String>, node: Node) -> Self {
        Self {
            name: name.into(),
            node,
        }
    }
}

/// The ordering applied to a node's children.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Index {
    /// Order by priority, then key.
    #[default]
    Priority,
    /// Order by key.
    Key,
    /// Order by value, then key.
    Value,
    /// Order by the value at a child path, then key.
    Child(Path),
}

/// Compares two nodes by value: empty, then leaves, then objects.
pub fn compare_values(a: &Node, b: &Node) -> Ordering {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        _ => {}
    }
    match (a.leaf_value(), b.leaf_value()) {
        (Some(x), Some(y)) => x.compare(y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

impl Index {
    /// Compares two children under this ordering.
    pub fn compare(&self, a_name: &str, a: &Node, b_name: &str, b: &Node) -> Ordering {
        let primary = match self {
            Index::Priority => a.priority().compare(b.priority()),
            Index::Key => Ordering::Equal,
            Index::Value => compare_values(a, b),
            Index::Child(path) => compare_values(&a.get_child(path), &b.get_child(path)),
        };
        primary.then_with(|| compare_keys(a_name, b_name))
    }

    /// Compares two named nodes under this ordering.
    pub fn compare_named(&self, a: &NamedNode, b: &NamedNode) -> Ordering {
        self.compare(&a.name, &a.node, &b.name, &b.node)
    }

    /// Returns true if a change from `old` to `new` can move the child.
    pub fn value_changed(&self, old: &Node, new: &Node) -> bool {
        match self {
            Index::Priority => old.priority() != new.priority(),
            Index::Key => false,
            Index::Value => old != new,
            Index::Child(path) => old.get_child(path) != new.get_child(path),
        }
    }

    /// Returns true if the node participates in this ordering.
    pub fn is_defined_on(&self, node: &Node) -> bool {
        match self {
            Index::Child(path) => !node.get_child(path).is_empty(),
            _ => true,
        }
    }

    /// Builds a synthetic child positioned at `(value, name)` for bound checks.
    pub fn make_post(&self, value: &Value, name: &str) -> NamedNode {
        match self {
            Index::Priority => {
                let priority = Priority::from_json(value);
                let node = Node::leaf(Leaf::String("[PRIORITY-POST]".into())).with_priority(priority);
                NamedNode::new(name, node)
            }
            Index::Key => {
                let key = value.as_str().unwrap_or(name);
                NamedNode::new(key, Node::empty())
            }
            Index::Value => NamedNode::new(name, Node::from_json(value)),
            Index::Child(path) => NamedNode::new(
                name,
                Node::empty().update_child(path, Node::from_json(value)),
            ),
        }
    }

    /// The wire identifier of the index.
    pub fn to_wire(&self) -> String {
        match self {
            Index::Priority => ".priority".to_string(),
            Index::Key => ".key".to_string(),
            Index::Value => ".value".to_string(),
            Index::Child(path) => path.segments().join("/"),
        }
    }

    /// Parses a wire identifier.
    pub fn from_wire(s: &str) -> Self {
        match s {
            ".priority" => Index::Priority,
            ".key" => Index::Key,
            ".value" => Index::Value,
            other => Index::Child(Path::parse(other)),
        }
    }

    /// Children of `node` sorted under this ordering.
    pub fn sorted_children<'a>(&self, node: &'a Node) -> Vec<(&'a str, &'a Node)> {
        let mut children: Vec<_> = node.children().collect();
        if *self != Index::Key {
            children.sort_by(|(an, a), (bn, b)| self.compare(an, a, bn, b));
        }
        children
    }
}

/// Name used for a start bound without an explicit name.
pub fn default_start_name() -> &'static str {
    MIN_NAME
}

/// Name used for an end bound without an explicit name.
pub fn default_end_name() -> &'static str {
    MAX_NAME
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn keys(index: &Index, node: &Node) -> Vec<String> {
        index
            .sorted_children(node)
            .into_iter()
            .map(|(k, _)| k.to_string())
            .collect()
    }

    #[test]
    fn value_order_across_types() {
        let node = Node::from_json(&json!({
            "obj": {"x": 1},
            "s": "a",
            "n2": 2,
            "n1": 1,
            "t": true,
            "f": false,
        }));
        assert_eq!(keys(&Index::Value, &node), vec!["f", "t", "n1", "n2", "s", "obj"]);
    }

    #[test]
    fn priority_order_with_key_ties() {
        let node = Node::from_json(&json!({
            "c": {".value": 1, ".priority": "b"},
            "b": {".value": 1, ".priority": 5},
            "a": 1,
            "d": {".value": 1, ".priority": 2},
        }));
        assert_eq!(keys(&Index::Priority, &node), vec!["a", "d", "b", "c"]);
    }

    #[test]
    fn child_index_orders_missing_first() {
        let node = Node::from_json(&json!({
            "x": {"age": 30},
            "y": {"name": "no age"},
            "z": {"age": 20},
        }));
        let index = Index::Child(Path::parse("age"));
        assert_eq!(keys(&index, &node), vec!["y", "z", "x"]);
        assert!(!index.is_defined_on(&Node::from_json(&json!({"name": 1}))));
    }

    #[test]
    fn value_changed_per_index() {
        let a = Node::from_json(&json!(1));
        let b = Node::from_json(&json!(2));
        assert!(Index::Value.value_changed(&a, &b));
        assert!(!Index::Key.value_changed(&a, &b));
        assert!(!Index::Priority.value_changed(&a, &b));
        assert!(Index::Priority.value_changed(&a, &a.with_priority(Priority::Number(1.0))));
    }

    #[test]
    fn posts_bound_children() {
        let index = Index::Value;
        let start = index.make_post(&json!(2), MIN_NAME);
        let child = NamedNode::new("a", Node::from_json(&json!(2)));
        assert_eq!(index.compare_named(&start, &child), Ordering::Less);
        let end = index.make_post(&json!(2), MAX_NAME);
        assert_eq!(index.compare_named(&child, &end), Ordering::Less);
    }

    #[test]
    fn wire_names() {
        assert_eq!(Index::from_wire(".value"), Index::Value);
        assert_eq!(Index::Child(Path::parse("a/b")).to_wire(), "a/b");
        assert_eq!(Index::from_wire("age"), Index::Child(Path::parse("age")));
    }
}
