//! Resolution of server value placeholders.

use crate::node::{Leaf, Node, Priority, ServerValue};

fn resolve_placeholder(sv: &ServerValue, existing: &Node, server_time: f64) -> f64 {
    match sv {
        ServerValue::Timestamp => server_time,
        ServerValue::Increment(delta) => match existing.leaf_value() {
            Some(Leaf::Number(n)) => n + delta,
            _ => *delta,
        },
    }
}

fn resolve_priority(priority: &Priority, existing: &Node, server_time: f64) -> Priority {
    match priority {
        Priority::Deferred(sv) => {
            let current = existing.priority().to_node();
            Priority::Number(resolve_placeholder(sv, &current, server_time))
        }
        other => other.clone(),
    }
}

/// Returns true if the node contains any unresolved placeholder.
pub fn has_deferred(node: &Node) -> bool {
    if matches!(node.priority(), Priority::Deferred(_)) {
        return true;
    }
    match node.leaf_value() {
        Some(Leaf::Deferred(_)) => true,
        Some(_) => false,
        None => node.children().any(|(_, child)| has_deferred(child)),
    }
}

/// Replaces every placeholder in `node`.
///
/// `existing` is the currently visible value at the same location and is
/// consulted by increments.
pub fn resolve_deferred(node: &Node, existing: &Node, server_time: f64) -> Node {
    if !has_deferred(node) {
        return node.clone();
    }
    let priority = resolve_priority(node.priority(), existing, server_time);
    match node.leaf_value() {
        Some(Leaf::Deferred(sv)) => {
            Node::leaf(Leaf::Number(resolve_placeholder(sv, existing, server_time)))
                .with_priority(priority)
        }
        Some(_) => node.with_priority(priority),
        None => {
            let mut resolved = node.clone();
            for (key, child) in node.children() {
                if has_deferred(child) {
                    let existing_child = existing.get_immediate_child(key);
                    resolved = resolved.update_immediate_child(
                        key,
                        resolve_deferred(child, &existing_child, server_time),
                    );
                }
            }
            resolved.with_priority(priority)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn timestamp_resolves_to_server_time() {
        let node = Node::from_json(&json!({"at": {".sv": "timestamp"}, "x": 1}));
        let resolved = resolve_deferred(&node, &Node::empty(), 1_000.0);
        assert_eq!(resolved.val(), json!({"at": 1000, "x": 1}));
        assert!(!has_deferred(&resolved));
    }

    #[test]
    fn increment_uses_existing_number() {
        let node = Node::from_json(&json!({"n": {".sv": {"increment": 5}}}));
        let existing = Node::from_json(&json!({"n": 10}));
        assert_eq!(resolve_deferred(&node, &existing, 0.0).val(), json!({"n": 15}));

        let existing = Node::from_json(&json!({"n": "text"}));
        assert_eq!(resolve_deferred(&node, &existing, 0.0).val(), json!({"n": 5}));
    }

    #[test]
    fn deferred_priority_resolves() {
        let node = Node::from_json(&json!({".value": 1, ".priority": {".sv": "timestamp"}}));
        let resolved = resolve_deferred(&node, &Node::empty(), 42.0);
        assert_eq!(resolved.priority(), &Priority::Number(42.0));
    }
}
