//! Immutable, structurally shared value nodes.
//!
//! A [`Node`] is either a leaf scalar or a map of children, each optionally
//! carrying a [`Priority`]. Nodes are cheap to clone: updates copy the spine
//! of the path and share everything else.

use crate::key::{ChildKey, PRIORITY_KEY, SERVER_VALUE_KEY, VALUE_KEY};
use crate::path::Path;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

/// A placeholder resolved to a concrete value by the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerValue {
    /// The server's current time in milliseconds.
    Timestamp,
    /// Adds the delta to the existing numeric value.
    Increment(f64),
}

impl ServerValue {
    /// Parses the payload of a `.sv` key.
    pub fn from_json(sv: &Value) -> Option<Self> {
        match sv {
            Value::String(s) if s == "timestamp" => Some(Self::Timestamp),
            Value::Object(map) if map.len() == 1 => map
                .get("increment")
                .and_then(Value::as_f64)
                .map(Self::Increment),
            _ => None,
        }
    }

    /// The `{".sv": ...}` wire form.
    pub fn to_json(&self) -> Value {
        let payload = match self {
            Self::Timestamp => Value::String("timestamp".into()),
            Self::Increment(delta) => {
                let mut map = Map::new();
                map.insert("increment".into(), number_to_json(*delta));
                Value::Object(map)
            }
        };
        let mut map = Map::new();
        map.insert(SERVER_VALUE_KEY.into(), payload);
        Value::Object(map)
    }
}

/// A scalar value.
#[derive(Debug, Clone, PartialEq)]
pub enum Leaf {
    /// A boolean.
    Bool(bool),
    /// A finite number.
    Number(f64),
    /// A string.
    String(String),
    /// An unresolved server value.
    Deferred(ServerValue),
}

impl Leaf {
    fn type_rank(&self) -> u8 {
        match self {
            Self::Deferred(_) => 0,
            Self::Bool(_) => 1,
            Self::Number(_) => 2,
            Self::String(_) => 3,
        }
    }

    /// Compares two leaves: booleans, then numbers, then strings.
    pub fn compare(&self, other: &Leaf) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Number(a), Self::Number(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (Self::String(a), Self::String(b)) => a.cmp(b),
            (Self::Deferred(_), Self::Deferred(_)) => Ordering::Equal,
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }

    /// JSON form of the leaf.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Bool(b) => Value::Bool(*b),
            Self::Number(n) => number_to_json(*n),
            Self::String(s) => Value::String(s.clone()),
            Self::Deferred(sv) => sv.to_json(),
        }
    }

    fn hash_text(&self) -> String {
        match self {
            Self::Bool(b) => format!("boolean:{b}"),
            Self::Number(n) => format!("number:{:016x}", n.to_bits()),
            Self::String(s) => format!("string:{s}"),
            Self::Deferred(ServerValue::Timestamp) => "deferred:timestamp".to_string(),
            Self::Deferred(ServerValue::Increment(d)) => {
                format!("deferred:increment:{:016x}", d.to_bits())
            }
        }
    }
}

/// Sort priority attached to a node.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Priority {
    /// No priority.
    #[default]
    None,
    /// A numeric priority.
    Number(f64),
    /// A string priority.
    String(String),
    /// An unresolved server value.
    Deferred(ServerValue),
}

impl Priority {
    /// Returns true when no priority is set.
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Parses a priority from JSON. Unsupported shapes map to `None`.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Number(n) => n.as_f64().map(Self::Number).unwrap_or_default(),
            Value::String(s) => Self::String(s.clone()),
            Value::Object(map) => map
                .get(SERVER_VALUE_KEY)
                .and_then(ServerValue::from_json)
                .map(Self::Deferred)
                .unwrap_or_default(),
            _ => Self::None,
        }
    }

    /// JSON form of the priority.
    pub fn to_json(&self) -> Value {
        match self {
            Self::None => Value::Null,
            Self::Number(n) => number_to_json(*n),
            Self::String(s) => Value::String(s.clone()),
            Self::Deferred(sv) => sv.to_json(),
        }
    }

    /// The priority as a node, as addressed by the `.priority` key.
    pub fn to_node(&self) -> Node {
        match self {
            Self::None => Node::empty(),
            Self::Number(n) => Node::leaf(Leaf::Number(*n)),
            Self::String(s) => Node::leaf(Leaf::String(s.clone())),
            Self::Deferred(sv) => Node::leaf(Leaf::Deferred(sv.clone())),
        }
    }

    /// Reads a priority back out of a node.
    pub fn from_node(node: &Node) -> Self {
        match node.leaf_value() {
            Some(Leaf::Number(n)) => Self::Number(*n),
            Some(Leaf::String(s)) => Self::String(s.clone()),
            Some(Leaf::Deferred(sv)) => Self::Deferred(sv.clone()),
            _ => Self::None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::Deferred(_) => 1,
            Self::Number(_) => 2,
            Self::String(_) => 3,
        }
    }

    /// Compares priorities: none, then numbers, then strings.
    pub fn compare(&self, other: &Priority) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (Self::String(a), Self::String(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }

    fn hash_text(&self) -> String {
        match self {
            Self::None => String::new(),
            Self::Number(n) => format!("priority:number:{:016x}:", n.to_bits()),
            Self::String(s) => format!("priority:string:{s}:"),
            Self::Deferred(sv) => format!("priority:{}:", Leaf::Deferred(sv.clone()).hash_text()),
        }
    }
}

#[derive(Debug)]
enum Repr {
    Leaf {
        value: Leaf,
        priority: Priority,
    },
    Children {
        children: BTreeMap<ChildKey, Node>,
        priority: Priority,
    },
}

/// An immutable value tree node.
#[derive(Debug, Clone)]
pub struct Node {
    repr: Arc<Repr>,
}

static EMPTY: OnceLock<Node> = OnceLock::new();

impl Node {
    /// The empty node (null).
    pub fn empty() -> Node {
        EMPTY
            .get_or_init(|| Node {
                repr: Arc::new(Repr::Children {
                    children: BTreeMap::new(),
                    priority: Priority::None,
                }),
            })
            .clone()
    }

    /// A leaf node without priority.
    pub fn leaf(value: Leaf) -> Node {
        Node {
            repr: Arc::new(Repr::Leaf {
                value,
                priority: Priority::None,
            }),
        }
    }

    fn from_children(children: BTreeMap<ChildKey, Node>, priority: Priority) -> Node {
        if children.is_empty() {
            return Node::empty();
        }
        Node {
            repr: Arc::new(Repr::Children { children, priority }),
        }
    }

    /// Builds a node from `(key, child)` pairs. Empty children are dropped.
    pub fn from_pairs<I, K>(pairs: I) -> Node
    where
        I: IntoIterator<Item = (K, Node)>,
        K: Into<String>,
    {
        let children = pairs
            .into_iter()
            .filter(|(_, child)| !child.is_empty())
            .map(|(key, child)| (ChildKey::new(key), child))
            .collect();
        Node::from_children(children, Priority::None)
    }

    /// Returns true for the empty node.
    pub fn is_empty(&self) -> bool {
        matches!(&*self.repr, Repr::Children { children, .. } if children.is_empty())
    }

    /// Returns true for a leaf node.
    pub fn is_leaf(&self) -> bool {
        matches!(&*self.repr, Repr::Leaf { .. })
    }

    /// The scalar value of a leaf node.
    pub fn leaf_value(&self) -> Option<&Leaf> {
        match &*self.repr {
            Repr::Leaf { value, .. } => Some(value),
            Repr::Children { .. } => None,
        }
    }

    /// The node's priority.
    pub fn priority(&self) -> &Priority {
        match &*self.repr {
            Repr::Leaf { priority, .. } | Repr::Children { priority, .. } => priority,
        }
    }

    /// Returns a copy of this node with the given priority.
    ///
    /// The empty node cannot carry a priority and is returned unchanged.
    pub fn with_priority(&self, priority: Priority) -> Node {
        match &*self.repr {
            Repr::Leaf { value, .. } => Node {
                repr: Arc::new(Repr::Leaf {
                    value: value.clone(),
                    priority,
                }),
            },
            Repr::Children { children, .. } if !children.is_empty() => Node {
                repr: Arc::new(Repr::Children {
                    children: children.clone(),
                    priority,
                }),
            },
            Repr::Children { .. } => self.clone(),
        }
    }

    /// Child map of a non-leaf node.
    fn child_map(&self) -> Option<&BTreeMap<ChildKey, Node>> {
        match &*self.repr {
            Repr::Children { children, .. } => Some(children),
            Repr::Leaf { .. } => None,
        }
    }

    /// Iterates children in key order. Leaves have no children.
    pub fn children(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.child_map()
            .into_iter()
            .flat_map(|m| m.iter())
            .map(|(k, v)| (k.as_str(), v))
    }

    /// Number of children.
    pub fn num_children(&self) -> usize {
        self.child_map().map_or(0, BTreeMap::len)
    }

    /// Returns true if the node has a non-empty child at `key`.
    pub fn has_child(&self, key: &str) -> bool {
        !self.get_immediate_child(key).is_empty()
    }

    /// The child at `key`, or empty. `.priority` addresses the priority.
    pub fn get_immediate_child(&self, key: &str) -> Node {
        if key == PRIORITY_KEY {
            return self.priority().to_node();
        }
        self.child_map()
            .and_then(|m| m.get(&ChildKey::from(key)))
            .cloned()
            .unwrap_or_else(Node::empty)
    }

    /// The descendant at `path`, or empty.
    pub fn get_child(&self, path: &Path) -> Node {
        let mut node = self.clone();
        for seg in path.segments() {
            node = node.get_immediate_child(seg);
            if node.is_empty() {
                break;
            }
        }
        node
    }

    /// Replaces the child at `key`. An empty child removes it.
    pub fn update_immediate_child(&self, key: &str, child: Node) -> Node {
        if key == PRIORITY_KEY {
            return self.with_priority(Priority::from_node(&child));
        }
        match &*self.repr {
            Repr::Leaf { priority, .. } => {
                if child.is_empty() {
                    return self.clone();
                }
                let mut children = BTreeMap::new();
                children.insert(ChildKey::new(key), child);
                Node::from_children(children, priority.clone())
            }
            Repr::Children { children, priority } => {
                let mut children = children.clone();
                if child.is_empty() {
                    if children.remove(&ChildKey::from(key)).is_none() {
                        return self.clone();
                    }
                } else {
                    children.insert(ChildKey::new(key), child);
                }
                Node::from_children(children, priority.clone())
            }
        }
    }

    /// Replaces the descendant at `path`. The root path replaces the node.
    pub fn update_child(&self, path: &Path, node: Node) -> Node {
        let Some(front) = path.front() else {
            return node;
        };
        if front == PRIORITY_KEY {
            debug_assert_eq!(path.len(), 1, ".priority must be the last path segment");
            return self.with_priority(Priority::from_node(&node));
        }
        let child = self
            .get_immediate_child(front)
            .update_child(&path.pop_front(), node);
        self.update_immediate_child(front, child)
    }

    /// Imports a JSON value.
    ///
    /// Arrays become integer-keyed children, nulls are dropped, and the
    /// `.value`, `.priority` and `.sv` keys are interpreted.
    pub fn from_json(json: &Value) -> Node {
        match json {
            Value::Null => Node::empty(),
            Value::Bool(b) => Node::leaf(Leaf::Bool(*b)),
            Value::Number(n) => n
                .as_f64()
                .map(|n| Node::leaf(Leaf::Number(n)))
                .unwrap_or_else(Node::empty),
            Value::String(s) => Node::leaf(Leaf::String(s.clone())),
            Value::Array(items) => Node::from_pairs(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| (i.to_string(), Node::from_json(item))),
            ),
            Value::Object(map) => {
                let priority = map
                    .get(PRIORITY_KEY)
                    .map(Priority::from_json)
                    .unwrap_or_default();
                if let Some(sv) = map.get(SERVER_VALUE_KEY).and_then(ServerValue::from_json) {
                    return Node::leaf(Leaf::Deferred(sv)).with_priority(priority);
                }
                if let Some(inner) = map.get(VALUE_KEY) {
                    return Node::from_json(inner).with_priority(priority);
                }
                let children = map
                    .iter()
                    .filter(|(key, _)| !key.starts_with('.'))
                    .map(|(key, child)| (ChildKey::new(key.as_str()), Node::from_json(child)))
                    .filter(|(_, child)| !child.is_empty())
                    .collect();
                Node::from_children(children, priority)
            }
        }
    }

    /// Imports a JSON value and applies a separately supplied priority.
    pub fn from_json_with_priority(json: &Value, priority: &Value) -> Node {
        Node::from_json(json).with_priority(Priority::from_json(priority))
    }

    /// Exports the node as JSON.
    ///
    /// With `export` set, priorities are emitted through `.value` and
    /// `.priority` wrappers. Otherwise dense integer-keyed objects are
    /// rendered as arrays.
    pub fn to_json(&self, export: bool) -> Value {
        match &*self.repr {
            Repr::Leaf { value, priority } => {
                if export && !priority.is_none() {
                    let mut map = Map::new();
                    map.insert(VALUE_KEY.into(), value.to_json());
                    map.insert(PRIORITY_KEY.into(), priority.to_json());
                    Value::Object(map)
                } else {
                    value.to_json()
                }
            }
            Repr::Children { children, priority } => {
                if children.is_empty() {
                    return Value::Null;
                }
                if !export {
                    if let Some(array) = as_array(children) {
                        return array;
                    }
                }
                let mut map = Map::new();
                for (key, child) in children {
                    map.insert(key.to_string(), child.to_json(export));
                }
                if export && !priority.is_none() {
                    map.insert(PRIORITY_KEY.into(), priority.to_json());
                }
                Value::Object(map)
            }
        }
    }

    /// Exports without priorities.
    pub fn val(&self) -> Value {
        self.to_json(false)
    }

    /// Stable digest of the node's contents, priorities included.
    ///
    /// The empty node hashes to the empty string.
    pub fn hash(&self) -> String {
        let text = self.hash_text();
        if text.is_empty() {
            return String::new();
        }
        let digest = Sha256::digest(text.as_bytes());
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }

    fn hash_text(&self) -> String {
        match &*self.repr {
            Repr::Leaf { value, priority } => format!("{}{}", priority.hash_text(), value.hash_text()),
            Repr::Children { children, priority } => {
                let mut text = priority.hash_text();
                for (key, child) in children {
                    let child_hash = child.hash();
                    if !child_hash.is_empty() {
                        text.push(':');
                        text.push_str(key.as_str());
                        text.push(':');
                        text.push_str(&child_hash);
                    }
                }
                text
            }
        }
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        if Arc::ptr_eq(&self.repr, &other.repr) {
            return true;
        }
        match (&*self.repr, &*other.repr) {
            (
                Repr::Leaf { value: a, priority: pa },
                Repr::Leaf { value: b, priority: pb },
            ) => a == b && pa == pb,
            (
                Repr::Children { children: a, priority: pa },
                Repr::Children { children: b, priority: pb },
            ) => pa == pb && a == b,
            _ => false,
        }
    }
}

impl Default for Node {
    fn default() -> Self {
        Node::empty()
    }
}

impl From<Leaf> for Node {
    fn from(leaf: Leaf) -> Self {
        Node::leaf(leaf)
    }
}

/// Renders a number as an integer when it is one.
pub(crate) fn number_to_json(n: f64) -> Value {
    const MAX_SAFE: f64 = 9_007_199_254_740_991.0;
    if n.fract() == 0.0 && n.abs() <= MAX_SAFE {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

fn as_array(children: &BTreeMap<ChildKey, Node>) -> Option<Value> {
    let mut max_index = 0usize;
    for key in children.keys() {
        let index = crate::key::int_key(key.as_str())?;
        if index < 0 {
            return None;
        }
        max_index = max_index.max(index as usize);
    }
    if max_index >= 2 * children.len() {
        return None;
    }
    let mut items = vec![Value::Null; max_index + 1];
    for (key, child) in children {
        let index = crate::key::int_key(key.as_str())? as usize;
        items[index] = child.to_json(false);
    }
    Some(Value::Array(items))
}
