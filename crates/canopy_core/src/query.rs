//! Query parameters and their canonical identity.
//!
//! Two queries with the same path and identifier share a view and a
//! single remote listen.

use canopy_value::{default_end_name, default_start_name, Index, NamedNode, Node, Path};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;

/// Identifier of the unfiltered query.
pub const DEFAULT_QUERY_ID: &str = "default";

/// Which end of the range a limit keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitAnchor {
    /// Keep the first children (limit to first).
    Left,
    /// Keep the last children (limit to last).
    Right,
}

/// One end of a range filter.
#[derive(Debug, Clone, PartialEq)]
pub struct Bound {
    /// Index value of the bound.
    pub value: Value,
    /// Optional key tie-breaker.
    pub name: Option<String>,
}

/// Ordering, range and limit applied to the children of a location.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryParams {
    index: Index,
    start: Option<Bound>,
    end: Option<Bound>,
    limit: Option<(u32, LimitAnchor)>,
}

impl QueryParams {
    /// Unfiltered parameters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Orders children by `index`.
    pub fn order_by(mut self, index: Index) -> Self {
        self.index = index;
        self
    }

    /// Keeps children at or after `(value, name)`.
    pub fn start_at(mut self, value: Value, name: Option<&str>) -> Self {
        self.start = Some(Bound {
            value,
            name: name.map(str::to_string),
        });
        self
    }

    /// Keeps children at or before `(value, name)`.
    pub fn end_at(mut self, value: Value, name: Option<&str>) -> Self {
        self.end = Some(Bound {
            value,
            name: name.map(str::to_string),
        });
        self
    }

    /// Keeps children equal to `(value, name)`.
    pub fn equal_to(self, value: Value, name: Option<&str>) -> Self {
        self.start_at(value.clone(), name).end_at(value, name)
    }

    /// Keeps the first `n` children.
    pub fn limit_to_first(mut self, n: u32) -> Self {
        self.limit = Some((n, LimitAnchor::Left));
        self
    }

    /// Keeps the last `n` children.
    pub fn limit_to_last(mut self, n: u32) -> Self {
        self.limit = Some((n, LimitAnchor::Right));
        self
    }

    /// The child ordering.
    pub fn index(&self) -> &Index {
        &self.index
    }

    /// The limit, if any.
    pub fn limit(&self) -> Option<(u32, LimitAnchor)> {
        self.limit
    }

    /// Returns true when neither range nor limit filters children.
    pub fn loads_all_data(&self) -> bool {
        self.start.is_none() && self.end.is_none() && self.limit.is_none()
    }

    /// Returns true for the unfiltered, priority-ordered query.
    pub fn is_default(&self) -> bool {
        self.loads_all_data() && self.index == Index::Priority
    }

    fn start_post(&self) -> Option<NamedNode> {
        self.start.as_ref().map(|b| {
            self.index
                .make_post(&b.value, b.name.as_deref().unwrap_or(default_start_name()))
        })
    }

    fn end_post(&self) -> Option<NamedNode> {
        self.end.as_ref().map(|b| {
            self.index
                .make_post(&b.value, b.name.as_deref().unwrap_or(default_end_name()))
        })
    }

    /// Wire form sent with a listen.
    pub fn to_wire(&self) -> Value {
        let mut obj = Map::new();
        if let Some(start) = &self.start {
            obj.insert("sp".into(), start.value.clone());
            if let Some(name) = &start.name {
                obj.insert("sn".into(), Value::String(name.clone()));
            }
        }
        if let Some(end) = &self.end {
            obj.insert("ep".into(), end.value.clone());
            if let Some(name) = &end.name {
                obj.insert("en".into(), Value::String(name.clone()));
            }
        }
        if let Some((n, anchor)) = self.limit {
            obj.insert("l".into(), Value::from(n));
            let vf = match anchor {
                LimitAnchor::Left => "l",
                LimitAnchor::Right => "r",
            };
            obj.insert("vf".into(), Value::String(vf.into()));
        }
        if self.index != Index::Priority {
            obj.insert("i".into(), Value::String(self.index.to_wire()));
        }
        Value::Object(obj)
    }

    /// Canonical, order-independent identifier.
    pub fn identifier(&self) -> String {
        if self.is_default() {
            DEFAULT_QUERY_ID.to_string()
        } else {
            // serde_json maps are sorted, so the rendering is canonical
            self.to_wire().to_string()
        }
    }

    /// Returns true if the child falls within the range bounds.
    pub fn matches(&self, name: &str, node: &Node) -> bool {
        let child = NamedNode::new(name, node.clone());
        let after_start = self
            .start_post()
            .map_or(true, |post| self.index.compare_named(&post, &child) != Ordering::Greater);
        let before_end = self
            .end_post()
            .map_or(true, |post| self.index.compare_named(&child, &post) != Ordering::Greater);
        after_start && before_end
    }

    /// Applies range and limit to `node`.
    ///
    /// Filtered results never carry a priority and a leaf filters to empty.
    pub fn filter(&self, node: &Node) -> Node {
        if self.loads_all_data() {
            return node.clone();
        }
        if node.is_leaf() {
            return Node::empty();
        }
        let mut kept: Vec<(&str, &Node)> = self
            .index
            .sorted_children(node)
            .into_iter()
            .filter(|(name, child)| self.matches(name, child))
            .collect();
        if let Some((n, anchor)) = self.limit {
            let n = n as usize;
            if kept.len() > n {
                match anchor {
                    LimitAnchor::Left => kept.truncate(n),
                    LimitAnchor::Right => {
                        kept.drain(..kept.len() - n);
                    }
                }
            }
        }
        Node::from_pairs(kept.into_iter().map(|(k, v)| (k, v.clone())))
    }
}

/// A query: a location plus its parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySpec {
    /// Location of the query.
    pub path: Path,
    /// Filtering and ordering.
    pub params: QueryParams,
}

impl QuerySpec {
    /// Creates a query.
    pub fn new(path: Path, params: QueryParams) -> Self {
        Self { path, params }
    }

    /// The unfiltered query at `path`.
    pub fn default_at(path: Path) -> Self {
        Self::new(path, QueryParams::default())
    }

    /// Canonical identifier of the parameters.
    pub fn identifier(&self) -> String {
        self.params.identifier()
    }

    /// Key unique to the `(path, identifier)` pair.
    pub fn key(&self) -> String {
        format!("{}${}", self.path, self.identifier())
    }

    /// Returns true for the unfiltered query.
    pub fn is_default(&self) -> bool {
        self.params.is_default()
    }

    /// Returns true when no range or limit applies.
    pub fn loads_all_data(&self) -> bool {
        self.params.loads_all_data()
    }

    /// The query actually listened for: ordered-but-unfiltered queries
    /// listen as the default query.
    pub fn for_listening(&self) -> QuerySpec {
        if self.loads_all_data() && !self.is_default() {
            QuerySpec::default_at(self.path.clone())
        } else {
            self.clone()
        }
    }
}

impl fmt::Display for QuerySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}
