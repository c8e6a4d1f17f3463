//! All views registered at one path.

use crate::error::DatabaseError;
use crate::event::{Event, EventRegistration};
use crate::operation::Operation;
use crate::query::QuerySpec;
use crate::view::{CacheNode, View};
use crate::write_tree::WriteTree;
use canopy_value::{Node, Path};
use std::collections::BTreeMap;

/// Views at a single location, keyed by query identifier.
#[derive(Debug, Clone, Default)]
pub struct SyncPoint {
    views: BTreeMap<String, View>,
}

impl SyncPoint {
    /// Creates an empty sync point.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when no views remain.
    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    /// All views.
    pub fn views(&self) -> impl Iterator<Item = &View> {
        self.views.values()
    }

    /// The view serving `query`.
    pub fn view_for_query(&self, query: &QuerySpec) -> Option<&View> {
        self.views.get(&query.identifier())
    }

    /// Returns true if a view serves `query`.
    pub fn view_exists_for_query(&self, query: &QuerySpec) -> bool {
        self.views.contains_key(&query.identifier())
    }

    /// Returns true if some view loads all data at this path.
    pub fn has_complete_view(&self) -> bool {
        self.complete_view().is_some()
    }

    /// A view that loads all data at this path.
    pub fn complete_view(&self) -> Option<&View> {
        self.views.values().find(|v| v.query().loads_all_data())
    }

    /// Queries of the filtered views.
    pub fn query_views(&self) -> Vec<QuerySpec> {
        self.views
            .values()
            .filter(|v| !v.query().loads_all_data())
            .map(|v| v.query().clone())
            .collect()
    }

    /// Complete server data at `relative` below this point, if known.
    pub fn complete_server_cache(&self, relative: &Path) -> Option<Node> {
        self.views
            .values()
            .find_map(|v| v.complete_server_cache(relative))
    }

    /// Applies an operation relative to this point.
    ///
    /// With `query_id`, only that view receives it.
    pub fn apply_operation(
        &mut self,
        op: &Operation,
        writes: &WriteTree,
        query_id: Option<&str>,
    ) -> Vec<Event> {
        match query_id {
            Some(id) => self
                .views
                .get_mut(id)
                .map(|view| view.apply_operation(op, writes))
                .unwrap_or_default(),
            None => self
                .views
                .values_mut()
                .flat_map(|view| view.apply_operation(op, writes))
                .collect(),
        }
    }

    /// Adds a registration, creating the view if needed, and returns the
    /// initial events for it.
    pub fn add_event_registration(
        &mut self,
        query: &QuerySpec,
        registration: EventRegistration,
        writes: &WriteTree,
        server_cache: CacheNode,
    ) -> Vec<Event> {
        let view = self
            .views
            .entry(query.identifier())
            .or_insert_with(|| View::new(query.clone(), server_cache, writes));
        view.add_registration(registration.clone());
        view.initial_events(&registration)
    }

    /// Removes registrations.
    ///
    /// A default query removes from every view at the point. Returns the
    /// queries whose listens are no longer needed, and any cancel events.
    pub fn remove_event_registration(
        &mut self,
        query: &QuerySpec,
        registration: Option<&EventRegistration>,
        cancel_error: Option<&DatabaseError>,
    ) -> (Vec<QuerySpec>, Vec<Event>) {
        let had_complete_view = self.has_complete_view();
        let mut removed = Vec::new();
        let mut events = Vec::new();
        let ids: Vec<String> = if query.is_default() {
            self.views.keys().cloned().collect()
        } else {
            vec![query.identifier()]
        };
        for id in ids {
            let Some(view) = self.views.get_mut(&id) else {
                continue;
            };
            events.extend(view.remove_registration(registration, cancel_error));
            if view.is_empty() {
                if let Some(view) = self.views.remove(&id) {
                    if !view.query().loads_all_data() {
                        removed.push(view.query().clone());
                    }
                }
            }
        }
        if had_complete_view && !self.has_complete_view() {
            removed.push(QuerySpec::default_at(query.path.clone()));
        }
        (removed, events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryParams;
    use serde_json::json;

    #[test]
    fn default_removal_clears_every_view() {
        let writes = WriteTree::new();
        let mut point = SyncPoint::new();
        let path = Path::parse("a");
        let default = QuerySpec::default_at(path.clone());
        let limited = QuerySpec::new(path.clone(), QueryParams::new().limit_to_first(1));
        point.add_event_registration(&default, EventRegistration::value(|_| {}), &writes, CacheNode::default());
        point.add_event_registration(&limited, EventRegistration::value(|_| {}), &writes, CacheNode::default());
        assert!(point.has_complete_view());
        assert_eq!(point.query_views(), vec![limited.clone()]);

        let (removed, _) = point.remove_event_registration(&default, None, None);
        assert!(point.is_empty());
        assert!(removed.contains(&limited));
        assert!(removed.contains(&default));
    }

    #[test]
    fn complete_server_cache_from_default_view() {
        let writes = WriteTree::new();
        let mut point = SyncPoint::new();
        let query = QuerySpec::default_at(Path::root());
        let cache = CacheNode::new(Node::from_json(&json!({"a": {"b": 1}})), true);
        point.add_event_registration(&query, EventRegistration::value(|_| {}), &writes, cache);
        let node = point.complete_server_cache(&Path::parse("a/b")).unwrap();
        assert_eq!(node.val(), json!(1));
    }

    #[test]
    fn initial_events_reflect_existing_cache() {
        let writes = WriteTree::new();
        let mut point = SyncPoint::new();
        let query = QuerySpec::default_at(Path::root());
        let cache = CacheNode::new(Node::from_json(&json!({"x": 1})), true);
        let events = point.add_event_registration(&query, EventRegistration::value(|_| {}), &writes, cache);
        assert_eq!(events.len(), 1);
        let second = point.add_event_registration(&query, EventRegistration::value(|_| {}), &writes, CacheNode::default());
        assert_eq!(second.len(), 1, "a new listener sees the cached value immediately");
    }
}
