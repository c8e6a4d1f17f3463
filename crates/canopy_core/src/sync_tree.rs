//! Sync points across the whole path space.
//!
//! The sync tree routes server and user operations to every affected view
//! and decides which remote listens are needed. A default listen at a path
//! covers every query below it, so adding one stops the listens beneath
//! it and removing one restarts them.
//!
//! Listen decisions are buffered as [`ListenRequest`]s; the owner drains
//! them with [`SyncTree::drain_listen_requests`] and forwards them.

use crate::error::DatabaseError;
use crate::event::{Event, EventRegistration};
use crate::operation::{Operation, OperationSource};
use crate::query::QuerySpec;
use crate::sync_point::SyncPoint;
use crate::tree::{NodeId, Tree};
use crate::view::CacheNode;
use crate::write_tree::{WriteId, WriteTree};
use canopy_value::{Node, Path};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// A change to the set of remote listens.
#[derive(Debug, Clone, PartialEq)]
pub enum ListenRequest {
    /// Start listening.
    Start {
        /// Query to listen for.
        query: QuerySpec,
        /// Tag for filtered queries.
        tag: Option<u64>,
        /// Server data already cached, for the state hash.
        server_cache: Node,
    },
    /// Stop listening.
    Stop {
        /// Query to stop.
        query: QuerySpec,
        /// Tag for filtered queries.
        tag: Option<u64>,
    },
}

/// Views, pending writes and listen bookkeeping for one data tree.
#[derive(Debug, Default)]
pub struct SyncTree {
    points: Tree<SyncPoint>,
    writes: WriteTree,
    query_to_tag: HashMap<String, u64>,
    tag_to_query: HashMap<u64, QuerySpec>,
    next_tag: u64,
    requests: Vec<ListenRequest>,
}

impl SyncTree {
    /// Creates an empty sync tree.
    pub fn new() -> Self {
        Self {
            next_tag: 1,
            ..Self::default()
        }
    }

    /// The pending write log.
    pub fn writes(&self) -> &WriteTree {
        &self.writes
    }

    /// Takes the buffered listen changes.
    pub fn drain_listen_requests(&mut self) -> Vec<ListenRequest> {
        std::mem::take(&mut self.requests)
    }

    /// Tag assigned to a filtered query.
    pub fn tag_for_query(&self, query: &QuerySpec) -> Option<u64> {
        self.query_to_tag.get(&query.key()).copied()
    }

    /// Query owning a tag.
    pub fn query_for_tag(&self, tag: u64) -> Option<&QuerySpec> {
        self.tag_to_query.get(&tag)
    }

    /// The sync point at `path`.
    pub fn sync_point(&self, path: &Path) -> Option<&SyncPoint> {
        self.points.get(path)
    }

    /// Records a local overwrite and returns events for visible writes.
    pub fn apply_user_overwrite(
        &mut self,
        path: Path,
        node: Node,
        write_id: WriteId,
        visible: bool,
    ) -> Vec<Event> {
        self.writes
            .add_overwrite(path.clone(), node.clone(), write_id, visible);
        if !visible {
            return Vec::new();
        }
        self.apply_operation_to_sync_points(&Operation::Overwrite {
            source: OperationSource::User,
            path,
            snap: node,
        })
    }

    /// Records a local merge and returns events.
    pub fn apply_user_merge(
        &mut self,
        path: Path,
        children: BTreeMap<Path, Node>,
        write_id: WriteId,
    ) -> Vec<Event> {
        self.writes.add_merge(path.clone(), children.clone(), write_id);
        self.apply_operation_to_sync_points(&Operation::Merge {
            source: OperationSource::User,
            path,
            children,
        })
    }

    /// Removes a pending write, folding it in or rolling it back.
    pub fn ack_user_write(&mut self, write_id: WriteId, revert: bool) -> Vec<Event> {
        let Some((record, reevaluate)) = self.writes.remove(write_id) else {
            return Vec::new();
        };
        if !reevaluate {
            return Vec::new();
        }
        self.apply_operation_to_sync_points(&Operation::AckUserWrite {
            path: record.path,
            revert,
        })
    }

    /// Applies server data for an untagged listen.
    pub fn apply_server_overwrite(&mut self, path: Path, node: Node) -> Vec<Event> {
        self.apply_operation_to_sync_points(&Operation::Overwrite {
            source: OperationSource::SERVER,
            path,
            snap: node,
        })
    }

    /// Applies a server merge for an untagged listen.
    pub fn apply_server_merge(&mut self, path: Path, children: BTreeMap<Path, Node>) -> Vec<Event> {
        self.apply_operation_to_sync_points(&Operation::Merge {
            source: OperationSource::SERVER,
            path,
            children,
        })
    }

    /// Marks the views under an untagged listen complete.
    pub fn apply_listen_complete(&mut self, path: Path) -> Vec<Event> {
        self.apply_operation_to_sync_points(&Operation::ListenComplete {
            source: OperationSource::SERVER,
            path,
        })
    }

    /// Applies server data for a tagged listen. Unknown tags are ignored.
    pub fn apply_tagged_query_overwrite(&mut self, path: Path, node: Node, tag: u64) -> Vec<Event> {
        self.apply_tagged_operation(
            tag,
            Operation::Overwrite {
                source: OperationSource::Server { tagged: true },
                path,
                snap: node,
            },
        )
    }

    /// Applies a server merge for a tagged listen.
    pub fn apply_tagged_query_merge(
        &mut self,
        path: Path,
        children: BTreeMap<Path, Node>,
        tag: u64,
    ) -> Vec<Event> {
        self.apply_tagged_operation(
            tag,
            Operation::Merge {
                source: OperationSource::Server { tagged: true },
                path,
                children,
            },
        )
    }

    /// Marks a tagged view complete.
    pub fn apply_tagged_listen_complete(&mut self, path: Path, tag: u64) -> Vec<Event> {
        self.apply_tagged_operation(
            tag,
            Operation::ListenComplete {
                source: OperationSource::Server { tagged: true },
                path,
            },
        )
    }

    fn apply_tagged_operation(&mut self, tag: u64, op: Operation) -> Vec<Event> {
        let Some(query) = self.tag_to_query.get(&tag).cloned() else {
            debug!(tag, "ignoring operation for unknown tag");
            return Vec::new();
        };
        let Some(relative) = op.relative_to(&query.path) else {
            return Vec::new();
        };
        let id = query.identifier();
        match self.points.get_mut(&query.path) {
            Some(point) => point.apply_operation(&relative, &self.writes, Some(&id)),
            None => Vec::new(),
        }
    }

    /// Sync points reached by an operation at `path`: descendants first,
    /// then the point itself, then ancestors nearest first.
    fn affected_points(&self, path: &Path) -> Vec<NodeId> {
        let mut ids = Vec::new();
        match self.points.find(path) {
            Some(id) => {
                ids.extend(self.points.post_order(id));
                ids.extend(self.points.ancestors(id));
            }
            None => {
                ids.extend(
                    self.points
                        .nodes_on_path(path)
                        .into_iter()
                        .rev()
                        .map(|(_, id)| id),
                );
            }
        }
        ids.retain(|&id| self.points.value(id).is_some());
        ids
    }

    fn apply_operation_to_sync_points(&mut self, op: &Operation) -> Vec<Event> {
        let mut events = Vec::new();
        for id in self.affected_points(op.path()) {
            let point_path = self.points.path(id);
            let Some(relative) = op.relative_to(&point_path) else {
                continue;
            };
            if let Some(point) = self.points.value_mut(id) {
                events.extend(point.apply_operation(&relative, &self.writes, None));
            }
        }
        events
    }

    fn server_cache_at(&self, path: &Path) -> Option<Node> {
        self.points
            .values_on_path(path)
            .into_iter()
            .find_map(|(point_path, point)| {
                let relative = Path::relative(&point_path, path)?;
                point.complete_server_cache(&relative)
            })
    }

    /// Registers a listener and returns its initial events.
    pub fn add_event_registration(
        &mut self,
        query: &QuerySpec,
        registration: EventRegistration,
    ) -> Vec<Event> {
        let path = &query.path;
        let found_ancestor_default = self
            .points
            .values_on_path(path)
            .iter()
            .any(|(_, point)| point.has_complete_view());
        let server_cache = match self.server_cache_at(path) {
            Some(node) => CacheNode::new(node, true),
            None => {
                let mut node = Node::empty();
                if let Some(id) = self.points.find(path) {
                    for child in self.points.children(id) {
                        if let Some(cache) = self
                            .points
                            .value(child)
                            .and_then(|p| p.complete_server_cache(&Path::root()))
                        {
                            node = node.update_immediate_child(self.points.name(child), cache);
                        }
                    }
                }
                CacheNode::new(node, false)
            }
        };

        let view_exists = self
            .points
            .get(path)
            .is_some_and(|p| p.view_exists_for_query(query));
        if !view_exists && !query.loads_all_data() {
            let tag = self.next_tag;
            self.next_tag += 1;
            debug_assert!(!self.query_to_tag.contains_key(&query.key()));
            self.query_to_tag.insert(query.key(), tag);
            self.tag_to_query.insert(tag, query.clone());
        }

        let id = self.points.subtree(path);
        if self.points.value(id).is_none() {
            self.points.set_value(id, Some(SyncPoint::new()));
        }
        let events = match self.points.value_mut(id) {
            Some(point) => point.add_event_registration(query, registration, &self.writes, server_cache),
            None => Vec::new(),
        };
        if !view_exists && !found_ancestor_default {
            self.setup_listener(query);
        }
        events
    }

    fn setup_listener(&mut self, query: &QuerySpec) {
        let tag = self.tag_for_query(query);
        let server_cache = self
            .points
            .get(&query.path)
            .and_then(|p| p.view_for_query(query))
            .map(|v| v.server_cache().node.clone())
            .unwrap_or_default();
        debug!(query = %query, ?tag, "starting listen");
        self.requests.push(ListenRequest::Start {
            query: query.for_listening(),
            tag,
            server_cache,
        });
        if tag.is_none() {
            if let Some(id) = self.points.find(&query.path) {
                for stop in self.queries_to_stop(id, true) {
                    let tag = self.tag_for_query(&stop);
                    self.requests.push(ListenRequest::Stop {
                        query: stop.for_listening(),
                        tag,
                    });
                }
            }
        }
    }

    /// Listens made redundant by a new default listen at `id`.
    fn queries_to_stop(&self, id: NodeId, is_root: bool) -> Vec<QuerySpec> {
        let point = self.points.value(id);
        if !is_root {
            if let Some(view) = point.and_then(SyncPoint::complete_view) {
                return vec![view.query().clone()];
            }
        }
        let mut queries = point.map(SyncPoint::query_views).unwrap_or_default();
        for child in self.points.children(id) {
            queries.extend(self.queries_to_stop(child, false));
        }
        queries
    }

    /// Views that need their own listen once no ancestor covers them.
    fn distinct_views(&self, id: NodeId) -> Vec<(QuerySpec, Node)> {
        let point = self.points.value(id);
        if let Some(view) = point.and_then(SyncPoint::complete_view) {
            return vec![(view.query().clone(), view.server_cache().node.clone())];
        }
        let mut views: Vec<(QuerySpec, Node)> = point
            .map(|p| {
                p.views()
                    .filter(|v| !v.query().loads_all_data())
                    .map(|v| (v.query().clone(), v.server_cache().node.clone()))
                    .collect()
            })
            .unwrap_or_default();
        for child in self.points.children(id) {
            views.extend(self.distinct_views(child));
        }
        views
    }

    /// Removes a listener, or every listener of `query` when
    /// `registration` is `None`.
    ///
    /// A cancel error removes every registration of the query and yields
    /// cancel events. Removing something twice is a no-op.
    pub fn remove_event_registration(
        &mut self,
        query: &QuerySpec,
        registration: Option<&EventRegistration>,
        cancel_error: Option<DatabaseError>,
    ) -> Vec<Event> {
        let path = &query.path;
        let Some(id) = self.points.find(path) else {
            return Vec::new();
        };
        let applies = self
            .points
            .value(id)
            .is_some_and(|p| query.is_default() || p.view_exists_for_query(query));
        if !applies {
            return Vec::new();
        }
        let (removed, events) = match self.points.value_mut(id) {
            Some(point) => point.remove_event_registration(query, registration, cancel_error.as_ref()),
            None => return Vec::new(),
        };
        if self.points.value(id).is_some_and(SyncPoint::is_empty) {
            self.points.set_value(id, None);
            self.points.prune(id);
        }

        let removing_default = removed.iter().any(QuerySpec::loads_all_data);
        let covered = self
            .points
            .values_on_path(path)
            .iter()
            .any(|(_, point)| point.has_complete_view());
        if removing_default && !covered {
            if let Some(id) = self.points.find(path) {
                for (view_query, server_cache) in self.distinct_views(id) {
                    let tag = self.tag_for_query(&view_query);
                    debug!(query = %view_query, ?tag, "restoring listen");
                    self.requests.push(ListenRequest::Start {
                        query: view_query.for_listening(),
                        tag,
                        server_cache,
                    });
                }
            }
        }
        if !covered && !removed.is_empty() && cancel_error.is_none() {
            if removing_default {
                self.requests.push(ListenRequest::Stop {
                    query: query.for_listening(),
                    tag: None,
                });
            } else {
                for stop in &removed {
                    let tag = self.tag_for_query(stop);
                    self.requests.push(ListenRequest::Stop {
                        query: stop.for_listening(),
                        tag,
                    });
                }
            }
        }
        for stop in &removed {
            if !stop.loads_all_data() {
                if let Some(tag) = self.query_to_tag.remove(&stop.key()) {
                    self.tag_to_query.remove(&tag);
                }
            }
        }
        events
    }

    /// Visible value at `path`, ignoring the excluded writes.
    pub fn calc_complete_event_cache(&self, path: &Path, exclude: &[WriteId]) -> Node {
        let server = self.server_cache_at(path);
        self.writes
            .calc_complete_event_cache(path, server.as_ref(), exclude, false)
            .unwrap_or_default()
    }

    /// Latest local value at `path`, hidden writes included.
    pub fn calc_latest_state(&self, path: &Path, exclude: &[WriteId]) -> Node {
        let server = self.server_cache_at(path);
        self.writes
            .calc_complete_event_cache(path, server.as_ref(), exclude, true)
            .unwrap_or_default()
    }

    /// The cached result of `query`, if it is fully known.
    pub fn cached_value(&self, query: &QuerySpec) -> Option<Node> {
        if let Some(view) = self
            .points
            .get(&query.path)
            .and_then(|p| p.view_for_query(query))
        {
            if view.event_cache().complete {
                return Some(view.event_cache().node.clone());
            }
        }
        let server = self.server_cache_at(&query.path);
        self.writes
            .calc_complete_event_cache(&query.path, server.as_ref(), &[], false)
            .map(|node| query.params.filter(&node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryParams;
    use serde_json::json;

    fn starts(requests: &[ListenRequest]) -> Vec<String> {
        requests
            .iter()
            .map(|r| match r {
                ListenRequest::Start { query, .. } => format!("start {}", query.path),
                ListenRequest::Stop { query, .. } => format!("stop {}", query.path),
            })
            .collect()
    }

    #[test]
    fn default_ancestor_listen_replaces_descendants() {
        let mut tree = SyncTree::new();
        let aa = QuerySpec::default_at(Path::parse("a/aa"));
        let bb = QuerySpec::default_at(Path::parse("a/bb"));
        let a = QuerySpec::default_at(Path::parse("a"));
        tree.add_event_registration(&aa, EventRegistration::value(|_| {}));
        tree.add_event_registration(&bb, EventRegistration::value(|_| {}));
        assert_eq!(starts(&tree.drain_listen_requests()), vec!["start /a/aa", "start /a/bb"]);

        let reg = EventRegistration::value(|_| {});
        tree.add_event_registration(&a, reg.clone());
        assert_eq!(
            starts(&tree.drain_listen_requests()),
            vec!["start /a", "stop /a/aa", "stop /a/bb"]
        );

        tree.remove_event_registration(&a, Some(&reg), None);
        assert_eq!(
            starts(&tree.drain_listen_requests()),
            vec!["start /a/aa", "start /a/bb", "stop /a"]
        );

        tree.remove_event_registration(&a, Some(&reg), None);
        assert!(tree.drain_listen_requests().is_empty());
    }

    #[test]
    fn covered_queries_do_not_listen() {
        let mut tree = SyncTree::new();
        tree.add_event_registration(&QuerySpec::default_at(Path::root()), EventRegistration::value(|_| {}));
        tree.drain_listen_requests();
        let child = QuerySpec::new(Path::parse("x"), QueryParams::new().limit_to_first(1));
        tree.add_event_registration(&child, EventRegistration::value(|_| {}));
        assert!(tree.drain_listen_requests().is_empty());
        assert!(tree.tag_for_query(&child).is_some());
    }

    #[test]
    fn filtered_queries_are_tagged() {
        let mut tree = SyncTree::new();
        let query = QuerySpec::new(Path::parse("list"), QueryParams::new().limit_to_last(2));
        let reg = EventRegistration::value(|_| {});
        tree.add_event_registration(&query, reg.clone());
        let requests = tree.drain_listen_requests();
        let ListenRequest::Start { tag: Some(tag), .. } = &requests[0] else {
            panic!("expected tagged start, got {requests:?}");
        };
        let tag = *tag;
        assert_eq!(tree.query_for_tag(tag), Some(&query));

        let data = Node::from_json(&json!({"b": 2, "c": 3}));
        let events = tree.apply_tagged_query_overwrite(Path::parse("list"), data, tag);
        assert_eq!(events.len(), 1);
        assert!(tree.apply_tagged_query_overwrite(Path::parse("list"), Node::empty(), 999).is_empty());

        tree.remove_event_registration(&query, Some(&reg), None);
        assert_eq!(starts(&tree.drain_listen_requests()), vec!["stop /list"]);
        assert_eq!(tree.query_for_tag(tag), None);
    }

    #[test]
    fn server_data_reaches_descendant_views() {
        let mut tree = SyncTree::new();
        let query = QuerySpec::default_at(Path::parse("a/b"));
        tree.add_event_registration(&query, EventRegistration::value(|_| {}));
        let events = tree.apply_server_overwrite(Path::parse("a"), Node::from_json(&json!({"b": 7})));
        assert_eq!(events.len(), 1);
        assert_eq!(tree.calc_complete_event_cache(&Path::parse("a/b"), &[]).val(), json!(7));
    }

    #[test]
    fn user_writes_and_acks() {
        let mut tree = SyncTree::new();
        let query = QuerySpec::default_at(Path::root());
        tree.add_event_registration(&query, EventRegistration::value(|_| {}));
        tree.apply_server_overwrite(Path::root(), Node::from_json(&json!({"a": 1})));

        let events = tree.apply_user_overwrite(Path::parse("a"), Node::from_json(&json!(2)), 1, true);
        assert_eq!(events.len(), 1);
        assert_eq!(tree.cached_value(&query).unwrap().val(), json!({"a": 2}));

        let events = tree.ack_user_write(1, true);
        assert_eq!(events.len(), 1);
        assert_eq!(tree.cached_value(&query).unwrap().val(), json!({"a": 1}));
        assert!(tree.ack_user_write(1, true).is_empty());
    }

    #[test]
    fn hidden_writes_only_in_latest_state() {
        let mut tree = SyncTree::new();
        tree.apply_user_overwrite(Path::parse("t"), Node::from_json(&json!(5)), 1, false);
        assert!(tree.calc_complete_event_cache(&Path::parse("t"), &[]).is_empty());
        assert_eq!(tree.calc_latest_state(&Path::parse("t"), &[]).val(), json!(5));
        assert!(tree.calc_latest_state(&Path::parse("t"), &[1]).is_empty());
    }

    #[test]
    fn listen_failure_cancels() {
        let mut tree = SyncTree::new();
        let query = QuerySpec::default_at(Path::parse("secret"));
        let reg = EventRegistration::value(|_| {}).with_cancel(|_| {});
        tree.add_event_registration(&query, reg);
        tree.drain_listen_requests();
        let err = DatabaseError::listen_revoked("permission_denied", &query.path);
        let events = tree.remove_event_registration(&query, None, Some(err));
        assert_eq!(events.len(), 1);
        assert!(tree.drain_listen_requests().is_empty());
        assert!(tree.sync_point(&query.path).is_none());
    }
}
