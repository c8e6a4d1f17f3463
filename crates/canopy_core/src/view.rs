//! A cached, windowed result of one query plus its listeners.
//!
//! The server cache holds what the authority sent. The event cache is
//! always recomputed as the query filter applied to the server cache with
//! visible pending writes on top; events are the difference between the
//! previous and the new event cache.

use crate::error::DatabaseError;
use crate::event::{DataEvent, DataSnapshot, Event, EventKind, EventRegistration, EventType};
use crate::operation::Operation;
use crate::query::QuerySpec;
use crate::write_tree::WriteTree;
use canopy_value::{Node, Path};
use std::collections::HashMap;

/// A node plus whether it is known to be complete.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CacheNode {
    /// Cached value.
    pub node: Node,
    /// Whether the value is fully known.
    pub complete: bool,
}

impl CacheNode {
    /// Creates a cache entry.
    pub fn new(node: Node, complete: bool) -> Self {
        Self { node, complete }
    }
}

/// One query's cache and registrations.
#[derive(Debug, Clone)]
pub struct View {
    query: QuerySpec,
    server_cache: CacheNode,
    event_cache: CacheNode,
    registrations: Vec<EventRegistration>,
}

impl View {
    /// Creates a view from an initial server cache.
    pub fn new(query: QuerySpec, server_cache: CacheNode, writes: &WriteTree) -> Self {
        let mut view = Self {
            query,
            server_cache,
            event_cache: CacheNode::default(),
            registrations: Vec::new(),
        };
        view.event_cache = view.compute_event_cache(writes);
        view
    }

    /// The query this view serves.
    pub fn query(&self) -> &QuerySpec {
        &self.query
    }

    /// What the authority has sent.
    pub fn server_cache(&self) -> &CacheNode {
        &self.server_cache
    }

    /// What listeners observe.
    pub fn event_cache(&self) -> &CacheNode {
        &self.event_cache
    }

    /// Returns true when no registrations remain.
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Registered listeners.
    pub fn registrations(&self) -> &[EventRegistration] {
        &self.registrations
    }

    /// Complete server data at `relative`, for unfiltered views.
    pub fn complete_server_cache(&self, relative: &Path) -> Option<Node> {
        if self.server_cache.complete && self.query.loads_all_data() {
            Some(self.server_cache.node.get_child(relative))
        } else {
            None
        }
    }

    fn compute_event_cache(&self, writes: &WriteTree) -> CacheNode {
        let path = &self.query.path;
        let shadowed = writes.has_complete_shadow(path, &[], false);
        let overlaid = writes.apply_writes(path, &self.server_cache.node, &[], false);
        CacheNode::new(
            self.query.params.filter(&overlaid),
            self.server_cache.complete || shadowed,
        )
    }

    /// Applies an operation relative to the view's path and returns the
    /// resulting events.
    pub fn apply_operation(&mut self, op: &Operation, writes: &WriteTree) -> Vec<Event> {
        match op {
            Operation::Overwrite { source, path, snap } if source.is_server() => {
                if path.is_empty() {
                    self.server_cache = CacheNode::new(snap.clone(), true);
                } else {
                    self.server_cache.node = self.server_cache.node.update_child(path, snap.clone());
                }
            }
            Operation::Merge {
                source,
                path,
                children,
            } if source.is_server() => {
                for (child_path, node) in children {
                    self.server_cache.node = self
                        .server_cache
                        .node
                        .update_child(&path.join(child_path), node.clone());
                }
            }
            Operation::ListenComplete { path, .. } if path.is_empty() => {
                self.server_cache.complete = true;
            }
            _ => {}
        }
        self.recompute(writes)
    }

    /// Recomputes the event cache and returns the resulting events.
    pub fn recompute(&mut self, writes: &WriteTree) -> Vec<Event> {
        let new_cache = self.compute_event_cache(writes);
        let events = generate_events(
            &self.query,
            &self.registrations,
            &self.event_cache,
            &new_cache,
        );
        self.event_cache = new_cache;
        events
    }

    /// Adds a registration.
    pub fn add_registration(&mut self, registration: EventRegistration) {
        self.registrations.push(registration);
    }

    /// Events bringing a new registration up to date with the cache.
    pub fn initial_events(&self, registration: &EventRegistration) -> Vec<Event> {
        generate_events(
            &self.query,
            std::slice::from_ref(registration),
            &CacheNode::default(),
            &self.event_cache,
        )
    }

    /// Removes one registration, or all when `registration` is `None`.
    ///
    /// With a cancel error every registration is removed and those with a
    /// cancel callback receive a cancel event.
    pub fn remove_registration(
        &mut self,
        registration: Option<&EventRegistration>,
        cancel_error: Option<&DatabaseError>,
    ) -> Vec<Event> {
        let mut events = Vec::new();
        if let Some(error) = cancel_error {
            for reg in &self.registrations {
                if reg.has_cancel() {
                    events.push(Event {
                        path: self.query.path.clone(),
                        registration: reg.clone(),
                        kind: EventKind::Cancel(error.clone()),
                    });
                }
            }
            self.registrations.clear();
            return events;
        }
        match registration {
            Some(target) => {
                if let Some(pos) = self.registrations.iter().position(|r| r.matches(target)) {
                    self.registrations.remove(pos);
                }
            }
            None => self.registrations.clear(),
        }
        events
    }
}

struct Change<'a> {
    event_type: EventType,
    name: &'a str,
    node: &'a Node,
}

/// Diffs two event caches into events for `registrations`.
///
/// Child events come first (added, removed, moved, changed), each group in
/// query order, followed by the value event.
fn generate_events(
    query: &QuerySpec,
    registrations: &[EventRegistration],
    old: &CacheNode,
    new: &CacheNode,
) -> Vec<Event> {
    if registrations.is_empty() {
        return Vec::new();
    }
    let index = query.params.index();
    let old_children: HashMap<&str, &Node> = old.node.children().collect();
    let new_sorted = index.sorted_children(&new.node);
    let positions: HashMap<&str, usize> = new_sorted
        .iter()
        .enumerate()
        .map(|(i, (name, _))| (*name, i))
        .collect();

    let mut added = Vec::new();
    let mut moved = Vec::new();
    let mut changed = Vec::new();
    for &(name, node) in &new_sorted {
        match old_children.get(name) {
            None => added.push(Change {
                event_type: EventType::ChildAdded,
                name,
                node,
            }),
            Some(&old_node) if old_node != node => {
                if index.value_changed(old_node, node) {
                    moved.push(Change {
                        event_type: EventType::ChildMoved,
                        name,
                        node,
                    });
                }
                changed.push(Change {
                    event_type: EventType::ChildChanged,
                    name,
                    node,
                });
            }
            Some(_) => {}
        }
    }
    let removed: Vec<Change> = index
        .sorted_children(&old.node)
        .into_iter()
        .filter(|(name, _)| !positions.contains_key(name))
        .map(|(name, node)| Change {
            event_type: EventType::ChildRemoved,
            name,
            node,
        })
        .collect();

    let mut events = Vec::new();
    for change in added.iter().chain(&removed).chain(&moved).chain(&changed) {
        let prev_name = if change.event_type == EventType::ChildRemoved {
            None
        } else {
            positions
                .get(change.name)
                .and_then(|&i| i.checked_sub(1))
                .map(|i| new_sorted[i].0.to_string())
        };
        let data = DataEvent {
            event_type: change.event_type,
            snapshot: DataSnapshot::new(
                change.node.clone(),
                query.path.child(change.name),
                index.clone(),
            ),
            prev_name,
        };
        push_for(&mut events, registrations, &query.path, data);
    }

    let value_changed = !old.complete || old.node != new.node;
    if new.complete && value_changed {
        let data = DataEvent {
            event_type: EventType::Value,
            snapshot: DataSnapshot::new(new.node.clone(), query.path.clone(), index.clone()),
            prev_name: None,
        };
        push_for(&mut events, registrations, &query.path, data);
    }
    events
}

fn push_for(events: &mut Vec<Event>, registrations: &[EventRegistration], path: &Path, data: DataEvent) {
    for reg in registrations {
        if reg.responds_to(data.event_type) {
            events.push(Event {
                path: path.clone(),
                registration: reg.clone(),
                kind: EventKind::Data(data.clone()),
            });
        }
    }
}
