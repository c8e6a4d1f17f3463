//! Event registrations, snapshots and change events.

use crate::error::DatabaseError;
use canopy_value::{Index, Node, Path};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Kinds of data events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// The complete value at the location.
    Value,
    /// A child appeared.
    ChildAdded,
    /// A child disappeared.
    ChildRemoved,
    /// A child's value changed.
    ChildChanged,
    /// A child changed position under the query ordering.
    ChildMoved,
}

impl EventType {
    /// Wire name of the event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Value => "value",
            Self::ChildAdded => "child_added",
            Self::ChildRemoved => "child_removed",
            Self::ChildChanged => "child_changed",
            Self::ChildMoved => "child_moved",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable view of the data at a location.
#[derive(Debug, Clone, PartialEq)]
pub struct DataSnapshot {
    node: Node,
    path: Path,
    index: Index,
}

impl DataSnapshot {
    /// Creates a snapshot.
    pub fn new(node: Node, path: Path, index: Index) -> Self {
        Self { node, path, index }
    }

    /// The underlying node.
    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Location of the snapshot.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last key of the location, `None` at the root.
    pub fn key(&self) -> Option<&str> {
        self.path.back()
    }

    /// Returns true if the location holds data.
    pub fn exists(&self) -> bool {
        !self.node.is_empty()
    }

    /// Value without priorities.
    pub fn val(&self) -> Value {
        self.node.val()
    }

    /// Value including `.priority` wrappers.
    pub fn export_val(&self) -> Value {
        self.node.to_json(true)
    }

    /// Priority of the location.
    pub fn priority(&self) -> Value {
        self.node.priority().to_json()
    }

    /// Snapshot of a descendant.
    pub fn child(&self, path: &str) -> DataSnapshot {
        let relative = Path::parse(path);
        DataSnapshot::new(
            self.node.get_child(&relative),
            self.path.join(&relative),
            self.index.clone(),
        )
    }

    /// Returns true if the descendant holds data.
    pub fn has_child(&self, path: &str) -> bool {
        !self.node.get_child(&Path::parse(path)).is_empty()
    }

    /// Number of children.
    pub fn num_children(&self) -> usize {
        self.node.num_children()
    }

    /// Child snapshots in the query's order.
    pub fn children(&self) -> Vec<DataSnapshot> {
        self.index
            .sorted_children(&self.node)
            .into_iter()
            .map(|(key, child)| {
                DataSnapshot::new(child.clone(), self.path.child(key), self.index.clone())
            })
            .collect()
    }
}

/// A data event delivered to a callback.
#[derive(Debug, Clone)]
pub struct DataEvent {
    /// The kind of change.
    pub event_type: EventType,
    /// Snapshot of the location (value) or child (child events).
    pub snapshot: DataSnapshot,
    /// Key of the preceding child in query order, for child events.
    pub prev_name: Option<String>,
}

/// Callback receiving data events.
pub type DataCallback = Arc<dyn Fn(&DataEvent) + Send + Sync>;

/// Callback receiving cancellation.
pub type CancelCallback = Arc<dyn Fn(&DatabaseError) + Send + Sync>;

/// Which events a registration wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFilter {
    /// Only `value` events.
    Value,
    /// The listed child events.
    Children(Vec<EventType>),
}

/// A listener callback with its cancel handler and context.
#[derive(Clone)]
pub struct EventRegistration {
    filter: EventFilter,
    callback: DataCallback,
    cancel: Option<CancelCallback>,
    context: Option<u64>,
}

impl EventRegistration {
    /// Registration for `value` events.
    pub fn value<F>(callback: F) -> Self
    where
        F: Fn(&DataEvent) + Send + Sync + 'static,
    {
        Self::from_arc(EventFilter::Value, Arc::new(callback))
    }

    /// Registration for the given child events.
    pub fn children<F>(types: &[EventType], callback: F) -> Self
    where
        F: Fn(&DataEvent) + Send + Sync + 'static,
    {
        let types = types
            .iter()
            .copied()
            .filter(|t| *t != EventType::Value)
            .collect();
        Self::from_arc(EventFilter::Children(types), Arc::new(callback))
    }

    /// Registration sharing an existing callback.
    ///
    /// Registrations built from the same `Arc` and context are treated as
    /// the same listener.
    pub fn from_arc(filter: EventFilter, callback: DataCallback) -> Self {
        Self {
            filter,
            callback,
            cancel: None,
            context: None,
        }
    }

    /// Adds a cancel callback.
    pub fn with_cancel<F>(mut self, cancel: F) -> Self
    where
        F: Fn(&DatabaseError) + Send + Sync + 'static,
    {
        self.cancel = Some(Arc::new(cancel));
        self
    }

    /// Adds a context used for identity.
    pub fn with_context(mut self, context: u64) -> Self {
        self.context = Some(context);
        self
    }

    /// The event filter.
    pub fn filter(&self) -> &EventFilter {
        &self.filter
    }

    /// Returns true if the registration wants `event_type`.
    pub fn responds_to(&self, event_type: EventType) -> bool {
        match &self.filter {
            EventFilter::Value => event_type == EventType::Value,
            EventFilter::Children(types) => types.contains(&event_type),
        }
    }

    /// Returns true if a cancel callback is present.
    pub fn has_cancel(&self) -> bool {
        self.cancel.is_some()
    }

    /// Returns true if both name the same listener.
    pub fn matches(&self, other: &EventRegistration) -> bool {
        Arc::ptr_eq(&self.callback, &other.callback) && self.context == other.context
    }

    fn fire_data(&self, event: &DataEvent) {
        (self.callback)(event);
    }

    fn fire_cancel(&self, error: &DatabaseError) {
        if let Some(cancel) = &self.cancel {
            cancel(error);
        }
    }
}

impl fmt::Debug for EventRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRegistration")
            .field("filter", &self.filter)
            .field("has_cancel", &self.cancel.is_some())
            .field("context", &self.context)
            .finish()
    }
}

/// Payload of a queued event.
#[derive(Debug, Clone)]
pub enum EventKind {
    /// A data change.
    Data(DataEvent),
    /// The listen was cancelled.
    Cancel(DatabaseError),
}

/// An event bound to the registration that receives it.
#[derive(Debug, Clone)]
pub struct Event {
    /// Path used to group events for flushing.
    pub path: Path,
    /// Receiver.
    pub registration: EventRegistration,
    /// Payload.
    pub kind: EventKind,
}

impl Event {
    /// Delivers the event.
    pub fn fire(&self) {
        match &self.kind {
            EventKind::Data(data) => self.registration.fire_data(data),
            EventKind::Cancel(error) => self.registration.fire_cancel(error),
        }
    }

    /// The data event, if this is one.
    pub fn data(&self) -> Option<&DataEvent> {
        match &self.kind {
            EventKind::Data(data) => Some(data),
            EventKind::Cancel(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn registration_identity() {
        let cb: DataCallback = Arc::new(|_| {});
        let a = EventRegistration::from_arc(EventFilter::Value, cb.clone());
        let b = EventRegistration::from_arc(EventFilter::Value, cb.clone());
        let c = EventRegistration::from_arc(EventFilter::Value, cb).with_context(1);
        let d = EventRegistration::value(|_| {});
        assert!(a.matches(&b));
        assert!(!a.matches(&c));
        assert!(!a.matches(&d));
    }

    #[test]
    fn responds_to_filter() {
        let reg = EventRegistration::children(&[EventType::ChildAdded, EventType::Value], |_| {});
        assert!(reg.responds_to(EventType::ChildAdded));
        assert!(!reg.responds_to(EventType::Value));
        assert!(EventRegistration::value(|_| {}).responds_to(EventType::Value));
    }

    #[test]
    fn snapshot_accessors() {
        let node = Node::from_json(&json!({"b": 2, "a": {".value": 1, ".priority": 5}}));
        let snap = DataSnapshot::new(node, Path::parse("root"), Index::Priority);
        assert_eq!(snap.key(), Some("root"));
        assert!(snap.has_child("a"));
        assert_eq!(snap.child("a").priority(), json!(5));
        let order: Vec<_> = snap.children().iter().map(|c| c.key().unwrap().to_string()).collect();
        assert_eq!(order, vec!["b", "a"]);
        assert_eq!(snap.export_val(), json!({"b": 2, "a": {".value": 1, ".priority": 5}}));
    }
}
