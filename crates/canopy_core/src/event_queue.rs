//! Deferred delivery of events.
//!
//! Events raised during one operation are queued in groups of consecutive
//! events sharing a path. A raise call moves the groups whose path matches
//! into the ready list, preserving queue order; the owner drains the ready
//! list once the operation's state changes are complete.

use crate::event::Event;
use canopy_value::Path;

#[derive(Debug)]
struct EventList {
    path: Path,
    events: Vec<Event>,
}

/// Queue of events awaiting delivery.
#[derive(Debug, Default)]
pub struct EventQueue {
    lists: Vec<EventList>,
    ready: Vec<Event>,
}

impl EventQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues events without making them ready.
    pub fn queue_events(&mut self, events: Vec<Event>) {
        for event in events {
            match self.lists.last_mut() {
                Some(list) if list.path == event.path => list.events.push(event),
                _ => self.lists.push(EventList {
                    path: event.path.clone(),
                    events: vec![event],
                }),
            }
        }
    }

    /// Queues events and readies every group at exactly `path`.
    pub fn raise_events_at_path(&mut self, path: &Path, events: Vec<Event>) {
        self.queue_events(events);
        self.raise_matching(|event_path| event_path == path);
    }

    /// Queues events and readies every group at, above or below
    /// `changed_path`.
    pub fn raise_events_for_changed_path(&mut self, changed_path: &Path, events: Vec<Event>) {
        self.queue_events(events);
        self.raise_matching(|event_path| {
            event_path.contains(changed_path) || changed_path.contains(event_path)
        });
    }

    fn raise_matching(&mut self, predicate: impl Fn(&Path) -> bool) {
        let mut remaining = Vec::with_capacity(self.lists.len());
        for list in self.lists.drain(..) {
            if predicate(&list.path) {
                self.ready.extend(list.events);
            } else {
                remaining.push(list);
            }
        }
        self.lists = remaining;
    }

    /// Takes the events ready for delivery, in order.
    pub fn drain_ready(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.ready)
    }

    /// Number of queued events not yet ready.
    pub fn pending_len(&self) -> usize {
        self.lists.iter().map(|l| l.events.len()).sum()
    }
}
