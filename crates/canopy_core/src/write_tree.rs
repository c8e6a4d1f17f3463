//! The log of pending local writes and the overlay it produces.
//!
//! Records are kept in write-id order. The overlay at a path is the server
//! base with every qualifying record applied in that order, so the result
//! depends only on the current record set.

use canopy_value::{Node, Path};
use std::collections::BTreeMap;

/// Unique, strictly increasing identifier of a local write.
pub type WriteId = u64;

/// The change carried by a write.
#[derive(Debug, Clone, PartialEq)]
pub enum WritePayload {
    /// Replace the value at the write path.
    Overwrite(Node),
    /// Replace the listed descendants, relative to the write path.
    Merge(BTreeMap<Path, Node>),
}

/// A pending local mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    /// Identifier, also the commit order.
    pub write_id: WriteId,
    /// Location of the write.
    pub path: Path,
    /// The change.
    pub payload: WritePayload,
    /// Whether the write is reflected in listener caches.
    pub visible: bool,
}

impl WriteRecord {
    /// Absolute locations replaced by this write, with their values.
    fn entries(&self) -> Vec<(Path, &Node)> {
        match &self.payload {
            WritePayload::Overwrite(node) => vec![(self.path.clone(), node)],
            WritePayload::Merge(children) => children
                .iter()
                .map(|(rel, node)| (self.path.join(rel), node))
                .collect(),
        }
    }

    /// Returns true if the write replaces everything at `path`.
    pub fn shadows(&self, path: &Path) -> bool {
        self.entries().iter().any(|(p, _)| p.contains(path))
    }

    /// Returns true if the write touches `path`, above or below it.
    pub fn overlaps(&self, path: &Path) -> bool {
        self.entries()
            .iter()
            .any(|(p, _)| p.contains(path) || path.contains(p))
    }

    fn apply_to(&self, path: &Path, base: Node) -> Node {
        let mut result = base;
        for (write_path, node) in self.entries() {
            if let Some(rel) = Path::relative(&write_path, path) {
                result = node.get_child(&rel);
            } else if let Some(rel) = Path::relative(path, &write_path) {
                result = result.update_child(&rel, node.clone());
            }
        }
        result
    }
}

/// Ordered log of pending writes.
#[derive(Debug, Clone, Default)]
pub struct WriteTree {
    writes: Vec<WriteRecord>,
}

impl WriteTree {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pending writes.
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Pending writes in id order.
    pub fn writes(&self) -> &[WriteRecord] {
        &self.writes
    }

    fn push(&mut self, record: WriteRecord) {
        debug_assert!(
            self.writes
                .last()
                .map_or(true, |last| last.write_id < record.write_id),
            "write ids must be strictly increasing"
        );
        self.writes.push(record);
    }

    /// Records an overwrite.
    pub fn add_overwrite(&mut self, path: Path, node: Node, write_id: WriteId, visible: bool) {
        self.push(WriteRecord {
            write_id,
            path,
            payload: WritePayload::Overwrite(node),
            visible,
        });
    }

    /// Records a merge. Merges are always visible.
    pub fn add_merge(&mut self, path: Path, children: BTreeMap<Path, Node>, write_id: WriteId) {
        self.push(WriteRecord {
            write_id,
            path,
            payload: WritePayload::Merge(children),
            visible: true,
        });
    }

    /// Looks up a pending write.
    pub fn get(&self, write_id: WriteId) -> Option<&WriteRecord> {
        self.writes.iter().find(|w| w.write_id == write_id)
    }

    /// Removes a write.
    ///
    /// Returns the removed record and whether views must be re-evaluated:
    /// false when the write was hidden or a later visible write fully
    /// shadows it.
    pub fn remove(&mut self, write_id: WriteId) -> Option<(WriteRecord, bool)> {
        let idx = self.writes.iter().position(|w| w.write_id == write_id)?;
        let removed = self.writes.remove(idx);
        if !removed.visible {
            return Some((removed, false));
        }
        let shadowed = self.writes[idx..]
            .iter()
            .any(|later| later.visible && later.shadows(&removed.path));
        Some((removed, !shadowed))
    }

    fn qualifying<'a>(
        &'a self,
        exclude: &'a [WriteId],
        include_hidden: bool,
    ) -> impl Iterator<Item = &'a WriteRecord> + 'a {
        self.writes
            .iter()
            .filter(move |w| (w.visible || include_hidden) && !exclude.contains(&w.write_id))
    }

    /// Returns true if some qualifying write replaces everything at `path`.
    pub fn has_complete_shadow(&self, path: &Path, exclude: &[WriteId], include_hidden: bool) -> bool {
        self.qualifying(exclude, include_hidden)
            .any(|w| w.shadows(path))
    }

    /// Applies every qualifying write at or around `path` to `base`.
    ///
    /// `base` is the server value at `path`.
    pub fn apply_writes(
        &self,
        path: &Path,
        base: &Node,
        exclude: &[WriteId],
        include_hidden: bool,
    ) -> Node {
        self.qualifying(exclude, include_hidden)
            .filter(|w| w.overlaps(path))
            .fold(base.clone(), |acc, w| w.apply_to(path, acc))
    }

    /// The value a listener at `path` should observe.
    ///
    /// Returns `None` when there is no complete server value and no write
    /// fully shadows the location.
    pub fn calc_complete_event_cache(
        &self,
        path: &Path,
        server: Option<&Node>,
        exclude: &[WriteId],
        include_hidden: bool,
    ) -> Option<Node> {
        match server {
            Some(base) => Some(self.apply_writes(path, base, exclude, include_hidden)),
            None if self.has_complete_shadow(path, exclude, include_hidden) => {
                Some(self.apply_writes(path, &Node::empty(), exclude, include_hidden))
            }
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(v: serde_json::Value) -> Node {
        Node::from_json(&v)
    }

    #[test]
    fn overlay_applies_in_id_order() {
        let mut writes = WriteTree::new();
        let base = node(json!({"a": 1, "b": 2}));
        writes.add_overwrite(Path::parse("a"), node(json!(10)), 1, true);
        writes.add_overwrite(Path::root(), node(json!({"c": 3})), 2, true);
        writes.add_overwrite(Path::parse("c/d"), node(json!(4)), 3, true);
        let result = writes.apply_writes(&Path::root(), &base, &[], false);
        assert_eq!(result.val(), json!({"c": {"d": 4}}));
    }

    #[test]
    fn overlay_at_descendant_path() {
        let mut writes = WriteTree::new();
        writes.add_overwrite(Path::parse("a"), node(json!({"x": {"y": 1}})), 1, true);
        let result = writes.apply_writes(&Path::parse("a/x"), &Node::empty(), &[], false);
        assert_eq!(result.val(), json!({"y": 1}));
    }

    #[test]
    fn merges_touch_only_listed_children() {
        let mut writes = WriteTree::new();
        let mut children = BTreeMap::new();
        children.insert(Path::parse("b"), node(json!(20)));
        children.insert(Path::parse("c/d"), node(json!(30)));
        writes.add_merge(Path::root(), children, 1);
        let base = node(json!({"a": 1, "b": 2}));
        let result = writes.apply_writes(&Path::root(), &base, &[], false);
        assert_eq!(result.val(), json!({"a": 1, "b": 20, "c": {"d": 30}}));
        assert!(writes.has_complete_shadow(&Path::parse("b"), &[], false));
        assert!(!writes.has_complete_shadow(&Path::root(), &[], false));
    }

    #[test]
    fn exclusions_and_hidden_writes() {
        let mut writes = WriteTree::new();
        writes.add_overwrite(Path::parse("a"), node(json!(1)), 1, false);
        writes.add_overwrite(Path::parse("b"), node(json!(2)), 2, true);
        let base = Node::empty();
        assert_eq!(writes.apply_writes(&Path::root(), &base, &[], false).val(), json!({"b": 2}));
        assert_eq!(
            writes.apply_writes(&Path::root(), &base, &[], true).val(),
            json!({"a": 1, "b": 2})
        );
        assert_eq!(writes.apply_writes(&Path::root(), &base, &[2], true).val(), json!({"a": 1}));
    }

    #[test]
    fn complete_cache_needs_base_or_shadow() {
        let mut writes = WriteTree::new();
        assert!(writes.calc_complete_event_cache(&Path::parse("a"), None, &[], false).is_none());
        writes.add_overwrite(Path::root(), node(json!({"a": 5})), 1, true);
        let cache = writes.calc_complete_event_cache(&Path::parse("a"), None, &[], false);
        assert_eq!(cache.map(|n| n.val()), Some(json!(5)));
    }

    #[test]
    fn remove_reports_reevaluation() {
        let mut writes = WriteTree::new();
        writes.add_overwrite(Path::parse("a/b"), node(json!(1)), 1, true);
        writes.add_overwrite(Path::parse("a"), node(json!(2)), 2, true);
        writes.add_overwrite(Path::parse("z"), node(json!(3)), 3, false);

        let (_, reevaluate) = writes.remove(1).unwrap();
        assert!(!reevaluate, "shadowed by a later write");
        let (_, reevaluate) = writes.remove(3).unwrap();
        assert!(!reevaluate, "hidden writes never affect views");
        let (_, reevaluate) = writes.remove(2).unwrap();
        assert!(reevaluate);
        assert!(writes.remove(2).is_none());
        assert!(writes.is_empty());
    }
}
