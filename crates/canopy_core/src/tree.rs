//! Arena-backed path tree.
//!
//! Nodes live in a slot vector and refer to each other by index, so there
//! are no parent back-references to keep alive. A node exists while it
//! holds a value or has children; [`Tree::prune`] and [`Tree::compact`]
//! remove nodes that became empty.
//!
//! Node ids are only stable until the next prune or compaction.

use canopy_value::{ChildKey, Path};
use std::collections::BTreeMap;

/// Index of a node in a [`Tree`].
pub type NodeId = usize;

const ROOT: NodeId = 0;

#[derive(Debug, Clone)]
struct Slot<T> {
    name: String,
    parent: Option<NodeId>,
    children: BTreeMap<ChildKey, NodeId>,
    value: Option<T>,
}

impl<T> Slot<T> {
    fn new(name: String, parent: Option<NodeId>) -> Self {
        Self {
            name,
            parent,
            children: BTreeMap::new(),
            value: None,
        }
    }
}

/// A tree of optional values addressed by [`Path`].
#[derive(Debug, Clone)]
pub struct Tree<T> {
    slots: Vec<Option<Slot<T>>>,
    free: Vec<NodeId>,
}

impl<T> Default for Tree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Tree<T> {
    /// Creates a tree with an empty root.
    pub fn new() -> Self {
        Self {
            slots: vec![Some(Slot::new(String::new(), None))],
            free: Vec::new(),
        }
    }

    /// The root node.
    pub fn root(&self) -> NodeId {
        ROOT
    }

    fn slot(&self, id: NodeId) -> Option<&Slot<T>> {
        self.slots.get(id).and_then(Option::as_ref)
    }

    fn slot_mut(&mut self, id: NodeId) -> Option<&mut Slot<T>> {
        self.slots.get_mut(id).and_then(Option::as_mut)
    }

    fn alloc(&mut self, name: String, parent: NodeId) -> NodeId {
        let slot = Slot::new(name, Some(parent));
        match self.free.pop() {
            Some(id) => {
                self.slots[id] = Some(slot);
                id
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        }
    }

    /// The child of `id` named `name`.
    pub fn child(&self, id: NodeId, name: &str) -> Option<NodeId> {
        self.slot(id).and_then(|s| s.children.get(&ChildKey::from(name)).copied())
    }

    /// Finds the node at `path` without creating it.
    pub fn find(&self, path: &Path) -> Option<NodeId> {
        let mut id = ROOT;
        for seg in path.segments() {
            id = self.child(id, seg)?;
        }
        Some(id)
    }

    /// Returns the node at `path`, creating missing nodes.
    pub fn subtree(&mut self, path: &Path) -> NodeId {
        let mut id = ROOT;
        for seg in path.segments() {
            id = match self.child(id, seg) {
                Some(child) => child,
                None => {
                    let child = self.alloc(seg.clone(), id);
                    if let Some(slot) = self.slot_mut(id) {
                        slot.children.insert(ChildKey::new(seg.as_str()), child);
                    }
                    child
                }
            };
        }
        id
    }

    /// The value stored at `id`.
    pub fn value(&self, id: NodeId) -> Option<&T> {
        self.slot(id).and_then(|s| s.value.as_ref())
    }

    /// Mutable access to the value stored at `id`.
    pub fn value_mut(&mut self, id: NodeId) -> Option<&mut T> {
        self.slot_mut(id).and_then(|s| s.value.as_mut())
    }

    /// Replaces the value at `id`, returning the previous one.
    pub fn set_value(&mut self, id: NodeId, value: Option<T>) -> Option<T> {
        match self.slot_mut(id) {
            Some(slot) => std::mem::replace(&mut slot.value, value),
            None => None,
        }
    }

    /// The value stored at `path`.
    pub fn get(&self, path: &Path) -> Option<&T> {
        self.find(path).and_then(|id| self.value(id))
    }

    /// Mutable access to the value stored at `path`.
    pub fn get_mut(&mut self, path: &Path) -> Option<&mut T> {
        let id = self.find(path)?;
        self.value_mut(id)
    }

    /// The key of `id` within its parent. Empty for the root.
    pub fn name(&self, id: NodeId) -> &str {
        self.slot(id).map_or("", |s| s.name.as_str())
    }

    /// The parent of `id`.
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.slot(id).and_then(|s| s.parent)
    }

    /// Absolute path of `id`.
    pub fn path(&self, id: NodeId) -> Path {
        let mut segments = Vec::new();
        let mut current = Some(id);
        while let Some(node) = current {
            if node != ROOT {
                segments.push(self.name(node).to_string());
            }
            current = self.parent(node);
        }
        segments.reverse();
        Path::from_segments(segments)
    }

    /// Children of `id` in key order.
    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        self.slot(id)
            .map(|s| s.children.values().copied().collect())
            .unwrap_or_default()
    }

    /// Returns true if `id` has children.
    pub fn has_children(&self, id: NodeId) -> bool {
        self.slot(id).is_some_and(|s| !s.children.is_empty())
    }

    /// Ancestors of `id`, nearest first, root last.
    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut current = self.parent(id);
        while let Some(node) = current {
            out.push(node);
            current = self.parent(node);
        }
        out
    }

    /// Descendants of `id` in pre-order, excluding `id`.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.children(id).into_iter().rev().collect();
        while let Some(node) = stack.pop() {
            out.push(node);
            stack.extend(self.children(node).into_iter().rev());
        }
        out
    }

    /// The subtree at `id` in post-order: children before parents, `id` last.
    pub fn post_order(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.post_order_into(id, &mut out);
        out
    }

    fn post_order_into(&self, id: NodeId, out: &mut Vec<NodeId>) {
        for child in self.children(id) {
            self.post_order_into(child, out);
        }
        out.push(id);
    }

    /// Nodes along `path` that exist, root first, paired with their paths.
    pub fn nodes_on_path(&self, path: &Path) -> Vec<(Path, NodeId)> {
        let mut out = vec![(Path::root(), ROOT)];
        let mut id = ROOT;
        let mut current = Path::root();
        for seg in path.segments() {
            match self.child(id, seg) {
                Some(child) => {
                    id = child;
                    current = current.child(seg);
                    out.push((current.clone(), id));
                }
                None => break,
            }
        }
        out
    }

    /// Values stored along `path`, root first.
    pub fn values_on_path(&self, path: &Path) -> Vec<(Path, &T)> {
        self.nodes_on_path(path)
            .into_iter()
            .filter_map(|(p, id)| self.value(id).map(|v| (p, v)))
            .collect()
    }

    /// Returns true if the subtree at `id` holds no values.
    pub fn is_subtree_empty(&self, id: NodeId) -> bool {
        self.value(id).is_none() && self.descendants(id).iter().all(|&d| self.value(d).is_none())
    }

    /// Removes every value and child below `id` and clears its value.
    pub fn clear_subtree(&mut self, id: NodeId) {
        for node in self.descendants(id) {
            self.slots[node] = None;
            self.free.push(node);
        }
        if let Some(slot) = self.slot_mut(id) {
            slot.children.clear();
            slot.value = None;
        }
    }

    /// Removes `id` and its empty ancestors if they hold nothing.
    pub fn prune(&mut self, id: NodeId) {
        let mut current = id;
        while current != ROOT {
            let Some(slot) = self.slot(current) else {
                return;
            };
            if slot.value.is_some() || !slot.children.is_empty() {
                return;
            }
            let parent = slot.parent;
            let name = slot.name.clone();
            self.slots[current] = None;
            self.free.push(current);
            match parent {
                Some(p) => {
                    if let Some(parent_slot) = self.slot_mut(p) {
                        parent_slot.children.remove(&ChildKey::new(name));
                    }
                    current = p;
                }
                None => return,
            }
        }
    }

    /// Removes every node that holds no value and has no children.
    pub fn compact(&mut self) {
        let mut order = self.descendants(ROOT);
        order.reverse();
        for id in order {
            if self.slot(id).is_some() {
                self.prune(id);
            }
        }
    }

    /// Number of live nodes, root included.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Returns true if only the root exists and it holds nothing.
    pub fn is_empty(&self) -> bool {
        self.len() == 1 && self.value(ROOT).is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subtree_creates_and_find_locates() {
        let mut tree: Tree<u32> = Tree::new();
        let id = tree.subtree(&Path::parse("a/b"));
        tree.set_value(id, Some(7));
        assert_eq!(tree.get(&Path::parse("a/b")), Some(&7));
        assert_eq!(tree.find(&Path::parse("a/c")), None);
        assert_eq!(tree.path(id), Path::parse("a/b"));
        assert_eq!(tree.name(id), "b");
    }

    #[test]
    fn ancestors_and_descendants() {
        let mut tree: Tree<u32> = Tree::new();
        let b = tree.subtree(&Path::parse("a/b"));
        let c = tree.subtree(&Path::parse("a/c/d"));
        let a = tree.find(&Path::parse("a")).unwrap();
        assert_eq!(tree.ancestors(b), vec![a, tree.root()]);
        let desc: Vec<Path> = tree.descendants(a).into_iter().map(|id| tree.path(id)).collect();
        assert_eq!(
            desc,
            vec![Path::parse("a/b"), Path::parse("a/c"), Path::parse("a/c/d")]
        );
        assert_eq!(tree.path(c), Path::parse("a/c/d"));
    }

    #[test]
    fn post_order_visits_children_first() {
        let mut tree: Tree<()> = Tree::new();
        tree.subtree(&Path::parse("a/x"));
        tree.subtree(&Path::parse("b"));
        let order: Vec<String> = tree
            .post_order(tree.root())
            .into_iter()
            .map(|id| tree.path(id).to_string())
            .collect();
        assert_eq!(order, vec!["/a/x", "/a", "/b", "/"]);
    }

    #[test]
    fn children_follow_key_order() {
        let mut tree: Tree<()> = Tree::new();
        for key in ["b", "10", "2", "a"] {
            tree.subtree(&Path::parse(key));
        }
        let names: Vec<&str> = tree
            .children(tree.root())
            .into_iter()
            .map(|id| tree.name(id))
            .collect();
        assert_eq!(names, vec!["2", "10", "a", "b"]);
    }

    #[test]
    fn prune_removes_empty_chain() {
        let mut tree: Tree<u32> = Tree::new();
        let keep = tree.subtree(&Path::parse("a"));
        tree.set_value(keep, Some(1));
        let leaf = tree.subtree(&Path::parse("a/b/c"));
        tree.prune(leaf);
        assert_eq!(tree.find(&Path::parse("a/b")), None);
        assert_eq!(tree.get(&Path::parse("a")), Some(&1));
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn compact_reuses_slots() {
        let mut tree: Tree<u32> = Tree::new();
        tree.subtree(&Path::parse("x/y"));
        tree.subtree(&Path::parse("z"));
        tree.compact();
        assert!(tree.is_empty());
        let id = tree.subtree(&Path::parse("q"));
        assert!(id < 4);
    }

    #[test]
    fn values_on_path_root_first() {
        let mut tree: Tree<&str> = Tree::new();
        let root = tree.root();
        tree.set_value(root, Some("root"));
        let b = tree.subtree(&Path::parse("a/b"));
        tree.set_value(b, Some("b"));
        let found: Vec<_> = tree
            .values_on_path(&Path::parse("a/b/c"))
            .into_iter()
            .map(|(p, v)| (p.to_string(), *v))
            .collect();
        assert_eq!(found, vec![("/".to_string(), "root"), ("/a/b".to_string(), "b")]);
    }

    #[test]
    fn clear_subtree_frees_descendants() {
        let mut tree: Tree<u32> = Tree::new();
        let a = tree.subtree(&Path::parse("a"));
        let ab = tree.subtree(&Path::parse("a/b"));
        tree.set_value(ab, Some(3));
        tree.clear_subtree(a);
        assert!(!tree.has_children(a));
        assert!(tree.is_subtree_empty(tree.root()));
    }
}
