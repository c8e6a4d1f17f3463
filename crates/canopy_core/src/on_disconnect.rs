//! Writes scheduled to run when the connection drops.
//!
//! The tree is sparse: a value stored at a path covers everything below
//! it, and remembering a write under a stored value edits that value in
//! place.

use crate::tree::Tree;
use canopy_value::{Node, Path};

/// Remembered on-disconnect writes keyed by path.
#[derive(Debug, Default)]
pub struct OnDisconnectTree {
    tree: Tree<Node>,
}

impl OnDisconnectTree {
    /// Creates an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if nothing is remembered.
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Remembers `node` to be written at `path`.
    pub fn remember(&mut self, path: &Path, node: Node) {
        let covering = self
            .tree
            .nodes_on_path(path)
            .into_iter()
            .find(|&(_, id)| self.tree.value(id).is_some());
        if let Some((ancestor, id)) = covering {
            if let (Some(relative), Some(existing)) =
                (Path::relative(&ancestor, path), self.tree.value(id))
            {
                let updated = existing.update_child(&relative, node);
                self.tree.set_value(id, Some(updated));
                return;
            }
        }
        let id = self.tree.subtree(path);
        self.tree.clear_subtree(id);
        self.tree.set_value(id, Some(node));
    }

    /// Forgets everything remembered at and below `path`.
    ///
    /// Returns false when `path` lies inside a remembered leaf, which
    /// cannot be partially forgotten.
    pub fn forget(&mut self, path: &Path) -> bool {
        let covering = self
            .tree
            .nodes_on_path(path)
            .into_iter()
            .find(|&(_, id)| self.tree.value(id).is_some());
        match covering {
            Some((ancestor, id)) if &ancestor != path => {
                let Some(existing) = self.tree.value(id).cloned() else {
                    return false;
                };
                if existing.is_leaf() {
                    return false;
                }
                let Some(relative) = Path::relative(&ancestor, path) else {
                    return false;
                };
                let updated = existing.update_child(&relative, Node::empty());
                if updated.is_empty() {
                    self.tree.set_value(id, None);
                    self.tree.prune(id);
                } else {
                    self.tree.set_value(id, Some(updated));
                }
                true
            }
            _ => {
                if let Some(id) = self.tree.find(path) {
                    self.tree.clear_subtree(id);
                    self.tree.prune(id);
                }
                true
            }
        }
    }

    /// Every remembered write, parents before children.
    pub fn entries(&self) -> Vec<(Path, Node)> {
        let root = self.tree.root();
        std::iter::once(root)
            .chain(self.tree.descendants(root))
            .filter_map(|id| {
                self.tree
                    .value(id)
                    .map(|node| (self.tree.path(id), node.clone()))
            })
            .collect()
    }

    /// Forgets everything.
    pub fn clear(&mut self) {
        self.tree = Tree::new();
    }
}
