//! Operations routed through the sync tree.

use canopy_value::{Node, Path};
use std::collections::BTreeMap;

/// Who produced an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationSource {
    /// A local write.
    User,
    /// The remote authority. Tagged operations target one filtered view.
    Server {
        /// Whether the operation carries a query tag.
        tagged: bool,
    },
}

impl OperationSource {
    /// Untagged server source.
    pub const SERVER: OperationSource = OperationSource::Server { tagged: false };

    /// Returns true for server operations.
    pub fn is_server(&self) -> bool {
        matches!(self, OperationSource::Server { .. })
    }
}

/// A change applied to views.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Replace the value at `path`.
    Overwrite {
        /// Producer.
        source: OperationSource,
        /// Target location.
        path: Path,
        /// New value.
        snap: Node,
    },
    /// Replace several descendants of `path`.
    Merge {
        /// Producer.
        source: OperationSource,
        /// Target location.
        path: Path,
        /// Changed descendants, relative to `path`.
        children: BTreeMap<Path, Node>,
    },
    /// A local write at `path` was acknowledged or reverted.
    AckUserWrite {
        /// Location of the write.
        path: Path,
        /// Whether the write was rolled back.
        revert: bool,
    },
    /// The server finished sending initial data for a listen.
    ListenComplete {
        /// Producer.
        source: OperationSource,
        /// Location of the listen.
        path: Path,
    },
}

impl Operation {
    /// Target location of the operation.
    pub fn path(&self) -> &Path {
        match self {
            Operation::Overwrite { path, .. }
            | Operation::Merge { path, .. }
            | Operation::AckUserWrite { path, .. }
            | Operation::ListenComplete { path, .. } => path,
        }
    }

    /// Producer of the operation.
    pub fn source(&self) -> OperationSource {
        match self {
            Operation::Overwrite { source, .. }
            | Operation::Merge { source, .. }
            | Operation::ListenComplete { source, .. } => *source,
            Operation::AckUserWrite { .. } => OperationSource::User,
        }
    }

    fn with_path(&self, path: Path) -> Operation {
        match self {
            Operation::Overwrite { source, snap, .. } => Operation::Overwrite {
                source: *source,
                path,
                snap: snap.clone(),
            },
            Operation::Merge {
                source, children, ..
            } => Operation::Merge {
                source: *source,
                path,
                children: children.clone(),
            },
            Operation::AckUserWrite { revert, .. } => Operation::AckUserWrite {
                path,
                revert: *revert,
            },
            Operation::ListenComplete { source, .. } => {
                Operation::ListenComplete { source: *source, path }
            }
        }
    }

    /// The operation as seen by a sync point at `point`.
    ///
    /// Returns `None` when the operation does not reach the point.
    pub fn relative_to(&self, point: &Path) -> Option<Operation> {
        let path = self.path();
        if let Some(rel) = Path::relative(point, path) {
            return Some(self.with_path(rel));
        }
        let below = Path::relative(path, point)?;
        match self {
            Operation::Overwrite { source, snap, .. } => Some(Operation::Overwrite {
                source: *source,
                path: Path::root(),
                snap: snap.get_child(&below),
            }),
            Operation::Merge {
                source, children, ..
            } => {
                let mut covering: Option<Node> = None;
                let mut nested = BTreeMap::new();
                for (child_path, node) in children {
                    if let Some(rest) = Path::relative(child_path, &below) {
                        covering = Some(node.get_child(&rest));
                    } else if let Some(rest) = Path::relative(&below, child_path) {
                        nested.insert(rest, node.clone());
                    }
                }
                match covering {
                    Some(base) => {
                        let snap = nested
                            .into_iter()
                            .fold(base, |acc, (p, n)| acc.update_child(&p, n));
                        Some(Operation::Overwrite {
                            source: *source,
                            path: Path::root(),
                            snap,
                        })
                    }
                    None if nested.is_empty() => None,
                    None => Some(Operation::Merge {
                        source: *source,
                        path: Path::root(),
                        children: nested,
                    }),
                }
            }
            other => Some(other.with_path(Path::root())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn overwrite_above_point_slices_snapshot() {
        let op = Operation::Overwrite {
            source: OperationSource::SERVER,
            path: Path::parse("a"),
            snap: Node::from_json(&json!({"b": {"c": 1}})),
        };
        let Some(Operation::Overwrite { path, snap, .. }) = op.relative_to(&Path::parse("a/b")) else {
            panic!("expected overwrite");
        };
        assert!(path.is_empty());
        assert_eq!(snap.val(), json!({"c": 1}));
    }

    #[test]
    fn overwrite_below_point_keeps_relative_path() {
        let op = Operation::Overwrite {
            source: OperationSource::User,
            path: Path::parse("a/b/c"),
            snap: Node::empty(),
        };
        assert_eq!(op.relative_to(&Path::parse("a")).unwrap().path(), &Path::parse("b/c"));
        assert!(op.relative_to(&Path::parse("x")).is_none());
    }

    #[test]
    fn merge_sliced_for_descendant_point() {
        let mut children = BTreeMap::new();
        children.insert(Path::parse("x"), Node::from_json(&json!({"y": 1})));
        children.insert(Path::parse("z/w"), Node::from_json(&json!(2)));
        let op = Operation::Merge {
            source: OperationSource::SERVER,
            path: Path::root(),
            children,
        };
        match op.relative_to(&Path::parse("x/y")) {
            Some(Operation::Overwrite { snap, .. }) => assert_eq!(snap.val(), json!(1)),
            other => panic!("unexpected {other:?}"),
        }
        match op.relative_to(&Path::parse("z")) {
            Some(Operation::Merge { children, .. }) => {
                assert_eq!(children.keys().cloned().collect::<Vec<_>>(), vec![Path::parse("w")]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(op.relative_to(&Path::parse("q")).is_none());
    }
}
