//! Property tests for the write overlay.

use canopy_core::{EventRegistration, QuerySpec, SyncTree, WriteId};
use canopy_testkit::prelude::*;
use canopy_value::{Node, Path};
use proptest::prelude::*;
use std::collections::BTreeMap;

/// Reference model: the server base plus the pending writes, applied in
/// order over the whole tree.
#[derive(Default)]
struct Model {
    base: Node,
    writes: Vec<(WriteId, Path, Vec<(Path, Node)>)>,
}

impl Model {
    fn visible(&self) -> Node {
        self.writes
            .iter()
            .fold(self.base.clone(), |acc, (_, path, entries)| {
                entries
                    .iter()
                    .fold(acc, |acc, (rel, node)| acc.update_child(&path.join(rel), node.clone()))
            })
    }
}

/// A sync tree with a complete default view at the root.
fn complete_tree() -> SyncTree {
    let mut tree = SyncTree::new();
    tree.add_event_registration(
        &QuerySpec::default_at(Path::root()),
        EventRegistration::value(|_| {}),
    );
    tree.apply_server_overwrite(Path::root(), Node::empty());
    tree.drain_listen_requests();
    tree
}

fn run(tree: &mut SyncTree, model: &mut Model, next_id: &mut WriteId, op: OverlayOp) {
    match op {
        OverlayOp::ServerOverwrite(path, node) => {
            model.base = model.base.update_child(&path, node.clone());
            tree.apply_server_overwrite(path, node);
        }
        OverlayOp::UserOverwrite(path, node) => {
            *next_id += 1;
            model
                .writes
                .push((*next_id, path.clone(), vec![(Path::root(), node.clone())]));
            tree.apply_user_overwrite(path, node, *next_id, true);
        }
        OverlayOp::UserMerge(path, children) => {
            *next_id += 1;
            model.writes.push((*next_id, path.clone(), children.clone()));
            let children: BTreeMap<Path, Node> = children.into_iter().collect();
            tree.apply_user_merge(path, children, *next_id);
        }
        OverlayOp::Revert(index) => {
            if model.writes.is_empty() {
                return;
            }
            let (write_id, _, _) = model.writes.remove(index % model.writes.len());
            tree.ack_user_write(write_id, true);
        }
    }
}

fn sample_paths() -> Vec<Path> {
    let mut paths = vec![Path::root()];
    for a in ["a", "b", "1"] {
        paths.push(Path::parse(a));
        for b in ["a", "c", "10"] {
            paths.push(Path::parse(a).child(b));
        }
    }
    paths
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn overlay_matches_sequential_application(ops in overlay_ops_strategy(12)) {
        let mut tree = complete_tree();
        let mut model = Model::default();
        let mut next_id = 0;
        for op in ops {
            run(&mut tree, &mut model, &mut next_id, op);
            let expected = model.visible();
            for path in sample_paths() {
                let actual = tree.calc_complete_event_cache(&path, &[]);
                prop_assert_eq!(actual, expected.get_child(&path), "at {}", path);
            }
        }
    }

    #[test]
    fn revert_restores_previous_state(
        setup in overlay_ops_strategy(8),
        path in path_strategy(),
        node in node_strategy(),
    ) {
        let mut tree = complete_tree();
        let mut model = Model::default();
        let mut next_id = 0;
        for op in setup {
            run(&mut tree, &mut model, &mut next_id, op);
        }
        let root = QuerySpec::default_at(Path::root());
        let before = tree.cached_value(&root);

        next_id += 1;
        tree.apply_user_overwrite(path, node, next_id, true);
        tree.ack_user_write(next_id, true);

        prop_assert_eq!(tree.cached_value(&root), before);
        prop_assert_eq!(tree.calc_complete_event_cache(&Path::root(), &[]), model.visible());
    }

    #[test]
    fn hidden_writes_only_affect_latest_state(
        path in path_strategy(),
        node in node_strategy(),
    ) {
        let mut tree = complete_tree();
        let events = tree.apply_user_overwrite(path.clone(), node.clone(), 1, false);
        prop_assert!(events.is_empty());
        prop_assert_eq!(tree.calc_complete_event_cache(&path, &[]), Node::empty());
        prop_assert_eq!(tree.calc_latest_state(&path, &[]), node);
        prop_assert_eq!(tree.calc_latest_state(&path, &[1]), Node::empty());
    }
}
