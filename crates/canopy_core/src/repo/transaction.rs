//! Optimistic read-modify-write transactions.
//!
//! Transactions wait in a path-indexed queue tree. A queue node is sent
//! when every transaction at or below it is in [`TransactionStatus::Run`];
//! the whole aggregate goes out as one conditional put carrying the hash
//! of the state it was computed from. A stale answer reruns the update
//! functions against the newest local state, up to the configured retry
//! bound.

use super::{PendingRequest, RepoState, Responder};
use crate::error::{AbortReason, DatabaseError, DbResult};
use crate::event::{DataSnapshot, EventRegistration};
use crate::query::QuerySpec;
use crate::transport::{ServerAction, STATUS_DATASTALE, STATUS_OK};
use crate::tree::{NodeId, Tree};
use crate::write_tree::WriteId;
use canopy_value::validation::validate_data;
use canopy_value::{resolve_deferred, Index, Node, Path, PRIORITY_KEY};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, error, warn};

/// Lifecycle of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Applied locally and waiting to be sent.
    Run,
    /// Sent and awaiting the authority's answer.
    Sent,
    /// Finished; removed on the next prune.
    Completed,
    /// Sent, and a conflicting write arrived meanwhile.
    SentNeedsAbort,
    /// Aborted on the next rerun.
    NeedsAbort,
}

/// Result of a finished transaction.
#[derive(Debug, Clone)]
pub struct TransactionOutcome {
    /// Whether the output was committed by the authority.
    pub committed: bool,
    /// The committed value, or the last input when nothing was committed.
    pub snapshot: DataSnapshot,
}

pub(crate) type UpdateFn = Box<dyn FnMut(Value) -> Option<Value> + Send>;

pub(crate) struct Transaction {
    path: Path,
    update: UpdateFn,
    responder: Option<Responder<TransactionOutcome>>,
    status: TransactionStatus,
    apply_locally: bool,
    retry_count: u32,
    abort_reason: Option<AbortReason>,
    current_write_id: WriteId,
    input: Node,
    output_raw: Node,
    output_resolved: Node,
    watch: (QuerySpec, EventRegistration),
}

/// Transactions by creation order, indexed by path.
#[derive(Default)]
pub(crate) struct TransactionQueue {
    tree: Tree<Vec<u64>>,
    transactions: HashMap<u64, Transaction>,
    next_order: u64,
}

impl TransactionQueue {
    fn insert(&mut self, transaction: Transaction) {
        let order = self.next_order;
        self.next_order += 1;
        let id = self.tree.subtree(&transaction.path);
        match self.tree.value_mut(id) {
            Some(queue) => queue.push(order),
            None => {
                self.tree.set_value(id, Some(vec![order]));
            }
        }
        self.transactions.insert(order, transaction);
    }

    fn status(&self, order: u64) -> Option<TransactionStatus> {
        self.transactions.get(&order).map(|t| t.status)
    }

    fn take(&mut self, order: u64) -> Option<Transaction> {
        self.transactions.remove(&order)
    }

    fn restore(&mut self, order: u64, transaction: Transaction) {
        self.transactions.insert(order, transaction);
    }

    /// Transactions at and below `id`, oldest first.
    fn aggregate(&self, id: NodeId) -> Vec<u64> {
        let mut orders: Vec<u64> = std::iter::once(id)
            .chain(self.tree.descendants(id))
            .filter_map(|node| self.tree.value(node))
            .flatten()
            .copied()
            .collect();
        orders.sort_unstable();
        orders
    }

    /// The root-most queue node on `path`, or the node at `path` itself.
    fn root_most_queue(&self, path: &Path) -> (Path, Option<NodeId>) {
        if let Some((found, id)) = self
            .tree
            .nodes_on_path(path)
            .into_iter()
            .find(|&(_, id)| self.tree.value(id).is_some())
        {
            return (found, Some(id));
        }
        (path.clone(), self.tree.find(path))
    }

    fn prune_completed(&mut self) {
        let root = self.tree.root();
        for id in std::iter::once(root).chain(self.tree.descendants(root)) {
            let Some(queue) = self.tree.value(id) else {
                continue;
            };
            let (keep, done): (Vec<u64>, Vec<u64>) = queue.iter().copied().partition(|order| {
                self.transactions
                    .get(order)
                    .is_some_and(|t| t.status != TransactionStatus::Completed)
            });
            if done.is_empty() {
                continue;
            }
            for order in done {
                self.transactions.remove(&order);
            }
            self.tree
                .set_value(id, if keep.is_empty() { None } else { Some(keep) });
        }
        self.tree.compact();
    }

    /// Number of transactions not yet completed.
    pub(crate) fn len(&self) -> usize {
        self.transactions
            .values()
            .filter(|t| t.status != TransactionStatus::Completed)
            .count()
    }
}

enum UpdateResult {
    Value(Value),
    NoData,
    Panicked,
}

fn call_update(update: &mut UpdateFn, input: &Node) -> UpdateResult {
    let current = input.val();
    match catch_unwind(AssertUnwindSafe(|| update(current))) {
        Ok(Some(value)) => UpdateResult::Value(value),
        Ok(None) => UpdateResult::NoData,
        Err(_) => {
            error!("transaction update function panicked");
            UpdateResult::Panicked
        }
    }
}

/// Imports an update function's result, carrying over the current
/// priority unless the result names one.
fn output_node(value: &Value, current: &Node) -> Node {
    let explicit = value
        .as_object()
        .is_some_and(|map| map.contains_key(PRIORITY_KEY));
    let node = Node::from_json(value);
    if explicit {
        node
    } else {
        node.with_priority(current.priority().clone())
    }
}

fn snapshot(node: &Node, path: &Path) -> DataSnapshot {
    DataSnapshot::new(node.clone(), path.clone(), Index::default())
}

impl RepoState {
    pub(super) fn start_transaction(
        &mut self,
        path: Path,
        mut update: UpdateFn,
        apply_locally: bool,
        responder: Responder<TransactionOutcome>,
    ) -> DbResult<()> {
        debug!(prefix = %self.log_prefix, %path, "transaction");
        self.stats.transactions_started += 1;
        let query = QuerySpec::default_at(path.clone());
        let registration = EventRegistration::value(|_| {});
        let events = self
            .server_sync
            .add_event_registration(&query, registration.clone());
        self.event_queue.raise_events_at_path(&path, events);
        let watch = (query, registration);

        let input = self.server_sync.calc_latest_state(&path, &[]);
        let value = match call_update(&mut update, &input) {
            UpdateResult::Value(value) => value,
            UpdateResult::NoData => {
                self.unwatch(&watch);
                self.stats.transactions_aborted += 1;
                let outcome = TransactionOutcome {
                    committed: false,
                    snapshot: snapshot(&input, &path),
                };
                self.resolve(responder, Ok(outcome));
                return Ok(());
            }
            UpdateResult::Panicked => {
                self.unwatch(&watch);
                self.stats.transactions_aborted += 1;
                return Err(DatabaseError::TransactionAborted(AbortReason::InvalidData(
                    "update function panicked".into(),
                )));
            }
        };
        if let Err(err) = validate_data(&value, &path) {
            self.unwatch(&watch);
            self.stats.transactions_aborted += 1;
            return Err(err.into());
        }

        let output_raw = output_node(&value, &input);
        let output_resolved = resolve_deferred(&output_raw, &input, self.server_time());
        let write_id = self.next_write_id();
        let events = self.server_sync.apply_user_overwrite(
            path.clone(),
            output_resolved.clone(),
            write_id,
            apply_locally,
        );
        self.event_queue.raise_events_for_changed_path(&path, events);
        self.transactions.insert(Transaction {
            path,
            update,
            responder: Some(responder),
            status: TransactionStatus::Run,
            apply_locally,
            retry_count: 0,
            abort_reason: None,
            current_write_id: write_id,
            input,
            output_raw,
            output_resolved,
            watch,
        });
        self.send_ready_transactions();
        Ok(())
    }

    fn unwatch(&mut self, (query, registration): &(QuerySpec, EventRegistration)) {
        let events = self
            .server_sync
            .remove_event_registration(query, Some(registration), None);
        self.event_queue.raise_events_at_path(&query.path, events);
    }

    /// Prunes finished transactions and sends every queue that is ready.
    pub(super) fn send_ready_transactions(&mut self) {
        self.transactions.prune_completed();
        let root = self.transactions.tree.root();
        self.send_ready_below(root);
    }

    fn send_ready_below(&mut self, id: NodeId) {
        if self.transactions.tree.value(id).is_some() {
            let queue = self.transactions.aggregate(id);
            let all_run = queue
                .iter()
                .all(|&order| self.transactions.status(order) == Some(TransactionStatus::Run));
            if all_run {
                let path = self.transactions.tree.path(id);
                self.send_transaction_queue(path, queue);
            }
        } else {
            for child in self.transactions.tree.children(id) {
                self.send_ready_below(child);
            }
        }
    }

    fn send_transaction_queue(&mut self, path: Path, queue: Vec<u64>) {
        let excluded: Vec<WriteId> = queue
            .iter()
            .filter_map(|order| self.transactions.transactions.get(order))
            .map(|t| t.current_write_id)
            .collect();
        let latest = self.server_sync.calc_latest_state(&path, &excluded);
        let mut to_send = latest.clone();
        for order in &queue {
            let Some(transaction) = self.transactions.transactions.get_mut(order) else {
                continue;
            };
            debug_assert_eq!(transaction.status, TransactionStatus::Run);
            transaction.status = TransactionStatus::Sent;
            transaction.retry_count += 1;
            if let Some(relative) = Path::relative(&path, &transaction.path) {
                to_send = to_send.update_child(&relative, transaction.output_raw.clone());
            }
        }
        debug!(prefix = %self.log_prefix, %path, count = queue.len(), "sending transactions");
        let request = self.next_request();
        self.stats.writes_sent += 1;
        self.outbox.push_back(ServerAction::Put {
            path: path.clone(),
            data: to_send.to_json(true),
            hash_of: Some(latest),
            request,
        });
        self.pending
            .insert(request, PendingRequest::Transaction { path, queue });
    }

    /// Handles the authority's answer to a transaction put.
    pub(super) fn complete_transaction_send(&mut self, path: Path, queue: Vec<u64>, status: &str) {
        if status == STATUS_OK {
            let mut events = Vec::new();
            for order in queue {
                let Some(mut transaction) = self.transactions.take(order) else {
                    continue;
                };
                transaction.status = TransactionStatus::Completed;
                events.extend(
                    self.server_sync
                        .ack_user_write(transaction.current_write_id, false),
                );
                self.unwatch(&transaction.watch);
                self.stats.transactions_committed += 1;
                if let Some(responder) = transaction.responder.take() {
                    let outcome = TransactionOutcome {
                        committed: true,
                        snapshot: snapshot(&transaction.output_resolved, &transaction.path),
                    };
                    self.resolve(responder, Ok(outcome));
                }
                self.transactions.restore(order, transaction);
            }
            self.send_ready_transactions();
            self.event_queue.raise_events_for_changed_path(&path, events);
            return;
        }

        if status == STATUS_DATASTALE {
            for order in &queue {
                if let Some(transaction) = self.transactions.transactions.get_mut(order) {
                    transaction.status = match transaction.status {
                        TransactionStatus::SentNeedsAbort => TransactionStatus::NeedsAbort,
                        _ => TransactionStatus::Run,
                    };
                }
            }
        } else {
            warn!(prefix = %self.log_prefix, %path, status, "transaction failed");
            for order in &queue {
                if let Some(transaction) = self.transactions.transactions.get_mut(order) {
                    transaction.status = TransactionStatus::NeedsAbort;
                    transaction.abort_reason = Some(AbortReason::Server(status.to_string()));
                }
            }
        }
        self.rerun_transactions(&path);
    }

    /// Reruns the root-most transaction queue covering `changed` and
    /// returns its path, which is where events must be raised.
    pub(super) fn rerun_transactions(&mut self, changed: &Path) -> Path {
        let (path, node) = self.transactions.root_most_queue(changed);
        if let Some(node) = node {
            let queue = self.transactions.aggregate(node);
            self.rerun_transaction_queue(&path, queue);
        }
        path
    }

    fn rerun_transaction_queue(&mut self, path: &Path, queue: Vec<u64>) {
        if queue.is_empty() {
            return;
        }
        let mut excluded: Vec<WriteId> = queue
            .iter()
            .filter_map(|order| self.transactions.transactions.get(order))
            .map(|t| t.current_write_id)
            .collect();
        let server_time = self.server_time();

        for order in queue {
            let Some(mut transaction) = self.transactions.take(order) else {
                continue;
            };
            let mut events = Vec::new();
            let mut abort = None;
            match transaction.status {
                TransactionStatus::NeedsAbort => {
                    abort = Some(
                        transaction
                            .abort_reason
                            .take()
                            .unwrap_or(AbortReason::Set),
                    );
                    events.extend(
                        self.server_sync
                            .ack_user_write(transaction.current_write_id, true),
                    );
                }
                TransactionStatus::Run if transaction.retry_count >= self.max_retries => {
                    abort = Some(AbortReason::MaxRetry);
                    events.extend(
                        self.server_sync
                            .ack_user_write(transaction.current_write_id, true),
                    );
                }
                TransactionStatus::Run => {
                    let current = self
                        .server_sync
                        .calc_latest_state(&transaction.path, &excluded);
                    transaction.input = current.clone();
                    let outcome = match call_update(&mut transaction.update, &current) {
                        UpdateResult::Value(value) => match validate_data(&value, &transaction.path) {
                            Ok(()) => Ok(value),
                            Err(err) => Err(AbortReason::InvalidData(err.to_string())),
                        },
                        UpdateResult::NoData => Err(AbortReason::NoData),
                        UpdateResult::Panicked => {
                            Err(AbortReason::InvalidData("update function panicked".into()))
                        }
                    };
                    match outcome {
                        Ok(value) => {
                            let raw = output_node(&value, &current);
                            let resolved = resolve_deferred(&raw, &current, server_time);
                            let old_write_id = transaction.current_write_id;
                            let new_write_id = self.next_write_id();
                            transaction.output_raw = raw;
                            transaction.output_resolved = resolved.clone();
                            transaction.current_write_id = new_write_id;
                            excluded.retain(|&id| id != old_write_id);
                            events.extend(self.server_sync.apply_user_overwrite(
                                transaction.path.clone(),
                                resolved,
                                new_write_id,
                                transaction.apply_locally,
                            ));
                            events.extend(self.server_sync.ack_user_write(old_write_id, true));
                        }
                        Err(reason) => {
                            abort = Some(reason);
                            events.extend(
                                self.server_sync
                                    .ack_user_write(transaction.current_write_id, true),
                            );
                        }
                    }
                }
                _ => {}
            }
            self.event_queue.raise_events_for_changed_path(path, events);

            if let Some(reason) = abort {
                transaction.status = TransactionStatus::Completed;
                self.unwatch(&transaction.watch);
                self.stats.transactions_aborted += 1;
                debug!(prefix = %self.log_prefix, path = %transaction.path, %reason, "transaction aborted");
                if let Some(responder) = transaction.responder.take() {
                    let result = if reason == AbortReason::NoData {
                        Ok(TransactionOutcome {
                            committed: false,
                            snapshot: snapshot(&transaction.input, &transaction.path),
                        })
                    } else {
                        Err(DatabaseError::TransactionAborted(reason))
                    };
                    self.resolve(responder, result);
                }
            }
            self.transactions.restore(order, transaction);
        }
        self.send_ready_transactions();
    }

    /// Aborts transactions overlapping `path` because of a direct write.
    ///
    /// Sent transactions are only marked; their abort happens once the
    /// authority answers. Returns the path where events must be raised.
    pub(super) fn abort_transactions(&mut self, path: &Path, reason: AbortReason) -> Path {
        let (affected, _) = self.transactions.root_most_queue(path);
        let tree = &self.transactions.tree;
        let nodes: Vec<NodeId> = match tree.find(path) {
            Some(id) => tree
                .ancestors(id)
                .into_iter()
                .chain(std::iter::once(id))
                .chain(tree.descendants(id))
                .collect(),
            None => tree
                .nodes_on_path(path)
                .into_iter()
                .rev()
                .map(|(_, id)| id)
                .collect(),
        };
        for id in nodes {
            self.abort_transactions_on_node(id, &reason);
        }
        self.transactions.tree.compact();
        affected
    }

    fn abort_transactions_on_node(&mut self, id: NodeId, reason: &AbortReason) {
        let Some(queue) = self.transactions.tree.value(id).cloned() else {
            return;
        };
        let node_path = self.transactions.tree.path(id);
        let mut keep = Vec::new();
        let mut events = Vec::new();
        for order in queue {
            let Some(mut transaction) = self.transactions.take(order) else {
                continue;
            };
            match transaction.status {
                TransactionStatus::Sent => {
                    transaction.status = TransactionStatus::SentNeedsAbort;
                    transaction.abort_reason = Some(reason.clone());
                }
                TransactionStatus::SentNeedsAbort => {}
                TransactionStatus::Completed => continue,
                TransactionStatus::Run | TransactionStatus::NeedsAbort => {
                    let reason = transaction
                        .abort_reason
                        .take()
                        .unwrap_or_else(|| reason.clone());
                    self.unwatch(&transaction.watch);
                    events.extend(
                        self.server_sync
                            .ack_user_write(transaction.current_write_id, true),
                    );
                    self.stats.transactions_aborted += 1;
                    if let Some(responder) = transaction.responder.take() {
                        self.resolve(responder, Err(DatabaseError::TransactionAborted(reason)));
                    }
                    continue;
                }
            }
            keep.push(order);
            self.transactions.restore(order, transaction);
        }
        self.transactions
            .tree
            .set_value(id, if keep.is_empty() { None } else { Some(keep) });
        self.event_queue.raise_events_for_changed_path(&node_path, events);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn output_keeps_current_priority() {
        let current = Node::from_json(&json!({".value": 1, ".priority": 5}));
        let out = output_node(&json!(2), &current);
        assert_eq!(out.to_json(true), json!({".value": 2, ".priority": 5}));

        let out = output_node(&json!({"a": 1, ".priority": "p"}), &current);
        assert_eq!(out.to_json(true), json!({"a": 1, ".priority": "p"}));
    }

    #[test]
    fn panicking_update_is_caught() {
        let mut update: UpdateFn = Box::new(|_| panic!("boom"));
        assert!(matches!(
            call_update(&mut update, &Node::empty()),
            UpdateResult::Panicked
        ));
        let mut update: UpdateFn = Box::new(|v| v.as_i64().map(|n| json!(n + 1)));
        match call_update(&mut update, &Node::from_json(&json!(1))) {
            UpdateResult::Value(v) => assert_eq!(v, json!(2)),
            _ => panic!("expected a value"),
        }
    }
}
