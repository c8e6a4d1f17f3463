//! The engine facade.
//!
//! A [`Repo`] owns one server sync tree, one `.info` sync tree, the
//! transaction queue and the on-disconnect bookkeeping, all behind a
//! single lock. Every public method mutates state under the lock and
//! collects what must happen next: events to fire, completions to resolve
//! and actions for the [`Transport`]. Once the lock is released, the events
//! fire first, then the completions resolve, then the actions go out in
//! the order they were produced.
//!
//! Listener callbacks and the transport run without the lock and may call
//! back into the repo. Transaction update functions run under the lock
//! and must not.

mod transaction;

pub use transaction::{TransactionOutcome, TransactionStatus};

use crate::config::RepoConfig;
use crate::error::{AbortReason, DatabaseError, DbResult};
use crate::event::{DataSnapshot, Event, EventRegistration};
use crate::event_queue::EventQueue;
use crate::on_disconnect::OnDisconnectTree;
use crate::query::QuerySpec;
use crate::stats::RepoStats;
use crate::sync_tree::{ListenRequest, SyncTree};
use crate::transport::{RequestId, ServerAction, Transport, STATUS_OK};
use crate::write_tree::WriteId;
use canopy_value::validation::{is_valid_key, validate_data, validate_priority, validate_update};
use canopy_value::{resolve_deferred, Node, Path, ValueError};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};
use transaction::TransactionQueue;

/// Receives the result of an asynchronous operation.
///
/// The engine never needs an async runtime: poll with `try_recv` or await
/// it from one.
pub type Completion<T> = oneshot::Receiver<DbResult<T>>;

type Responder<T> = oneshot::Sender<DbResult<T>>;

/// Reason passed to the transport by [`Repo::interrupt`] and [`Repo::resume`].
pub const INTERRUPT_REASON: &str = "repo_interrupt";

const CONNECTED_KEY: &str = "connected";
const SERVER_TIME_OFFSET_KEY: &str = "serverTimeOffset";
const INFO_KEY: &str = ".info";

/// On-disconnect work awaiting the authority's acknowledgement.
#[derive(Debug)]
enum OnDisconnectOp {
    Set { path: Path, node: Node },
    Merge { path: Path, children: Vec<(Path, Node)> },
    Cancel { path: Path },
}

enum PendingRequest {
    Listen {
        query: QuerySpec,
        tag: Option<u64>,
    },
    Write {
        path: Path,
        write_id: WriteId,
        responder: Responder<()>,
    },
    Transaction {
        path: Path,
        queue: Vec<u64>,
    },
    OnDisconnect {
        op: OnDisconnectOp,
        responder: Responder<()>,
    },
}

struct RepoState {
    log_prefix: String,
    max_retries: u32,
    server_sync: SyncTree,
    info_sync: SyncTree,
    info_data: Node,
    on_disconnect: OnDisconnectTree,
    event_queue: EventQueue,
    transactions: TransactionQueue,
    pending: HashMap<RequestId, PendingRequest>,
    last_write_id: WriteId,
    last_request: RequestId,
    stats: RepoStats,
    reported: RepoStats,
    outbox: VecDeque<ServerAction>,
    completions: Vec<Box<dyn FnOnce() + Send>>,
    dispatching: bool,
}

impl RepoState {
    fn new(config: &RepoConfig) -> Self {
        Self {
            log_prefix: config.log_prefix.clone().unwrap_or_else(|| config.url()),
            max_retries: config.max_transaction_retries,
            server_sync: SyncTree::new(),
            info_sync: SyncTree::new(),
            info_data: Node::empty(),
            on_disconnect: OnDisconnectTree::new(),
            event_queue: EventQueue::new(),
            transactions: TransactionQueue::default(),
            pending: HashMap::new(),
            last_write_id: 0,
            last_request: 0,
            stats: RepoStats::default(),
            reported: RepoStats::default(),
            outbox: VecDeque::new(),
            completions: Vec::new(),
            dispatching: false,
        }
    }

    fn next_write_id(&mut self) -> WriteId {
        self.last_write_id += 1;
        self.last_write_id
    }

    fn next_request(&mut self) -> RequestId {
        self.last_request += 1;
        self.last_request
    }

    fn resolve<T: Send + 'static>(&mut self, responder: Responder<T>, result: DbResult<T>) {
        self.completions.push(Box::new(move || {
            let _ = responder.send(result);
        }));
    }

    fn server_time_offset(&self) -> f64 {
        let path = Path::from_segments([INFO_KEY, SERVER_TIME_OFFSET_KEY]);
        match self.info_data.get_child(&path).val() {
            Value::Number(n) => n.as_f64().unwrap_or(0.0),
            _ => 0.0,
        }
    }

    /// Estimated authority clock in milliseconds.
    fn server_time(&self) -> f64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as f64)
            .unwrap_or(0.0);
        now + self.server_time_offset()
    }

    fn sync_tree_for(&mut self, path: &Path) -> &mut SyncTree {
        if path.is_info() {
            &mut self.info_sync
        } else {
            &mut self.server_sync
        }
    }

    fn update_info(&mut self, key: &str, value: &Value) {
        let path = Path::from_segments([INFO_KEY, key]);
        let node = Node::from_json(value);
        self.info_data = self.info_data.update_child(&path, node.clone());
        let events = self.info_sync.apply_server_overwrite(path.clone(), node);
        self.event_queue.raise_events_for_changed_path(&path, events);
    }

    /// Turns buffered listen decisions into transport actions. Listens on
    /// `.info` are answered from local data.
    fn process_listen_requests(&mut self) {
        for request in self.server_sync.drain_listen_requests() {
            match request {
                ListenRequest::Start {
                    query,
                    tag,
                    server_cache,
                } => {
                    let request = self.next_request();
                    self.stats.listens_started += 1;
                    self.pending.insert(
                        request,
                        PendingRequest::Listen {
                            query: query.clone(),
                            tag,
                        },
                    );
                    self.outbox.push_back(ServerAction::Listen {
                        query,
                        tag,
                        server_cache,
                        request,
                    });
                }
                ListenRequest::Stop { query, tag } => {
                    self.stats.listens_stopped += 1;
                    self.outbox.push_back(ServerAction::Unlisten { query, tag });
                }
            }
        }
        for request in self.info_sync.drain_listen_requests() {
            if let ListenRequest::Start { query, .. } = request {
                let node = self.info_data.get_child(&query.path);
                if !node.is_empty() {
                    let mut events = self
                        .info_sync
                        .apply_server_overwrite(query.path.clone(), node);
                    events.extend(self.info_sync.apply_listen_complete(query.path.clone()));
                    self.event_queue.raise_events_at_path(&query.path, events);
                }
            }
        }
    }

    fn complete_listen(&mut self, query: QuerySpec, tag: Option<u64>, status: &str) {
        let path = query.path.clone();
        let events = if status == STATUS_OK {
            match tag {
                Some(tag) => self.server_sync.apply_tagged_listen_complete(path.clone(), tag),
                None => self.server_sync.apply_listen_complete(path.clone()),
            }
        } else {
            warn!(prefix = %self.log_prefix, query = %query, status, "listen failed");
            let error = DatabaseError::listen_revoked(status, &path);
            self.server_sync
                .remove_event_registration(&query, None, Some(error))
        };
        self.event_queue.raise_events_at_path(&path, events);
    }

    fn complete_write(
        &mut self,
        path: Path,
        write_id: WriteId,
        responder: Responder<()>,
        status: &str,
        reason: Option<&str>,
    ) {
        let success = status == STATUS_OK;
        if !success {
            warn!(prefix = %self.log_prefix, %path, status, reason, "write failed");
        }
        let events = self.server_sync.ack_user_write(write_id, !success);
        let affected = if events.is_empty() {
            path
        } else {
            self.rerun_transactions(&path)
        };
        self.event_queue
            .raise_events_for_changed_path(&affected, events);
        let result = if success {
            Ok(())
        } else {
            Err(DatabaseError::server(status, reason))
        };
        self.resolve(responder, result);
    }

    fn complete_on_disconnect(
        &mut self,
        op: OnDisconnectOp,
        responder: Responder<()>,
        status: &str,
        reason: Option<&str>,
    ) {
        if status != STATUS_OK {
            warn!(prefix = %self.log_prefix, ?op, status, reason, "on-disconnect request failed");
            self.resolve(responder, Err(DatabaseError::server(status, reason)));
            return;
        }
        match op {
            OnDisconnectOp::Set { path, node } => self.on_disconnect.remember(&path, node),
            OnDisconnectOp::Merge { path, children } => {
                for (relative, node) in children {
                    self.on_disconnect.remember(&path.join(&relative), node);
                }
            }
            OnDisconnectOp::Cancel { path } => {
                self.on_disconnect.forget(&path);
            }
        }
        self.resolve(responder, Ok(()));
    }

    fn run_on_disconnect_events(&mut self) {
        let entries = self.on_disconnect.entries();
        if entries.is_empty() {
            return;
        }
        debug!(prefix = %self.log_prefix, count = entries.len(), "running on-disconnect writes");
        let server_time = self.server_time();
        let mut events = Vec::new();
        for (path, node) in entries {
            let existing = self.server_sync.calc_latest_state(&path, &[]);
            let resolved = resolve_deferred(&node, &existing, server_time);
            events.extend(self.server_sync.apply_server_overwrite(path.clone(), resolved));
            let affected = self.abort_transactions(&path, AbortReason::Disconnect);
            self.rerun_transactions(&affected);
        }
        self.on_disconnect.clear();
        self.event_queue
            .raise_events_for_changed_path(&Path::root(), events);
    }

    fn apply_data_update(&mut self, path: Path, data: &Value, is_merge: bool, tag: Option<u64>) {
        self.stats.data_updates += 1;
        let events = if is_merge {
            let Some(map) = data.as_object() else {
                warn!(prefix = %self.log_prefix, %path, "ignoring merge without an object payload");
                return;
            };
            let children: BTreeMap<Path, Node> = map
                .iter()
                .map(|(key, value)| (Path::parse(key), Node::from_json(value)))
                .collect();
            match tag {
                Some(tag) => self
                    .server_sync
                    .apply_tagged_query_merge(path.clone(), children, tag),
                None => self.server_sync.apply_server_merge(path.clone(), children),
            }
        } else {
            let node = Node::from_json(data);
            match tag {
                Some(tag) => self
                    .server_sync
                    .apply_tagged_query_overwrite(path.clone(), node, tag),
                None => self.server_sync.apply_server_overwrite(path.clone(), node),
            }
        };
        let affected = if events.is_empty() {
            path
        } else {
            self.rerun_transactions(&path)
        };
        self.event_queue
            .raise_events_for_changed_path(&affected, events);
    }
}

fn check_writable(path: &Path) -> DbResult<()> {
    if path.is_info() {
        return Err(DatabaseError::ReadOnlyPath(path.clone()));
    }
    if let Some(key) = path.segments().iter().find(|key| !is_valid_key(key)) {
        return Err(ValueError::invalid_key(key.as_str(), path).into());
    }
    Ok(())
}

fn fire_guarded(event: &Event) {
    if catch_unwind(AssertUnwindSafe(|| event.fire())).is_err() {
        error!(path = %event.path, "event callback panicked");
    }
}

fn dispatch_guarded(action: ServerAction, transport: &dyn Transport) {
    if catch_unwind(AssertUnwindSafe(|| action.dispatch(transport))).is_err() {
        error!("transport dispatch panicked");
    }
}

/// One engine instance bound to one database.
pub struct Repo {
    config: RepoConfig,
    transport: Arc<dyn Transport>,
    state: Mutex<RepoState>,
}

impl std::fmt::Debug for Repo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repo").field("config", &self.config).finish()
    }
}

impl Repo {
    /// Creates a repo talking to the authority through `transport`.
    pub fn new(config: RepoConfig, transport: Arc<dyn Transport>) -> Self {
        let mut state = RepoState::new(&config);
        state.update_info(CONNECTED_KEY, &Value::Bool(false));
        state.update_info(SERVER_TIME_OFFSET_KEY, &Value::from(0));
        debug!(prefix = %state.log_prefix, "repo created");
        Self {
            config,
            transport,
            state: Mutex::new(state),
        }
    }

    /// The configuration the repo was created with.
    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    /// Runs `f` under the lock, then fires events, resolves completions
    /// and dispatches transport actions outside it.
    fn with_state<R>(&self, f: impl FnOnce(&mut RepoState) -> R) -> R {
        let (result, events, completions, mut actions) = {
            let mut state = self.state.lock();
            let result = f(&mut state);
            state.process_listen_requests();
            let events = state.event_queue.drain_ready();
            let completions = std::mem::take(&mut state.completions);
            let actions = if state.dispatching {
                VecDeque::new()
            } else {
                state.dispatching = !state.outbox.is_empty();
                std::mem::take(&mut state.outbox)
            };
            (result, events, completions, actions)
        };
        for event in &events {
            fire_guarded(event);
        }
        for completion in completions {
            completion();
        }
        // Actions queued by re-entrant calls join the same FIFO so the
        // transport sees them in production order.
        while !actions.is_empty() {
            for action in actions.drain(..) {
                dispatch_guarded(action, self.transport.as_ref());
            }
            let mut state = self.state.lock();
            actions = std::mem::take(&mut state.outbox);
            if actions.is_empty() {
                state.dispatching = false;
            }
        }
        result
    }

    /// Current engine counters.
    pub fn stats(&self) -> RepoStats {
        self.state.lock().stats.clone()
    }

    /// Number of transactions that have not finished.
    pub fn pending_transactions(&self) -> usize {
        self.state.lock().transactions.len()
    }

    /// Number of local writes awaiting acknowledgement.
    pub fn pending_writes(&self) -> usize {
        self.state.lock().server_sync.writes().len()
    }

    /// Estimated authority clock in milliseconds since the epoch.
    pub fn server_time(&self) -> f64 {
        self.state.lock().server_time()
    }

    /// Replaces the value at `path`.
    pub fn set(&self, path: &Path, value: &Value) -> DbResult<Completion<()>> {
        self.set_with_priority(path, value, &Value::Null)
    }

    /// Replaces the value and priority at `path`.
    ///
    /// The write is visible to listeners before this returns. The completion
    /// resolves when the authority accepts or rejects it; a rejected write
    /// is rolled back.
    pub fn set_with_priority(
        &self,
        path: &Path,
        value: &Value,
        priority: &Value,
    ) -> DbResult<Completion<()>> {
        check_writable(path)?;
        validate_data(value, path)?;
        validate_priority(priority, path)?;
        let (tx, rx) = oneshot::channel();
        self.with_state(|state| {
            debug!(prefix = %state.log_prefix, %path, "set");
            let unresolved = Node::from_json_with_priority(value, priority);
            let existing = state.server_sync.calc_latest_state(path, &[]);
            let resolved = resolve_deferred(&unresolved, &existing, state.server_time());
            let write_id = state.next_write_id();
            let events = state
                .server_sync
                .apply_user_overwrite(path.clone(), resolved, write_id, true);
            state.event_queue.queue_events(events);

            let request = state.next_request();
            state.stats.writes_sent += 1;
            state.outbox.push_back(ServerAction::Put {
                path: path.clone(),
                data: unresolved.to_json(true),
                hash_of: None,
                request,
            });
            state.pending.insert(
                request,
                PendingRequest::Write {
                    path: path.clone(),
                    write_id,
                    responder: tx,
                },
            );

            let affected = state.abort_transactions(path, AbortReason::Set);
            state.rerun_transactions(&affected);
            state
                .event_queue
                .raise_events_for_changed_path(&affected, Vec::new());
        });
        Ok(rx)
    }

    /// Replaces the listed descendants of `path`.
    ///
    /// Keys of `values` are relative paths and must not overlap. An empty
    /// update completes immediately.
    pub fn update(&self, path: &Path, values: &Map<String, Value>) -> DbResult<Completion<()>> {
        check_writable(path)?;
        let entries = validate_update(values, path)?;
        let (tx, rx) = oneshot::channel();
        if entries.is_empty() {
            debug!(%path, "update called with empty data");
            let _ = tx.send(Ok(()));
            return Ok(rx);
        }
        self.with_state(|state| {
            debug!(prefix = %state.log_prefix, %path, "update");
            let server_time = state.server_time();
            let mut children = BTreeMap::new();
            for (relative, value) in &entries {
                let unresolved = Node::from_json(value);
                let existing = state.server_sync.calc_latest_state(&path.join(relative), &[]);
                children.insert(
                    relative.clone(),
                    resolve_deferred(&unresolved, &existing, server_time),
                );
            }
            let write_id = state.next_write_id();
            let events = state
                .server_sync
                .apply_user_merge(path.clone(), children, write_id);
            state.event_queue.queue_events(events);

            let request = state.next_request();
            state.stats.writes_sent += 1;
            state.outbox.push_back(ServerAction::Merge {
                path: path.clone(),
                data: Value::Object(values.clone()),
                request,
            });
            state.pending.insert(
                request,
                PendingRequest::Write {
                    path: path.clone(),
                    write_id,
                    responder: tx,
                },
            );

            for (relative, _) in &entries {
                let affected = state.abort_transactions(&path.join(relative), AbortReason::Update);
                state.rerun_transactions(&affected);
            }
            state
                .event_queue
                .raise_events_for_changed_path(path, Vec::new());
        });
        Ok(rx)
    }

    /// Starts an optimistic read-modify-write at `path`.
    ///
    /// `update` receives the current value and returns the new one, or
    /// `None` to abort. It may be called again with fresher data when the
    /// authority reports a conflict, up to the configured retry bound. It
    /// runs under the engine lock and must not call back into the repo.
    ///
    /// With `apply_locally` unset the intermediate values are hidden from
    /// listeners until the authority commits one.
    pub fn start_transaction<F>(
        &self,
        path: &Path,
        update: F,
        apply_locally: bool,
    ) -> DbResult<Completion<TransactionOutcome>>
    where
        F: FnMut(Value) -> Option<Value> + Send + 'static,
    {
        check_writable(path)?;
        let (tx, rx) = oneshot::channel();
        self.with_state(|state| {
            state.start_transaction(path.clone(), Box::new(update), apply_locally, tx)
        })?;
        Ok(rx)
    }

    /// Registers a listener for `query`.
    ///
    /// If the query's data is already known, the initial events fire
    /// before this returns.
    pub fn add_event_callback(&self, query: &QuerySpec, registration: EventRegistration) {
        self.with_state(|state| {
            let events = state
                .sync_tree_for(&query.path)
                .add_event_registration(query, registration);
            state.event_queue.raise_events_at_path(&query.path, events);
        });
    }

    /// Removes a listener, or every listener of `query` when
    /// `registration` is `None`. A default query matches every view at its
    /// path.
    pub fn remove_event_callback(&self, query: &QuerySpec, registration: Option<&EventRegistration>) {
        self.with_state(|state| {
            let events = state
                .sync_tree_for(&query.path)
                .remove_event_registration(query, registration, None);
            state.event_queue.raise_events_at_path(&query.path, events);
        });
    }

    /// The cached value of `query`, if the engine knows it completely.
    pub fn get_value(&self, query: &QuerySpec) -> Option<DataSnapshot> {
        let mut state = self.state.lock();
        let node = state.sync_tree_for(&query.path).cached_value(query)?;
        Some(DataSnapshot::new(
            node,
            query.path.clone(),
            query.params.index().clone(),
        ))
    }

    /// Asks the authority to write `value` at `path` when this client
    /// disconnects.
    pub fn on_disconnect_set(&self, path: &Path, value: &Value) -> DbResult<Completion<()>> {
        self.on_disconnect_set_with_priority(path, value, &Value::Null)
    }

    /// Like [`Repo::on_disconnect_set`] with a priority.
    pub fn on_disconnect_set_with_priority(
        &self,
        path: &Path,
        value: &Value,
        priority: &Value,
    ) -> DbResult<Completion<()>> {
        check_writable(path)?;
        validate_data(value, path)?;
        validate_priority(priority, path)?;
        let (tx, rx) = oneshot::channel();
        let node = Node::from_json_with_priority(value, priority);
        self.with_state(|state| {
            let request = state.next_request();
            state.outbox.push_back(ServerAction::OnDisconnectPut {
                path: path.clone(),
                data: node.to_json(true),
                request,
            });
            state.pending.insert(
                request,
                PendingRequest::OnDisconnect {
                    op: OnDisconnectOp::Set {
                        path: path.clone(),
                        node,
                    },
                    responder: tx,
                },
            );
        });
        Ok(rx)
    }

    /// Asks the authority to merge `values` into `path` when this client
    /// disconnects.
    pub fn on_disconnect_update(
        &self,
        path: &Path,
        values: &Map<String, Value>,
    ) -> DbResult<Completion<()>> {
        check_writable(path)?;
        let entries = validate_update(values, path)?;
        let (tx, rx) = oneshot::channel();
        if entries.is_empty() {
            debug!(%path, "on-disconnect update called with empty data");
            let _ = tx.send(Ok(()));
            return Ok(rx);
        }
        let children = entries
            .iter()
            .map(|(relative, value)| (relative.clone(), Node::from_json(value)))
            .collect();
        self.with_state(|state| {
            let request = state.next_request();
            state.outbox.push_back(ServerAction::OnDisconnectMerge {
                path: path.clone(),
                data: Value::Object(values.clone()),
                request,
            });
            state.pending.insert(
                request,
                PendingRequest::OnDisconnect {
                    op: OnDisconnectOp::Merge {
                        path: path.clone(),
                        children,
                    },
                    responder: tx,
                },
            );
        });
        Ok(rx)
    }

    /// Cancels the on-disconnect writes at and below `path`.
    pub fn on_disconnect_cancel(&self, path: &Path) -> DbResult<Completion<()>> {
        check_writable(path)?;
        let (tx, rx) = oneshot::channel();
        self.with_state(|state| {
            let request = state.next_request();
            state.outbox.push_back(ServerAction::OnDisconnectCancel {
                path: path.clone(),
                request,
            });
            state.pending.insert(
                request,
                PendingRequest::OnDisconnect {
                    op: OnDisconnectOp::Cancel { path: path.clone() },
                    responder: tx,
                },
            );
        });
        Ok(rx)
    }

    /// Suspends synchronization without discarding local state.
    pub fn interrupt(&self) {
        self.with_state(|state| {
            state
                .outbox
                .push_back(ServerAction::Interrupt(INTERRUPT_REASON.to_string()));
        });
    }

    /// Resumes synchronization.
    pub fn resume(&self) {
        self.with_state(|state| {
            state
                .outbox
                .push_back(ServerAction::Resume(INTERRUPT_REASON.to_string()));
        });
    }

    /// Replaces the credential used by the transport.
    pub fn refresh_auth_token(&self, token: Option<&str>) {
        self.with_state(|state| {
            state
                .outbox
                .push_back(ServerAction::RefreshAuthToken(token.map(str::to_string)));
        });
    }

    /// Sends the counters accumulated since the last report.
    pub fn report_stats(&self) {
        self.with_state(|state| {
            let delta = state.stats.delta_since(&state.reported);
            state.reported = state.stats.clone();
            state.outbox.push_back(ServerAction::ReportStats(delta));
        });
    }

    /// Reports the outcome of a request the transport was handed.
    ///
    /// `status` is `"ok"`, `"datastale"` for stale transaction bases, or an
    /// error code. Unknown request ids are ignored.
    pub fn on_request_complete(&self, request: RequestId, status: &str, reason: Option<&str>) {
        self.with_state(|state| match state.pending.remove(&request) {
            None => debug!(request, status, "completion for unknown request"),
            Some(PendingRequest::Listen { query, tag }) => state.complete_listen(query, tag, status),
            Some(PendingRequest::Write {
                path,
                write_id,
                responder,
            }) => state.complete_write(path, write_id, responder, status, reason),
            Some(PendingRequest::Transaction { path, queue }) => {
                state.complete_transaction_send(path, queue, status)
            }
            Some(PendingRequest::OnDisconnect { op, responder }) => {
                state.complete_on_disconnect(op, responder, status, reason)
            }
        });
    }

    /// Applies data pushed by the authority.
    ///
    /// A merge carries relative paths as keys. A tag routes the data to a
    /// single filtered view.
    pub fn on_data_update(&self, path: &Path, data: &Value, is_merge: bool, tag: Option<u64>) {
        self.with_state(|state| state.apply_data_update(path.clone(), data, is_merge, tag));
    }

    /// Records the connection state in `.info/connected`. Losing the
    /// connection applies the remembered on-disconnect writes.
    pub fn on_connect_status(&self, connected: bool) {
        self.with_state(|state| {
            debug!(prefix = %state.log_prefix, connected, "connection status");
            state.update_info(CONNECTED_KEY, &Value::Bool(connected));
            if !connected {
                state.run_on_disconnect_events();
            }
        });
    }

    /// Stores authority-provided entries under `.info`.
    pub fn on_server_info_update(&self, updates: &Map<String, Value>) {
        self.with_state(|state| {
            for (key, value) in updates {
                state.update_info(key, value);
            }
        });
    }
}
