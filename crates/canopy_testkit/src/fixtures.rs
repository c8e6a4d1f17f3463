//! Test fixtures: a scripted authority and event recorders.
//!
//! [`TestServer`] keeps the authoritative tree in memory and answers the
//! requests a [`Repo`] sends it. Requests queue up until the test calls
//! [`TestServer::deliver`], so a test controls exactly when answers
//! arrive.

use canopy_core::{
    DataEvent, EventRegistration, EventType, QuerySpec, Repo, RepoConfig, RepoStats, RequestId,
    Transport, TransportCall, STATUS_DATASTALE, STATUS_OK,
};
use canopy_value::{resolve_deferred, Node, Path};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Installs a test-friendly tracing subscriber once.
///
/// Honors `RUST_LOG`; later calls are no-ops.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn now_millis() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as f64)
        .unwrap_or(0.0)
}

enum Reply {
    Data {
        path: Path,
        data: Value,
        tag: Option<u64>,
    },
    Complete {
        request: RequestId,
        status: String,
    },
}

#[derive(Default)]
struct ServerState {
    data: Node,
    inbox: VecDeque<TransportCall>,
    log: Vec<TransportCall>,
    listens: Vec<(QuerySpec, Option<u64>)>,
    on_disconnect: Vec<(Path, Node)>,
    always_stale: bool,
    reject_writes: Option<String>,
}

impl ServerState {
    fn broadcast(&self, changed: &Path, replies: &mut Vec<Reply>) {
        for (query, tag) in &self.listens {
            if query.path.contains(changed) || changed.contains(&query.path) {
                replies.push(Reply::Data {
                    path: query.path.clone(),
                    data: self.data.get_child(&query.path).to_json(true),
                    tag: *tag,
                });
            }
        }
    }

    fn write(&mut self, path: &Path, node: &Node) {
        let existing = self.data.get_child(path);
        let resolved = resolve_deferred(node, &existing, now_millis());
        self.data = self.data.update_child(path, resolved);
    }

    fn handle(&mut self, call: TransportCall) -> Vec<Reply> {
        let mut replies = Vec::new();
        match call {
            TransportCall::Listen {
                query, tag, request, ..
            } => {
                replies.push(Reply::Data {
                    path: query.path.clone(),
                    data: self.data.get_child(&query.path).to_json(true),
                    tag,
                });
                replies.push(Reply::Complete {
                    request,
                    status: STATUS_OK.into(),
                });
                self.listens.push((query, tag));
            }
            TransportCall::Unlisten { query, tag } => {
                if let Some(pos) = self
                    .listens
                    .iter()
                    .position(|(q, t)| *q == query && *t == tag)
                {
                    self.listens.remove(pos);
                }
            }
            TransportCall::Put {
                path,
                data,
                hash,
                request,
            } => {
                let status = if let Some(status) = &self.reject_writes {
                    status.clone()
                } else if hash.is_some()
                    && (self.always_stale
                        || hash.as_deref() != Some(self.data.get_child(&path).hash().as_str()))
                {
                    STATUS_DATASTALE.into()
                } else {
                    self.write(&path, &Node::from_json(&data));
                    self.broadcast(&path, &mut replies);
                    STATUS_OK.into()
                };
                replies.push(Reply::Complete { request, status });
            }
            TransportCall::Merge {
                path,
                data,
                request,
            } => {
                let status = match &self.reject_writes {
                    Some(status) => status.clone(),
                    None => {
                        if let Some(map) = data.as_object() {
                            for (key, value) in map {
                                self.write(&path.join(&Path::parse(key)), &Node::from_json(value));
                            }
                        }
                        self.broadcast(&path, &mut replies);
                        STATUS_OK.into()
                    }
                };
                replies.push(Reply::Complete { request, status });
            }
            TransportCall::OnDisconnectPut {
                path,
                data,
                request,
            } => {
                self.on_disconnect.push((path, Node::from_json(&data)));
                replies.push(Reply::Complete {
                    request,
                    status: STATUS_OK.into(),
                });
            }
            TransportCall::OnDisconnectMerge {
                path,
                data,
                request,
            } => {
                if let Some(map) = data.as_object() {
                    for (key, value) in map {
                        self.on_disconnect
                            .push((path.join(&Path::parse(key)), Node::from_json(value)));
                    }
                }
                replies.push(Reply::Complete {
                    request,
                    status: STATUS_OK.into(),
                });
            }
            TransportCall::OnDisconnectCancel { path, request } => {
                self.on_disconnect.retain(|(p, _)| !path.contains(p));
                replies.push(Reply::Complete {
                    request,
                    status: STATUS_OK.into(),
                });
            }
            TransportCall::RefreshAuthToken(_)
            | TransportCall::ReportStats(_)
            | TransportCall::Interrupt(_)
            | TransportCall::Resume(_) => {}
        }
        replies
    }
}

/// An in-memory authority answering a [`Repo`]'s requests on demand.
#[derive(Default)]
pub struct TestServer {
    state: Mutex<ServerState>,
}

impl TestServer {
    /// Creates a server holding no data.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates a server holding `data` at the root.
    pub fn with_data(data: Value) -> Arc<Self> {
        let server = Self::default();
        server.state.lock().data = Node::from_json(&data);
        Arc::new(server)
    }

    /// Creates a repo with a default configuration talking to this server.
    pub fn connect(self: &Arc<Self>) -> Repo {
        self.connect_with(RepoConfig::default())
    }

    /// Creates a repo talking to this server.
    pub fn connect_with(self: &Arc<Self>, config: RepoConfig) -> Repo {
        Repo::new(config, self.clone())
    }

    /// The authoritative value at `path`.
    pub fn data(&self, path: &Path) -> Value {
        self.state.lock().data.get_child(path).val()
    }

    /// Changes the authoritative value without telling any client.
    pub fn set_data(&self, path: &Path, value: &Value) {
        let mut state = self.state.lock();
        state.data = state.data.update_child(path, Node::from_json(value));
    }

    /// Changes the authoritative value and pushes it to `repo`'s listens.
    pub fn push_change(&self, repo: &Repo, path: &Path, value: &Value) {
        let replies = {
            let mut state = self.state.lock();
            state.data = state.data.update_child(path, Node::from_json(value));
            let mut replies = Vec::new();
            state.broadcast(path, &mut replies);
            replies
        };
        Self::apply(repo, replies);
    }

    /// Answers every conditional put with `datastale` while set.
    pub fn set_always_stale(&self, stale: bool) {
        self.state.lock().always_stale = stale;
    }

    /// Rejects every write with `status` while set.
    pub fn reject_writes(&self, status: Option<&str>) {
        self.state.lock().reject_writes = status.map(str::to_string);
    }

    /// Number of requests waiting for an answer.
    pub fn pending(&self) -> usize {
        self.state.lock().inbox.len()
    }

    /// Every request received so far.
    pub fn calls(&self) -> Vec<TransportCall> {
        self.state.lock().log.clone()
    }

    /// Queries with an active listen, in start order.
    pub fn active_listens(&self) -> Vec<QuerySpec> {
        self.state
            .lock()
            .listens
            .iter()
            .map(|(query, _)| query.clone())
            .collect()
    }

    /// Answers the oldest waiting request. Returns false if none waited.
    pub fn deliver_one(&self, repo: &Repo) -> bool {
        let replies = {
            let mut state = self.state.lock();
            let Some(call) = state.inbox.pop_front() else {
                return false;
            };
            state.handle(call)
        };
        Self::apply(repo, replies);
        true
    }

    /// Answers requests until none wait, including those sent in
    /// response. Returns how many were answered.
    pub fn deliver(&self, repo: &Repo) -> usize {
        let mut count = 0;
        while self.deliver_one(repo) {
            count += 1;
        }
        count
    }

    /// Drops the connection: applies the scheduled on-disconnect writes
    /// on the server and tells `repo` it is offline.
    pub fn disconnect(&self, repo: &Repo) {
        {
            let mut state = self.state.lock();
            let writes = std::mem::take(&mut state.on_disconnect);
            for (path, node) in writes {
                state.write(&path, &node);
            }
            state.listens.clear();
            state.inbox.clear();
        }
        repo.on_connect_status(false);
    }

    fn apply(repo: &Repo, replies: Vec<Reply>) {
        for reply in replies {
            match reply {
                Reply::Data { path, data, tag } => repo.on_data_update(&path, &data, false, tag),
                Reply::Complete { request, status } => {
                    debug!(request, %status, "answering request");
                    repo.on_request_complete(request, &status, None)
                }
            }
        }
    }

    fn record(&self, call: TransportCall) {
        let mut state = self.state.lock();
        state.log.push(call.clone());
        state.inbox.push_back(call);
    }
}

impl Transport for TestServer {
    fn listen(&self, query: &QuerySpec, hash: &str, tag: Option<u64>, request: RequestId) {
        self.record(TransportCall::Listen {
            query: query.clone(),
            hash: hash.to_string(),
            tag,
            request,
        });
    }

    fn unlisten(&self, query: &QuerySpec, tag: Option<u64>) {
        self.record(TransportCall::Unlisten {
            query: query.clone(),
            tag,
        });
    }

    fn put(&self, path: &Path, data: &Value, hash: Option<&str>, request: RequestId) {
        self.record(TransportCall::Put {
            path: path.clone(),
            data: data.clone(),
            hash: hash.map(str::to_string),
            request,
        });
    }

    fn merge(&self, path: &Path, data: &Value, request: RequestId) {
        self.record(TransportCall::Merge {
            path: path.clone(),
            data: data.clone(),
            request,
        });
    }

    fn on_disconnect_put(&self, path: &Path, data: &Value, request: RequestId) {
        self.record(TransportCall::OnDisconnectPut {
            path: path.clone(),
            data: data.clone(),
            request,
        });
    }

    fn on_disconnect_merge(&self, path: &Path, data: &Value, request: RequestId) {
        self.record(TransportCall::OnDisconnectMerge {
            path: path.clone(),
            data: data.clone(),
            request,
        });
    }

    fn on_disconnect_cancel(&self, path: &Path, request: RequestId) {
        self.record(TransportCall::OnDisconnectCancel {
            path: path.clone(),
            request,
        });
    }

    fn refresh_auth_token(&self, token: Option<&str>) {
        self.record(TransportCall::RefreshAuthToken(token.map(str::to_string)));
    }

    fn report_stats(&self, stats: &RepoStats) {
        self.record(TransportCall::ReportStats(stats.clone()));
    }

    fn interrupt(&self, reason: &str) {
        self.record(TransportCall::Interrupt(reason.to_string()));
    }

    fn resume(&self, reason: &str) {
        self.record(TransportCall::Resume(reason.to_string()));
    }
}

/// An event as seen by a [`Recorder`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    /// Kind of event.
    pub event_type: EventType,
    /// Key of the snapshot.
    pub key: Option<String>,
    /// Value of the snapshot.
    pub value: Value,
    /// Preceding child for child events.
    pub prev_name: Option<String>,
}

impl RecordedEvent {
    fn from_event(event: &DataEvent) -> Self {
        Self {
            event_type: event.event_type,
            key: event.snapshot.key().map(str::to_string),
            value: event.snapshot.val(),
            prev_name: event.prev_name.clone(),
        }
    }

    /// Short form such as `child_added:d` or `value`.
    pub fn describe(&self) -> String {
        match (self.event_type, &self.key) {
            (EventType::Value, _) | (_, None) => self.event_type.to_string(),
            (event_type, Some(key)) => format!("{event_type}:{key}"),
        }
    }
}

/// Collects events delivered to the registrations it hands out.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<RecordedEvent>>>,
    cancelled: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    fn sink(&self) -> impl Fn(&DataEvent) + Send + Sync + 'static {
        let events = self.events.clone();
        move |event| events.lock().push(RecordedEvent::from_event(event))
    }

    /// A `value` registration feeding this recorder.
    pub fn values(&self) -> EventRegistration {
        let cancelled = self.cancelled.clone();
        EventRegistration::value(self.sink())
            .with_cancel(move |err| cancelled.lock().push(err.to_string()))
    }

    /// A child-event registration feeding this recorder.
    pub fn children(&self, types: &[EventType]) -> EventRegistration {
        let cancelled = self.cancelled.clone();
        EventRegistration::children(types, self.sink())
            .with_cancel(move |err| cancelled.lock().push(err.to_string()))
    }

    /// Takes the events recorded so far.
    pub fn take(&self) -> Vec<RecordedEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Takes the events recorded so far in short form.
    pub fn take_described(&self) -> Vec<String> {
        self.take().iter().map(RecordedEvent::describe).collect()
    }

    /// Number of events recorded and not yet taken.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Returns true if nothing was recorded since the last take.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Value of the latest `value` event.
    pub fn last_value(&self) -> Option<Value> {
        self.events
            .lock()
            .iter()
            .rev()
            .find(|e| e.event_type == EventType::Value)
            .map(|e| e.value.clone())
    }

    /// Cancellation messages received.
    pub fn cancellations(&self) -> Vec<String> {
        self.cancelled.lock().clone()
    }
}
