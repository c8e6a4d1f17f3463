//! The contract between the engine and the network layer.
//!
//! The engine calls a [`Transport`] for everything that leaves the
//! process; the transport reports results back through the `Repo`'s
//! inbound methods, quoting the [`RequestId`] it was handed.

use crate::query::QuerySpec;
use crate::stats::RepoStats;
use canopy_value::{Node, Path};
use parking_lot::Mutex;
use serde_json::Value;

/// Identifies a request awaiting completion.
pub type RequestId = u64;

/// Status reported for a successful request.
pub const STATUS_OK: &str = "ok";

/// Status reported when a transaction's base state was out of date.
pub const STATUS_DATASTALE: &str = "datastale";

/// Outbound half of the wire transport.
///
/// Implementations are called without any engine lock held, so they may
/// call back into the `Repo` synchronously.
pub trait Transport: Send + Sync {
    /// Starts a listen. `hash` describes the data already cached.
    fn listen(&self, query: &QuerySpec, hash: &str, tag: Option<u64>, request: RequestId);

    /// Stops a listen.
    fn unlisten(&self, query: &QuerySpec, tag: Option<u64>);

    /// Replaces the value at `path`. A hash makes the write conditional.
    fn put(&self, path: &Path, data: &Value, hash: Option<&str>, request: RequestId);

    /// Replaces the listed children of `path`.
    fn merge(&self, path: &Path, data: &Value, request: RequestId);

    /// Schedules a put for when the connection drops.
    fn on_disconnect_put(&self, path: &Path, data: &Value, request: RequestId);

    /// Schedules a merge for when the connection drops.
    fn on_disconnect_merge(&self, path: &Path, data: &Value, request: RequestId);

    /// Cancels scheduled on-disconnect writes at and below `path`.
    fn on_disconnect_cancel(&self, path: &Path, request: RequestId);

    /// Replaces the credential used by the connection.
    fn refresh_auth_token(&self, token: Option<&str>);

    /// Forwards engine counters.
    fn report_stats(&self, stats: &RepoStats);

    /// Suspends the connection.
    fn interrupt(&self, reason: &str);

    /// Resumes the connection.
    fn resume(&self, reason: &str);

    /// Opaque token describing `node`, compared by the authority to detect
    /// stale transaction bases.
    fn state_hash(&self, node: &Node) -> String {
        node.hash()
    }
}

/// Work for the transport collected under the engine lock.
#[derive(Debug, Clone)]
pub(crate) enum ServerAction {
    Listen {
        query: QuerySpec,
        tag: Option<u64>,
        server_cache: Node,
        request: RequestId,
    },
    Unlisten {
        query: QuerySpec,
        tag: Option<u64>,
    },
    Put {
        path: Path,
        data: Value,
        hash_of: Option<Node>,
        request: RequestId,
    },
    Merge {
        path: Path,
        data: Value,
        request: RequestId,
    },
    OnDisconnectPut {
        path: Path,
        data: Value,
        request: RequestId,
    },
    OnDisconnectMerge {
        path: Path,
        data: Value,
        request: RequestId,
    },
    OnDisconnectCancel {
        path: Path,
        request: RequestId,
    },
    RefreshAuthToken(Option<String>),
    ReportStats(RepoStats),
    Interrupt(String),
    Resume(String),
}

impl ServerAction {
    pub(crate) fn dispatch(self, transport: &dyn Transport) {
        match self {
            ServerAction::Listen {
                query,
                tag,
                server_cache,
                request,
            } => {
                let hash = transport.state_hash(&server_cache);
                transport.listen(&query, &hash, tag, request);
            }
            ServerAction::Unlisten { query, tag } => transport.unlisten(&query, tag),
            ServerAction::Put {
                path,
                data,
                hash_of,
                request,
            } => {
                let hash = hash_of.map(|node| transport.state_hash(&node));
                transport.put(&path, &data, hash.as_deref(), request);
            }
            ServerAction::Merge {
                path,
                data,
                request,
            } => transport.merge(&path, &data, request),
            ServerAction::OnDisconnectPut {
                path,
                data,
                request,
            } => transport.on_disconnect_put(&path, &data, request),
            ServerAction::OnDisconnectMerge {
                path,
                data,
                request,
            } => transport.on_disconnect_merge(&path, &data, request),
            ServerAction::OnDisconnectCancel { path, request } => {
                transport.on_disconnect_cancel(&path, request)
            }
            ServerAction::RefreshAuthToken(token) => transport.refresh_auth_token(token.as_deref()),
            ServerAction::ReportStats(stats) => transport.report_stats(&stats),
            ServerAction::Interrupt(reason) => transport.interrupt(&reason),
            ServerAction::Resume(reason) => transport.resume(&reason),
        }
    }
}

/// A transport call as recorded by [`MockTransport`].
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCall {
    /// `listen`.
    Listen {
        /// Query.
        query: QuerySpec,
        /// State hash.
        hash: String,
        /// Tag.
        tag: Option<u64>,
        /// Request id.
        request: RequestId,
    },
    /// `unlisten`.
    Unlisten {
        /// Query.
        query: QuerySpec,
        /// Tag.
        tag: Option<u64>,
    },
    /// `put`.
    Put {
        /// Path.
        path: Path,
        /// Payload.
        data: Value,
        /// Conditional hash.
        hash: Option<String>,
        /// Request id.
        request: RequestId,
    },
    /// `merge`.
    Merge {
        /// Path.
        path: Path,
        /// Payload.
        data: Value,
        /// Request id.
        request: RequestId,
    },
    /// `on_disconnect_put`.
    OnDisconnectPut {
        /// Path.
        path: Path,
        /// Payload.
        data: Value,
        /// Request id.
        request: RequestId,
    },
    /// `on_disconnect_merge`.
    OnDisconnectMerge {
        /// Path.
        path: Path,
        /// Payload.
        data: Value,
        /// Request id.
        request: RequestId,
    },
    /// `on_disconnect_cancel`.
    OnDisconnectCancel {
        /// Path.
        path: Path,
        /// Request id.
        request: RequestId,
    },
    /// `refresh_auth_token`.
    RefreshAuthToken(Option<String>),
    /// `report_stats`.
    ReportStats(RepoStats),
    /// `interrupt`.
    Interrupt(String),
    /// `resume`.
    Resume(String),
}

/// A transport that records calls for inspection.
#[derive(Debug, Default)]
pub struct MockTransport {
    calls: Mutex<Vec<TransportCall>>,
}

impl MockTransport {
    /// Creates a new mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, call: TransportCall) {
        self.calls.lock().push(call);
    }

    /// All calls so far.
    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().clone()
    }

    /// Takes the calls recorded so far.
    pub fn take_calls(&self) -> Vec<TransportCall> {
        std::mem::take(&mut *self.calls.lock())
    }

    /// Queries currently listened for, in start order.
    pub fn active_listens(&self) -> Vec<QuerySpec> {
        let mut active: Vec<QuerySpec> = Vec::new();
        for call in self.calls.lock().iter() {
            match call {
                TransportCall::Listen { query, .. } => active.push(query.clone()),
                TransportCall::Unlisten { query, .. } => {
                    if let Some(pos) = active.iter().position(|q| q == query) {
                        active.remove(pos);
                    }
                }
                _ => {}
            }
        }
        active
    }

    /// The most recent put or merge request id.
    pub fn last_write_request(&self) -> Option<RequestId> {
        self.calls.lock().iter().rev().find_map(|call| match call {
            TransportCall::Put { request, .. } | TransportCall::Merge { request, .. } => Some(*request),
            _ => None,
        })
    }
}

impl Transport for MockTransport {
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dispatch_computes_hashes() {
        let transport = MockTransport::new();
        let node = Node::from_json(&json!({"a": 1}));
        ServerAction::Put {
            path: Path::parse("a"),
            data: json!(2),
            hash_of: Some(node.clone()),
            request: 7,
        }
        .dispatch(&transport);
        assert_eq!(
            transport.calls(),
            vec![TransportCall::Put {
                path: Path::parse("a"),
                data: json!(2),
                hash: Some(node.hash()),
                request: 7,
            }]
        );
        assert_eq!(transport.last_write_request(), Some(7));
    }

    #[test]
    fn active_listens_track_unlisten() {
        let transport = MockTransport::new();
        let a = QuerySpec::default_at(Path::parse("a"));
        let b = QuerySpec::default_at(Path::parse("b"));
        transport.listen(&a, "", None, 1);
        transport.listen(&b, "", None, 2);
        transport.unlisten(&a, None);
        assert_eq!(transport.active_listens(), vec![b]);
        assert_eq!(transport.take_calls().len(), 3);
        assert!(transport.calls().is_empty());
    }
}
