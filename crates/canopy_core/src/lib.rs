//! # Canopy Core
//!
//! Client-side synchronization engine for the Canopy realtime database.
//!
//! This crate provides:
//! - A write log overlaying pending local writes on server data
//! - Views and sync points that turn cache changes into ordered events
//! - Listener deduplication deciding which remote listens are needed
//! - Optimistic transactions with bounded retry and conflict aborts
//! - On-disconnect writes, the `.info` tree, and engine counters
//!
//! The network layer is abstracted behind [`Transport`]; the [`Repo`]
//! calls it for outbound requests and is told about results through its
//! `on_*` methods.
//!
//! ## Example
//!
//! ```rust
//! use canopy_core::{EventRegistration, MockTransport, QuerySpec, Repo, RepoConfig};
//! use canopy_value::Path;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let transport = Arc::new(MockTransport::new());
//! let repo = Repo::new(RepoConfig::default(), transport.clone());
//!
//! let query = QuerySpec::default_at(Path::parse("users/ada"));
//! repo.add_event_callback(&query, EventRegistration::value(|event| {
//!     println!("ada is now {}", event.snapshot.val());
//! }));
//!
//! let mut done = repo.set(&Path::parse("users/ada"), &json!({"age": 36})).unwrap();
//! let request = transport.last_write_request().unwrap();
//! repo.on_request_complete(request, "ok", None);
//! assert_eq!(done.try_recv().unwrap(), Ok(()));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod event;
mod event_queue;
mod on_disconnect;
mod operation;
mod query;
mod registry;
mod repo;
mod stats;
mod sync_point;
mod sync_tree;
mod transport;
mod tree;
mod view;
mod write_tree;

pub use config::{RepoConfig, DEFAULT_MAX_TRANSACTION_RETRIES};
pub use error::{AbortReason, DatabaseError, DbResult};
pub use event::{
    CancelCallback, DataCallback, DataEvent, DataSnapshot, Event, EventFilter, EventKind,
    EventRegistration, EventType,
};
pub use event_queue::EventQueue;
pub use on_disconnect::OnDisconnectTree;
pub use operation::{Operation, OperationSource};
pub use query::{Bound, LimitAnchor, QueryParams, QuerySpec, DEFAULT_QUERY_ID};
pub use registry::RepoRegistry;
pub use repo::{Completion, Repo, TransactionOutcome, TransactionStatus, INTERRUPT_REASON};
pub use stats::RepoStats;
pub use sync_point::SyncPoint;
pub use sync_tree::{ListenRequest, SyncTree};
pub use tree::{NodeId, Tree};
pub use transport::{
    MockTransport, RequestId, Transport, TransportCall, STATUS_DATASTALE, STATUS_OK,
};
pub use view::{CacheNode, View};
pub use write_tree::{WriteId, WritePayload, WriteRecord, WriteTree};
