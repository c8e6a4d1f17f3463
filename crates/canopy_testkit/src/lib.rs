//! # Canopy Testkit
//!
//! Test utilities for the Canopy sync engine.
//!
//! This crate provides:
//! - [`TestServer`]: a scripted in-memory authority implementing the
//!   transport contract
//! - [`Recorder`]: collects delivered events for assertions
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust
//! use canopy_testkit::prelude::*;
//! use canopy_core::QuerySpec;
//! use canopy_value::Path;
//! use serde_json::json;
//!
//! let server = TestServer::with_data(json!({"users": {"ada": 36}}));
//! let repo = server.connect();
//! let recorder = Recorder::new();
//! repo.add_event_callback(
//!     &QuerySpec::default_at(Path::parse("users")),
//!     recorder.values(),
//! );
//! server.deliver(&repo);
//! assert_eq!(recorder.last_value(), Some(json!({"ada": 36})));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use fixtures::*;
pub use generators::*;
