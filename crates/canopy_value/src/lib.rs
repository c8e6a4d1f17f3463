//! # Canopy Value
//!
//! The immutable value model shared by the Canopy client engine.
//!
//! This crate provides:
//! - [`Path`]: slash-separated locations with the engine's key ordering
//! - [`Node`]: structurally shared value trees with priorities
//! - [`Index`]: the four child orderings used by queries
//! - JSON import/export, including `.value`, `.priority` and `.sv` markers
//! - Server value resolution and boundary validation
//!
//! ## Example
//!
//! ```rust
//! use canopy_value::{Node, Path};
//! use serde_json::json;
//!
//! let node = Node::from_json(&json!({"users": {"ada": {"age": 36}}}));
//! let age = node.get_child(&Path::parse("users/ada/age"));
//! assert_eq!(age.val(), json!(36));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod index;
mod key;
mod node;
mod path;
mod server_values;
pub mod validation;

pub use error::{ValueError, ValueResult};
pub use index::{compare_values, default_end_name, default_start_name, Index, NamedNode};
pub use key::{
    compare_keys, int_key, ChildKey, MAX_NAME, MIN_NAME, PRIORITY_KEY, SERVER_VALUE_KEY, VALUE_KEY,
};
pub use node::{Leaf, Node, Priority, ServerValue};
pub use path::Path;
pub use server_values::{has_deferred, resolve_deferred};
