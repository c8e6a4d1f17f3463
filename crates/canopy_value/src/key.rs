//! Child key ordering.
//!
//! Keys that parse as 32-bit integers sort numerically and before every
//! other key. Remaining keys sort lexically. Two sentinels bound the key
//! space for query posts.

use std::cmp::Ordering;

/// Sentinel that sorts before every key.
pub const MIN_NAME: &str = "[MIN_NAME]";

/// Sentinel that sorts after every key.
pub const MAX_NAME: &str = "[MAX_NAME]";

/// Reserved key addressing a node's priority.
pub const PRIORITY_KEY: &str = ".priority";

/// Reserved key wrapping a scalar that carries a priority.
pub const VALUE_KEY: &str = ".value";

/// Reserved key marking a server value placeholder.
pub const SERVER_VALUE_KEY: &str = ".sv";

/// Parses a key as a canonical 32-bit integer (no leading zeros, no `+`).
pub fn int_key(key: &str) -> Option<i32> {
    let digits = key.strip_prefix('-').unwrap_or(key);
    if digits.is_empty() || digits.len() > 11 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return None;
    }
    if key == "-0" {
        return None;
    }
    key.parse::<i32>().ok()
}

/// Compares two child keys.
pub fn compare_keys(a: &str, b: &str) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }
    if a == MIN_NAME || b == MAX_NAME {
        return Ordering::Less;
    }
    if b == MIN_NAME || a == MAX_NAME {
        return Ordering::Greater;
    }
    match (int_key(a), int_key(b)) {
        (Some(x), Some(y)) => match x.cmp(&y) {
            // "1" and "01" can't both parse, so equal ints means equal keys
            Ordering::Equal => a.len().cmp(&b.len()),
            ord => ord,
        },
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

/// A child key with the engine's key ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChildKey(String);

impl ChildKey {
    /// Creates a child key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the key, returning the inner string.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl Ord for ChildKey {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_keys(&self.0, &other.0)
    }
}

impl PartialOrd for ChildKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<&str> for ChildKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for ChildKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl std::fmt::Display for ChildKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
