//! Boundary validation of user supplied keys, paths and values.
//!
//! Everything here runs before a write is recorded, so a failure never
//! leaves partial state behind.

use crate::error::{ValueError, ValueResult};
use crate::key::{PRIORITY_KEY, SERVER_VALUE_KEY, VALUE_KEY};
use crate::node::ServerValue;
use crate::path::Path;
use serde_json::{Map, Value};

/// Maximum size of a string leaf in UTF-8 bytes.
pub const MAX_LEAF_SIZE: usize = 10 * 1024 * 1024;

/// Maximum depth of a path, including keys inside written data.
pub const MAX_PATH_DEPTH: usize = 32;

/// Maximum length of a path in UTF-8 bytes.
pub const MAX_PATH_LENGTH_BYTES: usize = 768;

fn is_forbidden_key_char(c: char) -> bool {
    matches!(c, '[' | ']' | '.' | '#' | '$' | '/') || c.is_ascii_control()
}

/// Returns true if `key` can name a child.
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty() && !key.chars().any(is_forbidden_key_char)
}

/// Returns true if `path` contains no forbidden characters.
pub fn is_valid_path_string(path: &str) -> bool {
    !path.is_empty() && !path.chars().any(|c| c != '/' && is_forbidden_key_char(c))
}

/// Validates a path string supplied by the caller.
///
/// A leading `.info` segment is allowed so reads of the info tree pass.
pub fn validate_path_string(path: &str) -> ValueResult<Path> {
    let trimmed = path.trim_start_matches('/');
    let rest = trimmed
        .strip_prefix(".info")
        .filter(|rest| rest.is_empty() || rest.starts_with('/'))
        .unwrap_or(trimmed);
    if !rest.is_empty() && !is_valid_path_string(rest) {
        return Err(ValueError::InvalidPath {
            path: path.to_string(),
        });
    }
    Ok(Path::parse(path))
}

fn check_path_limits(path: &Path) -> ValueResult<()> {
    if path.len() > MAX_PATH_DEPTH {
        return Err(ValueError::invalid_data(
            path,
            format!("path specified exceeds the maximum depth of {MAX_PATH_DEPTH}"),
        ));
    }
    let bytes: usize = path.segments().iter().map(|s| s.len()).sum::<usize>()
        + path.len().saturating_sub(1);
    if bytes > MAX_PATH_LENGTH_BYTES {
        return Err(ValueError::invalid_data(
            path,
            format!("path specified exceeds the maximum length of {MAX_PATH_LENGTH_BYTES} bytes"),
        ));
    }
    Ok(())
}

/// Validates a priority value.
pub fn validate_priority(priority: &Value, path: &Path) -> ValueResult<()> {
    let ok = match priority {
        Value::Null | Value::String(_) => true,
        Value::Number(n) => n.as_f64().is_some_and(f64::is_finite),
        Value::Object(map) => {
            map.len() == 1
                && map
                    .get(SERVER_VALUE_KEY)
                    .and_then(ServerValue::from_json)
                    .is_some()
        }
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(ValueError::InvalidPriority {
            path: path.to_string(),
        })
    }
}

/// Validates a value about to be written at `path`.
pub fn validate_data(data: &Value, path: &Path) -> ValueResult<()> {
    check_path_limits(path)?;
    match data {
        Value::Null | Value::Bool(_) => Ok(()),
        Value::Number(n) => {
            if n.as_f64().is_some_and(f64::is_finite) {
                Ok(())
            } else {
                Err(ValueError::invalid_data(path, "numbers must be finite"))
            }
        }
        Value::String(s) => {
            if s.len() > MAX_LEAF_SIZE {
                Err(ValueError::LeafTooLarge {
                    path: path.to_string(),
                    limit: MAX_LEAF_SIZE,
                })
            } else {
                Ok(())
            }
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                validate_data(item, &path.child(&i.to_string()))?;
            }
            Ok(())
        }
        Value::Object(map) => validate_object(map, path),
    }
}

fn validate_object(map: &Map<String, Value>, path: &Path) -> ValueResult<()> {
    if let Some(sv) = map.get(SERVER_VALUE_KEY) {
        if ServerValue::from_json(sv).is_none() {
            return Err(ValueError::UnsupportedServerValue {
                path: path.to_string(),
                value: sv.to_string(),
            });
        }
    }
    let mut has_dot_value = false;
    let mut has_actual_child = false;
    for (key, child) in map {
        match key.as_str() {
            VALUE_KEY => {
                has_dot_value = true;
                validate_data(child, path)?;
            }
            PRIORITY_KEY => validate_priority(child, path)?,
            SERVER_VALUE_KEY => {}
            _ => {
                if !is_valid_key(key) {
                    return Err(ValueError::invalid_key(key.as_str(), path));
                }
                has_actual_child = true;
                validate_data(child, &path.child(key))?;
            }
        }
    }
    if has_dot_value && has_actual_child {
        return Err(ValueError::invalid_data(
            path,
            "\".value\" can't coexist with child keys",
        ));
    }
    Ok(())
}

/// Validates the argument of a multi-path update rooted at `path`.
///
/// Returns the parsed relative paths paired with their values, sorted.
pub fn validate_update(
    values: &Map<String, Value>,
    path: &Path,
) -> ValueResult<Vec<(Path, Value)>> {
    let mut entries = Vec::with_capacity(values.len());
    for (key, value) in values {
        let relative = validate_path_string(key)?;
        if relative.is_info() {
            return Err(ValueError::InvalidPath { path: key.clone() });
        }
        let full = path.join(&relative);
        if relative.back() == Some(PRIORITY_KEY) {
            validate_priority(value, &full)?;
        } else {
            validate_data(value, &full)?;
        }
        entries.push((relative, value.clone()));
    }
    entries.sort_by(|(a, _), (b, _)| a.cmp(b));
    for pair in entries.windows(2) {
        let (prev, cur) = (&pair[0].0, &pair[1].0);
        if prev.contains(cur) {
            return Err(ValueError::OverlappingPaths {
                ancestor: path.join(prev).to_string(),
                descendant: path.join(cur).to_string(),
            });
        }
    }
    Ok(entries)
}
