//! Slash-separated locations in the value tree.

use crate::key::compare_keys;
use std::cmp::Ordering;
use std::fmt;

/// A location in the tree, as a sequence of child keys.
///
/// Empty segments are dropped when parsing, so `"/a//b/"` and `"a/b"`
/// name the same location. The empty path is the root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Path {
    segments: Vec<String>,
}

impl Path {
    /// The root path.
    pub fn root() -> Self {
        Self::default()
    }

    /// Parses a slash-separated path string.
    pub fn parse(s: &str) -> Self {
        Self {
            segments: s
                .split('/')
                .filter(|seg| !seg.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    /// Creates a path from segments.
    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments
                .into_iter()
                .map(Into::into)
                .filter(|s: &String| !s.is_empty())
                .collect(),
        }
    }

    /// Returns true for the root path.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// The segments of this path.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// First segment, if any.
    pub fn front(&self) -> Option<&str> {
        self.segments.first().map(String::as_str)
    }

    /// Last segment, if any.
    pub fn back(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// The path without its first segment.
    pub fn pop_front(&self) -> Path {
        Self {
            segments: self.segments.iter().skip(1).cloned().collect(),
        }
    }

    /// The parent path, or `None` at the root.
    pub fn parent(&self) -> Option<Path> {
        if self.segments.is_empty() {
            return None;
        }
        let mut segments = self.segments.clone();
        segments.pop();
        Some(Self { segments })
    }

    /// This path extended by a child key or relative path string.
    pub fn child(&self, key: &str) -> Path {
        let mut segments = self.segments.clone();
        segments.extend(key.split('/').filter(|s| !s.is_empty()).map(str::to_string));
        Self { segments }
    }

    /// This path extended by another path.
    pub fn join(&self, other: &Path) -> Path {
        let mut segments = self.segments.clone();
        segments.extend(other.segments.iter().cloned());
        Self { segments }
    }

    /// Returns true if `self` is an ancestor of, or equal to, `other`.
    pub fn contains(&self, other: &Path) -> bool {
        self.segments.len() <= other.segments.len()
            && self
                .segments
                .iter()
                .zip(other.segments.iter())
                .all(|(a, b)| a == b)
    }

    /// The path of `inner` relative to `outer`.
    ///
    /// Returns `None` when `outer` does not contain `inner`.
    pub fn relative(outer: &Path, inner: &Path) -> Option<Path> {
        if !outer.contains(inner) {
            return None;
        }
        Some(Self {
            segments: inner.segments[outer.segments.len()..].to_vec(),
        })
    }

    /// Returns true if the first segment is the reserved `.info` key.
    pub fn is_info(&self) -> bool {
        self.front() == Some(".info")
    }
}

impl Ord for Path {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.segments.iter().zip(other.segments.iter()) {
            match compare_keys(a, b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        self.segments.len().cmp(&other.segments.len())
    }
}

impl PartialOrd for Path {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for seg in &self.segments {
            write!(f, "/{seg}")?;
        }
        Ok(())
    }
}

impl From<&str> for Path {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

impl From<String> for Path {
    fn from(s: String) -> Self {
        Self::parse(&s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_drops_empty_segments() {
        let p = Path::parse("/a//b/");
        assert_eq!(p.segments(), &["a".to_string(), "b".to_string()]);
        assert_eq!(p.to_string(), "/a/b");
        assert_eq!(Path::root().to_string(), "/");
    }

    #[test]
    fn navigation() {
        let p = Path::parse("a/b/c");
        assert_eq!(p.front(), Some("a"));
        assert_eq!(p.back(), Some("c"));
        assert_eq!(p.pop_front(), Path::parse("b/c"));
        assert_eq!(p.parent(), Some(Path::parse("a/b")));
        assert_eq!(Path::root().parent(), None);
        assert_eq!(Path::parse("a").child("b/c"), p);
    }

    #[test]
    fn containment_and_relative() {
        let a = Path::parse("a");
        let abc = Path::parse("a/b/c");
        assert!(a.contains(&abc));
        assert!(abc.contains(&abc));
        assert!(!abc.contains(&a));
        assert!(Path::root().contains(&a));
        assert_eq!(Path::relative(&a, &abc), Some(Path::parse("b/c")));
        assert_eq!(Path::relative(&abc, &a), None);
        assert!(!Path::parse("ab").contains(&Path::parse("a/b")));
    }

    #[test]
    fn ordering_uses_key_order() {
        assert!(Path::parse("a/2") < Path::parse("a/10"));
        assert!(Path::parse("a") < Path::parse("a/b"));
        assert!(Path::parse("1") < Path::parse("a"));
    }
}
