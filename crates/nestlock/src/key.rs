//! Hierarchical lock keys.
//!
//! A key is the sequence of non-empty `/`-separated segments of its input, so
//! `"root/users/42"`, `"/root//users/42/"` and `["root", "users", "42"]` are
//! the same key. Keys are *related* when one is a prefix of the other (or
//! they are equal); only related keys can conflict.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::constants::MAX_KEY_SEGMENTS;

/// Canonical hierarchical lock key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockKey {
    segments: Vec<String>,
}

impl LockKey {
    /// Parse a `/`-separated path, discarding empty segments.
    pub fn parse(input: &str) -> Self {
        Self::from_segments([input])
    }

    /// Build a key from segments; each segment is itself split on `/`.
    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let segments: Vec<String> = segments
            .into_iter()
            .flat_map(|s| s.as_ref().split('/').filter(|p| !p.is_empty()).map(str::to_owned).collect::<Vec<_>>())
            .collect();
        debug_assert!(segments.len() <= MAX_KEY_SEGMENTS, "KEY: {} segments exceeds {MAX_KEY_SEGMENTS}", segments.len());
        Self { segments }
    }

    /// The canonical segments.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// The empty key is related to every key.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// True if every segment matches over the shorter key's length.
    pub fn is_related(&self, other: &LockKey) -> bool {
        self.segments.iter().zip(other.segments.iter()).all(|(a, b)| a == b)
    }

    /// True if `self` is a strict ancestor of `other`.
    pub fn is_prefix_of(&self, other: &LockKey) -> bool {
        self.segments.len() < other.segments.len() && self.is_related(other)
    }

    /// Key one level below this one.
    pub fn child(&self, segment: &str) -> Self {
        Self::from_segments(self.segments.iter().map(String::as_str).chain([segment]))
    }

    /// Key one level above this one, `None` for the empty key.
    pub fn parent(&self) -> Option<Self> {
        let (_, rest) = self.segments.split_last()?;
        Some(Self { segments: rest.to_vec() })
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("/"))
    }
}

impl From<&str> for LockKey {
    fn from(value: &str) -> Self {
        LockKey::parse(value)
    }
}

impl From<String> for LockKey {
    fn from(value: String) -> Self {
        LockKey::parse(&value)
    }
}

impl From<&String> for LockKey {
    fn from(value: &String) -> Self {
        LockKey::parse(value)
    }
}

impl From<Vec<String>> for LockKey {
    fn from(value: Vec<String>) -> Self {
        LockKey::from_segments(value)
    }
}

impl From<&[&str]> for LockKey {
    fn from(value: &[&str]) -> Self {
        LockKey::from_segments(value)
    }
}

impl<const N: usize> From<[&str; N]> for LockKey {
    fn from(value: [&str; N]) -> Self {
        LockKey::from_segments(value)
    }
}

impl From<&LockKey> for LockKey {
    fn from(value: &LockKey) -> Self {
        value.clone()
    }
}
