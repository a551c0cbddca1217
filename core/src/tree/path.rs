//! Key paths into a variable tree.
//!
//! Paths look like `params/dense/kernel`: the first segment names a
//! collection, the rest walk nested branches. Patterns may use `*` to match
//! exactly one segment and `**` to match zero or more.

use std::fmt;

use crate::error::TreeError;

/// Separator between path segments.
pub const SEPARATOR: char = '/';

/// A single segment within a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    /// Exact key, e.g. `kernel`
    Literal(String),
    /// `*` matches any single key
    Wildcard,
    /// `**` matches zero or more keys
    DoubleWildcard,
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Literal(s) => f.write_str(s),
            PathSegment::Wildcard => f.write_str("*"),
            PathSegment::DoubleWildcard => f.write_str("**"),
        }
    }
}


/// A parsed path. Concrete paths contain only literal segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPath {
    segments: Vec<PathSegment>,
}

impl KeyPath {
    /// Parse a `/`-separated path or pattern.
    pub fn parse(input: &str) -> Result<Self, TreeError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(TreeError::invalid_path(input, "empty path"));
        }
        let mut segments = Vec::new();
        for part in trimmed.split(SEPARATOR) {
            if part.is_empty() {
                return Err(TreeError::invalid_path(input, "empty segment"));
            }
            let seg = match part {
                "**" => PathSegment::DoubleWildcard,
                "*" => PathSegment::Wildcard,
                lit => PathSegment::Literal(lit.to_string()),
            };
            segments.push(seg);
        }
        Ok(KeyPath { segments })
    }

    /// Parse a path and reject wildcards.
    pub fn parse_concrete(input: &str) -> Result<Self, TreeError> {
        let path = Self::parse(input)?;
        if path.is_pattern() {
            return Err(TreeError::invalid_path(input, "wildcards are not allowed here"));
        }
        Ok(path)
    }

    /// Build a concrete path from keys. Each key must be non-empty and free
    /// of separators.
    pub fn from_keys<S: AsRef<str>>(keys: &[S]) -> Result<Self, TreeError> {
        let mut segments = Vec::with_capacity(keys.len());
        for key in keys {
            let key = key.as_ref();
            validate_key(key)?;
            segments.push(PathSegment::Literal(key.to_string()));
        }
        if segments.is_empty() {
            return Err(TreeError::invalid_path("", "empty path"));
        }
        Ok(KeyPath { segments })
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// Literal keys of a concrete path. Wildcards are skipped.
    pub fn keys(&self) -> Vec<&str> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                PathSegment::Literal(k) => Some(k.as_str()),
                _ => None,
            })
            .collect()
    }

    /// The collection this path lives in, if the first segment is literal.
    pub fn collection(&self) -> Option<&str> {
        match self.segments.first() {
            Some(PathSegment::Literal(k)) => Some(k),
            _ => None,
        }
    }

    /// True if this path contains any wildcard segments.
    pub fn is_pattern(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, PathSegment::Wildcard | PathSegment::DoubleWildcard))
    }

    /// Match a concrete path against this pattern.
    pub fn matches(&self, concrete: &KeyPath) -> bool {
        match_segments(&self.segments, &concrete.segments)
    }

    /// Format back to a `/`-separated string.
    pub fn to_path_string(&self) -> String {
        self.segments
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join("/")
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_path_string())
    }
}


/// Check that `key` can be used as a tree key.
pub fn validate_key(key: &str) -> Result<(), TreeError> {
    if key.is_empty() {
        return Err(TreeError::invalid_path(key, "empty key"));
    }
    if key.contains(SEPARATOR) {
        return Err(TreeError::invalid_path(key, "key contains '/'"));
    }
    if key == "*" || key == "**" {
        return Err(TreeError::invalid_path(key, "wildcard used as a key"));
    }
    // Paths are trimmed on parse, so padded keys would be unreachable.
    if key.trim() != key {
        return Err(TreeError::invalid_path(key, "leading or trailing whitespace"));
    }
    Ok(())
}


/// Join keys into a path string without validation.
pub fn join<S: AsRef<str>>(keys: &[S]) -> String {
    keys.iter().map(|k| k.as_ref()).collect::<Vec<_>>().join("/")
}


// ---------------------------------------------------------------------------
// Internal: recursive segment matching
// ---------------------------------------------------------------------------

fn match_segments(pattern: &[PathSegment], concrete: &[PathSegment]) -> bool {
    match pattern.first() {
        None => concrete.is_empty(),
        Some(PathSegment::DoubleWildcard) => {
            (0..=concrete.len()).any(|skip| match_segments(&pattern[1..], &concrete[skip..]))
        }
        Some(PathSegment::Wildcard) => {
            !concrete.is_empty() && match_segments(&pattern[1..], &concrete[1..])
        }
        Some(PathSegment::Literal(expected)) => match concrete.first() {
            Some(PathSegment::Literal(actual)) if actual == expected => {
                match_segments(&pattern[1..], &concrete[1..])
            }
            _ => false,
        },
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
