use std::fmt;

use crate::database::error::{invalid_argument, DatabaseResult};

/// Maximum nesting depth accepted for a location.
pub const MAX_PATH_DEPTH: usize = 32;
/// Maximum UTF-8 length of a single key.
pub const MAX_KEY_BYTES: usize = 768;

const INVALID_KEY_CHARS: &[char] = &['.', '#', '$', '[', ']', '/'];

/// A normalised location in the database tree.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Path {
    segments: Vec<String>,
}

impl Path {
    pub fn root() -> Self {
        Self::default()
    }

    /// Parses a `/`-separated path. Leading and trailing slashes are ignored.
    pub fn parse(path: &str) -> DatabaseResult<Self> {
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        let mut segments = Vec::new();
        for segment in trimmed.split('/') {
            if segment.is_empty() {
                return Err(invalid_argument(
                    "Database path cannot contain empty segments",
                ));
            }
            validate_path_segment(segment)?;
            segments.push(segment.to_string());
        }
        if segments.len() > MAX_PATH_DEPTH {
            return Err(invalid_argument(format!(
                "Database path '{path}' is deeper than {MAX_PATH_DEPTH} levels"
            )));
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn front(&self) -> Option<&str> {
        self.segments.first().map(String::as_str)
    }

    pub fn key(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    pub fn parent(&self) -> Option<Path> {
        if self.segments.is_empty() {
            return None;
        }
        let mut segments = self.segments.clone();
        segments.pop();
        Some(Self { segments })
    }

    pub fn child(&self, key: impl Into<String>) -> Path {
        let mut segments = self.segments.clone();
        segments.push(key.into());
        Self { segments }
    }

    pub fn join(&self, relative: &Path) -> Path {
        let mut segments = self.segments.clone();
        segments.extend(relative.segments.iter().cloned());
        Self { segments }
    }

    /// `true` when `self` is an ancestor of, or equal to, `other`.
    pub fn contains(&self, other: &Path) -> bool {
        self.segments.len() <= other.segments.len()
            && self
                .segments
                .iter()
                .zip(other.segments.iter())
                .all(|(left, right)| left == right)
    }

    /// `true` when one path is an ancestor of (or equal to) the other.
    pub fn is_related(&self, other: &Path) -> bool {
        self.contains(other) || other.contains(self)
    }

    /// Returns `other` relative to `self`, or `None` when `self` does not
    /// contain `other`.
    pub fn relative_to_child(&self, other: &Path) -> Option<Path> {
        if !self.contains(other) {
            return None;
        }
        Some(Self {
            segments: other.segments[self.segments.len()..].to_vec(),
        })
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            f.write_str("/")
        } else {
            for segment in &self.segments {
                write!(f, "/{segment}")?;
            }
            Ok(())
        }
    }
}

fn validate_path_segment(segment: &str) -> DatabaseResult<()> {
    if segment.len() > MAX_KEY_BYTES {
        return Err(invalid_argument(format!(
            "Database key is longer than {MAX_KEY_BYTES} bytes"
        )));
    }
    if segment
        .chars()
        .any(|ch| INVALID_KEY_CHARS[..5].contains(&ch) || ch.is_control())
    {
        return Err(invalid_argument(format!(
            "Database path segment '{segment}' contains '.', '#', '$', '[', ']' or a control character"
        )));
    }
    Ok(())
}

/// Validates a key used inside written data. Keys starting with `.` are only
/// legal for the reserved metadata keys.
pub(crate) fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= MAX_KEY_BYTES
        && !key
            .chars()
            .any(|ch| INVALID_KEY_CHARS.contains(&ch) || ch.is_control())
}
