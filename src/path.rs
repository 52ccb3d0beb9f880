use crate::error::{Error, Result};
use std::borrow::Borrow;
use std::fmt;

/// A borrowed canonical path.
///
/// Canonical form starts with `/`, has no empty segments and no trailing
/// slash; the root is `/`.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Path<'a>(&'a str);

/// An owned canonical path.
#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct PathBuf(String);

impl<'a> Path<'a> {
    /// Validates `s` and returns it as a canonical path.
    ///
    /// Rejects empty input, input without a leading `/`, and empty
    /// segments (`//`). A single trailing slash is stripped; the root
    /// path `/` is returned as is.
    pub fn normalize(s: &'a str) -> Result<Self> {
        if s.is_empty() || !s.starts_with('/') {
            return Err(Error::InvalidPath(s.into()));
        }
        if s == "/" {
            return Ok(Self("/"));
        }
        let s = s.strip_suffix('/').unwrap_or(s);
        if s == "/" || s[1..].split('/').any(str::is_empty) {
            return Err(Error::InvalidPath(s.into()));
        }
        Ok(Self(s))
    }

    /// Returns true for the root path.
    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Yields each segment without separators; the root yields nothing.
    pub fn segments(&self) -> impl Iterator<Item = &'a str> {
        let rest = if self.0 == "/" { "" } else { &self.0[1..] };
        rest.split('/').filter(|s| !s.is_empty())
    }

    /// The string every child of this path starts with: `self + "/"`,
    /// or `"/"` for the root.
    pub fn child_prefix(&self) -> String {
        if self.is_root() {
            "/".into()
        } else {
            format!("{}/", self.0)
        }
    }

    /// Returns the parent path, or `None` for the root.
    pub fn parent(&self) -> Option<Path<'a>> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/').unwrap() {
            0 => Some(Path("/")),
            n => Some(Path(&self.0[..n])),
        }
    }

    /// Returns the last segment, or `None` for the root.
    pub fn last(&self) -> Option<&'a str> {
        self.segments().last()
    }

    /// Returns true if `other` lies strictly below this path.
    pub fn is_ancestor_of(&self, other: Path) -> bool {
        other.0.len() > self.0.len() && other.0.starts_with(&self.child_prefix())
    }

    /// Appends a segment.
    pub fn join(&self, segment: &str) -> PathBuf {
        let mut buf = self.to_owned();
        buf.push(segment);
        buf
    }

    /// Returns an owned copy.
    pub fn to_owned(&self) -> PathBuf {
        PathBuf(self.0.to_string())
    }

    /// The canonical string form.
    pub fn as_str(&self) -> &'a str {
        self.0
    }
}

impl PathBuf {
    /// The root path.
    pub fn root() -> Self {
        Self("/".into())
    }

    /// Validates and takes ownership of `s`.
    pub fn parse(s: &str) -> Result<Self> {
        Ok(Path::normalize(s)?.to_owned())
    }

    /// Appends a segment in place.
    pub fn push(&mut self, segment: &str) {
        if self.0 != "/" {
            self.0.push('/');
        }
        self.0.push_str(segment);
    }

    /// Returns a borrowed path.
    pub fn as_path(&self) -> Path<'_> {
        Path(&self.0)
    }

    /// The canonical string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Path<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Path<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for PathBuf {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.as_path().fmt(f)
    }
}

impl fmt::Display for PathBuf {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Borrow<str> for PathBuf {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for PathBuf {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

const INDEX_WIDTH: usize = 10;

/// True for segments that address array elements: all ASCII digits, at
/// most ten of them, no leading zero except `"0"` itself.
pub(crate) fn is_index_segment(seg: &str) -> bool {
    !seg.is_empty()
        && seg.len() <= INDEX_WIDTH
        && seg.bytes().all(|b| b.is_ascii_digit())
        && (seg == "0" || !seg.starts_with('0'))
}

/// Encodes a path into its storage key. Index-shaped segments are
/// zero-padded to a fixed width so that numeric order and lexicographic
/// order agree.
pub(crate) fn encode_key(path: Path) -> String {
    if path.is_root() {
        return "/".into();
    }
    let mut key = String::with_capacity(path.as_str().len());
    for seg in path.segments() {
        key.push('/');
        if is_index_segment(seg) {
            for _ in seg.len()..INDEX_WIDTH {
                key.push('0');
            }
        }
        key.push_str(seg);
    }
    key
}

/// Reverses [`encode_key`] for a single segment.
pub(crate) fn decode_key_segment(seg: &str) -> &str {
    if seg.len() == INDEX_WIDTH && seg.bytes().all(|b| b.is_ascii_digit()) {
        let stripped = seg.trim_start_matches('0');
        if stripped.is_empty() {
            "0"
        } else {
            stripped
        }
    } else {
        seg
    }
}

/// Formats an array index as a storage key segment.
pub(crate) fn index_segment(i: usize) -> String {
    format!("{:0width$}", i, width = INDEX_WIDTH)
}
