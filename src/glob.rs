//! Compiled path matchers for ignore rules.
//!
//! No glob syntax lives here: callers compile their glob dialect to a regex
//! externally and hand the regex string over. A path is ignored when the
//! whole path matches.

use std::hash::{Hash, Hasher};
use std::path::Path;

use regex::Regex;

use crate::error::{Error, Result};

/// A compiled ignore pattern. Equality and hashing use the raw pattern so
/// that watcher identity stays structural.
#[derive(Debug, Clone)]
pub struct Glob {
    raw: String,
    regex: Regex,
}

impl Glob {
    /// Compile a raw regex string. Anchored to the whole path, matching the
    /// exact-match contract of the ignore table.
    pub fn new(raw: &str) -> Result<Self> {
        let regex = Regex::new(&format!("^(?:{raw})$"))
            .map_err(|err| Error::config(format!("invalid ignore glob {raw:?}: {err}")))?;
        Ok(Self {
            raw: raw.to_string(),
            regex,
        })
    }

    /// Whether the full `path` matches this pattern.
    pub fn matches(&self, path: &Path) -> bool {
        self.regex.is_match(&path.to_string_lossy())
    }

    /// The raw pattern this matcher was compiled from.
    pub fn raw(&self) -> &str {
        &self.raw
    }
}

impl PartialEq for Glob {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for Glob {}

impl Hash for Glob {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}
