//! per-entry commit policy: skip entries and rewrite ownership or mode

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use tracing::debug;

use crate::error::{Error, IoResultExt, Result};
use crate::fs::FileKind;
use crate::types::S_IFMT;

/// decision for one entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterResult {
    Allow,
    /// exclude the entry; for a directory, its whole subtree
    Skip,
}

/// what a filter sees of an entry, and may rewrite
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub kind: FileKind,
    pub uid: u32,
    pub gid: u32,
    /// includes the file type bits
    pub mode: u32,
    pub size: u64,
}

/// policy consulted for every entry while a tree is written
///
/// `path` is rooted at the tree being written: `/` for the root itself,
/// `/etc/passwd` for a file below it.
pub trait CommitFilter {
    fn filter(&mut self, path: &str, info: &mut FileInfo) -> FilterResult;
}

impl<F> CommitFilter for F
where
    F: FnMut(&str, &mut FileInfo) -> FilterResult,
{
    fn filter(&mut self, path: &str, info: &mut FileInfo) -> FilterResult {
        self(path, info)
    }
}

/// permission change requested for one path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeOverride {
    /// OR these bits into the mode
    Add(u32),
    /// replace the permission bits
    Set(u32),
}

/// filter built from commit options: fixed ownership, a stat-override
/// table and a skip list
///
/// every table entry is consumed when matched; whatever is left at the
/// end names a path that was never seen, reported by [`OverrideFilter::finish`].
#[derive(Debug, Default)]
pub struct OverrideFilter {
    owner_uid: Option<u32>,
    owner_gid: Option<u32>,
    mode_overrides: HashMap<String, ModeOverride>,
    skip_list: HashSet<String>,
}

fn rooted(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

/// parse stat-override lines: `+MODE PATH` adds bits, `=MODE PATH` sets
/// them, a bare `MODE PATH` adds. MODE is decimal.
pub fn parse_statoverride(content: &str) -> Result<HashMap<String, ModeOverride>> {
    let mut out = HashMap::new();
    for line in content.lines() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        let (mode_str, path) = line
            .split_once(' ')
            .ok_or_else(|| Error::InvalidArgument(format!("malformed statoverride line: {}", line)))?;

        let (ctor, digits): (fn(u32) -> ModeOverride, &str) =
            if let Some(rest) = mode_str.strip_prefix('=') {
                (ModeOverride::Set, rest)
            } else {
                (ModeOverride::Add, mode_str.strip_prefix('+').unwrap_or(mode_str))
            };
        let value: u32 = digits.parse().map_err(|_| {
            Error::InvalidArgument(format!("invalid mode in statoverride line: {}", line))
        })?;

        out.insert(rooted(path), ctor(value));
    }
    Ok(out)
}

/// parse a skip list: one path per line
pub fn parse_skip_list(content: &str) -> HashSet<String> {
    content
        .lines()
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.trim().is_empty())
        .map(rooted)
        .collect()
}

impl OverrideFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// force ownership of every entry
    pub fn with_owner(mut self, uid: Option<u32>, gid: Option<u32>) -> Self {
        self.owner_uid = uid;
        self.owner_gid = gid;
        self
    }

    pub fn with_mode_overrides(mut self, overrides: HashMap<String, ModeOverride>) -> Self {
        self.mode_overrides = overrides;
        self
    }

    pub fn with_skip_list(mut self, skip: HashSet<String>) -> Self {
        self.skip_list = skip;
        self
    }

    pub fn load_statoverride(self, path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).with_path(path)?;
        Ok(self.with_mode_overrides(parse_statoverride(&content)?))
    }

    pub fn load_skip_list(self, path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).with_path(path)?;
        Ok(self.with_skip_list(parse_skip_list(&content)))
    }

    /// true if this filter changes nothing and skips nothing
    pub fn is_noop(&self) -> bool {
        self.owner_uid.is_none()
            && self.owner_gid.is_none()
            && self.mode_overrides.is_empty()
            && self.skip_list.is_empty()
    }

    /// fail if any stat-override or skip-list entry was never matched
    pub fn finish(self) -> Result<()> {
        if !self.mode_overrides.is_empty() {
            let mut paths: Vec<String> = self.mode_overrides.into_keys().collect();
            paths.sort();
            return Err(Error::UnmatchedOverridePath {
                kind: "statoverride",
                paths,
            });
        }
        if !self.skip_list.is_empty() {
            let mut paths: Vec<String> = self.skip_list.into_iter().collect();
            paths.sort();
            return Err(Error::UnmatchedOverridePath {
                kind: "skip-list",
                paths,
            });
        }
        Ok(())
    }
}

impl CommitFilter for OverrideFilter {
    fn filter(&mut self, path: &str, info: &mut FileInfo) -> FilterResult {
        if let Some(uid) = self.owner_uid {
            info.uid = uid;
        }
        if let Some(gid) = self.owner_gid {
            info.gid = gid;
        }

        if let Some(over) = self.mode_overrides.remove(path) {
            info.mode = match over {
                ModeOverride::Add(bits) => info.mode | (bits & 0o7777),
                ModeOverride::Set(bits) => (info.mode & S_IFMT) | (bits & 0o7777),
            };
            debug!(path, mode = %format!("{:o}", info.mode), "applied stat override");
        }

        if self.skip_list.remove(path) {
            debug!(path, "skipped by skip list");
            return FilterResult::Skip;
        }

        FilterResult::Allow
    }
}
