//! in-memory directory tree assembled before it is written to the store

use std::collections::BTreeMap;

use crate::checksum::Checksum;
use crate::error::{Error, Result};
use crate::types::validate_entry_name;

/// a borrowed entry of a mutable tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MtreeEntry<'a> {
    File(&'a Checksum),
    Dir(&'a MutableTree),
}

/// mutable staging tree
///
/// leaves reference file objects already written in the current
/// transaction; directories own their children. names are unique per
/// level across files and directories. entries are kept sorted so the
/// written tree does not depend on insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutableTree {
    meta: Option<Checksum>,
    files: BTreeMap<String, Checksum>,
    subdirs: BTreeMap<String, MutableTree>,
}

fn check_name(name: &str) -> Result<()> {
    validate_entry_name(name).map_err(Error::InvalidEntryName)
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty() && *c != ".")
}

impl MutableTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// checksum of this directory's dirmeta object, if set
    pub fn metadata(&self) -> Option<&Checksum> {
        self.meta.as_ref()
    }

    pub fn set_metadata(&mut self, meta: Checksum) {
        self.meta = Some(meta);
    }

    pub fn files(&self) -> &BTreeMap<String, Checksum> {
        &self.files
    }

    pub fn subdirs(&self) -> &BTreeMap<String, MutableTree> {
        &self.subdirs
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.subdirs.is_empty()
    }

    /// number of direct children
    pub fn len(&self) -> usize {
        self.files.len() + self.subdirs.len()
    }

    /// insert or replace a file entry; a directory of that name is a conflict
    pub fn replace_file(&mut self, name: &str, checksum: Checksum) -> Result<()> {
        check_name(name)?;
        if self.subdirs.contains_key(name) {
            return Err(Error::EntryConflict {
                name: name.to_string(),
                existing: "directory",
                incoming: "file",
            });
        }
        self.files.insert(name.to_string(), checksum);
        Ok(())
    }

    /// get or create the named subdirectory
    pub fn ensure_dir(&mut self, name: &str) -> Result<&mut MutableTree> {
        check_name(name)?;
        if self.files.contains_key(name) {
            return Err(Error::EntryConflict {
                name: name.to_string(),
                existing: "file",
                incoming: "directory",
            });
        }
        Ok(self.subdirs.entry(name.to_string()).or_default())
    }

    /// like `ensure_dir`, but a file of the same name is replaced
    pub(crate) fn replace_with_dir(&mut self, name: &str) -> Result<&mut MutableTree> {
        check_name(name)?;
        self.files.remove(name);
        Ok(self.subdirs.entry(name.to_string()).or_default())
    }

    /// like `replace_file`, but a directory of the same name is dropped
    pub(crate) fn replace_dir_with_file(&mut self, name: &str, checksum: Checksum) -> Result<()> {
        check_name(name)?;
        self.subdirs.remove(name);
        self.files.insert(name.to_string(), checksum);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<MtreeEntry<'_>> {
        if let Some(checksum) = self.files.get(name) {
            return Some(MtreeEntry::File(checksum));
        }
        self.subdirs.get(name).map(MtreeEntry::Dir)
    }

    /// remove an entry of either kind
    pub fn remove(&mut self, name: &str, allow_noent: bool) -> Result<()> {
        let removed = self.files.remove(name).is_some() || self.subdirs.remove(name).is_some();
        if !removed && !allow_noent {
            return Err(Error::PathNotFound(name.to_string()));
        }
        Ok(())
    }

    /// keep only the entries whose name satisfies `keep`
    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.files.retain(|name, _| keep(name));
        self.subdirs.retain(|name, _| keep(name));
    }

    /// drop all children; the directory metadata stays
    pub fn clear(&mut self) {
        self.files.clear();
        self.subdirs.clear();
    }

    /// descend along a slash separated path of directories
    pub fn walk(&self, path: &str) -> Result<&MutableTree> {
        let mut current = self;
        for component in split_path(path) {
            current = current
                .subdirs
                .get(component)
                .ok_or_else(|| Error::PathNotFound(path.to_string()))?;
        }
        Ok(current)
    }

    pub fn walk_mut(&mut self, path: &str) -> Result<&mut MutableTree> {
        let mut current = self;
        for component in split_path(path) {
            current = current
                .subdirs
                .get_mut(component)
                .ok_or_else(|| Error::PathNotFound(path.to_string()))?;
        }
        Ok(current)
    }

    /// descend along `path`, creating missing directories
    pub fn ensure_path(&mut self, path: &str) -> Result<&mut MutableTree> {
        let mut current = self;
        for component in split_path(path) {
            current = current.ensure_dir(component)?;
        }
        Ok(current)
    }

    /// checksum of the file at a slash separated path
    pub fn file_at(&self, path: &str) -> Option<Checksum> {
        let (dir, name) = match path.trim_end_matches('/').rsplit_once('/') {
            Some((dir, name)) => (dir, name),
            None => ("", path),
        };
        self.walk(dir).ok()?.files.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sum(s: &str) -> Checksum {
        Checksum::of(s.as_bytes())
    }

    #[test]
    fn test_file_and_dir_names_conflict() {
        let mut tree = MutableTree::new();
        tree.replace_file("a", sum("a")).unwrap();
        tree.ensure_dir("d").unwrap();

        assert!(matches!(
            tree.ensure_dir("a"),
            Err(Error::EntryConflict { existing: "file", .. })
        ));
        assert!(matches!(
            tree.replace_file("d", sum("d")),
            Err(Error::EntryConflict { existing: "directory", .. })
        ));
    }

    #[test]
    fn test_replace_file_overwrites() {
        let mut tree = MutableTree::new();
        tree.replace_file("a", sum("1")).unwrap();
        tree.replace_file("a", sum("2")).unwrap();

        assert_eq!(tree.len(), 1);
        assert_eq!(tree.lookup("a"), Some(MtreeEntry::File(&sum("2"))));
    }

    #[test]
    fn test_rejects_bad_names() {
        let mut tree = MutableTree::new();
        assert!(matches!(
            tree.replace_file("a/b", sum("x")),
            Err(Error::InvalidEntryName(_))
        ));
        assert!(tree.ensure_dir("..").is_err());
    }

    #[test]
    fn test_ensure_path_and_walk() {
        let mut tree = MutableTree::new();
        tree.ensure_path("usr/lib/os")
            .unwrap()
            .replace_file("release", sum("r"))
            .unwrap();

        assert!(tree.walk("/usr/lib").is_ok());
        assert_eq!(tree.file_at("usr/lib/os/release"), Some(sum("r")));
        assert_eq!(tree.file_at("usr/lib/os/missing"), None);
        assert!(matches!(tree.walk("usr/share"), Err(Error::PathNotFound(_))));
    }

    #[test]
    fn test_remove() {
        let mut tree = MutableTree::new();
        tree.replace_file("f", sum("f")).unwrap();
        tree.ensure_dir("d").unwrap();

        tree.remove("f", false).unwrap();
        tree.remove("d", false).unwrap();
        assert!(tree.is_empty());
        assert!(matches!(tree.remove("f", false), Err(Error::PathNotFound(_))));
        tree.remove("f", true).unwrap();
    }

    #[test]
    fn test_clear_keeps_metadata() {
        let mut tree = MutableTree::new();
        tree.set_metadata(sum("meta"));
        tree.replace_file("f", sum("f")).unwrap();

        tree.clear();
        assert!(tree.is_empty());
        assert_eq!(tree.metadata(), Some(&sum("meta")));
    }

    #[test]
    fn test_retain() {
        let mut tree = MutableTree::new();
        tree.replace_file("keep", sum("k")).unwrap();
        tree.replace_file("drop", sum("d")).unwrap();
        tree.ensure_dir("dropdir").unwrap();

        tree.retain(|name| name == "keep");
        assert_eq!(tree.len(), 1);
        assert!(tree.lookup("keep").is_some());
    }
}
