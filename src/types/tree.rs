use serde::{Deserialize, Serialize};

use crate::checksum::Checksum;
use crate::error::{Error, Result};
use crate::types::{Xattr, S_IFDIR, S_IFMT};

/// a file entry in a directory tree
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub checksum: Checksum,
}

/// a subdirectory entry: content tree plus metadata object
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub tree: Checksum,
    pub meta: Checksum,
}

/// immutable directory listing, files and subdirectories each sorted by name
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirTree {
    pub files: Vec<FileEntry>,
    pub dirs: Vec<DirEntry>,
}

impl DirTree {
    /// build a tree, sorting entries and rejecting invalid or duplicate names
    pub fn new(mut files: Vec<FileEntry>, mut dirs: Vec<DirEntry>) -> Result<Self> {
        files.sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));
        dirs.sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));
        let tree = Self { files, dirs };
        tree.check_names().map_err(Error::InvalidEntryName)?;
        Ok(tree)
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.dirs.is_empty()
    }

    pub fn file(&self, name: &str) -> Option<&FileEntry> {
        self.files
            .binary_search_by(|e| e.name.as_bytes().cmp(name.as_bytes()))
            .ok()
            .map(|i| &self.files[i])
    }

    pub fn dir(&self, name: &str) -> Option<&DirEntry> {
        self.dirs
            .binary_search_by(|e| e.name.as_bytes().cmp(name.as_bytes()))
            .ok()
            .map(|i| &self.dirs[i])
    }

    /// structural check applied to every tree loaded from the store
    pub fn validate(&self) -> std::result::Result<(), String> {
        self.check_names()
    }

    fn check_names(&self) -> std::result::Result<(), String> {
        for name in self.files.iter().map(|f| &f.name).chain(self.dirs.iter().map(|d| &d.name)) {
            validate_entry_name(name)?;
        }
        for w in self.files.windows(2) {
            if w[0].name.as_bytes() >= w[1].name.as_bytes() {
                return Err(format!("files not sorted or duplicated at {}", w[1].name));
            }
        }
        for w in self.dirs.windows(2) {
            if w[0].name.as_bytes() >= w[1].name.as_bytes() {
                return Err(format!("dirs not sorted or duplicated at {}", w[1].name));
            }
        }
        for d in &self.dirs {
            if self.file(&d.name).is_some() {
                return Err(format!("name is both file and directory: {}", d.name));
            }
        }
        Ok(())
    }
}

/// validate a single path component
pub fn validate_entry_name(name: &str) -> std::result::Result<(), String> {
    if name.is_empty() {
        return Err("empty name".to_string());
    }
    if name.contains('/') {
        return Err(format!("name contains '/': {}", name));
    }
    if name.contains('\0') {
        return Err(format!("name contains null byte: {}", name));
    }
    if name == "." || name == ".." {
        return Err(format!("reserved name: {}", name));
    }
    Ok(())
}

/// ownership, mode and xattrs of a directory
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirMeta {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub xattrs: Vec<Xattr>,
}

impl DirMeta {
    pub fn new(uid: u32, gid: u32, mode: u32, mut xattrs: Vec<Xattr>) -> Self {
        xattrs.sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));
        Self {
            uid,
            gid,
            mode: S_IFDIR | (mode & 0o7777),
            xattrs,
        }
    }

    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.mode & S_IFMT != S_IFDIR {
            return Err(format!("mode {:o} is not a directory", self.mode));
        }
        for w in self.xattrs.windows(2) {
            if w[0].name.as_bytes() >= w[1].name.as_bytes() {
                return Err(format!("xattrs not sorted at {}", w[1].name));
            }
        }
        Ok(())
    }
}

impl Default for DirMeta {
    fn default() -> Self {
        Self::new(0, 0, 0o755, vec![])
    }
}
