use std::fs::{self, Metadata};
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use nix::libc;
use tracing::warn;

use crate::error::{Error, IoResultExt, Result};
use crate::types::Xattr;

/// file type as seen by the commit pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    /// device nodes, fifos and sockets; not representable as objects
    Special,
}

impl FileKind {
    pub fn from_metadata(meta: &Metadata) -> Self {
        let ft = meta.file_type();
        if ft.is_file() {
            FileKind::Regular
        } else if ft.is_dir() {
            FileKind::Directory
        } else if ft.is_symlink() {
            FileKind::Symlink
        } else {
            FileKind::Special
        }
    }
}

/// metadata for a filesystem entry
#[derive(Debug, Clone)]
pub struct FileMetadata {
    pub kind: FileKind,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub size: u64,
    /// inode number (for hardlink detection)
    pub ino: u64,
    /// device id (for hardlink detection)
    pub dev: u64,
    pub nlink: u64,
}

impl FileMetadata {
    /// read metadata from path (does not follow symlinks)
    pub fn from_path(path: &Path) -> Result<Self> {
        let meta = fs::symlink_metadata(path).with_path(path)?;
        Ok(Self::from_std_metadata(&meta))
    }

    pub fn from_std_metadata(meta: &Metadata) -> Self {
        Self {
            kind: FileKind::from_metadata(meta),
            uid: meta.uid(),
            gid: meta.gid(),
            mode: meta.mode(),
            size: meta.len(),
            ino: meta.ino(),
            dev: meta.dev(),
            nlink: meta.nlink(),
        }
    }

    /// check if this could be a hardlink (nlink > 1 for regular files)
    pub fn could_be_hardlink(&self) -> bool {
        self.kind == FileKind::Regular && self.nlink > 1
    }
}

/// read all extended attributes from a path, sorted by name
pub fn read_xattrs(path: &Path) -> Result<Vec<Xattr>> {
    let mut xattrs = Vec::new();

    let names: Vec<String> = match xattr::list(path) {
        Ok(iter) => iter.map(|n| n.to_string_lossy().into_owned()).collect(),
        Err(e) => {
            // no xattr support on this filesystem is not an error
            if e.raw_os_error() == Some(libc::ENOTSUP)
                || e.raw_os_error() == Some(libc::ENODATA)
                || e.raw_os_error() == Some(libc::EOPNOTSUPP)
            {
                return Ok(vec![]);
            }
            return Err(Error::Xattr {
                path: path.to_path_buf(),
                message: format!("failed to list: {}", e),
            });
        }
    };

    for name in names {
        match xattr::get(path, &name) {
            Ok(Some(value)) => xattrs.push(Xattr::new(name, value)),
            // removed between list and get
            Ok(None) => {}
            Err(e) => {
                if e.raw_os_error() != Some(libc::ENODATA) {
                    warn!(xattr = %name, path = %path.display(), error = %e, "skipping unreadable xattr");
                }
            }
        }
    }

    xattrs.sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));

    Ok(xattrs)
}

/// read symlink target
pub fn read_symlink_target(path: &Path) -> Result<String> {
    let target = fs::read_link(path).with_path(path)?;
    Ok(target.to_string_lossy().into_owned())
}
