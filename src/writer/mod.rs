//! populate a mutable tree from directories, archives and existing commits

mod archive;
mod dir;
mod overlay;

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io;

pub use archive::{write_archive, write_archive_from_reader, write_layer};
pub use dir::write_directory;
pub use overlay::write_ref;

use crate::checksum::Checksum;
use crate::error::{IoResultExt, Result};
use crate::filter::{CommitFilter, FileInfo, FilterResult};
use crate::fs::DevInoCache;
use crate::mtree::MutableTree;
use crate::store::{self, StagedFile};
use crate::txn::Transaction;
use crate::types::{DirEntry, DirMeta, DirTree, FileEntry, ObjectType, Xattr, S_IFMT};

/// on-disk and logical size of one file object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectSizes {
    pub archived: u64,
    pub unpacked: u64,
}

/// per-commit settings shared by every tree writer
///
/// owns the state that must live for exactly one commit: the hardlink
/// cache and the size table.
#[derive(Default)]
pub struct CommitModifier<'a> {
    filter: Option<&'a mut dyn CommitFilter>,
    skip_xattrs: bool,
    devino: DevInoCache,
    sizes: Option<BTreeMap<Checksum, ObjectSizes>>,
}

impl<'a> CommitModifier<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, filter: &'a mut dyn CommitFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn skip_xattrs(mut self, skip: bool) -> Self {
        self.skip_xattrs = skip;
        self
    }

    pub fn generate_sizes(mut self, generate: bool) -> Self {
        self.sizes = generate.then(BTreeMap::new);
        self
    }

    pub fn skips_xattrs(&self) -> bool {
        self.skip_xattrs
    }

    /// run the filter; the file type bits cannot be changed by it
    pub(crate) fn apply(&mut self, path: &str, info: &mut FileInfo) -> FilterResult {
        let type_bits = info.mode & S_IFMT;
        let result = match self.filter.as_mut() {
            Some(filter) => filter.filter(path, info),
            None => FilterResult::Allow,
        };
        info.mode = type_bits | (info.mode & 0o7777);
        result
    }

    pub(crate) fn xattrs(&self, xattrs: Vec<Xattr>) -> Vec<Xattr> {
        if self.skip_xattrs {
            Vec::new()
        } else {
            xattrs
        }
    }

    pub(crate) fn devino(&mut self) -> &mut DevInoCache {
        &mut self.devino
    }

    /// note a file object referenced by the tree being built
    pub(crate) fn record_file(
        &mut self,
        txn: &Transaction<'_>,
        checksum: &Checksum,
        staged: Option<&StagedFile>,
    ) -> Result<()> {
        let Some(sizes) = self.sizes.as_mut() else {
            return Ok(());
        };
        if sizes.contains_key(checksum) {
            return Ok(());
        }

        let entry = match staged {
            Some(s) if s.written => ObjectSizes {
                archived: s.stored,
                unpacked: s.unpacked,
            },
            _ => {
                let repo = txn.repo();
                let archived = store::object_size(repo, checksum, ObjectType::File)?;
                let mut obj = store::open_file(repo, checksum)?;
                let unpacked = io::copy(&mut obj.content, &mut io::sink())
                    .with_path(store::content_path(repo, checksum))?;
                ObjectSizes { archived, unpacked }
            }
        };
        sizes.insert(*checksum, entry);
        Ok(())
    }

    pub fn sizes(&self) -> Option<&BTreeMap<Checksum, ObjectSizes>> {
        self.sizes.as_ref()
    }

    /// size table as commit metadata: one `checksum archived unpacked` line per object
    pub fn sizes_metadata(&self) -> Option<String> {
        let sizes = self.sizes.as_ref()?;
        let mut out = String::new();
        for (checksum, s) in sizes {
            let _ = writeln!(out, "{} {} {}", checksum, s.archived, s.unpacked);
        }
        Some(out)
    }
}

/// join a rooted parent path and a child name
pub(crate) fn child_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// write a mutable tree into the transaction, returning (tree, meta)
///
/// directories without metadata get the default dirmeta.
pub fn write_mtree(txn: &mut Transaction<'_>, mtree: &MutableTree) -> Result<(Checksum, Checksum)> {
    let mut dirs = Vec::with_capacity(mtree.subdirs().len());
    for (name, sub) in mtree.subdirs() {
        let (tree, meta) = write_mtree(txn, sub)?;
        dirs.push(DirEntry {
            name: name.clone(),
            tree,
            meta,
        });
    }
    let files = mtree
        .files()
        .iter()
        .map(|(name, checksum)| FileEntry {
            name: name.clone(),
            checksum: *checksum,
        })
        .collect();

    let tree = txn.write_dirtree(&DirTree::new(files, dirs)?)?;
    let meta = match mtree.metadata() {
        Some(m) => *m,
        None => txn.write_dirmeta(&DirMeta::default())?,
    };
    Ok((tree, meta))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RepoMode;
    use crate::fs::FileKind;
    use crate::repo::{InitOptions, Repo};
    use crate::types::FileHeader;
    use tempfile::{tempdir, TempDir};

    fn test_repo() -> (TempDir, Repo) {
        let dir = tempdir().unwrap();
        let repo = Repo::init(
            &dir.path().join("repo"),
            InitOptions {
                mode: RepoMode::BareUser,
            },
        )
        .unwrap();
        (dir, repo)
    }

    #[test]
    fn test_write_mtree_is_order_independent() {
        let (_dir, repo) = test_repo();
        let mut txn = repo.prepare_transaction().unwrap();
        let a = txn
            .write_file_bytes(&FileHeader::regular(0, 0, 0o644), b"a")
            .unwrap()
            .checksum;
        let b = txn
            .write_file_bytes(&FileHeader::regular(0, 0, 0o644), b"b")
            .unwrap()
            .checksum;

        let mut first = MutableTree::new();
        first.replace_file("a", a).unwrap();
        first.ensure_dir("d").unwrap().replace_file("b", b).unwrap();

        let mut second = MutableTree::new();
        second.ensure_dir("d").unwrap().replace_file("b", b).unwrap();
        second.replace_file("a", a).unwrap();

        assert_eq!(
            write_mtree(&mut txn, &first).unwrap(),
            write_mtree(&mut txn, &second).unwrap()
        );
        txn.commit().unwrap();
    }

    #[test]
    fn test_empty_tree() {
        let (_dir, repo) = test_repo();
        let mut txn = repo.prepare_transaction().unwrap();
        let (tree, meta) = write_mtree(&mut txn, &MutableTree::new()).unwrap();
        txn.commit().unwrap();

        assert!(store::load_dirtree(&repo, &tree).unwrap().is_empty());
        assert_eq!(store::load_dirmeta(&repo, &meta).unwrap(), DirMeta::default());
    }

    #[test]
    fn test_filter_cannot_change_type() {
        let mut filter = |_: &str, info: &mut FileInfo| {
            info.mode = 0o040700;
            FilterResult::Allow
        };
        let mut modifier = CommitModifier::new().with_filter(&mut filter);
        let mut info = FileInfo {
            kind: FileKind::Regular,
            uid: 0,
            gid: 0,
            mode: 0o100644,
            size: 0,
        };
        modifier.apply("/f", &mut info);
        assert_eq!(info.mode, 0o100700);
    }

    #[test]
    fn test_sizes_metadata() {
        let (_dir, repo) = test_repo();
        let mut txn = repo.prepare_transaction().unwrap();
        let staged = txn
            .write_file_bytes(&FileHeader::regular(0, 0, 0o644), b"twelve bytes")
            .unwrap();

        let mut modifier = CommitModifier::new().generate_sizes(true);
        modifier.record_file(&txn, &staged.checksum, Some(&staged)).unwrap();

        let text = modifier.sizes_metadata().unwrap();
        let fields: Vec<&str> = text.trim().split(' ').collect();
        assert_eq!(fields[0], staged.checksum.to_hex());
        assert_eq!(fields[2], "12");
        assert!(CommitModifier::new().sizes_metadata().is_none());
    }
}
