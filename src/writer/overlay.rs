use tracing::debug;

use crate::cancel::{self, Cancellable};
use crate::checksum::Checksum;
use crate::error::Result;
use crate::filter::{FileInfo, FilterResult};
use crate::fs::FileKind;
use crate::mtree::MutableTree;
use crate::refs::resolve_ref;
use crate::store;
use crate::txn::Transaction;
use crate::types::{DirMeta, FileHeader};

use super::{child_path, CommitModifier};

/// overlay the tree of an existing commit onto `mtree`
///
/// objects are reused as they are unless the filter changes an entry's
/// ownership or mode, or xattrs are being dropped; then a rewritten copy
/// is stored.
pub fn write_ref(
    txn: &mut Transaction<'_>,
    mtree: &mut MutableTree,
    rev: &str,
    modifier: &mut CommitModifier<'_>,
    cancel: Option<&Cancellable>,
) -> Result<()> {
    let repo = txn.repo();
    let checksum = resolve_ref(repo, rev)?;
    let (commit, _) = store::load_commit(repo, &checksum)?;
    debug!(rev, commit = %checksum, "overlaying commit tree");

    let Some(meta) = rewrite_dirmeta(txn, &commit.root_meta, "/", modifier)? else {
        return Ok(());
    };
    mtree.set_metadata(meta);
    overlay_tree(txn, mtree, &commit.root_tree, "/", modifier, cancel)
}

fn overlay_tree(
    txn: &mut Transaction<'_>,
    mtree: &mut MutableTree,
    tree: &Checksum,
    rel: &str,
    modifier: &mut CommitModifier<'_>,
    cancel: Option<&Cancellable>,
) -> Result<()> {
    let dirtree = store::load_dirtree(txn.repo(), tree)?;

    for entry in &dirtree.files {
        cancel::check(cancel)?;
        let path = child_path(rel, &entry.name);
        if let Some(checksum) = rewrite_file(txn, &entry.checksum, &path, modifier)? {
            mtree.replace_file(&entry.name, checksum)?;
        }
    }

    for entry in &dirtree.dirs {
        cancel::check(cancel)?;
        let path = child_path(rel, &entry.name);
        let Some(meta) = rewrite_dirmeta(txn, &entry.meta, &path, modifier)? else {
            continue;
        };
        let sub = mtree.ensure_dir(&entry.name)?;
        sub.set_metadata(meta);
        overlay_tree(txn, sub, &entry.tree, &path, modifier, cancel)?;
    }

    Ok(())
}

/// filter a stored file object; `None` if it is skipped
fn rewrite_file(
    txn: &mut Transaction<'_>,
    checksum: &Checksum,
    path: &str,
    modifier: &mut CommitModifier<'_>,
) -> Result<Option<Checksum>> {
    let repo = txn.repo();
    let header = store::load_file_header(repo, checksum)?;
    let original = FileInfo {
        kind: if header.is_symlink() {
            FileKind::Symlink
        } else {
            FileKind::Regular
        },
        uid: header.uid,
        gid: header.gid,
        mode: header.mode,
        size: 0,
    };
    let mut info = original.clone();
    if modifier.apply(path, &mut info) == FilterResult::Skip {
        debug!(path, "skipped by filter");
        return Ok(None);
    }

    if info == original && (header.xattrs.is_empty() || !modifier.skips_xattrs()) {
        modifier.record_file(txn, checksum, None)?;
        return Ok(Some(*checksum));
    }

    let new_header = FileHeader {
        uid: info.uid,
        gid: info.gid,
        mode: info.mode,
        xattrs: modifier.xattrs(header.xattrs),
    };
    let mut obj = store::open_file(repo, checksum)?;
    let staged = txn.write_file(&new_header, &mut obj.content)?;
    modifier.record_file(txn, &staged.checksum, Some(&staged))?;
    debug!(path, from = %checksum, to = %staged.checksum, "rewrote file object");
    Ok(Some(staged.checksum))
}

/// filter a stored dirmeta object; `None` if the directory is skipped
fn rewrite_dirmeta(
    txn: &mut Transaction<'_>,
    checksum: &Checksum,
    path: &str,
    modifier: &mut CommitModifier<'_>,
) -> Result<Option<Checksum>> {
    let meta = store::load_dirmeta(txn.repo(), checksum)?;
    let original = FileInfo {
        kind: FileKind::Directory,
        uid: meta.uid,
        gid: meta.gid,
        mode: meta.mode,
        size: 0,
    };
    let mut info = original.clone();
    if modifier.apply(path, &mut info) == FilterResult::Skip {
        debug!(path, "skipped by filter");
        return Ok(None);
    }

    if info == original && (meta.xattrs.is_empty() || !modifier.skips_xattrs()) {
        return Ok(Some(*checksum));
    }
    let xattrs = modifier.xattrs(meta.xattrs);
    Ok(Some(txn.write_dirmeta(&DirMeta::new(
        info.uid, info.gid, info.mode, xattrs,
    ))?))
}
