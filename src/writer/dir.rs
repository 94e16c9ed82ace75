use std::fs::{self, File};
use std::io;
use std::path::Path;

use tracing::debug;

use crate::cancel::{self, Cancellable};
use crate::error::{Error, IoResultExt, Result};
use crate::filter::{FileInfo, FilterResult};
use crate::fs::{read_symlink_target, read_xattrs, FileKind, FileMetadata};
use crate::mtree::MutableTree;
use crate::txn::Transaction;
use crate::types::{DirMeta, FileHeader, SYMLINK_MODE};

use super::{child_path, CommitModifier};

fn file_info(meta: &FileMetadata) -> FileInfo {
    FileInfo {
        kind: meta.kind,
        uid: meta.uid,
        gid: meta.gid,
        mode: meta.mode,
        size: meta.size,
    }
}

fn stat(path: &Path) -> Result<FileMetadata> {
    match fs::symlink_metadata(path) {
        Ok(m) => Ok(FileMetadata::from_std_metadata(&m)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            Err(Error::PathNotFound(path.display().to_string()))
        }
        Err(e) => Err(Error::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// walk a directory on disk into `mtree`
///
/// the directory itself becomes the root of `mtree` and is presented to
/// the filter as `/`. file objects are staged in `txn` as they are found.
pub fn write_directory(
    txn: &mut Transaction<'_>,
    mtree: &mut MutableTree,
    path: &Path,
    modifier: &mut CommitModifier<'_>,
    cancel: Option<&Cancellable>,
) -> Result<()> {
    let meta = stat(path)?;
    if meta.kind != FileKind::Directory {
        return Err(Error::InvalidArgument(format!(
            "not a directory: {}",
            path.display()
        )));
    }

    let mut info = file_info(&meta);
    if modifier.apply("/", &mut info) == FilterResult::Skip {
        debug!(path = %path.display(), "root skipped by filter");
        return Ok(());
    }
    let xattrs = modifier.xattrs(read_xattrs(path)?);
    let dirmeta = txn.write_dirmeta(&DirMeta::new(info.uid, info.gid, info.mode, xattrs))?;
    mtree.set_metadata(dirmeta);

    write_contents(txn, mtree, path, "/", modifier, cancel)
}

fn write_contents(
    txn: &mut Transaction<'_>,
    mtree: &mut MutableTree,
    dir: &Path,
    rel: &str,
    modifier: &mut CommitModifier<'_>,
    cancel: Option<&Cancellable>,
) -> Result<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)
        .with_path(dir)?
        .collect::<io::Result<Vec<_>>>()
        .with_path(dir)?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        cancel::check(cancel)?;

        let path = entry.path();
        let name = entry
            .file_name()
            .into_string()
            .map_err(|n| Error::InvalidEntryName(n.to_string_lossy().into_owned()))?;
        let child_rel = child_path(rel, &name);

        let meta = FileMetadata::from_path(&path)?;
        let mut info = file_info(&meta);
        if modifier.apply(&child_rel, &mut info) == FilterResult::Skip {
            debug!(path = %child_rel, "skipped by filter");
            continue;
        }

        match meta.kind {
            FileKind::Directory => {
                let xattrs = modifier.xattrs(read_xattrs(&path)?);
                let dirmeta =
                    txn.write_dirmeta(&DirMeta::new(info.uid, info.gid, info.mode, xattrs))?;
                let sub = mtree.ensure_dir(&name)?;
                sub.set_metadata(dirmeta);
                write_contents(txn, sub, &path, &child_rel, modifier, cancel)?;
            }
            FileKind::Regular => {
                let xattrs = modifier.xattrs(read_xattrs(&path)?);
                let mut header = FileHeader {
                    uid: info.uid,
                    gid: info.gid,
                    mode: info.mode,
                    xattrs,
                };
                header.normalize();

                if meta.could_be_hardlink() {
                    if let Some(checksum) = modifier.devino().lookup(meta.dev, meta.ino, &header) {
                        debug!(path = %child_rel, "reusing object of hardlinked inode");
                        mtree.replace_file(&name, checksum)?;
                        continue;
                    }
                }

                let mut file = File::open(&path).with_path(&path)?;
                let staged = txn.write_file(&header, &mut file)?;
                modifier.record_file(txn, &staged.checksum, Some(&staged))?;
                if meta.could_be_hardlink() {
                    modifier
                        .devino()
                        .insert(meta.dev, meta.ino, header, staged.checksum);
                }
                mtree.replace_file(&name, staged.checksum)?;
            }
            FileKind::Symlink => {
                let target = read_symlink_target(&path)?;
                let header = FileHeader {
                    uid: info.uid,
                    gid: info.gid,
                    mode: SYMLINK_MODE,
                    xattrs: modifier.xattrs(read_xattrs(&path)?),
                };
                let staged = txn.write_file_bytes(&header, target.as_bytes())?;
                modifier.record_file(txn, &staged.checksum, Some(&staged))?;
                mtree.replace_file(&name, staged.checksum)?;
            }
            FileKind::Special => return Err(Error::UnsupportedFileType(path)),
        }
    }

    Ok(())
}
