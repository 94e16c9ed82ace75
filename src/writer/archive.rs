use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::cancel::{self, Cancellable};
use crate::checksum::Checksum;
use crate::error::{Error, IoResultExt, Result};
use crate::filter::{FileInfo, FilterResult};
use crate::fs::FileKind;
use crate::mtree::MutableTree;
use crate::txn::Transaction;
use crate::types::{DirMeta, FileHeader, Xattr, S_IFDIR, S_IFLNK, S_IFREG, SYMLINK_MODE};

use super::{child_path, CommitModifier};

const PAX_XATTR_PREFIX: &str = "SCHILY.xattr.";
const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

#[derive(Debug, Clone, Copy)]
struct ImportMode {
    autocreate_parents: bool,
    /// treat `.wh.` entries as OCI layer whiteouts
    whiteouts: bool,
}

fn malformed(origin: &Path, message: impl Into<String>) -> Error {
    Error::MalformedArchive {
        path: origin.to_path_buf(),
        message: message.into(),
    }
}

fn owner_id(origin: &Path, field: &str, id: io::Result<u64>) -> Result<u32> {
    let id = id.map_err(|e| malformed(origin, e.to_string()))?;
    u32::try_from(id).map_err(|_| malformed(origin, format!("{} {} out of range", field, id)))
}

/// normalize an archive member path into components
///
/// leading `/` and `./` are dropped; `..` is rejected.
fn normalize(origin: &Path, raw: &str) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for component in raw.split('/') {
        match component {
            "" | "." => {}
            ".." => return Err(malformed(origin, format!("invalid path: {}", raw))),
            c => out.push(c.to_string()),
        }
    }
    Ok(out)
}

fn rooted(components: &[String]) -> String {
    format!("/{}", components.join("/"))
}

fn pax_xattrs<R: Read>(entry: &mut tar::Entry<'_, R>, origin: &Path) -> Result<Vec<Xattr>> {
    let mut xattrs = Vec::new();
    let Some(extensions) = entry
        .pax_extensions()
        .map_err(|e| malformed(origin, e.to_string()))?
    else {
        return Ok(xattrs);
    };
    for ext in extensions {
        let ext = ext.map_err(|e| malformed(origin, e.to_string()))?;
        let Ok(key) = ext.key() else { continue };
        if let Some(name) = key.strip_prefix(PAX_XATTR_PREFIX) {
            xattrs.push(Xattr::new(name, ext.value_bytes().to_vec()));
        }
    }
    Ok(xattrs)
}

/// import a tar archive into `mtree`
///
/// unless `autocreate_parents` is set, every member's parent directory
/// must itself appear in the archive first.
pub fn write_archive(
    txn: &mut Transaction<'_>,
    mtree: &mut MutableTree,
    path: &Path,
    modifier: &mut CommitModifier<'_>,
    autocreate_parents: bool,
    cancel: Option<&Cancellable>,
) -> Result<()> {
    let file = File::open(path).with_path(path)?;
    import(
        txn,
        mtree,
        BufReader::new(file),
        path,
        modifier,
        ImportMode {
            autocreate_parents,
            whiteouts: false,
        },
        cancel,
    )
}

/// import a tar stream; `origin` only names it in errors
pub fn write_archive_from_reader(
    txn: &mut Transaction<'_>,
    mtree: &mut MutableTree,
    reader: impl Read,
    origin: &Path,
    modifier: &mut CommitModifier<'_>,
    autocreate_parents: bool,
    cancel: Option<&Cancellable>,
) -> Result<()> {
    import(
        txn,
        mtree,
        reader,
        origin,
        modifier,
        ImportMode {
            autocreate_parents,
            whiteouts: false,
        },
        cancel,
    )
}

/// apply a container image layer on top of `mtree`
///
/// parents are created as needed. `.wh.NAME` removes `NAME` from what is
/// already in the tree; `.wh..wh..opq` empties its directory of anything
/// this layer did not add.
pub fn write_layer(
    txn: &mut Transaction<'_>,
    mtree: &mut MutableTree,
    path: &Path,
    modifier: &mut CommitModifier<'_>,
    cancel: Option<&Cancellable>,
) -> Result<()> {
    let file = File::open(path).with_path(path)?;
    import(
        txn,
        mtree,
        BufReader::new(file),
        path,
        modifier,
        ImportMode {
            autocreate_parents: true,
            whiteouts: true,
        },
        cancel,
    )
}

/// directory metadata for parents created implicitly
fn implicit_dirmeta(txn: &mut Transaction<'_>) -> Result<Checksum> {
    txn.write_dirmeta(&DirMeta::default())
}

fn ensure_parents(
    txn: &mut Transaction<'_>,
    mtree: &mut MutableTree,
    components: &[String],
    replace_files: bool,
) -> Result<()> {
    let mut current = mtree;
    for name in components {
        current = if replace_files {
            current.replace_with_dir(name)?
        } else {
            current.ensure_dir(name)?
        };
        if current.metadata().is_none() {
            current.set_metadata(implicit_dirmeta(txn)?);
        }
    }
    Ok(())
}

fn import(
    txn: &mut Transaction<'_>,
    mtree: &mut MutableTree,
    reader: impl Read,
    origin: &Path,
    modifier: &mut CommitModifier<'_>,
    mode: ImportMode,
    cancel: Option<&Cancellable>,
) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    let entries = archive
        .entries()
        .map_err(|e| malformed(origin, e.to_string()))?;

    // directories that appeared in this archive, rooted
    let mut seen_dirs: HashSet<String> = HashSet::from(["/".to_string()]);
    // everything this archive added, for opaque whiteouts
    let mut added: HashSet<String> = HashSet::new();
    // skipped directories; their members are dropped too
    let mut skipped: Vec<String> = Vec::new();
    // file objects by path, for hardlink members
    let mut by_path: HashMap<String, Checksum> = HashMap::new();

    for entry in entries {
        cancel::check(cancel)?;
        let mut entry = entry.map_err(|e| malformed(origin, e.to_string()))?;

        let raw = entry
            .path()
            .map_err(|e| malformed(origin, e.to_string()))?
            .to_string_lossy()
            .into_owned();
        let components = normalize(origin, &raw)?;
        let rel = rooted(&components);

        if skipped
            .iter()
            .any(|s| rel == *s || rel.starts_with(&format!("{}/", s)))
        {
            continue;
        }

        let header = entry.header();
        let entry_type = header.entry_type();
        let (kind, type_bits) = match entry_type {
            tar::EntryType::Directory => (FileKind::Directory, S_IFDIR),
            tar::EntryType::Regular | tar::EntryType::Continuous | tar::EntryType::Link => {
                (FileKind::Regular, S_IFREG)
            }
            tar::EntryType::Symlink => (FileKind::Symlink, S_IFLNK),
            tar::EntryType::Char | tar::EntryType::Block | tar::EntryType::Fifo => {
                (FileKind::Special, 0)
            }
            other => {
                debug!(path = %rel, entry_type = ?other, "ignoring archive member");
                continue;
            }
        };
        let mut info = FileInfo {
            kind,
            uid: owner_id(origin, "uid", header.uid())?,
            gid: owner_id(origin, "gid", header.gid())?,
            mode: type_bits | (header.mode().map_err(|e| malformed(origin, e.to_string()))? & 0o7777),
            size: header.size().unwrap_or(0),
        };

        // the archive root only carries metadata for the tree root
        if components.is_empty() {
            if kind != FileKind::Directory {
                return Err(malformed(origin, "archive root is not a directory"));
            }
            if modifier.apply("/", &mut info) == FilterResult::Skip {
                continue;
            }
            let xattrs = modifier.xattrs(pax_xattrs(&mut entry, origin)?);
            mtree.set_metadata(txn.write_dirmeta(&DirMeta::new(info.uid, info.gid, info.mode, xattrs))?);
            continue;
        }

        let (name, parents) = match components.split_last() {
            Some(split) => split,
            None => continue,
        };
        let parent_rel = rooted(parents);

        if mode.whiteouts && name.starts_with(WHITEOUT_PREFIX) {
            let Ok(parent) = mtree.walk_mut(&parent_rel) else {
                continue;
            };
            if name == OPAQUE_WHITEOUT {
                parent.retain(|n| added.contains(&child_path(&parent_rel, n)));
                debug!(dir = %parent_rel, "opaque whiteout");
            } else {
                let target = &name[WHITEOUT_PREFIX.len()..];
                parent.remove(target, true)?;
                debug!(path = %child_path(&parent_rel, target), "whiteout");
            }
            continue;
        }

        if !mode.autocreate_parents && !seen_dirs.contains(&parent_rel) {
            return Err(malformed(
                origin,
                format!("parent directory of {} is not in the archive", rel),
            ));
        }

        if modifier.apply(&rel, &mut info) == FilterResult::Skip {
            if kind == FileKind::Directory {
                skipped.push(rel);
            }
            continue;
        }

        ensure_parents(txn, mtree, parents, mode.whiteouts)?;
        let parent = mtree.walk_mut(&parent_rel)?;

        match entry_type {
            tar::EntryType::Directory => {
                let xattrs = modifier.xattrs(pax_xattrs(&mut entry, origin)?);
                let dirmeta =
                    txn.write_dirmeta(&DirMeta::new(info.uid, info.gid, info.mode, xattrs))?;
                let dir = if mode.whiteouts {
                    parent.replace_with_dir(name)?
                } else {
                    parent.ensure_dir(name)?
                };
                dir.set_metadata(dirmeta);
                seen_dirs.insert(rel.clone());
            }
            tar::EntryType::Link => {
                let target = entry
                    .link_name()
                    .map_err(|e| malformed(origin, e.to_string()))?
                    .ok_or_else(|| malformed(origin, format!("hardlink {} has no target", rel)))?;
                let target_rel = rooted(&normalize(origin, &target.to_string_lossy())?);
                // a hardlink shares the object of its target as written
                let checksum = match by_path.get(&target_rel) {
                    Some(c) => *c,
                    None => {
                        return Err(malformed(
                            origin,
                            format!("hardlink {} points at unknown {}", rel, target_rel),
                        ))
                    }
                };
                place_file(parent, name, checksum, mode.whiteouts)?;
                by_path.insert(rel.clone(), checksum);
            }
            tar::EntryType::Symlink => {
                let target = entry
                    .link_name()
                    .map_err(|e| malformed(origin, e.to_string()))?
                    .ok_or_else(|| malformed(origin, format!("symlink {} has no target", rel)))?
                    .to_string_lossy()
                    .into_owned();
                let header = FileHeader {
                    uid: info.uid,
                    gid: info.gid,
                    mode: SYMLINK_MODE,
                    xattrs: modifier.xattrs(pax_xattrs(&mut entry, origin)?),
                };
                let staged = txn.write_file_bytes(&header, target.as_bytes())?;
                modifier.record_file(txn, &staged.checksum, Some(&staged))?;
                place_file(parent, name, staged.checksum, mode.whiteouts)?;
                by_path.insert(rel.clone(), staged.checksum);
            }
            tar::EntryType::Char | tar::EntryType::Block | tar::EntryType::Fifo => {
                return Err(Error::UnsupportedFileType(PathBuf::from(&rel)));
            }
            _ => {
                let xattrs = modifier.xattrs(pax_xattrs(&mut entry, origin)?);
                let mut header = FileHeader {
                    uid: info.uid,
                    gid: info.gid,
                    mode: info.mode,
                    xattrs,
                };
                header.normalize();
                let staged = txn.write_file(&header, &mut entry)?;
                modifier.record_file(txn, &staged.checksum, Some(&staged))?;
                place_file(parent, name, staged.checksum, mode.whiteouts)?;
                by_path.insert(rel.clone(), staged.checksum);
            }
        }
        added.insert(rel);
    }

    if !skipped.is_empty() {
        debug!(count = skipped.len(), "directories skipped by filter");
    }
    if mtree.metadata().is_none() {
        warn!(archive = %origin.display(), "archive has no root entry; using default metadata");
        mtree.set_metadata(implicit_dirmeta(txn)?);
    }
    Ok(())
}

fn place_file(parent: &mut MutableTree, name: &str, checksum: Checksum, replace: bool) -> Result<()> {
    if replace {
        parent.replace_dir_with_file(name, checksum)
    } else {
        parent.replace_file(name, checksum)
    }
}
