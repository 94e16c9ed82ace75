use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::checksum::Checksum;
use crate::config::RepoMode;
use crate::error::{Error, IoResultExt, Result};
use crate::repo::Repo;
use crate::types::ObjectType;

/// sidecar holding the logical header of a bare-user file object
const OBJECT_SIDECAR_EXT: &str = "filemeta";

/// `XX/YYYY.ext` for an object in a given repo mode
pub(crate) fn object_relpath(mode: RepoMode, checksum: &Checksum, kind: ObjectType) -> PathBuf {
    let (dir, file) = checksum.to_path_components();
    let ext = match (kind, mode) {
        (ObjectType::File, RepoMode::Archive) => "filez",
        _ => kind.extension(),
    };
    PathBuf::from(dir).join(format!("{}.{}", file, ext))
}

pub(crate) fn sidecar_relpath(checksum: &Checksum) -> PathBuf {
    let (dir, file) = checksum.to_path_components();
    PathBuf::from(dir).join(format!("{}.{}", file, OBJECT_SIDECAR_EXT))
}

/// get the filesystem path to an object
pub fn object_path(repo: &Repo, checksum: &Checksum, kind: ObjectType) -> PathBuf {
    repo.objects_path()
        .join(object_relpath(repo.mode(), checksum, kind))
}

pub(crate) fn sidecar_path(repo: &Repo, checksum: &Checksum) -> PathBuf {
    repo.objects_path().join(sidecar_relpath(checksum))
}

/// check if an object exists; does not follow symlinks
pub fn object_exists(repo: &Repo, checksum: &Checksum, kind: ObjectType) -> bool {
    object_path(repo, checksum, kind).symlink_metadata().is_ok()
}

/// bytes occupied by an object, including any sidecar
pub fn object_size(repo: &Repo, checksum: &Checksum, kind: ObjectType) -> Result<u64> {
    let path = object_path(repo, checksum, kind);
    let mut total = match fs::symlink_metadata(&path) {
        Ok(m) => m.len(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(Error::ObjectNotFound {
                checksum: *checksum,
                kind,
            })
        }
        Err(e) => return Err(Error::Io { path, source: e }),
    };
    if kind == ObjectType::File && repo.mode() == RepoMode::BareUser {
        if let Ok(m) = fs::symlink_metadata(sidecar_path(repo, checksum)) {
            total += m.len();
        }
    }
    Ok(total)
}

/// split an object file name into checksum and type
pub(crate) fn parse_object_name(dir_name: &str, file_name: &str) -> Option<(Checksum, ObjectType)> {
    let (rest, ext) = file_name.split_once('.')?;
    let kind = ObjectType::from_extension(ext)?;
    let checksum = Checksum::from_hex(&format!("{}{}", dir_name, rest)).ok()?;
    Some((checksum, kind))
}

/// enumerate every object in the store
pub fn list_objects(repo: &Repo) -> Result<BTreeSet<(Checksum, ObjectType)>> {
    list_objects_in(&repo.objects_path())
}

fn list_objects_in(dir: &Path) -> Result<BTreeSet<(Checksum, ObjectType)>> {
    let mut objects = BTreeSet::new();

    if !dir.exists() {
        return Ok(objects);
    }

    for entry in WalkDir::new(dir).min_depth(2).max_depth(2) {
        let entry = entry.map_err(|e| Error::Io {
            path: dir.to_path_buf(),
            source: e
                .into_io_error()
                .unwrap_or_else(|| io::Error::other("walkdir error")),
        })?;

        if entry.file_type().is_dir() {
            continue;
        }

        let path = entry.path();
        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        let parent_name = path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .unwrap_or("");

        if let Some(obj) = parse_object_name(parent_name, file_name) {
            objects.insert(obj);
        }
    }

    Ok(objects)
}

/// delete an object, returning the bytes freed
///
/// deleting a commit also drops its detached metadata and partial marker,
/// and leaves a tombstone when tombstone commits are enabled.
pub fn delete_object(repo: &Repo, checksum: &Checksum, kind: ObjectType) -> Result<u64> {
    let freed = object_size(repo, checksum, kind)?;
    let path = object_path(repo, checksum, kind);
    fs::remove_file(&path).with_path(&path)?;
    debug!(object = %checksum, %kind, "deleted object");

    let mut extra = 0;
    match kind {
        ObjectType::File if repo.mode() == RepoMode::BareUser => {
            remove_if_present(&sidecar_path(repo, checksum))?;
        }
        ObjectType::Commit => {
            extra += remove_if_present(&object_path(repo, checksum, ObjectType::CommitMeta))?;
            repo.clear_partial(checksum)?;
            if repo.tombstone_commits_enabled() {
                super::write_tombstone(repo, checksum)?;
            }
        }
        _ => {}
    }

    Ok(freed + extra)
}

fn remove_if_present(path: &Path) -> Result<u64> {
    match fs::symlink_metadata(path) {
        Ok(m) => {
            fs::remove_file(path).with_path(path)?;
            Ok(m.len())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(Error::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}
