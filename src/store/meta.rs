use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::checksum::Checksum;
use crate::error::{Error, IoResultExt, Result};
use crate::refs::resolve_ref;
use crate::repo::Repo;
use crate::types::{Commit, CommitState, DetachedMetadata, DirMeta, DirTree, ObjectType, Tombstone};

use super::layout::{object_path, object_relpath};
use super::write_atomic;

/// serialize a metadata object to CBOR
pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)?;
    Ok(buf)
}

fn decode<T: DeserializeOwned>(checksum: &Checksum, kind: ObjectType, bytes: &[u8]) -> Result<T> {
    ciborium::from_reader(bytes).map_err(|e| Error::StructuralInvalid {
        object: *checksum,
        kind,
        message: e.to_string(),
    })
}

fn structural(checksum: &Checksum, kind: ObjectType, message: String) -> Error {
    Error::StructuralInvalid {
        object: *checksum,
        kind,
        message,
    }
}

/// raw bytes of a stored metadata object
pub(crate) fn read_meta_bytes(repo: &Repo, checksum: &Checksum, kind: ObjectType) -> Result<Vec<u8>> {
    let path = object_path(repo, checksum, kind);
    fs::read(&path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            Error::ObjectNotFound {
                checksum: *checksum,
                kind,
            }
        } else {
            Error::Io { path, source: e }
        }
    })
}

/// write a metadata object into a private staging root
pub(crate) fn stage_meta_bytes(
    repo: &Repo,
    staging: &Path,
    fsync: bool,
    checksum: &Checksum,
    kind: ObjectType,
    bytes: &[u8],
) -> Result<()> {
    let path = staging.join(object_relpath(repo.mode(), checksum, kind));
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_path(parent)?;
    }
    let mut file = File::create(&path).with_path(&path)?;
    file.write_all(bytes).with_path(&path)?;
    if fsync {
        file.sync_all().with_path(&path)?;
    }
    debug!(object = %checksum, %kind, "staged metadata object");
    Ok(())
}

/// decode and structurally check metadata bytes, then compare checksums
///
/// structural failures come back as `StructuralInvalid`, a digest
/// mismatch as `CorruptObject`.
pub fn validate_meta_bytes(kind: ObjectType, checksum: &Checksum, bytes: &[u8]) -> Result<()> {
    match kind {
        ObjectType::DirTree => {
            let tree: DirTree = decode(checksum, kind, bytes)?;
            tree.validate().map_err(|m| structural(checksum, kind, m))?;
        }
        ObjectType::DirMeta => {
            let meta: DirMeta = decode(checksum, kind, bytes)?;
            meta.validate().map_err(|m| structural(checksum, kind, m))?;
        }
        ObjectType::Commit => {
            let commit: Commit = decode(checksum, kind, bytes)?;
            commit.validate().map_err(|m| structural(checksum, kind, m))?;
        }
        ObjectType::CommitMeta => {
            decode::<DetachedMetadata>(checksum, kind, bytes)?;
            return Ok(());
        }
        ObjectType::Tombstone => {
            decode::<Tombstone>(checksum, kind, bytes)?;
            return Ok(());
        }
        ObjectType::File => {
            return Err(Error::InvalidArgument(
                "file objects are not metadata".to_string(),
            ))
        }
    }

    let actual = Checksum::of(bytes);
    if actual != *checksum {
        return Err(Error::CorruptObject {
            object: *checksum,
            kind,
            actual,
        });
    }
    Ok(())
}

/// load a directory tree object
pub fn load_dirtree(repo: &Repo, checksum: &Checksum) -> Result<DirTree> {
    let bytes = read_meta_bytes(repo, checksum, ObjectType::DirTree)?;
    let tree: DirTree = decode(checksum, ObjectType::DirTree, &bytes)?;
    tree.validate()
        .map_err(|m| structural(checksum, ObjectType::DirTree, m))?;
    Ok(tree)
}

/// load a directory metadata object
pub fn load_dirmeta(repo: &Repo, checksum: &Checksum) -> Result<DirMeta> {
    let bytes = read_meta_bytes(repo, checksum, ObjectType::DirMeta)?;
    let meta: DirMeta = decode(checksum, ObjectType::DirMeta, &bytes)?;
    meta.validate()
        .map_err(|m| structural(checksum, ObjectType::DirMeta, m))?;
    Ok(meta)
}

/// load a commit along with its partial state
pub fn load_commit(repo: &Repo, checksum: &Checksum) -> Result<(Commit, CommitState)> {
    let bytes = read_meta_bytes(repo, checksum, ObjectType::Commit)?;
    let commit: Commit = decode(checksum, ObjectType::Commit, &bytes)?;
    commit
        .validate()
        .map_err(|m| structural(checksum, ObjectType::Commit, m))?;

    let state = if repo.is_partial(checksum) {
        CommitState::Partial
    } else {
        CommitState::Normal
    };
    Ok((commit, state))
}

/// resolve a rev and load the commit it names
pub fn read_commit(repo: &Repo, rev: &str) -> Result<(Checksum, Commit)> {
    let checksum = resolve_ref(repo, rev)?;
    let (commit, _) = load_commit(repo, &checksum)?;
    Ok((checksum, commit))
}

pub fn commit_exists(repo: &Repo, checksum: &Checksum) -> bool {
    super::object_exists(repo, checksum, ObjectType::Commit)
}

/// detached metadata of a commit, if any was written
pub fn read_detached_metadata(repo: &Repo, commit: &Checksum) -> Result<Option<DetachedMetadata>> {
    match read_meta_bytes(repo, commit, ObjectType::CommitMeta) {
        Ok(bytes) => Ok(Some(decode(commit, ObjectType::CommitMeta, &bytes)?)),
        Err(Error::ObjectNotFound { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

/// replace the detached metadata of an existing commit
pub fn write_detached_metadata(
    repo: &Repo,
    commit: &Checksum,
    metadata: &DetachedMetadata,
) -> Result<()> {
    if !commit_exists(repo, commit) {
        return Err(Error::ObjectNotFound {
            checksum: *commit,
            kind: ObjectType::Commit,
        });
    }
    let bytes = encode(metadata)?;
    write_atomic(repo, &object_path(repo, commit, ObjectType::CommitMeta), &bytes)?;
    debug!(%commit, keys = metadata.len(), "wrote detached metadata");
    Ok(())
}

/// record that `commit` was deliberately deleted
pub fn write_tombstone(repo: &Repo, commit: &Checksum) -> Result<()> {
    let tombstone = Tombstone {
        commit: *commit,
        deleted_at: chrono::Utc::now().timestamp(),
    };
    let bytes = encode(&tombstone)?;
    write_atomic(repo, &object_path(repo, commit, ObjectType::Tombstone), &bytes)?;
    debug!(%commit, "wrote tombstone");
    Ok(())
}

pub fn read_tombstone(repo: &Repo, commit: &Checksum) -> Result<Option<Tombstone>> {
    match read_meta_bytes(repo, commit, ObjectType::Tombstone) {
        Ok(bytes) => Ok(Some(decode(commit, ObjectType::Tombstone, &bytes)?)),
        Err(Error::ObjectNotFound { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

pub fn has_tombstone(repo: &Repo, commit: &Checksum) -> bool {
    super::object_exists(repo, commit, ObjectType::Tombstone)
}
