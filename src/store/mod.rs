//! the on-disk object store: layout, object encoding and reachability

mod content;
mod layout;
mod meta;
mod traverse;

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

pub use content::{
    compute_file_checksum, content_path, load_file_header, open_file, FileObject, StagedFile,
};
pub use layout::{delete_object, list_objects, object_exists, object_path, object_size};
pub use meta::{
    commit_exists, has_tombstone, load_commit, load_dirmeta, load_dirtree, read_commit,
    read_detached_metadata, read_tombstone, validate_meta_bytes, write_detached_metadata,
    write_tombstone,
};
pub use traverse::{traverse_commit_union, traverse_dirtree, ReachableSet};

pub(crate) use content::{bare_user_permissions, stage_file};
pub(crate) use layout::{object_relpath, sidecar_relpath};
pub(crate) use meta::{encode, read_meta_bytes, stage_meta_bytes};

use crate::error::{IoResultExt, Result};
use crate::fs::fsync_dir;
use crate::repo::Repo;

/// write `bytes` to `dest` via a temp file in the repo tmp dir
pub(crate) fn write_atomic(repo: &Repo, dest: &Path, bytes: &[u8]) -> Result<()> {
    let fsync = repo.fsync_enabled();
    let tmp_path = repo.tmp_path().join(uuid::Uuid::new_v4().to_string());
    {
        let mut tmp_file = File::create(&tmp_path).with_path(&tmp_path)?;
        tmp_file.write_all(bytes).with_path(&tmp_path)?;
        if fsync {
            tmp_file.sync_all().with_path(&tmp_path)?;
        }
    }

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).with_path(parent)?;
    }
    fs::rename(&tmp_path, dest).with_path(dest)?;

    if fsync {
        if let Some(parent) = dest.parent() {
            fsync_dir(parent)?;
        }
    }
    Ok(())
}
