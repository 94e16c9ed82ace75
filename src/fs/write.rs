use std::fs::{self, File, Permissions};
use std::io::{self, Read};
use std::os::unix::fs::{lchown, symlink, PermissionsExt};
use std::path::Path;

use nix::libc;
use nix::unistd::{chown, Gid, Uid};
use tracing::{debug, warn};

use crate::error::{Error, IoResultExt, Result};
use crate::types::Xattr;

/// remove a non-directory entry if present
pub fn remove_existing(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => Err(Error::AlreadyExists(path.to_path_buf())),
        Ok(_) => fs::remove_file(path).with_path(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// create a symlink, optionally setting ownership on the link itself
pub fn create_symlink(path: &Path, target: &str, owner: Option<(u32, u32)>) -> Result<()> {
    remove_existing(path)?;
    symlink(target, path).with_path(path)?;

    if let Some((uid, gid)) = owner {
        // skip if it matches the current user to avoid permission errors when not root
        let current_uid = nix::unistd::getuid().as_raw();
        let current_gid = nix::unistd::getgid().as_raw();
        if uid != current_uid || gid != current_gid {
            lchown(path, Some(uid), Some(gid)).with_path(path)?;
        }
    }

    Ok(())
}

/// stream `reader` into a newly created file
pub fn copy_to_new_file(reader: &mut dyn Read, dest: &Path) -> Result<u64> {
    let mut file = File::options()
        .write(true)
        .create_new(true)
        .open(dest)
        .with_path(dest)?;
    io::copy(reader, &mut file).with_path(dest)
}

/// result of a hardlink attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    Linked,
    /// source and destination are on different filesystems
    CrossDevice,
}

/// hardlink `src` to `dest`, reporting EXDEV instead of failing
pub fn try_hardlink(src: &Path, dest: &Path) -> Result<LinkOutcome> {
    match fs::hard_link(src, dest) {
        Ok(()) => Ok(LinkOutcome::Linked),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            debug!(src = %src.display(), dest = %dest.display(), "cross-device hardlink");
            Ok(LinkOutcome::CrossDevice)
        }
        Err(e) => Err(Error::Io {
            path: dest.to_path_buf(),
            source: e,
        }),
    }
}

/// apply metadata (ownership, mode, xattrs) to an existing path
pub fn apply_metadata(path: &Path, uid: u32, gid: u32, mode: u32, xattrs: &[Xattr]) -> Result<()> {
    // set xattrs first (while we still have write permission)
    for xattr in xattrs {
        xattr::set(path, &xattr.name, &xattr.value).map_err(|e| Error::Xattr {
            path: path.to_path_buf(),
            message: format!("failed to set {}: {}", xattr.name, e),
        })?;
    }

    // set ownership (skip if matches current user to avoid permission errors when not root)
    let current_uid = nix::unistd::getuid().as_raw();
    let current_gid = nix::unistd::getgid().as_raw();
    if uid != current_uid || gid != current_gid {
        chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid))).map_err(|e| Error::Io {
            path: path.to_path_buf(),
            source: io::Error::from(e),
        })?;
    }

    // set mode last (might remove write permission)
    apply_permissions(path, mode)
}

/// set permission bits only
pub fn apply_permissions(path: &Path, mode: u32) -> Result<()> {
    fs::set_permissions(path, Permissions::from_mode(mode & 0o7777)).with_path(path)
}

/// sync a directory to disk
pub fn fsync_dir(path: &Path) -> Result<()> {
    let dir = File::open(path).with_path(path)?;
    if let Err(e) = dir.sync_all() {
        // some filesystems refuse fsync on directories
        if e.raw_os_error() != Some(libc::EINVAL) {
            return Err(Error::Io {
                path: path.to_path_buf(),
                source: e,
            });
        }
        warn!(path = %path.display(), "directory fsync unsupported");
    }
    Ok(())
}
