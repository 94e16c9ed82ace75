use std::fs::{self, File};
use std::io::{self, Cursor, Read, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::checksum::{Checksum, FileHasher};
use crate::config::RepoMode;
use crate::error::{Error, IoResultExt, Result};
use crate::fs::{apply_metadata, apply_permissions, create_symlink, read_xattrs};
use crate::repo::Repo;
use crate::types::{FileHeader, ObjectType, SYMLINK_MODE};

use super::layout::{object_path, object_relpath, sidecar_path, sidecar_relpath};
use super::meta::encode;

/// zstd level for archive-mode content
const ZSTD_LEVEL: i32 = 3;

/// bare-user objects must stay readable by the repo owner
const BARE_USER_MIN_PERMS: u32 = 0o400;

/// upper bound on the encoded header of an archive file object
const MAX_ARCHIVE_HEADER_LEN: usize = 1 << 20;

/// permission bits of the inode backing a bare-user object
///
/// setuid, setgid and sticky bits are dropped and owner-read is forced, so
/// a hardlinked checkout only matches the recorded mode when this returns
/// `mode & 0o7777`.
pub(crate) fn bare_user_permissions(mode: u32) -> u32 {
    (mode & 0o777) | BARE_USER_MIN_PERMS
}

/// a file object opened for reading
pub struct FileObject {
    pub header: FileHeader,
    /// logical content; a symlink yields its target
    pub content: Box<dyn Read>,
}

impl std::fmt::Debug for FileObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileObject")
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}

/// result of staging one file object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagedFile {
    pub checksum: Checksum,
    /// false when the object was already present and nothing was written
    pub written: bool,
    /// logical content length
    pub unpacked: u64,
    /// bytes occupied on disk (0 when deduplicated)
    pub stored: u64,
}

/// reader adapter feeding everything it yields into a file hasher
pub(crate) struct HashingReader<'a> {
    inner: &'a mut dyn Read,
    hasher: FileHasher,
    count: u64,
}

impl<'a> HashingReader<'a> {
    pub(crate) fn new(inner: &'a mut dyn Read, header: &FileHeader) -> Self {
        Self {
            inner,
            hasher: FileHasher::new(header),
            count: 0,
        }
    }

    pub(crate) fn finish(self) -> (Checksum, u64) {
        (self.hasher.finalize(), self.count)
    }
}

impl Read for HashingReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.count += n as u64;
        Ok(n)
    }
}

/// hash and write one file object under `staging`, laid out like `objects/`
///
/// `exists` is asked whether the computed checksum is already stored; if
/// so the temporary copy is dropped.
pub(crate) fn stage_file(
    repo: &Repo,
    staging: &Path,
    fsync: bool,
    header: &FileHeader,
    content: &mut dyn Read,
    exists: &dyn Fn(&Checksum) -> bool,
) -> Result<StagedFile> {
    let mut header = header.clone();
    header.normalize();
    let mode = repo.mode();
    let mut reader = HashingReader::new(content, &header);

    if header.is_symlink() && mode == RepoMode::Bare {
        let mut target = Vec::new();
        reader.read_to_end(&mut target).with_path(staging)?;
        let (checksum, unpacked) = reader.finish();
        if exists(&checksum) {
            return Ok(StagedFile {
                checksum,
                written: false,
                unpacked,
                stored: 0,
            });
        }

        let dest = staging.join(object_relpath(mode, &checksum, ObjectType::File));
        ensure_parent(&dest)?;
        create_symlink(
            &dest,
            &String::from_utf8_lossy(&target),
            Some((header.uid, header.gid)),
        )?;
        for xattr in &header.xattrs {
            xattr::set(&dest, &xattr.name, &xattr.value).map_err(|e| Error::Xattr {
                path: dest.clone(),
                message: format!("failed to set {}: {}", xattr.name, e),
            })?;
        }
        debug!(object = %checksum, "staged symlink object");
        return Ok(StagedFile {
            checksum,
            written: true,
            unpacked,
            stored: unpacked,
        });
    }

    let tmp_path = staging.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
    let stored = {
        let mut file = File::create(&tmp_path).with_path(&tmp_path)?;
        if mode == RepoMode::Archive {
            let header_bytes = encode(&header)?;
            if header_bytes.len() > MAX_ARCHIVE_HEADER_LEN {
                return Err(Error::InvalidArgument(format!(
                    "file header of {} bytes exceeds {}",
                    header_bytes.len(),
                    MAX_ARCHIVE_HEADER_LEN
                )));
            }
            file.write_all(&(header_bytes.len() as u32).to_le_bytes())
                .with_path(&tmp_path)?;
            file.write_all(&header_bytes).with_path(&tmp_path)?;
            let mut encoder = zstd::Encoder::new(&mut file, ZSTD_LEVEL).with_path(&tmp_path)?;
            io::copy(&mut reader, &mut encoder).with_path(&tmp_path)?;
            encoder.finish().with_path(&tmp_path)?;
        } else {
            io::copy(&mut reader, &mut file).with_path(&tmp_path)?;
        }
        if fsync {
            file.sync_all().with_path(&tmp_path)?;
        }
        file.metadata().with_path(&tmp_path)?.len()
    };
    let (checksum, unpacked) = reader.finish();

    if exists(&checksum) {
        fs::remove_file(&tmp_path).with_path(&tmp_path)?;
        return Ok(StagedFile {
            checksum,
            written: false,
            unpacked,
            stored: 0,
        });
    }

    let mut stored = stored;
    match mode {
        RepoMode::Bare => {
            apply_metadata(&tmp_path, header.uid, header.gid, header.mode, &header.xattrs)?;
        }
        RepoMode::BareUser => {
            apply_permissions(&tmp_path, bare_user_permissions(header.mode))?;
            let sidecar = staging.join(sidecar_relpath(&checksum));
            ensure_parent(&sidecar)?;
            let bytes = encode(&header)?;
            fs::write(&sidecar, &bytes).with_path(&sidecar)?;
            stored += bytes.len() as u64;
        }
        RepoMode::Archive => {
            apply_permissions(&tmp_path, 0o644)?;
        }
    }

    let dest = staging.join(object_relpath(mode, &checksum, ObjectType::File));
    ensure_parent(&dest)?;
    fs::rename(&tmp_path, &dest).with_path(&dest)?;
    debug!(object = %checksum, bytes = unpacked, "staged file object");

    Ok(StagedFile {
        checksum,
        written: true,
        unpacked,
        stored,
    })
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_path(parent)?;
    }
    Ok(())
}

fn not_found(checksum: &Checksum) -> Error {
    Error::ObjectNotFound {
        checksum: *checksum,
        kind: ObjectType::File,
    }
}

fn invalid_header(checksum: &Checksum, message: String) -> Error {
    Error::StructuralInvalid {
        object: *checksum,
        kind: ObjectType::File,
        message,
    }
}

/// path of the stored content, the hardlink source for checkouts
pub fn content_path(repo: &Repo, checksum: &Checksum) -> PathBuf {
    object_path(repo, checksum, ObjectType::File)
}

/// open a file object: its logical header and a reader over its content
pub fn open_file(repo: &Repo, checksum: &Checksum) -> Result<FileObject> {
    let path = content_path(repo, checksum);
    let meta = match fs::symlink_metadata(&path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(not_found(checksum)),
        Err(e) => return Err(Error::Io { path, source: e }),
    };

    match repo.mode() {
        RepoMode::Bare => {
            let xattrs = read_xattrs(&path)?;
            if meta.file_type().is_symlink() {
                let target = fs::read_link(&path).with_path(&path)?;
                let header = FileHeader {
                    uid: meta.uid(),
                    gid: meta.gid(),
                    mode: SYMLINK_MODE,
                    xattrs,
                };
                let bytes = target.to_string_lossy().into_owned().into_bytes();
                return Ok(FileObject {
                    header,
                    content: Box::new(Cursor::new(bytes)),
                });
            }
            let header = FileHeader {
                uid: meta.uid(),
                gid: meta.gid(),
                mode: meta.mode(),
                xattrs,
            };
            let file = File::open(&path).with_path(&path)?;
            Ok(FileObject {
                header,
                content: Box::new(file),
            })
        }
        RepoMode::BareUser => {
            let sidecar = sidecar_path(repo, checksum);
            let bytes = match fs::read(&sidecar) {
                Ok(b) => b,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(invalid_header(checksum, "missing file header".to_string()))
                }
                Err(e) => return Err(Error::Io { path: sidecar, source: e }),
            };
            let header: FileHeader = ciborium::from_reader(&bytes[..])
                .map_err(|e| invalid_header(checksum, e.to_string()))?;
            let file = File::open(&path).with_path(&path)?;
            Ok(FileObject {
                header,
                content: Box::new(file),
            })
        }
        RepoMode::Archive => {
            let mut file = File::open(&path).with_path(&path)?;
            let mut len_buf = [0u8; 4];
            file.read_exact(&mut len_buf)
                .map_err(|e| invalid_header(checksum, e.to_string()))?;
            let len = u32::from_le_bytes(len_buf) as usize;
            let stored = file.metadata().with_path(&path)?.len();
            if len > MAX_ARCHIVE_HEADER_LEN || len as u64 > stored.saturating_sub(4) {
                return Err(invalid_header(
                    checksum,
                    format!("header length {} does not fit a {} byte object", len, stored),
                ));
            }
            let mut header_buf = vec![0u8; len];
            file.read_exact(&mut header_buf)
                .map_err(|e| invalid_header(checksum, e.to_string()))?;
            let header: FileHeader = ciborium::from_reader(&header_buf[..])
                .map_err(|e| invalid_header(checksum, e.to_string()))?;
            let decoder = zstd::Decoder::new(file).with_path(&path)?;
            Ok(FileObject {
                header,
                content: Box::new(decoder),
            })
        }
    }
}

/// logical header of a stored file object
pub fn load_file_header(repo: &Repo, checksum: &Checksum) -> Result<FileHeader> {
    Ok(open_file(repo, checksum)?.header)
}

/// recompute the checksum of a stored file object from its header and content
pub fn compute_file_checksum(repo: &Repo, checksum: &Checksum) -> Result<Checksum> {
    let FileObject {
        mut header,
        mut content,
    } = open_file(repo, checksum)?;
    header.normalize();
    let mut reader = HashingReader::new(&mut *content, &header);
    io::copy(&mut reader, &mut io::sink()).with_path(content_path(repo, checksum))?;
    Ok(reader.finish().0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::file_checksum;
    use crate::repo::InitOptions;
    use tempfile::{tempdir, TempDir};

    fn test_repo(mode: RepoMode) -> (TempDir, Repo) {
        let dir = tempdir().unwrap();
        let repo = Repo::init(&dir.path().join("repo"), InitOptions { mode }).unwrap();
        (dir, repo)
    }

    fn owned_header(mode: u32) -> FileHeader {
        FileHeader::regular(
            nix::unistd::getuid().as_raw(),
            nix::unistd::getgid().as_raw(),
            mode,
        )
    }

    // staging straight into objects/ makes the result readable
    fn store(repo: &Repo, header: &FileHeader, content: &[u8]) -> StagedFile {
        let objects = repo.objects_path();
        let mut reader: &[u8] = content;
        stage_file(repo, &objects, false, header, &mut reader, &|c| {
            content_path(repo, c).symlink_metadata().is_ok()
        })
        .unwrap()
    }

    fn read_all(repo: &Repo, checksum: &Checksum) -> (FileHeader, Vec<u8>) {
        let mut obj = open_file(repo, checksum).unwrap();
        let mut buf = Vec::new();
        obj.content.read_to_end(&mut buf).unwrap();
        (obj.header, buf)
    }

    #[test]
    fn test_checksum_matches_file_checksum() {
        let (_dir, repo) = test_repo(RepoMode::BareUser);
        let header = owned_header(0o644);
        let staged = store(&repo, &header, b"hello");

        assert_eq!(staged.checksum, file_checksum(&header, b"hello"));
        assert!(staged.written);
        assert_eq!(staged.unpacked, 5);
    }

    #[test]
    fn test_dedup() {
        let (_dir, repo) = test_repo(RepoMode::BareUser);
        let header = owned_header(0o644);
        let first = store(&repo, &header, b"same");
        let second = store(&repo, &header, b"same");

        assert_eq!(first.checksum, second.checksum);
        assert!(!second.written);
        assert_eq!(second.stored, 0);
    }

    #[test]
    fn test_bare_user_keeps_logical_header() {
        let (_dir, repo) = test_repo(RepoMode::BareUser);
        let mut header = FileHeader::regular(0, 0, 0o4755);
        header.xattrs.push(crate::types::Xattr::new("user.k", b"v".to_vec()));
        let staged = store(&repo, &header, b"#!/bin/sh\n");

        let (read_header, content) = read_all(&repo, &staged.checksum);
        assert_eq!(read_header, header);
        assert_eq!(content, b"#!/bin/sh\n");

        let on_disk = fs::metadata(content_path(&repo, &staged.checksum)).unwrap();
        assert_eq!(on_disk.mode() & 0o7777, 0o755);
    }

    #[test]
    fn test_archive_roundtrip_and_verify() {
        let (_dir, repo) = test_repo(RepoMode::Archive);
        let header = FileHeader::symlink(0, 0);
        let staged = store(&repo, &header, b"../target");

        assert!(content_path(&repo, &staged.checksum)
            .to_string_lossy()
            .ends_with(".filez"));
        let (read_header, content) = read_all(&repo, &staged.checksum);
        assert!(read_header.is_symlink());
        assert_eq!(content, b"../target");
        assert_eq!(
            compute_file_checksum(&repo, &staged.checksum).unwrap(),
            staged.checksum
        );
    }

    #[test]
    fn test_bare_symlink_is_real_link() {
        let (_dir, repo) = test_repo(RepoMode::Bare);
        let (uid, gid) = (nix::unistd::getuid().as_raw(), nix::unistd::getgid().as_raw());
        let header = FileHeader::symlink(uid, gid);
        let staged = store(&repo, &header, b"/etc/hostname");

        let path = content_path(&repo, &staged.checksum);
        assert!(path.symlink_metadata().unwrap().file_type().is_symlink());
        let (_, content) = read_all(&repo, &staged.checksum);
        assert_eq!(content, b"/etc/hostname");
    }

    #[test]
    fn test_corruption_detected() {
        let (_dir, repo) = test_repo(RepoMode::BareUser);
        let staged = store(&repo, &owned_header(0o644), b"original");

        let path = content_path(&repo, &staged.checksum);
        fs::write(&path, b"tampered").unwrap();

        assert_ne!(
            compute_file_checksum(&repo, &staged.checksum).unwrap(),
            staged.checksum
        );
    }

    #[test]
    fn test_archive_header_length_checked() {
        let (_dir, repo) = test_repo(RepoMode::Archive);
        let staged = store(&repo, &owned_header(0o644), b"compressed");
        let path = content_path(&repo, &staged.checksum);

        let mut bytes = fs::read(&path).unwrap();
        bytes[..4].copy_from_slice(&u32::MAX.to_le_bytes());
        fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            open_file(&repo, &staged.checksum),
            Err(Error::StructuralInvalid { kind: ObjectType::File, .. })
        ));

        fs::write(&path, 64u32.to_le_bytes()).unwrap();
        let err = compute_file_checksum(&repo, &staged.checksum).unwrap_err();
        assert!(matches!(err, Error::StructuralInvalid { .. }));
    }

    #[test]
    fn test_missing_is_not_found() {
        let (_dir, repo) = test_repo(RepoMode::Bare);
        assert!(open_file(&repo, &Checksum::of(b"x")).unwrap_err().is_not_found());
    }
}
