//! write transactions: staged objects become visible in one step on commit

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::checksum::Checksum;
use crate::config::RepoMode;
use crate::error::{Error, IoResultExt, Result};
use crate::fs::fsync_dir;
use crate::refs::{delete_ref, read_ref, validate_ref_name, write_ref};
use crate::repo::{Repo, RepoLock};
use crate::store::{self, StagedFile};
use crate::types::{Commit, DetachedMetadata, DirMeta, DirTree, FileHeader, ObjectType};

/// lifecycle of a transaction handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    Prepared,
    Committing,
    Committed,
    Aborted,
}

/// object and ref counts gathered while a transaction runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionStats {
    pub metadata_objects_total: u64,
    pub metadata_objects_written: u64,
    pub content_objects_total: u64,
    pub content_objects_written: u64,
    pub content_bytes_written: u64,
    pub refs_updated: u64,
}

impl fmt::Display for TransactionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Metadata Total: {}", self.metadata_objects_total)?;
        writeln!(f, "Metadata Written: {}", self.metadata_objects_written)?;
        writeln!(f, "Content Total: {}", self.content_objects_total)?;
        writeln!(f, "Content Written: {}", self.content_objects_written)?;
        write!(f, "Content Bytes Written: {}", self.content_bytes_written)
    }
}

/// an open write transaction
///
/// objects land in a private staging directory under `tmp/` and are moved
/// into `objects/` by [`Transaction::commit`]; queued ref changes are
/// applied after every object is in place. dropping an uncommitted
/// transaction aborts it.
pub struct Transaction<'r> {
    repo: &'r Repo,
    staging: PathBuf,
    state: TransactionState,
    staged: BTreeSet<(Checksum, ObjectType)>,
    ref_updates: BTreeMap<String, Option<Checksum>>,
    stats: TransactionStats,
    fsync: bool,
    _lock: RepoLock,
}

impl Repo {
    /// open a transaction on this handle
    ///
    /// fails if the repository is not writable or this handle already has
    /// one open. other handles and processes may hold their own.
    pub fn prepare_transaction(&self) -> Result<Transaction<'_>> {
        self.ensure_writable()?;
        self.claim_transaction()?;

        let begun: Result<(RepoLock, PathBuf)> = (|| {
            let lock = self.lock_shared()?;
            let staging = self
                .tmp_path()
                .join(format!("staging-{}", uuid::Uuid::new_v4()));
            fs::create_dir_all(&staging).with_path(&staging)?;
            Ok((lock, staging))
        })();

        match begun {
            Ok((lock, staging)) => {
                debug!(staging = %staging.display(), "transaction prepared");
                Ok(Transaction {
                    repo: self,
                    staging,
                    state: TransactionState::Prepared,
                    staged: BTreeSet::new(),
                    ref_updates: BTreeMap::new(),
                    stats: TransactionStats::default(),
                    fsync: self.fsync_enabled(),
                    _lock: lock,
                })
            }
            Err(e) => {
                self.release_transaction();
                Err(e)
            }
        }
    }
}

/// order in which staged objects are published: leaves before the
/// objects that reference them
fn publish_rank(kind: ObjectType) -> u8 {
    match kind {
        ObjectType::File => 0,
        ObjectType::DirMeta => 1,
        ObjectType::DirTree => 2,
        ObjectType::Commit => 3,
        ObjectType::CommitMeta => 4,
        ObjectType::Tombstone => 5,
    }
}

impl<'r> Transaction<'r> {
    pub fn repo(&self) -> &'r Repo {
        self.repo
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn stats(&self) -> TransactionStats {
        self.stats
    }

    pub fn staging_path(&self) -> &Path {
        &self.staging
    }

    /// override the repository fsync setting for this transaction
    pub fn set_fsync(&mut self, enabled: bool) {
        self.fsync = enabled;
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state == TransactionState::Prepared {
            Ok(())
        } else {
            Err(Error::NoTransaction)
        }
    }

    /// true if the object is stored or staged in this transaction
    pub fn contains(&self, checksum: &Checksum, kind: ObjectType) -> bool {
        self.staged.contains(&(*checksum, kind)) || store::object_exists(self.repo, checksum, kind)
    }

    /// hash and stage a file object, deduplicating against the store
    pub fn write_file(&mut self, header: &FileHeader, content: &mut dyn Read) -> Result<StagedFile> {
        self.ensure_open()?;
        let staged = &self.staged;
        let repo = self.repo;
        let exists = |c: &Checksum| {
            staged.contains(&(*c, ObjectType::File))
                || store::object_exists(repo, c, ObjectType::File)
        };
        let result = store::stage_file(repo, &self.staging, self.fsync, header, content, &exists)?;

        self.stats.content_objects_total += 1;
        if result.written {
            self.stats.content_objects_written += 1;
            self.stats.content_bytes_written += result.stored;
            self.staged.insert((result.checksum, ObjectType::File));
        }
        Ok(result)
    }

    /// stage the content of an in-memory buffer as a file object
    pub fn write_file_bytes(&mut self, header: &FileHeader, content: &[u8]) -> Result<StagedFile> {
        let mut reader = content;
        self.write_file(header, &mut reader)
    }

    fn write_metadata<T: Serialize>(&mut self, kind: ObjectType, value: &T) -> Result<Checksum> {
        self.ensure_open()?;
        let bytes = store::encode(value)?;
        let checksum = Checksum::of(&bytes);

        self.stats.metadata_objects_total += 1;
        if !self.contains(&checksum, kind) {
            store::stage_meta_bytes(self.repo, &self.staging, self.fsync, &checksum, kind, &bytes)?;
            self.staged.insert((checksum, kind));
            self.stats.metadata_objects_written += 1;
        }
        Ok(checksum)
    }

    pub fn write_dirtree(&mut self, tree: &DirTree) -> Result<Checksum> {
        self.write_metadata(ObjectType::DirTree, tree)
    }

    pub fn write_dirmeta(&mut self, meta: &DirMeta) -> Result<Checksum> {
        self.write_metadata(ObjectType::DirMeta, meta)
    }

    pub fn write_commit(&mut self, commit: &Commit) -> Result<Checksum> {
        commit
            .validate()
            .map_err(|m| Error::InvalidArgument(format!("invalid commit: {}", m)))?;
        self.write_metadata(ObjectType::Commit, commit)
    }

    /// stage detached metadata for `commit`, replacing any stored copy on commit
    pub fn write_detached_metadata(
        &mut self,
        commit: &Checksum,
        metadata: &DetachedMetadata,
    ) -> Result<()> {
        self.ensure_open()?;
        if !self.contains(commit, ObjectType::Commit) {
            return Err(Error::ObjectNotFound {
                checksum: *commit,
                kind: ObjectType::Commit,
            });
        }
        let bytes = store::encode(metadata)?;
        store::stage_meta_bytes(self.repo, &self.staging, self.fsync, commit, ObjectType::CommitMeta, &bytes)?;
        self.staged.insert((*commit, ObjectType::CommitMeta));
        Ok(())
    }

    /// detached metadata staged here, or else the stored copy
    pub fn read_detached_metadata(&self, commit: &Checksum) -> Result<Option<DetachedMetadata>> {
        if self.staged.contains(&(*commit, ObjectType::CommitMeta)) {
            let path = self
                .staging
                .join(store::object_relpath(self.repo.mode(), commit, ObjectType::CommitMeta));
            let bytes = fs::read(&path).with_path(&path)?;
            return Ok(Some(ciborium::from_reader(&bytes[..])?));
        }
        store::read_detached_metadata(self.repo, commit)
    }

    /// read back a commit staged in this transaction or already stored
    pub fn load_commit(&self, checksum: &Checksum) -> Result<Commit> {
        if self.staged.contains(&(*checksum, ObjectType::Commit)) {
            let path = self
                .staging
                .join(store::object_relpath(self.repo.mode(), checksum, ObjectType::Commit));
            let bytes = fs::read(&path).with_path(&path)?;
            return Ok(ciborium::from_reader(&bytes[..])?);
        }
        Ok(store::load_commit(self.repo, checksum)?.0)
    }

    /// queue a ref change; `None` deletes the ref
    pub fn set_ref(&mut self, name: &str, target: Option<Checksum>) -> Result<()> {
        self.ensure_open()?;
        validate_ref_name(name)?;
        self.ref_updates.insert(name.to_string(), target);
        Ok(())
    }

    /// publish every staged object, then apply queued ref changes
    pub fn commit(&mut self) -> Result<TransactionStats> {
        self.ensure_open()?;
        self.state = TransactionState::Committing;

        match self.publish() {
            Ok(()) => {
                self.state = TransactionState::Committed;
                self.cleanup_staging();
                self.repo.release_transaction();
                info!(
                    metadata = self.stats.metadata_objects_written,
                    content = self.stats.content_objects_written,
                    bytes = self.stats.content_bytes_written,
                    refs = self.stats.refs_updated,
                    "transaction committed"
                );
                Ok(self.stats)
            }
            Err(e) => {
                warn!(error = %e, "transaction commit failed; aborting");
                self.finish_abort();
                Err(e)
            }
        }
    }

    fn publish(&mut self) -> Result<()> {
        let mut undo = Vec::new();
        let result = self.publish_recording(&mut undo);
        if result.is_err() {
            rollback(self.repo, undo);
        }
        result
    }

    fn publish_recording(&mut self, undo: &mut Vec<Undo>) -> Result<()> {
        let repo = self.repo;
        let mode = repo.mode();
        let objects = repo.objects_path();

        let mut ordered: Vec<(Checksum, ObjectType)> = self.staged.iter().copied().collect();
        ordered.sort_by_key(|(c, k)| (publish_rank(*k), *c));

        let mut touched = BTreeSet::new();
        for (checksum, kind) in ordered {
            let relpath = store::object_relpath(mode, &checksum, kind);
            let dest = objects.join(&relpath);

            // content-addressed objects published meanwhile by someone else
            let exists = dest.symlink_metadata().is_ok();
            if kind != ObjectType::CommitMeta && exists {
                continue;
            }

            let parent = match dest.parent() {
                Some(p) => p.to_path_buf(),
                None => continue,
            };
            fs::create_dir_all(&parent).with_path(&parent)?;

            if kind == ObjectType::File && mode == RepoMode::BareUser {
                let sidecar = store::sidecar_relpath(&checksum);
                let src = self.staging.join(&sidecar);
                let target = objects.join(&sidecar);
                fs::rename(&src, &target).with_path(&target)?;
                undo.push(Undo::Created(target));
            }

            let previous = if exists {
                Some(fs::read(&dest).with_path(&dest)?)
            } else {
                None
            };
            let src = self.staging.join(&relpath);
            fs::rename(&src, &dest).with_path(&dest)?;
            undo.push(match previous {
                Some(bytes) => Undo::Replaced(dest, bytes),
                None => Undo::Created(dest),
            });
            debug!(object = %checksum, %kind, "published object");
            touched.insert(parent);
        }

        if self.fsync {
            for dir in &touched {
                fsync_dir(dir)?;
            }
        }

        for (name, target) in &self.ref_updates {
            let previous = match read_ref(repo, name) {
                Ok(c) => Some(c),
                Err(Error::RefNotFound(_)) => None,
                Err(e) => return Err(e),
            };
            match target {
                Some(checksum) => write_ref(repo, name, checksum)?,
                None => match delete_ref(repo, name) {
                    Ok(()) | Err(Error::RefNotFound(_)) => {}
                    Err(e) => return Err(e),
                },
            }
            undo.push(Undo::Ref(name.clone(), previous));
            self.stats.refs_updated += 1;
        }

        Ok(())
    }

    /// discard staged objects and queued refs; a no-op once finished
    pub fn abort(&mut self) -> Result<()> {
        match self.state {
            TransactionState::Committed | TransactionState::Aborted | TransactionState::Idle => {
                Ok(())
            }
            TransactionState::Prepared | TransactionState::Committing => {
                let result = remove_staging(&self.staging);
                self.state = TransactionState::Aborted;
                self.staged.clear();
                self.ref_updates.clear();
                self.repo.release_transaction();
                debug!("transaction aborted");
                result
            }
        }
    }

    fn finish_abort(&mut self) {
        if let Err(e) = self.abort() {
            warn!(error = %e, staging = %self.staging.display(), "failed to clean up staging");
        }
    }

    fn cleanup_staging(&self) {
        if let Err(e) = remove_staging(&self.staging) {
            warn!(error = %e, staging = %self.staging.display(), "failed to remove staging");
        }
    }
}

/// one step of a publish that a failed commit has to take back
enum Undo {
    Created(PathBuf),
    Replaced(PathBuf, Vec<u8>),
    Ref(String, Option<Checksum>),
}

/// put the store back the way it was before a failed publish
fn rollback(repo: &Repo, undo: Vec<Undo>) {
    for step in undo.into_iter().rev() {
        let result = match &step {
            Undo::Created(path) => fs::remove_file(path).with_path(path),
            Undo::Replaced(path, bytes) => store::write_atomic(repo, path, bytes),
            Undo::Ref(name, Some(checksum)) => write_ref(repo, name, checksum),
            Undo::Ref(name, None) => match delete_ref(repo, name) {
                Ok(()) | Err(Error::RefNotFound(_)) => Ok(()),
                Err(e) => Err(e),
            },
        };
        if let Err(e) = result {
            warn!(error = %e, "rollback step failed");
        }
    }
    debug!("rolled back partial publish");
}

fn remove_staging(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if matches!(
            self.state,
            TransactionState::Prepared | TransactionState::Committing
        ) {
            self.finish_abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refs::ref_exists;
    use crate::repo::InitOptions;
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

    fn header() -> FileHeader {
        FileHeader::regular(0, 0, 0o644)
    }

    #[test]
    fn test_one_transaction_per_handle() {
        let (_dir, repo) = test_repo();
        let mut txn = repo.prepare_transaction().unwrap();
        assert!(matches!(
            repo.prepare_transaction(),
            Err(Error::TransactionInProgress)
        ));

        txn.abort().unwrap();
        assert!(!repo.transaction_open());
        let _again = repo.prepare_transaction().unwrap();
    }

    #[test]
    fn test_independent_handles() {
        let (dir, repo) = test_repo();
        let other = Repo::open(&dir.path().join("repo")).unwrap();

        let _a = repo.prepare_transaction().unwrap();
        let _b = other.prepare_transaction().unwrap();
    }

    #[test]
    fn test_objects_invisible_until_commit() {
        let (_dir, repo) = test_repo();
        let mut txn = repo.prepare_transaction().unwrap();

        let file = txn.write_file_bytes(&header(), b"data").unwrap();
        let meta = txn.write_dirmeta(&DirMeta::default()).unwrap();

        assert!(txn.contains(&file.checksum, ObjectType::File));
        assert!(!store::object_exists(&repo, &file.checksum, ObjectType::File));
        assert!(!store::object_exists(&repo, &meta, ObjectType::DirMeta));

        let stats = txn.commit().unwrap();
        assert_eq!(stats.content_objects_written, 1);
        assert_eq!(stats.metadata_objects_written, 1);
        assert!(store::object_exists(&repo, &file.checksum, ObjectType::File));
        assert!(store::object_exists(&repo, &meta, ObjectType::DirMeta));
        assert_eq!(txn.state(), TransactionState::Committed);
        assert!(!txn.staging_path().exists());
    }

    #[test]
    fn test_abort_discards_everything() {
        let (_dir, repo) = test_repo();
        let mut txn = repo.prepare_transaction().unwrap();
        let file = txn.write_file_bytes(&header(), b"data").unwrap();
        let meta = txn.write_dirmeta(&DirMeta::default()).unwrap();
        txn.set_ref("main", Some(meta)).unwrap();
        let staging = txn.staging_path().to_path_buf();

        txn.abort().unwrap();
        txn.abort().unwrap();

        assert_eq!(txn.state(), TransactionState::Aborted);
        assert!(!staging.exists());
        assert!(!store::object_exists(&repo, &file.checksum, ObjectType::File));
        assert!(!ref_exists(&repo, "main"));
        assert!(store::list_objects(&repo).unwrap().is_empty());
    }

    #[test]
    fn test_drop_aborts() {
        let (_dir, repo) = test_repo();
        let staging = {
            let mut txn = repo.prepare_transaction().unwrap();
            txn.write_file_bytes(&header(), b"dropped").unwrap();
            txn.staging_path().to_path_buf()
        };
        assert!(!staging.exists());
        assert!(!repo.transaction_open());
        assert!(store::list_objects(&repo).unwrap().is_empty());
    }

    #[test]
    fn test_refs_applied_on_commit() {
        let (_dir, repo) = test_repo();
        let mut txn = repo.prepare_transaction().unwrap();
        let meta = txn.write_dirmeta(&DirMeta::default()).unwrap();
        let tree = txn.write_dirtree(&DirTree::default()).unwrap();
        let commit = txn.write_commit(&Commit::new(tree, meta, None)).unwrap();
        txn.set_ref("os/stable", Some(commit)).unwrap();

        assert!(!ref_exists(&repo, "os/stable"));
        let stats = txn.commit().unwrap();

        assert_eq!(stats.refs_updated, 1);
        assert_eq!(read_ref(&repo, "os/stable").unwrap(), commit);
    }

    #[test]
    fn test_existing_objects_not_rewritten() {
        let (_dir, repo) = test_repo();
        let mut txn = repo.prepare_transaction().unwrap();
        txn.write_file_bytes(&header(), b"dup").unwrap();
        txn.commit().unwrap();

        let mut txn = repo.prepare_transaction().unwrap();
        let again = txn.write_file_bytes(&header(), b"dup").unwrap();
        assert!(!again.written);
        let stats = txn.commit().unwrap();
        assert_eq!(stats.content_objects_total, 1);
        assert_eq!(stats.content_objects_written, 0);
    }

    #[test]
    fn test_detached_metadata_needs_commit() {
        let (_dir, repo) = test_repo();
        let mut txn = repo.prepare_transaction().unwrap();
        let mut meta = DetachedMetadata::new();
        meta.insert("k".into(), vec![1]);

        assert!(txn
            .write_detached_metadata(&Checksum::of(b"nope"), &meta)
            .is_err());

        let dm = txn.write_dirmeta(&DirMeta::default()).unwrap();
        let tree = txn.write_dirtree(&DirTree::default()).unwrap();
        let commit = txn.write_commit(&Commit::new(tree, dm, None)).unwrap();
        txn.write_detached_metadata(&commit, &meta).unwrap();
        assert_eq!(txn.read_detached_metadata(&commit).unwrap(), Some(meta.clone()));
        txn.commit().unwrap();

        assert_eq!(store::read_detached_metadata(&repo, &commit).unwrap(), Some(meta));
    }

    #[test]
    fn test_write_after_commit_fails() {
        let (_dir, repo) = test_repo();
        let mut txn = repo.prepare_transaction().unwrap();
        txn.commit().unwrap();
        assert!(matches!(
            txn.write_dirmeta(&DirMeta::default()),
            Err(Error::NoTransaction)
        ));
    }

    #[test]
    fn test_failed_ref_write_rolls_back_objects() {
        let (dir, repo) = test_repo();
        let mut txn = repo.prepare_transaction().unwrap();
        txn.write_file_bytes(&header(), b"kept").unwrap();
        txn.commit().unwrap();
        let before = store::list_objects(&repo).unwrap();

        // refs/heads/x cannot become a directory
        let heads = dir.path().join("repo/refs/heads");
        std::os::unix::fs::symlink(dir.path().join("nowhere"), heads.join("x")).unwrap();
        write_ref(&repo, "main", &Checksum::of(b"old")).unwrap();

        let mut txn = repo.prepare_transaction().unwrap();
        let file = txn.write_file_bytes(&header(), b"new").unwrap();
        txn.write_file_bytes(&header(), b"kept").unwrap();
        let meta = txn.write_dirmeta(&DirMeta::default()).unwrap();
        let tree = txn.write_dirtree(&DirTree::default()).unwrap();
        let commit = txn.write_commit(&Commit::new(tree, meta, None)).unwrap();
        txn.set_ref("main", Some(commit)).unwrap();
        txn.set_ref("x/y", Some(commit)).unwrap();
        let staging = txn.staging_path().to_path_buf();

        assert!(txn.commit().is_err());
        assert_eq!(txn.state(), TransactionState::Aborted);
        assert!(!staging.exists());
        assert!(!repo.transaction_open());

        assert_eq!(store::list_objects(&repo).unwrap(), before);
        assert!(!store::object_exists(&repo, &file.checksum, ObjectType::File));
        assert!(!store::object_exists(&repo, &commit, ObjectType::Commit));
        assert_eq!(read_ref(&repo, "main").unwrap(), Checksum::of(b"old"));
    }
}
