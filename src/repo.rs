use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard};

use nix::fcntl::{Flock, FlockArg};
use nix::unistd::{access, AccessFlags};
use tracing::{debug, info};

use crate::config::{Config, RepoMode};
use crate::error::{Error, IoResultExt, Result};

/// options for creating a repository
#[derive(Clone, Debug, Default)]
pub struct InitOptions {
    pub mode: RepoMode,
}

/// an otree repository handle
///
/// a handle may have at most one open transaction at a time; independent
/// handles (or processes) may each hold their own.
pub struct Repo {
    path: PathBuf,
    config: RwLock<Config>,
    txn_open: AtomicBool,
}

impl Repo {
    /// initialize a new repository at the given path
    pub fn init(path: &Path, opts: InitOptions) -> Result<Self> {
        let config_path = path.join("config.toml");
        if config_path.exists() {
            return Err(Error::RepoExists(path.to_path_buf()));
        }

        for sub in ["objects", "refs/heads", "state", "deltas", "tmp"] {
            let dir = path.join(sub);
            std::fs::create_dir_all(&dir).with_path(&dir)?;
        }

        let config = Config::new(opts.mode);
        config.save(&config_path)?;
        info!(path = %path.display(), mode = %opts.mode, "initialized repository");

        Ok(Self::from_parts(path, config))
    }

    /// open an existing repository
    pub fn open(path: &Path) -> Result<Self> {
        let config_path = path.join("config.toml");
        if !config_path.exists() {
            return Err(Error::NoRepo(path.to_path_buf()));
        }

        let config = Config::load(&config_path)?;
        Ok(Self::from_parts(path, config))
    }

    fn from_parts(path: &Path, config: Config) -> Self {
        Self {
            path: path.to_path_buf(),
            config: RwLock::new(config),
            txn_open: AtomicBool::new(false),
        }
    }

    /// repository root path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// repository configuration
    pub fn config(&self) -> RwLockReadGuard<'_, Config> {
        self.config.read().unwrap_or_else(|e| e.into_inner())
    }

    /// apply a change to the configuration and persist it
    pub fn update_config<T>(&self, f: impl FnOnce(&mut Config) -> Result<T>) -> Result<T> {
        let mut guard = self.config.write().unwrap_or_else(|e| e.into_inner());
        let mut next = guard.clone();
        let out = f(&mut next)?;
        next.save(&self.config_path())?;
        *guard = next;
        Ok(out)
    }

    pub fn mode(&self) -> RepoMode {
        self.config().core.mode
    }

    pub fn fsync_enabled(&self) -> bool {
        self.config().core.fsync
    }

    pub fn tombstone_commits_enabled(&self) -> bool {
        self.config().core.tombstone_commits
    }

    /// turn on tombstone commits; returns false if they were already enabled
    pub fn enable_tombstone_commits(&self) -> Result<bool> {
        if self.tombstone_commits_enabled() {
            return Ok(false);
        }
        self.update_config(|c| {
            c.core.tombstone_commits = true;
            Ok(())
        })?;
        info!("enabled tombstone commits");
        Ok(true)
    }

    /// register a remote (configuration only)
    pub fn remote_add(&self, name: &str, url: &str) -> Result<()> {
        self.update_config(|c| c.add_remote(name, url))
    }

    pub fn remote_remove(&self, name: &str) -> Result<()> {
        self.update_config(|c| c.remove_remote(name))
    }

    /// true if the current process may create objects in this repository
    pub fn is_writable(&self) -> bool {
        access(&self.objects_path(), AccessFlags::W_OK).is_ok()
            && access(&self.tmp_path(), AccessFlags::W_OK).is_ok()
    }

    pub fn ensure_writable(&self) -> Result<()> {
        if self.is_writable() {
            Ok(())
        } else {
            Err(Error::NotWritable(self.path.clone()))
        }
    }

    /// path to config.toml
    pub fn config_path(&self) -> PathBuf {
        self.path.join("config.toml")
    }

    /// path to objects directory
    pub fn objects_path(&self) -> PathBuf {
        self.path.join("objects")
    }

    /// path to refs directory
    pub fn refs_path(&self) -> PathBuf {
        self.path.join("refs/heads")
    }

    /// path to state directory (partial commit markers)
    pub fn state_path(&self) -> PathBuf {
        self.path.join("state")
    }

    /// path to static delta artifacts
    pub fn deltas_path(&self) -> PathBuf {
        self.path.join("deltas")
    }

    /// path to tmp directory (staging and atomic writes)
    pub fn tmp_path(&self) -> PathBuf {
        self.path.join("tmp")
    }

    pub fn summary_path(&self) -> PathBuf {
        self.path.join("summary")
    }

    /// path to lock file
    pub fn lock_path(&self) -> PathBuf {
        self.path.join(".lock")
    }

    fn partial_marker(&self, commit: &crate::Checksum) -> PathBuf {
        self.state_path().join(format!("{}.commitpartial", commit))
    }

    /// whether a commit is flagged as partial (object closure incomplete)
    pub fn is_partial(&self, commit: &crate::Checksum) -> bool {
        self.partial_marker(commit).exists()
    }

    pub fn mark_partial(&self, commit: &crate::Checksum) -> Result<()> {
        let path = self.partial_marker(commit);
        File::create(&path).with_path(&path)?;
        Ok(())
    }

    /// returns true if a marker was removed
    pub fn clear_partial(&self, commit: &crate::Checksum) -> Result<bool> {
        let path = self.partial_marker(commit);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::Io { path, source: e }),
        }
    }

    /// acquire the shared lock held by writers during a transaction
    pub fn lock_shared(&self) -> Result<RepoLock> {
        self.acquire(FlockArg::LockSharedNonblock)
    }

    /// acquire exclusive lock on repository (maintenance operations)
    /// returns a guard that releases the lock on drop
    pub fn lock(&self) -> Result<RepoLock> {
        self.acquire(FlockArg::LockExclusiveNonblock)
    }

    /// try to acquire exclusive lock, returning None if already locked
    pub fn try_lock(&self) -> Result<Option<RepoLock>> {
        let file = self.open_lock_file()?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => Ok(Some(RepoLock { flock })),
            Err((_, nix::errno::Errno::EWOULDBLOCK)) => Ok(None),
            Err(_) => Err(Error::LockContention),
        }
    }

    fn acquire(&self, arg: FlockArg) -> Result<RepoLock> {
        let file = self.open_lock_file()?;
        let flock = Flock::lock(file, arg).map_err(|_| Error::LockContention)?;
        Ok(RepoLock { flock })
    }

    fn open_lock_file(&self) -> Result<File> {
        let lock_path = self.lock_path();
        File::options()
            .create(true)
            .append(true)
            .open(&lock_path)
            .with_path(&lock_path)
    }

    /// claim the per-handle transaction slot
    pub(crate) fn claim_transaction(&self) -> Result<()> {
        self.txn_open
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| Error::TransactionInProgress)
    }

    pub(crate) fn release_transaction(&self) {
        debug!("transaction slot released");
        self.txn_open.store(false, Ordering::Release);
    }

    pub fn transaction_open(&self) -> bool {
        self.txn_open.load(Ordering::Acquire)
    }
}

/// guard that holds repository lock until dropped
pub struct RepoLock {
    #[allow(dead_code)]
    flock: Flock<File>,
}
// lock is released automatically when Flock is dropped

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_repo_init() {
        let dir = tempdir().unwrap();
        let repo_path = dir.path().join("test-repo");

        let repo = Repo::init(&repo_path, InitOptions { mode: RepoMode::BareUser }).unwrap();

        assert!(repo_path.join("objects").is_dir());
        assert!(repo_path.join("refs/heads").is_dir());
        assert!(repo_path.join("state").is_dir());
        assert!(repo_path.join("deltas").is_dir());
        assert!(repo_path.join("tmp").is_dir());
        assert!(repo_path.join("config.toml").is_file());
        assert_eq!(repo.mode(), RepoMode::BareUser);
        assert!(repo.is_writable());
    }

    #[test]
    fn test_repo_init_already_exists() {
        let dir = tempdir().unwrap();
        let repo_path = dir.path().join("test-repo");

        Repo::init(&repo_path, InitOptions::default()).unwrap();
        let result = Repo::init(&repo_path, InitOptions::default());

        assert!(matches!(result, Err(Error::RepoExists(_))));
    }

    #[test]
    fn test_repo_open() {
        let dir = tempdir().unwrap();
        let repo_path = dir.path().join("test-repo");

        Repo::init(&repo_path, InitOptions { mode: RepoMode::Archive }).unwrap();
        let repo = Repo::open(&repo_path).unwrap();

        assert_eq!(repo.path(), repo_path);
        assert_eq!(repo.mode(), RepoMode::Archive);
    }

    #[test]
    fn test_repo_open_not_found() {
        let dir = tempdir().unwrap();
        let result = Repo::open(&dir.path().join("nonexistent"));
        assert!(matches!(result, Err(Error::NoRepo(_))));
    }

    #[test]
    fn test_repo_lock() {
        let dir = tempdir().unwrap();
        let repo = Repo::init(&dir.path().join("r"), InitOptions::default()).unwrap();

        let lock = repo.lock().unwrap();
        assert!(repo.try_lock().unwrap().is_none());
        drop(lock);

        assert!(repo.try_lock().unwrap().is_some());
    }

    #[test]
    fn test_shared_locks_coexist() {
        let dir = tempdir().unwrap();
        let repo = Repo::init(&dir.path().join("r"), InitOptions::default()).unwrap();

        let a = repo.lock_shared().unwrap();
        let b = repo.lock_shared().unwrap();
        assert!(repo.try_lock().unwrap().is_none());
        drop((a, b));
        assert!(repo.try_lock().unwrap().is_some());
    }

    #[test]
    fn test_enable_tombstones_idempotent() {
        let dir = tempdir().unwrap();
        let repo_path = dir.path().join("r");
        let repo = Repo::init(&repo_path, InitOptions::default()).unwrap();

        assert!(!repo.tombstone_commits_enabled());
        assert!(repo.enable_tombstone_commits().unwrap());
        assert!(!repo.enable_tombstone_commits().unwrap());

        let reopened = Repo::open(&repo_path).unwrap();
        assert!(reopened.tombstone_commits_enabled());
    }

    #[test]
    fn test_remote_bookkeeping_persists() {
        let dir = tempdir().unwrap();
        let repo_path = dir.path().join("r");
        let repo = Repo::init(&repo_path, InitOptions::default()).unwrap();

        repo.remote_add("origin", "https://example.com/repo").unwrap();
        let reopened = Repo::open(&repo_path).unwrap();
        assert_eq!(reopened.config().remotes.len(), 1);
        assert_eq!(reopened.config().remotes[0].name, "origin");

        reopened.remote_remove("origin").unwrap();
        assert!(reopened.config().remotes.is_empty());
    }

    #[test]
    fn test_partial_markers() {
        let dir = tempdir().unwrap();
        let repo = Repo::init(&dir.path().join("r"), InitOptions::default()).unwrap();
        let c = crate::Checksum::of(b"commit");

        assert!(!repo.is_partial(&c));
        repo.mark_partial(&c).unwrap();
        assert!(repo.is_partial(&c));
        assert!(repo.clear_partial(&c).unwrap());
        assert!(!repo.clear_partial(&c).unwrap());
    }
}
