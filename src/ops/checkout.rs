use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::cancel::{self, Cancellable};
use crate::checksum::Checksum;
use crate::config::RepoMode;
use crate::error::{Error, IoResultExt, Result};
use crate::fs::{
    apply_metadata, apply_permissions, copy_to_new_file, create_symlink, remove_existing,
    try_hardlink, LinkOutcome,
};
use crate::refs::resolve_ref;
use crate::repo::Repo;
use crate::store;
use crate::types::{DirMeta, DirTree};

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// checkout options
#[derive(Debug, Clone, Default)]
pub struct CheckoutOptions {
    /// do not restore ownership or xattrs
    pub user_mode: bool,
    /// merge into an existing destination, replacing clashing files
    pub union: bool,
    /// a missing subpath is a no-op instead of an error
    pub allow_noent: bool,
    /// fail instead of copying when objects cannot be hardlinked
    pub require_hardlinks: bool,
    /// only check out this part of the tree
    pub subpath: Option<String>,
    /// apply `.wh.` entries as deletions instead of writing them
    pub whiteouts: bool,
}

struct Checkout<'a> {
    repo: &'a Repo,
    opts: &'a CheckoutOptions,
    can_link: bool,
    cancel: Option<&'a Cancellable>,
}

/// the tree or file a checkout starts from
enum Source {
    Dir { tree: Checksum, meta: Checksum },
    File(Checksum),
}

/// whether objects of this repository can be hardlinked for the checkout
///
/// the object inode must already carry exactly the metadata the checkout
/// wants: real ownership in a bare repo, only permissions in user mode of
/// a bare-user repo. archive objects are compressed.
fn hardlinks_possible(mode: RepoMode, user_mode: bool) -> bool {
    match mode {
        RepoMode::Bare => !user_mode,
        RepoMode::BareUser => user_mode,
        RepoMode::Archive => false,
    }
}

/// check out a ref or commit to `dest`
///
/// without `union` the destination must be absent or an empty directory.
pub fn checkout(
    repo: &Repo,
    rev: &str,
    dest: &Path,
    opts: &CheckoutOptions,
    cancel: Option<&Cancellable>,
) -> Result<()> {
    let checksum = resolve_ref(repo, rev)?;
    let (commit, _) = store::load_commit(repo, &checksum)?;

    let can_link = hardlinks_possible(repo.mode(), opts.user_mode);
    if opts.require_hardlinks && !can_link {
        return Err(Error::InvalidArgument(format!(
            "hardlinks required but {} repository objects cannot be linked{}",
            repo.mode(),
            if opts.user_mode { " in user mode" } else { "" }
        )));
    }

    let source = match opts.subpath.as_deref() {
        None => Source::Dir {
            tree: commit.root_tree,
            meta: commit.root_meta,
        },
        Some(subpath) => match resolve_subpath(repo, &commit.root_tree, &commit.root_meta, subpath)
        {
            Ok(s) => s,
            Err(Error::PathNotFound(_)) if opts.allow_noent => {
                debug!(subpath, "subpath missing; nothing to check out");
                return Ok(());
            }
            Err(e) => return Err(e),
        },
    };

    let ctx = Checkout {
        repo,
        opts,
        can_link,
        cancel,
    };

    match source {
        Source::Dir { tree, meta } => {
            prepare_root(dest, opts.union)?;
            ctx.checkout_dir(&tree, &meta, dest)?;
        }
        Source::File(file) => {
            if !opts.union && dest.symlink_metadata().is_ok() {
                return Err(Error::AlreadyExists(dest.to_path_buf()));
            }
            ctx.checkout_file(&file, dest)?;
        }
    }

    info!(commit = %checksum, dest = %dest.display(), "checked out");
    Ok(())
}

fn resolve_subpath(
    repo: &Repo,
    root_tree: &Checksum,
    root_meta: &Checksum,
    subpath: &str,
) -> Result<Source> {
    let components: Vec<&str> = subpath
        .split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .collect();
    let mut tree = *root_tree;
    let mut meta = *root_meta;

    for (i, name) in components.iter().enumerate() {
        let dirtree = store::load_dirtree(repo, &tree)?;
        if let Some(dir) = dirtree.dir(name) {
            tree = dir.tree;
            meta = dir.meta;
            continue;
        }
        match dirtree.file(name) {
            Some(file) if i == components.len() - 1 => return Ok(Source::File(file.checksum)),
            _ => return Err(Error::PathNotFound(subpath.to_string())),
        }
    }
    Ok(Source::Dir { tree, meta })
}

fn prepare_root(dest: &Path, union: bool) -> Result<()> {
    match fs::symlink_metadata(dest) {
        Ok(meta) if !meta.is_dir() => Err(Error::AlreadyExists(dest.to_path_buf())),
        Ok(_) if union => Ok(()),
        Ok(_) => {
            if dest.read_dir().with_path(dest)?.next().is_some() {
                Err(Error::TargetNotEmpty(dest.to_path_buf()))
            } else {
                Ok(())
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(dest).with_path(dest)
        }
        Err(e) => Err(Error::Io {
            path: dest.to_path_buf(),
            source: e,
        }),
    }
}

/// remove whatever is at `path`, directories included
fn remove_any(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).with_path(path),
        Ok(_) => fs::remove_file(path).with_path(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

impl Checkout<'_> {
    fn checkout_dir(&self, tree: &Checksum, meta: &Checksum, dest: &Path) -> Result<()> {
        let dirtree = store::load_dirtree(self.repo, tree)?;
        let dirmeta = store::load_dirmeta(self.repo, meta)?;

        match fs::symlink_metadata(dest) {
            Ok(m) if m.is_dir() => {}
            Ok(_) if self.opts.union => {
                remove_any(dest)?;
                fs::create_dir(dest).with_path(dest)?;
            }
            Ok(_) => return Err(Error::AlreadyExists(dest.to_path_buf())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::create_dir(dest).with_path(dest)?;
            }
            Err(e) => {
                return Err(Error::Io {
                    path: dest.to_path_buf(),
                    source: e,
                })
            }
        }
        // keep the directory writable until its contents are in place
        apply_permissions(dest, 0o700)?;

        if self.opts.whiteouts {
            self.process_whiteouts(&dirtree, dest)?;
        }

        for file in &dirtree.files {
            cancel::check(self.cancel)?;
            if self.opts.whiteouts && file.name.starts_with(WHITEOUT_PREFIX) {
                continue;
            }
            self.checkout_file(&file.checksum, &dest.join(&file.name))?;
        }
        for dir in &dirtree.dirs {
            cancel::check(self.cancel)?;
            self.checkout_dir(&dir.tree, &dir.meta, &dest.join(&dir.name))?;
        }

        self.apply_dirmeta(dest, &dirmeta)
    }

    fn process_whiteouts(&self, dirtree: &DirTree, dest: &Path) -> Result<()> {
        for file in &dirtree.files {
            if file.name == OPAQUE_WHITEOUT {
                for entry in fs::read_dir(dest).with_path(dest)? {
                    let entry = entry.with_path(dest)?;
                    remove_any(&entry.path())?;
                }
                debug!(dir = %dest.display(), "opaque whiteout");
            } else if let Some(target) = file.name.strip_prefix(WHITEOUT_PREFIX) {
                remove_any(&dest.join(target))?;
                debug!(path = %dest.join(target).display(), "whiteout");
            }
        }
        Ok(())
    }

    fn apply_dirmeta(&self, dest: &Path, meta: &DirMeta) -> Result<()> {
        if self.opts.user_mode {
            apply_permissions(dest, meta.mode)
        } else {
            apply_metadata(dest, meta.uid, meta.gid, meta.mode, &meta.xattrs)
        }
    }

    fn checkout_file(&self, checksum: &Checksum, dest: &Path) -> Result<()> {
        if self.opts.union {
            remove_existing(dest)?;
        }

        let mut obj = store::open_file(self.repo, checksum)?;
        if obj.header.is_symlink() {
            let mut target = String::new();
            obj.content
                .read_to_string(&mut target)
                .with_path(store::content_path(self.repo, checksum))?;
            let owner = (!self.opts.user_mode).then_some((obj.header.uid, obj.header.gid));
            return create_symlink(dest, &target, owner);
        }

        // bare-user inodes lose special bits and gain owner-read
        let inode_matches = self.repo.mode() != RepoMode::BareUser
            || store::bare_user_permissions(obj.header.mode) == obj.header.mode & 0o7777;
        if self.can_link && !inode_matches && self.opts.require_hardlinks {
            return Err(Error::InvalidArgument(format!(
                "cannot hardlink {}: mode {:o} is not kept on the stored object",
                dest.display(),
                obj.header.mode & 0o7777
            )));
        }
        if self.can_link && inode_matches {
            match try_hardlink(&store::content_path(self.repo, checksum), dest)? {
                LinkOutcome::Linked => return Ok(()),
                LinkOutcome::CrossDevice if self.opts.require_hardlinks => {
                    return Err(Error::InvalidArgument(format!(
                        "cannot hardlink {} across filesystems",
                        dest.display()
                    )))
                }
                LinkOutcome::CrossDevice => {
                    warn!(path = %dest.display(), "hardlink not possible; copying");
                }
            }
        }

        copy_to_new_file(&mut obj.content, dest)?;
        let header = &obj.header;
        if self.opts.user_mode {
            apply_permissions(dest, header.mode)
        } else {
            apply_metadata(dest, header.uid, header.gid, header.mode, &header.xattrs)
        }
    }
}

/// one line of a batch checkout control file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntry {
    pub rev: String,
    pub dest: PathBuf,
}

/// outcome of a batch checkout; failures do not stop the batch
#[derive(Debug, Default)]
pub struct BatchCheckoutReport {
    pub succeeded: Vec<BatchEntry>,
    pub failed: Vec<(BatchEntry, Error)>,
}

impl BatchCheckoutReport {
    pub fn is_ok(&self) -> bool {
        self.failed.is_empty()
    }
}

/// parse `REV DEST` lines; `#` starts a comment line and relative
/// destinations are taken relative to `base`
pub fn parse_batch(content: &str, base: &Path) -> Result<Vec<BatchEntry>> {
    let mut out = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (rev, dest) = line
            .split_once(char::is_whitespace)
            .map(|(r, d)| (r, d.trim()))
            .filter(|(_, d)| !d.is_empty())
            .ok_or_else(|| {
                Error::InvalidArgument(format!("line {}: expected REV DEST: {}", lineno + 1, line))
            })?;
        let dest = Path::new(dest);
        out.push(BatchEntry {
            rev: rev.to_string(),
            dest: if dest.is_absolute() {
                dest.to_path_buf()
            } else {
                base.join(dest)
            },
        });
    }
    Ok(out)
}

/// run every checkout listed in `control`, collecting failures
pub fn checkout_batch(
    repo: &Repo,
    control: &Path,
    base: &Path,
    opts: &CheckoutOptions,
    cancel: Option<&Cancellable>,
) -> Result<BatchCheckoutReport> {
    let content = fs::read_to_string(control).with_path(control)?;
    let entries = parse_batch(&content, base)?;

    let mut report = BatchCheckoutReport::default();
    for entry in entries {
        cancel::check(cancel)?;
        match checkout(repo, &entry.rev, &entry.dest, opts, cancel) {
            Ok(()) => report.succeeded.push(entry),
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                warn!(rev = %entry.rev, dest = %entry.dest.display(), error = %e, "checkout failed");
                report.failed.push((entry, e));
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::commit::{commit, CommitOptions, TreeSource};
    use crate::repo::InitOptions;
    use std::os::unix::fs::{symlink, MetadataExt, PermissionsExt};
    use tempfile::{tempdir, TempDir};

    fn test_repo_with(mode: RepoMode) -> (TempDir, Repo) {
        let dir = tempdir().unwrap();
        let repo = Repo::init(&dir.path().join("repo"), InitOptions { mode }).unwrap();
        (dir, repo)
    }

    fn test_repo() -> (TempDir, Repo) {
        test_repo_with(RepoMode::BareUser)
    }

    fn commit_dir(repo: &Repo, src: &Path, branch: &str) -> Checksum {
        let opts = CommitOptions {
            branch: Some(branch.to_string()),
            skip_xattrs: true,
            ..Default::default()
        };
        commit(repo, &[TreeSource::Dir(src.to_path_buf())], &opts, None)
            .unwrap()
            .checksum
    }

    fn sample(dir: &Path) -> PathBuf {
        let src = dir.join("src");
        fs::create_dir_all(src.join("bin")).unwrap();
        fs::write(src.join("bin/tool"), "#!/bin/sh\n").unwrap();
        fs::set_permissions(src.join("bin/tool"), fs::Permissions::from_mode(0o755)).unwrap();
        fs::write(src.join("data"), "payload").unwrap();
        fs::set_permissions(src.join("data"), fs::Permissions::from_mode(0o640)).unwrap();
        symlink("bin/tool", src.join("link")).unwrap();
        src
    }

    fn user() -> CheckoutOptions {
        CheckoutOptions {
            user_mode: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_round_trip() {
        for mode in [RepoMode::BareUser, RepoMode::Archive] {
            let (dir, repo) = test_repo_with(mode);
            let src = sample(dir.path());
            commit_dir(&repo, &src, "main");

            let out = dir.path().join("out");
            checkout(&repo, "main", &out, &user(), None).unwrap();

            assert_eq!(fs::read_to_string(out.join("data")).unwrap(), "payload");
            assert_eq!(fs::read_to_string(out.join("bin/tool")).unwrap(), "#!/bin/sh\n");
            let perms = |p: &Path| fs::metadata(p).unwrap().permissions().mode() & 0o7777;
            assert_eq!(perms(&out.join("data")), 0o640);
            assert_eq!(perms(&out.join("bin/tool")), 0o755);
            assert_eq!(fs::read_link(out.join("link")).unwrap(), Path::new("bin/tool"));
        }
    }

    #[test]
    fn test_user_mode_hardlinks_in_bare_user() {
        let (dir, repo) = test_repo();
        let src = sample(dir.path());
        commit_dir(&repo, &src, "main");

        let out = dir.path().join("out");
        let opts = CheckoutOptions {
            require_hardlinks: true,
            ..user()
        };
        checkout(&repo, "main", &out, &opts, None).unwrap();
        assert!(fs::metadata(out.join("data")).unwrap().nlink() >= 2);
    }

    #[test]
    fn test_user_mode_copies_when_mode_not_on_object() {
        let (dir, repo) = test_repo();
        let src = dir.path().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("suid"), "x").unwrap();
        fs::set_permissions(src.join("suid"), fs::Permissions::from_mode(0o4755)).unwrap();
        fs::write(src.join("plain"), "y").unwrap();
        fs::set_permissions(src.join("plain"), fs::Permissions::from_mode(0o644)).unwrap();
        commit_dir(&repo, &src, "main");

        let out = dir.path().join("out");
        checkout(&repo, "main", &out, &user(), None).unwrap();
        let suid = fs::metadata(out.join("suid")).unwrap();
        assert_eq!(suid.permissions().mode() & 0o7777, 0o4755);
        assert_eq!(suid.nlink(), 1);
        assert!(fs::metadata(out.join("plain")).unwrap().nlink() >= 2);

        let strict = CheckoutOptions {
            require_hardlinks: true,
            ..user()
        };
        let err = checkout(&repo, "main", &dir.path().join("strict"), &strict, None).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_require_hardlinks_rejected_for_archive() {
        let (dir, repo) = test_repo_with(RepoMode::Archive);
        let src = sample(dir.path());
        commit_dir(&repo, &src, "main");

        let opts = CheckoutOptions {
            require_hardlinks: true,
            ..user()
        };
        let err = checkout(&repo, "main", &dir.path().join("out"), &opts, None).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_target_not_empty() {
        let (dir, repo) = test_repo();
        let src = sample(dir.path());
        commit_dir(&repo, &src, "main");

        let out = dir.path().join("out");
        fs::create_dir(&out).unwrap();
        fs::write(out.join("existing"), "keep").unwrap();
        fs::write(out.join("data"), "old").unwrap();

        let err = checkout(&repo, "main", &out, &user(), None).unwrap_err();
        assert!(matches!(err, Error::TargetNotEmpty(_)));

        let opts = CheckoutOptions {
            union: true,
            ..user()
        };
        checkout(&repo, "main", &out, &opts, None).unwrap();
        assert_eq!(fs::read_to_string(out.join("existing")).unwrap(), "keep");
        assert_eq!(fs::read_to_string(out.join("data")).unwrap(), "payload");
    }

    #[test]
    fn test_subpath() {
        let (dir, repo) = test_repo();
        let src = sample(dir.path());
        commit_dir(&repo, &src, "main");

        let out = dir.path().join("bin-only");
        let opts = CheckoutOptions {
            subpath: Some("/bin".to_string()),
            ..user()
        };
        checkout(&repo, "main", &out, &opts, None).unwrap();
        assert!(out.join("tool").is_file());
        assert!(!out.join("data").exists());

        let single = dir.path().join("single");
        let opts = CheckoutOptions {
            subpath: Some("bin/tool".to_string()),
            ..user()
        };
        checkout(&repo, "main", &single, &opts, None).unwrap();
        assert!(single.is_file());
    }

    #[test]
    fn test_missing_subpath() {
        let (dir, repo) = test_repo();
        let src = sample(dir.path());
        commit_dir(&repo, &src, "main");
        let out = dir.path().join("out");

        let strict = CheckoutOptions {
            subpath: Some("nope".to_string()),
            ..user()
        };
        assert!(matches!(
            checkout(&repo, "main", &out, &strict, None),
            Err(Error::PathNotFound(_))
        ));

        let lenient = CheckoutOptions {
            allow_noent: true,
            ..strict
        };
        checkout(&repo, "main", &out, &lenient, None).unwrap();
        assert!(!out.exists());
    }

    #[test]
    fn test_whiteouts() {
        let (dir, repo) = test_repo();
        let lower = dir.path().join("lower");
        fs::create_dir_all(lower.join("opt")).unwrap();
        fs::write(lower.join("gone"), "x").unwrap();
        fs::write(lower.join("opt/old"), "x").unwrap();
        commit_dir(&repo, &lower, "lower");

        let upper = dir.path().join("upper");
        fs::create_dir_all(upper.join("opt")).unwrap();
        fs::write(upper.join(".wh.gone"), "").unwrap();
        fs::write(upper.join("opt/.wh..wh..opq"), "").unwrap();
        fs::write(upper.join("opt/new"), "y").unwrap();
        commit_dir(&repo, &upper, "upper");

        let out = dir.path().join("out");
        checkout(&repo, "lower", &out, &user(), None).unwrap();
        let opts = CheckoutOptions {
            union: true,
            whiteouts: true,
            ..user()
        };
        checkout(&repo, "upper", &out, &opts, None).unwrap();

        assert!(!out.join("gone").exists());
        assert!(!out.join(".wh.gone").exists());
        assert!(!out.join("opt/old").exists());
        assert!(out.join("opt/new").exists());
    }

    #[test]
    fn test_empty_orphan_checkout() {
        let (dir, repo) = test_repo();
        let empty = dir.path().join("empty");
        fs::create_dir(&empty).unwrap();
        let opts = CommitOptions {
            orphan: true,
            ..Default::default()
        };
        let c = commit(&repo, &[TreeSource::Dir(empty)], &opts, None)
            .unwrap()
            .checksum;

        let out = dir.path().join("out");
        checkout(&repo, &c.to_hex(), &out, &user(), None).unwrap();
        assert_eq!(fs::read_dir(&out).unwrap().count(), 0);
    }

    #[test]
    fn test_parse_batch() {
        let entries = parse_batch("# comment\n\nmain rel/out\nabc /abs/out\n", Path::new("/base")).unwrap();
        assert_eq!(
            entries,
            vec![
                BatchEntry {
                    rev: "main".to_string(),
                    dest: PathBuf::from("/base/rel/out"),
                },
                BatchEntry {
                    rev: "abc".to_string(),
                    dest: PathBuf::from("/abs/out"),
                },
            ]
        );
        assert!(matches!(
            parse_batch("lonely\n", Path::new("/")),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_batch_collects_failures() {
        let (dir, repo) = test_repo();
        let src = sample(dir.path());
        commit_dir(&repo, &src, "main");

        let control = dir.path().join("batch");
        fs::write(&control, "main one\nmissing-ref two\nmain three\n").unwrap();
        let base = dir.path().join("outs");

        let report = checkout_batch(&repo, &control, &base, &user(), None).unwrap();
        assert_eq!(report.succeeded.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].1.is_not_found());
        assert!(!report.is_ok());
        assert!(base.join("three/data").is_file());
    }
}
