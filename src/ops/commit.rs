use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use tracing::{debug, info, warn};

use crate::cancel::Cancellable;
use crate::checksum::Checksum;
use crate::error::{Error, IoResultExt, Result};
use crate::filter::OverrideFilter;
use crate::mtree::MutableTree;
use crate::refs::{resolve_ref, resolve_rev, validate_ref_name};
use crate::repo::Repo;
use crate::sign::{sign_commit, CommitSigner, GpgSigner};
use crate::store;
use crate::txn::{Transaction, TransactionStats};
use crate::types::{Commit, DetachedMetadata};
use crate::writer::{
    write_archive, write_directory, write_layer, write_mtree, write_ref, CommitModifier,
};

/// commit metadata key holding the per-object size table
pub const SIZES_METADATA_KEY: &str = "otree.sizes";

/// parent token meaning "no parent at all"
const NO_PARENT: &str = "none";

/// one overlay contributing to the committed tree, applied in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeSource {
    /// directory on disk
    Dir(PathBuf),
    /// tar archive
    Tar(PathBuf),
    /// tree of an existing ref or commit
    Ref(String),
    /// container image layer with whiteouts
    Layer(PathBuf),
}

impl FromStr for TreeSource {
    type Err = Error;

    /// parse a `TYPE=VALUE` tree spec
    fn from_str(s: &str) -> Result<Self> {
        let (kind, value) = s
            .split_once('=')
            .ok_or_else(|| Error::InvalidArgument(format!("tree spec must be TYPE=VALUE: {}", s)))?;
        if value.is_empty() {
            return Err(Error::InvalidArgument(format!("empty value in tree spec: {}", s)));
        }
        match kind {
            "dir" => Ok(TreeSource::Dir(PathBuf::from(value))),
            "tar" => Ok(TreeSource::Tar(PathBuf::from(value))),
            "ref" => Ok(TreeSource::Ref(value.to_string())),
            "layer" => Ok(TreeSource::Layer(PathBuf::from(value))),
            other => Err(Error::InvalidArgument(format!(
                "unknown tree type {} in {}",
                other, s
            ))),
        }
    }
}

/// parse a list of `TYPE=VALUE` tree specs
pub fn parse_tree_specs<S: AsRef<str>>(specs: &[S]) -> Result<Vec<TreeSource>> {
    specs.iter().map(|s| s.as_ref().parse()).collect()
}

/// per-call commit configuration
#[derive(Debug, Clone, Default)]
pub struct CommitOptions {
    /// ref to move to the new commit
    pub branch: Option<String>,
    /// commit without touching any ref; exclusive with `branch`
    pub orphan: bool,
    /// explicit parent: a rev, or `none`. unset means the branch tip
    pub parent: Option<String>,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub owner_uid: Option<u32>,
    pub owner_gid: Option<u32>,
    pub skip_xattrs: bool,
    /// record archived and unpacked sizes of every file object
    pub generate_sizes: bool,
    /// return the parent instead of committing an identical tree
    pub skip_if_unchanged: bool,
    /// unix seconds; wall clock when unset
    pub timestamp: Option<i64>,
    pub metadata: BTreeMap<String, String>,
    pub detached_metadata: DetachedMetadata,
    pub gpg_keys: Vec<String>,
    pub gpg_homedir: Option<PathBuf>,
    pub statoverride: Option<PathBuf>,
    pub skip_list: Option<PathBuf>,
    pub tar_autocreate_parents: bool,
    /// override the repository fsync setting
    pub fsync: Option<bool>,
}

/// result of a commit call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOutcome {
    pub checksum: Checksum,
    /// the tree matched the parent and no commit was written
    pub unchanged: bool,
    pub stats: TransactionStats,
}

/// commit the given sources, signing with gpg if keys are configured
pub fn commit(
    repo: &Repo,
    sources: &[TreeSource],
    opts: &CommitOptions,
    cancel: Option<&Cancellable>,
) -> Result<CommitOutcome> {
    commit_with_signer(repo, sources, opts, &GpgSigner::new(), cancel)
}

/// commit the given sources, signing through `signer`
///
/// no sources means the current directory. either every object and the
/// ref update become visible, or nothing does.
pub fn commit_with_signer(
    repo: &Repo,
    sources: &[TreeSource],
    opts: &CommitOptions,
    signer: &dyn CommitSigner,
    cancel: Option<&Cancellable>,
) -> Result<CommitOutcome> {
    match (&opts.branch, opts.orphan) {
        (Some(branch), false) => validate_ref_name(branch)?,
        (None, true) => {}
        (Some(_), true) => {
            return Err(Error::InvalidArgument(
                "a branch cannot be given for an orphan commit".to_string(),
            ))
        }
        (None, false) => {
            return Err(Error::InvalidArgument(
                "a branch is required unless committing an orphan".to_string(),
            ))
        }
    }
    repo.ensure_writable()?;

    let mut filter = OverrideFilter::new().with_owner(opts.owner_uid, opts.owner_gid);
    if let Some(path) = &opts.statoverride {
        filter = filter.load_statoverride(path)?;
    }
    if let Some(path) = &opts.skip_list {
        filter = filter.load_skip_list(path)?;
    }

    let parent = resolve_parent(repo, opts)?;

    let mut txn = repo.prepare_transaction()?;
    if let Some(fsync) = opts.fsync {
        txn.set_fsync(fsync);
    }

    match build(&mut txn, sources, opts, filter, parent, signer, cancel) {
        Ok(Built::Commit(checksum)) => {
            let stats = txn.commit()?;
            info!(commit = %checksum, branch = ?opts.branch, "committed");
            Ok(CommitOutcome {
                checksum,
                unchanged: false,
                stats,
            })
        }
        Ok(Built::Unchanged(checksum)) => {
            txn.abort()?;
            info!(commit = %checksum, "tree unchanged; reusing parent");
            Ok(CommitOutcome {
                checksum,
                unchanged: true,
                stats: TransactionStats::default(),
            })
        }
        Err(e) => {
            if let Err(abort_err) = txn.abort() {
                warn!(error = %abort_err, "failed to abort commit transaction");
            }
            Err(e)
        }
    }
}

fn resolve_parent(repo: &Repo, opts: &CommitOptions) -> Result<Option<Checksum>> {
    match opts.parent.as_deref() {
        Some(NO_PARENT) => Ok(None),
        Some(rev) if !rev.is_empty() => resolve_ref(repo, rev).map(Some),
        _ => match &opts.branch {
            Some(branch) => resolve_rev(repo, branch, true),
            None => Ok(None),
        },
    }
}

enum Built {
    Commit(Checksum),
    /// the parent already has this tree
    Unchanged(Checksum),
}

/// stage everything for the commit
fn build(
    txn: &mut Transaction<'_>,
    sources: &[TreeSource],
    opts: &CommitOptions,
    mut filter: OverrideFilter,
    parent: Option<Checksum>,
    signer: &dyn CommitSigner,
    cancel: Option<&Cancellable>,
) -> Result<Built> {
    let mut mtree = MutableTree::new();
    let sizes = {
        let mut modifier = CommitModifier::new()
            .skip_xattrs(opts.skip_xattrs)
            .generate_sizes(opts.generate_sizes);
        if !filter.is_noop() {
            modifier = modifier.with_filter(&mut filter);
        }
        write_sources(txn, &mut mtree, sources, opts, &mut modifier, cancel)?;
        modifier.sizes_metadata()
    };
    filter.finish()?;

    let (tree, root_meta) = write_mtree(txn, &mtree)?;

    if opts.skip_if_unchanged {
        if let Some(parent) = parent {
            let (previous, _) = store::load_commit(txn.repo(), &parent)?;
            if previous.root_tree == tree && previous.root_meta == root_meta {
                debug!(%parent, "tree matches parent");
                return Ok(Built::Unchanged(parent));
            }
        }
    }

    let timestamp = opts
        .timestamp
        .unwrap_or_else(|| chrono::Utc::now().timestamp());
    let mut commit = Commit::new(tree, root_meta, parent)
        .with_subject(opts.subject.clone().unwrap_or_default())
        .with_body(opts.body.clone().unwrap_or_default())
        .with_timestamp(timestamp);
    for (key, value) in &opts.metadata {
        commit = commit.with_metadata(key, value);
    }
    if let Some(sizes) = sizes {
        commit = commit.with_metadata(SIZES_METADATA_KEY, sizes);
    }

    let checksum = txn.write_commit(&commit)?;
    if !opts.detached_metadata.is_empty() {
        txn.write_detached_metadata(&checksum, &opts.detached_metadata)?;
    }
    for key in &opts.gpg_keys {
        sign_commit(txn, &checksum, key, opts.gpg_homedir.as_deref(), signer)?;
    }
    if let Some(branch) = &opts.branch {
        txn.set_ref(branch, Some(checksum))?;
    }
    Ok(Built::Commit(checksum))
}

fn write_sources(
    txn: &mut Transaction<'_>,
    mtree: &mut MutableTree,
    sources: &[TreeSource],
    opts: &CommitOptions,
    modifier: &mut CommitModifier<'_>,
    cancel: Option<&Cancellable>,
) -> Result<()> {
    if sources.is_empty() {
        let cwd = env::current_dir().with_path(".")?;
        return write_directory(txn, mtree, &cwd, modifier, cancel);
    }

    for source in sources {
        debug!(?source, "writing tree source");
        match source {
            TreeSource::Dir(path) => write_directory(txn, mtree, path, modifier, cancel)?,
            TreeSource::Tar(path) => write_archive(
                txn,
                mtree,
                path,
                modifier,
                opts.tar_autocreate_parents,
                cancel,
            )?,
            TreeSource::Ref(rev) => write_ref(txn, mtree, rev, modifier, cancel)?,
            TreeSource::Layer(path) => write_layer(txn, mtree, path, modifier, cancel)?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RepoMode;
    use crate::refs::{read_ref, ref_exists};
    use crate::repo::InitOptions;
    use crate::sign::{signatures, GPG_SIGNATURES_KEY};
    use crate::types::ObjectType;
    use std::fs;
    use std::path::Path;
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

    fn source(dir: &Path) -> PathBuf {
        let src = dir.join("src");
        fs::create_dir_all(src.join("etc")).unwrap();
        fs::write(src.join("etc/os-release"), "ID=test\n").unwrap();
        fs::write(src.join("README"), "readme").unwrap();
        src
    }

    fn branch_opts(branch: &str) -> CommitOptions {
        CommitOptions {
            branch: Some(branch.to_string()),
            subject: Some("test".to_string()),
            skip_xattrs: true,
            ..Default::default()
        }
    }

    fn count(repo: &Repo, kind: ObjectType) -> usize {
        store::list_objects(repo)
            .unwrap()
            .iter()
            .filter(|(_, k)| *k == kind)
            .count()
    }

    struct FakeSigner;

    impl CommitSigner for FakeSigner {
        fn sign(
            &self,
            _: &Checksum,
            _: &[u8],
            key_id: &str,
            _: Option<&Path>,
        ) -> Result<Vec<u8>> {
            Ok(key_id.as_bytes().to_vec())
        }
    }

    struct RefusingSigner;

    impl CommitSigner for RefusingSigner {
        fn sign(
            &self,
            _: &Checksum,
            _: &[u8],
            key_id: &str,
            _: Option<&Path>,
        ) -> Result<Vec<u8>> {
            Err(Error::Signing {
                key: key_id.to_string(),
                message: "card not present".to_string(),
            })
        }
    }

    #[test]
    fn test_parse_tree_specs() {
        let parsed = parse_tree_specs(&["dir=/src", "tar=a.tar", "ref=base", "layer=l.tar"]).unwrap();
        assert_eq!(
            parsed,
            vec![
                TreeSource::Dir(PathBuf::from("/src")),
                TreeSource::Tar(PathBuf::from("a.tar")),
                TreeSource::Ref("base".to_string()),
                TreeSource::Layer(PathBuf::from("l.tar")),
            ]
        );
        assert!(matches!(
            "nonsense".parse::<TreeSource>(),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            "zip=x".parse::<TreeSource>(),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            "dir=".parse::<TreeSource>(),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_branch_or_orphan_required() {
        let (dir, repo) = test_repo();
        let src = source(dir.path());
        let sources = [TreeSource::Dir(src)];

        let neither = CommitOptions::default();
        assert!(matches!(
            commit(&repo, &sources, &neither, None),
            Err(Error::InvalidArgument(_))
        ));

        let both = CommitOptions {
            orphan: true,
            ..branch_opts("main")
        };
        assert!(matches!(
            commit(&repo, &sources, &both, None),
            Err(Error::InvalidArgument(_))
        ));
        assert!(store::list_objects(&repo).unwrap().is_empty());
    }

    #[test]
    fn test_commit_updates_branch_and_parent() {
        let (dir, repo) = test_repo();
        let src = source(dir.path());
        let sources = [TreeSource::Dir(src.clone())];

        let first = commit(&repo, &sources, &branch_opts("main"), None).unwrap();
        assert!(!first.unchanged);
        assert_eq!(read_ref(&repo, "main").unwrap(), first.checksum);

        fs::write(src.join("README"), "changed").unwrap();
        let second = commit(&repo, &sources, &branch_opts("main"), None).unwrap();
        let (_, c) = store::read_commit(&repo, "main").unwrap();
        assert_eq!(c.parent, Some(first.checksum));
        assert_eq!(read_ref(&repo, "main").unwrap(), second.checksum);

        let opts = CommitOptions {
            parent: Some("none".to_string()),
            ..branch_opts("main")
        };
        fs::write(src.join("README"), "again").unwrap();
        commit(&repo, &sources, &opts, None).unwrap();
        let (_, c) = store::read_commit(&repo, "main").unwrap();
        assert_eq!(c.parent, None);
    }

    #[test]
    fn test_skip_if_unchanged() {
        let (dir, repo) = test_repo();
        let sources = [TreeSource::Dir(source(dir.path()))];
        let opts = CommitOptions {
            skip_if_unchanged: true,
            ..branch_opts("b1")
        };

        let first = commit(&repo, &sources, &opts, None).unwrap();
        let before = store::list_objects(&repo).unwrap();

        let second = commit(&repo, &sources, &opts, None).unwrap();
        assert!(second.unchanged);
        assert_eq!(second.checksum, first.checksum);
        assert_eq!(second.stats.metadata_objects_written, 0);
        assert_eq!(store::list_objects(&repo).unwrap(), before);
        assert_eq!(read_ref(&repo, "b1").unwrap(), first.checksum);
        assert!(!repo.transaction_open());
    }

    #[test]
    fn test_empty_orphan_is_deterministic() {
        let (dir, repo) = test_repo();
        let empty = dir.path().join("empty");
        fs::create_dir(&empty).unwrap();
        let opts = CommitOptions {
            orphan: true,
            owner_uid: Some(0),
            owner_gid: Some(0),
            timestamp: Some(1_700_000_000),
            ..Default::default()
        };
        let sources = [TreeSource::Dir(empty)];

        let a = commit(&repo, &sources, &opts, None).unwrap();
        let b = commit(&repo, &sources, &opts, None).unwrap();
        assert_eq!(a.checksum, b.checksum);
        assert!(crate::refs::list_refs(&repo).unwrap().is_empty());

        let (c, _) = store::load_commit(&repo, &a.checksum).unwrap();
        assert!(store::load_dirtree(&repo, &c.root_tree).unwrap().is_empty());
    }

    #[test]
    fn test_same_content_from_two_paths() {
        let (dir, repo) = test_repo();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        for d in [&a, &b] {
            fs::create_dir(d).unwrap();
            fs::write(d.join("data"), "identical").unwrap();
        }
        let opts = CommitOptions {
            orphan: true,
            skip_xattrs: true,
            ..Default::default()
        };

        let ca = commit(&repo, &[TreeSource::Dir(a)], &opts, None).unwrap();
        let cb = commit(&repo, &[TreeSource::Dir(b)], &opts, None).unwrap();
        let ta = store::load_commit(&repo, &ca.checksum).unwrap().0.root_tree;
        let tb = store::load_commit(&repo, &cb.checksum).unwrap().0.root_tree;
        let fa = store::load_dirtree(&repo, &ta).unwrap().files[0].checksum;
        let fb = store::load_dirtree(&repo, &tb).unwrap().files[0].checksum;
        assert_eq!(fa, fb);
        assert_eq!(count(&repo, ObjectType::File), 1);
    }

    #[test]
    fn test_unmatched_statoverride_aborts() {
        let (dir, repo) = test_repo();
        let sources = [TreeSource::Dir(source(dir.path()))];
        let overrides = dir.path().join("statoverride");
        fs::write(&overrides, "+2048 /README\n=420 /not/there\n").unwrap();
        let opts = CommitOptions {
            statoverride: Some(overrides),
            ..branch_opts("main")
        };

        let err = commit(&repo, &sources, &opts, None).unwrap_err();
        match err {
            Error::UnmatchedOverridePath { kind, paths } => {
                assert_eq!(kind, "statoverride");
                assert_eq!(paths, vec!["/not/there".to_string()]);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(count(&repo, ObjectType::Commit), 0);
        assert!(!ref_exists(&repo, "main"));
        assert!(!repo.transaction_open());
    }

    #[test]
    fn test_skip_list_and_owner() {
        let (dir, repo) = test_repo();
        let sources = [TreeSource::Dir(source(dir.path()))];
        let skip = dir.path().join("skip");
        fs::write(&skip, "/etc\n").unwrap();
        let opts = CommitOptions {
            skip_list: Some(skip),
            owner_uid: Some(0),
            owner_gid: Some(0),
            ..branch_opts("main")
        };

        let out = commit(&repo, &sources, &opts, None).unwrap();
        let (c, _) = store::load_commit(&repo, &out.checksum).unwrap();
        let tree = store::load_dirtree(&repo, &c.root_tree).unwrap();
        assert!(tree.dirs.is_empty());
        let header = store::load_file_header(&repo, &tree.files[0].checksum).unwrap();
        assert_eq!((header.uid, header.gid), (0, 0));
    }

    #[test]
    fn test_sizes_and_metadata() {
        let (dir, repo) = test_repo();
        let sources = [TreeSource::Dir(source(dir.path()))];
        let mut opts = CommitOptions {
            generate_sizes: true,
            ..branch_opts("main")
        };
        opts.metadata.insert("version".to_string(), "42".to_string());
        opts.detached_metadata
            .insert("note".to_string(), b"hello".to_vec());

        let out = commit(&repo, &sources, &opts, None).unwrap();
        let (c, _) = store::load_commit(&repo, &out.checksum).unwrap();
        assert_eq!(c.metadata["version"], "42");
        assert_eq!(c.metadata[SIZES_METADATA_KEY].lines().count(), 2);

        let detached = store::read_detached_metadata(&repo, &out.checksum)
            .unwrap()
            .unwrap();
        assert_eq!(detached["note"], b"hello".to_vec());
    }

    #[test]
    fn test_signing() {
        let (dir, repo) = test_repo();
        let sources = [TreeSource::Dir(source(dir.path()))];
        let opts = CommitOptions {
            gpg_keys: vec!["A1".to_string(), "B2".to_string()],
            ..branch_opts("main")
        };

        let out = commit_with_signer(&repo, &sources, &opts, &FakeSigner, None).unwrap();
        let detached = store::read_detached_metadata(&repo, &out.checksum)
            .unwrap()
            .unwrap();
        assert!(detached.contains_key(GPG_SIGNATURES_KEY));
        assert_eq!(
            signatures(&detached).unwrap(),
            vec![b"A1".to_vec(), b"B2".to_vec()]
        );

        let failing = CommitOptions {
            gpg_keys: vec!["A1".to_string()],
            ..branch_opts("signed")
        };
        let err = commit_with_signer(&repo, &sources, &failing, &RefusingSigner, None).unwrap_err();
        assert!(matches!(err, Error::Signing { .. }));
        assert!(!ref_exists(&repo, "signed"));
    }

    #[test]
    fn test_overlays_in_order() {
        let (dir, repo) = test_repo();
        let base = commit(
            &repo,
            &[TreeSource::Dir(source(dir.path()))],
            &branch_opts("base"),
            None,
        )
        .unwrap();

        let extra = dir.path().join("extra");
        fs::create_dir_all(extra.join("etc")).unwrap();
        fs::write(extra.join("etc/os-release"), "ID=override\n").unwrap();

        let layer = dir.path().join("layer.tar");
        {
            let mut b = tar::Builder::new(fs::File::create(&layer).unwrap());
            let mut h = tar::Header::new_gnu();
            h.set_entry_type(tar::EntryType::Regular);
            h.set_mode(0o644);
            h.set_size(0);
            b.append_data(&mut h, ".wh.README", std::io::empty()).unwrap();
            b.finish().unwrap();
        }

        let sources = vec![
            TreeSource::Ref(base.checksum.to_hex()),
            TreeSource::Dir(extra),
            TreeSource::Layer(layer),
        ];
        let out = commit(&repo, &sources, &branch_opts("derived"), None).unwrap();

        let (c, _) = store::load_commit(&repo, &out.checksum).unwrap();
        let root = store::load_dirtree(&repo, &c.root_tree).unwrap();
        assert!(root.file("README").is_none());
        let etc = store::load_dirtree(&repo, &root.dir("etc").unwrap().tree).unwrap();
        let mut obj = store::open_file(&repo, &etc.file("os-release").unwrap().checksum).unwrap();
        let mut text = String::new();
        std::io::Read::read_to_string(&mut obj.content, &mut text).unwrap();
        assert_eq!(text, "ID=override\n");
    }

    #[test]
    fn test_cancelled_commit_leaves_nothing() {
        let (dir, repo) = test_repo();
        let sources = [TreeSource::Dir(source(dir.path()))];
        let cancel = Cancellable::new();
        cancel.cancel();

        let err = commit(&repo, &sources, &branch_opts("main"), Some(&cancel)).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(store::list_objects(&repo).unwrap().is_empty());
        assert!(!ref_exists(&repo, "main"));
    }

    #[test]
    fn test_missing_source_aborts() {
        let (dir, repo) = test_repo();
        let sources = [TreeSource::Dir(dir.path().join("absent"))];
        let err = commit(&repo, &sources, &branch_opts("main"), None).unwrap_err();
        assert!(err.is_not_found());
        assert!(!repo.transaction_open());
    }
}
