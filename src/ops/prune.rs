use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::cancel::{self, Cancellable};
use crate::checksum::Checksum;
use crate::error::{Error, IoResultExt, Result};
use crate::refs::{list_refs_resolved, refs_pointing_at, resolve_ref};
use crate::repo::Repo;
use crate::store::{self, ReachableSet};
use crate::types::ObjectType;

/// prune options
#[derive(Debug, Clone, Default)]
pub struct PruneOptions {
    /// report what would be deleted without deleting anything
    pub no_prune: bool,
    /// only refs are gc roots; unreferenced commits are collected too
    pub refs_only: bool,
    /// delete one commit; refused while any ref points at it
    pub delete_commit: Option<String>,
    /// delete unreachable commits older than this unix timestamp
    pub keep_younger_than: Option<i64>,
    /// parents followed from each ref; None walks the whole history
    pub depth: Option<u32>,
    /// only remove static deltas of the selected commits
    pub static_deltas_only: bool,
}

/// prune report
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub objects_total: usize,
    pub objects_pruned: usize,
    pub bytes_freed: u64,
    pub commits_deleted: Vec<Checksum>,
    /// every object removed (or, in a dry run, to be removed)
    pub pruned: Vec<(Checksum, ObjectType)>,
    /// names of removed entries under `deltas/`
    pub deltas_deleted: Vec<String>,
    pub dry_run: bool,
}

impl fmt::Display for PruneReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Total objects: {}", self.objects_total)?;
        let verb = if self.dry_run { "Would delete" } else { "Deleted" };
        if self.objects_pruned == 0 && self.deltas_deleted.is_empty() {
            writeln!(f, "No unreachable objects")?;
        } else {
            writeln!(
                f,
                "{} {} objects, {} bytes freed",
                verb, self.objects_pruned, self.bytes_freed
            )?;
        }
        if !self.commits_deleted.is_empty() {
            writeln!(f, "{} {} commits", verb, self.commits_deleted.len())?;
        }
        if !self.deltas_deleted.is_empty() {
            writeln!(f, "{} {} static deltas", verb, self.deltas_deleted.len())?;
        }
        Ok(())
    }
}

/// delete commits and unreachable objects
///
/// the selected commits (if any) are removed first, then every object not
/// reachable from the remaining roots. with `no_prune` nothing is touched
/// and the report lists exactly what a real run would remove.
pub fn prune(repo: &Repo, opts: &PruneOptions, cancel: Option<&Cancellable>) -> Result<PruneReport> {
    validate(opts)?;

    let dry_run = opts.no_prune;
    let _lock = if dry_run {
        None
    } else {
        repo.ensure_writable()?;
        Some(repo.lock()?)
    };

    let depth = match opts.depth {
        Some(d) => i32::try_from(d).unwrap_or(i32::MAX),
        None => -1,
    };

    let objects = store::list_objects(repo)?;
    let mut report = PruneReport {
        objects_total: objects.len(),
        dry_run,
        ..Default::default()
    };

    let refs = list_refs_resolved(repo)?;
    let mut doomed = BTreeSet::new();

    if let Some(rev) = &opts.delete_commit {
        let commit = resolve_ref(repo, rev)?;
        let users = refs_pointing_at(repo, &commit)?;
        if !users.is_empty() {
            return Err(Error::CommitInUse {
                commit,
                refs: users,
            });
        }
        if !store::commit_exists(repo, &commit) {
            return Err(Error::ObjectNotFound {
                checksum: commit,
                kind: ObjectType::Commit,
            });
        }
        doomed.insert(commit);
    }

    if let Some(cutoff) = opts.keep_younger_than {
        let mut from_refs = ReachableSet::new();
        for head in refs.values() {
            mark_history(repo, head, depth, &doomed, &mut from_refs, cancel)?;
        }
        for (checksum, kind) in &objects {
            if *kind != ObjectType::Commit || from_refs.contains(&(*checksum, *kind)) {
                continue;
            }
            let (commit, _) = store::load_commit(repo, checksum)?;
            if commit.timestamp < cutoff {
                debug!(commit = %checksum, timestamp = commit.timestamp, "commit aged out");
                doomed.insert(*checksum);
            }
        }
    }

    if opts.static_deltas_only {
        report.deltas_deleted = prune_deltas(repo, dry_run, |target| doomed.contains(target))?;
        info!(deltas = report.deltas_deleted.len(), dry_run, "pruned static deltas");
        return Ok(report);
    }

    let mut reachable = ReachableSet::new();
    for head in refs.values() {
        mark_history(repo, head, depth, &doomed, &mut reachable, cancel)?;
    }
    if !opts.refs_only {
        for (checksum, kind) in &objects {
            if *kind == ObjectType::Commit && !doomed.contains(checksum) {
                mark_history(repo, checksum, 0, &doomed, &mut reachable, cancel)?;
            }
        }
    }

    let mut commits = Vec::new();
    let mut others = Vec::new();
    for &(checksum, kind) in &objects {
        let unreachable = !reachable.contains(&(checksum, kind));
        match kind {
            ObjectType::Tombstone => {}
            ObjectType::Commit => {
                if doomed.contains(&checksum) || unreachable {
                    commits.push(checksum);
                }
            }
            // removed together with its commit, or on its own once orphaned
            ObjectType::CommitMeta => {
                if !objects.contains(&(checksum, ObjectType::Commit)) {
                    others.push((checksum, kind));
                }
            }
            _ => {
                if unreachable {
                    others.push((checksum, kind));
                }
            }
        }
    }

    // commits go first so no surviving commit points at a missing tree
    for checksum in &commits {
        cancel::check(cancel)?;
        let has_meta = store::object_exists(repo, checksum, ObjectType::CommitMeta);
        report.bytes_freed += if dry_run {
            commit_footprint(repo, checksum)?
        } else {
            store::delete_object(repo, checksum, ObjectType::Commit)?
        };
        report.pruned.push((*checksum, ObjectType::Commit));
        if has_meta {
            report.pruned.push((*checksum, ObjectType::CommitMeta));
        }
        debug!(commit = %checksum, dry_run, "pruned commit");
    }
    report.commits_deleted = commits;

    for (checksum, kind) in &others {
        cancel::check(cancel)?;
        report.bytes_freed += if dry_run {
            store::object_size(repo, checksum, *kind)?
        } else {
            store::delete_object(repo, checksum, *kind)?
        };
        report.pruned.push((*checksum, *kind));
    }
    report.objects_pruned = report.pruned.len();

    let surviving: BTreeSet<Checksum> = objects
        .iter()
        .filter(|(c, k)| *k == ObjectType::Commit && !report.commits_deleted.contains(c))
        .map(|(c, _)| *c)
        .collect();
    report.deltas_deleted = prune_deltas(repo, dry_run, |target| !surviving.contains(target))?;

    info!(
        total = report.objects_total,
        pruned = report.objects_pruned,
        commits = report.commits_deleted.len(),
        deltas = report.deltas_deleted.len(),
        bytes = report.bytes_freed,
        dry_run,
        "prune finished"
    );
    Ok(report)
}

fn validate(opts: &PruneOptions) -> Result<()> {
    let selectors = usize::from(opts.delete_commit.is_some())
        + usize::from(opts.keep_younger_than.is_some());
    if selectors > 1 {
        return Err(Error::InvalidArgument(
            "delete_commit and keep_younger_than cannot be combined".to_string(),
        ));
    }
    if opts.static_deltas_only && selectors == 0 {
        return Err(Error::InvalidArgument(
            "static_deltas_only requires delete_commit or keep_younger_than".to_string(),
        ));
    }
    Ok(())
}

/// mark a commit, its tree and up to `depth` ancestors
///
/// doomed or missing commits end the walk; anything behind them is only
/// kept if some other root reaches it.
fn mark_history(
    repo: &Repo,
    start: &Checksum,
    depth: i32,
    doomed: &BTreeSet<Checksum>,
    reachable: &mut ReachableSet,
    cancel: Option<&Cancellable>,
) -> Result<()> {
    let mut current = *start;
    let mut remaining = depth;

    loop {
        cancel::check(cancel)?;
        if doomed.contains(&current) {
            break;
        }
        // an unbounded walk from here already covered the rest
        if !reachable.insert((current, ObjectType::Commit)) && remaining < 0 {
            break;
        }
        let (commit, _) = match store::load_commit(repo, &current) {
            Ok(loaded) => loaded,
            Err(Error::ObjectNotFound { .. }) => {
                if current == *start {
                    warn!(commit = %current, "gc root is not stored");
                }
                break;
            }
            Err(e) => return Err(e),
        };

        reachable.insert((commit.root_meta, ObjectType::DirMeta));
        store::traverse_dirtree(repo, &commit.root_tree, reachable, cancel)?;

        if remaining == 0 {
            break;
        }
        if remaining > 0 {
            remaining -= 1;
        }
        match commit.parent {
            Some(parent) => current = parent,
            None => break,
        }
    }
    Ok(())
}

/// a commit plus its detached metadata
fn commit_footprint(repo: &Repo, commit: &Checksum) -> Result<u64> {
    let mut size = store::object_size(repo, commit, ObjectType::Commit)?;
    if store::object_exists(repo, commit, ObjectType::CommitMeta) {
        size += store::object_size(repo, commit, ObjectType::CommitMeta)?;
    }
    Ok(size)
}

/// target commit of a `deltas/` entry named `<from>-<to>` or `<to>`
fn delta_target(name: &str) -> Option<Checksum> {
    let to = name.rsplit('-').next()?;
    Checksum::from_hex(to).ok()
}

/// remove static deltas whose target matches `doomed`
fn prune_deltas(
    repo: &Repo,
    dry_run: bool,
    doomed: impl Fn(&Checksum) -> bool,
) -> Result<Vec<String>> {
    let dir = repo.deltas_path();
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::Io { path: dir, source: e }),
    };

    let mut deleted = Vec::new();
    for entry in entries {
        let entry = entry.with_path(&dir)?;
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        let Some(target) = delta_target(&name) else {
            continue;
        };
        if !doomed(&target) {
            continue;
        }
        let path = entry.path();
        debug!(delta = %path.display(), dry_run, "pruning static delta");
        if !dry_run {
            remove_delta(&path)?;
        }
        deleted.push(name);
    }
    deleted.sort();
    Ok(deleted)
}

fn remove_delta(path: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(path).with_path(path)?;
    if meta.is_dir() {
        fs::remove_dir_all(path).with_path(path)
    } else {
        fs::remove_file(path).with_path(path)
    }
}
