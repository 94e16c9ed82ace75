use std::collections::BTreeSet;
use std::fmt;

use tracing::{debug, info, warn};

use crate::cancel::{self, Cancellable};
use crate::checksum::Checksum;
use crate::error::{Error, Result};
use crate::repo::Repo;
use crate::store::{self, ReachableSet};
use crate::types::{CommitState, ObjectType};

/// fsck options
#[derive(Debug, Clone, Default)]
pub struct FsckOptions {
    /// only log problems, not progress
    pub quiet: bool,
    /// delete corrupted objects and keep going
    pub delete: bool,
    /// replace commits whose parent is missing with tombstones
    pub add_tombstones: bool,
}

/// an object whose stored form does not match its checksum
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptObject {
    pub checksum: Checksum,
    pub kind: ObjectType,
    /// what the stored content hashes to, when it could be read at all
    pub actual: Option<Checksum>,
    pub message: String,
}

/// fsck report
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FsckReport {
    pub objects_total: usize,
    pub commits: usize,
    pub partial_commits: usize,
    pub objects_verified: usize,
    /// referenced by a verified commit but not stored
    pub missing: Vec<(Checksum, ObjectType)>,
    pub corrupted: Vec<CorruptObject>,
    pub deleted: Vec<(Checksum, ObjectType)>,
    pub tombstones_written: Vec<Checksum>,
}

impl FsckReport {
    /// true if nothing is missing and every corrupted object was removed
    pub fn is_ok(&self) -> bool {
        self.missing.is_empty() && self.corrupted.len() == self.deleted.len()
    }
}

impl fmt::Display for FsckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Total objects: {}", self.objects_total)?;
        writeln!(f, "Commits: {} ({} partial)", self.commits, self.partial_commits)?;
        writeln!(f, "Verified objects: {}", self.objects_verified)?;
        for (checksum, kind) in &self.missing {
            writeln!(f, "Missing object: {}.{}", checksum, kind)?;
        }
        for c in &self.corrupted {
            writeln!(f, "Corrupted object: {}.{}: {}", c.checksum, c.kind, c.message)?;
        }
        if !self.deleted.is_empty() {
            writeln!(f, "Deleted objects: {}", self.deleted.len())?;
        }
        if !self.tombstones_written.is_empty() {
            writeln!(f, "Tombstones written: {}", self.tombstones_written.len())?;
        }
        Ok(())
    }
}

/// verify every object reachable from the stored commits
///
/// a corrupted object is recorded (and with `delete`, removed) without
/// stopping the scan; a structurally invalid metadata object stops it.
/// fails with [`Error::Corrupted`] unless the report is clean.
pub fn fsck(repo: &Repo, opts: &FsckOptions, cancel: Option<&Cancellable>) -> Result<FsckReport> {
    let mut report = FsckReport::default();
    let objects = store::list_objects(repo)?;
    report.objects_total = objects.len();

    let mut commits = Vec::new();
    let mut tombstone_candidates = BTreeSet::new();
    for (checksum, kind) in &objects {
        if *kind != ObjectType::Commit {
            continue;
        }
        cancel::check(cancel)?;
        report.commits += 1;

        let (commit, state) = store::load_commit(repo, checksum)?;
        if opts.add_tombstones {
            if let Some(parent) = commit.parent {
                if !store::commit_exists(repo, &parent) {
                    debug!(commit = %checksum, %parent, "parent commit missing");
                    tombstone_candidates.insert(*checksum);
                }
            }
        }
        if state == CommitState::Partial {
            report.partial_commits += 1;
            debug!(commit = %checksum, "skipping partial commit");
            continue;
        }
        commits.push(*checksum);
    }

    let mut reachable = ReachableSet::new();
    for commit in &commits {
        store::traverse_commit_union(repo, commit, 0, &mut reachable, cancel)?;
    }
    if !opts.quiet {
        info!(
            commits = commits.len(),
            objects = reachable.len(),
            "verifying reachable objects"
        );
    }

    let mut ordered: Vec<_> = reachable.into_iter().collect();
    ordered.sort();
    for (checksum, kind) in ordered {
        cancel::check(cancel)?;
        if !store::object_exists(repo, &checksum, kind) {
            warn!(object = %checksum, %kind, "missing object");
            report.missing.push((checksum, kind));
            continue;
        }

        let Some(corrupt) = verify_object(repo, &checksum, kind)? else {
            report.objects_verified += 1;
            continue;
        };
        warn!(object = %checksum, %kind, reason = %corrupt.message, "corrupted object");
        report.corrupted.push(corrupt);
        if opts.delete {
            store::delete_object(repo, &checksum, kind)?;
            report.deleted.push((checksum, kind));
        }
    }

    if !tombstone_candidates.is_empty() {
        repo.enable_tombstone_commits()?;
        for commit in tombstone_candidates {
            // already gone if it was corrupt and deleted above
            if !store::commit_exists(repo, &commit) {
                continue;
            }
            store::delete_object(repo, &commit, ObjectType::Commit)?;
            info!(%commit, "replaced commit with missing parent by a tombstone");
            report.tombstones_written.push(commit);
        }
    }

    if !opts.quiet {
        info!(
            verified = report.objects_verified,
            missing = report.missing.len(),
            corrupted = report.corrupted.len(),
            deleted = report.deleted.len(),
            "fsck finished"
        );
    }

    if report.is_ok() {
        Ok(report)
    } else {
        Err(Error::Corrupted(Box::new(report)))
    }
}

/// check one stored object; `Some` describes a corruption
///
/// an unreadable file header counts as corruption. malformed metadata is
/// returned as an error since nothing below it can be trusted.
fn verify_object(
    repo: &Repo,
    checksum: &Checksum,
    kind: ObjectType,
) -> Result<Option<CorruptObject>> {
    let result = if kind == ObjectType::File {
        store::compute_file_checksum(repo, checksum).and_then(|actual| {
            if actual == *checksum {
                Ok(())
            } else {
                Err(Error::CorruptObject {
                    object: *checksum,
                    kind,
                    actual,
                })
            }
        })
    } else {
        let bytes = store::read_meta_bytes(repo, checksum, kind)?;
        store::validate_meta_bytes(kind, checksum, &bytes)
    };

    match result {
        Ok(()) => Ok(None),
        Err(Error::CorruptObject { actual, .. }) => Ok(Some(CorruptObject {
            checksum: *checksum,
            kind,
            actual: Some(actual),
            message: format!("content hashes to {}", actual),
        })),
        Err(Error::StructuralInvalid { message, .. }) if kind == ObjectType::File => {
            Ok(Some(CorruptObject {
                checksum: *checksum,
                kind,
                actual: None,
                message,
            }))
        }
        Err(e) => Err(e),
    }
}
