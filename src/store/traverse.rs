use std::collections::HashSet;

use tracing::debug;

use crate::cancel::{self, Cancellable};
use crate::checksum::Checksum;
use crate::error::{Error, Result};
use crate::repo::Repo;
use crate::types::ObjectType;

use super::meta::{load_commit, load_dirtree};

/// objects reachable from a set of commits
pub type ReachableSet = HashSet<(Checksum, ObjectType)>;

/// add everything reachable from `commit` to `reachable`
///
/// `max_depth` bounds how many parents are followed; -1 follows the whole
/// history. the starting commit must exist. history ends quietly at the
/// first parent that is not stored. objects referenced but missing are
/// still recorded so a verifier can report them.
pub fn traverse_commit_union(
    repo: &Repo,
    commit: &Checksum,
    max_depth: i32,
    reachable: &mut ReachableSet,
    cancel: Option<&Cancellable>,
) -> Result<()> {
    let mut current = *commit;
    let mut remaining = max_depth;
    let mut first = true;

    loop {
        cancel::check(cancel)?;

        let (c, _state) = match load_commit(repo, &current) {
            Ok(loaded) => loaded,
            Err(Error::ObjectNotFound { .. }) if !first => {
                debug!(commit = %current, "history ends at missing parent");
                break;
            }
            Err(e) => return Err(e),
        };
        first = false;

        reachable.insert((current, ObjectType::Commit));
        reachable.insert((c.root_meta, ObjectType::DirMeta));
        traverse_dirtree(repo, &c.root_tree, reachable, cancel)?;

        if remaining == 0 {
            break;
        }
        if remaining > 0 {
            remaining -= 1;
        }

        match c.parent {
            Some(parent) => current = parent,
            None => break,
        }
    }

    Ok(())
}

/// add a tree and everything beneath it to `reachable`
///
/// a missing tree is recorded but not descended into.
pub fn traverse_dirtree(
    repo: &Repo,
    tree: &Checksum,
    reachable: &mut ReachableSet,
    cancel: Option<&Cancellable>,
) -> Result<()> {
    if !reachable.insert((*tree, ObjectType::DirTree)) {
        return Ok(());
    }
    cancel::check(cancel)?;

    let dirtree = match load_dirtree(repo, tree) {
        Ok(t) => t,
        Err(Error::ObjectNotFound { .. }) => return Ok(()),
        Err(e) => return Err(e),
    };

    for file in &dirtree.files {
        reachable.insert((file.checksum, ObjectType::File));
    }
    for dir in &dirtree.dirs {
        reachable.insert((dir.meta, ObjectType::DirMeta));
        traverse_dirtree(repo, &dir.tree, reachable, cancel)?;
    }

    Ok(())
}
