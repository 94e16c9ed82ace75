use std::fmt;

use crate::checksum::Checksum;
use crate::error::{Error, Result};
use crate::refs::resolve_ref;
use crate::repo::Repo;
use crate::store;
use crate::types::{Commit, CommitState};

/// log options
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// stop after this many commits
    pub max_count: Option<usize>,
}

/// commit with its checksum for log output
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub checksum: Checksum,
    pub commit: Commit,
    pub partial: bool,
}

/// how a history walk ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryEnd {
    /// reached a commit without a parent
    Root,
    /// the parent was deleted and left a tombstone
    Tombstoned(Checksum),
    /// the parent is not stored (never pulled, or removed without a tombstone)
    Missing(Checksum),
    /// max_count was reached
    Truncated,
}

/// first-parent history, newest first
#[derive(Debug, Clone)]
pub struct History {
    pub entries: Vec<LogEntry>,
    pub end: HistoryEnd,
}

/// get commit history for a rev
pub fn log(repo: &Repo, rev: &str, opts: &LogOptions) -> Result<History> {
    let mut current = resolve_ref(repo, rev)?;
    let mut entries = Vec::new();
    let mut first = true;

    let end = loop {
        if opts.max_count.is_some_and(|max| entries.len() >= max) {
            break HistoryEnd::Truncated;
        }

        let (commit, state) = match store::load_commit(repo, &current) {
            Ok(loaded) => loaded,
            Err(Error::ObjectNotFound { .. }) if !first => {
                if store::has_tombstone(repo, &current) {
                    break HistoryEnd::Tombstoned(current);
                }
                break HistoryEnd::Missing(current);
            }
            Err(e) => return Err(e),
        };
        first = false;

        let parent = commit.parent;
        entries.push(LogEntry {
            checksum: current,
            commit,
            partial: state == CommitState::Partial,
        });

        match parent {
            Some(p) => current = p,
            None => break HistoryEnd::Root,
        }
    };

    Ok(History { entries, end })
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "commit {}", self.checksum)?;
        if self.partial {
            write!(f, " (partial)")?;
        }
        writeln!(f)?;
        if let Some(parent) = &self.commit.parent {
            writeln!(f, "Parent: {}", parent)?;
        }
        match self.commit.datetime() {
            Some(dt) => writeln!(f, "Date:   {}", dt.format("%Y-%m-%d %H:%M:%S %z"))?,
            None => writeln!(f, "Date:   @{}", self.commit.timestamp)?,
        }

        writeln!(f)?;
        writeln!(f, "    {}", self.commit.subject)?;
        if !self.commit.body.is_empty() {
            writeln!(f)?;
            for line in self.commit.body.lines() {
                writeln!(f, "    {}", line)?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for HistoryEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HistoryEnd::Root | HistoryEnd::Truncated => Ok(()),
            HistoryEnd::Tombstoned(c) => write!(f, "<< History beyond this commit deleted ({}) >>", c),
            HistoryEnd::Missing(c) => {
                write!(f, "<< History beyond this commit not fetched ({}) >>", c)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RepoMode;
    use crate::ops::commit::{commit, CommitOptions, TreeSource};
    use crate::repo::InitOptions;
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

    fn commit_version(repo: &Repo, dir: &Path, version: u32) -> Checksum {
        let source = dir.join("source");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join("file.txt"), format!("v{}", version)).unwrap();
        let opts = CommitOptions {
            branch: Some("test".to_string()),
            subject: Some(format!("commit {}", version)),
            body: Some("line one\nline two".to_string()),
            timestamp: Some(1_700_000_000 + i64::from(version)),
            skip_xattrs: true,
            ..Default::default()
        };
        commit(repo, &[TreeSource::Dir(source)], &opts, None)
            .unwrap()
            .checksum
    }

    #[test]
    fn test_log_newest_first() {
        let (dir, repo) = test_repo();
        let checksums: Vec<_> = (1..=3).map(|v| commit_version(&repo, dir.path(), v)).collect();

        let history = log(&repo, "test", &LogOptions::default()).unwrap();
        assert_eq!(history.end, HistoryEnd::Root);
        let seen: Vec<_> = history.entries.iter().map(|e| e.checksum).collect();
        assert_eq!(seen, checksums.into_iter().rev().collect::<Vec<_>>());
        assert_eq!(history.entries[0].commit.subject, "commit 3");
    }

    #[test]
    fn test_log_max_count() {
        let (dir, repo) = test_repo();
        for v in 0..5 {
            commit_version(&repo, dir.path(), v);
        }

        let opts = LogOptions { max_count: Some(2) };
        let history = log(&repo, "test", &opts).unwrap();
        assert_eq!(history.entries.len(), 2);
        assert_eq!(history.end, HistoryEnd::Truncated);
    }

    #[test]
    fn test_log_stops_at_missing_parent() {
        let (dir, repo) = test_repo();
        let first = commit_version(&repo, dir.path(), 1);
        commit_version(&repo, dir.path(), 2);

        store::delete_object(&repo, &first, ObjectType::Commit).unwrap();
        let history = log(&repo, "test", &LogOptions::default()).unwrap();
        assert_eq!(history.entries.len(), 1);
        assert_eq!(history.end, HistoryEnd::Missing(first));

        store::write_tombstone(&repo, &first).unwrap();
        let history = log(&repo, "test", &LogOptions::default()).unwrap();
        assert_eq!(history.end, HistoryEnd::Tombstoned(first));
        assert!(history.end.to_string().contains("deleted"));
    }

    #[test]
    fn test_log_entry_display() {
        let (dir, repo) = test_repo();
        commit_version(&repo, dir.path(), 1);
        repo.mark_partial(&commit_version(&repo, dir.path(), 2)).unwrap();

        let history = log(&repo, "test", &LogOptions::default()).unwrap();
        let display = history.entries[0].to_string();
        assert!(display.contains("(partial)"));
        assert!(display.contains("Parent: "));
        assert!(display.contains("Date:   2023-11-14"));
        assert!(display.contains("    commit 2"));
        assert!(display.contains("    line two"));
    }

    #[test]
    fn test_log_unknown_rev() {
        let (_dir, repo) = test_repo();
        assert!(log(&repo, "nope", &LogOptions::default())
            .unwrap_err()
            .is_not_found());
    }
}
