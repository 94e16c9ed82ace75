use std::collections::BTreeMap;
use std::fs;
use std::io;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::checksum::Checksum;
use crate::error::{Error, Result};
use crate::refs::list_refs_resolved;
use crate::repo::Repo;
use crate::store;

/// every ref and the commit it pointed at when the summary was written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub refs: BTreeMap<String, Checksum>,
    /// unix timestamp
    pub generated_at: i64,
}

/// rewrite the repository summary file
pub fn regenerate_summary(repo: &Repo) -> Result<Summary> {
    repo.ensure_writable()?;
    let summary = Summary {
        refs: list_refs_resolved(repo)?,
        generated_at: chrono::Utc::now().timestamp(),
    };
    let bytes = store::encode(&summary)?;
    store::write_atomic(repo, &repo.summary_path(), &bytes)?;
    info!(refs = summary.refs.len(), "regenerated summary");
    Ok(summary)
}

/// the last written summary, if any
pub fn read_summary(repo: &Repo) -> Result<Option<Summary>> {
    let path = repo.summary_path();
    match fs::read(&path) {
        Ok(bytes) => Ok(Some(ciborium::from_reader(&bytes[..])?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::Io { path, source: e }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refs::write_ref;
    use crate::repo::InitOptions;
    use tempfile::{tempdir, TempDir};

    fn test_repo() -> (TempDir, Repo) {
        let dir = tempdir().unwrap();
        let repo = Repo::init(&dir.path().join("repo"), InitOptions::default()).unwrap();
        (dir, repo)
    }

    #[test]
    fn test_summary_lists_refs() {
        let (_dir, repo) = test_repo();
        assert_eq!(read_summary(&repo).unwrap(), None);

        let a = Checksum::of(b"a");
        let b = Checksum::of(b"b");
        write_ref(&repo, "main", &a).unwrap();
        write_ref(&repo, "os/x86_64/stable", &b).unwrap();

        let written = regenerate_summary(&repo).unwrap();
        assert_eq!(written.refs.len(), 2);
        assert_eq!(written.refs["os/x86_64/stable"], b);

        assert_eq!(read_summary(&repo).unwrap(), Some(written));
    }

    #[test]
    fn test_summary_replaced() {
        let (_dir, repo) = test_repo();
        write_ref(&repo, "main", &Checksum::of(b"a")).unwrap();
        regenerate_summary(&repo).unwrap();

        crate::refs::delete_ref(&repo, "main").unwrap();
        regenerate_summary(&repo).unwrap();
        assert!(read_summary(&repo).unwrap().unwrap().refs.is_empty());
    }
}
