use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::checksum::Checksum;
use crate::error::{Error, IoResultExt, Result};
use crate::fs::fsync_dir;
use crate::repo::Repo;

/// write a ref (create or update)
///
/// ref names may be hierarchical, like "exampleos/x86_64/stable". commits
/// normally move refs through a transaction; this is the primitive it uses.
pub fn write_ref(repo: &Repo, ref_name: &str, checksum: &Checksum) -> Result<()> {
    validate_ref_name(ref_name)?;

    let ref_path = ref_path(repo, ref_name);
    if let Some(parent) = ref_path.parent() {
        fs::create_dir_all(parent).with_path(parent)?;
    }

    // atomic write: temp -> fsync -> rename
    let fsync = repo.fsync_enabled();
    let tmp_path = repo.tmp_path().join(uuid::Uuid::new_v4().to_string());
    {
        let mut tmp_file = File::create(&tmp_path).with_path(&tmp_path)?;
        writeln!(tmp_file, "{}", checksum.to_hex()).with_path(&tmp_path)?;
        if fsync {
            tmp_file.sync_all().with_path(&tmp_path)?;
        }
    }

    fs::rename(&tmp_path, &ref_path).with_path(&ref_path)?;

    if fsync {
        if let Some(parent) = ref_path.parent() {
            fsync_dir(parent)?;
        }
    }

    Ok(())
}

/// read a ref
pub fn read_ref(repo: &Repo, ref_name: &str) -> Result<Checksum> {
    validate_ref_name(ref_name)?;
    let ref_path = ref_path(repo, ref_name);

    let content = fs::read_to_string(&ref_path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::RefNotFound(ref_name.to_string())
        } else {
            Error::Io {
                path: ref_path.clone(),
                source: e,
            }
        }
    })?;

    Checksum::from_hex(content.trim())
}

/// delete a ref
pub fn delete_ref(repo: &Repo, ref_name: &str) -> Result<()> {
    validate_ref_name(ref_name)?;
    let ref_path = ref_path(repo, ref_name);

    fs::remove_file(&ref_path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::RefNotFound(ref_name.to_string())
        } else {
            Error::Io {
                path: ref_path,
                source: e,
            }
        }
    })
}

/// resolve a ref name or checksum string
///
/// a 64 hex char string is taken as a checksum as-is. otherwise it is
/// looked up as a ref; with `allow_noent` a missing ref yields None.
pub fn resolve_rev(repo: &Repo, rev: &str, allow_noent: bool) -> Result<Option<Checksum>> {
    if Checksum::looks_like(rev) {
        return Checksum::from_hex(rev).map(Some);
    }

    match read_ref(repo, rev) {
        Ok(c) => Ok(Some(c)),
        Err(Error::RefNotFound(_)) if allow_noent => Ok(None),
        Err(e) => Err(e),
    }
}

/// resolve a rev that must exist
pub fn resolve_ref(repo: &Repo, rev: &str) -> Result<Checksum> {
    resolve_rev(repo, rev, false)?.ok_or_else(|| Error::RefNotFound(rev.to_string()))
}

/// list all ref names
pub fn list_refs(repo: &Repo) -> Result<Vec<String>> {
    let refs_dir = repo.refs_path();
    let mut refs = Vec::new();

    if refs_dir.exists() {
        collect_refs(&refs_dir, &refs_dir, &mut refs)?;
    }

    refs.sort();
    Ok(refs)
}

/// all refs with the commit each points at
pub fn list_refs_resolved(repo: &Repo) -> Result<BTreeMap<String, Checksum>> {
    let mut out = BTreeMap::new();
    for name in list_refs(repo)? {
        let checksum = read_ref(repo, &name)?;
        out.insert(name, checksum);
    }
    Ok(out)
}

/// list refs matching a glob pattern
pub fn list_refs_matching(repo: &Repo, pattern: &str) -> Result<Vec<String>> {
    let all_refs = list_refs(repo)?;
    let glob = glob::Pattern::new(pattern).map_err(|e| Error::InvalidRef(e.to_string()))?;

    Ok(all_refs.into_iter().filter(|r| glob.matches(r)).collect())
}

/// names of refs currently pointing at `commit`
pub fn refs_pointing_at(repo: &Repo, commit: &Checksum) -> Result<Vec<String>> {
    Ok(list_refs_resolved(repo)?
        .into_iter()
        .filter(|(_, c)| c == commit)
        .map(|(name, _)| name)
        .collect())
}

/// check if a ref exists
pub fn ref_exists(repo: &Repo, ref_name: &str) -> bool {
    ref_path(repo, ref_name).exists()
}

fn ref_path(repo: &Repo, ref_name: &str) -> PathBuf {
    repo.refs_path().join(ref_name)
}

/// recursively collect refs from directory
fn collect_refs(base: &Path, dir: &Path, refs: &mut Vec<String>) -> Result<()> {
    for entry in fs::read_dir(dir).with_path(dir)? {
        let entry = entry.with_path(dir)?;
        let path = entry.path();

        if path.is_dir() {
            collect_refs(base, &path, refs)?;
        } else if path.is_file() {
            if let Ok(rel) = path.strip_prefix(base) {
                refs.push(rel.to_string_lossy().to_string());
            }
        }
    }
    Ok(())
}

/// validate ref name
pub fn validate_ref_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidRef("empty ref name".to_string()));
    }

    if name.starts_with('/') || name.ends_with('/') {
        return Err(Error::InvalidRef(format!(
            "ref name cannot start or end with '/': {}",
            name
        )));
    }

    if name.contains("//") || name.contains('\0') || name.chars().any(char::is_whitespace) {
        return Err(Error::InvalidRef(name.to_string()));
    }

    for component in name.split('/') {
        if component == "." || component == ".." {
            return Err(Error::InvalidRef(format!(
                "ref name cannot contain '.' or '..': {}",
                name
            )));
        }
    }

    Ok(())
}
