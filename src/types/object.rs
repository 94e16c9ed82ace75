use std::fmt;

use serde::{Deserialize, Serialize};

/// kind of object held in the store
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ObjectType {
    File,
    DirTree,
    DirMeta,
    Commit,
    /// detached metadata attached to a commit; replaceable
    CommitMeta,
    /// marker left behind by a deleted commit
    Tombstone,
}

impl ObjectType {
    pub const ALL: [ObjectType; 6] = [
        ObjectType::File,
        ObjectType::DirTree,
        ObjectType::DirMeta,
        ObjectType::Commit,
        ObjectType::CommitMeta,
        ObjectType::Tombstone,
    ];

    /// structured objects whose checksum covers their serialized bytes
    pub fn is_meta(self) -> bool {
        !matches!(self, ObjectType::File)
    }

    /// filename suffix in the object store
    pub fn extension(self) -> &'static str {
        match self {
            ObjectType::File => "file",
            ObjectType::DirTree => "dirtree",
            ObjectType::DirMeta => "dirmeta",
            ObjectType::Commit => "commit",
            ObjectType::CommitMeta => "commitmeta",
            ObjectType::Tombstone => "commit-tombstone",
        }
    }

    /// parse a filename suffix; `filez` is the archive-mode file suffix
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "file" | "filez" => Some(ObjectType::File),
            "dirtree" => Some(ObjectType::DirTree),
            "dirmeta" => Some(ObjectType::DirMeta),
            "commit" => Some(ObjectType::Commit),
            "commitmeta" => Some(ObjectType::CommitMeta),
            "commit-tombstone" => Some(ObjectType::Tombstone),
            _ => None,
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_roundtrip() {
        for kind in ObjectType::ALL {
            assert_eq!(ObjectType::from_extension(kind.extension()), Some(kind));
        }
        assert_eq!(ObjectType::from_extension("filez"), Some(ObjectType::File));
        assert_eq!(ObjectType::from_extension("filemeta"), None);
    }

    #[test]
    fn test_is_meta() {
        assert!(!ObjectType::File.is_meta());
        assert!(ObjectType::Commit.is_meta());
        assert!(ObjectType::DirTree.is_meta());
    }
}
