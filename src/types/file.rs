use serde::{Deserialize, Serialize};

pub const S_IFMT: u32 = 0o170000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFLNK: u32 = 0o120000;

/// symlink mode used for deterministic hashing
pub const SYMLINK_MODE: u32 = 0o120777;

/// extended attribute (name + value)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Xattr {
    pub name: String,
    pub value: Vec<u8>,
}

impl Xattr {
    pub fn new(name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// logical metadata of a file object
///
/// `mode` carries the file type bits as well as permissions. for a
/// symlink the object content is the link target.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHeader {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub xattrs: Vec<Xattr>,
}

impl FileHeader {
    pub fn regular(uid: u32, gid: u32, mode: u32) -> Self {
        Self {
            uid,
            gid,
            mode: S_IFREG | (mode & 0o7777),
            xattrs: vec![],
        }
    }

    pub fn symlink(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            mode: SYMLINK_MODE,
            xattrs: vec![],
        }
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }

    pub fn is_regular(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }

    /// sort xattrs by name
    pub fn normalize(&mut self) {
        self.xattrs.sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_kinds() {
        let reg = FileHeader::regular(0, 0, 0o644);
        assert!(reg.is_regular());
        assert!(!reg.is_symlink());
        assert_eq!(reg.mode, 0o100644);

        let link = FileHeader::symlink(0, 0);
        assert!(link.is_symlink());
        assert_eq!(link.permissions(), 0o777);
    }

    #[test]
    fn test_regular_strips_type_bits() {
        let h = FileHeader::regular(0, 0, 0o040755);
        assert!(h.is_regular());
        assert_eq!(h.permissions(), 0o755);
    }
}
