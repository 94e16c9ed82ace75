use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::types::{FileHeader, Xattr};
use crate::Error;

/// SHA-256 checksum identifying an object
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Checksum([u8; 32]);

impl Checksum {
    /// create from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// parse from hex string
    pub fn from_hex(s: &str) -> crate::Result<Self> {
        let bytes = hex::decode(s).map_err(|_| Error::InvalidChecksum(s.to_string()))?;
        if bytes.len() != 32 {
            return Err(Error::InvalidChecksum(s.to_string()));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// true if the string has the shape of a checksum (64 hex chars)
    pub fn looks_like(s: &str) -> bool {
        s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
    }

    /// checksum of an arbitrary byte buffer
    pub fn of(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// abbreviated form for human output
    pub fn short(&self) -> String {
        self.to_hex()[..12].to_string()
    }

    /// split into path components for the object store
    /// returns (first 2 hex chars, remaining 62 hex chars)
    pub fn to_path_components(&self) -> (String, String) {
        let hex = self.to_hex();
        (hex[..2].to_string(), hex[2..].to_string())
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", self.short())
    }
}

impl std::str::FromStr for Checksum {
    type Err = Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::from_hex(s)
    }
}

impl Serialize for Checksum {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Checksum {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// streaming hasher for file objects
///
/// layout fed to SHA-256:
///   uid, gid, mode: 4 bytes LE each
///   xattr_count: 4 bytes LE
///   for each xattr (sorted by name): name_len, name, value_len, value
///   content bytes
pub struct FileHasher {
    hasher: Sha256,
}

impl FileHasher {
    /// create new hasher, feeding the header immediately
    pub fn new(header: &FileHeader) -> Self {
        let mut hasher = Sha256::new();

        hasher.update(header.uid.to_le_bytes());
        hasher.update(header.gid.to_le_bytes());
        hasher.update(header.mode.to_le_bytes());

        let mut sorted: Vec<&Xattr> = header.xattrs.iter().collect();
        sorted.sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));

        hasher.update((sorted.len() as u32).to_le_bytes());
        for xattr in sorted {
            hasher.update((xattr.name.len() as u32).to_le_bytes());
            hasher.update(xattr.name.as_bytes());
            hasher.update((xattr.value.len() as u32).to_le_bytes());
            hasher.update(&xattr.value);
        }

        Self { hasher }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finalize(self) -> Checksum {
        Checksum(self.hasher.finalize().into())
    }
}

/// checksum of a file object: header plus content
pub fn file_checksum(header: &FileHeader, content: &[u8]) -> Checksum {
    let mut hasher = FileHasher::new(header);
    hasher.update(content);
    hasher.finalize()
}
