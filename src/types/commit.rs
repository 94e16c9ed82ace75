use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::checksum::Checksum;

/// a commit: a root tree plus history and descriptive metadata
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub parent: Option<Checksum>,
    pub subject: String,
    #[serde(default)]
    pub body: String,
    /// unix timestamp (seconds, UTC)
    pub timestamp: i64,
    pub root_tree: Checksum,
    pub root_meta: Checksum,
    /// BTreeMap for deterministic serialization
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Commit {
    pub fn new(root_tree: Checksum, root_meta: Checksum, parent: Option<Checksum>) -> Self {
        Self {
            parent,
            subject: String::new(),
            body: String::new(),
            timestamp: 0,
            root_tree,
            root_meta,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// commit time as a UTC datetime
    pub fn datetime(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        chrono::DateTime::from_timestamp(self.timestamp, 0)
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.metadata.keys().any(|k| k.is_empty()) {
            return Err("empty metadata key".to_string());
        }
        Ok(())
    }
}

/// detached metadata; the only part of a commit that may change after writing
pub type DetachedMetadata = BTreeMap<String, Vec<u8>>;

/// placeholder for a deleted commit
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub commit: Checksum,
    pub deleted_at: i64,
}

/// whether a commit's object closure is known to be complete
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitState {
    Normal,
    Partial,
}
