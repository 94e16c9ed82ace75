use std::collections::HashMap;

use crate::checksum::Checksum;
use crate::types::FileHeader;

/// cache of file objects already written during one commit, keyed by inode
///
/// files sharing a (dev, ino) pair are hardlinks of each other. a hit is
/// only returned when the post-filter header matches the cached one, since
/// the filter may treat two paths of the same inode differently.
#[derive(Default)]
pub struct DevInoCache {
    seen: HashMap<(u64, u64), (FileHeader, Checksum)>,
}

impl DevInoCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// checksum written for this inode with exactly this header, if any
    pub fn lookup(&self, dev: u64, ino: u64, header: &FileHeader) -> Option<Checksum> {
        match self.seen.get(&(dev, ino)) {
            Some((cached, checksum)) if cached == header => Some(*checksum),
            _ => None,
        }
    }

    pub fn insert(&mut self, dev: u64, ino: u64, header: FileHeader, checksum: Checksum) {
        self.seen.insert((dev, ino), (header, checksum));
    }

    /// number of unique inodes tracked
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
