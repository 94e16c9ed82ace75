mod commit;
mod file;
mod object;
mod tree;

pub use commit::{Commit, CommitState, DetachedMetadata, Tombstone};
pub use file::{FileHeader, Xattr, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG, SYMLINK_MODE};
pub use object::ObjectType;
pub use tree::{validate_entry_name, DirEntry, DirMeta, DirTree, FileEntry};
