pub mod devino;
pub mod read;
pub mod write;

pub use devino::DevInoCache;
pub use read::{read_symlink_target, read_xattrs, FileKind, FileMetadata};
pub use write::{
    apply_metadata, apply_permissions, copy_to_new_file, create_symlink, fsync_dir, try_hardlink,
    remove_existing, LinkOutcome,
};
