//! otree - transactional content-addressed filesystem store
//!
//! commits directory trees, tarballs and existing commits into an immutable,
//! deduplicated object store, checks them out again, verifies the store and
//! reclaims unreachable objects. similar in spirit to ostree.
//!
//! # Core concepts
//!
//! - **File object**: content plus ownership, mode and xattrs, addressed by
//!   the checksum of all of them
//! - **DirTree**: sorted file and subdirectory entries of one directory (CBOR)
//! - **DirMeta**: ownership, mode and xattrs of a directory (CBOR)
//! - **Commit**: root tree, root dirmeta, optional parent and a subject (CBOR)
//! - **Ref**: a named pointer to a commit (hierarchical, like git branches)
//!
//! every write happens inside a [`Transaction`]: objects are staged under
//! `tmp/` and only become visible, together with any ref updates, on commit.
//!
//! # Example usage
//!
//! ```no_run
//! use otree::{ops, InitOptions, Repo, RepoMode};
//! use std::path::{Path, PathBuf};
//!
//! let repo = Repo::init(
//!     Path::new("/path/to/repo"),
//!     InitOptions { mode: RepoMode::BareUser },
//! )
//! .unwrap();
//!
//! let opts = ops::CommitOptions {
//!     branch: Some("os/x86_64/stable".to_string()),
//!     subject: Some("initial import".to_string()),
//!     ..Default::default()
//! };
//! let source = ops::TreeSource::Dir(PathBuf::from("/source"));
//! let outcome = ops::commit(&repo, &[source], &opts, None).unwrap();
//!
//! let checkout = ops::CheckoutOptions {
//!     user_mode: true,
//!     ..Default::default()
//! };
//! ops::checkout(&repo, &outcome.checksum.to_hex(), Path::new("/destination"), &checkout, None)
//!     .unwrap();
//! ```

mod cancel;
mod checksum;
mod config;
mod error;
mod mtree;
mod refs;
mod repo;
mod txn;

pub mod filter;
pub mod fs;
pub mod ops;
pub mod sign;
pub mod store;
pub mod types;
pub mod writer;

pub use cancel::Cancellable;
pub use checksum::{file_checksum, Checksum, FileHasher};
pub use config::{Config, CoreConfig, Remote, RepoMode};
pub use error::{Error, IoResultExt, Result};
pub use mtree::{MtreeEntry, MutableTree};
pub use refs::{
    delete_ref, list_refs, list_refs_matching, list_refs_resolved, read_ref, ref_exists,
    refs_pointing_at, resolve_ref, resolve_rev, validate_ref_name, write_ref,
};
pub use repo::{InitOptions, Repo, RepoLock};
pub use txn::{Transaction, TransactionState, TransactionStats};
pub use types::{Commit, CommitState, DirMeta, DirTree, FileHeader, ObjectType, Xattr};
