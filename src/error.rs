use std::path::PathBuf;

use crate::checksum::Checksum;
use crate::ops::FsckReport;
use crate::types::ObjectType;

/// error type for otree operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("repository not found at {0}")]
    NoRepo(PathBuf),

    #[error("repository already exists at {0}")]
    RepoExists(PathBuf),

    #[error("invalid repository mode: {0}")]
    InvalidRepoMode(String),

    #[error("repository is not writable: {0}")]
    NotWritable(PathBuf),

    #[error("ref not found: {0}")]
    RefNotFound(String),

    #[error("invalid ref name: {0}")]
    InvalidRef(String),

    #[error("path not found in tree: {0}")]
    PathNotFound(String),

    #[error("{kind} object not found: {checksum}")]
    ObjectNotFound { checksum: Checksum, kind: ObjectType },

    #[error("already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("checkout target not empty: {0}")]
    TargetNotEmpty(PathBuf),

    #[error("{kind} file references paths not present in the tree: {}", paths.join(", "))]
    UnmatchedOverridePath { kind: &'static str, paths: Vec<String> },

    #[error("commit {commit} is referenced by {}", refs.join(", "))]
    CommitInUse { commit: Checksum, refs: Vec<String> },

    #[error("corrupted object {object}.{kind}; actual checksum: {actual}")]
    CorruptObject {
        object: Checksum,
        kind: ObjectType,
        actual: Checksum,
    },

    #[error("repository corruption encountered")]
    Corrupted(Box<FsckReport>),

    #[error("invalid {kind} object {object}: {message}")]
    StructuralInvalid {
        object: Checksum,
        kind: ObjectType,
        message: String,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("malformed archive {path}: {message}")]
    MalformedArchive { path: PathBuf, message: String },

    #[error("unsupported file type at {0}")]
    UnsupportedFileType(PathBuf),

    #[error("a transaction is already open on this repository handle")]
    TransactionInProgress,

    #[error("no transaction is open")]
    NoTransaction,

    #[error("lock contention on repository")]
    LockContention,

    #[error("remote not found: {0}")]
    RemoteNotFound(String),

    #[error("remote already exists: {0}")]
    RemoteExists(String),

    #[error("cannot replace {existing} with {incoming}: {name}")]
    EntryConflict {
        name: String,
        existing: &'static str,
        incoming: &'static str,
    },

    #[error("invalid tree entry name: {0}")]
    InvalidEntryName(String),

    #[error("invalid checksum: {0}")]
    InvalidChecksum(String),

    #[error("signing with key {key} failed: {message}")]
    Signing { key: String, message: String },

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cbor serialization error: {0}")]
    CborEncode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("cbor deserialization error: {0}")]
    CborDecode(#[from] ciborium::de::Error<std::io::Error>),

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("config serialization error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("xattr error on {path}: {message}")]
    Xattr { path: PathBuf, message: String },
}

impl Error {
    /// true for the not-found family (missing ref, object or path)
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::RefNotFound(_) | Error::ObjectNotFound { .. } | Error::PathNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// helper to wrap io errors with path context
pub trait IoResultExt<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| Error::Io {
            path: path.into(),
            source,
        })
    }
}
