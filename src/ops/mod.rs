//! high-level operations on otree repositories

mod checkout;
mod commit;
mod fsck;
mod log;
mod prune;
mod summary;

pub use checkout::{
    checkout, checkout_batch, parse_batch, BatchCheckoutReport, BatchEntry, CheckoutOptions,
};
pub use commit::{
    commit, commit_with_signer, parse_tree_specs, CommitOptions, CommitOutcome, TreeSource,
    SIZES_METADATA_KEY,
};
pub use fsck::{fsck, CorruptObject, FsckOptions, FsckReport};
pub use log::{log, History, HistoryEnd, LogEntry, LogOptions};
pub use prune::{prune, PruneOptions, PruneReport};
pub use summary::{read_summary, regenerate_summary, Summary};
