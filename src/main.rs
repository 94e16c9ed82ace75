//! otree CLI - content-addressed filesystem store command line interface

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use otree::ops::{
    checkout, checkout_batch, commit, fsck, log, parse_tree_specs, prune, read_summary,
    regenerate_summary, CheckoutOptions, CommitOptions, FsckOptions, HistoryEnd, LogEntry,
    LogOptions, PruneOptions, TreeSource,
};
use otree::{sign, store, Error, InitOptions, Repo, RepoMode};

#[derive(Parser)]
#[command(name = "otree")]
#[command(about = "transactional content-addressed filesystem store")]
#[command(version)]
struct Cli {
    /// repository path
    #[arg(short, long, env = "OTREE_REPO", default_value = ".")]
    repo: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// initialize a new repository
    Init {
        /// path to create repository at
        #[arg(default_value = ".")]
        path: PathBuf,

        /// bare, bare-user or archive
        #[arg(long, default_value = "bare")]
        mode: RepoMode,
    },

    /// commit directories, tarballs or refs
    Commit {
        /// directory to commit; the current directory if no --tree is given
        path: Option<PathBuf>,

        /// branch to move to the new commit
        #[arg(short, long)]
        branch: Option<String>,

        /// commit without updating any ref
        #[arg(long)]
        orphan: bool,

        /// parent rev, or "none"
        #[arg(long)]
        parent: Option<String>,

        /// one-line subject
        #[arg(short, long)]
        subject: Option<String>,

        /// full description
        #[arg(short = 'm', long)]
        body: Option<String>,

        /// overlay TYPE=VALUE where TYPE is dir, tar, ref or layer
        #[arg(long = "tree")]
        trees: Vec<String>,

        #[arg(long)]
        owner_uid: Option<u32>,

        #[arg(long)]
        owner_gid: Option<u32>,

        /// do not import extended attributes
        #[arg(long)]
        no_xattrs: bool,

        /// record object sizes in the commit metadata
        #[arg(long)]
        generate_sizes: bool,

        /// reuse the parent if the tree did not change
        #[arg(long)]
        skip_if_unchanged: bool,

        /// commit time as unix seconds
        #[arg(long)]
        timestamp: Option<i64>,

        /// KEY=VALUE added to the commit
        #[arg(long = "add-metadata-string", value_parser = parse_key_value)]
        metadata: Vec<(String, String)>,

        /// KEY=VALUE added to the detached metadata
        #[arg(long = "add-detached-metadata-string", value_parser = parse_key_value)]
        detached_metadata: Vec<(String, String)>,

        /// sign with this gpg key (repeatable)
        #[arg(long = "gpg-sign")]
        gpg_keys: Vec<String>,

        #[arg(long)]
        gpg_homedir: Option<PathBuf>,

        /// file of "MODE PATH" overrides
        #[arg(long)]
        statoverride: Option<PathBuf>,

        /// file of paths to leave out
        #[arg(long)]
        skip_list: Option<PathBuf>,

        /// create missing parent directories of tar entries
        #[arg(long)]
        tar_autocreate_parents: bool,

        /// override the repository fsync setting
        #[arg(long)]
        fsync: Option<bool>,
    },

    /// check out a rev to a directory
    Checkout {
        /// rev to check out
        #[arg(required_unless_present = "from_file")]
        rev: Option<String>,

        /// destination; base directory for --from-file
        destination: Option<PathBuf>,

        /// only restore permission bits
        #[arg(short = 'U', long)]
        user_mode: bool,

        /// merge into an existing directory
        #[arg(long)]
        union: bool,

        /// a missing subpath is not an error
        #[arg(long)]
        allow_noent: bool,

        /// fail instead of copying when hardlinking is impossible
        #[arg(long)]
        require_hardlinks: bool,

        /// only check out this path of the tree
        #[arg(long)]
        subpath: Option<String>,

        /// process .wh. entries as deletions
        #[arg(long)]
        whiteouts: bool,

        /// file of "REV DEST" lines
        #[arg(long, conflicts_with = "rev")]
        from_file: Option<PathBuf>,
    },

    /// verify repository integrity
    Fsck {
        #[arg(short, long)]
        quiet: bool,

        /// delete corrupted objects
        #[arg(long)]
        delete: bool,

        /// replace commits whose parent is missing with tombstones
        #[arg(long)]
        add_tombstones: bool,
    },

    /// delete unreachable objects
    Prune {
        /// only report what would be deleted
        #[arg(long)]
        no_prune: bool,

        /// ignore commits no ref reaches
        #[arg(long)]
        refs_only: bool,

        /// delete this commit
        #[arg(long)]
        delete_commit: Option<String>,

        /// delete unreachable commits older than YYYY-MM-DD, RFC 3339 or @UNIX
        #[arg(long, value_parser = parse_date)]
        keep_younger_than: Option<i64>,

        /// parents to follow from each ref
        #[arg(long)]
        depth: Option<u32>,

        /// only delete static deltas
        #[arg(long)]
        static_deltas_only: bool,
    },

    /// show first-parent history
    Log {
        rev: String,

        /// maximum number of commits to show
        #[arg(short = 'n', long)]
        max_count: Option<usize>,
    },

    /// list refs
    Refs {
        /// only refs matching this glob
        pattern: Option<String>,
    },

    /// resolve a rev to a checksum
    RevParse {
        rev: String,

        /// output short checksum
        #[arg(long)]
        short: bool,
    },

    /// show a commit and its detached metadata
    Show { rev: String },

    /// manage remotes
    Remote {
        #[command(subcommand)]
        command: RemoteCommand,
    },

    /// show or regenerate the summary file
    Summary {
        /// regenerate before showing
        #[arg(short, long)]
        update: bool,
    },

    /// delete a ref
    DeleteRef { ref_name: String },
}

#[derive(Subcommand)]
enum RemoteCommand {
    /// add a remote
    Add { name: String, url: String },
    /// remove a remote
    Remove { name: String },
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {:?}", s)),
    }
}

fn parse_date(s: &str) -> Result<i64, String> {
    if let Some(ts) = s.strip_prefix('@') {
        return ts.parse().map_err(|e| format!("invalid timestamp {:?}: {}", s, e));
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp());
    }
    chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp())
        .ok_or_else(|| format!("invalid date {:?}", s))
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        if let Error::Corrupted(report) = &e {
            print!("{}", report);
        }
        eprintln!("error: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn run(cli: Cli) -> otree::Result<()> {
    match cli.command {
        Commands::Init { path, mode } => {
            Repo::init(&path, InitOptions { mode })?;
            println!("initialized {} repository at {}", mode, path.display());
        }

        Commands::Commit {
            path,
            branch,
            orphan,
            parent,
            subject,
            body,
            trees,
            owner_uid,
            owner_gid,
            no_xattrs,
            generate_sizes,
            skip_if_unchanged,
            timestamp,
            metadata,
            detached_metadata,
            gpg_keys,
            gpg_homedir,
            statoverride,
            skip_list,
            tar_autocreate_parents,
            fsync,
        } => {
            let repo = Repo::open(&cli.repo)?;
            let mut sources = Vec::new();
            if let Some(path) = path {
                sources.push(TreeSource::Dir(path));
            }
            sources.extend(parse_tree_specs(&trees)?);

            let opts = CommitOptions {
                branch,
                orphan,
                parent,
                subject,
                body,
                owner_uid,
                owner_gid,
                skip_xattrs: no_xattrs,
                generate_sizes,
                skip_if_unchanged,
                timestamp,
                metadata: metadata.into_iter().collect(),
                detached_metadata: detached_metadata
                    .into_iter()
                    .map(|(k, v)| (k, v.into_bytes()))
                    .collect(),
                gpg_keys,
                gpg_homedir,
                statoverride,
                skip_list,
                tar_autocreate_parents,
                fsync,
            };
            let outcome = commit(&repo, &sources, &opts, None)?;
            println!("{}", outcome.checksum);
        }

        Commands::Checkout {
            rev,
            destination,
            user_mode,
            union,
            allow_noent,
            require_hardlinks,
            subpath,
            whiteouts,
            from_file,
        } => {
            let repo = Repo::open(&cli.repo)?;
            let opts = CheckoutOptions {
                user_mode,
                union,
                allow_noent,
                require_hardlinks,
                subpath,
                whiteouts,
            };

            match (from_file, rev) {
                (Some(control), _) => {
                    let base = destination.unwrap_or_else(|| PathBuf::from("."));
                    let report = checkout_batch(&repo, &control, &base, &opts, None)?;
                    for (entry, err) in &report.failed {
                        eprintln!("{} -> {}: {}", entry.rev, entry.dest.display(), err);
                    }
                    println!(
                        "checked out {} of {}",
                        report.succeeded.len(),
                        report.succeeded.len() + report.failed.len()
                    );
                    if !report.is_ok() {
                        return Err(Error::InvalidArgument(format!(
                            "{} checkouts failed",
                            report.failed.len()
                        )));
                    }
                }
                (None, Some(rev)) => {
                    let destination = match destination {
                        Some(d) => d,
                        None => PathBuf::from(rev.rsplit('/').next().unwrap_or(&rev)),
                    };
                    checkout(&repo, &rev, &destination, &opts, None)?;
                    println!("checked out {} to {}", rev, destination.display());
                }
                (None, None) => {
                    return Err(Error::InvalidArgument("a rev is required".to_string()))
                }
            }
        }

        Commands::Fsck {
            quiet,
            delete,
            add_tombstones,
        } => {
            let repo = Repo::open(&cli.repo)?;
            let opts = FsckOptions {
                quiet,
                delete,
                add_tombstones,
            };
            let report = fsck(&repo, &opts, None)?;
            if !quiet {
                print!("{}", report);
            }
        }

        Commands::Prune {
            no_prune,
            refs_only,
            delete_commit,
            keep_younger_than,
            depth,
            static_deltas_only,
        } => {
            let repo = Repo::open(&cli.repo)?;
            let opts = PruneOptions {
                no_prune,
                refs_only,
                delete_commit,
                keep_younger_than,
                depth,
                static_deltas_only,
            };
            let report = prune(&repo, &opts, None)?;
            print!("{}", report);
        }

        Commands::Log { rev, max_count } => {
            let repo = Repo::open(&cli.repo)?;
            let history = log(&repo, &rev, &LogOptions { max_count })?;

            for entry in &history.entries {
                println!("{}", entry);
            }
            if matches!(history.end, HistoryEnd::Tombstoned(_) | HistoryEnd::Missing(_)) {
                println!("{}", history.end);
            }
        }

        Commands::Refs { pattern } => {
            let repo = Repo::open(&cli.repo)?;
            let refs = match pattern {
                Some(p) => otree::list_refs_matching(&repo, &p)?,
                None => otree::list_refs(&repo)?,
            };

            for ref_name in refs {
                let checksum = otree::read_ref(&repo, &ref_name)?;
                println!("{} {}", checksum, ref_name);
            }
        }

        Commands::RevParse { rev, short } => {
            let repo = Repo::open(&cli.repo)?;
            let checksum = otree::resolve_ref(&repo, &rev)?;
            if short {
                println!("{}", checksum.short());
            } else {
                println!("{}", checksum);
            }
        }

        Commands::Show { rev } => {
            let repo = Repo::open(&cli.repo)?;
            let (checksum, commit) = store::read_commit(&repo, &rev)?;
            let entry = LogEntry {
                checksum,
                partial: repo.is_partial(&checksum),
                commit,
            };
            print!("{}", entry);
            for (key, value) in &entry.commit.metadata {
                println!("    {}: {}", key, value);
            }

            if let Some(detached) = store::read_detached_metadata(&repo, &checksum)? {
                let signatures = sign::signatures(&detached)?;
                if !signatures.is_empty() {
                    println!("\nSignatures: {}", signatures.len());
                }
                for (key, value) in &detached {
                    if key != sign::GPG_SIGNATURES_KEY {
                        println!("detached {}: {} bytes", key, value.len());
                    }
                }
            }
        }

        Commands::Remote { command } => {
            let repo = Repo::open(&cli.repo)?;
            match command {
                RemoteCommand::Add { name, url } => {
                    repo.remote_add(&name, &url)?;
                    println!("added remote {}", name);
                }
                RemoteCommand::Remove { name } => {
                    repo.remote_remove(&name)?;
                    println!("removed remote {}", name);
                }
            }
        }

        Commands::Summary { update } => {
            let repo = Repo::open(&cli.repo)?;
            let summary = if update {
                Some(regenerate_summary(&repo)?)
            } else {
                read_summary(&repo)?
            };

            match summary {
                Some(summary) => {
                    for (name, checksum) in &summary.refs {
                        println!("{} {}", checksum, name);
                    }
                }
                None => println!("no summary; run with --update"),
            }
        }

        Commands::DeleteRef { ref_name } => {
            let repo = Repo::open(&cli.repo)?;
            otree::delete_ref(&repo, &ref_name)?;
            println!("deleted ref {}", ref_name);
        }
    }

    Ok(())
}
