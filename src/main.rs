use anyhow::Result;
use clap::{Parser, Subcommand};

use snapsync::logger;
use snapsync::sync::{
    create_snapshot, merge_snapshots, sync_snapshots, update_snapshot, BaseSide, SyncOptions,
};

#[derive(Parser)]
#[command(
    name = "snapsync",
    version,
    about = "Bidirectional directory tree synchronization across local disk, FTP, and remote agents"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Record a fresh snapshot of a directory tree
    Create {
        /// Snapshot file to write (must end with .json)
        snapshot: String,
        /// Tree root: a local path, ftp://host:port/path, or
        /// air://host:port/path; defaults to the snapshot's own directory
        #[arg(default_value = ".")]
        root: String,
    },
    /// Rescan the tree and refresh the snapshot's current state
    Update {
        snapshot: String,
        /// Rescan only this subtree (relative to the snapshot root)
        #[arg(short, long)]
        prefix: Option<String>,
    },
    /// Reconcile the two trees described by two snapshots
    Sync {
        left: String,
        right: String,
        /// Show the action table without changing anything
        #[arg(short = 'd', long)]
        dry_run: bool,
        /// Resolve conflicts by modification time without backups
        #[arg(short = 'y', long)]
        auto_resolve: bool,
        /// Treat matching delete+add pairs as renames
        #[arg(short = 'm', long)]
        infer_moves: bool,
        /// Which side's recorded ancestor to diff against when they differ
        #[arg(long, value_enum)]
        base: Option<BaseSide>,
    },
    /// Union-merge two trees that never shared an ancestor
    Merge {
        left: String,
        right: String,
        #[arg(short = 'd', long)]
        dry_run: bool,
        #[arg(short = 'y', long)]
        auto_resolve: bool,
    },
}

fn main() -> Result<()> {
    logger::init_logger()?;
    logger::rotate_log_if_needed()?;

    let cli = Cli::parse();
    match cli.command {
        Command::Create { snapshot, root } => create_snapshot(&snapshot, &root),
        Command::Update { snapshot, prefix } => update_snapshot(&snapshot, prefix.as_deref()),
        Command::Sync {
            left,
            right,
            dry_run,
            auto_resolve,
            infer_moves,
            base,
        } => sync_snapshots(
            &left,
            &right,
            &SyncOptions {
                dry_run,
                auto_resolve,
                infer_moves,
                base,
            },
        ),
        Command::Merge {
            left,
            right,
            dry_run,
            auto_resolve,
        } => merge_snapshots(&left, &right, dry_run, auto_resolve),
    }
}
