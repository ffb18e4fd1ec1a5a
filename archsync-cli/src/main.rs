//! archsync: register files and push them to their archive's remote.
//!
//! # Usage
//!
//! ```text
//! archsync add <local> <remote> --archive <name> [--no-delete]
//! archsync add-local-files <root> --archive <name> [--no-delete]
//! archsync correct-path <old> <new>
//! archsync status [--archive <name>] [--json]
//! archsync buckets --archive <name> [--json]
//! archsync sync [--archive <name>]
//! archsync list|next --archive <name>
//! archsync check <local>
//! archsync ignore <local> [--undo]
//! archsync daemon start|stop|status|sync
//! ```
//!
//! Every command accepts `--config <path>` (default `~/.archsync/config.yaml`).

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    add::{AddArgs, AddLocalFilesArgs, CorrectPathArgs},
    buckets::BucketsArgs,
    daemon::DaemonCommand,
    files::{CheckArgs, IgnoreArgs, ListArgs, NextArgs},
    status::StatusArgs,
    sync::SyncArgs,
    Workspace,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "archsync",
    version,
    about = "Copy, verify and retire locally produced files to a remote archive",
    long_about = None,
)]
struct Cli {
    /// Config file to use instead of ~/.archsync/config.yaml.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register a local file for syncing.
    Add(AddArgs),

    /// Register every not yet known file below a directory.
    AddLocalFiles(AddLocalFilesArgs),

    /// Point an existing registration at a moved local file.
    CorrectPath(CorrectPathArgs),

    /// Show per-archive copy and finalization progress.
    Status(StatusArgs),

    /// List the timecode buckets of one archive.
    Buckets(BucketsArgs),

    /// Run one sync iteration in the foreground.
    Sync(SyncArgs),

    /// Files the worker would copy, in the order it copies them.
    List(ListArgs),

    /// The file the worker copies next.
    Next(NextArgs),

    /// Dump the registry row of one file.
    Check(CheckArgs),

    /// Exclude a file from copying and finalization, or re-include it.
    Ignore(IgnoreArgs),

    /// Run or talk to the background daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    let workspace = Workspace::discover(cli.config)?;
    match cli.command {
        Commands::Add(args) => args.run(&workspace),
        Commands::AddLocalFiles(args) => args.run(&workspace),
        Commands::CorrectPath(args) => args.run(&workspace),
        Commands::Status(args) => args.run(&workspace),
        Commands::Buckets(args) => args.run(&workspace),
        Commands::Sync(args) => args.run(&workspace),
        Commands::List(args) => args.run(&workspace),
        Commands::Next(args) => args.run(&workspace),
        Commands::Check(args) => args.run(&workspace),
        Commands::Ignore(args) => args.run(&workspace),
        Commands::Daemon { command } => commands::daemon::run(command, &workspace),
    }
}
