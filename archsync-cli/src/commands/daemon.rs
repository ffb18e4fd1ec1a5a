//! `archsync daemon`: foreground runtime and its socket controls.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde::Serialize;

use archsync_core::ArchiveName;
use archsync_daemon::{start_blocking, ControlClient, DaemonError, LogFormat};

use super::Workspace;

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Run the daemon in the foreground (archive loops + socket server).
    Start(DaemonStartArgs),
    /// Request graceful daemon shutdown over the Unix socket.
    Stop,
    /// Query daemon runtime status over the Unix socket.
    Status,
    /// Ask the running daemon for an immediate iteration.
    Sync(DaemonSyncArgs),
}

#[derive(Args, Debug)]
pub struct DaemonStartArgs {
    /// Log as JSON lines instead of human-readable text.
    #[arg(long)]
    pub json_logs: bool,
}

#[derive(Args, Debug)]
pub struct DaemonSyncArgs {
    /// Only this archive; every archive when omitted.
    #[arg(long, short = 'a')]
    pub archive: Option<String>,
}

/// `daemon status` output when nothing answers on the socket.
#[derive(Serialize)]
struct NotRunning {
    running: bool,
    socket: String,
}

pub fn run(command: DaemonCommand, workspace: &Workspace) -> Result<()> {
    let client = ControlClient::new(&workspace.home);

    match command {
        DaemonCommand::Start(args) => {
            let config = workspace.require_config()?;
            let format = if args.json_logs {
                LogFormat::Json
            } else {
                LogFormat::Text
            };
            start_blocking(&workspace.home, config, format).context("daemon exited with error")?;
        }
        DaemonCommand::Stop => match client.stop() {
            Ok(()) => println!("daemon stop requested"),
            Err(DaemonError::DaemonNotRunning { .. }) => println!("daemon is not running"),
            Err(err) => return Err(err).context("failed to stop daemon"),
        },
        DaemonCommand::Status => match client.status() {
            Ok(status) => print_json(&status)?,
            Err(DaemonError::DaemonNotRunning { .. }) => print_json(&NotRunning {
                running: false,
                socket: client.socket().display().to_string(),
            })?,
            Err(err) => return Err(err).context("failed to query daemon status"),
        },
        DaemonCommand::Sync(args) => {
            let archive = args.archive.as_deref().map(ArchiveName::from);
            let reports = client.sync(archive).context("daemon sync failed")?;
            print_json(&reports)?;
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to render daemon JSON")?
    );
    Ok(())
}
