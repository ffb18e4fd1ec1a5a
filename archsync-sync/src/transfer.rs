//! Transfer Client: byte copy to the remote destination plus a remote
//! checksum query.
//!
//! Implementations never enforce deadlines themselves; the worker wraps every
//! call in `tokio::time::timeout` and drops the future on expiry. Child
//! processes are spawned with `kill_on_drop` so a dropped call does not leave
//! an `rsync` running in the background.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;

use archsync_core::{checksum, Checksum, WorkerConfig};

use crate::error::{transfer_io_err, TransferError};

#[async_trait]
pub trait Transfer: Send + Sync {
    /// Copy `local` to the absolute destination path `remote`, creating any
    /// missing parent directories. Partial remote bytes are left in place.
    async fn copy(&self, local: &Path, remote: &Path) -> Result<(), TransferError>;

    /// SHA-256 of the object at `remote`, computed on the remote side.
    async fn remote_checksum(&self, remote: &Path) -> Result<Checksum, TransferError>;

    /// Delete a retired local copy. Error kinds are passed through untouched;
    /// the sweep treats `NotFound` and `PermissionDenied` specially.
    async fn remove_local(&self, local: &Path) -> std::io::Result<()> {
        tokio::fs::remove_file(local).await
    }
}

/// Pick the transport a worker config describes: rsync over ssh when a
/// `remote_host` is set, a plain local copy otherwise.
pub fn for_config(config: &WorkerConfig) -> Arc<dyn Transfer> {
    match &config.remote_host {
        Some(host) => Arc::new(RsyncTransfer {
            host: host.clone(),
            ssh_key: config.ssh_key.clone(),
            compression: config.compression,
            bwlimit: config.bwlimit.clone(),
        }),
        None => Arc::new(LocalTransfer),
    }
}

// ---------------------------------------------------------------------------
// LocalTransfer
// ---------------------------------------------------------------------------

/// Copies into a locally mounted destination directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalTransfer;

#[async_trait]
impl Transfer for LocalTransfer {
    async fn copy(&self, local: &Path, remote: &Path) -> Result<(), TransferError> {
        if let Some(parent) = remote.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| transfer_io_err(parent, e))?;
        }
        tokio::fs::copy(local, remote)
            .await
            .map_err(|e| transfer_io_err(local, e))?;
        Ok(())
    }

    async fn remote_checksum(&self, remote: &Path) -> Result<Checksum, TransferError> {
        let path = remote.to_path_buf();
        tokio::task::spawn_blocking(move || {
            checksum::hash_file(&path).map_err(|e| transfer_io_err(&path, e))
        })
        .await
        .map_err(|e| {
            transfer_io_err(
                remote,
                std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
            )
        })?
    }
}

// ---------------------------------------------------------------------------
// RsyncTransfer
// ---------------------------------------------------------------------------

/// `rsync` over `ssh` to `host`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsyncTransfer {
    pub host: String,
    pub ssh_key: Option<PathBuf>,
    pub compression: bool,
    pub bwlimit: Option<String>,
}

impl RsyncTransfer {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ssh_key: None,
            compression: false,
            bwlimit: None,
        }
    }

    /// `ssh [-i key] <host> <remote command>`
    pub fn ssh_args(&self, remote_command: String) -> Vec<OsString> {
        let mut args = Vec::new();
        if let Some(key) = &self.ssh_key {
            args.push(OsString::from("-i"));
            args.push(key.clone().into_os_string());
        }
        args.push(OsString::from(&self.host));
        args.push(OsString::from(remote_command));
        args
    }

    /// `rsync -t [-z] [--bwlimit=..] [--rsh 'ssh -i key'] <local> <host>:<remote>`
    pub fn rsync_args(&self, local: &Path, remote: &Path) -> Vec<OsString> {
        let mut args = vec![OsString::from("-t")];
        if self.compression {
            args.push(OsString::from("-z"));
        }
        if let Some(limit) = &self.bwlimit {
            args.push(OsString::from(format!("--bwlimit={limit}")));
        }
        if let Some(key) = &self.ssh_key {
            args.push(OsString::from("--rsh"));
            args.push(OsString::from(format!(
                "ssh -i {}",
                shell_quote(&key.to_string_lossy())
            )));
        }
        args.push(local.as_os_str().to_os_string());
        let mut dest = OsString::from(format!("{}:", self.host));
        dest.push(remote.as_os_str());
        args.push(dest);
        args
    }
}

#[async_trait]
impl Transfer for RsyncTransfer {
    async fn copy(&self, local: &Path, remote: &Path) -> Result<(), TransferError> {
        if let Some(parent) = remote.parent() {
            let mkdir = format!("mkdir -p {}", shell_quote(&parent.to_string_lossy()));
            run("ssh", self.ssh_args(mkdir)).await?;
        }
        run("rsync", self.rsync_args(local, remote)).await?;
        Ok(())
    }

    async fn remote_checksum(&self, remote: &Path) -> Result<Checksum, TransferError> {
        let cmd = format!("sha256sum {}", shell_quote(&remote.to_string_lossy()));
        let stdout = run("ssh", self.ssh_args(cmd)).await?;
        parse_sha256sum(&stdout)
    }
}

async fn run(program: &str, args: Vec<OsString>) -> Result<String, TransferError> {
    let output = Command::new(program)
        .args(&args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| TransferError::Spawn {
            program: program.to_string(),
            source: e,
        })?;
    if !output.status.success() {
        return Err(TransferError::NonZeroExit {
            program: program.to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// First token of `sha256sum` output.
fn parse_sha256sum(stdout: &str) -> Result<Checksum, TransferError> {
    stdout
        .split_whitespace()
        .next()
        .and_then(Checksum::parse_hex)
        .ok_or_else(|| TransferError::BadChecksum(stdout.trim().to_string()))
}

/// Single-quote for a POSIX shell on the remote side.
fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}
