//! Control protocol spoken over `~/.archsync/daemon.sock`.
//!
//! Each connection carries newline-terminated JSON frames: the client writes
//! a [`ControlRequest`], the daemon answers with one [`ControlReply`]. A
//! client may send several requests on one connection; `stop` ends it.
//!
//! ```text
//! → {"cmd":"sync","archive":"alpha"}
//! ← {"reply":"synced","reports":{"alpha":{"attempted":1,...}}}
//! ```

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use archsync_core::ArchiveName;
use archsync_sync::{ArchiveReport, IterationReport, WorkerCounters};

use crate::error::{io_err, DaemonError};
use crate::paths::socket_path;

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ControlRequest {
    Status,
    /// Run an iteration now; every archive when `archive` is absent.
    Sync {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        archive: Option<ArchiveName>,
    },
    Stop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum ControlReply {
    Status(DaemonStatus),
    Synced {
        reports: BTreeMap<ArchiveName, IterationReport>,
    },
    Stopping,
    /// The request was understood but could not be carried out, or was not
    /// understood at all.
    Rejected { reason: String },
}

/// Snapshot returned for `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub started_at: DateTime<Utc>,
    pub socket: PathBuf,
    pub db_path: PathBuf,
    pub archives: Vec<ArchiveSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveSnapshot {
    pub name: ArchiveName,
    pub worker: ArchiveStatus,
    pub report: ArchiveReport,
}

/// In-memory view of one archive loop. Lost on restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArchiveStatus {
    pub counters: WorkerCounters,
    pub last_iteration_at: Option<DateTime<Utc>>,
    pub last_report: Option<IterationReport>,
    pub last_error: Option<String>,
    pub deletion_disabled: bool,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Blocking client for the control socket under one home directory.
#[derive(Debug, Clone)]
pub struct ControlClient {
    socket: PathBuf,
}

impl ControlClient {
    pub fn new(home: &Path) -> Self {
        Self {
            socket: socket_path(home),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    pub fn status(&self) -> Result<DaemonStatus, DaemonError> {
        match self.exchange(&ControlRequest::Status)? {
            ControlReply::Status(status) => Ok(status),
            other => Err(unexpected("status", &other)),
        }
    }

    /// [`status`](Self::status), polled until the daemon has bound its socket
    /// or `within` has elapsed.
    pub fn wait_for_status(&self, within: Duration) -> Result<DaemonStatus, DaemonError> {
        let deadline = Instant::now() + within;
        loop {
            match self.status() {
                Err(DaemonError::DaemonNotRunning { .. }) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                outcome => return outcome,
            }
        }
    }

    pub fn sync(
        &self,
        archive: Option<ArchiveName>,
    ) -> Result<BTreeMap<ArchiveName, IterationReport>, DaemonError> {
        match self.exchange(&ControlRequest::Sync { archive })? {
            ControlReply::Synced { reports } => Ok(reports),
            other => Err(unexpected("sync", &other)),
        }
    }

    pub fn stop(&self) -> Result<(), DaemonError> {
        match self.exchange(&ControlRequest::Stop)? {
            ControlReply::Stopping => Ok(()),
            other => Err(unexpected("stop", &other)),
        }
    }

    /// One request frame out, one reply frame back. `Rejected` becomes
    /// [`DaemonError::Rejected`].
    pub fn exchange(&self, request: &ControlRequest) -> Result<ControlReply, DaemonError> {
        let stream = UnixStream::connect(&self.socket).map_err(|err| match err.kind() {
            ErrorKind::NotFound | ErrorKind::ConnectionRefused => DaemonError::DaemonNotRunning {
                socket: self.socket.clone(),
            },
            _ => io_err(&self.socket, err),
        })?;

        let mut frame = serde_json::to_vec(request)?;
        frame.push(b'\n');
        (&stream)
            .write_all(&frame)
            .map_err(|e| io_err(&self.socket, e))?;

        let mut line = String::new();
        let read = BufReader::new(&stream)
            .read_line(&mut line)
            .map_err(|e| io_err(&self.socket, e))?;
        if read == 0 {
            return Err(DaemonError::Protocol(
                "daemon closed the connection without replying".to_string(),
            ));
        }

        match serde_json::from_str(&line)? {
            ControlReply::Rejected { reason } => Err(DaemonError::Rejected(reason)),
            reply => Ok(reply),
        }
    }
}

fn unexpected(request: &str, reply: &ControlReply) -> DaemonError {
    DaemonError::Protocol(format!("unexpected reply to {request}: {reply:?}"))
}
