//! Daemon runtime: one loop per archive, a control socket, and ctrl-c.
//!
//! Every long-lived task listens on one broadcast channel; whichever task
//! ends first (a `stop` request, ctrl-c, a failed loop) fires it so the
//! others wind down too.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use archsync_core::config::MAX_INTERVAL_SECS;
use archsync_core::{ArchiveName, DaemonConfig, Registry, WorkerConfig};
use archsync_sync::{report, transfer, IterationReport, SyncWorker};

use crate::error::{io_err, DaemonError};
use crate::logging::{init_tracing, LogFormat};
use crate::paths::{archsync_root, socket_path};
use crate::protocol::{ArchiveSnapshot, ArchiveStatus, ControlReply, ControlRequest, DaemonStatus};

type StatusMap = Arc<RwLock<BTreeMap<ArchiveName, ArchiveStatus>>>;
type TaskHandle = JoinHandle<Result<(), DaemonError>>;

/// On-demand iteration request queued to one archive loop.
struct SyncJob {
    respond_to: oneshot::Sender<Result<IterationReport, String>>,
}

/// State the control socket reads from.
#[derive(Clone)]
struct Shared {
    home: PathBuf,
    registry: Registry,
    workers: Arc<Vec<WorkerConfig>>,
    jobs: HashMap<ArchiveName, mpsc::Sender<SyncJob>>,
    status: StatusMap,
    started_at: DateTime<Utc>,
}

/// Build a multi-threaded runtime and run the daemon on it until it stops.
pub fn start_blocking(
    home: &Path,
    config: DaemonConfig,
    format: LogFormat,
) -> Result<(), DaemonError> {
    init_tracing(format);
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio runtime", e))?
        .block_on(run(home.to_path_buf(), config))
}

/// Run the daemon until `stop` or ctrl-c.
pub async fn run(home: PathBuf, config: DaemonConfig) -> Result<(), DaemonError> {
    config.validate()?;
    let root = archsync_root(&home);
    fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;

    let db_path = config.db_path_at(&home);
    let open_path = db_path.clone();
    let registry = tokio::task::spawn_blocking(move || Registry::open_at(&open_path))
        .await
        .map_err(|e| task_failed("registry open", e))??;
    tracing::info!(
        db = %db_path.display(),
        archives = config.workers.len(),
        "archsync daemon starting",
    );

    let (shutdown, _) = broadcast::channel::<()>(16);
    let status: StatusMap = Arc::new(RwLock::new(
        config
            .workers
            .iter()
            .map(|w| (w.archive_name.clone(), ArchiveStatus::default()))
            .collect(),
    ));

    let mut jobs = HashMap::new();
    let mut tasks: Vec<(String, TaskHandle)> = Vec::new();
    for worker_config in &config.workers {
        let (job_tx, job_rx) = mpsc::channel::<SyncJob>(16);
        jobs.insert(worker_config.archive_name.clone(), job_tx);
        let worker = SyncWorker::new(
            registry.clone(),
            worker_config.clone(),
            transfer::for_config(worker_config),
        );
        let loop_status = status.clone();
        tasks.push((
            format!("archive '{}'", worker_config.archive_name),
            spawn_until_shutdown(&shutdown, move |stop| {
                archive_loop(worker, job_rx, loop_status, stop)
            }),
        ));
    }

    let shared = Shared {
        home,
        registry,
        workers: Arc::new(config.workers),
        jobs,
        status,
        started_at: Utc::now(),
    };
    let trigger = shutdown.clone();
    tasks.push((
        "control socket".to_string(),
        spawn_until_shutdown(&shutdown, move |stop| serve_control(shared, trigger, stop)),
    ));
    let trigger = shutdown.clone();
    tasks.push((
        "signal handler".to_string(),
        spawn_until_shutdown(&shutdown, move |stop| watch_ctrl_c(trigger, stop)),
    ));

    let outcome = settle(tasks).await;
    tracing::info!("archsync daemon stopped");
    outcome
}

/// Spawn a task that receives its own shutdown receiver and fires shutdown
/// for everyone else once it returns, for whatever reason.
fn spawn_until_shutdown<F, Fut>(shutdown: &broadcast::Sender<()>, task: F) -> TaskHandle
where
    F: FnOnce(broadcast::Receiver<()>) -> Fut,
    Fut: std::future::Future<Output = Result<(), DaemonError>> + Send + 'static,
{
    let fut = task(shutdown.subscribe());
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        let result = fut.await;
        let _ = shutdown.send(());
        result
    })
}

/// Await every task; the first failure (or panic) is the daemon's result.
async fn settle(tasks: Vec<(String, TaskHandle)>) -> Result<(), DaemonError> {
    let mut first_failure = None;
    for (task, handle) in tasks {
        let outcome = handle.await.unwrap_or_else(|e| Err(task_failed(&task, e)));
        if let Err(err) = outcome {
            tracing::error!(task = %task, error = %err, "daemon task failed");
            first_failure.get_or_insert(err);
        }
    }
    first_failure.map_or(Ok(()), Err)
}

fn task_failed(task: &str, err: tokio::task::JoinError) -> DaemonError {
    DaemonError::Task {
        task: task.to_string(),
        reason: err.to_string(),
    }
}

async fn watch_ctrl_c(
    shutdown: broadcast::Sender<()>,
    mut stop: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    tokio::select! {
        _ = stop.recv() => Ok(()),
        signal = tokio::signal::ctrl_c() => {
            signal.map_err(|e| io_err("ctrl-c handler", e))?;
            tracing::info!("received ctrl-c, shutting down daemon");
            let _ = shutdown.send(());
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Archive loop
// ---------------------------------------------------------------------------

/// One archive: iterate, then wait for the interval, an on-demand job or
/// shutdown. Iteration errors are logged and retried after the normal
/// interval; they never end the loop.
async fn archive_loop(
    mut worker: SyncWorker,
    mut jobs: mpsc::Receiver<SyncJob>,
    status: StatusMap,
    mut stop: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let archive = worker.config().archive_name.clone();
    let interval = worker.config().sleep_time();
    let mut next_run = Instant::now();

    loop {
        let job = tokio::select! {
            _ = stop.recv() => break,
            _ = tokio::time::sleep_until(next_run) => None,
            job = jobs.recv() => match job {
                Some(job) => Some(job),
                None => break,
            },
        };

        let result = worker.run_iteration().await;
        next_run = deadline_after(interval);

        {
            let mut guard = status.write().await;
            let entry = guard.entry(archive.clone()).or_default();
            entry.counters = worker.counters();
            entry.last_iteration_at = Some(Utc::now());
            entry.deletion_disabled = worker.deletion_disabled();
            match &result {
                Ok(report) => {
                    entry.last_report = Some(report.clone());
                    entry.last_error = None;
                }
                Err(err) => {
                    tracing::error!(
                        archive = %archive,
                        error = %err,
                        retry_in_secs = interval.as_secs(),
                        "sync iteration aborted",
                    );
                    entry.last_error = Some(err.to_string());
                }
            }
        }

        if let Some(job) = job {
            let _ = job.respond_to.send(result.map_err(|e| e.to_string()));
        }
    }

    Ok(())
}

/// `interval` from now, capped so an unvalidated interval cannot overflow.
fn deadline_after(interval: Duration) -> Instant {
    let now = Instant::now();
    let capped = interval.min(Duration::from_secs(MAX_INTERVAL_SECS));
    now.checked_add(capped).unwrap_or(now)
}

// ---------------------------------------------------------------------------
// Control socket
// ---------------------------------------------------------------------------

async fn serve_control(
    shared: Shared,
    shutdown: broadcast::Sender<()>,
    mut stop: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let socket = socket_path(&shared.home);
    claim_socket_path(&socket)?;
    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    restrict_to_owner(&socket)?;
    tracing::info!(socket = %socket.display(), "listening for control requests");

    let served = loop {
        tokio::select! {
            _ = stop.recv() => break Ok(()),
            accepted = listener.accept() => {
                let stream = match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => break Err(io_err(&socket, e)),
                };
                let shared = shared.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(err) = serve_client(stream, &shared, &shutdown).await {
                        tracing::warn!(error = %err, "control client dropped");
                    }
                });
            }
        }
    };

    if let Err(e) = fs::remove_file(&socket) {
        if e.kind() != ErrorKind::NotFound {
            tracing::warn!(socket = %socket.display(), error = %e, "could not remove socket");
        }
    }
    served
}

/// Refuse to start over a live daemon; clear a socket file left by a dead one.
fn claim_socket_path(socket: &Path) -> Result<(), DaemonError> {
    if StdUnixStream::connect(socket).is_ok() {
        return Err(DaemonError::AlreadyRunning {
            socket: socket.to_path_buf(),
        });
    }
    match fs::remove_file(socket) {
        Ok(()) => {
            tracing::warn!(socket = %socket.display(), "removed stale control socket");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err(socket, e)),
    }
}

#[cfg(unix)]
fn restrict_to_owner(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn restrict_to_owner(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}

async fn serve_client(
    stream: UnixStream,
    shared: &Shared,
    shutdown: &broadcast::Sender<()>,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut frames = BufReader::new(reader).lines();

    while let Some(frame) = frames
        .next_line()
        .await
        .map_err(|e| io_err("control socket", e))?
    {
        if frame.trim().is_empty() {
            continue;
        }
        let request = match serde_json::from_str::<ControlRequest>(&frame) {
            Ok(request) => request,
            Err(err) => {
                let reason = format!("invalid request: {err}");
                send_frame(&mut writer, &ControlReply::Rejected { reason }).await?;
                continue;
            }
        };
        tracing::debug!(request = ?request, "control request");

        let reply = answer(&request, shared, shutdown).await;
        send_frame(&mut writer, &reply).await?;
        if request == ControlRequest::Stop {
            break;
        }
    }
    Ok(())
}

async fn answer(
    request: &ControlRequest,
    shared: &Shared,
    shutdown: &broadcast::Sender<()>,
) -> ControlReply {
    let outcome = match request {
        ControlRequest::Status => daemon_status(shared).await.map(ControlReply::Status),
        ControlRequest::Sync { archive } => sync_archives(shared, archive.clone())
            .await
            .map(|reports| ControlReply::Synced { reports }),
        ControlRequest::Stop => {
            let _ = shutdown.send(());
            Ok(ControlReply::Stopping)
        }
    };
    outcome.unwrap_or_else(|err| ControlReply::Rejected {
        reason: err.to_string(),
    })
}

async fn send_frame<W, T>(writer: &mut W, frame: &T) -> Result<(), DaemonError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut bytes = serde_json::to_vec(frame)?;
    bytes.push(b'\n');
    writer
        .write_all(&bytes)
        .await
        .map_err(|e| io_err("control socket", e))
}

/// Trigger an immediate iteration on one archive (or all, in name order) and
/// collect the reports.
async fn sync_archives(
    shared: &Shared,
    archive: Option<ArchiveName>,
) -> Result<BTreeMap<ArchiveName, IterationReport>, DaemonError> {
    let targets: Vec<ArchiveName> = match archive {
        Some(name) if shared.jobs.contains_key(&name) => vec![name],
        Some(name) => return Err(DaemonError::UnknownArchive(name.0)),
        None => {
            let mut names: Vec<_> = shared.jobs.keys().cloned().collect();
            names.sort();
            names
        }
    };

    let mut reports = BTreeMap::new();
    for name in targets {
        if let Some(sender) = shared.jobs.get(&name) {
            let report = enqueue_sync(sender).await?;
            reports.insert(name, report);
        }
    }
    Ok(reports)
}

async fn enqueue_sync(sender: &mpsc::Sender<SyncJob>) -> Result<IterationReport, DaemonError> {
    let (respond_to, response) = oneshot::channel();
    sender
        .send(SyncJob { respond_to })
        .await
        .map_err(|_| DaemonError::ChannelClosed("sync queue"))?;
    response
        .await
        .map_err(|_| DaemonError::ChannelClosed("sync response"))?
        .map_err(DaemonError::Rejected)
}

async fn daemon_status(shared: &Shared) -> Result<DaemonStatus, DaemonError> {
    let loops = shared.status.read().await.clone();

    let registry = shared.registry.clone();
    let workers = shared.workers.clone();
    let reports = tokio::task::spawn_blocking(move || {
        workers
            .iter()
            .map(|w| {
                report::archive_report(&registry, &w.archive_name, w.max_copy_attempts)
                    .map(|r| (w.archive_name.clone(), r))
            })
            .collect::<Result<Vec<_>, _>>()
    })
    .await
    .map_err(|e| task_failed("status report", e))??;

    let archives = reports
        .into_iter()
        .map(|(name, report)| ArchiveSnapshot {
            worker: loops.get(&name).cloned().unwrap_or_default(),
            name,
            report,
        })
        .collect();

    Ok(DaemonStatus {
        started_at: shared.started_at,
        socket: socket_path(&shared.home),
        db_path: shared.registry.path().to_path_buf(),
        archives,
    })
}
