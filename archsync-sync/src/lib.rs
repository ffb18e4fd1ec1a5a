//! # archsync-sync
//!
//! Copy, verify, retry and delete for one archive, plus timecode bucket
//! tracking and finalization records.
//!
//! Build a [`SyncWorker`] from a registry handle, a worker config and a
//! [`Transfer`] implementation, then call [`SyncWorker::run_iteration`] on
//! whatever schedule the caller prefers.

pub mod error;
pub mod finalize;
pub mod report;
pub mod tracker;
pub mod transfer;
pub mod worker;

pub use error::{SyncError, TransferError};
pub use report::{archive_report, archive_report_at, ArchiveReport, BucketLine};
pub use tracker::{FinalizedBucket, TimecodeTracker};
pub use transfer::{LocalTransfer, RsyncTransfer, Transfer};
pub use worker::{IterationReport, SyncWorker, WorkerCounters};
