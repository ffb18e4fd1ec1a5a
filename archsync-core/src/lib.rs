//! archsync core library: domain types, the SQLite file registry,
//! checksums, timecodes and configuration.
//!
//! - [`types`]: newtypes, rows and report structs
//! - [`registry`]: [`Registry`], the Registration API and worker queries
//! - [`config`]: [`DaemonConfig`] / [`WorkerConfig`]
//! - [`error`]: [`RegistryError`], [`ConfigError`]

pub mod checksum;
pub mod config;
pub mod error;
pub mod registry;
pub mod timecode;
pub mod types;

pub use checksum::Checksum;
pub use config::{DaemonConfig, WorkerConfig};
pub use error::{ConfigError, RegistryError};
pub use registry::Registry;
pub use timecode::Timecode;
pub use types::{
    ArchiveName, ArchiveStats, BucketPhase, BucketSummary, FileState, NewFile, Registration,
    SyncFile, TimecodeBucket, WorkerId,
};
