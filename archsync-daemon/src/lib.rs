//! archsync daemon: one polling loop per configured archive plus a Unix
//! socket for status, on-demand sync and stop.

mod error;
pub mod logging;
pub mod paths;
pub mod protocol;
mod runtime;

pub use error::DaemonError;
pub use logging::{init_tracing, LogFormat};
pub use protocol::{
    ArchiveSnapshot, ArchiveStatus, ControlClient, ControlReply, ControlRequest, DaemonStatus,
};
pub use runtime::{run, start_blocking};
