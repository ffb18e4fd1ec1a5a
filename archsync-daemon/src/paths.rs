use std::path::{Path, PathBuf};

pub const DAEMON_SOCKET: &str = "daemon.sock";

pub fn archsync_root(home: &Path) -> PathBuf {
    home.join(".archsync")
}

pub fn socket_path(home: &Path) -> PathBuf {
    archsync_root(home).join(DAEMON_SOCKET)
}
