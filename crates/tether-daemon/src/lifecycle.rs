//! Process housekeeping for the daemon binary
//!
//! Resolves where the socket and PID file live and answers whether another
//! daemon already owns them. Everything here is plain filesystem work; the
//! server itself never touches these paths except through [`DaemonPaths`].

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;

/// The filesystem locations one daemon instance owns.
#[derive(Debug, Clone)]
pub struct DaemonPaths {
    pub socket: PathBuf,
    pub pid_file: PathBuf,
}

impl DaemonPaths {
    /// Default locations under the platform runtime directory, overridable
    /// with `TETHER_SOCKET` and `TETHER_PID_FILE` for tests and
    /// multi-instance setups.
    pub fn resolve() -> Self {
        let base = dirs::runtime_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("tether");
        let socket = std::env::var_os("TETHER_SOCKET")
            .map(PathBuf::from)
            .unwrap_or_else(|| base.join("tetherd.sock"));
        let pid_file = std::env::var_os("TETHER_PID_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| base.join("tetherd.pid"));
        Self { socket, pid_file }
    }

    /// Place both files under one directory.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            socket: dir.join("tetherd.sock"),
            pid_file: dir.join("tetherd.pid"),
        }
    }

    /// Record this process as the owning daemon.
    pub fn write_pid(&self) -> Result<()> {
        if let Some(parent) = self.pid_file.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.pid_file, std::process::id().to_string())?;
        Ok(())
    }

    pub fn clear_pid(&self) {
        let _ = fs::remove_file(&self.pid_file);
    }

    /// True when the PID file names a process that still exists. A missing
    /// or garbled PID file counts as not running.
    pub fn daemon_alive(&self) -> bool {
        let Ok(raw) = fs::read_to_string(&self.pid_file) else {
            return false;
        };
        match raw.trim().parse::<u32>() {
            Ok(pid) => process_exists(pid),
            Err(_) => false,
        }
    }

    pub fn remove_socket(&self) {
        let _ = fs::remove_file(&self.socket);
    }
}

// Liveness via procfs; the daemon only targets Linux.
fn process_exists(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}
