//! PID file of the running broker.
//!
//! The file holds the daemon's process id followed by a newline. Readers
//! treat a file naming a dead process as stale and remove it.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Reads the PID stored at `path` if that process is alive.
///
/// A PID file that is unreadable or names a dead process is removed.
pub fn read_live_pid(path: &Path) -> Option<u32> {
    let pid_str = fs::read_to_string(path).ok()?;

    let pid: u32 = match pid_str.trim().parse() {
        Ok(p) => p,
        Err(_) => {
            cleanup_stale_pid_file(path);
            return None;
        }
    };

    if is_process_running(pid) {
        Some(pid)
    } else {
        cleanup_stale_pid_file(path);
        None
    }
}

/// Check if a process with the given PID is running.
fn is_process_running(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        Path::new(&format!("/proc/{}/stat", pid)).exists()
    }

    #[cfg(all(unix, not(target_os = "linux")))]
    {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        // Signal 0 only checks for existence; EPERM means it exists but is not ours
        matches!(kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
    }
}

fn cleanup_stale_pid_file(path: &Path) {
    let _ = fs::remove_file(path);
}

/// The running daemon's PID file. Removed when dropped.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Writes the current process id to `path`, creating parent directories.
    pub fn create(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, format!("{}\n", std::process::id()))?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// Path of the PID file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_process_running_current() {
        assert!(is_process_running(std::process::id()));
    }

    #[test]
    fn test_is_process_running_invalid() {
        assert!(!is_process_running(4_000_000_000));
    }

    #[test]
    fn test_pid_file_lifecycle() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("nested").join("daemon.pid");

        let pid_file = PidFile::create(&path).unwrap();
        assert_eq!(pid_file.path(), path.as_path());
        assert_eq!(read_live_pid(&path), Some(std::process::id()));

        drop(pid_file);
        assert!(!path.exists());
        assert_eq!(read_live_pid(&path), None);
    }

    #[test]
    fn test_stale_pid_file_is_removed() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("daemon.pid");
        fs::write(&path, "4000000000\n").unwrap();

        assert_eq!(read_live_pid(&path), None);
        assert!(!path.exists(), "Stale PID file should be cleaned up");
    }

    #[test]
    fn test_garbage_pid_file_is_removed() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("daemon.pid");
        fs::write(&path, "not-a-pid").unwrap();

        assert_eq!(read_live_pid(&path), None);
        assert!(!path.exists());
    }
}
