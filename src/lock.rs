//! PID lock files.
//!
//! Serializes queue mutations and the per-session start/nudge handshake
//! across processes. A lock whose owner PID is gone is stale and is taken
//! over.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use anyhow::Context;

/// How long a lock file may sit without a readable PID before it counts as
/// abandoned by a creator that died mid-write.
const UNREADABLE_GRACE: Duration = Duration::from_secs(2);

/// A held lock; the file is removed on drop.
#[derive(Debug)]
pub struct PidLock {
    path: PathBuf,
}

impl PidLock {
    /// Acquire `path`, waiting up to `wait` for another live holder to release it.
    pub fn acquire(path: &Path, wait: Duration) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating lock dir {}", parent.display()))?;
        }

        let start = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    write!(file, "{}", std::process::id())
                        .with_context(|| format!("writing lock {}", path.display()))?;
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if is_stale(path) {
                        tracing::debug!(lock = %path.display(), "removing stale lock");
                        let _ = fs::remove_file(path);
                        continue;
                    }
                    if start.elapsed() >= wait {
                        anyhow::bail!("lock {} is held by another process", path.display());
                    }
                    std::thread::sleep(Duration::from_millis(25));
                }
                Err(e) => {
                    return Err(anyhow::Error::new(e)
                        .context(format!("creating lock {}", path.display())));
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn is_stale(path: &Path) -> bool {
    let Ok(contents) = fs::read_to_string(path) else {
        // Vanished between create_new and read: let the loop retry.
        return false;
    };
    match contents.trim().parse::<u32>() {
        Ok(pid) => pid != std::process::id() && !is_process_running(pid),
        // Half-written by a concurrent creator; give it a moment.
        Err(_) => age(path).is_some_and(|age| age >= UNREADABLE_GRACE),
    }
}

fn age(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).and_then(|m| m.modified()).ok()?;
    SystemTime::now().duration_since(modified).ok()
}

/// Check if a process is still running.
fn is_process_running(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        Path::new(&format!("/proc/{pid}")).exists()
    }

    #[cfg(not(target_os = "linux"))]
    {
        std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }
}
