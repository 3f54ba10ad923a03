//! Durable FIFO of pending dispatches, one JSON object per line.
//!
//! Adds append a line; removals and retry bumps rewrite the file through a
//! temp file and rename. Every mutation holds the queue's PID lock.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lock::PidLock;
use crate::town::Town;

const LOCK_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    pub bead_id: String,
    pub rig: String,
    #[serde(default)]
    pub retry_count: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueItem {
    pub fn new(bead_id: &str, rig: &str) -> Self {
        Self {
            bead_id: bead_id.to_string(),
            rig: rig.to_string(),
            retry_count: 0,
            enqueued_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Queue {
    path: PathBuf,
    lock_path: PathBuf,
}

impl Queue {
    pub fn new(path: &Path, lock_path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            lock_path: lock_path.to_path_buf(),
        }
    }

    pub fn for_town(town: &Town) -> Self {
        Self::new(&town.queue_path(), &town.lock_path("sling-queue"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> anyhow::Result<PidLock> {
        PidLock::acquire(&self.lock_path, LOCK_WAIT)
    }

    /// Enqueue `bead_id`. Returns false if it was already queued, in which
    /// case the existing entry is left untouched.
    pub fn add(&self, bead_id: &str, rig: &str) -> anyhow::Result<bool> {
        let _lock = self.lock()?;
        if self.read()?.iter().any(|item| item.bead_id == bead_id) {
            return Ok(false);
        }
        let item = QueueItem::new(bead_id, rig);
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut line = serde_json::to_string(&item)?;
        // Start on a fresh line if a crash left a torn entry.
        if fs::read(&self.path).is_ok_and(|b| b.last().is_some_and(|c| *c != b'\n')) {
            line.insert(0, '\n');
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening queue {}", self.path.display()))?;
        writeln!(file, "{line}")
            .with_context(|| format!("appending to queue {}", self.path.display()))?;
        tracing::debug!(bead = bead_id, rig, "queued");
        Ok(true)
    }

    /// Items in enqueue order.
    pub fn load(&self) -> anyhow::Result<Vec<QueueItem>> {
        self.read()
    }

    pub fn len(&self) -> anyhow::Result<usize> {
        Ok(self.read()?.len())
    }

    pub fn is_empty(&self) -> anyhow::Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Drop `bead_id`; returns whether it was queued.
    pub fn remove(&self, bead_id: &str) -> anyhow::Result<bool> {
        let _lock = self.lock()?;
        let mut items = self.read()?;
        let before = items.len();
        items.retain(|item| item.bead_id != bead_id);
        if items.len() == before {
            return Ok(false);
        }
        self.write(&items)?;
        Ok(true)
    }

    /// Bump the retry count after a failed dispatch; returns the new count.
    pub fn increment_retry(&self, bead_id: &str) -> anyhow::Result<Option<u32>> {
        let _lock = self.lock()?;
        let mut items = self.read()?;
        let Some(item) = items.iter_mut().find(|item| item.bead_id == bead_id) else {
            return Ok(None);
        };
        item.retry_count += 1;
        let count = item.retry_count;
        self.write(&items)?;
        Ok(Some(count))
    }

    fn read(&self) -> anyhow::Result<Vec<QueueItem>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("reading queue {}", self.path.display())));
            }
        };
        let mut items: Vec<QueueItem> = Vec::new();
        for (n, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<QueueItem>(line) {
                // First entry wins if a crash left a duplicate behind.
                Ok(item) if items.iter().any(|i| i.bead_id == item.bead_id) => {}
                Ok(item) => items.push(item),
                // A torn final line from a crash mid-append.
                Err(e) => tracing::warn!(
                    queue = %self.path.display(),
                    line = n + 1,
                    error = %e,
                    "skipping unreadable queue entry"
                ),
            }
        }
        Ok(items)
    }

    fn write(&self, items: &[QueueItem]) -> anyhow::Result<()> {
        let mut out = String::new();
        for item in items {
            out.push_str(&serde_json::to_string(item)?);
            out.push('\n');
        }
        let tmp = self.path.with_extension("jsonl.tmp");
        fs::write(&tmp, out).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("replacing queue {}", self.path.display()))?;
        Ok(())
    }
}
