//! Activity feed: one JSON object per line under the town runtime dir.
//!
//! Writes are best-effort. A failed append is logged and never fails the
//! operation that produced the event.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedEvent {
    pub ts: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: String,
    pub actor: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct Feed {
    path: PathBuf,
}

impl Feed {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    /// Append an event, logging instead of failing.
    pub fn record(&self, kind: &str, actor: &str, payload: serde_json::Value) {
        if let Err(e) = self.append(kind, actor, payload) {
            tracing::warn!(feed = %self.path.display(), kind, error = %e, "feed append failed");
        }
    }

    pub fn append(&self, kind: &str, actor: &str, payload: serde_json::Value) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let event = FeedEvent {
            ts: Utc::now(),
            kind: kind.to_string(),
            actor: actor.to_string(),
            payload,
        };
        let mut line = serde_json::to_string(&event).context("serializing feed event")?;
        line.push('\n');
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| f.write_all(line.as_bytes()))
            .with_context(|| format!("appending to {}", self.path.display()))
    }

    /// All events, skipping lines that fail to parse.
    pub fn read_all(&self) -> Vec<FeedEvent> {
        let Ok(contents) = fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        contents
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect()
    }
}
