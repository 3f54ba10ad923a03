//! Bead records as reported by `bd show --json` and `bd list --json`.
//!
//! Parsing is tolerant: unknown fields are ignored, missing ones default,
//! and `show` may return either a single object or a one-element array.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::BeadsError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Open,
    Hooked,
    #[serde(alias = "in-progress")]
    InProgress,
    Pinned,
    Blocked,
    Closed,
    #[serde(other)]
    Unknown,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Open => "open",
            Status::Hooked => "hooked",
            Status::InProgress => "in_progress",
            Status::Pinned => "pinned",
            Status::Blocked => "blocked",
            Status::Closed => "closed",
            Status::Unknown => "unknown",
        }
    }

    /// `hooked`, `pinned` and `in_progress` each have exactly one owner.
    pub fn is_assigned(self) -> bool {
        matches!(self, Status::Hooked | Status::Pinned | Status::InProgress)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum IssueType {
    #[default]
    Task,
    Bug,
    Feature,
    Epic,
    #[serde(alias = "merge_request", alias = "mr")]
    MergeRequest,
    Agent,
    Role,
    Convoy,
    Molecule,
    Wisp,
    #[serde(other)]
    Other,
}

impl IssueType {
    pub fn as_str(self) -> &'static str {
        match self {
            IssueType::Task => "task",
            IssueType::Bug => "bug",
            IssueType::Feature => "feature",
            IssueType::Epic => "epic",
            IssueType::MergeRequest => "merge-request",
            IssueType::Agent => "agent",
            IssueType::Role => "role",
            IssueType::Convoy => "convoy",
            IssueType::Molecule => "molecule",
            IssueType::Wisp => "wisp",
            IssueType::Other => "other",
        }
    }
}

impl fmt::Display for IssueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A dependency edge as reported inline by `bd show`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRef {
    #[serde(alias = "depends_on_id")]
    pub id: String,
    #[serde(default, alias = "type", alias = "dependency_type")]
    pub dep_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Issue {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, alias = "type")]
    pub issue_type: IssueType,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Outgoing edges: this bead depends on (or tracks) these.
    #[serde(default)]
    pub dependencies: Vec<DependencyRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl Issue {
    pub fn new(id: &str, title: &str) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            ..Self::default()
        }
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    /// Value of the first `key:value` label with this key.
    pub fn label_value(&self, key: &str) -> Option<&str> {
        self.labels.iter().find_map(|l| {
            l.strip_prefix(key)
                .and_then(|rest| rest.strip_prefix(':'))
        })
    }

    /// Assignee, treating an empty string as unassigned.
    pub fn assignee(&self) -> Option<&str> {
        self.assignee.as_deref().filter(|a| !a.is_empty())
    }

    /// Bead IDs this issue blocks on (dependencies other than `tracks`).
    pub fn blockers(&self) -> Vec<&str> {
        self.dependencies
            .iter()
            .filter(|d| d.dep_type.is_empty() || d.dep_type == "blocks")
            .map(|d| d.id.as_str())
            .collect()
    }
}

/// Prefix of a bead ID including its trailing dash (`gp-abc` → `gp-`).
pub fn id_prefix(id: &str) -> Option<&str> {
    let idx = id.find('-')?;
    if idx == 0 {
        return None;
    }
    Some(&id[..=idx])
}

/// Parse `bd show --json`. Empty output means the bead does not exist.
pub fn parse_show(json: &str) -> Result<Option<Issue>, BeadsError> {
    let trimmed = json.trim();
    if trimmed.is_empty() || trimmed == "null" || trimmed == "[]" {
        return Ok(None);
    }
    let value: serde_json::Value = serde_json::from_str(trimmed).map_err(|e| BeadsError::Parse {
        command: "show",
        detail: e.to_string(),
    })?;
    let object = match value {
        serde_json::Value::Array(mut items) => {
            if items.is_empty() {
                return Ok(None);
            }
            items.swap_remove(0)
        }
        other => other,
    };
    serde_json::from_value(object)
        .map(Some)
        .map_err(|e| BeadsError::Parse {
            command: "show",
            detail: e.to_string(),
        })
}

/// Parse `bd list --json`.
pub fn parse_list(json: &str) -> Result<Vec<Issue>, BeadsError> {
    let trimmed = json.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Vec::new());
    }
    serde_json::from_str(trimmed).map_err(|e| BeadsError::Parse {
        command: "list",
        detail: e.to_string(),
    })
}
