//! Typed fields stored as `key: value` lines in a bead description.
//!
//! Every setter edits in place: lines it does not own, including free-form
//! prose, are carried through unchanged.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    /// `raw` is the original text, kept until the value is changed.
    Field {
        key: String,
        value: String,
        raw: String,
    },
    Text(String),
}

/// A description split into recognized `key: value` lines and everything else.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Fields {
    lines: Vec<Line>,
}

fn parse_line(line: &str) -> Line {
    if let Some((key, value)) = line.split_once(':') {
        let key = key.trim();
        let is_key = !key.is_empty()
            && !line.starts_with(' ')
            && key
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if is_key {
            return Line::Field {
                key: key.to_string(),
                value: unescape(value.trim()),
                raw: line.to_string(),
            };
        }
    }
    Line::Text(line.to_string())
}

/// Values stay on one line: backslashes and line breaks are escaped.
fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

impl Fields {
    pub fn parse(description: &str) -> Self {
        Self {
            lines: description.lines().map(parse_line).collect(),
        }
    }

    /// Value for `key`; `null` and empty values read as absent.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.lines.iter().find_map(|l| match l {
            Line::Field { key: k, value, .. } if k == key => {
                Some(value.as_str()).filter(|v| !v.is_empty() && *v != "null")
            }
            _ => None,
        })
    }

    /// Replace the first line for `key`, or append one.
    pub fn set(&mut self, key: &str, value: &str) {
        let raw = format!("{key}: {}", escape(value));
        for line in &mut self.lines {
            if let Line::Field { key: k, value: v, raw: r } = line
                && k == key
            {
                *r = raw;
                *v = value.to_string();
                return;
            }
        }
        self.lines.push(Line::Field {
            key: key.to_string(),
            value: value.to_string(),
            raw,
        });
    }

    pub fn set_opt(&mut self, key: &str, value: Option<&str>) {
        if let Some(v) = value {
            self.set(key, v);
        }
    }

    pub fn remove(&mut self, key: &str) -> bool {
        let before = self.lines.len();
        self.lines
            .retain(|l| !matches!(l, Line::Field { key: k, .. } if k == key));
        before != self.lines.len()
    }

    /// All recognized fields in order.
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.lines.iter().filter_map(|l| match l {
            Line::Field { key, value, .. } => Some((key.as_str(), value.as_str())),
            Line::Text(_) => None,
        })
    }
}

impl fmt::Display for Fields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, line) in self.lines.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            match line {
                Line::Field { raw, .. } | Line::Text(raw) => f.write_str(raw)?,
            }
        }
        Ok(())
    }
}

// --- Merge requests ---

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MrFields {
    pub branch: String,
    pub target: String,
    pub source_issue: Option<String>,
    pub worker: Option<String>,
    pub rig: Option<String>,
    pub merge_commit: Option<String>,
    pub close_reason: Option<String>,
    pub retry_count: u32,
}

/// `None` unless the description carries at least a `branch`.
pub fn parse_mr_fields(description: &str) -> Option<MrFields> {
    let fields = Fields::parse(description);
    let branch = fields.get("branch")?.to_string();
    Some(MrFields {
        branch,
        target: fields.get("target").unwrap_or("main").to_string(),
        source_issue: fields.get("source_issue").map(str::to_string),
        worker: fields.get("worker").map(str::to_string),
        rig: fields.get("rig").map(str::to_string),
        merge_commit: fields.get("merge_commit").map(str::to_string),
        close_reason: fields.get("close_reason").map(str::to_string),
        retry_count: fields
            .get("retry_count")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
    })
}

/// Fresh description for a new merge request.
pub fn format_mr_fields(mr: &MrFields) -> String {
    set_mr_fields("", mr)
}

pub fn set_mr_fields(description: &str, mr: &MrFields) -> String {
    let mut fields = Fields::parse(description);
    fields.set("branch", &mr.branch);
    fields.set("target", &mr.target);
    fields.set_opt("source_issue", mr.source_issue.as_deref());
    fields.set_opt("worker", mr.worker.as_deref());
    fields.set_opt("rig", mr.rig.as_deref());
    fields.set_opt("merge_commit", mr.merge_commit.as_deref());
    fields.set_opt("close_reason", mr.close_reason.as_deref());
    fields.set("retry_count", &mr.retry_count.to_string());
    fields.to_string()
}

// --- Attachments (work dispatched onto a bead) ---

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AttachmentFields {
    pub attached_molecule: Option<String>,
    pub attached_at: Option<String>,
    pub attached_args: Option<String>,
    pub dispatched_by: Option<String>,
}

impl AttachmentFields {
    pub fn is_empty(&self) -> bool {
        self.attached_molecule.is_none()
            && self.attached_at.is_none()
            && self.attached_args.is_none()
            && self.dispatched_by.is_none()
    }
}

pub fn parse_attachment_fields(description: &str) -> AttachmentFields {
    let fields = Fields::parse(description);
    AttachmentFields {
        attached_molecule: fields.get("attached_molecule").map(str::to_string),
        attached_at: fields.get("attached_at").map(str::to_string),
        attached_args: fields.get("attached_args").map(str::to_string),
        dispatched_by: fields.get("dispatched_by").map(str::to_string),
    }
}

/// Write the fields that are set; absent ones keep their current value.
pub fn set_attachment_fields(description: &str, attachment: &AttachmentFields) -> String {
    let mut fields = Fields::parse(description);
    fields.set_opt("attached_molecule", attachment.attached_molecule.as_deref());
    fields.set_opt("attached_at", attachment.attached_at.as_deref());
    fields.set_opt("attached_args", attachment.attached_args.as_deref());
    fields.set_opt("dispatched_by", attachment.dispatched_by.as_deref());
    fields.to_string()
}

// --- Agent beads ---

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AgentFields {
    pub role_type: Option<String>,
    pub rig: Option<String>,
    pub agent_state: Option<String>,
    pub hook_bead: Option<String>,
    pub role_bead: Option<String>,
    pub cleanup_status: Option<String>,
    pub active_mr: Option<String>,
    pub notification_level: Option<String>,
}

pub const AGENT_KEYS: &[&str] = &[
    "role_type",
    "rig",
    "agent_state",
    "hook_bead",
    "role_bead",
    "cleanup_status",
    "active_mr",
    "notification_level",
];

pub fn parse_agent_fields(description: &str) -> AgentFields {
    let fields = Fields::parse(description);
    let get = |k: &str| fields.get(k).map(str::to_string);
    AgentFields {
        role_type: get("role_type"),
        rig: get("rig"),
        agent_state: get("agent_state"),
        hook_bead: get("hook_bead"),
        role_bead: get("role_bead"),
        cleanup_status: get("cleanup_status"),
        active_mr: get("active_mr"),
        notification_level: get("notification_level"),
    }
}

pub fn set_agent_fields(description: &str, agent: &AgentFields) -> String {
    let mut fields = Fields::parse(description);
    fields.set_opt("role_type", agent.role_type.as_deref());
    fields.set_opt("rig", agent.rig.as_deref());
    fields.set_opt("agent_state", agent.agent_state.as_deref());
    fields.set_opt("hook_bead", agent.hook_bead.as_deref());
    fields.set_opt("role_bead", agent.role_bead.as_deref());
    fields.set_opt("cleanup_status", agent.cleanup_status.as_deref());
    fields.set_opt("active_mr", agent.active_mr.as_deref());
    fields.set_opt("notification_level", agent.notification_level.as_deref());
    fields.to_string()
}

/// Clear the hook pointer, keeping the line so readers see `null`.
pub fn clear_hook_bead(description: &str) -> String {
    let mut fields = Fields::parse(description);
    fields.set("hook_bead", "null");
    fields.to_string()
}

// --- Convoys ---

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConvoyFields {
    pub owner: Option<String>,
    pub rig: Option<String>,
    pub notify: Option<String>,
}

pub fn parse_convoy_fields(description: &str) -> ConvoyFields {
    let fields = Fields::parse(description);
    ConvoyFields {
        owner: fields.get("owner").map(str::to_string),
        rig: fields.get("rig").map(str::to_string),
        notify: fields.get("notify").map(str::to_string),
    }
}

pub fn set_convoy_fields(description: &str, convoy: &ConvoyFields) -> String {
    let mut fields = Fields::parse(description);
    fields.set_opt("owner", convoy.owner.as_deref());
    fields.set_opt("rig", convoy.rig.as_deref());
    fields.set_opt("notify", convoy.notify.as_deref());
    fields.to_string()
}
