//! Shell-safe primitives.
//!
//! Single-quote escaping for commands sent over SSH or typed into a pane, and
//! validation of the identifiers that end up in paths, branch names and
//! session names.

use std::sync::LazyLock;

use regex::Regex;

static BEAD_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z][a-z0-9]*(-[a-z0-9]+)*-[A-Za-z0-9][A-Za-z0-9._]*$")
        .unwrap_or_else(|e| panic!("bead id pattern: {e}"))
});

/// Escape a string for safe inclusion in a single-quoted shell argument.
///
/// The POSIX approach: wrap in single quotes, and for any embedded single
/// quote, end the current quoting, insert an escaped single quote, and
/// restart quoting: `'` → `'\''`.
///
/// Returns the string with surrounding single quotes.
pub fn shell_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for ch in s.chars() {
        if ch == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

/// Escape only when needed: plain identifiers and paths pass through.
pub fn quote_if_needed(value: &str) -> std::borrow::Cow<'_, str> {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '=' | '@'))
    {
        std::borrow::Cow::Borrowed(value)
    } else {
        std::borrow::Cow::Owned(shell_escape(value))
    }
}

/// Join a program and its arguments into one shell command line.
pub fn join_command(program: &str, args: &[String]) -> String {
    let mut line = quote_if_needed(program).into_owned();
    for arg in args {
        line.push(' ');
        line.push_str(&quote_if_needed(arg));
    }
    line
}

/// Validate a bead ID (e.g. `gp-abc`, `hq-cv-x1y2z`, `gp-3cqv.1`).
pub fn validate_bead_id(id: &str) -> Result<(), ValidationError> {
    if id.is_empty() {
        return Err(ValidationError::Empty("bead ID"));
    }
    if id.len() > 128 {
        return Err(ValidationError::TooLong {
            field: "bead ID",
            max: 128,
            actual: id.len(),
        });
    }
    if !BEAD_ID.is_match(id) {
        return Err(ValidationError::InvalidFormat {
            field: "bead ID",
            value: id.to_string(),
            expected: "<prefix>-<suffix>",
        });
    }
    Ok(())
}

/// Does this look like a bead ID rather than a formula or rig name?
pub fn looks_like_bead_id(value: &str) -> bool {
    BEAD_ID.is_match(value)
}

/// Validate a worker or rig name used in paths and session names.
pub fn validate_name(field: &'static str, name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::Empty(field));
    }
    if name.len() > 64 {
        return Err(ValidationError::TooLong {
            field,
            max: 64,
            actual: name.len(),
        });
    }
    let valid = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        return Err(ValidationError::InvalidFormat {
            field,
            value: name.to_string(),
            expected: "[A-Za-z0-9][A-Za-z0-9_-]*, max 64 chars",
        });
    }
    Ok(())
}

/// Validation error for identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    Empty(&'static str),
    TooLong {
        field: &'static str,
        max: usize,
        actual: usize,
    },
    InvalidFormat {
        field: &'static str,
        value: String,
        expected: &'static str,
    },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Empty(field) => write!(f, "{field} cannot be empty"),
            ValidationError::TooLong { field, max, actual } => {
                write!(f, "{field} too long ({actual} chars, max {max})")
            }
            ValidationError::InvalidFormat {
                field,
                value,
                expected,
            } => {
                write!(f, "invalid {field} '{value}', expected {expected}")
            }
        }
    }
}

impl std::error::Error for ValidationError {}
