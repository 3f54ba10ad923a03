//! Agent addresses.
//!
//! `mayor`, `deacon`, `<rig>/witness`, `<rig>/refinery`, `<rig>/crew/<name>`
//! and `<rig>/polecats/<name>`. Each address derives its agent bead ID, its
//! multiplexer session name and its working directory.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::shell::{ValidationError, validate_name};

pub const TOWN_PREFIX: &str = "hq";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AgentAddress {
    Mayor,
    Deacon,
    Witness { rig: String },
    Refinery { rig: String },
    Crew { rig: String, name: String },
    Polecat { rig: String, name: String },
}

/// Role names as they appear in agent beads and runtime config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Mayor,
    Deacon,
    Witness,
    Refinery,
    Crew,
    Polecat,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Mayor => "mayor",
            Role::Deacon => "deacon",
            Role::Witness => "witness",
            Role::Refinery => "refinery",
            Role::Crew => "crew",
            Role::Polecat => "polecat",
        }
    }
}

impl AgentAddress {
    pub fn polecat(rig: &str, name: &str) -> Self {
        AgentAddress::Polecat {
            rig: rig.to_string(),
            name: name.to_string(),
        }
    }

    pub fn role(&self) -> Role {
        match self {
            AgentAddress::Mayor => Role::Mayor,
            AgentAddress::Deacon => Role::Deacon,
            AgentAddress::Witness { .. } => Role::Witness,
            AgentAddress::Refinery { .. } => Role::Refinery,
            AgentAddress::Crew { .. } => Role::Crew,
            AgentAddress::Polecat { .. } => Role::Polecat,
        }
    }

    pub fn rig(&self) -> Option<&str> {
        match self {
            AgentAddress::Mayor | AgentAddress::Deacon => None,
            AgentAddress::Witness { rig }
            | AgentAddress::Refinery { rig }
            | AgentAddress::Crew { rig, .. }
            | AgentAddress::Polecat { rig, .. } => Some(rig),
        }
    }

    pub fn worker_name(&self) -> Option<&str> {
        match self {
            AgentAddress::Crew { name, .. } | AgentAddress::Polecat { name, .. } => Some(name),
            _ => None,
        }
    }

    pub fn is_polecat(&self) -> bool {
        matches!(self, AgentAddress::Polecat { .. })
    }

    /// Agent bead ID: `<prefix>-<rig>-<role>[-<name>]`, or `hq-<role>` for town roles.
    ///
    /// `rig_prefix` is ignored for town roles.
    pub fn agent_bead_id(&self, rig_prefix: &str) -> String {
        match self {
            AgentAddress::Mayor => format!("{TOWN_PREFIX}-mayor"),
            AgentAddress::Deacon => format!("{TOWN_PREFIX}-deacon"),
            AgentAddress::Witness { rig } => format!("{rig_prefix}-{rig}-witness"),
            AgentAddress::Refinery { rig } => format!("{rig_prefix}-{rig}-refinery"),
            AgentAddress::Crew { rig, name } => format!("{rig_prefix}-{rig}-crew-{name}"),
            AgentAddress::Polecat { rig, name } => format!("{rig_prefix}-{rig}-polecat-{name}"),
        }
    }

    /// Multiplexer session name.
    pub fn session_name(&self) -> String {
        match self {
            AgentAddress::Mayor => "hq-mayor".to_string(),
            AgentAddress::Deacon => "hq-deacon".to_string(),
            AgentAddress::Witness { rig } => format!("gt-{rig}-witness"),
            AgentAddress::Refinery { rig } => format!("gt-{rig}-refinery"),
            AgentAddress::Crew { rig, name } => format!("gt-{rig}-crew-{name}"),
            AgentAddress::Polecat { rig, name } => format!("gt-{rig}-{name}"),
        }
    }

    /// Working directory relative to the town root.
    pub fn work_dir(&self) -> PathBuf {
        match self {
            AgentAddress::Mayor => PathBuf::from("mayor"),
            AgentAddress::Deacon => PathBuf::from("deacon"),
            AgentAddress::Witness { rig } => Path::new(rig).join("witness/rig"),
            AgentAddress::Refinery { rig } => Path::new(rig).join("refinery/rig"),
            AgentAddress::Crew { rig, name } => Path::new(rig).join("crew").join(name),
            AgentAddress::Polecat { rig, name } => {
                Path::new(rig).join("polecats").join(name).join(rig)
            }
        }
    }

    /// Infer an address from a directory's position under the town root.
    pub fn from_dir(town_root: &Path, dir: &Path) -> Option<Self> {
        let rel = dir.strip_prefix(town_root).ok()?;
        let parts: Vec<&str> = rel
            .components()
            .filter_map(|c| c.as_os_str().to_str())
            .collect();
        match parts.as_slice() {
            ["mayor", ..] => Some(AgentAddress::Mayor),
            ["deacon", ..] => Some(AgentAddress::Deacon),
            [rig, "witness", ..] => Some(AgentAddress::Witness { rig: rig.to_string() }),
            [rig, "refinery", ..] => Some(AgentAddress::Refinery { rig: rig.to_string() }),
            [rig, "crew", name, ..] => Some(AgentAddress::Crew {
                rig: rig.to_string(),
                name: name.to_string(),
            }),
            [rig, "polecats", name, ..] => Some(AgentAddress::polecat(rig, name)),
            _ => None,
        }
    }
}

impl fmt::Display for AgentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentAddress::Mayor => write!(f, "mayor"),
            AgentAddress::Deacon => write!(f, "deacon"),
            AgentAddress::Witness { rig } => write!(f, "{rig}/witness"),
            AgentAddress::Refinery { rig } => write!(f, "{rig}/refinery"),
            AgentAddress::Crew { rig, name } => write!(f, "{rig}/crew/{name}"),
            AgentAddress::Polecat { rig, name } => write!(f, "{rig}/polecats/{name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("not an agent address: '{0}'")]
    Unrecognized(String),
    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

impl FromStr for AgentAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_end_matches('/');
        let parts: Vec<&str> = trimmed.split('/').collect();
        let addr = match parts.as_slice() {
            ["mayor"] => AgentAddress::Mayor,
            ["deacon"] => AgentAddress::Deacon,
            [rig, "witness"] => {
                validate_name("rig name", rig)?;
                AgentAddress::Witness { rig: rig.to_string() }
            }
            [rig, "refinery"] => {
                validate_name("rig name", rig)?;
                AgentAddress::Refinery { rig: rig.to_string() }
            }
            [rig, "crew", name] => {
                validate_name("rig name", rig)?;
                validate_name("crew name", name)?;
                AgentAddress::Crew {
                    rig: rig.to_string(),
                    name: name.to_string(),
                }
            }
            [rig, "polecats", name] => {
                validate_name("rig name", rig)?;
                validate_name("polecat name", name)?;
                AgentAddress::polecat(rig, name)
            }
            _ => return Err(AddressError::Unrecognized(s.to_string())),
        };
        Ok(addr)
    }
}
