//! Sling targets: who the work goes to.

use std::fmt;

use super::SlingError;
use crate::address::AgentAddress;
use crate::shell::looks_like_bead_id;
use crate::town::Town;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// The agent running `gt sling`.
    Myself(AgentAddress),
    /// A named agent.
    Agent(AgentAddress),
    /// A rig: spawn fresh polecats there.
    Rig(String),
}

impl Target {
    /// The rig whose database new wisps belong in, if any.
    pub fn rig(&self) -> Option<&str> {
        match self {
            Target::Myself(addr) | Target::Agent(addr) => addr.rig(),
            Target::Rig(rig) => Some(rig),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Myself(addr) => write!(f, "self ({addr})"),
            Target::Agent(addr) => write!(f, "{addr}"),
            Target::Rig(rig) => write!(f, "rig {rig}"),
        }
    }
}

/// Could `token` be a target rather than a bead ID?
pub fn is_target_token(token: &str, town: &Town) -> bool {
    matches!(token, "." | "self" | "mayor" | "deacon")
        || town.has_rig(token)
        || token.contains('/')
        || !looks_like_bead_id(token)
}

/// Split positional arguments into work items and an optional trailing target.
pub fn split_target(args: &[String], town: &Town) -> (Vec<String>, Option<String>) {
    match args.split_last() {
        Some((last, rest)) if !rest.is_empty() && is_target_token(last, town) => {
            (rest.to_vec(), Some(last.clone()))
        }
        _ => (args.to_vec(), None),
    }
}

pub fn resolve(
    token: Option<&str>,
    town: &Town,
    me: Option<&AgentAddress>,
) -> Result<Target, SlingError> {
    let myself = || {
        me.cloned().map(Target::Myself).ok_or_else(|| {
            SlingError::InvalidInput(
                "no target given and this is not an agent session; name a rig or an agent".into(),
            )
        })
    };
    let token = match token {
        None | Some(".") | Some("self") => return myself(),
        Some(t) => t,
    };
    if town.has_rig(token) {
        return Ok(Target::Rig(token.to_string()));
    }
    let addr: AgentAddress = token
        .parse()
        .map_err(|_| SlingError::UnknownTarget(token.to_string()))?;
    if let Some(rig) = addr.rig()
        && !town.has_rig(rig)
    {
        return Err(SlingError::UnknownRig(rig.to_string()));
    }
    if me == Some(&addr) {
        return Ok(Target::Myself(addr));
    }
    Ok(Target::Agent(addr))
}
