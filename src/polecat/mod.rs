//! Polecats: named ephemeral workers, each a git worktree plus an agent bead.

pub mod names;
pub mod worktree;

use std::path::PathBuf;

pub use worktree::WorktreeBackend;

use crate::address::AgentAddress;
use crate::beads::BeadsError;
use crate::git::UncommittedWork;
use crate::shell::ValidationError;

#[derive(Debug, thiserror::Error)]
pub enum PolecatError {
    #[error("polecat {rig}/{name} already exists")]
    Exists { rig: String, name: String },

    #[error("polecat {rig}/{name} not found")]
    NotFound { rig: String, name: String },

    #[error("polecat {name} has {work}; use --force to remove anyway")]
    UncommittedWork { name: String, work: UncommittedWork },

    #[error("unknown rig '{0}'")]
    UnknownRig(String),

    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("git: {0:#}")]
    Git(anyhow::Error),

    #[error(transparent)]
    Beads(#[from] BeadsError),

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Polecat {
    pub rig: String,
    pub name: String,
    /// The worktree; a path on the remote host for SSH rigs.
    pub clone_path: PathBuf,
    /// `<rig>/polecats/<name>` on this machine, holding the beads redirect.
    pub local_dir: PathBuf,
    /// `user@host` when the worktree is remote.
    pub remote: Option<String>,
    pub branch: String,
    pub session_name: String,
}

impl Polecat {
    pub fn address(&self) -> AgentAddress {
        AgentAddress::polecat(&self.rig, &self.name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct AddOptions {
    /// Recorded as the agent bead's `hook_bead` in the same write that
    /// creates or reopens it.
    pub hook_bead: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveOptions {
    /// Remove despite uncommitted work.
    pub force: bool,
    /// Skip every safety check.
    pub nuclear: bool,
}

impl RemoveOptions {
    pub fn nuclear() -> Self {
        Self {
            force: true,
            nuclear: true,
        }
    }
}

pub trait PolecatBackend: Send + Sync {
    /// A name no live polecat in `rig` uses, reserved for this process.
    fn allocate_name(&self, rig: &str) -> Result<String, PolecatError>;
    /// `count` distinct names in one pass, reserved together.
    fn allocate_names(&self, rig: &str, count: usize) -> Result<Vec<String>, PolecatError>;
    /// Drop an in-process reservation after a failed spawn.
    fn release_name(&self, rig: &str, name: &str);
    fn exists(&self, rig: &str, name: &str) -> bool;
    fn add(&self, rig: &str, name: &str, opts: &AddOptions) -> Result<Polecat, PolecatError>;
    fn remove(&self, rig: &str, name: &str, opts: &RemoveOptions) -> Result<(), PolecatError>;
    fn list(&self, rig: &str) -> Result<Vec<Polecat>, PolecatError>;

    fn session_name(&self, rig: &str, name: &str) -> String {
        AgentAddress::polecat(rig, name).session_name()
    }
}

/// Add a polecat, repairing crash leftovers.
///
/// A worktree with no live session is nuclear-removed and recreated. If the
/// add loses a race and reports `Exists`, one nuclear remove + add is tried;
/// a second failure is returned.
pub fn add_with_repair(
    backend: &dyn PolecatBackend,
    rig: &str,
    name: &str,
    opts: &AddOptions,
    session_alive: &dyn Fn(&str) -> bool,
) -> Result<Polecat, PolecatError> {
    let session = backend.session_name(rig, name);
    if backend.exists(rig, name) {
        if session_alive(&session) {
            return Err(PolecatError::Exists {
                rig: rig.to_string(),
                name: name.to_string(),
            });
        }
        tracing::warn!(rig, polecat = name, "repairing stale polecat with no session");
        backend.remove(rig, name, &RemoveOptions::nuclear())?;
    }
    match backend.add(rig, name, opts) {
        Err(PolecatError::Exists { .. }) => {
            tracing::warn!(rig, polecat = name, "polecat appeared concurrently, retrying once");
            backend.remove(rig, name, &RemoveOptions::nuclear())?;
            backend.add(rig, name, opts)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBackend;

    #[test]
    fn stale_worktree_without_session_is_recreated() {
        let backend = FakeBackend::new(&["nux"]);
        backend.seed("gastown", "nux");
        let p = add_with_repair(&backend, "gastown", "nux", &AddOptions::default(), &|_| false)
            .unwrap();
        assert_eq!(p.name, "nux");
        assert_eq!(backend.removed(), vec![("gastown".to_string(), "nux".to_string(), true)]);
    }

    #[test]
    fn live_polecat_is_not_clobbered() {
        let backend = FakeBackend::new(&["nux"]);
        backend.seed("gastown", "nux");
        let err = add_with_repair(&backend, "gastown", "nux", &AddOptions::default(), &|_| true)
            .unwrap_err();
        assert!(matches!(err, PolecatError::Exists { .. }));
        assert!(backend.removed().is_empty());
    }

    #[test]
    fn race_is_retried_once() {
        let backend = FakeBackend::new(&["nux"]);
        backend.fail_adds_with_exists(1);
        let p = add_with_repair(&backend, "gastown", "nux", &AddOptions::default(), &|_| false)
            .unwrap();
        assert_eq!(p.name, "nux");
        assert_eq!(backend.removed().len(), 1);
    }

    #[test]
    fn second_race_surfaces() {
        let backend = FakeBackend::new(&["nux"]);
        backend.fail_adds_with_exists(2);
        let err = add_with_repair(&backend, "gastown", "nux", &AddOptions::default(), &|_| false)
            .unwrap_err();
        assert!(matches!(err, PolecatError::Exists { .. }));
    }

    #[test]
    fn session_name_matches_address() {
        let backend = FakeBackend::new(&[]);
        assert_eq!(backend.session_name("gastown", "nux"), "gt-gastown-nux");
    }
}
