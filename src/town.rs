//! The town root: its config and the well-known paths under it.

use std::path::{Path, PathBuf};

use crate::address::AgentAddress;
use crate::config::{RigConfig, TownConfig, find_config};
use crate::error::ExitError;

/// Environment variable naming the agent a session was started for.
pub const AGENT_ENV: &str = "GT_AGENT";

#[derive(Debug, Clone)]
pub struct Town {
    pub root: PathBuf,
    pub config: TownConfig,
}

/// Search up the directory tree for a town config.
pub fn find_root(from: &Path) -> Option<PathBuf> {
    from.ancestors()
        .find(|p| find_config(p).is_some())
        .map(Path::to_path_buf)
}

impl Town {
    pub fn new(root: &Path, config: TownConfig) -> Self {
        Self {
            root: root.to_path_buf(),
            config,
        }
    }

    /// Load the town at `root`.
    pub fn load(root: &Path) -> anyhow::Result<Self> {
        let path = find_config(root).ok_or_else(|| {
            ExitError::Config(format!("no town.toml or town.json in {}", root.display()))
        })?;
        let config = TownConfig::load(&path)?;
        Ok(Self::new(root, config))
    }

    /// Find the town from an explicit root, else by walking up from `cwd`,
    /// else `~/gt`.
    pub fn discover(explicit: Option<&Path>, cwd: &Path) -> anyhow::Result<Self> {
        if let Some(root) = explicit {
            return Self::load(root);
        }
        if let Some(root) = find_root(cwd) {
            return Self::load(&root);
        }
        if let Some(home_town) = dirs::home_dir().map(|h| h.join("gt"))
            && find_config(&home_town).is_some()
        {
            return Self::load(&home_town);
        }
        Err(ExitError::Config(format!(
            "not inside a town: no town.toml above {} (use --town or GT_TOWN_ROOT)",
            cwd.display()
        ))
        .into())
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn rig(&self, name: &str) -> Option<&RigConfig> {
        self.config.rig(name)
    }

    pub fn has_rig(&self, name: &str) -> bool {
        self.config.rigs.contains_key(name)
    }

    /// Bead prefix for a rig, without the trailing dash.
    pub fn rig_prefix(&self, rig: &str) -> Option<&str> {
        self.rig(rig).map(|r| r.prefix.as_str())
    }

    /// Town database directory.
    pub fn beads_dir(&self) -> PathBuf {
        self.root.join(".beads")
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.root.join(".runtime")
    }

    pub fn lock_path(&self, name: &str) -> PathBuf {
        self.runtime_dir().join("locks").join(format!("{name}.lock"))
    }

    pub fn queue_path(&self) -> PathBuf {
        self.runtime_dir().join("sling-queue.jsonl")
    }

    pub fn feed_path(&self) -> PathBuf {
        self.runtime_dir().join("feed.jsonl")
    }

    pub fn rig_dir(&self, rig: &str) -> PathBuf {
        self.root.join(rig)
    }

    /// The rig's canonical source checkout.
    pub fn rig_repo_dir(&self, rig: &str) -> PathBuf {
        let repo = self
            .rig(rig)
            .map(|r| r.repo.clone())
            .unwrap_or_else(|| PathBuf::from("mayor/rig"));
        self.rig_dir(rig).join(repo)
    }

    pub fn polecats_dir(&self, rig: &str) -> PathBuf {
        self.rig_dir(rig).join("polecats")
    }

    /// Absolute working directory of an agent.
    pub fn agent_dir(&self, addr: &AgentAddress) -> PathBuf {
        self.root.join(addr.work_dir())
    }

    /// Agent bead ID for an address, using its rig's prefix.
    pub fn agent_bead_id(&self, addr: &AgentAddress) -> String {
        let prefix = addr.rig().and_then(|r| self.rig_prefix(r)).unwrap_or("hq");
        addr.agent_bead_id(prefix)
    }

    /// Which agent is running this process: `GT_AGENT`, else the cwd's
    /// position in the town.
    pub fn detect_self(&self, cwd: &Path) -> Option<AgentAddress> {
        if let Ok(value) = std::env::var(AGENT_ENV)
            && let Ok(addr) = value.parse()
        {
            return Some(addr);
        }
        let cwd = cwd.canonicalize().unwrap_or_else(|_| cwd.to_path_buf());
        let root = self
            .root
            .canonicalize()
            .unwrap_or_else(|_| self.root.clone());
        AgentAddress::from_dir(&root, &cwd)
    }
}
