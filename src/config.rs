use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::ExitError;

/// Config file name constants.
pub const CONFIG_TOML: &str = "town.toml";
pub const CONFIG_JSON: &str = "town.json";

/// Find the config file in `dir`, preferring town.toml over town.json.
/// Returns None if neither exists.
pub fn find_config(dir: &Path) -> Option<PathBuf> {
    let toml_path = dir.join(CONFIG_TOML);
    if toml_path.exists() {
        return Some(toml_path);
    }
    let json_path = dir.join(CONFIG_JSON);
    if json_path.exists() {
        return Some(json_path);
    }
    None
}

/// Top-level town.toml config.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TownConfig {
    pub name: String,
    #[serde(default)]
    pub sling: SlingConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub accounts: BTreeMap<String, PathBuf>,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub names: NamesConfig,
    #[serde(default)]
    pub rigs: BTreeMap<String, RigConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SlingConfig {
    /// Concurrent spawns in batch and queue dispatch.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// Global cap on running polecats; 0 means unlimited.
    #[serde(default, alias = "maxPolecats")]
    pub max_polecats: usize,
    /// Queue dispatch attempts before an item is dropped.
    #[serde(default = "default_max_retries", alias = "maxRetries")]
    pub max_retries: u32,
    #[serde(default = "default_formula", alias = "defaultFormula")]
    pub default_formula: String,
    /// Apply `default_formula` to batch slings that name no formula.
    #[serde(default, alias = "applyDefaultFormula")]
    pub apply_default_formula: bool,
}

impl Default for SlingConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            max_polecats: 0,
            max_retries: default_max_retries(),
            default_formula: default_formula(),
            apply_default_formula: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AgentsConfig {
    /// Runtime alias used when a role has no entry in `roles`.
    #[serde(default = "default_runtime_alias")]
    pub default: String,
    /// Role name (polecat, crew, witness, refinery, mayor, deacon) to runtime alias.
    #[serde(default)]
    pub roles: BTreeMap<String, String>,
    #[serde(default = "default_runtimes")]
    pub runtimes: BTreeMap<String, RuntimeConfig>,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            default: default_runtime_alias(),
            roles: BTreeMap::new(),
            runtimes: default_runtimes(),
        }
    }
}

/// How to launch one agent runtime inside a session.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Settle time after the pane leaves the login shell.
    #[serde(default = "default_ready_delay", alias = "readyDelayMs")]
    pub ready_delay_ms: u64,
    /// Accept the first-run permission prompt during the ready handshake.
    #[serde(default, alias = "acceptPermissions")]
    pub accept_permissions: bool,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl RuntimeConfig {
    /// Full command line typed into the new session's pane.
    pub fn command_line(&self) -> String {
        crate::shell::join_command(&self.command, &self.args)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SessionConfig {
    #[serde(default = "default_ready_timeout", alias = "readyTimeoutMs")]
    pub ready_timeout_ms: u64,
    #[serde(default = "default_poll_interval", alias = "pollIntervalMs")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_nudge_debounce", alias = "nudgeDebounceMs")]
    pub nudge_debounce_ms: u64,
    /// Pane commands that mean "no agent is running here".
    #[serde(default = "default_shells")]
    pub shells: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ready_timeout_ms: default_ready_timeout(),
            poll_interval_ms: default_poll_interval(),
            nudge_debounce_ms: default_nudge_debounce(),
            shells: default_shells(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct NamesConfig {
    #[serde(default = "default_name_pool")]
    pub pool: Vec<String>,
}

impl Default for NamesConfig {
    fn default() -> Self {
        Self {
            pool: default_name_pool(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RigConfig {
    /// Bead ID prefix without the trailing dash, e.g. `gp`.
    pub prefix: String,
    /// Source repository, relative to the rig directory.
    #[serde(default = "default_repo")]
    pub repo: PathBuf,
    #[serde(default = "default_branch", alias = "defaultBranch")]
    pub default_branch: String,
    /// `user@host` for rigs whose polecats run remotely.
    #[serde(default)]
    pub ssh: Option<String>,
    /// Town root on the remote host.
    #[serde(default, alias = "remoteRoot")]
    pub remote_root: Option<PathBuf>,
}

// Default value functions for serde
fn default_parallelism() -> usize { 5 }
fn default_max_retries() -> u32 { 3 }
fn default_formula() -> String { "mol-polecat-work".into() }
fn default_runtime_alias() -> String { "claude".into() }
fn default_ready_delay() -> u64 { 1000 }
fn default_ready_timeout() -> u64 { 30_000 }
fn default_poll_interval() -> u64 { 250 }
fn default_nudge_debounce() -> u64 { 500 }
fn default_repo() -> PathBuf { PathBuf::from("mayor/rig") }
fn default_branch() -> String { "main".into() }

fn default_shells() -> Vec<String> {
    ["bash", "zsh", "sh", "fish", "dash", "-bash", "-zsh", "-sh", "login"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_runtimes() -> BTreeMap<String, RuntimeConfig> {
    let mut runtimes = BTreeMap::new();
    runtimes.insert(
        "claude".to_string(),
        RuntimeConfig {
            command: "claude".into(),
            args: vec!["--dangerously-skip-permissions".into()],
            ready_delay_ms: 8000,
            accept_permissions: true,
            env: BTreeMap::new(),
        },
    );
    runtimes.insert(
        "codex".to_string(),
        RuntimeConfig {
            command: "codex".into(),
            args: Vec::new(),
            ready_delay_ms: 1000,
            accept_permissions: false,
            env: BTreeMap::new(),
        },
    );
    runtimes
}

fn default_name_pool() -> Vec<String> {
    [
        "furiosa", "nux", "slit", "rictus", "capable", "toast", "dag", "cheedo", "valkyrie",
        "keeper", "ace", "morsov", "scrotus", "dementus", "praetorian", "coma", "corpus",
        "vuvalini", "organic", "joe", "max", "glory", "angharad", "miss-giddy",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl TownConfig {
    /// Minimal config for a named town with no rigs.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            sling: SlingConfig::default(),
            agents: AgentsConfig::default(),
            accounts: BTreeMap::new(),
            session: SessionConfig::default(),
            names: NamesConfig::default(),
            rigs: BTreeMap::new(),
        }
    }

    /// Load config from a file (TOML or JSON, auto-detected by extension).
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        match ext {
            "toml" => Self::parse_toml(&contents),
            "json" => Self::parse_json(&contents),
            _ => Self::parse_toml(&contents).or_else(|_| Self::parse_json(&contents)),
        }
    }

    /// Parse config from a TOML string.
    pub fn parse_toml(toml_str: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(toml_str)
            .map_err(|e| ExitError::Config(format!("invalid town.toml: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse config from a JSON string.
    pub fn parse_json(json: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ExitError::Config(format!("invalid town.json: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to TOML.
    pub fn to_toml(&self) -> anyhow::Result<String> {
        toml::to_string_pretty(self).context("serializing config to TOML")
    }

    fn validate(&self) -> anyhow::Result<()> {
        for (name, rig) in &self.rigs {
            crate::shell::validate_name("rig name", name)
                .map_err(|e| ExitError::Config(e.to_string()))?;
            if rig.prefix.is_empty() || rig.prefix.ends_with('-') || rig.prefix == "hq" {
                return Err(ExitError::Config(format!(
                    "rig {name}: prefix must be non-empty, without a trailing dash, and not 'hq'"
                ))
                .into());
            }
            if rig.ssh.is_some() && rig.remote_root.is_none() {
                return Err(ExitError::Config(format!(
                    "rig {name}: ssh rigs need remote_root"
                ))
                .into());
            }
        }
        if self.sling.parallelism == 0 {
            return Err(ExitError::Config("sling.parallelism must be at least 1".into()).into());
        }
        Ok(())
    }

    pub fn rig(&self, name: &str) -> Option<&RigConfig> {
        self.rigs.get(name)
    }

    /// The rig whose prefix is `prefix` (without trailing dash).
    pub fn rig_for_prefix(&self, prefix: &str) -> Option<(&str, &RigConfig)> {
        self.rigs
            .iter()
            .find(|(_, rig)| rig.prefix == prefix)
            .map(|(name, rig)| (name.as_str(), rig))
    }

    /// Resolve the runtime for a role, honoring a per-call alias override.
    pub fn runtime_for(&self, role: &str, alias_override: Option<&str>) -> anyhow::Result<(String, RuntimeConfig)> {
        let alias = alias_override
            .map(str::to_string)
            .or_else(|| self.agents.roles.get(role).cloned())
            .unwrap_or_else(|| self.agents.default.clone());
        match self.agents.runtimes.get(&alias) {
            Some(runtime) => Ok((alias, runtime.clone())),
            None => Err(ExitError::Config(format!("unknown agent runtime '{alias}'")).into()),
        }
    }

    /// Config directory for a named account (exported as CLAUDE_CONFIG_DIR).
    pub fn account_dir(&self, alias: &str) -> anyhow::Result<&Path> {
        self.accounts
            .get(alias)
            .map(PathBuf::as_path)
            .ok_or_else(|| ExitError::Config(format!("unknown account '{alias}'")).into())
    }
}
