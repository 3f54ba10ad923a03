pub mod agents;
pub mod hook;
pub mod mq;
pub mod patrol;
pub mod polecats;
pub mod schema;
pub mod sling;
pub mod town;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Args;

use crate::address::AgentAddress;
use crate::beads::{BeadStore, RoutedBeads};
use crate::polecat::{PolecatBackend, WorktreeBackend};
use crate::session::{SessionFactory, Tmux};
use crate::town::Town;

/// `--town`, shared by every command that works inside a town.
#[derive(Debug, Clone, Args)]
pub struct TownArgs {
    /// Town root directory (default: search upward from the current directory)
    #[arg(long = "town", env = "GT_TOWN_ROOT", value_name = "DIR")]
    pub root: Option<PathBuf>,
}

/// The live collaborators commands run against.
pub struct Context {
    pub town: Town,
    pub beads: Arc<dyn BeadStore>,
    pub polecats: Arc<dyn PolecatBackend>,
    pub sessions: SessionFactory,
    /// The agent this process runs as, if any.
    pub me: Option<AgentAddress>,
}

impl TownArgs {
    pub fn load(&self) -> anyhow::Result<Town> {
        let cwd = std::env::current_dir().context("reading current directory")?;
        Town::discover(self.root.as_deref(), &cwd)
    }

    pub fn context(&self) -> anyhow::Result<Context> {
        let cwd = std::env::current_dir().context("reading current directory")?;
        let town = Town::discover(self.root.as_deref(), &cwd)?;
        let beads: Arc<dyn BeadStore> = Arc::new(RoutedBeads::new(&town));
        let polecats = Arc::new(WorktreeBackend::new(&town, beads.clone()));
        let sessions = SessionFactory::new(&town, Arc::new(Tmux::new()));
        let me = town.detect_self(&cwd);
        tracing::debug!(town = %town.root.display(), me = ?me, "town loaded");
        Ok(Context {
            town,
            beads,
            polecats,
            sessions,
            me,
        })
    }
}

/// Parse `key=value` for repeated flags such as `--var` and `--set`.
pub fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{s}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{s}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Print `value` as pretty JSON on stdout.
pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
