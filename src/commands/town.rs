use clap::{Args, Subcommand};

use super::TownArgs;
use crate::error::ExitError;
use crate::session::cycle;

#[derive(Debug, Subcommand)]
pub enum TownCommand {
    /// Switch to the next session in this town
    Next(CycleArgs),
    /// Switch to the previous session in this town
    Prev(CycleArgs),
}

#[derive(Debug, Args)]
pub struct CycleArgs {
    #[command(flatten)]
    pub town: TownArgs,
}

impl TownCommand {
    pub fn execute(&self) -> anyhow::Result<()> {
        match self {
            TownCommand::Next(args) => args.switch(true),
            TownCommand::Prev(args) => args.switch(false),
        }
    }
}

impl CycleArgs {
    fn switch(&self, forward: bool) -> anyhow::Result<()> {
        let ctx = self.town.context()?;
        let sessions = ctx.sessions.town_sessions()?;
        let current = ctx
            .sessions
            .driver()
            .current_session()
            .or_else(|| ctx.me.as_ref().map(|m| m.session_name()))
            .unwrap_or_default();
        let Some(target) = cycle(&sessions, &current, forward) else {
            return Err(ExitError::Other(format!("no sessions running in town {}", ctx.town.name())).into());
        };
        if target == current {
            tracing::debug!(session = %current, "only session in town");
            return Ok(());
        }
        tracing::info!(from = %current, to = %target, "switching session");
        ctx.sessions.attach(&target)?;
        Ok(())
    }
}
