use std::io::IsTerminal;

use anyhow::Context as _;
use clap::{Args, Subcommand};
use serde::Serialize;

use super::{TownArgs, print_json};
use crate::beads::BeadStore;
use crate::beads::fields::parse_agent_fields;
use crate::error::ExitError;
use crate::polecat::{AddOptions, Polecat, PolecatBackend, RemoveOptions, add_with_repair};
use crate::session::SessionFactory;
use crate::shell::validate_name;
use crate::town::Town;

#[derive(Debug, Subcommand)]
pub enum PolecatsCommand {
    /// Create a polecat worktree without starting a session
    Add(AddArgs),
    /// Remove a polecat and kill its session
    Remove(RemoveArgs),
    /// List polecats with their session and hook
    List(ListArgs),
}

impl PolecatsCommand {
    pub fn execute(&self) -> anyhow::Result<()> {
        match self {
            PolecatsCommand::Add(args) => args.execute(),
            PolecatsCommand::Remove(args) => args.execute(),
            PolecatsCommand::List(args) => args.execute(),
        }
    }
}

#[derive(Debug, Args)]
pub struct AddArgs {
    #[command(flatten)]
    pub town: TownArgs,
    pub rig: String,
    /// Polecat name (default: next free name from the pool)
    pub name: Option<String>,
}

#[derive(Debug, Args)]
pub struct RemoveArgs {
    #[command(flatten)]
    pub town: TownArgs,
    pub rig: String,
    pub name: String,
    /// Remove even with uncommitted or unpushed work
    #[arg(long)]
    pub force: bool,
    /// Skip every safety check
    #[arg(long)]
    pub nuclear: bool,
    /// Do not ask for confirmation
    #[arg(long, short = 'y')]
    pub yes: bool,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[command(flatten)]
    pub town: TownArgs,
    /// Only this rig
    pub rig: Option<String>,
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolecatRow {
    pub rig: String,
    pub name: String,
    pub session: String,
    pub alive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hook_bead: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_state: Option<String>,
}

fn known_rig(town: &Town, rig: &str) -> Result<(), ExitError> {
    if town.has_rig(rig) {
        Ok(())
    } else {
        Err(ExitError::InvalidInput(format!("unknown rig '{rig}'")))
    }
}

/// Create a polecat, allocating a name when none is given.
pub fn add_polecat(
    town: &Town,
    backend: &dyn PolecatBackend,
    sessions: &SessionFactory,
    rig: &str,
    name: Option<&str>,
) -> anyhow::Result<Polecat> {
    known_rig(town, rig)?;
    let (name, allocated) = match name {
        Some(n) => {
            validate_name("polecat name", n)?;
            (n.to_string(), false)
        }
        None => (backend.allocate_name(rig)?, true),
    };
    let result = add_with_repair(backend, rig, &name, &AddOptions::default(), &|s| {
        sessions.is_alive(s)
    });
    if allocated {
        backend.release_name(rig, &name);
    }
    Ok(result?)
}

/// Kill the polecat's session, then remove it.
pub fn remove_polecat(
    town: &Town,
    backend: &dyn PolecatBackend,
    sessions: &SessionFactory,
    rig: &str,
    name: &str,
    opts: &RemoveOptions,
) -> anyhow::Result<()> {
    known_rig(town, rig)?;
    let session = backend.session_name(rig, name);
    let driver = sessions.driver();
    if driver.has_session(&session).unwrap_or(false) {
        driver
            .kill_session(&session)
            .with_context(|| format!("killing session {session}"))?;
    }
    backend.remove(rig, name, opts)?;
    Ok(())
}

pub fn list_polecats(
    town: &Town,
    beads: &dyn BeadStore,
    backend: &dyn PolecatBackend,
    sessions: &SessionFactory,
    rig: Option<&str>,
) -> anyhow::Result<Vec<PolecatRow>> {
    let rigs: Vec<String> = match rig {
        Some(r) => {
            known_rig(town, r)?;
            vec![r.to_string()]
        }
        None => town.config.rigs.keys().cloned().collect(),
    };
    let mut rows = Vec::new();
    for rig in &rigs {
        for polecat in backend.list(rig)? {
            let agent = match beads.try_show(&town.agent_bead_id(&polecat.address())) {
                Ok(found) => found,
                Err(e) => {
                    tracing::warn!(polecat = %polecat.name, error = %e, "could not read agent bead");
                    None
                }
            };
            let fields = agent
                .map(|a| parse_agent_fields(&a.description))
                .unwrap_or_default();
            rows.push(PolecatRow {
                alive: sessions.is_alive(&polecat.session_name),
                rig: polecat.rig,
                name: polecat.name,
                session: polecat.session_name,
                hook_bead: fields.hook_bead,
                agent_state: fields.agent_state,
            });
        }
    }
    Ok(rows)
}

fn prompt_confirm(prompt: &str, default: bool) -> anyhow::Result<bool> {
    dialoguer::Confirm::new()
        .with_prompt(prompt)
        .default(default)
        .interact()
        .context("reading user confirmation")
}

impl AddArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let ctx = self.town.context()?;
        let polecat = add_polecat(
            &ctx.town,
            ctx.polecats.as_ref(),
            &ctx.sessions,
            &self.rig,
            self.name.as_deref(),
        )?;
        println!(
            "Added polecat {}/{} at {} (branch {})",
            polecat.rig,
            polecat.name,
            polecat.clone_path.display(),
            polecat.branch
        );
        Ok(())
    }
}

impl RemoveArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let ctx = self.town.context()?;
        if !ctx.polecats.exists(&self.rig, &self.name) {
            return Err(ExitError::InvalidInput(format!(
                "polecat {}/{} not found",
                self.rig, self.name
            ))
            .into());
        }
        if !self.yes && std::io::stdin().is_terminal() {
            let prompt = format!("Remove polecat {}/{} and kill its session?", self.rig, self.name);
            if !prompt_confirm(&prompt, false)? {
                println!("Aborted.");
                return Ok(());
            }
        }
        let opts = if self.nuclear {
            RemoveOptions::nuclear()
        } else {
            RemoveOptions {
                force: self.force,
                nuclear: false,
            }
        };
        remove_polecat(
            &ctx.town,
            ctx.polecats.as_ref(),
            &ctx.sessions,
            &self.rig,
            &self.name,
            &opts,
        )?;
        println!("Removed polecat {}/{}", self.rig, self.name);
        Ok(())
    }
}

impl ListArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let ctx = self.town.context()?;
        let rows = list_polecats(
            &ctx.town,
            ctx.beads.as_ref(),
            ctx.polecats.as_ref(),
            &ctx.sessions,
            self.rig.as_deref(),
        )?;
        if self.json {
            return print_json(&rows);
        }
        if rows.is_empty() {
            println!("No polecats.");
            return Ok(());
        }
        for row in &rows {
            println!(
                "{:<20} {:<8} {:<10} {}",
                format!("{}/{}", row.rig, row.name),
                if row.alive { "running" } else { "stopped" },
                row.agent_state.as_deref().unwrap_or("-"),
                row.hook_bead.as_deref().unwrap_or("-"),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beads::{Issue, IssueType};
    use crate::polecat::PolecatError;
    use crate::testing::Harness;

    #[test]
    fn add_allocates_a_name_and_releases_the_reservation() {
        let h = Harness::new();
        let polecat =
            add_polecat(&h.town, h.backend.as_ref(), &h.sessions(), "gastown", None).unwrap();
        assert_eq!(polecat.name, "nux");
        assert!(h.backend.exists("gastown", "nux"));
        assert!(h.backend.reserved("gastown").is_empty());
        assert_eq!(h.driver.starts(), 0);
    }

    #[test]
    fn add_rejects_unknown_rig_and_bad_names() {
        let h = Harness::new();
        assert!(add_polecat(&h.town, h.backend.as_ref(), &h.sessions(), "nowhere", None).is_err());
        assert!(
            add_polecat(&h.town, h.backend.as_ref(), &h.sessions(), "gastown", Some("../x"))
                .is_err()
        );
    }

    #[test]
    fn remove_kills_session_first() {
        let h = Harness::new();
        h.backend.seed("gastown", "nux");
        h.driver.add_session("gt-gastown-nux", "claude");
        remove_polecat(
            &h.town,
            h.backend.as_ref(),
            &h.sessions(),
            "gastown",
            "nux",
            &RemoveOptions::default(),
        )
        .unwrap();
        assert!(!h.driver.has("gt-gastown-nux"));
        assert!(!h.backend.exists("gastown", "nux"));
        assert!(
            h.events.position("session-kill").unwrap() < h.events.position("polecat-remove").unwrap()
        );
    }

    #[test]
    fn remove_refuses_dirty_polecat_without_force() {
        let h = Harness::new();
        h.backend.seed("gastown", "nux");
        h.backend.mark_dirty("gastown", "nux");
        let err = remove_polecat(
            &h.town,
            h.backend.as_ref(),
            &h.sessions(),
            "gastown",
            "nux",
            &RemoveOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PolecatError>(),
            Some(PolecatError::UncommittedWork { .. })
        ));
        assert!(h.backend.exists("gastown", "nux"));
    }

    #[test]
    fn list_reports_session_and_hook() {
        let h = Harness::new();
        h.backend.seed("gastown", "nux");
        h.backend.seed("gastown", "slit");
        h.driver.add_session("gt-gastown-nux", "claude");
        let mut agent = Issue::new("gp-gastown-polecat-nux", "nux");
        agent.issue_type = IssueType::Agent;
        agent.description = "agent_state: working\nhook_bead: gp-abc".into();
        h.beads.insert(agent);

        let rows = list_polecats(
            &h.town,
            h.beads.as_ref(),
            h.backend.as_ref(),
            &h.sessions(),
            Some("gastown"),
        )
        .unwrap();
        let nux = rows.iter().find(|r| r.name == "nux").unwrap();
        assert!(nux.alive);
        assert_eq!(nux.hook_bead.as_deref(), Some("gp-abc"));
        assert_eq!(nux.agent_state.as_deref(), Some("working"));
        let slit = rows.iter().find(|r| r.name == "slit").unwrap();
        assert!(!slit.alive);
        assert_eq!(slit.hook_bead, None);
    }
}
