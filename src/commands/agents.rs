use std::collections::BTreeMap;

use clap::{Args, Subcommand};

use super::{TownArgs, parse_key_val, print_json};
use crate::beads::UpdateOptions;
use crate::beads::fields::Fields;
use crate::error::ExitError;

#[derive(Debug, Subcommand)]
pub enum AgentsCommand {
    /// Read or edit the key: value state on an agent bead
    State(StateArgs),
}

impl AgentsCommand {
    pub fn execute(&self) -> anyhow::Result<()> {
        match self {
            AgentsCommand::State(args) => args.execute(),
        }
    }
}

#[derive(Debug, Args)]
pub struct StateArgs {
    #[command(flatten)]
    pub town: TownArgs,
    /// Agent bead ID (e.g. gp-gastown-polecat-nux)
    pub bead: String,
    /// Set a field (repeatable)
    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_key_val)]
    pub set: Vec<(String, String)>,
    /// Add one to an integer field (repeatable)
    #[arg(long = "incr", value_name = "KEY")]
    pub incr: Vec<String>,
    /// Remove a field (repeatable)
    #[arg(long = "del", value_name = "KEY")]
    pub del: Vec<String>,
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Default)]
pub struct StateChanges<'a> {
    pub set: &'a [(String, String)],
    pub incr: &'a [String],
    pub del: &'a [String],
}

impl StateChanges<'_> {
    fn is_empty(&self) -> bool {
        self.set.is_empty() && self.incr.is_empty() && self.del.is_empty()
    }
}

fn check_key(key: &str) -> Result<(), ExitError> {
    let ok = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if ok {
        Ok(())
    } else {
        Err(ExitError::InvalidInput(format!(
            "invalid state key '{key}': use lowercase letters, digits and _"
        )))
    }
}

/// Apply sets, then increments, then deletions. Returns whether anything
/// changed.
pub fn apply_changes(fields: &mut Fields, changes: &StateChanges<'_>) -> Result<bool, ExitError> {
    let before = fields.to_string();
    for (key, value) in changes.set {
        check_key(key)?;
        fields.set(key, value);
    }
    for key in changes.incr {
        check_key(key)?;
        let current = match fields.get(key) {
            Some(v) => v.parse::<i64>().map_err(|_| {
                ExitError::InvalidInput(format!("cannot increment {key}: '{v}' is not an integer"))
            })?,
            None => 0,
        };
        fields.set(key, &(current + 1).to_string());
    }
    for key in changes.del {
        fields.remove(key);
    }
    Ok(fields.to_string() != before)
}

impl StateArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let ctx = self.town.context()?;
        let agent = ctx.beads.show(&self.bead)?;
        let mut fields = Fields::parse(&agent.description);
        let changes = StateChanges {
            set: &self.set,
            incr: &self.incr,
            del: &self.del,
        };
        if !changes.is_empty() && apply_changes(&mut fields, &changes)? {
            ctx.beads.update(
                &self.bead,
                &UpdateOptions {
                    description: Some(fields.to_string()),
                    ..UpdateOptions::default()
                },
            )?;
            tracing::info!(bead = %self.bead, "agent state updated");
        }

        if self.json {
            let map: BTreeMap<&str, &str> = fields.pairs().collect();
            return print_json(&map);
        }
        for (key, value) in fields.pairs() {
            println!("{key}: {value}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_incr_del_keep_prose() {
        let mut fields = Fields::parse("Polecat nux\nagent_state: running\nspawns: 2\nnote: x");
        let changed = apply_changes(
            &mut fields,
            &StateChanges {
                set: &[("agent_state".into(), "idle".into())],
                incr: &["spawns".into(), "restarts".into()],
                del: &["note".into()],
            },
        )
        .unwrap();
        assert!(changed);
        assert_eq!(
            fields.to_string(),
            "Polecat nux\nagent_state: idle\nspawns: 3\nrestarts: 1"
        );
    }

    #[test]
    fn incr_rejects_non_integers() {
        let mut fields = Fields::parse("agent_state: running");
        let err = apply_changes(
            &mut fields,
            &StateChanges {
                incr: &["agent_state".into()],
                ..StateChanges::default()
            },
        )
        .unwrap_err();
        assert_eq!(err.code(), 2);
    }

    #[test]
    fn setting_the_same_value_is_not_a_change() {
        let mut fields = Fields::parse("agent_state: running");
        let changed = apply_changes(
            &mut fields,
            &StateChanges {
                set: &[("agent_state".into(), "running".into())],
                ..StateChanges::default()
            },
        )
        .unwrap();
        assert!(!changed);
    }

    #[test]
    fn bad_keys_are_rejected() {
        let mut fields = Fields::default();
        assert!(
            apply_changes(
                &mut fields,
                &StateChanges {
                    set: &[("Hook Bead".into(), "x".into())],
                    ..StateChanges::default()
                },
            )
            .is_err()
        );
    }
}
