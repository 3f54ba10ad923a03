//! Witness steps: keep the rig's polecats and their hooks consistent.

use serde_json::json;

use super::Patrol;
use crate::address::AgentAddress;
use crate::beads::fields::{AgentFields, clear_hook_bead, parse_agent_fields, set_agent_fields};
use crate::beads::{Issue, ListOptions, Status, UpdateOptions};
use crate::polecat::{PolecatError, RemoveOptions};

pub const CLEAR_STALE_HOOKS: &str = "clear-stale-hooks";
pub const DETECT_DEAD_SESSIONS: &str = "detect-dead-sessions";
pub const REAP_IDLE_POLECATS: &str = "reap-idle-polecats";

impl Patrol {
    /// Hooked or in-progress work assigned to `addr` in this rig.
    fn held_work(&self, addr: &AgentAddress) -> anyhow::Result<Option<Issue>> {
        for status in [Status::Hooked, Status::InProgress] {
            let found = self.beads.list(
                &self.db(),
                &ListOptions {
                    status: Some(status),
                    assignee: Some(addr.to_string()),
                    ..ListOptions::default()
                },
            )?;
            if let Some(issue) = found.into_iter().next() {
                return Ok(Some(issue));
            }
        }
        Ok(None)
    }

    /// Clear `hook_bead` on polecat agent beads whose bead has moved on:
    /// closed, gone, or re-slung to someone else.
    pub(super) fn clear_stale_hooks(&self) -> anyhow::Result<usize> {
        let mut cleared = 0;
        for polecat in self.polecats.list(&self.rig)? {
            let addr = polecat.address();
            let agent_id = self.town.agent_bead_id(&addr);
            let Some(agent) = self.beads.try_show(&agent_id)? else {
                continue;
            };
            let Some(hook) = parse_agent_fields(&agent.description).hook_bead else {
                continue;
            };
            let owner = addr.to_string();
            let stale = match self.beads.try_show(&hook) {
                Ok(Some(issue)) => {
                    issue.status == Status::Closed || issue.assignee() != Some(owner.as_str())
                }
                Ok(None) => true,
                Err(e) => {
                    tracing::warn!(agent = %addr, bead = %hook, error = %e, "could not read hooked bead");
                    false
                }
            };
            if !stale {
                continue;
            }
            self.beads.update(
                &agent_id,
                &UpdateOptions {
                    description: Some(clear_hook_bead(&agent.description)),
                    ..UpdateOptions::default()
                },
            )?;
            tracing::info!(agent = %addr, bead = %hook, "cleared stale hook");
            cleared += 1;
        }
        Ok(cleared)
    }

    fn mark_dead(&self, addr: &AgentAddress) {
        let agent_id = self.town.agent_bead_id(addr);
        let result = self.beads.try_show(&agent_id).and_then(|agent| {
            let Some(agent) = agent else { return Ok(()) };
            let fields = AgentFields {
                agent_state: Some("dead".into()),
                ..AgentFields::default()
            };
            self.beads.update(
                &agent_id,
                &UpdateOptions {
                    description: Some(set_agent_fields(&agent.description, &fields)),
                    ..UpdateOptions::default()
                },
            )
        });
        if let Err(e) = result {
            tracing::warn!(agent = %addr, error = %e, "could not mark agent dead");
        }
    }

    /// Polecats holding work whose session is gone or back at a shell: kill
    /// the zombie, mark the agent dead and put the work back on the queue.
    pub(super) fn detect_dead_sessions(&self) -> anyhow::Result<usize> {
        let driver = self.sessions.driver();
        let mut found = 0;
        for polecat in self.polecats.list(&self.rig)? {
            let session = &polecat.session_name;
            if self.sessions.is_alive(session) {
                continue;
            }
            let addr = polecat.address();
            let Some(work) = self.held_work(&addr)? else {
                continue;
            };
            let zombie = driver.has_session(session).unwrap_or(false);
            if zombie && let Err(e) = driver.kill_session(session) {
                tracing::warn!(session = %session, error = %e, "could not kill zombie session");
            }
            self.mark_dead(&addr);
            let requeued = self.queue.add(&work.id, &self.rig)?;
            if !requeued && !zombie {
                tracing::debug!(bead = %work.id, "already queued for redispatch");
                continue;
            }
            tracing::warn!(agent = %addr, bead = %work.id, zombie, "polecat session died holding work");
            self.feed.record(
                "session-death",
                &self.me().to_string(),
                json!({
                    "agent": addr.to_string(),
                    "session": session,
                    "bead": work.id,
                    "zombie": zombie,
                }),
            );
            found += 1;
        }
        Ok(found)
    }

    /// Remove polecats with no session and no work. Polecats with unsaved
    /// git state are left alone.
    pub(super) fn reap_idle_polecats(&self) -> anyhow::Result<usize> {
        let driver = self.sessions.driver();
        let mut reaped = 0;
        for polecat in self.polecats.list(&self.rig)? {
            if self.sessions.is_alive(&polecat.session_name) {
                continue;
            }
            if self.held_work(&polecat.address())?.is_some() {
                continue;
            }
            if driver.has_session(&polecat.session_name).unwrap_or(false)
                && let Err(e) = driver.kill_session(&polecat.session_name)
            {
                tracing::warn!(session = %polecat.session_name, error = %e, "could not kill idle session");
            }
            match self
                .polecats
                .remove(&self.rig, &polecat.name, &RemoveOptions::default())
            {
                Ok(()) => {
                    tracing::info!(rig = %self.rig, polecat = %polecat.name, "reaped idle polecat");
                    self.feed.record(
                        "polecat-reaped",
                        &self.me().to_string(),
                        json!({ "rig": self.rig, "polecat": polecat.name }),
                    );
                    reaped += 1;
                }
                Err(PolecatError::UncommittedWork { work, .. }) => {
                    tracing::warn!(polecat = %polecat.name, %work, "idle polecat has unsaved work, not reaping");
                }
                Err(e) => {
                    tracing::warn!(polecat = %polecat.name, error = %e, "could not reap polecat");
                }
            }
        }
        Ok(reaped)
    }
}
