//! Patrol loop for the rig's witness and refinery.
//!
//! Each cycle finds the role's patrol molecule (or resumes or creates one),
//! runs the role's steps, closes one step bead per completed step and
//! records back-pressure as an `idle:<n>` label on the role's agent bead.

pub mod refinery;
pub mod witness;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use serde::Serialize;

use crate::address::AgentAddress;
use crate::beads::fields::{AgentFields, set_agent_fields};
use crate::beads::{BeadStore, CreateOptions, Db, Issue, IssueType, ListOptions, Status, UpdateOptions};
use crate::error::ExitError;
use crate::feed::Feed;
use crate::polecat::PolecatBackend;
use crate::queue::Queue;
use crate::session::SessionFactory;
use crate::template::{PatrolPrompt, render_patrol};
use crate::town::Town;

pub const IDLE_LABEL: &str = "idle";

/// Multipliers on the base interval after consecutive idle cycles.
const IDLE_BACKOFF: [u32; 5] = [1, 2, 4, 6, 6];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PatrolRole {
    Witness,
    Refinery,
}

impl PatrolRole {
    pub fn as_str(self) -> &'static str {
        match self {
            PatrolRole::Witness => "witness",
            PatrolRole::Refinery => "refinery",
        }
    }

    pub fn address(self, rig: &str) -> AgentAddress {
        let rig = rig.to_string();
        match self {
            PatrolRole::Witness => AgentAddress::Witness { rig },
            PatrolRole::Refinery => AgentAddress::Refinery { rig },
        }
    }

    /// Label marking this role's patrol molecules.
    pub fn label(self) -> String {
        format!("patrol:{}", self.as_str())
    }

    pub fn formula(self) -> String {
        format!("mol-{}-patrol", self.as_str())
    }

    pub fn steps(self) -> &'static [&'static str] {
        match self {
            PatrolRole::Witness => &[
                witness::CLEAR_STALE_HOOKS,
                witness::DETECT_DEAD_SESSIONS,
                witness::REAP_IDLE_POLECATS,
            ],
            PatrolRole::Refinery => &[refinery::PROCESS_MERGE_QUEUE],
        }
    }
}

impl fmt::Display for PatrolRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PatrolRole {
    type Err = ExitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "witness" => Ok(PatrolRole::Witness),
            "refinery" => Ok(PatrolRole::Refinery),
            other => Err(ExitError::InvalidInput(format!(
                "'{other}' has no patrol; expected witness or refinery"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub name: String,
    /// Things the step changed; zero means nothing to do.
    pub actions: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub rig: String,
    pub role: PatrolRole,
    pub molecule: String,
    pub steps: Vec<StepReport>,
    pub idle: u32,
}

impl CycleReport {
    pub fn actions(&self) -> usize {
        self.steps.iter().map(|s| s.actions).sum()
    }
}

#[derive(Debug, Clone)]
pub struct LoopOptions {
    pub interval: Duration,
    /// Stop after this many cycles; `None` runs until stopped.
    pub max_cycles: Option<usize>,
}

/// Delay before the next cycle after `idle` consecutive idle cycles.
pub fn idle_delay(interval: Duration, idle: u32) -> Duration {
    let step = (idle as usize).min(IDLE_BACKOFF.len() - 1);
    interval * IDLE_BACKOFF[step]
}

pub struct Patrol {
    town: Town,
    rig: String,
    role: PatrolRole,
    beads: Arc<dyn BeadStore>,
    polecats: Arc<dyn PolecatBackend>,
    sessions: SessionFactory,
    queue: Queue,
    feed: Feed,
}

impl Patrol {
    pub fn new(
        town: &Town,
        rig: &str,
        role: PatrolRole,
        beads: Arc<dyn BeadStore>,
        polecats: Arc<dyn PolecatBackend>,
        sessions: SessionFactory,
    ) -> anyhow::Result<Self> {
        if !town.has_rig(rig) {
            return Err(ExitError::InvalidInput(format!("unknown rig '{rig}'")).into());
        }
        Ok(Self {
            town: town.clone(),
            rig: rig.to_string(),
            role,
            beads,
            polecats,
            sessions,
            queue: Queue::for_town(town),
            feed: Feed::new(&town.feed_path()),
        })
    }

    fn me(&self) -> AgentAddress {
        self.role.address(&self.rig)
    }

    fn db(&self) -> Db {
        Db::Rig(self.rig.clone())
    }

    fn mine(&self, status: Status) -> anyhow::Result<Vec<Issue>> {
        Ok(self.beads.list(
            &self.db(),
            &ListOptions {
                status: Some(status),
                assignee: Some(self.me().to_string()),
                label: Some(self.role.label()),
                ..ListOptions::default()
            },
        )?)
    }

    fn open_children(&self, molecule: &str) -> anyhow::Result<Vec<Issue>> {
        let mut children = self.beads.list(
            &self.db(),
            &ListOptions {
                parent: Some(molecule.to_string()),
                ..ListOptions::default()
            },
        )?;
        children.retain(|c| c.status != Status::Closed);
        children.sort_by(|a, b| (a.id.len(), &a.id).cmp(&(b.id.len(), &b.id)));
        Ok(children)
    }

    fn claim(&self, id: &str) -> anyhow::Result<()> {
        self.beads.update(
            id,
            &UpdateOptions {
                status: Some(Status::InProgress),
                assignee: Some(self.me().to_string()),
                ..UpdateOptions::default()
            },
        )?;
        Ok(())
    }

    /// The molecule this cycle works under: an in-progress one owned by
    /// this role, else an open one with steps left, else a fresh wisp.
    pub fn find_or_create_molecule(&self) -> anyhow::Result<Issue> {
        for status in [Status::InProgress, Status::Hooked] {
            if let Some(found) = self.mine(status)?.into_iter().next() {
                tracing::debug!(molecule = %found.id, "continuing patrol");
                return Ok(found);
            }
        }

        let open = self.beads.list(
            &self.db(),
            &ListOptions {
                status: Some(Status::Open),
                label: Some(self.role.label()),
                ..ListOptions::default()
            },
        )?;
        for candidate in open {
            if !self.open_children(&candidate.id)?.is_empty() {
                tracing::info!(molecule = %candidate.id, "resuming patrol");
                self.claim(&candidate.id)?;
                return Ok(self.beads.show(&candidate.id)?);
            }
        }

        let id = self.instantiate()?;
        self.beads.label_add(&id, &self.role.label())?;
        self.claim(&id)?;
        tracing::info!(molecule = %id, role = %self.role, rig = %self.rig, "new patrol");
        Ok(self.beads.show(&id)?)
    }

    fn instantiate(&self) -> anyhow::Result<String> {
        let db = self.db();
        let formula = self.role.formula();
        if self.beads.formula_exists(&db, &formula)? {
            self.beads.cook_formula(&db, &formula)?;
            let vars = [
                ("rig".to_string(), self.rig.clone()),
                ("role".to_string(), self.role.to_string()),
            ];
            return Ok(self.beads.instantiate_wisp(&db, &formula, &vars)?);
        }

        tracing::debug!(formula, "no patrol formula, creating a plain molecule");
        let description = render_patrol(&PatrolPrompt {
            rig: self.rig.clone(),
            role: self.role.to_string(),
        })?;
        let root = self.beads.create(
            &db,
            &CreateOptions {
                title: format!("{} patrol", self.role),
                description,
                issue_type: IssueType::Molecule,
                ..CreateOptions::default()
            },
        )?;
        for step in self.role.steps() {
            self.beads.create(
                &db,
                &CreateOptions {
                    title: step.to_string(),
                    issue_type: IssueType::Wisp,
                    parent: Some(root.id.clone()),
                    ..CreateOptions::default()
                },
            )?;
        }
        Ok(root.id)
    }

    fn run_step(&self, step: &str) -> anyhow::Result<usize> {
        match step {
            witness::CLEAR_STALE_HOOKS => self.clear_stale_hooks(),
            witness::DETECT_DEAD_SESSIONS => self.detect_dead_sessions(),
            witness::REAP_IDLE_POLECATS => self.reap_idle_polecats(),
            refinery::PROCESS_MERGE_QUEUE => self.process_merge_queue(),
            other => anyhow::bail!("unknown patrol step {other}"),
        }
    }

    /// One patrol pass.
    pub fn run_cycle(&self) -> anyhow::Result<CycleReport> {
        let molecule = self.find_or_create_molecule()?;
        let mut pending = self.open_children(&molecule.id)?.into_iter();
        let mut steps = Vec::new();
        for step in self.role.steps() {
            let actions = self
                .run_step(step)
                .with_context(|| format!("{} patrol step {step}", self.role))?;
            tracing::info!(step, actions, "patrol step done");
            if let Some(child) = pending.next() {
                self.beads.close(&child.id, Some("done"))?;
            }
            steps.push(StepReport {
                name: step.to_string(),
                actions,
            });
        }
        for leftover in pending {
            self.beads.close(&leftover.id, Some("done"))?;
        }
        self.beads.close(&molecule.id, Some("patrol complete"))?;

        let found_work = steps.iter().any(|s| s.actions > 0);
        let idle = self.record_idle(found_work)?;
        Ok(CycleReport {
            rig: self.rig.clone(),
            role: self.role,
            molecule: molecule.id,
            steps,
            idle,
        })
    }

    /// The role's agent bead, created if missing.
    fn agent_bead(&self) -> anyhow::Result<Issue> {
        let id = self.town.agent_bead_id(&self.me());
        if let Some(found) = self.beads.try_show(&id)? {
            return Ok(found);
        }
        let fields = AgentFields {
            role_type: Some(self.role.to_string()),
            rig: Some(self.rig.clone()),
            agent_state: Some("running".into()),
            ..AgentFields::default()
        };
        Ok(self.beads.create(
            &self.db(),
            &CreateOptions {
                id: Some(id),
                title: self.me().to_string(),
                description: set_agent_fields("", &fields),
                issue_type: IssueType::Agent,
                ..CreateOptions::default()
            },
        )?)
    }

    /// Bump or reset the `idle:<n>` label; returns the new count.
    fn record_idle(&self, found_work: bool) -> anyhow::Result<u32> {
        let agent = self.agent_bead()?;
        let previous = agent
            .label_value(IDLE_LABEL)
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0);
        let idle = if found_work { 0 } else { previous + 1 };
        let stale: Vec<String> = agent
            .labels
            .iter()
            .filter(|l| l.starts_with("idle:"))
            .cloned()
            .collect();
        let label = format!("{IDLE_LABEL}:{idle}");
        if stale == [label.clone()] {
            return Ok(idle);
        }
        self.beads.update(
            &agent.id,
            &UpdateOptions {
                remove_labels: stale,
                add_labels: vec![label],
                ..UpdateOptions::default()
            },
        )?;
        Ok(idle)
    }

    /// Run cycles until `stop` is set or `max_cycles` is reached. A failed
    /// cycle is logged and counts as idle.
    pub fn run_loop(
        &self,
        opts: &LoopOptions,
        stop: &AtomicBool,
        mut on_cycle: impl FnMut(&CycleReport),
    ) -> anyhow::Result<()> {
        let mut cycles = 0;
        let mut idle = 0;
        while !stop.load(Ordering::SeqCst) {
            match self.run_cycle() {
                Ok(report) => {
                    idle = report.idle;
                    on_cycle(&report);
                }
                Err(e) => {
                    tracing::warn!(rig = %self.rig, role = %self.role, error = %format!("{e:#}"), "patrol cycle failed");
                    idle += 1;
                }
            }
            cycles += 1;
            if opts.max_cycles.is_some_and(|max| cycles >= max) {
                break;
            }
            let delay = idle_delay(opts.interval, idle);
            tracing::debug!(?delay, idle, "sleeping until next patrol");
            sleep_unless_stopped(delay, stop);
        }
        Ok(())
    }
}

fn sleep_unless_stopped(delay: Duration, stop: &AtomicBool) {
    let deadline = Instant::now() + delay;
    while !stop.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep((deadline - now).min(Duration::from_millis(200)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;

    pub(super) fn patrol(h: &Harness, role: PatrolRole) -> Patrol {
        Patrol::new(
            &h.town,
            "gastown",
            role,
            h.beads.clone(),
            h.backend.clone(),
            h.sessions(),
        )
        .unwrap()
    }

    #[test]
    fn backoff_grows_then_caps() {
        let base = Duration::from_secs(10);
        assert_eq!(idle_delay(base, 0), base);
        assert_eq!(idle_delay(base, 1), base * 2);
        assert_eq!(idle_delay(base, 4), base * 6);
        assert_eq!(idle_delay(base, 40), base * 6);
    }

    #[test]
    fn role_parsing() {
        assert_eq!("witness".parse::<PatrolRole>().unwrap(), PatrolRole::Witness);
        assert!("mayor".parse::<PatrolRole>().is_err());
        assert_eq!(PatrolRole::Refinery.formula(), "mol-refinery-patrol");
    }

    #[test]
    fn plain_molecule_is_created_with_steps() {
        let h = Harness::new();
        let p = patrol(&h, PatrolRole::Witness);
        let molecule = p.find_or_create_molecule().unwrap();
        assert_eq!(molecule.issue_type, IssueType::Molecule);
        assert_eq!(molecule.status, Status::InProgress);
        assert_eq!(molecule.assignee(), Some("gastown/witness"));
        assert!(molecule.has_label("patrol:witness"));
        assert!(molecule.description.contains("reap idle polecats"));
        assert_eq!(p.open_children(&molecule.id).unwrap().len(), 3);

        // Still in progress: found again, not duplicated.
        assert_eq!(p.find_or_create_molecule().unwrap().id, molecule.id);
    }

    #[test]
    fn formula_wisp_is_preferred() {
        let h = Harness::new().with_beads(|b| b.with_formula("mol-witness-patrol", &["a", "b", "c"]));
        let molecule = patrol(&h, PatrolRole::Witness).find_or_create_molecule().unwrap();
        assert!(molecule.id.starts_with("gp-wisp-"));
        assert!(molecule.has_label("patrol:witness"));
        assert_eq!(h.beads.cooked(), vec!["mol-witness-patrol"]);
    }

    #[test]
    fn open_molecule_with_steps_left_is_resumed() {
        let h = Harness::new();
        let mut root = Issue::new("gp-m1", "witness patrol");
        root.labels = vec!["patrol:witness".into()];
        h.beads.insert(root);
        let mut step = Issue::new("gp-m1.1", "reap");
        step.parent = Some("gp-m1".into());
        h.beads.insert(step);

        let molecule = patrol(&h, PatrolRole::Witness).find_or_create_molecule().unwrap();
        assert_eq!(molecule.id, "gp-m1");
        assert_eq!(molecule.status, Status::InProgress);
    }

    #[test]
    fn idle_cycles_count_up_and_work_resets() {
        let h = Harness::new();
        let p = patrol(&h, PatrolRole::Witness);
        assert_eq!(p.run_cycle().unwrap().idle, 1);
        let report = p.run_cycle().unwrap();
        assert_eq!(report.idle, 2);
        assert_eq!(report.steps.len(), 3);

        let agent = h.beads.issue("gp-gastown-witness").unwrap();
        assert_eq!(agent.issue_type, IssueType::Agent);
        assert_eq!(agent.label_value("idle"), Some("2"));
        assert_eq!(agent.labels.iter().filter(|l| l.starts_with("idle:")).count(), 1);

        // An idle polecat to reap is work.
        h.backend.seed("gastown", "nux");
        assert_eq!(p.run_cycle().unwrap().idle, 0);
        let agent = h.beads.issue("gp-gastown-witness").unwrap();
        assert_eq!(agent.label_value("idle"), Some("0"));
    }

    #[test]
    fn cycle_closes_steps_and_molecule() {
        let h = Harness::new();
        let p = patrol(&h, PatrolRole::Witness);
        let report = p.run_cycle().unwrap();
        let molecule = h.beads.issue(&report.molecule).unwrap();
        assert_eq!(molecule.status, Status::Closed);
        assert!(p.open_children(&report.molecule).unwrap().is_empty());
        // The next cycle starts a fresh molecule.
        assert_ne!(p.run_cycle().unwrap().molecule, report.molecule);
    }

    #[test]
    fn loop_stops_after_max_cycles() {
        let h = Harness::new();
        let p = patrol(&h, PatrolRole::Witness);
        let stop = AtomicBool::new(false);
        let mut seen = 0;
        p.run_loop(
            &LoopOptions {
                interval: Duration::from_millis(1),
                max_cycles: Some(2),
            },
            &stop,
            |_| seen += 1,
        )
        .unwrap();
        assert_eq!(seen, 2);
    }

    #[test]
    fn unknown_rig_is_rejected() {
        let h = Harness::new();
        assert!(
            Patrol::new(
                &h.town,
                "nowhere",
                PatrolRole::Witness,
                h.beads.clone(),
                h.backend.clone(),
                h.sessions(),
            )
            .is_err()
        );
    }
}
