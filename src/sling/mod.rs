//! Sling: hook beads to agents and get them working.
//!
//! A sling goes to the calling agent, to a named agent, or to a rig. Rig
//! slings spawn one fresh polecat per bead; a single bead, a batch and a
//! queue drain all run through the pipeline in [`batch`].

pub mod batch;
pub mod convoy;
pub mod formula;
pub mod target;

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;

pub use target::Target;

use crate::address::AgentAddress;
use crate::beads::fields::{
    AgentFields, AttachmentFields, parse_attachment_fields, set_agent_fields,
    set_attachment_fields,
};
use crate::beads::issue::id_prefix;
use crate::beads::{BeadStore, BeadsError, Db, Issue, Status, UpdateOptions};
use crate::dispatch::DispatchFailure;
use crate::feed::Feed;
use crate::polecat::PolecatBackend;
use crate::queue::Queue;
use crate::session::{Session, SessionFactory, StartOptions};
use crate::shell::{looks_like_bead_id, validate_bead_id};
use crate::template::{StartPrompt, render_start_prompt};
use crate::town::Town;

/// Actor recorded when a human slings from outside any agent session.
pub const OVERSEER: &str = "overseer";

#[derive(Debug, thiserror::Error)]
pub enum SlingError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("bead {bead} is already {status} by {assignee}; use --force to re-sling")]
    BeadAlreadyAssigned {
        bead: String,
        status: String,
        assignee: String,
    },

    #[error("could not hook {bead}: {source}")]
    HookFailed {
        bead: String,
        #[source]
        source: BeadsError,
    },

    #[error("spawn for {bead} in {rig} failed: {detail}")]
    SpawnFailed {
        bead: String,
        rig: String,
        detail: String,
    },

    #[error(
        "capacity exceeded: {requested} bead(s) but {available} of {max} polecat slots free; use --queue"
    )]
    CapacityExceeded {
        requested: usize,
        available: usize,
        max: usize,
    },

    #[error("unknown rig '{0}'")]
    UnknownRig(String),

    #[error("unknown target '{0}'")]
    UnknownTarget(String),

    #[error("{failed} of {total} dispatches failed")]
    BatchFailed { failed: usize, total: usize },

    #[error(transparent)]
    Beads(#[from] BeadsError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SlingError {
    pub fn exit_code(&self) -> u8 {
        match self {
            SlingError::InvalidInput(_)
            | SlingError::UnknownRig(_)
            | SlingError::UnknownTarget(_) => 2,
            SlingError::BeadAlreadyAssigned { .. } => 10,
            SlingError::HookFailed { .. } => 11,
            SlingError::SpawnFailed { .. } | SlingError::BatchFailed { .. } => 12,
            SlingError::CapacityExceeded { .. } => 13,
            SlingError::Beads(BeadsError::NotFound(_) | BeadsError::Route(_)) => 2,
            SlingError::Beads(_) => 1,
            SlingError::Other(e) => e
                .downcast_ref::<crate::error::ExitError>()
                .map_or(1, |e| e.code()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SlingRequest {
    /// Bead IDs or one formula name, optionally followed by a target.
    pub positionals: Vec<String>,
    /// With `--on`, the first positional is a formula applied to these beads.
    pub on: Vec<String>,
    /// `--var key=value` pairs for formula instantiation.
    pub vars: Vec<(String, String)>,
    pub args: Option<String>,
    pub subject: Option<String>,
    pub message: Option<String>,
    /// Start a named agent that is not running.
    pub create: bool,
    pub force: bool,
    pub account: Option<String>,
    pub agent: Option<String>,
    pub no_convoy: bool,
    pub parallelism: Option<usize>,
    /// Cap on running polecats, overriding `sling.max_polecats`.
    pub capacity: Option<usize>,
    pub queue: bool,
    pub dry_run: bool,
}

impl SlingRequest {
    fn start_options(&self) -> StartOptions {
        StartOptions {
            agent_override: self.agent.clone(),
            account: self.account.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Assignment {
    pub bead: String,
    pub agent: String,
    pub session: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SlingOutcome {
    pub assigned: Vec<Assignment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub convoy: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub queued: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed: Vec<DispatchFailure>,
    /// Dry-run steps; nothing was changed.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub plan: Vec<String>,
}

impl SlingOutcome {
    fn planned(plan: Vec<String>) -> Self {
        Self {
            plan,
            ..Self::default()
        }
    }
}

enum Work {
    Beads {
        ids: Vec<String>,
        formula: Option<String>,
    },
    Formula(String),
}

pub struct Sling {
    town: Town,
    beads: Arc<dyn BeadStore>,
    polecats: Arc<dyn PolecatBackend>,
    sessions: SessionFactory,
    feed: Feed,
    queue: Queue,
    actor: String,
    me: Option<AgentAddress>,
}

impl Sling {
    pub fn new(
        town: &Town,
        beads: Arc<dyn BeadStore>,
        polecats: Arc<dyn PolecatBackend>,
        sessions: SessionFactory,
    ) -> Self {
        Self {
            town: town.clone(),
            beads,
            polecats,
            sessions,
            feed: Feed::new(&town.feed_path()),
            queue: Queue::for_town(town),
            actor: OVERSEER.to_string(),
            me: None,
        }
    }

    /// Sling on behalf of `me`, the agent running this process.
    pub fn with_identity(mut self, me: Option<AgentAddress>) -> Self {
        if let Some(addr) = &me {
            self.actor = addr.to_string();
        }
        self.me = me;
        self
    }

    pub fn run(&self, req: &SlingRequest) -> Result<SlingOutcome, SlingError> {
        if req.positionals.is_empty() {
            if req.queue && req.on.is_empty() {
                return self.drain(req);
            }
            return Err(SlingError::InvalidInput(
                "nothing to sling: name a bead or a formula".into(),
            ));
        }

        let (items, token) = if req.on.is_empty() {
            target::split_target(&req.positionals, &self.town)
        } else {
            match req.positionals.as_slice() {
                [formula] => (vec![formula.clone()], None),
                [formula, target] => (vec![formula.clone()], Some(target.clone())),
                _ => {
                    return Err(SlingError::InvalidInput(
                        "--on takes one formula and an optional target".into(),
                    ));
                }
            }
        };
        let target = target::resolve(token.as_deref(), &self.town, self.me.as_ref())?;
        let work = self.classify(items, req, &target)?;

        let (ids, formula) = match work {
            Work::Beads { ids, formula } => (ids, formula),
            Work::Formula(name) => {
                if req.dry_run {
                    return Ok(SlingOutcome::planned(vec![format!(
                        "instantiate formula {name} and sling its root to {target}"
                    )]));
                }
                let root = formula::instantiate_standalone(self, &name, &target, &req.vars)?;
                (vec![root], None)
            }
        };
        let issues = self.validate(&ids, req.force)?;
        let target = self.reroute_dead_polecat(target);

        if req.queue && !matches!(target, Target::Rig(_)) {
            return Err(SlingError::InvalidInput("--queue needs a rig target".into()));
        }
        match target {
            Target::Rig(rig) => self.sling_to_rig(&rig, issues, formula.as_deref(), req),
            Target::Myself(addr) | Target::Agent(addr) if issues.len() > 1 => {
                Err(SlingError::InvalidInput(format!(
                    "cannot sling {} beads to {addr}; batch slings need a rig",
                    issues.len()
                )))
            }
            Target::Myself(addr) => self.sling_to_agent(issues, &addr, formula.as_deref(), req, true),
            Target::Agent(addr) => self.sling_to_agent(issues, &addr, formula.as_deref(), req, false),
        }
    }

    /// Beads, or one formula when the sole item is not a bead.
    fn classify(
        &self,
        items: Vec<String>,
        req: &SlingRequest,
        target: &Target,
    ) -> Result<Work, SlingError> {
        if !req.on.is_empty() {
            let formula = items.into_iter().next();
            return Ok(Work::Beads {
                ids: req.on.clone(),
                formula,
            });
        }
        if let [single] = items.as_slice()
            && !self.is_bead(single)?
        {
            if self.beads.formula_exists(&formula::db_for(target), single)? {
                return Ok(Work::Formula(single.clone()));
            }
            let what = if looks_like_bead_id(single) {
                format!("bead {single} not found")
            } else {
                format!("'{single}' is neither a bead nor a formula")
            };
            return Err(SlingError::InvalidInput(what));
        }
        Ok(Work::Beads {
            ids: items,
            formula: None,
        })
    }

    fn is_bead(&self, id: &str) -> Result<bool, SlingError> {
        if !looks_like_bead_id(id) {
            return Ok(false);
        }
        match self.beads.try_show(id) {
            Ok(found) => Ok(found.is_some()),
            Err(BeadsError::Route(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Every bead must exist, be open and be unassigned (unless forced).
    /// Nothing is written.
    fn validate(&self, ids: &[String], force: bool) -> Result<Vec<Issue>, SlingError> {
        let mut seen = BTreeSet::new();
        let mut issues = Vec::with_capacity(ids.len());
        for id in ids {
            validate_bead_id(id).map_err(|e| SlingError::InvalidInput(e.to_string()))?;
            if !seen.insert(id.as_str()) {
                return Err(SlingError::InvalidInput(format!("bead {id} given twice")));
            }
            let issue = match self.beads.try_show(id) {
                Ok(Some(issue)) => issue,
                Ok(None) => {
                    return Err(SlingError::InvalidInput(format!("bead {id} not found")));
                }
                Err(BeadsError::Route(e)) => {
                    return Err(SlingError::InvalidInput(format!("bead {id}: {e}")));
                }
                Err(e) => return Err(e.into()),
            };
            if issue.status == Status::Closed {
                return Err(SlingError::InvalidInput(format!("bead {id} is closed")));
            }
            if issue.status.is_assigned() && !force {
                return Err(SlingError::BeadAlreadyAssigned {
                    bead: id.clone(),
                    status: issue.status.to_string(),
                    assignee: issue.assignee().unwrap_or("nobody").to_string(),
                });
            }
            issues.push(issue);
        }
        Ok(issues)
    }

    /// A polecat whose session is gone cannot pick up work; send it to a
    /// fresh polecat in the same rig instead.
    fn reroute_dead_polecat(&self, target: Target) -> Target {
        match target {
            Target::Agent(AgentAddress::Polecat { rig, name })
                if !self.sessions.is_alive(&AgentAddress::polecat(&rig, &name).session_name()) =>
            {
                tracing::info!(rig = %rig, polecat = %name, "target polecat is not running, spawning a fresh one");
                Target::Rig(rig)
            }
            other => other,
        }
    }

    /// Database holding `bead_id`, by its prefix.
    fn db_of(&self, bead_id: &str) -> Db {
        id_prefix(bead_id)
            .map(|p| p.trim_end_matches('-'))
            .and_then(|p| self.town.config.rig_for_prefix(p))
            .map_or(Db::Town, |(rig, _)| Db::Rig(rig.to_string()))
    }

    /// Formula application and metadata writeback for each bead, serially.
    fn prepare(
        &self,
        issues: &[Issue],
        formula: Option<&str>,
        req: &SlingRequest,
    ) -> Result<(), SlingError> {
        let mut cooked = BTreeSet::new();
        for issue in issues {
            let mut attachment = parse_attachment_fields(&issue.description);
            attachment.dispatched_by = Some(self.actor.clone());
            if let Some(args) = &req.args {
                attachment.attached_args = Some(args.clone());
            }
            if let Some(name) = formula {
                let db = self.db_of(&issue.id);
                let root = formula::apply(self, name, issue, &db, &req.vars, &mut cooked)?;
                attachment.attached_molecule = Some(root);
                attachment.attached_at = Some(chrono::Utc::now().to_rfc3339());
            }
            let description = set_attachment_fields(&issue.description, &attachment);
            if description != issue.description {
                self.beads.update(
                    &issue.id,
                    &UpdateOptions {
                        description: Some(description),
                        ..UpdateOptions::default()
                    },
                )?;
            }
        }
        Ok(())
    }

    /// Hook-before-spawn: the bead names its owner before any session exists.
    fn hook(&self, bead: &str, addr: &AgentAddress) -> Result<(), SlingError> {
        self.beads
            .update(
                bead,
                &UpdateOptions {
                    status: Some(Status::Hooked),
                    assignee: Some(addr.to_string()),
                    ..UpdateOptions::default()
                },
            )
            .map_err(|source| SlingError::HookFailed {
                bead: bead.to_string(),
                source,
            })?;
        tracing::info!(bead, agent = %addr, "hooked");
        Ok(())
    }

    /// The agent working `issue`, when it is assigned and that agent's
    /// session is running.
    fn live_owner(&self, issue: &Issue) -> Option<AgentAddress> {
        if !issue.status.is_assigned() {
            return None;
        }
        let owner: AgentAddress = issue.assignee()?.parse().ok()?;
        self.sessions.is_alive(&owner.session_name()).then_some(owner)
    }

    /// Take a bead that now has an owner out of the town queue. Best-effort.
    fn dequeue(&self, bead: &str) {
        match self.queue.remove(bead) {
            Ok(true) => tracing::debug!(bead, "removed from queue"),
            Ok(false) => {}
            Err(e) => tracing::warn!(bead, error = %e, "could not remove bead from queue"),
        }
    }

    /// Point the agent bead's `hook_bead` at `bead`. The assignee on the
    /// bead itself is authoritative, so failures only warn.
    fn set_agent_hook(&self, addr: &AgentAddress, bead: &str) {
        let agent_id = self.town.agent_bead_id(addr);
        let result = self.beads.try_show(&agent_id).and_then(|agent| {
            let Some(agent) = agent else {
                tracing::debug!(agent = %addr, "no agent bead to point at hook");
                return Ok(());
            };
            let fields = AgentFields {
                hook_bead: Some(bead.to_string()),
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
            tracing::warn!(agent = %addr, bead, error = %e, "could not set hook_bead on agent bead");
        }
    }

    fn record_sling(&self, bead: &str, addr: &AgentAddress, convoy: Option<&str>) {
        self.feed.record(
            "sling",
            &self.actor,
            json!({
                "bead": bead,
                "target": addr.to_string(),
                "rig": addr.rig(),
                "convoy": convoy,
            }),
        );
    }

    fn start_prompt(&self, issue: &Issue, req: &SlingRequest) -> String {
        let attachment: AttachmentFields = parse_attachment_fields(&issue.description);
        let prompt = StartPrompt {
            bead_id: issue.id.clone(),
            title: issue.title.clone(),
            subject: req.subject.clone(),
            args: attachment.attached_args,
            message: req.message.clone(),
            sender: self.actor.clone(),
            molecule: attachment.attached_molecule,
        };
        render_start_prompt(&prompt).unwrap_or_else(|e| {
            tracing::warn!(bead = %issue.id, error = %e, "start prompt template failed");
            format!("Work is on your hook: {}. Run `gt hook` to see it.", issue.id)
        })
    }

    /// Wait for the agent, then type the start prompt. Failures only warn;
    /// the work is already on the agent's hook.
    fn nudge_started(&self, session: &Session, prompt: &str) {
        let result = self
            .sessions
            .wait_ready(session)
            .and_then(|()| self.sessions.nudge(&session.name, prompt));
        if let Err(e) = result {
            tracing::warn!(session = %session.name, error = %e, "start nudge failed");
        }
    }

    fn sling_to_agent(
        &self,
        issues: Vec<Issue>,
        addr: &AgentAddress,
        formula: Option<&str>,
        req: &SlingRequest,
        is_self: bool,
    ) -> Result<SlingOutcome, SlingError> {
        let session_name = addr.session_name();
        let alive = self.sessions.is_alive(&session_name);
        if !is_self && !alive && !req.create {
            return Err(SlingError::UnknownTarget(format!(
                "{addr} is not running; use --create to start it"
            )));
        }
        if req.dry_run {
            let ids: Vec<&str> = issues.iter().map(|i| i.id.as_str()).collect();
            let mut plan = Vec::new();
            if let Some(f) = formula {
                plan.push(format!("apply formula {f} to {}", ids.join(", ")));
            }
            if !req.no_convoy {
                plan.push("track in a convoy unless one already does".to_string());
            }
            plan.push(format!("hook {} to {addr}", ids.join(", ")));
            if !alive && !is_self {
                plan.push(format!("start session {session_name}"));
            }
            plan.push(format!("nudge {session_name}"));
            return Ok(SlingOutcome::planned(plan));
        }

        self.prepare(&issues, formula, req)?;
        let mut outcome = SlingOutcome::default();
        for issue in &issues {
            if !req.no_convoy {
                outcome.convoy = self.ensure_work_convoy(issue)?;
            }
            self.hook(&issue.id, addr)?;
            self.set_agent_hook(addr, &issue.id);
            self.record_sling(&issue.id, addr, outcome.convoy.as_deref());

            let fresh = self.beads.show(&issue.id)?;
            let prompt = self.start_prompt(&fresh, req);
            if alive {
                if let Err(e) = self.sessions.nudge(&session_name, &prompt) {
                    tracing::warn!(session = %session_name, error = %e, "nudge failed");
                }
            } else if !is_self {
                let session = self.sessions.start(addr, &req.start_options()).map_err(|e| {
                    SlingError::SpawnFailed {
                        bead: issue.id.clone(),
                        rig: addr.rig().unwrap_or("town").to_string(),
                        detail: e.to_string(),
                    }
                })?;
                self.nudge_started(&session, &prompt);
            }
            self.dequeue(&issue.id);
            outcome.assigned.push(Assignment {
                bead: issue.id.clone(),
                agent: addr.to_string(),
                session: session_name.clone(),
            });
        }
        Ok(outcome)
    }

    /// Attach `bead` to the calling agent without nudging anyone.
    pub fn hook_to_self(&self, bead: &str, force: bool) -> Result<Assignment, SlingError> {
        let me = self.me.clone().ok_or_else(|| {
            SlingError::InvalidInput("not inside an agent session; cannot hook to self".into())
        })?;
        self.validate(&[bead.to_string()], force)?;
        self.hook(bead, &me)?;
        self.set_agent_hook(&me, bead);
        self.dequeue(bead);
        self.feed.record("hook", &self.actor, json!({ "bead": bead }));
        Ok(Assignment {
            bead: bead.to_string(),
            agent: me.to_string(),
            session: me.session_name(),
        })
    }

    /// What is on the calling agent's hook.
    pub fn current_hook(&self) -> Result<Option<Issue>, SlingError> {
        let me = self.me.clone().ok_or_else(|| {
            SlingError::InvalidInput("not inside an agent session; no hook to show".into())
        })?;
        let agent_id = self.town.agent_bead_id(&me);
        if let Some(agent) = self.beads.try_show(&agent_id)?
            && let Some(hook) = crate::beads::fields::parse_agent_fields(&agent.description).hook_bead
            && let Some(issue) = self.beads.try_show(&hook)?
            && issue.assignee() == Some(me.to_string().as_str())
        {
            return Ok(Some(issue));
        }
        let db = me.rig().map_or(Db::Town, |r| Db::Rig(r.to_string()));
        for status in [Status::Hooked, Status::InProgress, Status::Pinned] {
            let found = self.beads.list(
                &db,
                &crate::beads::ListOptions {
                    status: Some(status),
                    assignee: Some(me.to_string()),
                    ..crate::beads::ListOptions::default()
                },
            )?;
            if let Some(issue) = found.into_iter().next() {
                return Ok(Some(issue));
            }
        }
        Ok(None)
    }
}
