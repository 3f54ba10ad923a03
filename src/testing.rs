//! In-memory doubles for the beads store, the multiplexer and the polecat
//! backend, plus a harness wiring them into a throwaway town.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::address::AgentAddress;
use crate::beads::issue::{DependencyRef, id_prefix};
use crate::beads::{
    BeadStore, BeadsError, CreateOptions, Db, Issue, IssueType, ListOptions, RouteError, Status,
    UpdateOptions,
};
use crate::config::{RuntimeConfig, TownConfig};
use crate::feed::Feed;
use crate::git::UncommittedWork;
use crate::polecat::names::NamePool;
use crate::polecat::{AddOptions, Polecat, PolecatBackend, PolecatError, RemoveOptions};
use crate::queue::Queue;
use crate::session::{SessionDriver, SessionFactory, StartSpec};
use crate::sling::Sling;
use crate::town::Town;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Ordered log shared between doubles, for cross-component ordering checks.
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        lock(&self.0).push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        lock(&self.0).clone()
    }

    /// Index of the first entry starting with `prefix`.
    pub fn position(&self, prefix: &str) -> Option<usize> {
        lock(&self.0).iter().position(|e| e.starts_with(prefix))
    }

    pub fn count(&self, prefix: &str) -> usize {
        lock(&self.0).iter().filter(|e| e.starts_with(prefix)).count()
    }
}

/// Town config with rig `gastown` (prefix `gp`) and zero delays.
pub fn quick_config() -> TownConfig {
    let mut config =
        TownConfig::parse_toml("name = \"t\"\n[rigs.gastown]\nprefix = \"gp\"\n").unwrap();
    config.agents.runtimes.insert(
        "claude".into(),
        RuntimeConfig {
            command: "claude".into(),
            args: Vec::new(),
            ready_delay_ms: 0,
            accept_permissions: true,
            env: BTreeMap::new(),
        },
    );
    config.agents.runtimes.insert(
        "codex".into(),
        RuntimeConfig {
            command: "codex".into(),
            args: Vec::new(),
            ready_delay_ms: 0,
            accept_permissions: false,
            env: BTreeMap::new(),
        },
    );
    config.session.nudge_debounce_ms = 0;
    config.session.poll_interval_ms = 1;
    config.session.ready_timeout_ms = 1000;
    config.names.pool = vec!["nux".into(), "slit".into(), "rictus".into(), "toast".into()];
    config
}

// --- Beads ---

#[derive(Debug, Default)]
struct BeadsState {
    issues: BTreeMap<String, Issue>,
    counters: BTreeMap<String, u32>,
    /// (issue, depends_on, type)
    deps: Vec<(String, String, String)>,
    /// formula -> child step titles
    formulas: BTreeMap<String, Vec<String>>,
    cooked: Vec<String>,
    fail_updates: BTreeSet<String>,
    merge_slots: BTreeMap<String, String>,
    mutations: Vec<String>,
}

pub struct FakeBeads {
    state: Mutex<BeadsState>,
    prefixes: BTreeMap<String, String>,
    events: EventLog,
}

impl Default for FakeBeads {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBeads {
    /// Knows rig `gastown` with prefix `gp`.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BeadsState::default()),
            prefixes: BTreeMap::from([("gastown".to_string(), "gp".to_string())]),
            events: EventLog::new(),
        }
    }

    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = events;
        self
    }

    pub fn with_rig(mut self, rig: &str, prefix: &str) -> Self {
        self.prefixes.insert(rig.to_string(), prefix.to_string());
        self
    }

    /// Register a formula whose wisps get one child bead per step.
    pub fn with_formula(self, name: &str, steps: &[&str]) -> Self {
        lock(&self.state)
            .formulas
            .insert(name.to_string(), steps.iter().map(|s| s.to_string()).collect());
        self
    }

    /// Seed a bead without logging a mutation.
    pub fn insert(&self, issue: Issue) {
        lock(&self.state).issues.insert(issue.id.clone(), issue);
    }

    pub fn issue(&self, id: &str) -> Option<Issue> {
        lock(&self.state).issues.get(id).cloned()
    }

    pub fn issues(&self) -> Vec<Issue> {
        lock(&self.state).issues.values().cloned().collect()
    }

    /// Status changes to `id` fail; other updates go through.
    pub fn fail_hooks_for(&self, id: &str) {
        lock(&self.state).fail_updates.insert(id.to_string());
    }

    pub fn deps(&self) -> Vec<(String, String, String)> {
        lock(&self.state).deps.clone()
    }

    pub fn cooked(&self) -> Vec<String> {
        lock(&self.state).cooked.clone()
    }

    /// Every write, in order.
    pub fn mutations(&self) -> Vec<String> {
        lock(&self.state).mutations.clone()
    }

    pub fn slot_holder(&self, db: &Db) -> Option<String> {
        lock(&self.state).merge_slots.get(&self.db_prefix(db).ok()?).cloned()
    }

    fn db_prefix(&self, db: &Db) -> Result<String, BeadsError> {
        match db {
            Db::Town => Ok("hq".to_string()),
            Db::Rig(rig) => self.prefixes.get(rig).cloned().ok_or_else(|| {
                BeadsError::Route(RouteError::RouteNotFound { id: rig.clone() })
            }),
        }
    }

    fn record(&self, state: &mut BeadsState, entry: String) {
        self.events.push(entry.clone());
        state.mutations.push(entry);
    }

    fn next_id(state: &mut BeadsState, prefix: &str) -> String {
        let n = state.counters.entry(prefix.to_string()).or_insert(0);
        *n += 1;
        format!("{prefix}-{n}")
    }
}

fn not_found(id: &str) -> BeadsError {
    BeadsError::NotFound(id.to_string())
}

impl BeadStore for FakeBeads {
    fn show(&self, id: &str) -> Result<Issue, BeadsError> {
        self.issue(id).ok_or_else(|| not_found(id))
    }

    fn create(&self, db: &Db, opts: &CreateOptions) -> Result<Issue, BeadsError> {
        let prefix = self.db_prefix(db)?;
        let mut state = lock(&self.state);
        let id = match (&opts.id, &opts.prefix) {
            (Some(id), _) => id.clone(),
            (None, Some(p)) => Self::next_id(&mut state, p.trim_end_matches('-')),
            (None, None) => Self::next_id(&mut state, &prefix),
        };
        if state.issues.contains_key(&id) {
            return Err(BeadsError::Command {
                command: "create".into(),
                message: format!("{id} already exists"),
            });
        }
        let issue = Issue {
            id: id.clone(),
            title: opts.title.clone(),
            description: opts.description.clone(),
            issue_type: opts.issue_type,
            priority: opts.priority.unwrap_or(2),
            labels: opts.labels.clone(),
            assignee: opts.assignee.clone(),
            parent: opts.parent.clone(),
            ..Issue::default()
        };
        state.issues.insert(id.clone(), issue.clone());
        self.record(&mut state, format!("create {id}"));
        Ok(issue)
    }

    fn update(&self, id: &str, opts: &UpdateOptions) -> Result<(), BeadsError> {
        let mut state = lock(&self.state);
        if opts.status.is_some() && state.fail_updates.contains(id) {
            return Err(BeadsError::Command {
                command: "update".into(),
                message: format!("{id}: database is locked"),
            });
        }
        let issue = state.issues.get_mut(id).ok_or_else(|| not_found(id))?;
        if let Some(status) = opts.status {
            issue.status = status;
        }
        if let Some(assignee) = &opts.assignee {
            issue.assignee = (!assignee.is_empty()).then(|| assignee.clone());
        }
        if let Some(title) = &opts.title {
            issue.title = title.clone();
        }
        if let Some(description) = &opts.description {
            issue.description = description.clone();
        }
        if let Some(priority) = opts.priority {
            issue.priority = priority;
        }
        for label in &opts.add_labels {
            if !issue.has_label(label) {
                issue.labels.push(label.clone());
            }
        }
        issue.labels.retain(|l| !opts.remove_labels.contains(l));
        let entry = match opts.status {
            Some(status) => format!("update {id} status={status}"),
            None => format!("update {id}"),
        };
        self.record(&mut state, entry);
        Ok(())
    }

    fn list(&self, db: &Db, opts: &ListOptions) -> Result<Vec<Issue>, BeadsError> {
        let prefix = format!("{}-", self.db_prefix(db)?);
        let state = lock(&self.state);
        Ok(state
            .issues
            .values()
            .filter(|i| id_prefix(&i.id) == Some(prefix.as_str()))
            .filter(|i| match opts.status {
                Some(s) => i.status == s,
                None => opts.all || i.status != Status::Closed,
            })
            .filter(|i| opts.issue_type.is_none_or(|t| i.issue_type == t))
            .filter(|i| {
                opts.assignee
                    .as_deref()
                    .is_none_or(|a| i.assignee() == Some(a))
            })
            .filter(|i| opts.label.as_deref().is_none_or(|l| i.has_label(l)))
            .filter(|i| {
                opts.parent
                    .as_deref()
                    .is_none_or(|p| i.parent.as_deref() == Some(p))
            })
            .cloned()
            .collect())
    }

    fn close(&self, id: &str, reason: Option<&str>) -> Result<(), BeadsError> {
        let mut state = lock(&self.state);
        let issue = state.issues.get_mut(id).ok_or_else(|| not_found(id))?;
        issue.status = Status::Closed;
        let entry = match reason {
            Some(r) => format!("close {id} reason={r}"),
            None => format!("close {id}"),
        };
        self.record(&mut state, entry);
        Ok(())
    }

    fn add_dependency(&self, issue: &str, depends_on: &str, dep_type: &str) -> Result<(), BeadsError> {
        let mut state = lock(&self.state);
        let owner = state.issues.get_mut(issue).ok_or_else(|| not_found(issue))?;
        owner.dependencies.push(DependencyRef {
            id: depends_on.to_string(),
            dep_type: dep_type.to_string(),
        });
        state
            .deps
            .push((issue.to_string(), depends_on.to_string(), dep_type.to_string()));
        self.record(&mut state, format!("dep {issue} {dep_type} {depends_on}"));
        Ok(())
    }

    fn dependents(&self, id: &str, dep_type: &str) -> Result<Vec<Issue>, BeadsError> {
        let state = lock(&self.state);
        Ok(state
            .deps
            .iter()
            .filter(|(_, on, t)| on == id && t == dep_type)
            .filter_map(|(owner, _, _)| state.issues.get(owner).cloned())
            .collect())
    }

    fn label_add(&self, id: &str, label: &str) -> Result<(), BeadsError> {
        let mut state = lock(&self.state);
        let issue = state.issues.get_mut(id).ok_or_else(|| not_found(id))?;
        if !issue.has_label(label) {
            issue.labels.push(label.to_string());
        }
        self.record(&mut state, format!("label {id} +{label}"));
        Ok(())
    }

    fn label_remove(&self, id: &str, label: &str) -> Result<(), BeadsError> {
        let mut state = lock(&self.state);
        let issue = state.issues.get_mut(id).ok_or_else(|| not_found(id))?;
        issue.labels.retain(|l| l != label);
        self.record(&mut state, format!("label {id} -{label}"));
        Ok(())
    }

    fn formula_exists(&self, db: &Db, formula: &str) -> Result<bool, BeadsError> {
        self.db_prefix(db)?;
        Ok(lock(&self.state).formulas.contains_key(formula))
    }

    fn cook_formula(&self, db: &Db, formula: &str) -> Result<(), BeadsError> {
        self.db_prefix(db)?;
        let mut state = lock(&self.state);
        if !state.formulas.contains_key(formula) {
            return Err(BeadsError::Command {
                command: "cook".into(),
                message: format!("formula {formula} not found"),
            });
        }
        state.cooked.push(formula.to_string());
        self.record(&mut state, format!("cook {formula}"));
        Ok(())
    }

    fn instantiate_wisp(
        &self,
        db: &Db,
        formula: &str,
        vars: &[(String, String)],
    ) -> Result<String, BeadsError> {
        let prefix = self.db_prefix(db)?;
        let mut state = lock(&self.state);
        let Some(steps) = state.formulas.get(formula).cloned() else {
            return Err(BeadsError::Command {
                command: "mol wisp".into(),
                message: format!("formula {formula} not found"),
            });
        };
        let root = Self::next_id(&mut state, &format!("{prefix}-wisp"));
        let description = vars
            .iter()
            .map(|(k, v)| format!("{k}: {v}"))
            .collect::<Vec<_>>()
            .join("\n");
        let mut issue = Issue::new(&root, formula);
        issue.issue_type = IssueType::Wisp;
        issue.description = description;
        state.issues.insert(root.clone(), issue);
        for (i, step) in steps.iter().enumerate() {
            let id = format!("{root}.{}", i + 1);
            let mut child = Issue::new(&id, step);
            child.issue_type = IssueType::Wisp;
            child.parent = Some(root.clone());
            state.issues.insert(id, child);
        }
        self.record(&mut state, format!("wisp {formula} {root}"));
        Ok(root)
    }

    fn merge_slot_acquire(&self, db: &Db, holder: &str) -> Result<bool, BeadsError> {
        let key = self.db_prefix(db)?;
        let mut state = lock(&self.state);
        match state.merge_slots.get(&key) {
            Some(current) if current != holder => Ok(false),
            _ => {
                state.merge_slots.insert(key, holder.to_string());
                Ok(true)
            }
        }
    }

    fn merge_slot_release(&self, db: &Db, holder: &str) -> Result<(), BeadsError> {
        let key = self.db_prefix(db)?;
        let mut state = lock(&self.state);
        if state.merge_slots.get(&key).is_some_and(|h| h == holder) {
            state.merge_slots.remove(&key);
        }
        Ok(())
    }
}

/// A bead with the given status and assignee.
pub fn bead(id: &str, title: &str, status: Status, assignee: Option<&str>) -> Issue {
    Issue {
        status,
        assignee: assignee.map(str::to_string),
        ..Issue::new(id, title)
    }
}

// --- Sessions ---

#[derive(Debug, Default)]
struct FakeSession {
    spec: Option<StartSpec>,
    pane: String,
    screen: String,
    typed: String,
}

#[derive(Debug, Default)]
struct DriverState {
    sessions: BTreeMap<String, FakeSession>,
    /// Keys survive the session so tests can inspect them after a kill.
    keys: BTreeMap<String, Vec<String>>,
    starts: usize,
    stops: Vec<String>,
    nudges: Vec<(String, String)>,
    current: Option<String>,
    attachments: Vec<String>,
    fail_start: bool,
}

#[derive(Default)]
pub struct FakeDriver {
    state: Mutex<DriverState>,
    events: EventLog,
}

const FAKE_SHELLS: &[&str] = &["bash", "zsh", "sh"];

impl FakeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = events;
        self
    }

    /// A session that already exists, running `pane`.
    pub fn add_session(&self, name: &str, pane: &str) {
        lock(&self.state).sessions.insert(
            name.to_string(),
            FakeSession {
                pane: pane.to_string(),
                ..FakeSession::default()
            },
        );
    }

    pub fn remove_session(&self, name: &str) {
        lock(&self.state).sessions.remove(name);
    }

    pub fn has(&self, name: &str) -> bool {
        lock(&self.state).sessions.contains_key(name)
    }

    pub fn spec(&self, name: &str) -> Option<StartSpec> {
        lock(&self.state).sessions.get(name)?.spec.clone()
    }

    pub fn starts(&self) -> usize {
        lock(&self.state).starts
    }

    pub fn stops(&self) -> Vec<String> {
        lock(&self.state).stops.clone()
    }

    pub fn set_pane(&self, name: &str, pane: &str) {
        if let Some(s) = lock(&self.state).sessions.get_mut(name) {
            s.pane = pane.to_string();
        }
    }

    pub fn set_screen(&self, name: &str, screen: &str) {
        if let Some(s) = lock(&self.state).sessions.get_mut(name) {
            s.screen = screen.to_string();
        }
    }

    /// Named keys sent to `name`, literals excluded.
    pub fn keys(&self, name: &str) -> Vec<String> {
        lock(&self.state).keys.get(name).cloned().unwrap_or_default()
    }

    /// (session, text) for every literal committed with Enter.
    pub fn nudges(&self) -> Vec<(String, String)> {
        lock(&self.state).nudges.clone()
    }

    pub fn nudges_to(&self, name: &str) -> Vec<String> {
        lock(&self.state)
            .nudges
            .iter()
            .filter(|(s, _)| s == name)
            .map(|(_, t)| t.clone())
            .collect()
    }

    pub fn set_current(&self, name: Option<&str>) {
        lock(&self.state).current = name.map(str::to_string);
    }

    pub fn attachments(&self) -> Vec<String> {
        lock(&self.state).attachments.clone()
    }

    pub fn fail_start(&self, fail: bool) {
        lock(&self.state).fail_start = fail;
    }

    /// Sessions whose pane runs something other than a shell.
    pub fn agent_count(&self) -> usize {
        lock(&self.state)
            .sessions
            .values()
            .filter(|s| !FAKE_SHELLS.contains(&s.pane.as_str()))
            .count()
    }
}

impl SessionDriver for FakeDriver {
    fn has_session(&self, name: &str) -> anyhow::Result<bool> {
        Ok(self.has(name))
    }

    fn new_session(&self, spec: &StartSpec) -> anyhow::Result<()> {
        let mut state = lock(&self.state);
        if state.fail_start {
            anyhow::bail!("server exited unexpectedly");
        }
        if state.sessions.contains_key(&spec.name) {
            anyhow::bail!("duplicate session: {}", spec.name);
        }
        state.sessions.insert(
            spec.name.clone(),
            FakeSession {
                spec: Some(spec.clone()),
                pane: "claude".into(),
                ..FakeSession::default()
            },
        );
        state.starts += 1;
        self.events.push(format!("session-start {}", spec.name));
        Ok(())
    }

    fn kill_session(&self, name: &str) -> anyhow::Result<()> {
        let mut state = lock(&self.state);
        state.sessions.remove(name);
        state.stops.push(name.to_string());
        self.events.push(format!("session-kill {name}"));
        Ok(())
    }

    fn pane_command(&self, name: &str) -> anyhow::Result<Option<String>> {
        Ok(lock(&self.state).sessions.get(name).map(|s| s.pane.clone()))
    }

    fn capture_pane(&self, name: &str, _lines: usize) -> anyhow::Result<String> {
        match lock(&self.state).sessions.get(name) {
            Some(s) => Ok(s.screen.clone()),
            None => anyhow::bail!("can't find session: {name}"),
        }
    }

    fn send_literal(&self, name: &str, text: &str) -> anyhow::Result<()> {
        match lock(&self.state).sessions.get_mut(name) {
            Some(s) => {
                s.typed.push_str(text);
                Ok(())
            }
            None => anyhow::bail!("can't find session: {name}"),
        }
    }

    fn send_key(&self, name: &str, key: &str) -> anyhow::Result<()> {
        let mut state = lock(&self.state);
        let Some(session) = state.sessions.get_mut(name) else {
            anyhow::bail!("can't find session: {name}");
        };
        let committed = (key == "Enter" && !session.typed.is_empty())
            .then(|| std::mem::take(&mut session.typed));
        state
            .keys
            .entry(name.to_string())
            .or_default()
            .push(key.to_string());
        if let Some(text) = committed {
            state.nudges.push((name.to_string(), text));
            self.events.push(format!("nudge {name}"));
        }
        Ok(())
    }

    fn list_sessions(&self) -> anyhow::Result<Vec<String>> {
        Ok(lock(&self.state).sessions.keys().cloned().collect())
    }

    fn current_session(&self) -> Option<String> {
        lock(&self.state).current.clone()
    }

    fn attach(&self, name: &str) -> anyhow::Result<()> {
        lock(&self.state).attachments.push(format!("attach {name}"));
        Ok(())
    }

    fn switch_client(&self, name: &str) -> anyhow::Result<()> {
        lock(&self.state).attachments.push(format!("switch {name}"));
        Ok(())
    }
}

// --- Polecats ---

#[derive(Debug, Default)]
struct BackendState {
    live: BTreeSet<(String, String)>,
    reserved: BTreeSet<(String, String)>,
    dirty: BTreeSet<(String, String)>,
    removed: Vec<(String, String, bool)>,
    added: Vec<(String, String, Option<String>)>,
    exists_failures: u32,
    broken: BTreeSet<String>,
}

pub struct FakeBackend {
    pool: NamePool,
    root: PathBuf,
    state: Mutex<BackendState>,
    events: EventLog,
}

fn key(rig: &str, name: &str) -> (String, String) {
    (rig.to_string(), name.to_string())
}

impl FakeBackend {
    pub fn new(pool: &[&str]) -> Self {
        let pool: Vec<String> = pool.iter().map(|s| s.to_string()).collect();
        Self {
            pool: NamePool::new(&pool),
            root: PathBuf::from("/town"),
            state: Mutex::new(BackendState::default()),
            events: EventLog::new(),
        }
    }

    pub fn with_root(mut self, root: &Path) -> Self {
        self.root = root.to_path_buf();
        self
    }

    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = events;
        self
    }

    /// A polecat left over from an earlier run.
    pub fn seed(&self, rig: &str, name: &str) {
        lock(&self.state).live.insert(key(rig, name));
    }

    /// Make non-forced removal of this polecat report uncommitted work.
    pub fn mark_dirty(&self, rig: &str, name: &str) {
        lock(&self.state).dirty.insert(key(rig, name));
    }

    /// The next `n` adds lose a race and report `Exists`.
    pub fn fail_adds_with_exists(&self, n: u32) {
        lock(&self.state).exists_failures = n;
    }

    /// Adds of `name` fail with a git error.
    pub fn break_name(&self, name: &str) {
        lock(&self.state).broken.insert(name.to_string());
    }

    /// (rig, name, nuclear) per removal.
    pub fn removed(&self) -> Vec<(String, String, bool)> {
        lock(&self.state).removed.clone()
    }

    /// (rig, name, hook bead) per successful add.
    pub fn added(&self) -> Vec<(String, String, Option<String>)> {
        lock(&self.state).added.clone()
    }

    pub fn reserved(&self, rig: &str) -> Vec<String> {
        lock(&self.state)
            .reserved
            .iter()
            .filter(|(r, _)| r == rig)
            .map(|(_, n)| n.clone())
            .collect()
    }

    fn polecat(&self, rig: &str, name: &str) -> Polecat {
        let local_dir = self.root.join(rig).join("polecats").join(name);
        Polecat {
            rig: rig.to_string(),
            name: name.to_string(),
            clone_path: local_dir.join(rig),
            local_dir,
            remote: None,
            branch: format!("polecat/{name}"),
            session_name: AgentAddress::polecat(rig, name).session_name(),
        }
    }
}

impl PolecatBackend for FakeBackend {
    fn allocate_name(&self, rig: &str) -> Result<String, PolecatError> {
        self.allocate_names(rig, 1)?
            .into_iter()
            .next()
            .ok_or_else(|| PolecatError::UnknownRig(rig.to_string()))
    }

    fn allocate_names(&self, rig: &str, count: usize) -> Result<Vec<String>, PolecatError> {
        let mut state = lock(&self.state);
        let taken: BTreeSet<String> = state
            .live
            .iter()
            .chain(state.reserved.iter())
            .filter(|(r, _)| r == rig)
            .map(|(_, n)| n.clone())
            .collect();
        let names = self.pool.allocate_many(&taken, count.max(1));
        for name in &names {
            state.reserved.insert(key(rig, name));
        }
        Ok(names)
    }

    fn release_name(&self, rig: &str, name: &str) {
        lock(&self.state).reserved.remove(&key(rig, name));
    }

    fn exists(&self, rig: &str, name: &str) -> bool {
        lock(&self.state).live.contains(&key(rig, name))
    }

    fn add(&self, rig: &str, name: &str, opts: &AddOptions) -> Result<Polecat, PolecatError> {
        let mut state = lock(&self.state);
        let exists = || PolecatError::Exists {
            rig: rig.to_string(),
            name: name.to_string(),
        };
        if state.exists_failures > 0 {
            state.exists_failures -= 1;
            return Err(exists());
        }
        if state.live.contains(&key(rig, name)) {
            return Err(exists());
        }
        if state.broken.contains(name) {
            return Err(PolecatError::Git(anyhow::anyhow!(
                "worktree add {name}: fatal: could not lock config file"
            )));
        }
        state.live.insert(key(rig, name));
        state.reserved.remove(&key(rig, name));
        state
            .added
            .push((rig.to_string(), name.to_string(), opts.hook_bead.clone()));
        self.events.push(format!("polecat-add {rig}/{name}"));
        Ok(self.polecat(rig, name))
    }

    fn remove(&self, rig: &str, name: &str, opts: &RemoveOptions) -> Result<(), PolecatError> {
        let mut state = lock(&self.state);
        let k = key(rig, name);
        if !state.live.contains(&k) && !opts.nuclear {
            return Err(PolecatError::NotFound {
                rig: rig.to_string(),
                name: name.to_string(),
            });
        }
        if state.dirty.contains(&k) && !opts.force && !opts.nuclear {
            return Err(PolecatError::UncommittedWork {
                name: name.to_string(),
                work: UncommittedWork {
                    has_changes: true,
                    ..UncommittedWork::default()
                },
            });
        }
        state.live.remove(&k);
        state.dirty.remove(&k);
        state.reserved.remove(&k);
        state
            .removed
            .push((rig.to_string(), name.to_string(), opts.nuclear));
        self.events.push(format!("polecat-remove {rig}/{name}"));
        Ok(())
    }

    fn list(&self, rig: &str) -> Result<Vec<Polecat>, PolecatError> {
        let state = lock(&self.state);
        Ok(state
            .live
            .iter()
            .filter(|(r, _)| r == rig)
            .map(|(r, n)| self.polecat(r, n))
            .collect())
    }
}

// --- Harness ---

/// A temp town wired to the doubles above, all sharing one event log.
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub town: Town,
    pub events: EventLog,
    pub beads: Arc<FakeBeads>,
    pub backend: Arc<FakeBackend>,
    pub driver: Arc<FakeDriver>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(quick_config())
    }

    pub fn with_config(config: TownConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let town = Town::new(dir.path(), config);
        let events = EventLog::new();
        let mut beads = FakeBeads::new().with_events(events.clone());
        for (rig, cfg) in &town.config.rigs {
            beads = beads.with_rig(rig, &cfg.prefix);
        }
        let pool: Vec<&str> = town.config.names.pool.iter().map(String::as_str).collect();
        let backend = FakeBackend::new(&pool)
            .with_root(dir.path())
            .with_events(events.clone());
        Self {
            town,
            beads: Arc::new(beads),
            backend: Arc::new(backend),
            driver: Arc::new(FakeDriver::new().with_events(events.clone())),
            events,
            dir,
        }
    }

    /// Swap in a beads double with extra setup (formulas, more rigs).
    pub fn with_beads(mut self, setup: impl FnOnce(FakeBeads) -> FakeBeads) -> Self {
        let mut beads = FakeBeads::new().with_events(self.events.clone());
        for (rig, cfg) in &self.town.config.rigs {
            beads = beads.with_rig(rig, &cfg.prefix);
        }
        self.beads = Arc::new(setup(beads));
        self
    }

    pub fn sessions(&self) -> SessionFactory {
        SessionFactory::new(&self.town, self.driver.clone())
    }

    pub fn sling(&self) -> Sling {
        Sling::new(
            &self.town,
            self.beads.clone(),
            self.backend.clone(),
            self.sessions(),
        )
    }

    pub fn feed(&self) -> Feed {
        Feed::new(&self.town.feed_path())
    }

    pub fn queue(&self) -> Queue {
        Queue::for_town(&self.town)
    }

    /// Queued bead IDs in order.
    pub fn queued(&self) -> Vec<String> {
        self.queue()
            .load()
            .unwrap()
            .into_iter()
            .map(|i| i.bead_id)
            .collect()
    }

    /// Seed an open task bead.
    pub fn task(&self, id: &str, title: &str) {
        self.beads.insert(bead(id, title, Status::Open, None));
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
