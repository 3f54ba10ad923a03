//! Issue-tracker access.
//!
//! `Beads` wraps the `bd` CLI for one database directory. `RoutedBeads`
//! picks the right database per bead ID through the prefix routes, and is
//! what the rest of the crate talks to via the `BeadStore` trait.

pub mod client;
pub mod fields;
pub mod issue;
pub mod routes;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub use client::Beads;
pub use issue::{Issue, IssueType, Status};
pub use routes::{RouteError, Router, Routes};

use crate::town::Town;

#[derive(Debug, thiserror::Error)]
pub enum BeadsError {
    #[error("bead not found: {0}")]
    NotFound(String),

    #[error("prefix mismatch: '{id}' may only use {allowed}")]
    PrefixMismatch { id: String, allowed: String },

    #[error("beads daemon unreachable: {0}")]
    DaemonUnreachable(String),

    #[error("legacy database, run `bd migrate`: {0}")]
    LegacyDatabase(String),

    #[error("bd {command} failed: {message}")]
    Command { command: String, message: String },

    #[error("parsing bd {command} output: {detail}")]
    Parse {
        command: &'static str,
        detail: String,
    },

    #[error(transparent)]
    Route(#[from] RouteError),
}

impl BeadsError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BeadsError::NotFound(_))
    }
}

/// Which database an operation without a bead ID targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Db {
    Town,
    Rig(String),
}

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Explicit ID; its prefix must be allowed for the target database.
    pub id: Option<String>,
    /// Generate the next ID under this prefix instead of the default one.
    pub prefix: Option<String>,
    pub title: String,
    pub description: String,
    pub issue_type: IssueType,
    pub priority: Option<i32>,
    pub labels: Vec<String>,
    pub assignee: Option<String>,
    pub parent: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    pub status: Option<Status>,
    /// `Some("")` clears the assignee.
    pub assignee: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<i32>,
    pub add_labels: Vec<String>,
    pub remove_labels: Vec<String>,
}

impl UpdateOptions {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.assignee.is_none()
            && self.title.is_none()
            && self.description.is_none()
            && self.priority.is_none()
            && self.add_labels.is_empty()
            && self.remove_labels.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub status: Option<Status>,
    pub issue_type: Option<IssueType>,
    pub assignee: Option<String>,
    pub label: Option<String>,
    pub parent: Option<String>,
    /// Include closed beads.
    pub all: bool,
}

/// The issue-tracker operations the dispatch core depends on.
pub trait BeadStore: Send + Sync {
    fn show(&self, id: &str) -> Result<Issue, BeadsError>;
    fn create(&self, db: &Db, opts: &CreateOptions) -> Result<Issue, BeadsError>;
    fn update(&self, id: &str, opts: &UpdateOptions) -> Result<(), BeadsError>;
    fn list(&self, db: &Db, opts: &ListOptions) -> Result<Vec<Issue>, BeadsError>;
    fn close(&self, id: &str, reason: Option<&str>) -> Result<(), BeadsError>;
    fn add_dependency(&self, issue: &str, depends_on: &str, dep_type: &str)
        -> Result<(), BeadsError>;
    /// Beads with a `dep_type` edge pointing at `id`.
    fn dependents(&self, id: &str, dep_type: &str) -> Result<Vec<Issue>, BeadsError>;
    fn label_add(&self, id: &str, label: &str) -> Result<(), BeadsError>;
    fn label_remove(&self, id: &str, label: &str) -> Result<(), BeadsError>;
    fn formula_exists(&self, db: &Db, formula: &str) -> Result<bool, BeadsError>;
    fn cook_formula(&self, db: &Db, formula: &str) -> Result<(), BeadsError>;
    /// Instantiate a wisp from a cooked formula; returns the root bead ID.
    fn instantiate_wisp(
        &self,
        db: &Db,
        formula: &str,
        vars: &[(String, String)],
    ) -> Result<String, BeadsError>;
    fn merge_slot_acquire(&self, db: &Db, holder: &str) -> Result<bool, BeadsError>;
    fn merge_slot_release(&self, db: &Db, holder: &str) -> Result<(), BeadsError>;

    fn try_show(&self, id: &str) -> Result<Option<Issue>, BeadsError> {
        match self.show(id) {
            Ok(issue) => Ok(Some(issue)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// `BeadStore` over the real databases of a town.
#[derive(Debug, Clone)]
pub struct RoutedBeads {
    town_root: PathBuf,
    rig_prefixes: BTreeMap<String, String>,
    program: String,
}

impl RoutedBeads {
    pub fn new(town: &Town) -> Self {
        Self {
            town_root: town.root.clone(),
            rig_prefixes: town
                .config
                .rigs
                .iter()
                .map(|(name, rig)| (name.clone(), rig.prefix.clone()))
                .collect(),
            program: client::BD.to_string(),
        }
    }

    pub fn with_program(mut self, program: &str) -> Self {
        self.program = program.to_string();
        self
    }

    pub fn town_root(&self) -> &Path {
        &self.town_root
    }

    /// Client bound to the database that holds `id`.
    pub fn client_for_id(&self, id: &str) -> Result<Beads, BeadsError> {
        let beads_dir = Router.resolve_id(&self.town_root, id)?;
        let prefix = issue::id_prefix(id)
            .map(|p| p.trim_end_matches('-'))
            .unwrap_or(routes::TOWN_ROUTE.trim_end_matches('-'));
        Ok(Beads::at(&beads_dir, &self.town_root, prefix, prefix != "hq").with_program(&self.program))
    }

    pub fn client_for_db(&self, db: &Db) -> Result<Beads, BeadsError> {
        match db {
            Db::Town => Ok(Beads::town(&self.town_root).with_program(&self.program)),
            Db::Rig(rig) => {
                let prefix = self.rig_prefixes.get(rig).ok_or_else(|| {
                    BeadsError::Route(RouteError::RouteNotFound { id: rig.clone() })
                })?;
                let beads_dir = Router.resolve_prefix(&self.town_root, &format!("{prefix}-"))?;
                Ok(Beads::at(&beads_dir, &self.town_root, prefix, true).with_program(&self.program))
            }
        }
    }
}

impl BeadStore for RoutedBeads {
    fn show(&self, id: &str) -> Result<Issue, BeadsError> {
        self.client_for_id(id)?.show(id)
    }

    fn create(&self, db: &Db, opts: &CreateOptions) -> Result<Issue, BeadsError> {
        let client = self.client_for_db(db)?;
        match (&opts.id, &opts.prefix) {
            (Some(id), _) => client.create_with_id(id, opts),
            (None, Some(prefix)) => client.create_with_prefix(prefix, opts),
            (None, None) => client.create(opts),
        }
    }

    fn update(&self, id: &str, opts: &UpdateOptions) -> Result<(), BeadsError> {
        self.client_for_id(id)?.update(id, opts)
    }

    fn list(&self, db: &Db, opts: &ListOptions) -> Result<Vec<Issue>, BeadsError> {
        self.client_for_db(db)?.list(opts)
    }

    fn close(&self, id: &str, reason: Option<&str>) -> Result<(), BeadsError> {
        self.client_for_id(id)?.close(id, reason)
    }

    fn add_dependency(&self, issue: &str, depends_on: &str, dep_type: &str) -> Result<(), BeadsError> {
        self.client_for_id(issue)?
            .add_dependency(issue, depends_on, dep_type)
    }

    fn dependents(&self, id: &str, dep_type: &str) -> Result<Vec<Issue>, BeadsError> {
        // Edges live in the database of the bead that owns them, which for
        // convoys is the town database.
        let own = self.client_for_id(id)?;
        let mut found = own.dependents(id, dep_type)?;
        let town = Beads::town(&self.town_root).with_program(&self.program);
        if town.beads_dir() != own.beads_dir() {
            for issue in town.dependents(id, dep_type)? {
                if !found.iter().any(|f| f.id == issue.id) {
                    found.push(issue);
                }
            }
        }
        Ok(found)
    }

    fn label_add(&self, id: &str, label: &str) -> Result<(), BeadsError> {
        self.client_for_id(id)?.label_add(id, label)
    }

    fn label_remove(&self, id: &str, label: &str) -> Result<(), BeadsError> {
        self.client_for_id(id)?.label_remove(id, label)
    }

    fn formula_exists(&self, db: &Db, formula: &str) -> Result<bool, BeadsError> {
        self.client_for_db(db)?.formula_exists(formula)
    }

    fn cook_formula(&self, db: &Db, formula: &str) -> Result<(), BeadsError> {
        self.client_for_db(db)?.cook(formula)
    }

    fn instantiate_wisp(
        &self,
        db: &Db,
        formula: &str,
        vars: &[(String, String)],
    ) -> Result<String, BeadsError> {
        self.client_for_db(db)?.wisp(formula, vars)
    }

    fn merge_slot_acquire(&self, db: &Db, holder: &str) -> Result<bool, BeadsError> {
        let client = self.client_for_db(db)?;
        client.merge_slot_ensure_exists()?;
        Ok(client.merge_slot_acquire(holder)?.acquired)
    }

    fn merge_slot_release(&self, db: &Db, holder: &str) -> Result<(), BeadsError> {
        self.client_for_db(db)?.merge_slot_release(holder)
    }
}
