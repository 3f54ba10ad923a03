//! Git-worktree polecats, local or on an SSH host.
//!
//! Layout per polecat: the worktree at `<rig>/polecats/<name>/<rig>` (under
//! the remote town root for SSH rigs) on branch `polecat/<name>`, and a local
//! `<rig>/polecats/<name>/` directory holding a `.beads/redirect` to the
//! rig's canonical database. Name allocation reads the local directories;
//! for SSH rigs `exists` does too.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::names::{NamePool, live_names};
use super::{AddOptions, Polecat, PolecatBackend, PolecatError, RemoveOptions};
use crate::address::AgentAddress;
use crate::beads::client::agent_issue_title;
use crate::beads::fields::{AgentFields, clear_hook_bead, set_agent_fields};
use crate::beads::routes::{normalize, relative_path, resolve_dir, write_redirect};
use crate::beads::{BeadStore, CreateOptions, Db, IssueType, Status, UpdateOptions};
use crate::git::Git;
use crate::shell::validate_name;
use crate::subprocess::Runner;
use crate::town::Town;

/// Where one polecat's pieces live.
struct Layout {
    runner: Runner,
    repo: PathBuf,
    clone: PathBuf,
    local_dir: PathBuf,
    default_branch: String,
}

pub struct WorktreeBackend {
    town: Town,
    beads: Arc<dyn BeadStore>,
    pool: NamePool,
    /// Names handed out by this process that may not have a directory yet.
    reserved: Mutex<BTreeMap<String, BTreeSet<String>>>,
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> PolecatError + '_ {
    move |source| PolecatError::Io {
        path: path.to_path_buf(),
        source,
    }
}

pub fn branch_name(name: &str) -> String {
    format!("polecat/{name}")
}

impl WorktreeBackend {
    pub fn new(town: &Town, beads: Arc<dyn BeadStore>) -> Self {
        Self {
            pool: NamePool::new(&town.config.names.pool),
            town: town.clone(),
            beads,
            reserved: Mutex::new(BTreeMap::new()),
        }
    }

    fn layout(&self, rig: &str, name: &str) -> Result<Layout, PolecatError> {
        let cfg = self
            .town
            .rig(rig)
            .ok_or_else(|| PolecatError::UnknownRig(rig.to_string()))?;
        let local_dir = self.town.polecats_dir(rig).join(name);
        let (runner, root) = match &cfg.ssh {
            Some(target) => (
                Runner::ssh(target.as_str()),
                cfg.remote_root
                    .clone()
                    .unwrap_or_else(|| self.town.root.clone()),
            ),
            None => (Runner::Local, self.town.root.clone()),
        };
        let rig_dir = root.join(rig);
        Ok(Layout {
            runner,
            repo: rig_dir.join(&cfg.repo),
            clone: rig_dir.join("polecats").join(name).join(rig),
            local_dir,
            default_branch: cfg.default_branch.clone(),
        })
    }

    fn reserve(&self, rig: &str, names: &[String]) {
        if let Ok(mut reserved) = self.reserved.lock() {
            reserved
                .entry(rig.to_string())
                .or_default()
                .extend(names.iter().cloned());
        }
    }

    fn polecat(&self, rig: &str, name: &str, layout: &Layout) -> Polecat {
        Polecat {
            rig: rig.to_string(),
            name: name.to_string(),
            clone_path: layout.clone.clone(),
            local_dir: layout.local_dir.clone(),
            remote: match &layout.runner {
                Runner::Ssh { target } => Some(target.clone()),
                Runner::Local => None,
            },
            branch: branch_name(name),
            session_name: self.session_name(rig, name),
        }
    }

    /// Point `<local_dir>/.beads/redirect` at the rig's canonical database.
    fn link_beads(&self, rig: &str, local_dir: &Path) -> Result<(), PolecatError> {
        let canonical = resolve_dir(&self.town.rig_dir(rig)).map_err(crate::beads::BeadsError::from)?;
        let target = relative_path(&normalize(local_dir), &normalize(&canonical));
        write_redirect(local_dir, &target.to_string_lossy()).map_err(crate::beads::BeadsError::from)?;
        Ok(())
    }

    /// Create the agent bead, or reopen and refresh the existing one, with
    /// the hook written in the same call.
    fn ensure_agent_bead(&self, rig: &str, name: &str, hook: Option<&str>) -> Result<(), PolecatError> {
        let addr = AgentAddress::polecat(rig, name);
        let id = self.town.agent_bead_id(&addr);
        let fields = AgentFields {
            role_type: Some("polecat".into()),
            rig: Some(rig.to_string()),
            agent_state: Some("spawning".into()),
            hook_bead: hook.map(str::to_string),
            ..Default::default()
        };
        match self.beads.try_show(&id)? {
            Some(existing) => {
                let mut description = set_agent_fields(&existing.description, &fields);
                if hook.is_none() {
                    description = clear_hook_bead(&description);
                }
                let update = UpdateOptions {
                    status: (existing.status == Status::Closed).then_some(Status::Open),
                    description: Some(description),
                    ..Default::default()
                };
                self.beads.update(&id, &update)?;
                tracing::debug!(agent = %addr, bead = %id, "reopened agent bead");
            }
            None => {
                let create = CreateOptions {
                    id: Some(id.clone()),
                    title: agent_issue_title(&addr.to_string()),
                    description: set_agent_fields("", &fields),
                    issue_type: IssueType::Agent,
                    ..Default::default()
                };
                self.beads.create(&Db::Rig(rig.to_string()), &create)?;
                tracing::debug!(agent = %addr, bead = %id, "created agent bead");
            }
        }
        Ok(())
    }

    fn make_parent(&self, layout: &Layout) -> Result<(), PolecatError> {
        let Some(parent) = layout.clone.parent() else {
            return Ok(());
        };
        match &layout.runner {
            Runner::Local => fs::create_dir_all(parent).map_err(io_err(parent)),
            remote => remote
                .run(None, "mkdir", &["-p", &*parent.to_string_lossy()])
                .map(drop)
                .map_err(PolecatError::Git),
        }
    }

    fn remove_worktree(&self, layout: &Layout, name: &str, nuclear: bool) -> Result<(), PolecatError> {
        let repo = Git::new(layout.runner.clone(), &layout.repo);
        if let Err(e) = repo.worktree_remove(&layout.clone, true) {
            if !nuclear {
                return Err(PolecatError::Git(e));
            }
            tracing::warn!(polecat = name, error = %format!("{e:#}"), "worktree remove failed, pruning anyway");
            if layout.runner == Runner::Local && layout.clone.exists() {
                fs::remove_dir_all(&layout.clone).map_err(io_err(&layout.clone))?;
            }
        }
        repo.worktree_prune().map_err(PolecatError::Git)?;
        if let Err(e) = repo.delete_branch(&branch_name(name), true) {
            tracing::debug!(polecat = name, error = %format!("{e:#}"), "no branch to delete");
        }
        Ok(())
    }
}

impl PolecatBackend for WorktreeBackend {
    fn allocate_name(&self, rig: &str) -> Result<String, PolecatError> {
        self.allocate_names(rig, 1)?
            .into_iter()
            .next()
            .ok_or_else(|| PolecatError::UnknownRig(rig.to_string()))
    }

    fn allocate_names(&self, rig: &str, count: usize) -> Result<Vec<String>, PolecatError> {
        if !self.town.has_rig(rig) {
            return Err(PolecatError::UnknownRig(rig.to_string()));
        }
        // Allocation and reservation under one lock so concurrent callers in
        // this process never see the same free name.
        let mut reserved = self
            .reserved
            .lock()
            .map_err(|_| PolecatError::Git(anyhow::anyhow!("name reservation lock poisoned")))?;
        let mut taken = live_names(&self.town.polecats_dir(rig));
        if let Some(names) = reserved.get(rig) {
            taken.extend(names.iter().cloned());
        }
        let names = self.pool.allocate_many(&taken, count.max(1));
        reserved
            .entry(rig.to_string())
            .or_default()
            .extend(names.iter().cloned());
        Ok(names)
    }

    fn release_name(&self, rig: &str, name: &str) {
        if let Ok(mut reserved) = self.reserved.lock()
            && let Some(names) = reserved.get_mut(rig)
        {
            names.remove(name);
        }
    }

    fn exists(&self, rig: &str, name: &str) -> bool {
        match self.layout(rig, name) {
            Ok(layout) if layout.runner.is_remote() => layout.local_dir.is_dir(),
            Ok(layout) => layout.clone.is_dir(),
            Err(_) => false,
        }
    }

    fn add(&self, rig: &str, name: &str, opts: &AddOptions) -> Result<Polecat, PolecatError> {
        validate_name("polecat name", name)?;
        let layout = self.layout(rig, name)?;
        if self.exists(rig, name) {
            return Err(PolecatError::Exists {
                rig: rig.to_string(),
                name: name.to_string(),
            });
        }
        self.reserve(rig, &[name.to_string()]);

        let repo = Git::new(layout.runner.clone(), &layout.repo);
        let start_point = match repo.fetch("origin") {
            Ok(()) => format!("origin/{}", layout.default_branch),
            Err(e) => {
                tracing::debug!(rig, error = %format!("{e:#}"), "fetch failed, branching from local ref");
                layout.default_branch.clone()
            }
        };
        let branch = branch_name(name);
        // A branch left behind by a crashed polecat of the same name.
        if repo
            .list_branches(&branch)
            .map_err(PolecatError::Git)?
            .contains(&branch)
        {
            repo.delete_branch(&branch, true).map_err(PolecatError::Git)?;
        }

        self.make_parent(&layout)?;
        if let Err(e) = repo.worktree_add(&layout.clone, &branch, &start_point) {
            let message = format!("{e:#}");
            if message.contains("already exists") {
                return Err(PolecatError::Exists {
                    rig: rig.to_string(),
                    name: name.to_string(),
                });
            }
            return Err(PolecatError::Git(e));
        }
        fs::create_dir_all(&layout.local_dir).map_err(io_err(&layout.local_dir))?;

        if let Err(e) = self.link_beads(rig, &layout.local_dir) {
            tracing::warn!(rig, polecat = name, error = %e, "could not link polecat to rig beads");
        }

        if let Err(e) = self.ensure_agent_bead(rig, name, opts.hook_bead.as_deref()) {
            // No agent bead means nothing tracks this worktree: undo it.
            let _ = self.remove_worktree(&layout, name, true);
            let _ = fs::remove_dir_all(&layout.local_dir);
            return Err(e);
        }

        tracing::info!(rig, polecat = name, path = %layout.clone.display(), "polecat created");
        Ok(self.polecat(rig, name, &layout))
    }

    fn remove(&self, rig: &str, name: &str, opts: &RemoveOptions) -> Result<(), PolecatError> {
        let layout = self.layout(rig, name)?;
        if !opts.nuclear && !self.exists(rig, name) {
            return Err(PolecatError::NotFound {
                rig: rig.to_string(),
                name: name.to_string(),
            });
        }
        if !opts.nuclear && !opts.force {
            let work = Git::new(layout.runner.clone(), &layout.clone)
                .check_uncommitted_work()
                .map_err(PolecatError::Git)?;
            if !work.is_clean() {
                return Err(PolecatError::UncommittedWork {
                    name: name.to_string(),
                    work,
                });
            }
        }

        self.remove_worktree(&layout, name, opts.nuclear)?;
        if layout.local_dir.exists() {
            fs::remove_dir_all(&layout.local_dir).map_err(io_err(&layout.local_dir))?;
        }
        self.release_name(rig, name);

        let agent_id = self.town.agent_bead_id(&AgentAddress::polecat(rig, name));
        if let Err(e) = self.beads.close(&agent_id, Some("polecat removed"))
            && !e.is_not_found()
        {
            tracing::warn!(bead = %agent_id, error = %e, "could not close agent bead");
        }
        tracing::info!(rig, polecat = name, nuclear = opts.nuclear, "polecat removed");
        Ok(())
    }

    fn list(&self, rig: &str) -> Result<Vec<Polecat>, PolecatError> {
        if !self.town.has_rig(rig) {
            return Err(PolecatError::UnknownRig(rig.to_string()));
        }
        live_names(&self.town.polecats_dir(rig))
            .into_iter()
            .map(|name| {
                let layout = self.layout(rig, &name)?;
                Ok(self.polecat(rig, &name, &layout))
            })
            .collect()
    }
}
