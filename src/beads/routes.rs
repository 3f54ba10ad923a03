//! Prefix routing: which `.beads/` database holds a given bead.
//!
//! `<town>/.beads/routes.jsonl` maps ID prefixes to directories relative to
//! the town root. A directory's `.beads/` may hold a one-line `redirect` to
//! the canonical database; exactly one hop is followed.

use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::TownConfig;

pub const ROUTES_FILE: &str = "routes.jsonl";
pub const REDIRECT_FILE: &str = "redirect";
pub const TOWN_ROUTE: &str = "hq-";
pub const CONVOY_ROUTE: &str = "hq-cv-";

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("no route matches bead '{id}'")]
    RouteNotFound { id: String },

    #[error("redirect loop: {} redirects again (only one hop is followed)", .path.display())]
    RedirectLoop { path: PathBuf },

    #[error("no .beads directory at or above {}", .0.display())]
    NoBeadsDir(PathBuf),

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}:{line}: {detail}", .path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        detail: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub prefix: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Routes {
    pub routes: Vec<Route>,
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> RouteError + '_ {
    move |source| RouteError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl Routes {
    pub fn file(town_root: &Path) -> PathBuf {
        town_root.join(".beads").join(ROUTES_FILE)
    }

    /// The two routes every town needs.
    pub fn with_defaults() -> Self {
        let mut routes = Self::default();
        routes.upsert(TOWN_ROUTE, ".");
        routes.upsert(CONVOY_ROUTE, ".");
        routes
    }

    /// Load the town's routes; a missing file is an empty table.
    pub fn load(town_root: &Path) -> Result<Self, RouteError> {
        let path = Self::file(town_root);
        match fs::read_to_string(&path) {
            Ok(contents) => Self::parse(&contents, &path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(io_err(&path)(e)),
        }
    }

    pub fn parse(contents: &str, path: &Path) -> Result<Self, RouteError> {
        let mut routes = Vec::new();
        for (idx, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let route: Route = serde_json::from_str(line).map_err(|e| RouteError::Parse {
                path: path.to_path_buf(),
                line: idx + 1,
                detail: e.to_string(),
            })?;
            routes.push(route);
        }
        Ok(Self { routes })
    }

    /// One object per line with a trailing newline, written atomically.
    pub fn save(&self, town_root: &Path) -> Result<(), RouteError> {
        let path = Self::file(town_root);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        let mut out = String::new();
        for route in &self.routes {
            let line = serde_json::to_string(route).map_err(|e| RouteError::Parse {
                path: path.clone(),
                line: 0,
                detail: e.to_string(),
            })?;
            out.push_str(&line);
            out.push('\n');
        }
        let tmp = path.with_extension("jsonl.tmp");
        fs::write(&tmp, out).map_err(io_err(&tmp))?;
        fs::rename(&tmp, &path).map_err(io_err(&path))
    }

    /// Insert or repoint a route. Returns true if anything changed.
    pub fn upsert(&mut self, prefix: &str, path: &str) -> bool {
        if let Some(existing) = self.routes.iter_mut().find(|r| r.prefix == prefix) {
            if existing.path == path {
                return false;
            }
            existing.path = path.to_string();
            return true;
        }
        self.routes.push(Route {
            prefix: prefix.to_string(),
            path: path.to_string(),
        });
        true
    }

    /// Longest route prefix that `id` starts with.
    pub fn longest_match(&self, id: &str) -> Option<&Route> {
        self.routes
            .iter()
            .filter(|r| id.starts_with(&r.prefix))
            .max_by_key(|r| r.prefix.len())
    }

    pub fn for_prefix(&self, prefix: &str) -> Option<&Route> {
        self.routes.iter().find(|r| r.prefix == prefix)
    }

    /// Add the mandatory routes and one route per configured rig.
    /// Returns the number of routes added or changed.
    pub fn sync_rigs(&mut self, config: &TownConfig) -> usize {
        let mut changed = 0;
        for (prefix, path) in [(TOWN_ROUTE, "."), (CONVOY_ROUTE, ".")] {
            if self.for_prefix(prefix).is_none() && self.upsert(prefix, path) {
                changed += 1;
            }
        }
        for (name, rig) in &config.rigs {
            if self.upsert(&format!("{}-", rig.prefix), name) {
                changed += 1;
            }
        }
        changed
    }

    /// Problems with this table for the town at `town_root`.
    pub fn validate(&self, town_root: &Path, config: &TownConfig) -> Vec<String> {
        let mut problems = Vec::new();
        for (prefix, name) in [(TOWN_ROUTE, "town"), (CONVOY_ROUTE, "convoy")] {
            match self.for_prefix(prefix) {
                Some(r) if r.path == "." => {}
                Some(r) => problems.push(format!(
                    "{name} route {prefix} must map to '.', found '{}'",
                    r.path
                )),
                None => problems.push(format!("missing {name} route {prefix} -> .")),
            }
        }
        for route in &self.routes {
            if escapes_root(Path::new(&route.path)) {
                problems.push(format!(
                    "route {} -> {} escapes the town root",
                    route.prefix, route.path
                ));
            }
        }
        for (name, rig) in &config.rigs {
            let prefix = format!("{}-", rig.prefix);
            let Some(route) = self.for_prefix(&prefix) else {
                problems.push(format!("rig {name}: no route for prefix {prefix}"));
                continue;
            };
            if escapes_root(Path::new(&route.path)) {
                continue;
            }
            if let Err(e) = resolve_dir(&town_root.join(&route.path)) {
                problems.push(format!("rig {name}: route {prefix} -> {}: {e}", route.path));
            }
        }
        problems
    }
}

/// Does a route path leave the directory it is relative to?
fn escapes_root(path: &Path) -> bool {
    if path.is_absolute() {
        return true;
    }
    let mut depth: i32 = 0;
    for component in path.components() {
        match component {
            Component::ParentDir => depth -= 1,
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => return true,
        }
        if depth < 0 {
            return true;
        }
    }
    false
}

/// Lexically resolve `.` and `..` without touching the filesystem.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Resolve `dir/.beads`, following at most one redirect.
///
/// Returns the canonical `.beads` directory.
pub fn resolve_dir(dir: &Path) -> Result<PathBuf, RouteError> {
    let beads = dir.join(".beads");
    let redirect = beads.join(REDIRECT_FILE);
    if redirect.is_file() {
        let target = read_redirect(&redirect)?;
        let resolved = normalize(&dir.join(target));
        if resolved.join(REDIRECT_FILE).is_file() {
            return Err(RouteError::RedirectLoop { path: resolved });
        }
        if !resolved.is_dir() {
            return Err(RouteError::NoBeadsDir(resolved));
        }
        return Ok(resolved);
    }
    if beads.is_dir() {
        return Ok(beads);
    }
    Err(RouteError::NoBeadsDir(dir.to_path_buf()))
}

fn read_redirect(path: &Path) -> Result<String, RouteError> {
    let contents = fs::read_to_string(path).map_err(io_err(path))?;
    let target = contents.lines().next().unwrap_or("").trim().to_string();
    if target.is_empty() {
        return Err(RouteError::Parse {
            path: path.to_path_buf(),
            line: 1,
            detail: "empty redirect".into(),
        });
    }
    Ok(target)
}

/// Write `dir/.beads/redirect` pointing at `canonical_beads`, relative to `dir`.
pub fn write_redirect(dir: &Path, relative_target: &str) -> Result<(), RouteError> {
    let beads = dir.join(".beads");
    fs::create_dir_all(&beads).map_err(io_err(&beads))?;
    let path = beads.join(REDIRECT_FILE);
    fs::write(&path, format!("{relative_target}\n")).map_err(io_err(&path))
}

/// Relative path from `from` to `to`; both must be lexically normalized and
/// share a common ancestor.
pub fn relative_path(from: &Path, to: &Path) -> PathBuf {
    let from: Vec<_> = from.components().collect();
    let to: Vec<_> = to.components().collect();
    let common = from
        .iter()
        .zip(to.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let mut out = PathBuf::new();
    for _ in common..from.len() {
        out.push("..");
    }
    for c in &to[common..] {
        out.push(c.as_os_str());
    }
    out
}

/// Stateless resolver from a starting directory.
///
/// Only the starting directory and the route table are consulted; any
/// beads-directory environment override is ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct Router;

impl Router {
    /// Nearest ancestor of `start` (inclusive) with a routes table.
    pub fn find_town(start: &Path) -> Option<PathBuf> {
        start
            .ancestors()
            .find(|p| Routes::file(p).is_file())
            .map(Path::to_path_buf)
    }

    /// `.beads` directory holding bead `id`, routing from `start`.
    pub fn resolve_id(&self, start: &Path, id: &str) -> Result<PathBuf, RouteError> {
        let town_root = Self::find_town(start).ok_or_else(|| RouteError::RouteNotFound {
            id: id.to_string(),
        })?;
        let routes = Routes::load(&town_root)?;
        let route = routes
            .longest_match(id)
            .ok_or_else(|| RouteError::RouteNotFound { id: id.to_string() })?;
        tracing::debug!(bead = id, prefix = %route.prefix, path = %route.path, "routed");
        resolve_dir(&normalize(&town_root.join(&route.path)))
    }

    /// `.beads` directory registered for a prefix such as `gp-`.
    pub fn resolve_prefix(&self, start: &Path, prefix: &str) -> Result<PathBuf, RouteError> {
        let town_root = Self::find_town(start).ok_or_else(|| RouteError::RouteNotFound {
            id: prefix.to_string(),
        })?;
        let routes = Routes::load(&town_root)?;
        let route = routes
            .for_prefix(prefix)
            .ok_or_else(|| RouteError::RouteNotFound {
                id: prefix.to_string(),
            })?;
        resolve_dir(&normalize(&town_root.join(&route.path)))
    }

    /// Nearest `.beads` at or above `start`, for operations with no bead ID.
    pub fn resolve_nearest(&self, start: &Path) -> Result<PathBuf, RouteError> {
        let dir = start
            .ancestors()
            .find(|p| p.join(".beads").is_dir())
            .ok_or_else(|| RouteError::NoBeadsDir(start.to_path_buf()))?;
        resolve_dir(dir)
    }
}
