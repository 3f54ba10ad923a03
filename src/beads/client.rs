//! `bd` CLI client bound to one database directory.
//!
//! Commands run with the database's home directory as cwd. Beads-directory
//! environment overrides are removed from the child so routing cannot be
//! defeated by an inherited variable.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::issue::{Issue, id_prefix, parse_list, parse_show};
use super::routes::resolve_dir;
use super::{BeadsError, CreateOptions, ListOptions, UpdateOptions};
use crate::subprocess::{RunOutput, Tool};

pub const BD: &str = "bd";
const TOWN_PREFIX: &str = "hq";
pub const ENV_OVERRIDES: &[&str] = &["BEADS_DIR", "BEADS_DB"];

#[derive(Debug, Clone)]
pub struct Beads {
    beads_dir: PathBuf,
    town_root: PathBuf,
    prefix: String,
    bound: bool,
    program: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct MergeSlotStatus {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub available: bool,
    #[serde(default)]
    pub holder: Option<String>,
    #[serde(default)]
    pub waiters: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct MergeSlotAcquire {
    #[serde(default)]
    pub acquired: bool,
    #[serde(default)]
    pub holder: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Default)]
pub struct DaemonStatus {
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonHealth {
    pub healthy: bool,
    pub detail: String,
}

#[derive(Debug, Deserialize)]
struct WispCreated {
    #[serde(alias = "new_epic_id", alias = "id")]
    root_id: String,
}

impl Beads {
    /// Client for the town database.
    pub fn town(town_root: &Path) -> Self {
        Self::at(&town_root.join(".beads"), town_root, TOWN_PREFIX, false)
    }

    /// Client for a rig's database, resolving its redirect.
    pub fn bound(town_root: &Path, rig_dir: &Path, prefix: &str) -> Result<Self, BeadsError> {
        let beads_dir = resolve_dir(rig_dir)?;
        Ok(Self::at(&beads_dir, town_root, prefix, true))
    }

    pub fn at(beads_dir: &Path, town_root: &Path, prefix: &str, bound: bool) -> Self {
        Self {
            beads_dir: beads_dir.to_path_buf(),
            town_root: town_root.to_path_buf(),
            prefix: prefix.trim_end_matches('-').to_string(),
            bound,
            program: BD.to_string(),
        }
    }

    pub fn with_program(mut self, program: &str) -> Self {
        self.program = program.to_string();
        self
    }

    pub fn beads_dir(&self) -> &Path {
        &self.beads_dir
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The directory `bd` runs in: the parent of the `.beads` directory.
    pub fn work_dir(&self) -> &Path {
        self.beads_dir.parent().unwrap_or(&self.beads_dir)
    }

    fn tool(&self, args: &[&str]) -> Tool {
        let mut tool = Tool::new(&self.program)
            .args(args)
            .current_dir(self.work_dir());
        for key in ENV_OVERRIDES {
            tool = tool.env_remove(key);
        }
        tool
    }

    /// Run `bd`, mapping failures onto `BeadsError`. `subject` names the bead
    /// for not-found errors.
    fn run(&self, subject: &str, args: &[&str]) -> Result<RunOutput, BeadsError> {
        let command = args.first().copied().unwrap_or("");
        let out = self.tool(args).run().map_err(|e| BeadsError::Command {
            command: command.to_string(),
            message: format!("{e:#}"),
        })?;
        if out.success() {
            Ok(out)
        } else {
            Err(classify(command, subject, &out))
        }
    }

    // --- Create ---

    /// Create with the database's default prefix.
    pub fn create(&self, opts: &CreateOptions) -> Result<Issue, BeadsError> {
        self.create_inner(opts, &[])
    }

    /// Create with an explicit ID. The prefix must be the town prefix, or this
    /// client's rig prefix when bound to a rig.
    pub fn create_with_id(&self, id: &str, opts: &CreateOptions) -> Result<Issue, BeadsError> {
        let prefix = id_prefix(id).map(|p| p.trim_end_matches('-')).unwrap_or("");
        if prefix == TOWN_PREFIX {
            if self.bound {
                return Beads::town(&self.town_root)
                    .with_program(&self.program)
                    .create_inner(opts, &["--id", id]);
            }
            return self.create_inner(opts, &["--id", id]);
        }
        if self.bound && prefix == self.prefix {
            return self.create_inner(opts, &["--id", id]);
        }
        let allowed = if self.bound {
            format!("{}- or {TOWN_PREFIX}-", self.prefix)
        } else {
            format!("{TOWN_PREFIX}-")
        };
        Err(BeadsError::PrefixMismatch {
            id: id.to_string(),
            allowed,
        })
    }

    /// Let the daemon pick the next numeric suffix under `prefix`.
    pub fn create_with_prefix(&self, prefix: &str, opts: &CreateOptions) -> Result<Issue, BeadsError> {
        let prefix = prefix.trim_end_matches('-');
        self.create_inner(opts, &["--prefix", prefix])
    }

    fn create_inner(&self, opts: &CreateOptions, extra: &[&str]) -> Result<Issue, BeadsError> {
        let issue_type = opts.issue_type.as_str();
        let priority = opts.priority.map(|p| p.to_string());
        let labels = opts.labels.join(",");
        let mut args = vec!["create", "--title", opts.title.as_str(), "--type", issue_type];
        if !opts.description.is_empty() {
            args.extend(["--description", opts.description.as_str()]);
        }
        if let Some(ref p) = priority {
            args.extend(["--priority", p.as_str()]);
        }
        if !labels.is_empty() {
            args.extend(["--labels", labels.as_str()]);
        }
        if let Some(ref a) = opts.assignee {
            args.extend(["--assignee", a.as_str()]);
        }
        if let Some(ref p) = opts.parent {
            args.extend(["--parent", p.as_str()]);
        }
        args.extend(extra);
        args.push("--json");
        let out = self.run(&opts.title, &args)?;
        parse_show(&out.stdout)?.ok_or_else(|| BeadsError::Parse {
            command: "create",
            detail: "no issue in output".into(),
        })
    }

    // --- Read ---

    pub fn show(&self, id: &str) -> Result<Issue, BeadsError> {
        let out = self.run(id, &["show", id, "--json"])?;
        // With the daemon disabled, a missing bead can exit 0 with no output.
        parse_show(&out.stdout)?.ok_or_else(|| BeadsError::NotFound(id.to_string()))
    }

    pub fn list(&self, opts: &ListOptions) -> Result<Vec<Issue>, BeadsError> {
        let status = opts.status.map(|s| s.as_str());
        let issue_type = opts.issue_type.map(|t| t.as_str());
        let mut args = vec!["list", "--json", "--limit", "0"];
        if let Some(s) = status {
            args.extend(["--status", s]);
        }
        if let Some(t) = issue_type {
            args.extend(["--type", t]);
        }
        if let Some(ref a) = opts.assignee {
            args.extend(["--assignee", a.as_str()]);
        }
        if let Some(ref l) = opts.label {
            args.extend(["--label", l.as_str()]);
        }
        if let Some(ref p) = opts.parent {
            args.extend(["--parent", p.as_str()]);
        }
        if opts.all {
            args.push("--all");
        }
        let out = self.run("", &args)?;
        parse_list(&out.stdout)
    }

    pub fn dependents(&self, id: &str, dep_type: &str) -> Result<Vec<Issue>, BeadsError> {
        let out = self.run(
            id,
            &["dep", "list", id, "--direction", "up", "--type", dep_type, "--json"],
        )?;
        parse_list(&out.stdout)
    }

    // --- Write ---

    pub fn update(&self, id: &str, opts: &UpdateOptions) -> Result<(), BeadsError> {
        if opts.is_empty() {
            return Ok(());
        }
        let status = opts.status.map(|s| s.as_str());
        let priority = opts.priority.map(|p| p.to_string());
        let mut args = vec!["update", id];
        if let Some(s) = status {
            args.extend(["--status", s]);
        }
        if let Some(ref a) = opts.assignee {
            args.extend(["--assignee", a.as_str()]);
        }
        if let Some(ref t) = opts.title {
            args.extend(["--title", t.as_str()]);
        }
        if let Some(ref d) = opts.description {
            args.extend(["--description", d.as_str()]);
        }
        if let Some(ref p) = priority {
            args.extend(["--priority", p.as_str()]);
        }
        for l in &opts.add_labels {
            args.extend(["--add-label", l.as_str()]);
        }
        for l in &opts.remove_labels {
            args.extend(["--remove-label", l.as_str()]);
        }
        self.run(id, &args).map(drop)
    }

    pub fn close(&self, id: &str, reason: Option<&str>) -> Result<(), BeadsError> {
        let mut args = vec!["close", id];
        if let Some(r) = reason {
            args.extend(["--reason", r]);
        }
        self.run(id, &args).map(drop)
    }

    pub fn add_dependency(&self, issue: &str, depends_on: &str, dep_type: &str) -> Result<(), BeadsError> {
        self.run(issue, &["dep", "add", issue, depends_on, "--type", dep_type])
            .map(drop)
    }

    pub fn label_add(&self, id: &str, label: &str) -> Result<(), BeadsError> {
        self.run(id, &["label", "add", id, label]).map(drop)
    }

    pub fn label_remove(&self, id: &str, label: &str) -> Result<(), BeadsError> {
        self.run(id, &["label", "remove", id, label]).map(drop)
    }

    // --- Formulas ---

    pub fn formula_exists(&self, formula: &str) -> Result<bool, BeadsError> {
        match self.run(formula, &["formula", "show", formula, "--json"]) {
            Ok(out) => Ok(!out.stdout.trim().is_empty()),
            Err(BeadsError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn cook(&self, formula: &str) -> Result<(), BeadsError> {
        self.run(formula, &["cook", formula]).map(drop)
    }

    pub fn wisp(&self, formula: &str, vars: &[(String, String)]) -> Result<String, BeadsError> {
        let pairs: Vec<String> = vars.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let mut args = vec!["mol", "wisp", formula];
        for pair in &pairs {
            args.extend(["--var", pair.as_str()]);
        }
        args.push("--json");
        let out = self.run(formula, &args)?;
        let created: WispCreated =
            serde_json::from_str(out.stdout.trim()).map_err(|e| BeadsError::Parse {
                command: "mol wisp",
                detail: e.to_string(),
            })?;
        Ok(created.root_id)
    }

    // --- Merge slot ---

    /// Create the rig's merge slot if it does not exist yet.
    pub fn merge_slot_ensure_exists(&self) -> Result<String, BeadsError> {
        match self.merge_slot_check() {
            Ok(status) => Ok(status.id),
            Err(BeadsError::NotFound(_)) => {
                let out = self.run("merge-slot", &["merge-slot", "create", "--json"])?;
                Ok(parse_json::<MergeSlotStatus>("merge-slot create", &out.stdout)?.id)
            }
            Err(e) => Err(e),
        }
    }

    pub fn merge_slot_acquire(&self, holder: &str) -> Result<MergeSlotAcquire, BeadsError> {
        let out = self.run(
            "merge-slot",
            &["merge-slot", "acquire", "--holder", holder, "--json"],
        )?;
        parse_json("merge-slot acquire", &out.stdout)
    }

    pub fn merge_slot_release(&self, holder: &str) -> Result<(), BeadsError> {
        self.run("merge-slot", &["merge-slot", "release", "--holder", holder])
            .map(drop)
    }

    pub fn merge_slot_check(&self) -> Result<MergeSlotStatus, BeadsError> {
        let out = self.run("merge-slot", &["merge-slot", "check", "--json"])?;
        if out.stdout.trim().is_empty() {
            return Err(BeadsError::NotFound("merge-slot".into()));
        }
        parse_json("merge-slot check", &out.stdout)
    }

    // --- Daemon and maintenance ---

    pub fn daemon_start(&self) -> Result<(), BeadsError> {
        self.run("daemon", &["daemon", "start"]).map(drop)
    }

    pub fn daemon_status(&self) -> Result<DaemonStatus, BeadsError> {
        let out = self.run("daemon", &["daemon", "status", "--json"])?;
        if out.stdout.trim().is_empty() {
            return Ok(DaemonStatus::default());
        }
        parse_json("daemon status", &out.stdout)
    }

    /// Health never fails on an unhealthy daemon; it reports it.
    pub fn daemon_health(&self) -> Result<DaemonHealth, BeadsError> {
        let out = self.tool(&["daemon", "health"]).run().map_err(|e| BeadsError::Command {
            command: "daemon".into(),
            message: format!("{e:#}"),
        })?;
        let detail = out.combined().trim().to_string();
        if !out.success() && detail.to_lowercase().contains("legacy database") {
            return Err(BeadsError::LegacyDatabase(detail));
        }
        Ok(DaemonHealth {
            healthy: out.success(),
            detail,
        })
    }

    pub fn migrate(&self) -> Result<String, BeadsError> {
        Ok(self.run("migrate", &["migrate", "--yes"])?.combined())
    }

    pub fn doctor(&self, fix: bool) -> Result<String, BeadsError> {
        let args: &[&str] = if fix { &["doctor", "--fix"] } else { &["doctor"] };
        Ok(self.run("doctor", args)?.combined())
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(command: &'static str, stdout: &str) -> Result<T, BeadsError> {
    serde_json::from_str(stdout.trim()).map_err(|e| BeadsError::Parse {
        command,
        detail: e.to_string(),
    })
}

/// Tell "not found" apart from daemon trouble by the error text.
fn classify(command: &str, subject: &str, out: &RunOutput) -> BeadsError {
    let message = out.combined().trim().to_string();
    let lower = message.to_lowercase();
    if lower.contains("legacy database") {
        BeadsError::LegacyDatabase(message)
    } else if lower.contains("not found") {
        BeadsError::NotFound(subject.to_string())
    } else if lower.contains("daemon")
        && (lower.contains("not running")
            || lower.contains("connection refused")
            || lower.contains("unreachable"))
    {
        BeadsError::DaemonUnreachable(message)
    } else {
        BeadsError::Command {
            command: command.to_string(),
            message,
        }
    }
}

/// Agent bead helpers shared by the polecat backend and patrol.
pub fn agent_issue_title(address: &str) -> String {
    format!("Agent: {address}")
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    /// A stand-in `bd` that logs `cwd|args` and answers from a fixed script.
    fn fake_bd(dir: &Path, body: &str) -> (PathBuf, PathBuf) {
        let log = dir.join("bd.log");
        let script = dir.join("bd");
        let text = format!(
            "#!/bin/sh\necho \"$PWD|${{BEADS_DIR:-unset}}|$*\" >> '{}'\n{body}\n",
            log.display()
        );
        fs::write(&script, text).unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        (script, log)
    }

    fn log_lines(log: &Path) -> Vec<String> {
        fs::read_to_string(log)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn rig_town() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".beads")).unwrap();
        fs::create_dir_all(dir.path().join("trrig/mayor/rig/.beads")).unwrap();
        super::super::routes::write_redirect(&dir.path().join("trrig"), "mayor/rig/.beads")
            .unwrap();
        dir
    }

    const CREATE_ECHO: &str = r#"case "$1" in
create) id=new; prev=""; for a in "$@"; do [ "$prev" = "--id" ] && id="$a"; prev="$a"; done
  echo "{\"id\":\"$id\",\"title\":\"t\"}";;
show) echo '[{"id":"tr-1","title":"Routed","status":"open"}]';;
esac"#;

    #[test]
    fn bound_client_runs_in_redirected_db_home() {
        let town = rig_town();
        let (bd, log) = fake_bd(town.path(), CREATE_ECHO);
        let client = Beads::bound(town.path(), &town.path().join("trrig"), "tr")
            .unwrap()
            .with_program(&bd.to_string_lossy());
        let issue = client.show("tr-1").unwrap();
        assert_eq!(issue.title, "Routed");

        let lines = log_lines(&log);
        let canonical = town.path().join("trrig/mayor/rig").canonicalize().unwrap();
        assert!(lines[0].starts_with(&format!("{}|", canonical.display())));
        assert!(lines[0].ends_with("|show tr-1 --json"));
    }

    #[test]
    fn prefix_enforcement_for_bound_rig() {
        let town = rig_town();
        let (bd, log) = fake_bd(town.path(), CREATE_ECHO);
        let client = Beads::bound(town.path(), &town.path().join("trrig"), "tr")
            .unwrap()
            .with_program(&bd.to_string_lossy());
        let opts = CreateOptions {
            title: "t".into(),
            ..Default::default()
        };

        let err = client.create_with_id("xx-1", &opts).unwrap_err();
        assert!(matches!(err, BeadsError::PrefixMismatch { .. }));
        assert!(log_lines(&log).is_empty(), "no partial write on mismatch");

        assert_eq!(client.create_with_id("tr-9", &opts).unwrap().id, "tr-9");
        assert_eq!(client.create_with_id("hq-7", &opts).unwrap().id, "hq-7");

        let lines = log_lines(&log);
        let rig_home = town.path().join("trrig/mayor/rig").canonicalize().unwrap();
        let town_home = town.path().canonicalize().unwrap();
        assert!(lines[0].starts_with(&format!("{}|", rig_home.display())));
        assert!(lines[1].starts_with(&format!("{}|", town_home.display())));
    }

    #[test]
    fn town_client_rejects_rig_prefixes() {
        let town = rig_town();
        let (bd, _log) = fake_bd(town.path(), CREATE_ECHO);
        let client = Beads::town(town.path()).with_program(&bd.to_string_lossy());
        let opts = CreateOptions::default();
        assert!(client.create_with_id("tr-1", &opts).is_err());
        assert!(client.create_with_id("hq-cv-abcde", &opts).is_ok());
    }

    #[test]
    fn empty_show_output_is_not_found() {
        let town = rig_town();
        let (bd, _log) = fake_bd(town.path(), "exit 0");
        let client = Beads::town(town.path()).with_program(&bd.to_string_lossy());
        let err = client.show("hq-missing").unwrap_err();
        assert!(matches!(err, BeadsError::NotFound(ref id) if id == "hq-missing"));
    }

    #[test]
    fn error_text_is_classified() {
        let town = rig_town();
        let cases = [
            ("echo 'Error: issue hq-x not found' >&2; exit 1", "not_found"),
            ("echo 'daemon not running' >&2; exit 1", "daemon"),
            ("echo 'refusing to start: legacy database' >&2; exit 1", "legacy"),
            ("echo 'boom' >&2; exit 1", "command"),
        ];
        for (body, kind) in cases {
            let (bd, _log) = fake_bd(town.path(), body);
            let client = Beads::town(town.path()).with_program(&bd.to_string_lossy());
            let err = client.show("hq-x").unwrap_err();
            let ok = match kind {
                "not_found" => matches!(err, BeadsError::NotFound(_)),
                "daemon" => matches!(err, BeadsError::DaemonUnreachable(_)),
                "legacy" => matches!(err, BeadsError::LegacyDatabase(_)),
                _ => matches!(err, BeadsError::Command { .. }),
            };
            assert!(ok, "{kind}: got {err:?}");
        }
    }

    #[test]
    fn update_passes_only_set_flags() {
        let town = rig_town();
        let (bd, log) = fake_bd(town.path(), "exit 0");
        let client = Beads::town(town.path()).with_program(&bd.to_string_lossy());
        client
            .update(
                "hq-1",
                &UpdateOptions {
                    status: Some(crate::beads::Status::Hooked),
                    assignee: Some("gastown/polecats/nux".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        client.update("hq-1", &UpdateOptions::default()).unwrap();
        let lines = log_lines(&log);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with("|update hq-1 --status hooked --assignee gastown/polecats/nux"));
    }

    #[test]
    fn daemon_status_and_health() {
        let town = rig_town();
        let (bd, log) = fake_bd(
            town.path(),
            r#"case "$2" in
status) echo '{"running":true,"pid":4242}';;
health) echo 'daemon unhealthy: stale socket'; exit 1;;
esac"#,
        );
        let client = Beads::town(town.path()).with_program(&bd.to_string_lossy());
        client.daemon_start().unwrap();
        let status = client.daemon_status().unwrap();
        assert!(status.running);
        assert_eq!(status.pid, Some(4242));
        let health = client.daemon_health().unwrap();
        assert!(!health.healthy);
        assert!(health.detail.contains("stale socket"));
        let lines = log_lines(&log);
        assert!(lines[0].ends_with("|daemon start"));
        assert!(lines[1].ends_with("|daemon status --json"));
    }

    #[test]
    fn wisp_returns_root_id() {
        let town = rig_town();
        let (bd, log) = fake_bd(town.path(), r#"echo '{"new_epic_id":"hq-wisp-1"}'"#);
        let client = Beads::town(town.path()).with_program(&bd.to_string_lossy());
        let root = client
            .wisp("mol-polecat-work", &[("issue".into(), "gp-1".into())])
            .unwrap();
        assert_eq!(root, "hq-wisp-1");
        assert!(log_lines(&log)[0].ends_with("|mol wisp mol-polecat-work --var issue=gp-1 --json"));
    }
}
