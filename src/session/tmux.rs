//! The tmux implementation of `SessionDriver`.

use anyhow::Context;

use super::{SessionDriver, StartSpec};
use crate::subprocess::{RunOutput, Tool};

const TMUX: &str = "tmux";

#[derive(Debug, Clone)]
pub struct Tmux {
    program: String,
}

impl Default for Tmux {
    fn default() -> Self {
        Self {
            program: TMUX.to_string(),
        }
    }
}

/// `new-session` arguments for a detached session running `spec.command`.
pub fn new_session_args(spec: &StartSpec) -> Vec<String> {
    let mut args = vec![
        "new-session".to_string(),
        "-d".to_string(),
        "-s".to_string(),
        spec.name.clone(),
        "-c".to_string(),
        spec.work_dir.to_string_lossy().into_owned(),
    ];
    for (key, value) in &spec.env {
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }
    args.push(spec.command.clone());
    args
}

/// Exact-match target, so `gt-gastown-nux` never matches `gt-gastown-nux-2`.
fn exact(name: &str) -> String {
    format!("={name}")
}

fn is_no_server(out: &RunOutput) -> bool {
    let stderr = out.stderr.to_lowercase();
    stderr.contains("no server running") || stderr.contains("error connecting")
}

impl Tmux {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_program(program: &str) -> Self {
        Self {
            program: program.to_string(),
        }
    }

    fn tmux(&self, args: &[&str]) -> Tool {
        Tool::new(&self.program).args(args)
    }
}

impl SessionDriver for Tmux {
    fn has_session(&self, name: &str) -> anyhow::Result<bool> {
        let out = self.tmux(&["has-session", "-t", &exact(name)]).run()?;
        Ok(out.success())
    }

    fn new_session(&self, spec: &StartSpec) -> anyhow::Result<()> {
        let args = new_session_args(spec);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.tmux(&args)
            .run_ok()
            .with_context(|| format!("tmux new-session {}", spec.name))?;
        Ok(())
    }

    fn kill_session(&self, name: &str) -> anyhow::Result<()> {
        let out = self.tmux(&["kill-session", "-t", &exact(name)]).run()?;
        if !out.success() && !out.stderr.contains("can't find session") && !is_no_server(&out) {
            anyhow::bail!("tmux kill-session {name}: {}", out.stderr.trim());
        }
        Ok(())
    }

    fn pane_command(&self, name: &str) -> anyhow::Result<Option<String>> {
        let out = self
            .tmux(&["display-message", "-p", "-t", &exact(name), "#{pane_current_command}"])
            .run()?;
        if !out.success() {
            return Ok(None);
        }
        let cmd = out.stdout.trim();
        Ok((!cmd.is_empty()).then(|| cmd.to_string()))
    }

    fn capture_pane(&self, name: &str, lines: usize) -> anyhow::Result<String> {
        let start = format!("-{lines}");
        let out = self
            .tmux(&["capture-pane", "-p", "-t", &exact(name), "-S", &start])
            .run_ok()
            .with_context(|| format!("tmux capture-pane {name}"))?;
        Ok(out.stdout)
    }

    fn send_literal(&self, name: &str, text: &str) -> anyhow::Result<()> {
        self.tmux(&["send-keys", "-t", &exact(name), "-l", text])
            .run_ok()
            .with_context(|| format!("tmux send-keys to {name}"))?;
        Ok(())
    }

    fn send_key(&self, name: &str, key: &str) -> anyhow::Result<()> {
        self.tmux(&["send-keys", "-t", &exact(name), key])
            .run_ok()
            .with_context(|| format!("tmux send-keys {key} to {name}"))?;
        Ok(())
    }

    fn list_sessions(&self) -> anyhow::Result<Vec<String>> {
        let out = self
            .tmux(&["list-sessions", "-F", "#{session_name}"])
            .run()?;
        if !out.success() {
            if is_no_server(&out) {
                return Ok(Vec::new());
            }
            anyhow::bail!("tmux list-sessions: {}", out.stderr.trim());
        }
        Ok(out
            .stdout
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn current_session(&self) -> Option<String> {
        std::env::var_os("TMUX")?;
        let out = self
            .tmux(&["display-message", "-p", "#{session_name}"])
            .run()
            .ok()?;
        let name = out.stdout.trim();
        (out.success() && !name.is_empty()).then(|| name.to_string())
    }

    fn attach(&self, name: &str) -> anyhow::Result<()> {
        self.tmux(&["attach-session", "-t", &exact(name)])
            .run_inherit()
    }

    fn switch_client(&self, name: &str) -> anyhow::Result<()> {
        self.tmux(&["switch-client", "-t", &exact(name)])
            .run_ok()
            .map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn new_session_args_carry_cwd_env_and_command() {
        let spec = StartSpec {
            name: "gt-gastown-nux".into(),
            work_dir: PathBuf::from("/t/gastown/polecats/nux/gastown"),
            env: vec![("GT_AGENT".into(), "gastown/polecats/nux".into())],
            command: "claude --dangerously-skip-permissions".into(),
        };
        assert_eq!(
            new_session_args(&spec),
            vec![
                "new-session",
                "-d",
                "-s",
                "gt-gastown-nux",
                "-c",
                "/t/gastown/polecats/nux/gastown",
                "-e",
                "GT_AGENT=gastown/polecats/nux",
                "claude --dangerously-skip-permissions",
            ]
        );
    }

    #[test]
    fn targets_are_exact() {
        assert_eq!(exact("hq-mayor"), "=hq-mayor");
    }

    #[test]
    fn missing_tmux_binary_is_an_error() {
        let tmux = Tmux::with_program("gt-test-no-such-tmux");
        assert!(tmux.list_sessions().is_err());
        assert!(tmux.has_session("x").is_err());
    }
}
