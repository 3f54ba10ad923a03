use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::time::Duration;

use anyhow::Context;

use crate::error::ExitError;
use crate::shell::{join_command, quote_if_needed};

/// Result of running a subprocess.
#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl RunOutput {
    /// Returns true if the process exited successfully.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout followed by stderr, the way a terminal would interleave them.
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }

    /// Parse stdout as JSON.
    pub fn parse_json<T: serde::de::DeserializeOwned>(&self) -> anyhow::Result<T> {
        serde_json::from_str(&self.stdout)
            .with_context(|| "parsing JSON output from subprocess".to_string())
    }
}

/// Where commands execute: this machine, or a host reached over `ssh`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Runner {
    #[default]
    Local,
    Ssh { target: String },
}

impl Runner {
    pub fn ssh(target: impl Into<String>) -> Self {
        Runner::Ssh {
            target: target.into(),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Runner::Ssh { .. })
    }

    /// Start building an invocation of `program` on this runner.
    pub fn tool(&self, program: &str) -> Tool {
        let mut tool = Tool::new(program);
        tool.remote = match self {
            Runner::Local => None,
            Runner::Ssh { target } => Some(target.clone()),
        };
        tool
    }

    /// Fail on non-zero exit.
    pub fn run(&self, dir: Option<&Path>, program: &str, args: &[&str]) -> anyhow::Result<RunOutput> {
        self.prepared(dir, program, args).run_ok()
    }

    /// Stdout of a successful run.
    pub fn output(&self, dir: Option<&Path>, program: &str, args: &[&str]) -> anyhow::Result<String> {
        Ok(self.prepared(dir, program, args).run_ok()?.stdout)
    }

    /// Stdout and stderr together, whatever the exit status.
    pub fn combined_output(
        &self,
        dir: Option<&Path>,
        program: &str,
        args: &[&str],
    ) -> anyhow::Result<(String, bool)> {
        let out = self.prepared(dir, program, args).run()?;
        Ok((out.combined(), out.success()))
    }

    /// Attach the caller's terminal, with a TTY over SSH.
    pub fn run_interactive(&self, dir: Option<&Path>, program: &str, args: &[&str]) -> anyhow::Result<()> {
        self.prepared(dir, program, args).interactive().run_inherit()
    }

    fn prepared(&self, dir: Option<&Path>, program: &str, args: &[&str]) -> Tool {
        let tool = self.tool(program).args(args);
        match dir {
            Some(d) => tool.current_dir(d),
            None => tool,
        }
    }
}

/// Builder for running external tools.
#[derive(Debug, Clone)]
pub struct Tool {
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
    cwd: Option<PathBuf>,
    env: Vec<(String, String)>,
    env_remove: Vec<String>,
    remote: Option<String>,
    interactive: bool,
}

impl Tool {
    /// Create a new local tool invocation.
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            timeout: None,
            cwd: None,
            env: Vec::new(),
            env_remove: Vec::new(),
            remote: None,
            interactive: false,
        }
    }

    /// Add a single argument.
    pub fn arg(mut self, arg: &str) -> Self {
        self.args.push(arg.to_string());
        self
    }

    /// Add multiple arguments.
    pub fn args(mut self, args: &[&str]) -> Self {
        self.args.extend(args.iter().map(|s| s.to_string()));
        self
    }

    /// Set a timeout for the subprocess.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Run in `dir`. Over SSH this becomes `cd <dir> &&` on the remote side.
    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    /// Set an environment variable for the child.
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    /// Make sure the child does not inherit `key`.
    pub fn env_remove(mut self, key: &str) -> Self {
        self.env_remove.push(key.to_string());
        self
    }

    /// Request a TTY (only meaningful for remote or inherited-stdio runs).
    pub fn interactive(mut self) -> Self {
        self.interactive = true;
        self
    }

    /// Run the tool, capturing stdout and stderr.
    pub fn run(&self) -> anyhow::Result<RunOutput> {
        let mut cmd = self.command();
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped()).stdin(Stdio::null());

        tracing::debug!(program = %self.program, args = ?self.args, remote = ?self.remote, "running tool");

        let output: Output = if let Some(timeout) = self.timeout {
            run_with_timeout(&mut cmd, timeout, self.display_name())?
        } else {
            cmd.output().map_err(|e| self.not_found_or_other(e))?
        };

        Ok(RunOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    /// Run the tool and return an error if it fails.
    pub fn run_ok(&self) -> anyhow::Result<RunOutput> {
        let output = self.run()?;
        if output.success() {
            Ok(output)
        } else {
            let message = if output.stderr.trim().is_empty() {
                output.stdout.trim().to_string()
            } else {
                output.stderr.trim().to_string()
            };
            Err(ExitError::ToolFailed {
                tool: self.program.clone(),
                code: output.exit_code,
                message,
            }
            .into())
        }
    }

    /// Run with the caller's stdin/stdout/stderr attached.
    pub fn run_inherit(&self) -> anyhow::Result<()> {
        let mut cmd = self.command();
        cmd.stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        let status = cmd.status().map_err(|e| self.not_found_or_other(e))?;
        if status.success() {
            Ok(())
        } else {
            Err(ExitError::ToolFailed {
                tool: self.program.clone(),
                code: status.code().unwrap_or(-1),
                message: String::new(),
            }
            .into())
        }
    }

    fn command(&self) -> Command {
        let (program, args) = self.build_command();
        let mut cmd = Command::new(program);
        cmd.args(&args);
        if self.remote.is_none() {
            if let Some(ref dir) = self.cwd {
                cmd.current_dir(dir);
            }
            for key in &self.env_remove {
                cmd.env_remove(key);
            }
            for (key, value) in &self.env {
                cmd.env(key, value);
            }
        }
        cmd
    }

    fn build_command(&self) -> (String, Vec<String>) {
        let Some(ref target) = self.remote else {
            return (self.program.clone(), self.args.clone());
        };

        let mut remote_line = String::new();
        if let Some(ref dir) = self.cwd {
            remote_line.push_str("cd ");
            remote_line.push_str(&quote_if_needed(&dir.to_string_lossy()));
            remote_line.push_str(" && ");
        }
        for key in &self.env_remove {
            remote_line.push_str("unset ");
            remote_line.push_str(&quote_if_needed(key));
            remote_line.push_str("; ");
        }
        for (key, value) in &self.env {
            remote_line.push_str(&format!("{key}={} ", quote_if_needed(value)));
        }
        remote_line.push_str(&join_command(&self.program, &self.args));

        let mut args = Vec::new();
        if self.interactive {
            args.push("-t".to_string());
        }
        args.push(target.clone());
        args.push(remote_line);
        ("ssh".to_string(), args)
    }

    fn display_name(&self) -> &str {
        if self.remote.is_some() {
            "ssh"
        } else {
            &self.program
        }
    }

    fn not_found_or_other(&self, e: std::io::Error) -> anyhow::Error {
        if e.kind() == std::io::ErrorKind::NotFound {
            ExitError::ToolNotFound {
                tool: self.display_name().to_string(),
            }
            .into()
        } else {
            anyhow::Error::new(e).context(format!("running {}", self.program))
        }
    }
}

fn run_with_timeout(
    cmd: &mut Command,
    timeout: Duration,
    tool_name: &str,
) -> anyhow::Result<Output> {
    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            anyhow::Error::from(ExitError::ToolNotFound {
                tool: tool_name.to_string(),
            })
        } else {
            anyhow::Error::new(e).context(format!("spawning {tool_name}"))
        }
    })?;

    let start = std::time::Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(_)) => {
                return child
                    .wait_with_output()
                    .with_context(|| format!("collecting output of {tool_name}"));
            }
            Ok(None) => {
                if start.elapsed() >= timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(ExitError::Timeout {
                        tool: tool_name.to_string(),
                        timeout_secs: timeout.as_secs(),
                    }
                    .into());
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => return Err(anyhow::Error::new(e).context(format!("waiting for {tool_name}"))),
        }
    }
}
