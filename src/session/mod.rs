//! Multiplexer sessions for agents.
//!
//! `SessionDriver` is the narrow interface to the multiplexer server; `Tmux`
//! is the real one. `SessionFactory` builds on it: starting sessions in the
//! agent's directory with its environment, replacing zombies, the ready
//! handshake, and debounced nudges.

pub mod tmux;

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub use tmux::Tmux;

use crate::address::AgentAddress;
use crate::beads::client::ENV_OVERRIDES;
use crate::config::RuntimeConfig;
use crate::lock::PidLock;
use crate::shell::shell_escape;
use crate::town::{AGENT_ENV, Town};

/// Pane text shown by Claude's first-run permission prompt.
const PERMISSION_PROMPT: &str = "Bypass Permissions mode";
const LOCK_WAIT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session {0} not found")]
    NotFound(String),

    #[error("could not start session {session}: {detail}")]
    StartFailed { session: String, detail: String },

    #[error("session {session} not ready after {waited_ms} ms")]
    ReadyTimeout { session: String, waited_ms: u64 },

    #[error(transparent)]
    Driver(#[from] anyhow::Error),
}

/// Everything needed to create one detached session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartSpec {
    pub name: String,
    pub work_dir: PathBuf,
    pub env: Vec<(String, String)>,
    /// Shell command line for the single pane.
    pub command: String,
}

pub trait SessionDriver: Send + Sync {
    fn has_session(&self, name: &str) -> anyhow::Result<bool>;
    fn new_session(&self, spec: &StartSpec) -> anyhow::Result<()>;
    fn kill_session(&self, name: &str) -> anyhow::Result<()>;
    /// Foreground command of the session's pane, if the session exists.
    fn pane_command(&self, name: &str) -> anyhow::Result<Option<String>>;
    fn capture_pane(&self, name: &str, lines: usize) -> anyhow::Result<String>;
    /// Type `text` without interpreting key names.
    fn send_literal(&self, name: &str, text: &str) -> anyhow::Result<()>;
    fn send_key(&self, name: &str, key: &str) -> anyhow::Result<()>;
    fn list_sessions(&self) -> anyhow::Result<Vec<String>>;
    /// Session of the client this process runs in, if any.
    fn current_session(&self) -> Option<String>;
    fn attach(&self, name: &str) -> anyhow::Result<()>;
    fn switch_client(&self, name: &str) -> anyhow::Result<()>;

    fn send_enter(&self, name: &str) -> anyhow::Result<()> {
        self.send_key(name, "Enter")
    }
}

/// Where the agent process runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionKind {
    Local,
    /// A local session whose pane holds an `ssh -t` into the remote worktree.
    MirroredRemote { target: String, remote_root: PathBuf },
}

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Runtime alias replacing the role's configured one.
    pub agent_override: Option<String>,
    /// Account alias whose config dir is exported as `CLAUDE_CONFIG_DIR`.
    pub account: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub name: String,
    pub address: AgentAddress,
    pub runtime_alias: String,
    pub runtime: RuntimeConfig,
    /// A live session already existed; no process was started.
    pub reused: bool,
}

pub struct SessionFactory {
    town: Town,
    driver: Arc<dyn SessionDriver>,
}

impl SessionFactory {
    pub fn new(town: &Town, driver: Arc<dyn SessionDriver>) -> Self {
        Self {
            town: town.clone(),
            driver,
        }
    }

    pub fn driver(&self) -> &dyn SessionDriver {
        self.driver.as_ref()
    }

    pub fn kind_for(&self, addr: &AgentAddress) -> SessionKind {
        let rig = addr.rig().and_then(|r| self.town.rig(r));
        match rig.and_then(|r| r.ssh.clone().map(|target| (target, r.remote_root.clone()))) {
            Some((target, remote_root)) => SessionKind::MirroredRemote {
                target,
                remote_root: remote_root.unwrap_or_else(|| self.town.root.clone()),
            },
            None => SessionKind::Local,
        }
    }

    fn is_shell(&self, command: &str) -> bool {
        let bare = command.trim_start_matches('-');
        self.town
            .config
            .session
            .shells
            .iter()
            .any(|s| s == command || s.trim_start_matches('-') == bare)
    }

    /// The session exists but its pane is back at a login shell.
    pub fn is_zombie(&self, name: &str) -> anyhow::Result<bool> {
        Ok(self
            .driver
            .pane_command(name)?
            .is_some_and(|cmd| self.is_shell(&cmd)))
    }

    /// The session exists and is running something other than a shell.
    pub fn is_alive(&self, name: &str) -> bool {
        matches!(self.driver.has_session(name), Ok(true)) && !self.is_zombie(name).unwrap_or(false)
    }

    fn lock(&self, name: &str) -> Result<PidLock, SessionError> {
        Ok(PidLock::acquire(
            &self.town.lock_path(&format!("session-{name}")),
            LOCK_WAIT,
        )?)
    }

    fn environment(
        &self,
        addr: &AgentAddress,
        runtime: &RuntimeConfig,
        opts: &StartOptions,
        town_root: &std::path::Path,
    ) -> Result<Vec<(String, String)>, SessionError> {
        let address = addr.to_string();
        let mut env = vec![
            (AGENT_ENV.to_string(), address.clone()),
            ("GT_ROLE".to_string(), addr.role().as_str().to_string()),
        ];
        if let Some(rig) = addr.rig() {
            env.push(("GT_RIG".to_string(), rig.to_string()));
        }
        env.push((
            "GT_TOWN_ROOT".to_string(),
            town_root.to_string_lossy().into_owned(),
        ));
        env.push(("BD_ACTOR".to_string(), address));
        env.extend(runtime.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        if let Some(account) = &opts.account {
            let dir = self.town.config.account_dir(account)?;
            env.push((
                "CLAUDE_CONFIG_DIR".to_string(),
                dir.to_string_lossy().into_owned(),
            ));
        }
        Ok(env)
    }

    /// The `StartSpec` for an agent, without touching the multiplexer.
    pub fn start_spec(
        &self,
        addr: &AgentAddress,
        runtime: &RuntimeConfig,
        opts: &StartOptions,
    ) -> Result<StartSpec, SessionError> {
        let unset: String = ENV_OVERRIDES.iter().map(|k| format!("-u {k} ")).collect();
        let local_dir = self.town.agent_dir(addr);
        let work_dir = if local_dir.is_dir() {
            local_dir
        } else {
            self.town.root.clone()
        };
        match self.kind_for(addr) {
            SessionKind::Local => Ok(StartSpec {
                name: addr.session_name(),
                work_dir,
                env: self.environment(addr, runtime, opts, &self.town.root)?,
                command: format!("env {unset}{}", runtime.command_line()),
            }),
            SessionKind::MirroredRemote {
                target,
                remote_root,
            } => {
                let env = self.environment(addr, runtime, opts, &remote_root)?;
                let assignments: String = env
                    .iter()
                    .map(|(k, v)| format!("{k}={} ", shell_escape(v)))
                    .collect();
                let remote_dir = remote_root.join(addr.work_dir());
                let remote = format!(
                    "cd {} && env {unset}{assignments}{}",
                    shell_escape(&remote_dir.to_string_lossy()),
                    runtime.command_line()
                );
                Ok(StartSpec {
                    name: addr.session_name(),
                    work_dir,
                    env,
                    command: format!("ssh -t {target} {}", shell_escape(&remote)),
                })
            }
        }
    }

    /// Start the agent's session, or reuse a live one.
    ///
    /// A session whose pane has fallen back to a login shell is killed and
    /// replaced.
    pub fn start(&self, addr: &AgentAddress, opts: &StartOptions) -> Result<Session, SessionError> {
        let name = addr.session_name();
        let _lock = self.lock(&name)?;
        let (runtime_alias, runtime) = self
            .town
            .config
            .runtime_for(addr.role().as_str(), opts.agent_override.as_deref())?;
        let session = |reused| Session {
            name: name.clone(),
            address: addr.clone(),
            runtime_alias: runtime_alias.clone(),
            runtime: runtime.clone(),
            reused,
        };

        if self.driver.has_session(&name)? {
            if !self.is_zombie(&name)? {
                tracing::debug!(session = %name, "session already running");
                return Ok(session(true));
            }
            tracing::warn!(session = %name, "replacing zombie session");
            self.driver.kill_session(&name)?;
        }

        let spec = self.start_spec(addr, &runtime, opts)?;
        self.driver
            .new_session(&spec)
            .map_err(|e| SessionError::StartFailed {
                session: name.clone(),
                detail: format!("{e:#}"),
            })?;
        tracing::info!(session = %name, agent = %addr, runtime = %runtime_alias, "session started");
        Ok(session(false))
    }

    /// Block until the agent is ready for input.
    ///
    /// Waits for the pane to leave the login shell, accepts the permission
    /// prompt if the runtime shows one, then sleeps the runtime's settle delay.
    pub fn wait_ready(&self, session: &Session) -> Result<(), SessionError> {
        if session.reused {
            return Ok(());
        }
        let cfg = &self.town.config.session;
        let started = Instant::now();
        let timeout = Duration::from_millis(cfg.ready_timeout_ms);
        loop {
            match self.driver.pane_command(&session.name)? {
                Some(cmd) if !self.is_shell(&cmd) => break,
                Some(_) => {}
                None => return Err(SessionError::NotFound(session.name.clone())),
            }
            if started.elapsed() >= timeout {
                return Err(SessionError::ReadyTimeout {
                    session: session.name.clone(),
                    waited_ms: cfg.ready_timeout_ms,
                });
            }
            thread::sleep(Duration::from_millis(cfg.poll_interval_ms));
        }

        if session.runtime.accept_permissions {
            self.accept_permission_prompt(&session.name);
        }
        thread::sleep(Duration::from_millis(session.runtime.ready_delay_ms));
        Ok(())
    }

    fn accept_permission_prompt(&self, name: &str) {
        let screen = match self.driver.capture_pane(name, 40) {
            Ok(screen) => screen,
            Err(e) => {
                tracing::debug!(session = name, error = %format!("{e:#}"), "capture failed");
                return;
            }
        };
        if !screen.contains(PERMISSION_PROMPT) {
            return;
        }
        tracing::info!(session = name, "accepting permission prompt");
        let debounce = Duration::from_millis(self.town.config.session.nudge_debounce_ms);
        let result = self.driver.send_key(name, "Down").and_then(|()| {
            thread::sleep(debounce);
            self.driver.send_enter(name)
        });
        if let Err(e) = result {
            tracing::warn!(session = name, error = %format!("{e:#}"), "could not accept permission prompt");
        }
    }

    /// Type `text` into the pane, pause, then press Enter separately.
    pub fn nudge(&self, name: &str, text: &str) -> Result<(), SessionError> {
        let _lock = self.lock(name)?;
        if !self.driver.has_session(name)? {
            return Err(SessionError::NotFound(name.to_string()));
        }
        self.driver.send_literal(name, text)?;
        thread::sleep(Duration::from_millis(
            self.town.config.session.nudge_debounce_ms,
        ));
        self.driver.send_enter(name)?;
        tracing::debug!(session = name, "nudged");
        Ok(())
    }

    /// Switch to the session from inside a client, else attach to it.
    pub fn attach(&self, name: &str) -> Result<(), SessionError> {
        if !self.driver.has_session(name)? {
            return Err(SessionError::NotFound(name.to_string()));
        }
        if self.driver.current_session().is_some() {
            self.driver.switch_client(name)?;
        } else {
            self.driver.attach(name)?;
        }
        Ok(())
    }

    /// Sessions that belong to this town, sorted.
    pub fn town_sessions(&self) -> Result<Vec<String>, SessionError> {
        let mut own: Vec<String> = self
            .driver
            .list_sessions()?
            .into_iter()
            .filter(|s| {
                s.starts_with("hq-")
                    || self
                        .town
                        .config
                        .rigs
                        .keys()
                        .any(|rig| s.starts_with(&format!("gt-{rig}-")))
            })
            .collect();
        own.sort();
        Ok(own)
    }
}

/// The session after (or before) `current`, wrapping around.
pub fn cycle(sessions: &[String], current: &str, forward: bool) -> Option<String> {
    if sessions.is_empty() {
        return None;
    }
    let len = sessions.len();
    let next = match sessions.iter().position(|s| s == current) {
        Some(i) if forward => (i + 1) % len,
        Some(i) => (i + len - 1) % len,
        None if forward => 0,
        None => len - 1,
    };
    Some(sessions[next].clone())
}
