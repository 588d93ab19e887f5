use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs::File;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::duration_ms;
use crate::error::{EnvError, Result};
use crate::launch_lock::LaunchLock;
use crate::pipe::{PipeChannel, PipePaths};
use crate::protocol::EXIT;
use crate::seeding;
use crate::telemetry::MessageHandler;

/// Directories searched for the emulator on top of `PATH`.
const EXTRA_SEARCH_DIRS: [&str; 2] = ["/usr/games", "/usr/local/games"];

pub const DEFAULT_EMULATOR: &str = "fceux";

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Emulator binary; looked up on the search path when unset.
    pub emulator: Option<PathBuf>,
    pub emulator_args: Vec<String>,
    /// Scripts loaded and run by the startup script, in order.
    pub extension_scripts: Vec<PathBuf>,
    /// Holds FIFOs and startup scripts.
    pub temp_dir: PathBuf,
    /// Holds emulator stdout/stderr logs; defaults to `temp_dir`.
    pub log_dir: Option<PathBuf>,
    pub pipe_prefix: String,
    /// How long a fresh subprocess must survive to count as started.
    #[serde(with = "duration_ms")]
    pub startup_grace: Duration,
    /// Delay before the startup script is deleted.
    #[serde(with = "duration_ms")]
    pub script_removal_grace: Duration,
    /// Time between the exit message and the forced kill.
    #[serde(with = "duration_ms")]
    pub exit_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            emulator: None,
            emulator_args: default_emulator_args(),
            extension_scripts: Vec::new(),
            temp_dir: std::env::temp_dir(),
            log_dir: None,
            pipe_prefix: "nes-fifo".to_string(),
            startup_grace: Duration::from_millis(200),
            script_removal_grace: Duration::from_secs(1),
            exit_grace: Duration::from_millis(50),
        }
    }
}

impl SupervisorConfig {
    pub fn pipe_prefix_path(&self) -> PathBuf {
        self.temp_dir.join(&self.pipe_prefix)
    }

    pub fn log_dir(&self) -> &Path {
        self.log_dir.as_deref().unwrap_or(&self.temp_dir)
    }

    pub fn resolve_emulator(&self) -> Result<PathBuf> {
        match &self.emulator {
            Some(path) if path.is_file() => Ok(path.clone()),
            Some(path) => Err(EnvError::Configuration(format!(
                "emulator not found at {}",
                path.display()
            ))),
            None => find_executable(DEFAULT_EMULATOR).ok_or_else(|| {
                EnvError::Configuration(format!(
                    "{DEFAULT_EMULATOR} is required; install it or configure the emulator path"
                ))
            }),
        }
    }
}

fn default_emulator_args() -> Vec<String> {
    let args: &[&str] = if std::env::var_os("FULLSCREEN").is_some() {
        &["-f", "1"]
    } else {
        &["--xscale", "2", "--yscale", "2", "-f", "0"]
    };
    args.iter().map(|a| a.to_string()).collect()
}

pub fn find_executable(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH").unwrap_or_default();
    std::env::split_paths(&path_var)
        .chain(EXTRA_SEARCH_DIRS.iter().map(PathBuf::from))
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

// =============================================================================
// Session
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: u32,
    pub content_path: PathBuf,
    pub launch_vars: BTreeMap<String, String>,
    /// Startup script path; unique per session, so it doubles as the token
    /// for finding the emulator among running processes.
    pub script_path: PathBuf,
}

/// Renders the startup script: one `key = "value";` line per launch
/// variable, then a load-and-run directive per extension script.
pub fn render_script(launch_vars: &BTreeMap<String, String>, scripts: &[PathBuf]) -> String {
    let mut out = String::new();
    for (key, value) in launch_vars {
        let _ = writeln!(out, "{key} = \"{}\";", escape(value));
    }
    for (i, script) in scripts.iter().enumerate() {
        let _ = writeln!(
            out,
            "f_{i} = assert (loadfile (\"{}\"));",
            escape(&script.to_string_lossy())
        );
        let _ = writeln!(out, "f_{i} ();");
    }
    out
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

struct LiveSession {
    session: Session,
    channel: PipeChannel,
    child: Option<Child>,
}

// =============================================================================
// Process Supervisor
// =============================================================================

/// Launches and tears down the emulator subprocess and owns its pipes.
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    launch_lock: Arc<dyn LaunchLock>,
    launch_vars: BTreeMap<String, String>,
    live: Option<LiveSession>,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig, launch_lock: Arc<dyn LaunchLock>) -> Self {
        Self {
            config,
            launch_lock,
            launch_vars: BTreeMap::new(),
            live: None,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Extra variable for the next startup script.
    pub fn set_launch_var(&mut self, key: &str, value: impl ToString) {
        self.launch_vars.insert(key.to_string(), value.to_string());
    }

    pub fn is_live(&self) -> bool {
        self.live.is_some()
    }

    pub fn session(&self) -> Option<&Session> {
        self.live.as_ref().map(|live| &live.session)
    }

    pub fn channel(&self) -> Option<&PipeChannel> {
        self.live.as_ref().map(|live| &live.channel)
    }

    pub fn pid(&self) -> Option<u32> {
        self.live
            .as_ref()
            .and_then(|live| live.child.as_ref())
            .map(Child::id)
    }

    /// Sends one message over the live session's outbound pipe.
    pub fn send(&self, message: &str) -> bool {
        self.channel().is_some_and(|channel| channel.send(message))
    }

    fn launch_vars_for(&self, session_id: u32) -> BTreeMap<String, String> {
        let mut vars = self.launch_vars.clone();
        vars.insert("pipe_name".into(), session_id.to_string());
        vars.insert(
            "pipe_prefix".into(),
            self.config.pipe_prefix_path().display().to_string(),
        );
        vars
    }

    /// Startup script contents a launch would use, for inspection.
    pub fn preview_script(&self, session_id: u32) -> String {
        render_script(
            &self.launch_vars_for(session_id),
            &self.config.extension_scripts,
        )
    }

    fn fresh_session_id(&self) -> u32 {
        let prefix = self.config.pipe_prefix_path();
        loop {
            let id = seeding::session_id();
            if !PipePaths::new(&prefix, id).any_exists() {
                return id;
            }
        }
    }

    /// Starts a new emulator session, replacing any live one.
    pub fn launch(&mut self, content_path: &Path, handler: Arc<dyn MessageHandler>) -> Result<()> {
        if content_path.as_os_str().is_empty() || !content_path.is_file() {
            return Err(EnvError::missing_content(content_path));
        }
        let emulator = self.config.resolve_emulator()?;
        self.terminate();

        let lock = self.launch_lock.clone();
        let _guard = lock.acquire()?;

        let id = self.fresh_session_id();
        let channel = PipeChannel::open(&self.config.pipe_prefix_path(), id, handler)?;
        let launch_vars = self.launch_vars_for(id);
        let script_path = self.config.temp_dir.join(format!("nes-pipe-env-{id}.lua"));
        std::fs::write(
            &script_path,
            render_script(&launch_vars, &self.config.extension_scripts),
        )?;

        let log_dir = self.config.log_dir();
        let stdout = File::create(log_dir.join(format!("emulator-{id}.stdout.log")))?;
        let stderr = File::create(log_dir.join(format!("emulator-{id}.stderr.log")))?;

        let mut command = Command::new(&emulator);
        command
            .args(&self.config.emulator_args)
            .arg("--loadlua")
            .arg(&script_path)
            .arg(content_path)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0);
        let command_line = format!("{command:?}");

        let session = Session {
            id,
            content_path: content_path.to_path_buf(),
            launch_vars,
            script_path,
        };

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                discard(&session, &channel);
                return Err(EnvError::Launch {
                    command: command_line,
                    reason: e.to_string(),
                });
            }
        };

        std::thread::sleep(self.config.startup_grace);
        match child.try_wait() {
            Ok(Some(status)) if !status.success() => {
                discard(&session, &channel);
                return Err(EnvError::Launch {
                    command: command_line,
                    reason: format!("exited with {status}"),
                });
            }
            Ok(Some(_)) => debug!(session_id = id, "launcher returned, emulator detached"),
            Ok(None) => {}
            Err(e) => warn!(session_id = id, "unable to poll emulator status: {e}"),
        }
        info!(session_id = id, pid = child.id(), command = %command_line, "emulator started");

        channel.ensure_writer();
        schedule_removal(session.script_path.clone(), self.config.script_removal_grace);

        self.live = Some(LiveSession {
            session,
            channel,
            child: Some(child),
        });
        Ok(())
    }

    /// Asks the emulator to exit, waits the grace period, then kills its
    /// process group and closes the pipes. Safe to call repeatedly.
    pub fn terminate(&mut self) {
        let Some(mut live) = self.live.take() else {
            return;
        };
        if live.channel.send(EXIT) {
            std::thread::sleep(self.config.exit_grace);
        }
        kill_session(&mut live);
        live.channel.close();
        remove_script(&live.session.script_path);
        debug!(session_id = live.session.id, "session terminated");
    }

    /// Kills a stalled emulator immediately and closes the pipes.
    pub fn abort(&mut self) {
        let Some(mut live) = self.live.take() else {
            return;
        };
        warn!(session_id = live.session.id, "killing stalled emulator");
        kill_session(&mut live);
        live.channel.close();
        remove_script(&live.session.script_path);
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn discard(session: &Session, channel: &PipeChannel) {
    channel.close();
    remove_script(&session.script_path);
}

fn remove_script(path: &Path) {
    if path.is_file() {
        let _ = std::fs::remove_file(path);
    }
}

/// Deletes the startup script once the emulator has had time to read it.
fn schedule_removal(path: PathBuf, grace: Duration) {
    let spawned = std::thread::Builder::new()
        .name("script-cleanup".into())
        .spawn(move || {
            std::thread::sleep(grace);
            remove_script(&path);
        });
    if let Err(e) = spawned {
        warn!("unable to schedule startup script removal: {e}");
    }
}

/// SIGKILLs the emulator's process group. A launcher that already exited may
/// have left a detached emulator behind, and an empty or unreachable group
/// says the same, so those cases also scan the process table for the
/// session's script token.
fn kill_session(live: &mut LiveSession) {
    let mut needs_scan = true;
    if let Some(mut child) = live.child.take() {
        let detached = matches!(child.try_wait(), Ok(Some(_)));
        let pgid = Pid::from_raw(child.id() as i32);
        match killpg(pgid, Signal::SIGKILL) {
            Ok(()) => needs_scan = detached,
            Err(Errno::ESRCH) => debug!(pid = child.id(), "emulator process group already gone"),
            Err(e) => warn!(pid = child.id(), "unable to signal process group: {e}"),
        }
        let _ = child.kill();
        let _ = child.wait();
    }
    if needs_scan {
        let token = live.session.script_path.to_string_lossy().into_owned();
        let killed = kill_by_token(&token);
        debug!(killed, token, "killed emulator processes by token");
    }
}

/// Processes (other than this one) whose command line carries `token` as one
/// of its arguments.
pub fn pids_with_token(token: &str) -> Vec<u32> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    let own_pid = std::process::id();
    entries
        .flatten()
        .filter_map(|entry| {
            let pid = entry.file_name().to_str()?.parse::<u32>().ok()?;
            if pid == own_pid {
                return None;
            }
            let cmdline = std::fs::read(entry.path().join("cmdline")).ok()?;
            cmdline
                .split(|&b| b == 0)
                .any(|arg| arg == token.as_bytes())
                .then_some(pid)
        })
        .collect()
}

/// Fallback when the emulator's identity is unknown: SIGKILL every process
/// matched by [`pids_with_token`].
pub fn kill_by_token(token: &str) -> usize {
    let mut killed = 0;
    for pid in pids_with_token(token) {
        if kill(Pid::from_raw(pid as i32), Signal::SIGKILL).is_ok() {
            warn!(pid, "killed emulator process by token");
            killed += 1;
        }
    }
    killed
}
