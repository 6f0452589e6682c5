use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::process::ProcessHandle;

/// What happens to still-running processes when a session is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CleanupPolicy {
    /// Terminate every process that is still alive.
    #[default]
    Kill,
    /// Wait for every process to finish on its own.
    Wait,
    /// Leave processes running.
    Ignore,
}

/// How a child's stderr is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StderrMode {
    /// Merge stderr into the handle's output, a line at a time.
    #[default]
    Merge,
    /// Discard stderr.
    Discard,
}

/// A command to spawn, either as an argument vector or as a single string.
///
/// A string is split with shell quoting rules into an argument vector; it is
/// never interpreted by a shell unless shell mode is enabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandLine {
    Argv(Vec<String>),
    Line(String),
}

impl CommandLine {
    /// Resolves this command into an argument vector.
    pub fn to_argv(&self) -> Result<Vec<String>> {
        let argv = match self {
            Self::Argv(argv) => argv.clone(),
            Self::Line(line) => {
                shell_words::split(line).map_err(|e| Error::InvalidCommand {
                    command: line.clone(),
                    reason: e.to_string(),
                })?
            }
        };
        if argv.is_empty() {
            return Err(Error::InvalidCommand {
                command: self.to_string(),
                reason: "command is empty".to_string(),
            });
        }
        Ok(argv)
    }
}

impl std::fmt::Display for CommandLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Argv(argv) => f.write_str(&shell_words::join(argv)),
            Self::Line(line) => f.write_str(line),
        }
    }
}

impl From<&str> for CommandLine {
    fn from(line: &str) -> Self {
        Self::Line(line.to_string())
    }
}

impl From<String> for CommandLine {
    fn from(line: String) -> Self {
        Self::Line(line)
    }
}

impl From<Vec<String>> for CommandLine {
    fn from(argv: Vec<String>) -> Self {
        Self::Argv(argv)
    }
}

impl From<&[&str]> for CommandLine {
    fn from(argv: &[&str]) -> Self {
        Self::Argv(argv.iter().map(|s| s.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for CommandLine {
    fn from(argv: [&str; N]) -> Self {
        Self::Argv(argv.iter().map(|s| s.to_string()).collect())
    }
}

/// Session-wide spawn defaults.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub env: BTreeMap<String, String>,
    pub shell: bool,
    pub working_dir: Option<PathBuf>,
    pub cleanup: CleanupPolicy,
}

impl SessionConfig {
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn shell(mut self, shell: bool) -> Self {
        self.shell = shell;
        self
    }

    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn cleanup(mut self, policy: CleanupPolicy) -> Self {
        self.cleanup = policy;
        self
    }
}

/// Per-spawn overrides layered over [`SessionConfig`].
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub env: BTreeMap<String, String>,
    pub shell: Option<bool>,
    pub working_dir: Option<PathBuf>,
    pub kill_on_timeout: bool,
    pub stderr: StderrMode,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            env: BTreeMap::new(),
            shell: None,
            working_dir: None,
            kill_on_timeout: true,
            stderr: StderrMode::default(),
        }
    }
}

impl SpawnOptions {
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn shell(mut self, shell: bool) -> Self {
        self.shell = Some(shell);
        self
    }

    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn kill_on_timeout(mut self, kill: bool) -> Self {
        self.kill_on_timeout = kill;
        self
    }

    #[must_use]
    pub fn stderr(mut self, mode: StderrMode) -> Self {
        self.stderr = mode;
        self
    }
}

/// Factory and registry for [`ProcessHandle`]s sharing one set of defaults.
///
/// Dropping a session with [`CleanupPolicy::Kill`] kills every registered
/// process that is still running. The `Wait` policy can only be honoured
/// asynchronously, through [`shutdown`](Self::shutdown) or
/// [`scoped`](Self::scoped).
///
/// # Example
///
/// ```no_run
/// # async fn example() -> gpgctl::Result<()> {
/// use gpgctl::{ProcessSession, SessionConfig};
///
/// let session = ProcessSession::new(SessionConfig::default().env("LC_ALL", "C"));
/// let handle = session.run("gpg --version", None, None).await?;
/// println!("{}", handle.output_text());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ProcessSession {
    config: SessionConfig,
    processes: Mutex<HashMap<u32, ProcessHandle>>,
}

impl Default for ProcessSession {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl ProcessSession {
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            processes: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Spawns `command` with `options` merged over the session defaults and
    /// registers the handle under its process id.
    ///
    /// Stdin and stdout are always piped. Must be called from within a Tokio
    /// runtime.
    pub fn spawn(
        &self,
        command: impl Into<CommandLine>,
        options: SpawnOptions,
    ) -> Result<ProcessHandle> {
        let command = command.into();
        let argv = command.to_argv()?;
        let shell = options.shell.unwrap_or(self.config.shell);

        let (program, args): (OsString, Vec<String>) = if shell {
            ("sh".into(), vec!["-c".to_string(), shell_words::join(&argv)])
        } else {
            (argv[0].clone().into(), argv[1..].to_vec())
        };

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .envs(&self.config.env)
            .envs(&options.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(match options.stderr {
                StderrMode::Merge => Stdio::piped(),
                StderrMode::Discard => Stdio::null(),
            });
        if let Some(dir) = options.working_dir.as_ref().or(self.config.working_dir.as_ref()) {
            cmd.current_dir(dir);
        }

        let display = shell_words::join(&argv);
        let child = cmd.spawn().map_err(|source| Error::SpawnFailed {
            command: display.clone(),
            source,
        })?;

        let handle = ProcessHandle::attach(child, display, options.kill_on_timeout);
        // An exited process may have freed its pid for this one.
        self.live_registry().insert(handle.pid(), handle.clone());
        Ok(handle)
    }

    /// Spawns `command`, writes `input` (if any) and closes stdin, then waits
    /// for the process to finish.
    ///
    /// A nonzero exit status is not an error here; inspect the returned
    /// handle.
    pub async fn run(
        &self,
        command: impl Into<CommandLine>,
        input: Option<&[u8]>,
        timeout: Option<Duration>,
    ) -> Result<ProcessHandle> {
        self.run_with(command, SpawnOptions::default(), input, timeout)
            .await
    }

    /// [`run`](Self::run) with explicit spawn overrides.
    pub async fn run_with(
        &self,
        command: impl Into<CommandLine>,
        options: SpawnOptions,
        input: Option<&[u8]>,
        timeout: Option<Duration>,
    ) -> Result<ProcessHandle> {
        let handle = self.spawn(command, options)?;
        if let Some(input) = input {
            match handle.write(input).await {
                // The tool may exit without reading its input; its output and
                // status tell the caller what happened.
                Ok(()) | Err(Error::NotRunning { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        handle.close_stdin().await;
        let result = handle.wait(timeout).await;
        drop(self.live_registry());
        result?;
        Ok(handle)
    }

    /// Looks up a running process by id.
    pub fn get(&self, pid: u32) -> Option<ProcessHandle> {
        self.live_registry().get(&pid).cloned()
    }

    /// Snapshot of every process still running.
    pub fn handles(&self) -> Vec<ProcessHandle> {
        self.live_registry().values().cloned().collect()
    }

    /// Applies the cleanup policy to every registered process.
    pub async fn shutdown(&self) {
        let handles: Vec<ProcessHandle> = match self.config.cleanup {
            CleanupPolicy::Kill => self.registry().drain().map(|(_, h)| h).collect(),
            CleanupPolicy::Wait => self.handles(),
            CleanupPolicy::Ignore => return,
        };

        for handle in handles {
            if !handle.is_running() {
                continue;
            }
            match self.config.cleanup {
                CleanupPolicy::Kill => {
                    handle.kill();
                    let _ = handle.wait(None).await;
                }
                CleanupPolicy::Wait => {
                    debug!(pid = handle.pid(), "waiting for process before teardown");
                    let _ = handle.wait(None).await;
                }
                CleanupPolicy::Ignore => {}
            }
        }
    }

    /// Runs `body` with this session and applies the cleanup policy
    /// afterwards, whatever `body` returns.
    pub async fn scoped<T>(self, body: impl AsyncFnOnce(&ProcessSession) -> T) -> T {
        let result = body(&self).await;
        self.shutdown().await;
        result
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<u32, ProcessHandle>> {
        self.processes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The registry with exited processes dropped. Callers keep their own
    /// handles, so output stays readable through them.
    fn live_registry(&self) -> MutexGuard<'_, HashMap<u32, ProcessHandle>> {
        let mut registry = self.registry();
        let before = registry.len();
        registry.retain(|_, handle| handle.is_running());
        if registry.len() < before {
            trace!(released = before - registry.len(), "released exited processes");
        }
        registry
    }
}

impl Drop for ProcessSession {
    fn drop(&mut self) {
        if self.config.cleanup != CleanupPolicy::Kill {
            return;
        }
        for (_, handle) in self.registry().drain() {
            handle.kill();
        }
    }
}
