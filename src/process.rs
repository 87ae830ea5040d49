use crate::config::BackendConfig;
use crate::log::{self, OutputSink};
use crate::sys;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const DEFAULT_STOP_COMMAND: &str = "stop";
pub const DEFAULT_STOP_TIMEOUT_SECS: u64 = 20;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    #[error("failed to launch: {0}")]
    Launch(#[from] std::io::Error),
    #[error("invalid signal: {0}")]
    InvalidSignal(String),
    #[error("backend is not running")]
    NotRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    Exited,
    /// The stop timeout elapsed (or signaling failed) and the child was killed.
    ForceKilled,
}

// ---------------------------------------------------------------------------
// Command parsing
// ---------------------------------------------------------------------------

pub fn parse_command(command: &str) -> Result<(String, Vec<String>), ProcessError> {
    let words = shell_words::split(command)
        .map_err(|e| ProcessError::InvalidCommand(format!("failed to parse: {e}")))?;

    let Some((program, args)) = words.split_first() else {
        return Err(ProcessError::InvalidCommand("command is empty".to_string()));
    };
    Ok((program.clone(), args.to_vec()))
}

/// Resolve the configured output destination; relative log paths live under `cwd`.
pub fn output_sink(config: &BackendConfig) -> OutputSink {
    let Some(ref file) = config.log_file else {
        return OutputSink::Tracing;
    };
    let mut path = PathBuf::from(file);
    if path.is_relative()
        && let Some(ref cwd) = config.cwd
    {
        path = PathBuf::from(cwd).join(path);
    }
    OutputSink::File {
        path,
        date_format: config.log_date_format.clone(),
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

struct RunningChild {
    child: Child,
    pid: Option<u32>,
    started_at: Instant,
}

/// Clears a flag when dropped, so every exit path releases it.
struct FlagGuard<'a>(&'a AtomicBool);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Owns one backend's child process.
///
/// Start and stop are serialized per backend; state queries never wait on
/// an in-flight operation.
pub struct Supervisor {
    name: String,
    config: RwLock<BackendConfig>,
    op_lock: tokio::sync::Mutex<()>,
    child: Mutex<Option<RunningChild>>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    starting: AtomicBool,
    stopping: AtomicBool,
    last_start: Mutex<Option<Instant>>,
}

impl Supervisor {
    pub fn new(name: impl Into<String>, config: BackendConfig) -> Self {
        Self {
            name: name.into(),
            config: RwLock::new(config),
            op_lock: tokio::sync::Mutex::new(()),
            child: Mutex::new(None),
            stdin: tokio::sync::Mutex::new(None),
            starting: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            last_start: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> BackendConfig {
        match self.config.read() {
            Ok(config) => config.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Swap in new settings; they take effect on the next start or stop.
    pub fn replace_config(&self, config: BackendConfig) {
        match self.config.write() {
            Ok(mut guard) => *guard = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
    }

    fn child_slot(&self) -> std::sync::MutexGuard<'_, Option<RunningChild>> {
        self.child.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// True while a child exists or a stop is still in progress.
    ///
    /// A child that exited on its own is reaped here.
    pub fn is_running(&self) -> bool {
        if self.stopping.load(Ordering::SeqCst) {
            return true;
        }
        let mut slot = self.child_slot();
        let Some(running) = slot.as_mut() else {
            return false;
        };
        match running.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                tracing::warn!(backend = %self.name, %status, "backend exited on its own");
                *slot = None;
                // A writer holding the lock sees NotRunning on its next write.
                if let Ok(mut stdin) = self.stdin.try_lock() {
                    *stdin = None;
                }
                false
            }
            Err(e) => {
                tracing::warn!(backend = %self.name, "could not poll backend: {e}");
                true
            }
        }
    }

    pub fn is_starting(&self) -> bool {
        self.starting.load(Ordering::SeqCst)
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// True if the last start happened less than `window` ago.
    pub fn recently_started(&self, window: Duration) -> bool {
        let last = *self.last_start.lock().unwrap_or_else(|e| e.into_inner());
        last.is_some_and(|at| at.elapsed() < window)
    }

    pub fn pid(&self) -> Option<u32> {
        self.child_slot().as_ref().and_then(|r| r.pid)
    }

    pub fn uptime(&self) -> Option<Duration> {
        self.child_slot().as_ref().map(|r| r.started_at.elapsed())
    }

    pub async fn start(&self) -> Result<StartOutcome, ProcessError> {
        let _op = self.op_lock.lock().await;

        if self.is_running() || self.starting.swap(true, Ordering::SeqCst) {
            tracing::info!(backend = %self.name, "start requested but backend is already up");
            return Ok(StartOutcome::AlreadyRunning);
        }
        let _starting = FlagGuard(&self.starting);

        let config = self.config();
        let (program, args) = parse_command(&config.command)?;

        let mut cmd = Command::new(&program);
        cmd.args(&args);
        if let Some(ref cwd) = config.cwd {
            cmd.current_dir(cwd);
        }
        if let Some(ref env_vars) = config.env {
            cmd.envs(env_vars);
        }
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let pid = child.id();
        let started_at = Instant::now();

        if let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) {
            log::spawn_output_copier(self.name.clone(), stdout, stderr, output_sink(&config));
        }
        *self.stdin.lock().await = child.stdin.take();
        *self.child_slot() = Some(RunningChild {
            child,
            pid,
            started_at,
        });
        *self.last_start.lock().unwrap_or_else(|e| e.into_inner()) = Some(started_at);

        tracing::info!(backend = %self.name, pid = ?pid, "backend started");
        Ok(StartOutcome::Started)
    }

    /// Ask the backend to shut down, killing it if it ignores the request.
    pub async fn stop_gracefully(&self) -> StopOutcome {
        let _op = self.op_lock.lock().await;

        if !self.is_running() {
            return StopOutcome::NotRunning;
        }
        self.stopping.store(true, Ordering::SeqCst);
        let _stopping = FlagGuard(&self.stopping);

        let Some(mut running) = self.child_slot().take() else {
            return StopOutcome::NotRunning;
        };
        let stdin = self.stdin.lock().await.take();
        let config = self.config();
        let timeout =
            Duration::from_secs(config.stop_timeout.unwrap_or(DEFAULT_STOP_TIMEOUT_SECS));

        let requested = match self.request_stop(&config, stdin, running.pid).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(backend = %self.name, "could not request stop: {e}");
                false
            }
        };

        if requested {
            match tokio::time::timeout(timeout, running.child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::info!(backend = %self.name, %status, "backend stopped");
                    return StopOutcome::Exited;
                }
                Ok(Err(e)) => {
                    tracing::warn!(backend = %self.name, "error waiting for backend: {e}");
                }
                Err(_) => {
                    tracing::warn!(
                        backend = %self.name,
                        timeout_secs = timeout.as_secs(),
                        "backend ignored stop request, killing"
                    );
                }
            }
        }

        if let Err(e) = running.child.kill().await {
            tracing::error!(backend = %self.name, "failed to kill backend: {e}");
        }
        StopOutcome::ForceKilled
    }

    async fn request_stop(
        &self,
        config: &BackendConfig,
        stdin: Option<ChildStdin>,
        pid: Option<u32>,
    ) -> Result<(), ProcessError> {
        if let Some(ref signal_name) = config.stop_signal {
            let signal = sys::parse_signal(signal_name)?;
            let pid = pid.ok_or(ProcessError::NotRunning)?;
            sys::send_signal(pid, signal)?;
            return Ok(());
        }

        let mut stdin = stdin.ok_or(ProcessError::NotRunning)?;
        let command = config
            .stop_command
            .as_deref()
            .unwrap_or(DEFAULT_STOP_COMMAND);
        stdin.write_all(format!("{command}\n").as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    #[cfg(test)]
    fn has_stdin(&self) -> bool {
        self.stdin.try_lock().map(|s| s.is_some()).unwrap_or(true)
    }

    /// Write one console line to the backend's stdin.
    pub async fn send_command(&self, line: &str) -> Result<(), ProcessError> {
        if self.is_stopping() || !self.is_running() {
            return Err(ProcessError::NotRunning);
        }
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(ProcessError::NotRunning)?;
        stdin.write_all(format!("{line}\n").as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("name", &self.name)
            .field("starting", &self.is_starting())
            .field("stopping", &self.is_stopping())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
