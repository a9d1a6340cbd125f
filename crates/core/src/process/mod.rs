//! Worker process management
//!
//! Handles spawning, exit monitoring and termination of worker processes.
//! Each worker runs in its own process group so teardown reaches any
//! helpers it forks.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{watch, Notify};

use crate::{Error, Result};

/// How a worker process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Clean exit
    Normal,
    /// Exit with error code
    Error(i32),
    /// Terminated by signal
    Killed,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Normal => write!(f, "exited normally"),
            ExitReason::Error(code) => write!(f, "exited with code {}", code),
            ExitReason::Killed => write!(f, "killed by signal"),
        }
    }
}

/// Process spawn configuration
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Worker executable
    pub program: PathBuf,

    pub args: Vec<String>,

    /// Extra environment variables
    pub env_vars: HashMap<String, String>,

    pub working_dir: Option<PathBuf>,

    /// Tag used in log lines forwarded from the worker
    pub label: String,
}

impl SpawnConfig {
    pub fn new(program: impl Into<PathBuf>, label: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env_vars: HashMap::new(),
            working_dir: None,
            label: label.into(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// A running worker process
///
/// The child is owned by a monitoring task; this handle only observes its
/// exit and asks for termination. Dropping the last handle does not kill
/// the process, [`WorkerProcess::terminate`] does.
#[derive(Debug)]
pub struct WorkerProcess {
    pid: u32,
    label: String,
    started_at: Instant,
    exit: watch::Receiver<Option<ExitReason>>,
    kill: Arc<Notify>,
}

impl WorkerProcess {
    /// Spawn a worker and start monitoring it
    pub fn spawn(config: SpawnConfig) -> Result<Self> {
        tracing::info!(
            program = %config.program.display(),
            args = ?config.args,
            worker = %config.label,
            "Spawning worker process"
        );

        let mut command = Command::new(&config.program);
        command.args(&config.args);
        for (key, value) in &config.env_vars {
            command.env(key, value);
        }
        if let Some(ref dir) = config.working_dir {
            command.current_dir(dir);
        }

        // Configure process group for cleanup
        #[cfg(unix)]
        command.process_group(0);

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| Error::BackendSpawnFailed {
            backend: config.label.clone(),
            reason: format!("failed to spawn {}: {}", config.program.display(), e),
        })?;

        let pid = child.id().ok_or_else(|| Error::BackendSpawnFailed {
            backend: config.label.clone(),
            reason: "process exited before reporting a pid".to_string(),
        })?;

        // Forward worker output into our log
        if let Some(stderr) = child.stderr.take() {
            let label = config.label.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::warn!(pid, worker = %label, "{}", line);
                }
            });
        }
        if let Some(stdout) = child.stdout.take() {
            let label = config.label.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(pid, worker = %label, "{}", line);
                }
            });
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = Arc::new(Notify::new());
        let kill_requested = Arc::clone(&kill);
        let label = config.label.clone();

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_requested.notified() => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };

            let reason = match status {
                Ok(s) if s.success() => ExitReason::Normal,
                Ok(s) => match s.code() {
                    Some(code) => ExitReason::Error(code),
                    None => ExitReason::Killed,
                },
                Err(e) => {
                    tracing::error!(pid, worker = %label, "Failed to wait on worker: {}", e);
                    ExitReason::Killed
                }
            };

            tracing::info!(pid, worker = %label, "Worker process {}", reason);
            let _ = exit_tx.send(Some(reason));
        });

        tracing::info!(pid, worker = %config.label, "Worker process spawned");

        Ok(Self {
            pid,
            label: config.label,
            started_at: Instant::now(),
            exit: exit_rx,
            kill,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Check if the process is still alive
    pub fn is_alive(&self) -> bool {
        self.exit.borrow().is_none()
    }

    /// Exit reason, once the process has terminated
    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.exit.borrow().clone()
    }

    /// Resolves once the process has terminated
    pub async fn exited(&self) -> ExitReason {
        let mut exit = self.exit.clone();
        let reason = match exit.wait_for(Option::is_some).await {
            Ok(reason) => (*reason).clone().unwrap_or(ExitReason::Killed),
            // monitor task gone, the child was reaped with it
            Err(_) => ExitReason::Killed,
        };
        reason
    }

    /// Resident set size in bytes, read from `/proc`
    pub fn resident_memory(&self) -> Option<u64> {
        resident_memory(self.pid)
    }

    /// Terminate gracefully: SIGTERM, wait up to `grace_period`, then kill
    pub async fn terminate(&self, grace_period: Duration) -> Result<()> {
        if !self.is_alive() {
            return Ok(());
        }

        tracing::info!(pid = self.pid, worker = %self.label, "Terminating worker process");

        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            let _ = killpg(Pid::from_raw(self.pid as i32), Signal::SIGTERM);
        }

        if self.wait_exit(grace_period).await {
            return Ok(());
        }

        tracing::warn!(
            pid = self.pid,
            worker = %self.label,
            "Worker did not terminate gracefully, forcing kill"
        );

        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            let _ = killpg(Pid::from_raw(self.pid as i32), Signal::SIGKILL);
        }
        self.kill.notify_one();

        if self.wait_exit(Duration::from_secs(5)).await {
            Ok(())
        } else {
            Err(Error::Io(format!(
                "worker process {} did not exit after kill",
                self.pid
            )))
        }
    }

    async fn wait_exit(&self, limit: Duration) -> bool {
        let mut exit = self.exit.clone();
        let exited = matches!(
            tokio::time::timeout(limit, exit.wait_for(|r| r.is_some())).await,
            Ok(Ok(_))
        );
        exited
    }
}

/// Resident set size of `pid` in bytes
#[cfg(target_os = "linux")]
pub fn resident_memory(pid: u32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
    status
        .lines()
        .find(|line| line.starts_with("VmRSS:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

/// Resident set size of `pid` in bytes
#[cfg(not(target_os = "linux"))]
pub fn resident_memory(_pid: u32) -> Option<u64> {
    None
}
