use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;

use crate::allocation::AllocResult;
use crate::allocation::allocator::{AllocFuture, WorkerHandle, WorkerInfo};
use crate::allocation::config::{get_worker_startup_timeout, get_worker_stop_timeout};

/// Starts worker processes for an allocator.
pub trait WorkerLauncher: Send + Sync {
    fn launch<'a>(&'a self, name: &'a str)
    -> AllocFuture<'a, AllocResult<Box<dyn WorkerHandle>>>;
}

/// Launches `<program> <args..> worker --name <name>` and waits until the worker reports itself
/// with a single JSON line on its stdout.
pub struct ProcessLauncher {
    /// `None` stands for the current executable.
    program: Option<PathBuf>,
    args: Vec<OsString>,
    startup_timeout: Duration,
    stop_timeout: Duration,
}

impl ProcessLauncher {
    pub fn new(program: PathBuf, args: Vec<OsString>) -> Self {
        Self {
            program: Some(program),
            args,
            startup_timeout: get_worker_startup_timeout(),
            stop_timeout: get_worker_stop_timeout(),
        }
    }

    pub fn current_exe() -> Self {
        Self {
            program: None,
            args: vec![],
            startup_timeout: get_worker_startup_timeout(),
            stop_timeout: get_worker_stop_timeout(),
        }
    }

    pub fn with_timeouts(mut self, startup_timeout: Duration, stop_timeout: Duration) -> Self {
        self.startup_timeout = startup_timeout;
        self.stop_timeout = stop_timeout;
        self
    }

    fn create_command(&self, name: &str) -> AllocResult<Command> {
        let program = match &self.program {
            Some(program) => program.clone(),
            None => std::env::current_exe().context("Cannot resolve the current executable")?,
        };
        let mut command = Command::new(program);
        command
            .args(&self.args)
            .arg("worker")
            .arg("--name")
            .arg(name)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        Ok(command)
    }

    async fn start_worker(&self, name: &str) -> AllocResult<ProcessWorker> {
        let mut command = self.create_command(name)?;
        let mut child = command
            .spawn()
            .with_context(|| anyhow!("Cannot start worker command {command:?}"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("Worker {name} has no stdout"))?;
        let stdin = child.stdin.take();

        let mut lines = BufReader::new(stdout).lines();
        let line = match tokio::time::timeout(self.startup_timeout, lines.next_line()).await {
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => {
                let status = child.wait().await?;
                bail!("Worker {name} exited before it reported its startup ({status})");
            }
            Ok(Err(error)) => {
                return Err(anyhow!(error).context(format!("Cannot read output of worker {name}")));
            }
            Err(_) => bail!(
                "Worker {name} did not start within {}",
                humantime::format_duration(self.startup_timeout)
            ),
        };

        let info: WorkerInfo = serde_json::from_str(line.trim())
            .with_context(|| anyhow!("Worker {name} reported invalid metadata `{line}`"))?;
        if info.name != name {
            bail!(
                "Worker {name} reported an unexpected name `{}`",
                info.name
            );
        }
        log::debug!(
            "Worker {} started with pid {} on {} (local pid {:?})",
            info.name,
            info.pid,
            info.host,
            child.id()
        );
        Ok(ProcessWorker {
            info,
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            stop_timeout: self.stop_timeout,
        })
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch<'a>(
        &'a self,
        name: &'a str,
    ) -> AllocFuture<'a, AllocResult<Box<dyn WorkerHandle>>> {
        Box::pin(async move {
            let worker = self.start_worker(name).await?;
            Ok(Box::new(worker) as Box<dyn WorkerHandle>)
        })
    }
}

/// Worker running in a child process. The process is killed when the handle is dropped.
pub struct ProcessWorker {
    info: WorkerInfo,
    child: Mutex<Child>,
    /// Workers stop when their stdin is closed, which also covers workers behind `ssh`.
    stdin: Mutex<Option<ChildStdin>>,
    stop_timeout: Duration,
}

impl ProcessWorker {
    async fn stop(&self) -> AllocResult<()> {
        drop(self.stdin.lock().await.take());

        let mut child = self.child.lock().await;
        let Some(pid) = child.id() else {
            // Already reaped
            return Ok(());
        };
        if let Err(error) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            log::debug!("Cannot send SIGTERM to worker {}: {error:?}", self.info.name);
        }
        match tokio::time::timeout(self.stop_timeout, child.wait()).await {
            Ok(status) => {
                let status = status?;
                log::debug!("Worker {} has ended with {status}", self.info.name);
            }
            Err(_) => {
                log::warn!(
                    "Worker {} did not stop within {}, killing it",
                    self.info.name,
                    humantime::format_duration(self.stop_timeout)
                );
                child
                    .kill()
                    .await
                    .with_context(|| anyhow!("Cannot kill worker {}", self.info.name))?;
            }
        }
        Ok(())
    }
}

impl WorkerHandle for ProcessWorker {
    fn name(&self) -> &str {
        &self.info.name
    }

    fn pid(&self) -> u32 {
        self.info.pid
    }

    fn host(&self) -> &str {
        &self.info.host
    }

    fn cleanup(&self) -> AllocFuture<'_, AllocResult<()>> {
        Box::pin(self.stop())
    }
}
