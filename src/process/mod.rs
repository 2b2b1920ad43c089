//! Process Supervisor: spawns, tracks, and force-terminates child processes
//! (including descendants). The supervisor knows nothing about models —
//! callers refer to processes by a logical name string, never a handle,
//! which keeps the controller/supervisor relationship acyclic.

mod kill;

use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex as AsyncMutex;

use crate::errors::{OrchestratorError, Result};

const STOPPED_RECORD_CAP: usize = 50;
const LIVENESS_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub name: String,
    pub pid: Option<u32>,
    pub status: ProcessStatus,
    pub start_time: f64,
    pub stop_time: Option<f64>,
    pub exit_code: Option<i32>,
    pub command: String,
    pub description: Option<String>,
}

struct ManagedProcess {
    info: ProcessInfo,
    child: Option<Child>,
}

/// A line sink that captured stdout/stderr is appended to. Callers (the
/// model controller) provide one bound to the model's bounded ring buffer.
pub type LogSink = Arc<dyn Fn(String) + Send + Sync>;

pub struct ProcessSupervisor {
    processes: AsyncMutex<HashMap<String, ManagedProcess>>,
    stopped_order: AsyncMutex<VecDeque<String>>,
}

impl ProcessSupervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            processes: AsyncMutex::new(HashMap::new()),
            stopped_order: AsyncMutex::new(VecDeque::new()),
        })
    }

    /// Spawns `command` (shell-interpreted) in `cwd`, in a new process
    /// group, capturing combined stdout+stderr line-by-line into `sink`.
    pub async fn spawn(
        &self,
        name: &str,
        command: &str,
        cwd: &std::path::Path,
        description: Option<String>,
        sink: LogSink,
    ) -> Result<u32> {
        let mut cmd = shell_command(command);
        cmd.current_dir(cwd);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        new_process_group(&mut cmd);

        let mut child = cmd
            .spawn()
            .map_err(|e| OrchestratorError::Internal(format!("spawn '{name}' failed: {e}")))?;

        let pid = child.id().ok_or_else(|| {
            OrchestratorError::Internal(format!("spawned process '{name}' has no pid"))
        })?;

        if let Some(stdout) = child.stdout.take() {
            spawn_log_reader(stdout, sink.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_log_reader(stderr, sink);
        }

        let info = ProcessInfo {
            name: name.to_string(),
            pid: Some(pid),
            status: ProcessStatus::Running,
            start_time: now_secs(),
            stop_time: None,
            exit_code: None,
            command: command.to_string(),
            description,
        };

        let mut processes = self.processes.lock().await;
        processes.insert(name.to_string(), ManagedProcess { info, child: Some(child) });
        Ok(pid)
    }

    pub async fn is_alive(&self, name: &str) -> bool {
        let processes = self.processes.lock().await;
        match processes.get(name) {
            Some(p) => matches!(p.info.status, ProcessStatus::Running | ProcessStatus::Starting),
            None => false,
        }
    }

    pub async fn info(&self, name: &str) -> Option<ProcessInfo> {
        self.processes.lock().await.get(name).map(|p| p.info.clone())
    }

    /// Graceful stop: polite signal, wait up to `timeout`, escalate to a
    /// forceful tree-kill on timeout. Idempotent.
    pub async fn stop(&self, name: &str, force: bool, timeout: Duration) -> Result<()> {
        let pid = {
            let mut processes = self.processes.lock().await;
            let Some(managed) = processes.get_mut(name) else { return Ok(()) };
            if matches!(managed.info.status, ProcessStatus::Stopped | ProcessStatus::Failed) {
                return Ok(());
            }
            managed.info.status = ProcessStatus::Stopping;
            managed.info.pid
        };

        if let Some(pid) = pid {
            if force {
                kill::kill_tree(pid);
            } else {
                kill::terminate_gracefully(pid, timeout).await;
            }
        }

        let mut processes = self.processes.lock().await;
        if let Some(managed) = processes.get_mut(name) {
            managed.info.status = ProcessStatus::Stopped;
            managed.info.stop_time = Some(now_secs());
            if let Some(mut child) = managed.child.take() {
                managed.info.exit_code = child.try_wait().ok().flatten().and_then(|s| s.code());
            }
        }
        drop(processes);
        self.retain_bounded(name).await;
        Ok(())
    }

    /// Stops every tracked, non-stopped process in parallel, each escalating
    /// to a forceful kill after `per_process_deadline`.
    pub async fn stop_all(self: &Arc<Self>, per_process_deadline: Duration) {
        let names: Vec<String> = {
            let processes = self.processes.lock().await;
            processes
                .iter()
                .filter(|(_, p)| !matches!(p.info.status, ProcessStatus::Stopped | ProcessStatus::Failed))
                .map(|(name, _)| name.clone())
                .collect()
        };

        let mut handles = Vec::new();
        for name in names {
            let me = self.clone();
            handles.push(tokio::spawn(async move {
                let _ = me.stop(&name, false, per_process_deadline).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Background liveness sweep: every ~10s, checks each running process's
    /// child handle and moves dead ones to `Stopped`. Callers that need to
    /// react to unexpected exits (the model controller) should poll
    /// `info()`/`is_alive()` rather than subscribe to this loop directly.
    pub fn spawn_liveness_sweep(self: &Arc<Self>) {
        let me = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(LIVENESS_SWEEP_INTERVAL).await;
                me.sweep_dead_processes().await;
            }
        });
    }

    async fn sweep_dead_processes(&self) {
        let mut processes = self.processes.lock().await;
        for managed in processes.values_mut() {
            if managed.info.status != ProcessStatus::Running {
                continue;
            }
            if let Some(child) = managed.child.as_mut() {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        managed.info.status = ProcessStatus::Stopped;
                        managed.info.stop_time = Some(now_secs());
                        managed.info.exit_code = status.code();
                    }
                    Ok(None) => {}
                    Err(_) => {
                        managed.info.status = ProcessStatus::Stopped;
                        managed.info.stop_time = Some(now_secs());
                    }
                }
            }
        }
    }

    async fn retain_bounded(&self, name: &str) {
        let mut order = self.stopped_order.lock().await;
        order.retain(|n| n != name);
        order.push_back(name.to_string());
        if order.len() > STOPPED_RECORD_CAP {
            if let Some(oldest) = order.pop_front() {
                self.processes.lock().await.remove(&oldest);
            }
        }
    }
}

fn now_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

#[cfg(unix)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

#[cfg(unix)]
fn new_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    unsafe {
        cmd.pre_exec(|| {
            libc::setpgid(0, 0);
            Ok(())
        });
    }
}

#[cfg(windows)]
fn new_process_group(cmd: &mut Command) {
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
    cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
}

fn spawn_log_reader<R>(reader: R, sink: LogSink)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            sink(line);
        }
    });
}
