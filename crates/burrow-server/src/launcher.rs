//! Child process registry for cloudflared and xray
//!
//! Every child is registered under a key (`tunnel:<domain>`, `proxy`, `temp`).
//! Starting a key stops whatever ran under it before, so at most one child
//! lives per key. Children are killed when the registry drops them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

pub const PROXY_KEY: &str = "proxy";
pub const TEMP_TUNNEL_KEY: &str = "temp";

pub fn tunnel_key(domain: &str) -> String {
    format!("tunnel:{}", domain)
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to open log file {}: {source}", path.display())]
    Log {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    Append,
    Truncate,
}

/// What to run and where its output goes
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub log_path: PathBuf,
    pub log_mode: LogMode,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>, log_path: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            log_path: log_path.into(),
            log_mode: LogMode::Append,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn truncate_log(mut self) -> Self {
        self.log_mode = LogMode::Truncate;
        self
    }
}

struct ManagedProcess {
    child: Child,
    pid: Option<u32>,
    log_path: PathBuf,
    started_at: DateTime<Utc>,
}

/// Snapshot of a registered child
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: Option<u32>,
    pub log_path: PathBuf,
    pub started_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct ProcessLauncher {
    processes: Mutex<HashMap<String, ManagedProcess>>,
}

impl ProcessLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start `spec` under `key`, replacing any previous child. Returns the pid.
    pub async fn start(&self, key: &str, spec: LaunchSpec) -> Result<Option<u32>, LaunchError> {
        let mut processes = self.processes.lock().await;

        if let Some(previous) = processes.remove(key) {
            tracing::info!("Replacing {} (pid {:?})", key, previous.pid);
            stop_process(key, previous).await;
        }

        let log = open_log(&spec.log_path, spec.log_mode).map_err(|source| LaunchError::Log {
            path: spec.log_path.clone(),
            source,
        })?;
        let log_err = log.try_clone().map_err(|source| LaunchError::Log {
            path: spec.log_path.clone(),
            source,
        })?;

        let child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                program: spec.program.clone(),
                source,
            })?;

        let pid = child.id();
        tracing::info!(
            "Started {} as pid {:?}: {} (log: {})",
            key,
            pid,
            spec.program.display(),
            spec.log_path.display()
        );

        processes.insert(
            key.to_string(),
            ManagedProcess {
                child,
                pid,
                log_path: spec.log_path,
                started_at: Utc::now(),
            },
        );
        Ok(pid)
    }

    /// Stop the child under `key`. Returns whether one was registered.
    pub async fn stop(&self, key: &str) -> bool {
        let process = self.processes.lock().await.remove(key);
        match process {
            Some(process) => {
                stop_process(key, process).await;
                true
            }
            None => false,
        }
    }

    /// Whether the child under `key` is alive; exited children are reaped
    pub async fn is_running(&self, key: &str) -> bool {
        let mut processes = self.processes.lock().await;
        let exited = match processes.get_mut(key) {
            Some(process) => match process.child.try_wait() {
                Ok(None) => false,
                Ok(Some(status)) => {
                    tracing::info!("{} (pid {:?}) exited with {}", key, process.pid, status);
                    true
                }
                Err(e) => {
                    tracing::warn!("Failed to poll {}: {}", key, e);
                    true
                }
            },
            None => return false,
        };

        if exited {
            processes.remove(key);
        }
        !exited
    }

    pub async fn info(&self, key: &str) -> Option<ProcessInfo> {
        if !self.is_running(key).await {
            return None;
        }
        let processes = self.processes.lock().await;
        processes.get(key).map(|p| ProcessInfo {
            pid: p.pid,
            log_path: p.log_path.clone(),
            started_at: p.started_at,
        })
    }

    /// Stop every registered child (shutdown)
    pub async fn stop_all(&self) {
        let drained: Vec<(String, ManagedProcess)> =
            self.processes.lock().await.drain().collect();
        for (key, process) in drained {
            stop_process(&key, process).await;
        }
    }
}

async fn stop_process(key: &str, mut process: ManagedProcess) {
    match tokio::time::timeout(STOP_TIMEOUT, process.child.kill()).await {
        Ok(Ok(())) => tracing::info!("Stopped {} (pid {:?})", key, process.pid),
        Ok(Err(e)) => tracing::debug!("Stopping {} (pid {:?}): {}", key, process.pid, e),
        Err(_) => tracing::warn!("Timed out stopping {} (pid {:?})", key, process.pid),
    }
}

fn open_log(path: &Path, mode: LogMode) -> std::io::Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut options = std::fs::OpenOptions::new();
    options.create(true);
    match mode {
        LogMode::Append => options.append(true),
        LogMode::Truncate => options.write(true).truncate(true),
    };
    options.open(path)
}

/// A regular file with an executable bit
pub fn binary_available(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => is_executable(&meta),
        _ => false,
    }
}

#[cfg(unix)]
fn is_executable(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &std::fs::Metadata) -> bool {
    true
}
