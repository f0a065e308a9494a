//! Process orchestration for the measurement binary
//!
//! One [`Orchestrator`] is built at start-up and shared with the HTTP
//! handlers. It owns the process table; the record store is the source of
//! truth across restarts. Every operation that needs both reads the store
//! first and then reconciles against the table or the OS.

mod client;
mod error;
mod exit;

pub use error::OrchestratorError;

use crate::config::BinaryConfig;
use crate::process::{
    IdGenerator, OutputReaders, ProcessHandle, ProcessTable, Role, pid_is_alive, terminate_pid,
};
use crate::storage::{Database, ServerInstance, ServerStatus};
use chrono::Utc;
use protocol::{ArgBuilder, ServerParams, command_line};
use serde::Serialize;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, info, warn};

/// How long exit handling waits for stdout/stderr to reach EOF
const DRAIN_LIMIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BinaryInfo {
    pub available: bool,
    pub path: String,
    pub exists: bool,
    pub executable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStarted {
    pub process_id: String,
    pub pid: Option<u32>,
    pub config: ServerParams,
    pub command_line: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatusView {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Seconds; only known while we hold the handle
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
    pub machine_id: String,
}

pub struct Orchestrator {
    db: Arc<Database>,
    processes: ProcessTable,
    binary: BinaryConfig,
    machine_id: String,
    ids: IdGenerator,
    /// Serialises server starts so the one-running-server check cannot race
    server_start: Mutex<()>,
}

impl Orchestrator {
    pub fn new(db: Arc<Database>, binary: BinaryConfig, machine_id: String) -> Self {
        Self {
            db,
            processes: ProcessTable::new(),
            binary,
            machine_id,
            ids: IdGenerator::new(),
            server_start: Mutex::new(()),
        }
    }

    pub fn binary_config(&self) -> &BinaryConfig {
        &self.binary
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    fn arg_builder(&self) -> ArgBuilder<'_> {
        ArgBuilder::new(&self.binary.flags, self.binary.default_port)
    }

    fn binary_path(&self) -> String {
        self.binary.path.display().to_string()
    }

    pub async fn check_binary(&self) -> BinaryInfo {
        let path = self.binary_path();
        match tokio::fs::metadata(&self.binary.path).await {
            Ok(meta) => {
                let executable = meta.is_file() && meta.permissions().mode() & 0o111 != 0;
                BinaryInfo {
                    available: executable,
                    path,
                    exists: true,
                    executable,
                    error: (!executable).then(|| "File is not executable".to_string()),
                }
            }
            Err(e) => BinaryInfo {
                available: false,
                path,
                exists: false,
                executable: false,
                error: Some(e.to_string()),
            },
        }
    }

    async fn ensure_binary(&self) -> Result<(), OrchestratorError> {
        let info = self.check_binary().await;
        if info.available {
            Ok(())
        } else {
            Err(OrchestratorError::BinaryNotFound {
                path: info.path,
                reason: info.error.unwrap_or_default(),
            })
        }
    }

    /// Start the measurement binary in server mode.
    ///
    /// Non-daemon starts wait up to `startup_grace_ms` so a server that dies
    /// immediately is reported as a failure rather than a success.
    pub async fn start_server(
        &self,
        params: ServerParams,
    ) -> Result<ServerStarted, OrchestratorError> {
        let _guard = self.server_start.lock().await;

        self.ensure_binary().await?;

        if let Some(existing) = self.db.get_active_server_instance(&self.machine_id).await? {
            let tracked = self.processes.contains(&existing.process_id).await;
            let alive = existing.pid.is_some_and(pid_is_alive);
            if tracked || alive {
                return Err(OrchestratorError::AlreadyRunning(existing.process_id));
            }
            warn!(
                process_id = %existing.process_id,
                pid = ?existing.pid,
                "Found stale server record, marking stopped"
            );
            self.db.mark_server_stopped(&existing.process_id).await?;
        }

        let args = self.arg_builder().server(&params);
        let command = command_line(&self.binary_path(), &args);
        let process_id = self.ids.next("server");

        let mut cmd = Command::new(&self.binary.path);
        cmd.args(&args).stdin(Stdio::null());
        if params.daemon {
            cmd.stdout(Stdio::null())
                .stderr(Stdio::null())
                .process_group(0);
        } else {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| OrchestratorError::ProcessSpawn(e.to_string()))?;
        let pid = child.id();

        let handle = ProcessHandle::new(process_id.clone(), Role::Server, pid, command.clone());
        let readers = if params.daemon {
            OutputReaders::none()
        } else {
            handle.output.capture(&mut child)
        };
        let output = handle.output.clone();
        self.processes.insert(handle).await;

        let instance = ServerInstance {
            process_id: process_id.clone(),
            pid,
            port: params.port,
            interface: params.interface.clone(),
            ip_version: params.ip_version.map(|v| v.as_str().to_string()),
            config: serde_json::to_value(&params).unwrap_or_default(),
            machine_id: self.machine_id.clone(),
            status: ServerStatus::Running,
            created_at: Utc::now(),
            stopped_at: None,
        };
        if let Err(e) = self.db.create_server_instance(&instance).await {
            self.processes.claim(&process_id).await;
            let _ = child.start_kill();
            return Err(e.into());
        }

        info!(process_id = %process_id, pid = ?pid, daemon = params.daemon, "Server started: {}", command);

        let (exit_tx, exit_rx) = oneshot::channel();
        let db = self.db.clone();
        let processes = self.processes.clone();
        let daemon = params.daemon;
        let reaper_id = process_id.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            readers.drain(DRAIN_LIMIT).await;
            let reason = describe_exit(status, &output.stderr().await);

            // A daemonising binary exits right after forking; the record and
            // handle stay until an explicit stop.
            if daemon {
                debug!(process_id = %reaper_id, "Daemon launcher exited: {}", reason);
                return;
            }

            if processes.claim(&reaper_id).await.is_some() {
                info!(process_id = %reaper_id, "Server exited: {}", reason);
                if let Err(e) = db.mark_server_stopped(&reaper_id).await {
                    warn!(process_id = %reaper_id, "Failed to record server exit: {:#}", e);
                }
            }
            let _ = exit_tx.send(reason);
        });

        if !daemon {
            let grace = Duration::from_millis(self.binary.startup_grace_ms);
            if let Ok(Ok(reason)) = tokio::time::timeout(grace, exit_rx).await {
                warn!(process_id = %process_id, "Server died during startup: {}", reason);
                return Err(OrchestratorError::StartupFailed(reason));
            }
        }

        Ok(ServerStarted {
            process_id,
            pid,
            config: params,
            command_line: command,
        })
    }

    /// Signal the active server and mark it stopped.
    pub async fn stop_server(&self) -> Result<(), OrchestratorError> {
        let instance = self
            .db
            .get_active_server_instance(&self.machine_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotRunning("Server".to_string()))?;

        let handle = self.processes.claim(&instance.process_id).await;
        let pid = handle.and_then(|h| h.pid).or(instance.pid);

        match pid {
            Some(pid) if terminate_pid(pid) => {
                info!(process_id = %instance.process_id, pid, "Sent SIGTERM to server");
            }
            Some(pid) => {
                debug!(process_id = %instance.process_id, pid, "Server process already gone");
            }
            None => {
                debug!(process_id = %instance.process_id, "No pid recorded for server");
            }
        }

        self.db.mark_server_stopped(&instance.process_id).await?;
        Ok(())
    }

    pub async fn server_status(&self) -> Result<ServerStatusView, OrchestratorError> {
        let Some(instance) = self.db.get_active_server_instance(&self.machine_id).await? else {
            return Ok(ServerStatusView {
                running: false,
                process_id: None,
                pid: None,
                uptime: None,
                config: None,
                machine_id: self.machine_id.clone(),
            });
        };

        let uptime = self
            .processes
            .get(&instance.process_id)
            .await
            .map(|h| h.started_at.elapsed().as_secs());

        Ok(ServerStatusView {
            running: true,
            process_id: Some(instance.process_id),
            pid: instance.pid,
            uptime,
            config: Some(instance.config),
            machine_id: self.machine_id.clone(),
        })
    }
}

fn describe_exit(status: std::io::Result<ExitStatus>, stderr: &str) -> String {
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        return stderr.to_string();
    }
    match status {
        Ok(status) => match (status.code(), status.signal()) {
            (Some(code), _) => format!("exited with code {code}"),
            (None, Some(signal)) => format!("terminated by signal {signal}"),
            (None, None) => "exited".to_string(),
        },
        Err(e) => format!("wait failed: {e}"),
    }
}
