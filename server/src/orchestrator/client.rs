//! Client test runs

use super::exit::{RunContext, classify_exit};
use super::{DRAIN_LIMIT, Orchestrator, OrchestratorError};
use crate::process::{
    OutputBuffers, OutputReaders, ProcessHandle, ProcessTable, Role, terminate_pid,
};
use crate::storage::{Database, TestRecord, TestStatus};
use chrono::{DateTime, Utc};
use protocol::{ClientParams, command_line};
use serde::Serialize;
use serde_json::Value;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestStarted {
    pub test_id: String,
    pub status: TestStatus,
    pub command_line: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestStatusView {
    pub test_id: String,
    pub status: TestStatus,
    pub progress: u8,
    pub start_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub warning_message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsView {
    pub throughput: f64,
    pub packet_loss: f64,
    pub latency: f64,
    pub jitter: f64,
    pub duration: Option<u64>,
    pub connections: Option<u64>,
    pub interval_count: u32,
    pub completion_percentage: f64,
    pub quality: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResultsView {
    pub test_id: String,
    pub status: TestStatus,
    pub results: Option<MetricsView>,
    pub raw_output: Option<Value>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub warning_message: Option<String>,
    pub command_line: Option<String>,
}

/// A client test we still hold a live handle for
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveTest {
    pub test_id: String,
    pub servers: Vec<String>,
    pub pid: Option<u32>,
    pub progress: u8,
    pub started_at: DateTime<Utc>,
    pub elapsed: u64,
    pub command_line: String,
}

impl Orchestrator {
    /// Spawn a client run and return once it is `running`.
    ///
    /// Parameters are assumed validated by the caller. The terminal state is
    /// written later by whichever of natural exit, watchdog or
    /// [`stop_test`](Self::stop_test) gets there first.
    pub async fn start_client_test(
        &self,
        params: ClientParams,
    ) -> Result<TestStarted, OrchestratorError> {
        self.ensure_binary().await?;

        let active = self.processes.count(Role::Client).await;
        if active >= self.binary.max_concurrent_tests {
            warn!(
                active,
                limit = self.binary.max_concurrent_tests,
                "Concurrent client tests above configured ceiling"
            );
        }

        let test_id = self.ids.next("test");
        let config = serde_json::to_value(&params).unwrap_or_default();
        self.db
            .create_test(&test_id, params.test_type.as_str(), &params.servers, &config)
            .await?;

        let args = self.arg_builder().client(&params);
        let command = command_line(&self.binary_path(), &args);

        let spawned = Command::new(&self.binary.path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let message = format!("Failed to start process: {e}");
                self.db
                    .finish_test(&test_id, TestStatus::Failed, Some(&message), None)
                    .await?;
                return Err(OrchestratorError::ProcessSpawn(e.to_string()));
            }
        };
        let pid = child.id();

        // Persist `running` before the handle is visible to stop or exit.
        if let Err(e) = self.db.mark_test_running(&test_id, pid, &command).await {
            let _ = child.start_kill();
            tokio::spawn(async move {
                let _ = child.wait().await;
            });
            return Err(e.into());
        }

        let mut handle = ProcessHandle::new(test_id.clone(), Role::Client, pid, command.clone());
        handle.duration_sec = Some(params.duration);
        handle.targets = params.servers.clone();
        let readers = handle.output.capture(&mut child);
        let output = handle.output.clone();
        self.processes.insert(handle).await;

        info!(test_id = %test_id, pid = ?pid, "Client test started: {}", command);

        let ctx = RunContext {
            test_type: params.test_type,
            ip_version: params.ip_version,
            duration_sec: params.duration,
        };
        let limit = Duration::from_secs(params.duration as u64 + self.binary.watchdog_grace_sec);
        let run = RunTask {
            test_id: test_id.clone(),
            ctx,
            limit,
            db: self.db.clone(),
            processes: self.processes.clone(),
            output,
        };
        tokio::spawn(async move {
            run.supervise(child, readers).await;
        });

        Ok(TestStarted {
            test_id,
            status: TestStatus::Running,
            command_line: command,
        })
    }

    /// Signal a running test and mark it stopped.
    ///
    /// Only runs with a live handle can be stopped; a `running` record whose
    /// process is gone is not resumable.
    pub async fn stop_test(&self, test_id: &str) -> Result<(), OrchestratorError> {
        let handle = self
            .processes
            .claim_role(test_id, Role::Client)
            .await
            .ok_or_else(|| OrchestratorError::NotRunning(format!("Test {test_id}")))?;

        signal_handle(&handle);
        self.db
            .finish_test(test_id, TestStatus::Stopped, None, None)
            .await?;
        info!(test_id, "Test stopped by request");
        Ok(())
    }

    pub async fn test_status(&self, test_id: &str) -> Result<TestStatusView, OrchestratorError> {
        let test = self
            .db
            .get_test(test_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(test_id.to_string()))?;

        let progress = match self.processes.get(test_id).await {
            Some(handle) => handle.progress(),
            None if matches!(
                test.status,
                TestStatus::Completed | TestStatus::CompletedWithWarnings
            ) =>
            {
                100
            }
            None => 0,
        };

        Ok(TestStatusView {
            test_id: test.test_id,
            status: test.status,
            progress,
            start_time: test.started_at,
            error_message: test.error_message,
            warning_message: test.warning_message,
        })
    }

    pub async fn test_results(&self, test_id: &str) -> Result<TestResultsView, OrchestratorError> {
        let (test, result) = self
            .db
            .get_test_with_result(test_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(test_id.to_string()))?;

        let raw_output = result.as_ref().map(|r| r.raw_output.clone());
        let results = result.map(|r| MetricsView {
            throughput: r.throughput_mbps,
            packet_loss: r.packet_loss_percent,
            latency: r.latency_ms,
            jitter: r.jitter_ms,
            duration: test.config.get("duration").and_then(Value::as_u64),
            connections: test.config.get("connections").and_then(Value::as_u64),
            interval_count: r.interval_count,
            completion_percentage: r.completion_percentage,
            quality: r.quality,
        });

        Ok(TestResultsView {
            test_id: test.test_id,
            status: test.status,
            results,
            raw_output,
            completed_at: test.completed_at,
            error_message: test.error_message,
            warning_message: test.warning_message,
            command_line: test.command_line,
        })
    }

    pub async fn list_tests(
        &self,
        status: Option<TestStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<(Vec<TestRecord>, u64), OrchestratorError> {
        Ok(self.db.list_tests(status, limit, offset).await?)
    }

    pub async fn active_tests(&self) -> Vec<ActiveTest> {
        self.processes
            .list(Role::Client)
            .await
            .into_iter()
            .map(|h| ActiveTest {
                progress: h.progress(),
                elapsed: h.started_at.elapsed().as_secs(),
                test_id: h.id,
                servers: h.targets,
                pid: h.pid,
                started_at: h.started_wall,
                command_line: h.command_line,
            })
            .collect()
    }

    /// Delete a test and its results, terminating it first if still live.
    pub async fn delete_test(&self, test_id: &str) -> Result<(), OrchestratorError> {
        if let Some(handle) = self.processes.claim_role(test_id, Role::Client).await {
            signal_handle(&handle);
        }
        if !self.db.delete_test(test_id).await? {
            return Err(OrchestratorError::NotFound(test_id.to_string()));
        }
        info!(test_id, "Test deleted");
        Ok(())
    }

    /// Delete every test, terminating live runs first. Returns the count.
    pub async fn clear_tests(&self) -> Result<usize, OrchestratorError> {
        for handle in self.processes.claim_all(Role::Client).await {
            signal_handle(&handle);
        }
        let deleted = self.db.clear_tests().await?;
        info!(deleted, "All tests cleared");
        Ok(deleted)
    }
}

fn signal_handle(handle: &ProcessHandle) {
    match handle.pid {
        Some(pid) if terminate_pid(pid) => debug!(id = %handle.id, pid, "Sent SIGTERM"),
        Some(pid) => debug!(id = %handle.id, pid, "Process already gone"),
        None => {}
    }
}

/// Owns one run's subprocess until it is reaped
struct RunTask {
    test_id: String,
    ctx: RunContext,
    limit: Duration,
    db: Arc<Database>,
    processes: ProcessTable,
    output: OutputBuffers,
}

impl RunTask {
    async fn supervise(self, mut child: Child, readers: OutputReaders) {
        let waited = tokio::time::timeout(self.limit, child.wait()).await;
        let timed_out = waited.is_err();
        let status = match waited {
            Ok(status) => status,
            Err(_) => {
                // Watchdog. Kill even if someone else already claimed the run.
                let _ = child.start_kill();
                child.wait().await
            }
        };

        // The pid is reaped now; claim before draining so no stop signals it.
        let claimed = self.processes.claim(&self.test_id).await.is_some();
        readers.drain(DRAIN_LIMIT).await;
        if !claimed {
            debug!(test_id = %self.test_id, "Exit already handled");
            return;
        }

        if timed_out {
            let limit = self.limit.as_secs();
            warn!(test_id = %self.test_id, limit, "Test exceeded time limit, killed");
            let message = OrchestratorError::TimeoutExceeded(limit).to_string();
            self.finish(TestStatus::Failed, Some(&message), None).await;
            return;
        }

        let status = match status {
            Ok(status) => status,
            Err(e) => {
                let message = format!("Failed to wait for process: {e}");
                self.finish(TestStatus::Failed, Some(&message), None).await;
                return;
            }
        };

        let stdout = self.output.stdout().await;
        let stderr = self.output.stderr().await;
        let verdict = classify_exit(&self.ctx, status.code(), status.signal(), &stdout, &stderr);

        if let Some(record) = verdict.result_record(&self.test_id) {
            if let Err(e) = self.db.save_result(&record).await {
                error!(test_id = %self.test_id, "Failed to store results: {:#}", e);
            }
        }

        info!(
            test_id = %self.test_id,
            status = %verdict.status,
            exit_code = ?status.code(),
            "Client test finished"
        );
        self.finish(
            verdict.status,
            verdict.error_message.as_deref(),
            verdict.warning_message.as_deref(),
        )
        .await;
    }

    async fn finish(&self, status: TestStatus, error: Option<&str>, warning: Option<&str>) {
        match self.db.finish_test(&self.test_id, status, error, warning).await {
            Ok(true) => {}
            Ok(false) => debug!(test_id = %self.test_id, "Test already terminal"),
            Err(e) => error!(test_id = %self.test_id, "Failed to record test outcome: {:#}", e),
        }
    }
}
