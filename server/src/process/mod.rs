//! Live subprocess handles
//!
//! The table is the only record of which subprocesses we can still signal.
//! Whoever removes an entry with [`ProcessTable::claim`] owns the terminal
//! handling for that run; everyone else backs off.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, Signal, System};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// Accumulated stdout/stderr of one subprocess
#[derive(Debug, Clone, Default)]
pub struct OutputBuffers {
    stdout: Arc<Mutex<Vec<u8>>>,
    stderr: Arc<Mutex<Vec<u8>>>,
}

impl OutputBuffers {
    /// Take the child's piped streams and copy them into the buffers.
    pub fn capture(&self, child: &mut Child) -> OutputReaders {
        let mut tasks = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            tasks.push(pump(stdout, self.stdout.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tasks.push(pump(stderr, self.stderr.clone()));
        }
        OutputReaders { tasks }
    }

    pub async fn stdout(&self) -> String {
        String::from_utf8_lossy(&self.stdout.lock().await).into_owned()
    }

    pub async fn stderr(&self) -> String {
        String::from_utf8_lossy(&self.stderr.lock().await).into_owned()
    }
}

/// Reader tasks for one subprocess
pub struct OutputReaders {
    tasks: Vec<JoinHandle<()>>,
}

impl OutputReaders {
    pub fn none() -> Self {
        Self { tasks: Vec::new() }
    }

    /// Wait for the streams to hit EOF. A grandchild holding the pipe open
    /// would stall this forever, hence the limit.
    pub async fn drain(self, limit: Duration) {
        for task in self.tasks {
            if tokio::time::timeout(limit, task).await.is_err() {
                debug!("Output reader still open after {:?}, detaching", limit);
            }
        }
    }
}

fn pump<R>(mut reader: R, sink: Arc<Mutex<Vec<u8>>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => sink.lock().await.extend_from_slice(&buf[..n]),
            }
        }
    })
}

/// One live subprocess
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub id: String,
    pub role: Role,
    pub pid: Option<u32>,
    pub started_at: Instant,
    pub started_wall: DateTime<Utc>,
    /// Configured run length, client tests only
    pub duration_sec: Option<u32>,
    pub targets: Vec<String>,
    pub command_line: String,
    pub output: OutputBuffers,
}

impl ProcessHandle {
    pub fn new(id: String, role: Role, pid: Option<u32>, command_line: String) -> Self {
        Self {
            id,
            role,
            pid,
            started_at: Instant::now(),
            started_wall: Utc::now(),
            duration_sec: None,
            targets: Vec::new(),
            command_line,
            output: OutputBuffers::default(),
        }
    }

    /// Elapsed share of the configured duration, 0 to 100
    pub fn progress(&self) -> u8 {
        progress(self.started_at.elapsed(), self.duration_sec.unwrap_or(0))
    }
}

pub fn progress(elapsed: Duration, duration_sec: u32) -> u8 {
    if duration_sec == 0 {
        return 0;
    }
    let pct = elapsed.as_secs_f64() / duration_sec as f64 * 100.0;
    pct.clamp(0.0, 100.0) as u8
}

/// Table of live handles keyed by test id or server process id
#[derive(Debug, Clone, Default)]
pub struct ProcessTable {
    handles: Arc<RwLock<HashMap<String, ProcessHandle>>>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, handle: ProcessHandle) {
        let mut handles = self.handles.write().await;
        handles.insert(handle.id.clone(), handle);
    }

    /// Remove and return the handle. At most one caller gets `Some` per id.
    pub async fn claim(&self, id: &str) -> Option<ProcessHandle> {
        let mut handles = self.handles.write().await;
        handles.remove(id)
    }

    /// Like [`claim`](Self::claim) but leaves handles of the other role alone
    pub async fn claim_role(&self, id: &str, role: Role) -> Option<ProcessHandle> {
        let mut handles = self.handles.write().await;
        match handles.get(id) {
            Some(handle) if handle.role == role => handles.remove(id),
            _ => None,
        }
    }

    pub async fn claim_all(&self, role: Role) -> Vec<ProcessHandle> {
        let mut handles = self.handles.write().await;
        let ids: Vec<String> = handles
            .values()
            .filter(|h| h.role == role)
            .map(|h| h.id.clone())
            .collect();
        ids.iter().filter_map(|id| handles.remove(id)).collect()
    }

    pub async fn get(&self, id: &str) -> Option<ProcessHandle> {
        let handles = self.handles.read().await;
        handles.get(id).cloned()
    }

    pub async fn contains(&self, id: &str) -> bool {
        let handles = self.handles.read().await;
        handles.contains_key(id)
    }

    pub async fn list(&self, role: Role) -> Vec<ProcessHandle> {
        let handles = self.handles.read().await;
        let mut list: Vec<ProcessHandle> =
            handles.values().filter(|h| h.role == role).cloned().collect();
        list.sort_by_key(|h| h.started_at);
        list
    }

    pub async fn count(&self, role: Role) -> usize {
        let handles = self.handles.read().await;
        handles.values().filter(|h| h.role == role).count()
    }
}

/// `<prefix>_<millis>` ids, strictly increasing within this process
#[derive(Debug, Default)]
pub struct IdGenerator {
    last: AtomicI64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self, prefix: &str) -> String {
        let now = Utc::now().timestamp_millis();
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(last + 1);
            match self
                .last
                .compare_exchange(last, candidate, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => return format!("{prefix}_{candidate}"),
                Err(actual) => last = actual,
            }
        }
    }
}

/// Whether `pid` names a process that has not exited. Zombies count as dead.
pub fn pid_is_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system
        .process(pid)
        .map(|p| p.status() != ProcessStatus::Zombie)
        .unwrap_or(false)
}

/// Send SIGTERM. Returns false when the process was already gone.
pub fn terminate_pid(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    match system.process(pid) {
        Some(process) => process.kill_with(Signal::Term).unwrap_or(false),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn handle(id: &str, role: Role) -> ProcessHandle {
        ProcessHandle::new(id.to_string(), role, None, "udpst".to_string())
    }

    #[tokio::test]
    async fn test_claim_is_exactly_once_under_race() {
        let table = ProcessTable::new();
        table.insert(handle("test_1", Role::Client)).await;

        // stop, natural exit and watchdog all race for the same run
        let mut tasks = Vec::new();
        for _ in 0..3 {
            let table = table.clone();
            tasks.push(tokio::spawn(async move { table.claim("test_1").await }));
        }

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert!(!table.contains("test_1").await);
    }

    #[tokio::test]
    async fn test_claim_role_leaves_other_role() {
        let table = ProcessTable::new();
        table.insert(handle("server_1", Role::Server)).await;
        table.insert(handle("test_1", Role::Client)).await;
        table.insert(handle("test_2", Role::Client)).await;

        assert!(table.claim_role("server_1", Role::Client).await.is_none());
        assert!(table.contains("server_1").await);
        assert_eq!(table.count(Role::Client).await, 2);

        let claimed = table.claim_all(Role::Client).await;
        assert_eq!(claimed.len(), 2);
        assert_eq!(table.count(Role::Client).await, 0);
        assert_eq!(table.count(Role::Server).await, 1);
    }

    #[test]
    fn test_progress_is_clamped() {
        assert_eq!(progress(Duration::from_secs(5), 10), 50);
        assert_eq!(progress(Duration::from_secs(30), 10), 100);
        assert_eq!(progress(Duration::from_secs(0), 10), 0);
        assert_eq!(progress(Duration::from_secs(5), 0), 0);
    }

    #[test]
    fn test_ids_are_unique_and_increasing() {
        let ids = IdGenerator::new();
        let generated: Vec<String> = (0..200).map(|_| ids.next("test")).collect();
        let unique: HashSet<&String> = generated.iter().collect();
        assert_eq!(unique.len(), generated.len());

        let stamps: Vec<i64> = generated
            .iter()
            .map(|id| id.trim_start_matches("test_").parse().unwrap())
            .collect();
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_liveness_of_own_process() {
        assert!(pid_is_alive(std::process::id()));
        // pid_max on Linux is at most 2^22
        assert!(!pid_is_alive(4_194_304 + 17));
        assert!(!terminate_pid(4_194_304 + 17));
    }

    #[tokio::test]
    async fn test_output_capture() {
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg("echo out; echo err >&2")
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .unwrap();

        let output = OutputBuffers::default();
        let readers = output.capture(&mut child);
        child.wait().await.unwrap();
        readers.drain(Duration::from_secs(2)).await;

        assert_eq!(output.stdout().await, "out\n");
        assert_eq!(output.stderr().await, "err\n");
    }
}
