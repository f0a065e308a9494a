//! SQLite record store for test runs, their results and server instances

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// TestRun lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Pending,
    Running,
    Completed,
    CompletedWithWarnings,
    Failed,
    Stopped,
}

impl TestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TestStatus::Pending => "pending",
            TestStatus::Running => "running",
            TestStatus::Completed => "completed",
            TestStatus::CompletedWithWarnings => "completed_with_warnings",
            TestStatus::Failed => "failed",
            TestStatus::Stopped => "stopped",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, TestStatus::Pending | TestStatus::Running)
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TestStatus::Pending),
            "running" => Ok(TestStatus::Running),
            "completed" => Ok(TestStatus::Completed),
            "completed_with_warnings" => Ok(TestStatus::CompletedWithWarnings),
            "failed" => Ok(TestStatus::Failed),
            "stopped" => Ok(TestStatus::Stopped),
            other => Err(format!("unknown test status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TestRecord {
    pub test_id: String,
    pub test_type: String,
    pub servers: Vec<String>,
    pub config: Value,
    pub status: TestStatus,
    pub process_id: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub warning_message: Option<String>,
    pub command_line: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Parsed metrics of one run, kept for audit and export
#[derive(Debug, Clone, Serialize)]
pub struct ResultRecord {
    pub test_id: String,
    pub throughput_mbps: f64,
    pub packet_loss_percent: f64,
    pub latency_ms: f64,
    pub jitter_ms: f64,
    pub interval_count: u32,
    pub completion_percentage: f64,
    pub quality: String,
    pub raw_output: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerInstance {
    pub process_id: String,
    pub pid: Option<u32>,
    pub port: u16,
    pub interface: String,
    pub ip_version: Option<String>,
    pub config: Value,
    pub machine_id: String,
    pub status: ServerStatus,
    pub created_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
}

pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

const TEST_COLUMNS: &str = "test_id, test_type, servers, config, status, process_id, started_at,
    completed_at, error_message, warning_message, command_line, created_at";

const SERVER_COLUMNS: &str =
    "process_id, pid, port, interface, ip_version, config, machine_id, status, created_at, stopped_at";

impl Database {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open database")?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .context("Failed to enable WAL mode")?;
        conn.pragma_update(None, "busy_timeout", "5000")
            .context("Failed to set busy timeout")?;

        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("Failed to enable foreign keys")?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        Ok(db)
    }

    /// Run `f` on the blocking pool while holding the connection.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone().lock_owned().await;
        tokio::task::spawn_blocking(move || f(&conn))
            .await
            .context("Database task panicked")?
    }

    pub async fn initialize(&self) -> Result<()> {
        info!("Initializing database schema");
        let conn = self.conn.lock().await;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS tests (
                test_id TEXT PRIMARY KEY,
                test_type TEXT NOT NULL,
                servers TEXT NOT NULL,
                config TEXT NOT NULL,
                status TEXT NOT NULL,
                process_id INTEGER,
                started_at INTEGER,
                completed_at INTEGER,
                error_message TEXT,
                warning_message TEXT,
                command_line TEXT,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tests_status ON tests(status)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tests_created ON tests(created_at)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS test_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                test_id TEXT NOT NULL REFERENCES tests(test_id) ON DELETE CASCADE,
                throughput_mbps REAL NOT NULL,
                packet_loss_percent REAL NOT NULL,
                latency_ms REAL NOT NULL,
                jitter_ms REAL NOT NULL,
                interval_count INTEGER NOT NULL,
                completion_percentage REAL NOT NULL,
                quality TEXT NOT NULL,
                raw_output TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_results_test ON test_results(test_id)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS server_instances (
                process_id TEXT PRIMARY KEY,
                pid INTEGER,
                port INTEGER NOT NULL,
                interface TEXT NOT NULL,
                ip_version TEXT,
                config TEXT NOT NULL,
                machine_id TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                stopped_at INTEGER
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_servers_machine ON server_instances(machine_id, status)",
            [],
        )?;

        info!("Database schema initialized");
        Ok(())
    }

    pub async fn create_test(
        &self,
        test_id: &str,
        test_type: &str,
        servers: &[String],
        config: &Value,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO tests (test_id, test_type, servers, config, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                test_id,
                test_type,
                serde_json::to_string(servers)?,
                config.to_string(),
                TestStatus::Pending.as_str(),
                Utc::now().timestamp_millis(),
            ],
        )
        .with_context(|| format!("Failed to create test {test_id}"))?;
        Ok(())
    }

    /// Move a `pending` test to `running`. Returns false when the test has
    /// already left `pending`.
    pub async fn mark_test_running(
        &self,
        test_id: &str,
        pid: Option<u32>,
        command_line: &str,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE tests SET status = ?2, process_id = ?3, command_line = ?4, started_at = ?5
             WHERE test_id = ?1 AND status = 'pending'",
            params![
                test_id,
                TestStatus::Running.as_str(),
                pid,
                command_line,
                Utc::now().timestamp_millis(),
            ],
        )?;
        Ok(updated > 0)
    }

    /// Record a terminal state and set `completed_at` to now. Terminal states
    /// are final: returns false when the test was already terminal.
    pub async fn finish_test(
        &self,
        test_id: &str,
        status: TestStatus,
        error_message: Option<&str>,
        warning_message: Option<&str>,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE tests SET status = ?2, error_message = ?3, warning_message = ?4, completed_at = ?5
             WHERE test_id = ?1 AND status IN ('pending', 'running')",
            params![
                test_id,
                status.as_str(),
                error_message,
                warning_message,
                Utc::now().timestamp_millis(),
            ],
        )?;
        Ok(updated > 0)
    }

    pub async fn get_test(&self, test_id: &str) -> Result<Option<TestRecord>> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {TEST_COLUMNS} FROM tests WHERE test_id = ?1");
        let record = conn
            .query_row(&sql, params![test_id], test_from_row)
            .optional()?;
        Ok(record)
    }

    pub async fn get_test_with_result(
        &self,
        test_id: &str,
    ) -> Result<Option<(TestRecord, Option<ResultRecord>)>> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {TEST_COLUMNS} FROM tests WHERE test_id = ?1");
        let Some(test) = conn
            .query_row(&sql, params![test_id], test_from_row)
            .optional()?
        else {
            return Ok(None);
        };
        let result = latest_result(&conn, test_id)?;
        Ok(Some((test, result)))
    }

    /// Newest first. Returns the page and the total matching count.
    pub async fn list_tests(
        &self,
        status: Option<TestStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<(Vec<TestRecord>, u64)> {
        let status = status.map(TestStatus::as_str);
        self.blocking(move |conn| {
            let total: i64 = conn.query_row(
                "SELECT COUNT(*) FROM tests WHERE ?1 IS NULL OR status = ?1",
                params![status],
                |row| row.get(0),
            )?;

            let sql = format!(
                "SELECT {TEST_COLUMNS} FROM tests WHERE ?1 IS NULL OR status = ?1
                 ORDER BY created_at DESC, rowid DESC LIMIT ?2 OFFSET ?3"
            );
            let mut stmt = conn.prepare(&sql)?;
            let tests = stmt
                .query_map(params![status, limit, offset], test_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            Ok((tests, total as u64))
        })
        .await
    }

    /// Every matching test with its result row, newest first
    pub async fn export_tests(
        &self,
        status: Option<TestStatus>,
    ) -> Result<Vec<(TestRecord, Option<ResultRecord>)>> {
        let status = status.map(TestStatus::as_str);
        self.blocking(move |conn| {
            let sql = format!(
                "SELECT {TEST_COLUMNS} FROM tests WHERE ?1 IS NULL OR status = ?1
                 ORDER BY created_at DESC, rowid DESC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let tests = stmt
                .query_map(params![status], test_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut rows = Vec::with_capacity(tests.len());
            for test in tests {
                let result = latest_result(conn, &test.test_id)?;
                rows.push((test, result));
            }
            Ok(rows)
        })
        .await
    }

    pub async fn save_result(&self, result: &ResultRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO test_results (
                test_id, throughput_mbps, packet_loss_percent, latency_ms, jitter_ms,
                interval_count, completion_percentage, quality, raw_output, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                &result.test_id,
                result.throughput_mbps,
                result.packet_loss_percent,
                result.latency_ms,
                result.jitter_ms,
                result.interval_count,
                result.completion_percentage,
                &result.quality,
                result.raw_output.to_string(),
                Utc::now().timestamp_millis(),
            ],
        )
        .with_context(|| format!("Failed to store result for {}", result.test_id))?;
        Ok(())
    }

    /// Returns false when no such test existed
    pub async fn delete_test(&self, test_id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute("DELETE FROM tests WHERE test_id = ?1", params![test_id])?;
        Ok(deleted > 0)
    }

    pub async fn clear_tests(&self) -> Result<usize> {
        self.blocking(|conn| Ok(conn.execute("DELETE FROM tests", [])?))
            .await
    }

    pub async fn create_server_instance(&self, instance: &ServerInstance) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO server_instances (
                process_id, pid, port, interface, ip_version, config, machine_id, status,
                created_at, stopped_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL)",
            params![
                &instance.process_id,
                instance.pid,
                instance.port,
                &instance.interface,
                &instance.ip_version,
                instance.config.to_string(),
                &instance.machine_id,
                server_status_str(instance.status),
                instance.created_at.timestamp_millis(),
            ],
        )
        .with_context(|| format!("Failed to record server instance {}", instance.process_id))?;
        Ok(())
    }

    /// Most recent `running` instance owned by this machine
    pub async fn get_active_server_instance(
        &self,
        machine_id: &str,
    ) -> Result<Option<ServerInstance>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {SERVER_COLUMNS} FROM server_instances
             WHERE machine_id = ?1 AND status = 'running'
             ORDER BY created_at DESC, rowid DESC LIMIT 1"
        );
        let instance = conn
            .query_row(&sql, params![machine_id], server_from_row)
            .optional()?;
        Ok(instance)
    }

    pub async fn mark_server_stopped(&self, process_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE server_instances SET status = 'stopped', stopped_at = ?2 WHERE process_id = ?1",
            params![process_id, Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }
}

fn latest_result(conn: &Connection, test_id: &str) -> Result<Option<ResultRecord>> {
    let result = conn
        .query_row(
            "SELECT test_id, throughput_mbps, packet_loss_percent, latency_ms, jitter_ms,
                    interval_count, completion_percentage, quality, raw_output
             FROM test_results WHERE test_id = ?1 ORDER BY id DESC LIMIT 1",
            params![test_id],
            |row| {
                Ok(ResultRecord {
                    test_id: row.get(0)?,
                    throughput_mbps: row.get(1)?,
                    packet_loss_percent: row.get(2)?,
                    latency_ms: row.get(3)?,
                    jitter_ms: row.get(4)?,
                    interval_count: row.get(5)?,
                    completion_percentage: row.get(6)?,
                    quality: row.get(7)?,
                    raw_output: json_column(row, 8)?,
                })
            },
        )
        .optional()?;
    Ok(result)
}

fn test_from_row(row: &Row<'_>) -> rusqlite::Result<TestRecord> {
    let servers: String = row.get(2)?;
    let status: String = row.get(4)?;

    Ok(TestRecord {
        test_id: row.get(0)?,
        test_type: row.get(1)?,
        servers: serde_json::from_str(&servers).unwrap_or_default(),
        config: json_column(row, 3)?,
        status: status.parse::<TestStatus>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, e.into())
        })?,
        process_id: row.get(5)?,
        started_at: timestamp_column(row, 6)?,
        completed_at: timestamp_column(row, 7)?,
        error_message: row.get(8)?,
        warning_message: row.get(9)?,
        command_line: row.get(10)?,
        created_at: timestamp_column(row, 11)?.unwrap_or_default(),
    })
}

fn server_from_row(row: &Row<'_>) -> rusqlite::Result<ServerInstance> {
    let status: String = row.get(7)?;

    Ok(ServerInstance {
        process_id: row.get(0)?,
        pid: row.get(1)?,
        port: row.get(2)?,
        interface: row.get(3)?,
        ip_version: row.get(4)?,
        config: json_column(row, 5)?,
        machine_id: row.get(6)?,
        status: if status == "running" {
            ServerStatus::Running
        } else {
            ServerStatus::Stopped
        },
        created_at: timestamp_column(row, 8)?.unwrap_or_default(),
        stopped_at: timestamp_column(row, 9)?,
    })
}

fn server_status_str(status: ServerStatus) -> &'static str {
    match status {
        ServerStatus::Running => "running",
        ServerStatus::Stopped => "stopped",
    }
}

fn json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Value> {
    let text: String = row.get(idx)?;
    Ok(serde_json::from_str(&text).unwrap_or(Value::Null))
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let millis: Option<i64> = row.get(idx)?;
    Ok(millis.and_then(|ms| Utc.timestamp_millis_opt(ms).single()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.initialize().await.unwrap();
        db
    }

    async fn insert(db: &Database, id: &str, status: TestStatus) {
        db.create_test(id, "downstream", &["srv".to_string()], &json!({"duration": 10}))
            .await
            .unwrap();
        if status != TestStatus::Pending {
            db.finish_test(id, status, None, None).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let db = db().await;
        db.initialize().await.unwrap();
    }

    #[tokio::test]
    async fn test_lifecycle_columns() {
        let db = db().await;
        insert(&db, "test_1", TestStatus::Pending).await;
        db.mark_test_running("test_1", Some(4242), "udpst -d srv")
            .await
            .unwrap();

        let running = db.get_test("test_1").await.unwrap().unwrap();
        assert_eq!(running.status, TestStatus::Running);
        assert_eq!(running.process_id, Some(4242));
        assert_eq!(running.servers, vec!["srv".to_string()]);
        assert_eq!(running.config["duration"], 10);
        assert!(running.started_at.is_some());
        assert!(running.completed_at.is_none());

        db.finish_test("test_1", TestStatus::Failed, Some("boom"), None)
            .await
            .unwrap();
        let failed = db.get_test("test_1").await.unwrap().unwrap();
        assert_eq!(failed.status, TestStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("boom"));
        assert!(failed.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_terminal_states_are_final() {
        let db = db().await;
        insert(&db, "test_s", TestStatus::Pending).await;
        assert!(db.mark_test_running("test_s", Some(1), "udpst").await.unwrap());
        assert!(!db.mark_test_running("test_s", Some(2), "udpst").await.unwrap());

        assert!(
            db.finish_test("test_s", TestStatus::Stopped, None, None)
                .await
                .unwrap()
        );
        assert!(
            !db.finish_test("test_s", TestStatus::Failed, Some("late"), None)
                .await
                .unwrap()
        );
        assert!(!db.mark_test_running("test_s", Some(3), "udpst").await.unwrap());

        let test = db.get_test("test_s").await.unwrap().unwrap();
        assert_eq!(test.status, TestStatus::Stopped);
        assert_eq!(test.process_id, Some(1));
        assert!(test.error_message.is_none());

        assert!(
            !db.finish_test("test_missing", TestStatus::Failed, None, None)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_list_filter_and_pagination() {
        let db = db().await;
        for i in 0..5 {
            insert(&db, &format!("test_c{i}"), TestStatus::Completed).await;
        }
        for i in 0..3 {
            insert(&db, &format!("test_f{i}"), TestStatus::Failed).await;
        }

        let (all, total) = db.list_tests(None, 50, 0).await.unwrap();
        assert_eq!(all.len(), 8);
        assert_eq!(total, 8);
        // newest first
        assert_eq!(all[0].test_id, "test_f2");

        let (page, total) = db
            .list_tests(Some(TestStatus::Completed), 2, 0)
            .await
            .unwrap();
        assert_eq!(total, 5);
        assert_eq!(page.len(), 2);
        assert!(page.iter().all(|t| t.status == TestStatus::Completed));

        let (tail, _) = db
            .list_tests(Some(TestStatus::Completed), 2, 4)
            .await
            .unwrap();
        assert_eq!(tail.len(), 1);

        let (past_end, total) = db
            .list_tests(Some(TestStatus::Completed), 2, 10)
            .await
            .unwrap();
        assert!(past_end.is_empty());
        assert_eq!(total, 5);
    }

    #[tokio::test]
    async fn test_clear_runs_off_the_async_workers() {
        let db = Arc::new(db().await);
        for i in 0..3 {
            insert(&db, &format!("test_{i}"), TestStatus::Completed).await;
        }

        // a concurrent reader waits for the blocking job instead of failing
        let reader = {
            let db = db.clone();
            tokio::spawn(async move { db.list_tests(None, 50, 0).await })
        };
        assert_eq!(db.clear_tests().await.unwrap(), 3);
        let (_, seen) = reader.await.unwrap().unwrap();
        assert!(seen == 0 || seen == 3);

        let (tests, total) = db.list_tests(None, 50, 0).await.unwrap();
        assert!(tests.is_empty());
        assert_eq!(total, 0);
        assert_eq!(db.clear_tests().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_results_cascade_on_delete() {
        let db = db().await;
        insert(&db, "test_r", TestStatus::Completed).await;
        db.save_result(&ResultRecord {
            test_id: "test_r".to_string(),
            throughput_mbps: 940.5,
            packet_loss_percent: 0.12,
            latency_ms: 3.2,
            jitter_ms: 0.8,
            interval_count: 10,
            completion_percentage: 100.0,
            quality: "COMPLETE".to_string(),
            raw_output: json!({"IPLayerCapacity": 940.5}),
        })
        .await
        .unwrap();

        let (_, result) = db.get_test_with_result("test_r").await.unwrap().unwrap();
        let result = result.unwrap();
        assert_eq!(result.throughput_mbps, 940.5);
        assert_eq!(result.raw_output["IPLayerCapacity"], 940.5);

        assert!(db.delete_test("test_r").await.unwrap());
        assert!(!db.delete_test("test_r").await.unwrap());
        assert!(db.get_test_with_result("test_r").await.unwrap().is_none());
        assert!(db.export_tests(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_active_server_instance_per_machine() {
        let db = db().await;
        assert!(db.get_active_server_instance("m1").await.unwrap().is_none());

        let instance = ServerInstance {
            process_id: "server_1".to_string(),
            pid: Some(1234),
            port: 25000,
            interface: String::new(),
            ip_version: None,
            config: json!({}),
            machine_id: "m1".to_string(),
            status: ServerStatus::Running,
            created_at: Utc::now(),
            stopped_at: None,
        };
        db.create_server_instance(&instance).await.unwrap();

        let active = db.get_active_server_instance("m1").await.unwrap().unwrap();
        assert_eq!(active.pid, Some(1234));
        assert!(db.get_active_server_instance("m2").await.unwrap().is_none());

        db.mark_server_stopped("server_1").await.unwrap();
        assert!(db.get_active_server_instance("m1").await.unwrap().is_none());
    }
}
