use crate::storage::{ResultRecord, TestRecord};
use anyhow::{Context, Result};

const HEADER: [&str; 16] = [
    "test_id",
    "test_type",
    "servers",
    "status",
    "created_at",
    "started_at",
    "completed_at",
    "throughput_mbps",
    "packet_loss_pct",
    "latency_ms",
    "jitter_ms",
    "interval_count",
    "completion_pct",
    "quality",
    "error",
    "warning",
];

/// Render test runs and their metrics as CSV, one row per run.
pub fn export_csv(rows: &[(TestRecord, Option<ResultRecord>)]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(HEADER)?;

    for (test, result) in rows {
        let metric = |f: fn(&ResultRecord) -> f64| {
            result
                .as_ref()
                .map(|r| format!("{:.2}", f(r)))
                .unwrap_or_default()
        };

        writer.write_record([
            test.test_id.clone(),
            test.test_type.clone(),
            test.servers.join(" "),
            test.status.to_string(),
            test.created_at.to_rfc3339(),
            test.started_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
            test.completed_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
            metric(|r| r.throughput_mbps),
            metric(|r| r.packet_loss_percent),
            metric(|r| r.latency_ms),
            metric(|r| r.jitter_ms),
            result
                .as_ref()
                .map(|r| r.interval_count.to_string())
                .unwrap_or_default(),
            metric(|r| r.completion_percentage),
            result.as_ref().map(|r| r.quality.clone()).unwrap_or_default(),
            test.error_message.clone().unwrap_or_default(),
            test.warning_message.clone().unwrap_or_default(),
        ])?;
    }

    writer.into_inner().context("Failed to flush CSV writer")
}
