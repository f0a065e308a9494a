//! Terminal state of a client run from what the subprocess left behind

use crate::storage::{ResultRecord, TestStatus};
use protocol::{
    IpVersion, ParsedResult, QualityAssessment, TestType, classify_severity, parse_output,
};

const SIGTERM: i32 = 15;

/// What exit handling needs to know about the run
#[derive(Debug, Clone, Copy)]
pub struct RunContext {
    pub test_type: TestType,
    pub ip_version: IpVersion,
    pub duration_sec: u32,
}

#[derive(Debug, Clone)]
pub struct ExitVerdict {
    pub status: TestStatus,
    pub error_message: Option<String>,
    pub warning_message: Option<String>,
    pub result: Option<ParsedResult>,
    pub quality: Option<QualityAssessment>,
}

impl ExitVerdict {
    fn failed(message: impl Into<String>) -> Self {
        Self {
            status: TestStatus::Failed,
            error_message: Some(message.into()),
            warning_message: None,
            result: None,
            quality: None,
        }
    }

    /// Row to persist: any clean completion, plus partial data from other
    /// outcomes so it stays inspectable.
    pub fn result_record(&self, test_id: &str) -> Option<ResultRecord> {
        let result = self.result.as_ref()?;
        if self.status != TestStatus::Completed && !result.has_valid_data {
            return None;
        }
        Some(ResultRecord {
            test_id: test_id.to_string(),
            throughput_mbps: result.throughput,
            packet_loss_percent: result.packet_loss,
            latency_ms: result.latency,
            jitter_ms: result.jitter,
            interval_count: result.interval_count,
            completion_percentage: result.completion_percentage,
            quality: self
                .quality
                .as_ref()
                .map(|q| q.quality.as_str())
                .unwrap_or("NO_DATA")
                .to_string(),
            raw_output: result.raw.clone(),
        })
    }
}

/// Decide the terminal state of a run that exited on its own.
///
/// `signal` is the terminating signal when the OS reports one.
pub fn classify_exit(
    ctx: &RunContext,
    code: Option<i32>,
    signal: Option<i32>,
    stdout: &str,
    stderr: &str,
) -> ExitVerdict {
    if let Some(signal) = signal {
        if signal == SIGTERM {
            return ExitVerdict {
                status: TestStatus::Stopped,
                error_message: None,
                warning_message: None,
                result: None,
                quality: None,
            };
        }
        return ExitVerdict::failed(format!("Process terminated by signal {signal}"));
    }

    if stdout.trim().is_empty() {
        let stderr = stderr.trim();
        return match code {
            Some(0) => ExitVerdict::failed("Process exited without producing any output"),
            _ if !stderr.is_empty() => ExitVerdict::failed(stderr),
            Some(code) => ExitVerdict::failed(format!("Process exited with code {code}")),
            None => ExitVerdict::failed("Process exited without an exit code"),
        };
    }

    let parsed = match parse_output(stdout) {
        Ok(parsed) => parsed,
        Err(e) => {
            let detail = if stderr.trim().is_empty() {
                stdout.trim()
            } else {
                stderr.trim()
            };
            return ExitVerdict::failed(format!("Failed to parse results: {e}\n{detail}"));
        }
    };

    let quality = parsed.quality(ctx.duration_sec);

    if parsed.error_status == 0 {
        return ExitVerdict {
            status: TestStatus::Completed,
            error_message: None,
            warning_message: None,
            result: Some(parsed),
            quality: Some(quality),
        };
    }

    let verdict = classify_severity(
        parsed.error_status,
        parsed.error_message2.as_deref(),
        Some(&parsed),
        ctx.test_type,
        ctx.ip_version,
    );

    let (status, error_message, warning_message) = if verdict.severity.accepts(quality.quality) {
        let warning = format!(
            "{}: {} Data quality: {} ({}/{} intervals).",
            verdict.reason,
            verdict.message,
            quality.quality.as_str(),
            quality.intervals_collected,
            quality.intervals_expected
        );
        (TestStatus::CompletedWithWarnings, None, Some(warning))
    } else {
        let mut error = format!(
            "{} (ErrorStatus {}, severity {}, quality {})",
            verdict.message,
            parsed.error_status,
            verdict.severity.as_str(),
            quality.quality.as_str()
        );
        if let Some(detail) = parsed.error_message.as_deref().filter(|m| !m.is_empty()) {
            error.push_str(": ");
            error.push_str(detail);
        }
        (TestStatus::Failed, Some(error), None)
    };

    ExitVerdict {
        status,
        error_message,
        warning_message,
        result: Some(parsed),
        quality: Some(quality),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::QualityTier;

    fn downstream(duration_sec: u32) -> RunContext {
        RunContext {
            test_type: TestType::Downstream,
            ip_version: IpVersion::Ipv4,
            duration_sec,
        }
    }

    fn intervals(count: usize) -> String {
        (0..count)
            .map(|_| r#"{"IPLayerCapacity": 900.0, "LossRatio": 0.0, "MinDelay": 2.0}"#)
            .collect::<Vec<_>>()
            .join(",")
    }

    #[test]
    fn test_clean_run_completes() {
        let stdout = format!(
            r#"{{"ErrorStatus": 0, "IPLayerCapacity": 940.5, "LossRatio": 0.0012,
                 "MinDelay": 3.2, "PDV": 0.8, "IncrementalResult": [{}]}}"#,
            intervals(10)
        );
        let verdict = classify_exit(&downstream(10), Some(0), None, &stdout, "");
        assert_eq!(verdict.status, TestStatus::Completed);
        let record = verdict.result_record("test_1").unwrap();
        assert_eq!(record.throughput_mbps, 940.5);
        assert_eq!(record.quality, "COMPLETE");
    }

    #[test]
    fn test_downstream_traffic_stop_is_warned_completion() {
        let stdout = format!(
            r#"banner line
            {{"ErrorStatus": 200,
              "ErrorMessage2": "Incoming traffic has completely stopped",
              "IncrementalResult": [{}]}}"#,
            intervals(10)
        );
        let verdict = classify_exit(&downstream(10), Some(1), None, &stdout, "");
        assert_eq!(verdict.status, TestStatus::CompletedWithWarnings);
        assert_eq!(verdict.quality.as_ref().unwrap().quality, QualityTier::Complete);
        assert!(verdict.warning_message.is_some());
        assert!(verdict.result_record("test_1").is_some());
    }

    #[test]
    fn test_min_connections_without_data_fails() {
        let stdout = r#"{"ErrorStatus": 200,
            "ErrorMessage2": "Incoming traffic has completely stopped"}"#;
        let verdict = classify_exit(&downstream(10), Some(1), None, stdout, "");
        assert_eq!(verdict.status, TestStatus::Failed);
        assert!(verdict.error_message.is_some());
        assert!(verdict.result_record("test_1").is_none());
    }

    #[test]
    fn test_poor_quality_fails_but_keeps_partial_data() {
        let stdout = format!(
            r#"{{"ErrorStatus": 3, "IncrementalResult": [{}]}}"#,
            intervals(3)
        );
        let verdict = classify_exit(&downstream(10), Some(1), None, &stdout, "");
        assert_eq!(verdict.status, TestStatus::Failed);
        let record = verdict.result_record("test_1").unwrap();
        assert_eq!(record.interval_count, 3);
        assert_eq!(record.quality, "INSUFFICIENT");
    }

    #[test]
    fn test_signals() {
        let ctx = downstream(10);
        assert_eq!(
            classify_exit(&ctx, None, Some(15), "", "").status,
            TestStatus::Stopped
        );
        let killed = classify_exit(&ctx, None, Some(9), "", "");
        assert_eq!(killed.status, TestStatus::Failed);
        assert!(killed.error_message.unwrap().contains("signal 9"));
    }

    #[test]
    fn test_no_output() {
        let ctx = downstream(10);
        let verdict = classify_exit(&ctx, Some(1), None, "", "cannot resolve host\n");
        assert_eq!(verdict.error_message.as_deref(), Some("cannot resolve host"));

        let verdict = classify_exit(&ctx, Some(2), None, "  \n", "");
        assert_eq!(
            verdict.error_message.as_deref(),
            Some("Process exited with code 2")
        );

        let verdict = classify_exit(&ctx, Some(0), None, "", "");
        assert_eq!(verdict.status, TestStatus::Failed);
    }

    #[test]
    fn test_unparseable_output_fails_with_raw_text() {
        let verdict = classify_exit(&downstream(10), Some(0), None, "plain text only", "");
        assert_eq!(verdict.status, TestStatus::Failed);
        let message = verdict.error_message.unwrap();
        assert!(message.starts_with("Failed to parse results"));
        assert!(message.contains("plain text only"));
    }
}
