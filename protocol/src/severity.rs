//! Severity of an `ErrorStatus` reported by the binary
//!
//! A nonzero status does not necessarily mean the run is worthless. Downstream
//! tests in particular routinely end with "minimum connections unavailable"
//! once the server stops sending. The verdict here, combined with the quality
//! tier, decides between `completed_with_warnings` and `failed`.

use crate::args::{IpVersion, TestType};
use crate::constants::{ErrorStatus, TRAFFIC_STOPPED_MARKER};
use crate::parser::ParsedResult;
use crate::quality::QualityTier;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Warning,
    Fatal,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Fatal => "FATAL",
        }
    }

    /// Whether a run with this severity and quality still counts as completed.
    pub fn accepts(self, quality: QualityTier) -> bool {
        self != Severity::Fatal && quality.is_acceptable()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeverityVerdict {
    pub severity: Severity,
    pub reason: String,
    pub message: String,
}

impl SeverityVerdict {
    fn new(severity: Severity, reason: &str, message: impl Into<String>) -> Self {
        Self {
            severity,
            reason: reason.to_string(),
            message: message.into(),
        }
    }
}

/// Classify a nonzero `ErrorStatus`.
///
/// `result` is `None` when nothing could be parsed; that is treated as
/// "no valid data".
pub fn classify_severity(
    error_status: i64,
    error_message2: Option<&str>,
    result: Option<&ParsedResult>,
    test_type: TestType,
    ip_version: IpVersion,
) -> SeverityVerdict {
    let status = ErrorStatus::from_code(error_status);
    let has_valid_data = result.is_some_and(|r| r.has_valid_data);
    let traffic_stopped = error_message2
        .map(|m| m.to_lowercase().contains(TRAFFIC_STOPPED_MARKER))
        .unwrap_or(false);

    if status == ErrorStatus::MinConnectionsUnavailable
        && test_type == TestType::Downstream
        && has_valid_data
    {
        if traffic_stopped {
            return SeverityVerdict::new(
                Severity::Info,
                "Normal downstream test completion pattern",
                "Test completed successfully. The \"connection unavailable\" warning is expected \
                 for downstream tests where the server controls data flow termination.",
            );
        }
        return SeverityVerdict::new(
            Severity::Warning,
            "Downstream test completed with data but connection warning",
            "Test completed and collected valid data, but connection terminated unexpectedly.",
        );
    }

    if status == ErrorStatus::MinConnectionsUnavailable && !has_valid_data {
        return SeverityVerdict::new(
            Severity::Fatal,
            "No data collected",
            "Minimum required connections unavailable and no test data was collected.",
        );
    }

    if status.is_connection_class() {
        if let Some(r) = result.filter(|r| r.has_valid_data) {
            if ip_version == IpVersion::Ipv4 && is_ipv4_early_termination(r) {
                return SeverityVerdict::new(
                    Severity::Warning,
                    "IPv4 early termination pattern",
                    format!(
                        "Test collected {} intervals of valid data (requested {}s) before traffic \
                         stopped and the no-traffic watchdog terminated the connection. This \
                         pattern has only been observed over IPv4 and usually points at a \
                         firewall, NAT or conntrack entry dropping UDP return traffic. Try IPv6 \
                         mode, which does not exhibit this behavior.",
                        r.interval_count, r.expected_duration
                    ),
                );
            }
            return SeverityVerdict::new(
                Severity::Warning,
                "Test completed with connection issues",
                "Test collected data but experienced connection problems.",
            );
        }
        return SeverityVerdict::new(
            Severity::Fatal,
            "Connection unavailable",
            "Could not establish or maintain required connections.",
        );
    }

    match status {
        ErrorStatus::Inconclusive(_) => SeverityVerdict::new(
            Severity::Warning,
            "Test inconclusive",
            "Test completed but results may not be reliable.",
        ),
        ErrorStatus::ProtocolMismatch | ErrorStatus::AuthenticationMismatch => {
            SeverityVerdict::new(
                Severity::Fatal,
                "Configuration or protocol error",
                "Test failed due to protocol mismatch or authentication error.",
            )
        }
        _ => SeverityVerdict::new(
            Severity::Fatal,
            "Unknown error",
            format!("Test failed with error status {error_status}."),
        ),
    }
}

/// Heuristic for a truncation seen on some IPv4 paths: 5 to 7 intervals
/// collected out of a longer requested run. Environment specific, not a
/// protocol rule.
fn is_ipv4_early_termination(result: &ParsedResult) -> bool {
    (5..=7).contains(&result.interval_count) && result.expected_duration > 7
}
