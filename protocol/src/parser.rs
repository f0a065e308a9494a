//! Extraction of metrics from the binary's stdout
//!
//! The binary has emitted several JSON shapes over time. Instead of probing
//! fields ad hoc, each metric is described by an ordered list of sources that
//! are tried in priority order, followed by an aggregate over the per-interval
//! records as a last resort.

use crate::error::ParseError;
use chrono::{DateTime, NaiveDateTime};
use serde::Serialize;
use serde_json::Value;

/// Metrics decoded from one run's output. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedResult {
    /// Mbps
    pub throughput: f64,
    /// Percent
    pub packet_loss: f64,
    /// Minimum one-way delay / RTT in ms
    pub latency: f64,
    /// Delay variation in ms
    pub jitter: f64,
    pub has_valid_data: bool,
    pub interval_count: u32,
    pub completion_percentage: f64,
    /// Duration the binary itself reports as requested, 0 when unknown
    pub expected_duration: u32,
    /// The binary's own outcome code, 0 when absent
    pub error_status: i64,
    pub error_message: Option<String>,
    pub error_message2: Option<String>,
    pub raw: Value,
}

#[derive(Debug, Clone, Copy)]
enum Transform {
    Identity,
    /// 0..1 ratio to percent
    RatioToPercent,
    /// "percent delivered" to "percent lost"
    DeliveredToLoss,
}

impl Transform {
    fn apply(self, value: f64) -> f64 {
        match self {
            Transform::Identity => value,
            Transform::RatioToPercent => value * 100.0,
            Transform::DeliveredToLoss => (100.0 - value).max(0.0),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Source {
    Field(&'static [&'static str], Transform),
    /// `max - min` when both are present
    Spread {
        max: &'static [&'static str],
        min: &'static [&'static str],
    },
}

#[derive(Debug, Clone, Copy)]
enum Reduce {
    Mean,
    Min,
}

/// Fallback over `IncrementalResult` entries
#[derive(Debug, Clone, Copy)]
struct IntervalRule {
    /// First key present in an entry wins; missing counts as 0
    keys: &'static [&'static str],
    positive_only: bool,
    reduce: Reduce,
    transform: Transform,
}

struct MetricRule {
    sources: &'static [Source],
    intervals: IntervalRule,
}

const THROUGHPUT: MetricRule = MetricRule {
    sources: &[
        Source::Field(&["IPLayerCapacity"], Transform::Identity),
        Source::Field(&["AvgRate"], Transform::Identity),
        Source::Field(&["Output", "IPLayerCapacity"], Transform::Identity),
        Source::Field(&["summary", "IPLayerCapacity"], Transform::Identity),
    ],
    intervals: IntervalRule {
        keys: &["IPLayerCapacity", "AvgRate"],
        positive_only: true,
        reduce: Reduce::Mean,
        transform: Transform::Identity,
    },
};

const PACKET_LOSS: MetricRule = MetricRule {
    sources: &[
        Source::Field(&["LossRatio"], Transform::RatioToPercent),
        Source::Field(&["Delivered"], Transform::DeliveredToLoss),
        Source::Field(&["Output", "LossRatio"], Transform::RatioToPercent),
        Source::Field(&["summary", "LossRatio"], Transform::RatioToPercent),
    ],
    intervals: IntervalRule {
        keys: &["LossRatio"],
        positive_only: false,
        reduce: Reduce::Mean,
        transform: Transform::RatioToPercent,
    },
};

const LATENCY: MetricRule = MetricRule {
    sources: &[
        Source::Field(&["MinDelay"], Transform::Identity),
        Source::Field(&["RTTMin"], Transform::Identity),
        Source::Field(&["Output", "MinDelay"], Transform::Identity),
        Source::Field(&["summary", "MinDelay"], Transform::Identity),
    ],
    intervals: IntervalRule {
        keys: &["MinDelay", "RTTMin"],
        positive_only: true,
        reduce: Reduce::Min,
        transform: Transform::Identity,
    },
};

const JITTER: MetricRule = MetricRule {
    sources: &[
        Source::Field(&["PDV"], Transform::Identity),
        Source::Spread {
            max: &["MaxDelay"],
            min: &["MinDelay"],
        },
        Source::Field(&["Output", "PDV"], Transform::Identity),
        Source::Field(&["summary", "PDV"], Transform::Identity),
    ],
    intervals: IntervalRule {
        keys: &["PDV"],
        positive_only: true,
        reduce: Reduce::Mean,
        transform: Transform::Identity,
    },
};

const INTERVAL_PATHS: &[&[&str]] = &[&["IncrementalResult"], &["Output", "IncrementalResult"]];
const BOM_PATHS: &[&[&str]] = &[&["BOMTime"], &["Output", "BOMTime"]];
const EOM_PATHS: &[&[&str]] = &[&["EOMTime"], &["Output", "EOMTime"]];
const EXPECTED_DURATION_PATHS: &[&[&str]] =
    &[&["TestIntTime"], &["TestInterval"], &["Input", "TestIntTime"]];
const ERROR_STATUS_PATHS: &[&[&str]] = &[&["ErrorStatus"], &["Output", "ErrorStatus"]];
const ERROR_MESSAGE_PATHS: &[&[&str]] = &[&["ErrorMessage"], &["Output", "ErrorMessage"]];
const ERROR_MESSAGE2_PATHS: &[&[&str]] = &[&["ErrorMessage2"], &["Output", "ErrorMessage2"]];

/// Parse captured stdout into a [`ParsedResult`].
///
/// The payload is the span from the first `{` to the last `}`, so banner
/// text printed around it is ignored.
pub fn parse_output(output: &str) -> Result<ParsedResult, ParseError> {
    let payload = extract_payload(output).ok_or(ParseError::NoStructuredOutput)?;
    let json: Value =
        serde_json::from_str(payload).map_err(|e| ParseError::MalformedOutput(e.to_string()))?;

    Ok(parse_value(json))
}

/// Same as [`parse_output`] for an already decoded document.
pub fn parse_value(json: Value) -> ParsedResult {
    let intervals = resolve_intervals(&json);

    let throughput = extract_metric(&json, intervals, &THROUGHPUT).max(0.0);
    let packet_loss = extract_metric(&json, intervals, &PACKET_LOSS).max(0.0);
    let latency = extract_metric(&json, intervals, &LATENCY);
    let jitter = extract_metric(&json, intervals, &JITTER);

    let (interval_count, has_valid_data) = account_intervals(&json, intervals);
    let expected_duration = EXPECTED_DURATION_PATHS
        .iter()
        .filter_map(|path| lookup(&json, path).and_then(as_number))
        .find(|v| *v > 0.0)
        .map(|v| v as u32)
        .unwrap_or(0);
    let completion_percentage = completion_percentage(interval_count, expected_duration);

    let error_status = first_number(&json, ERROR_STATUS_PATHS)
        .map(|v| v as i64)
        .unwrap_or(0);
    let error_message = first_string(&json, ERROR_MESSAGE_PATHS);
    let error_message2 = first_string(&json, ERROR_MESSAGE2_PATHS);

    ParsedResult {
        throughput,
        packet_loss,
        latency,
        jitter,
        has_valid_data,
        interval_count,
        completion_percentage,
        expected_duration,
        error_status,
        error_message,
        error_message2,
        raw: json,
    }
}

/// `min(100, count / expected * 100)`, or 0 when either side is unknown.
pub fn completion_percentage(interval_count: u32, expected_duration: u32) -> f64 {
    if expected_duration == 0 || interval_count == 0 {
        return 0.0;
    }
    (interval_count as f64 / expected_duration as f64 * 100.0).min(100.0)
}

fn extract_payload(output: &str) -> Option<&str> {
    let start = output.find('{')?;
    let end = output.rfind('}')?;
    (end > start).then(|| &output[start..=end])
}

fn lookup<'v>(json: &'v Value, path: &[&str]) -> Option<&'v Value> {
    let mut current = json;
    for key in path {
        current = current.get(key)?;
    }
    (!current.is_null()).then_some(current)
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn first_number(json: &Value, paths: &[&[&str]]) -> Option<f64> {
    paths
        .iter()
        .find_map(|path| lookup(json, path).and_then(as_number))
}

fn first_string(json: &Value, paths: &[&[&str]]) -> Option<String> {
    paths
        .iter()
        .find_map(|path| lookup(json, path).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn resolve_intervals(json: &Value) -> &[Value] {
    INTERVAL_PATHS
        .iter()
        .find_map(|path| lookup(json, path).and_then(Value::as_array))
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn extract_metric(json: &Value, intervals: &[Value], rule: &MetricRule) -> f64 {
    for source in rule.sources {
        match *source {
            Source::Field(path, transform) => {
                if let Some(value) = lookup(json, path) {
                    // A present but unreadable field still ends the search
                    return transform.apply(as_number(value).unwrap_or(0.0));
                }
            }
            Source::Spread { max, min } => {
                if let (Some(max), Some(min)) = (lookup(json, max), lookup(json, min)) {
                    return as_number(max).unwrap_or(0.0) - as_number(min).unwrap_or(0.0);
                }
            }
        }
    }

    aggregate_intervals(intervals, &rule.intervals).unwrap_or(0.0)
}

fn aggregate_intervals(intervals: &[Value], rule: &IntervalRule) -> Option<f64> {
    let values: Vec<f64> = intervals
        .iter()
        .map(|entry| {
            rule.keys
                .iter()
                .find_map(|key| entry.get(key).and_then(as_number))
                .unwrap_or(0.0)
        })
        .filter(|v| v.is_finite() && (!rule.positive_only || *v > 0.0))
        .collect();

    if values.is_empty() {
        return None;
    }

    let reduced = match rule.reduce {
        Reduce::Mean => values.iter().sum::<f64>() / values.len() as f64,
        Reduce::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
    };
    Some(rule.transform.apply(reduced))
}

/// Returns `(interval_count, has_valid_data)`.
fn account_intervals(json: &Value, intervals: &[Value]) -> (u32, bool) {
    if !intervals.is_empty() {
        return (intervals.len() as u32, true);
    }

    let bom = BOM_PATHS.iter().find_map(|p| lookup(json, p).and_then(parse_timestamp));
    let eom = EOM_PATHS.iter().find_map(|p| lookup(json, p).and_then(parse_timestamp));
    if let (Some(bom), Some(eom)) = (bom, eom) {
        if eom > bom {
            let seconds = ((eom - bom) / 1000) as u32;
            if seconds > 0 {
                return (seconds, true);
            }
        }
    }

    if let Some(test_interval) = lookup(json, &["TestInterval"]).and_then(as_number) {
        if test_interval > 0.0 {
            return (1, true);
        }
    }

    (0, false)
}

/// Milliseconds since the epoch
fn parse_timestamp(value: &Value) -> Option<i64> {
    let text = value.as_str()?.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.timestamp_millis());
    }

    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|naive| naive.and_utc().timestamp_millis())
}
