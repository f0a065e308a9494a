//! Host network diagnostics
//!
//! Everything here shells out to standard Linux tools (`sysctl`, `iptables`,
//! `ufw`, `conntrack`) through [`run_command`], so a missing tool or a lack
//! of privileges shows up as absent data rather than an error.

use crate::command::run_command;
use crate::config::BinaryConfig;
use crate::probe::resolve_hostname;
use chrono::{DateTime, Utc};
use protocol::{ArgBuilder, ClientParams, IpVersion, TestType, parse_output};
use serde::Serialize;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tracing::info;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(3);
const CONNTRACK_TIMEOUT: Duration = Duration::from_secs(5);
const QUICK_TEST_DURATION_SEC: u32 = 2;
const QUICK_TEST_TIMEOUT: Duration = Duration::from_secs(5);

const RECOMMENDED_PORT_RANGE: (u32, u32) = (32768, 60999);
const MIN_SOCKET_BUFFER: u64 = 2 * 1024 * 1024;
const MIN_CONNTRACK_UDP_TIMEOUT: u64 = 30;
const CONNTRACK_SCAN_LINES: usize = 50;
const FIREWALL_RULE_LINES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WarningLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigWarning {
    pub category: &'static str,
    pub severity: WarningLevel,
    pub message: String,
    pub recommendation: String,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PortRange {
    pub start: u32,
    pub end: u32,
    pub count: u32,
}

/// Kernel limits, keyed by their sysctl names
#[derive(Debug, Clone, Default, Serialize)]
pub struct SocketBuffers {
    pub rmem_max: Option<u64>,
    pub wmem_max: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UdpConntrack {
    pub timeout: Option<u64>,
    pub timeout_stream: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemConfig {
    pub ephemeral_ports: Option<PortRange>,
    pub socket_buffers: SocketBuffers,
    pub udp_conntrack: UdpConntrack,
    pub firewall_rules: Vec<String>,
    pub warnings: Vec<ConfigWarning>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionTracking {
    pub available: bool,
    pub total_udp: usize,
    pub udpst_related: usize,
    pub active_connections: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UfwStatus {
    pub available: bool,
    pub enabled: bool,
    pub rules: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IptablesStatus {
    pub available: bool,
    pub has_rules: bool,
    pub udp_rules: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FirewallStatus {
    pub ufw: UfwStatus,
    pub iptables: IptablesStatus,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EphemeralPortTest {
    pub tested: bool,
    pub can_connect: bool,
    pub local_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QuickTest {
    pub success: bool,
    pub duration: u32,
    pub throughput: Option<f64>,
    pub intervals_collected: u32,
    pub error_status: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub raw_output: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverallStatus {
    Healthy,
    Warning,
    Critical,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteDiagnostics {
    pub timestamp: DateTime<Utc>,
    pub target_server: String,
    pub system_config: Option<SystemConfig>,
    pub firewall: Option<FirewallStatus>,
    pub connection_tracking: Option<ConnectionTracking>,
    pub ephemeral_port_test: Option<EphemeralPortTest>,
    pub quick_test: Option<QuickTest>,
    pub overall_status: OverallStatus,
    pub critical_issues: Vec<String>,
    pub recommendations: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Diagnostics {
    binary: BinaryConfig,
}

impl Diagnostics {
    pub fn new(binary: BinaryConfig) -> Self {
        Self { binary }
    }

    pub async fn system_config(&self) -> SystemConfig {
        let mut config = SystemConfig::default();

        if let Some(value) = sysctl("net.ipv4.ip_local_port_range").await {
            config.ephemeral_ports = parse_port_range(&value);
        }
        config.socket_buffers.rmem_max = sysctl_number("net.core.rmem_max").await;
        config.socket_buffers.wmem_max = sysctl_number("net.core.wmem_max").await;
        config.udp_conntrack.timeout =
            sysctl_number("net.netfilter.nf_conntrack_udp_timeout").await;
        config.udp_conntrack.timeout_stream =
            sysctl_number("net.netfilter.nf_conntrack_udp_timeout_stream").await;

        let iptables = run_command("iptables", ["-L", "-n", "-v"], COMMAND_TIMEOUT).await;
        if iptables.success {
            config.firewall_rules = udp_rule_lines(&iptables.stdout);
        }

        config.warnings = evaluate_warnings(&config);
        config
    }

    pub async fn connection_tracking(&self, port: u16) -> ConnectionTracking {
        let out = run_command("conntrack", ["-L", "-p", "udp"], CONNTRACK_TIMEOUT).await;
        if !out.success {
            return ConnectionTracking {
                error: Some(out.error.unwrap_or_else(|| out.stderr.trim().to_string())),
                ..Default::default()
            };
        }
        scan_conntrack(&out.stdout, port)
    }

    pub async fn firewall_status(&self) -> FirewallStatus {
        let mut status = FirewallStatus::default();

        let ufw = run_command("ufw", ["status", "verbose"], COMMAND_TIMEOUT).await;
        if ufw.success {
            status.ufw = parse_ufw(&ufw.stdout);
        }

        let iptables = run_command("iptables", ["-L", "-n", "-v"], COMMAND_TIMEOUT).await;
        if iptables.success {
            status.iptables = IptablesStatus {
                available: true,
                has_rules: iptables.stdout.lines().count() > 10,
                udp_rules: udp_rule_lines(&iptables.stdout),
            };
        }

        status
    }

    /// Bind an ephemeral UDP port and send one datagram to the target.
    pub async fn ephemeral_port_test(&self, ip: IpAddr, port: u16) -> EphemeralPortTest {
        let target = SocketAddr::new(ip, port);
        let result = tokio::task::spawn_blocking(move || send_from_ephemeral_port(target)).await;

        match result {
            Ok(Ok(local_port)) => EphemeralPortTest {
                tested: true,
                can_connect: true,
                local_port: Some(local_port),
                error: None,
            },
            Ok(Err((local_port, e))) => EphemeralPortTest {
                tested: local_port.is_some(),
                can_connect: false,
                local_port,
                error: Some(e.to_string()),
            },
            Err(e) => EphemeralPortTest {
                error: Some(e.to_string()),
                ..Default::default()
            },
        }
    }

    /// Two-second downstream run against `server`, hard-limited to five.
    pub async fn quick_test(&self, server: &str, port: u16) -> QuickTest {
        let mut result = QuickTest {
            duration: QUICK_TEST_DURATION_SEC,
            ..Default::default()
        };

        if !self.binary.path.is_file() {
            result.error = Some("UDPST binary not found".to_string());
            return result;
        }

        let params = ClientParams {
            test_type: TestType::Downstream,
            servers: vec![server.to_string()],
            port,
            duration: QUICK_TEST_DURATION_SEC,
            ip_version: if server.contains(':') {
                IpVersion::Ipv6
            } else {
                IpVersion::Ipv4
            },
            json_output: true,
            ..Default::default()
        };
        let args = ArgBuilder::new(&self.binary.flags, self.binary.default_port).client(&params);
        let out = run_command(&self.binary.path, &args, QUICK_TEST_TIMEOUT).await;

        if out.timed_out {
            result.error = Some(format!(
                "Test timeout ({}s)",
                QUICK_TEST_TIMEOUT.as_secs()
            ));
            return result;
        }
        if let Some(e) = out.error {
            result.error = Some(e);
            return result;
        }

        result.raw_output = if out.stdout.is_empty() {
            out.stderr.clone()
        } else {
            out.stdout.clone()
        };

        match parse_output(&out.stdout) {
            Ok(parsed) => {
                result.success = true;
                result.throughput = Some(parsed.throughput);
                result.intervals_collected = parsed.interval_count;
                result.error_status = Some(parsed.error_status);
            }
            Err(e) => result.error = Some(e.to_string()),
        }
        result
    }

    pub async fn complete(&self, server: &str, port: u16) -> CompleteDiagnostics {
        info!(server, "Running complete diagnostics");

        let mut report = CompleteDiagnostics {
            timestamp: Utc::now(),
            target_server: server.to_string(),
            system_config: None,
            firewall: None,
            connection_tracking: None,
            ephemeral_port_test: None,
            quick_test: None,
            overall_status: OverallStatus::Error,
            critical_issues: Vec::new(),
            recommendations: Vec::new(),
            error: None,
        };

        let ip = match resolve_hostname(server, COMMAND_TIMEOUT).await {
            Ok(ip) => ip,
            Err(e) => {
                report.error = Some(format!("{e:#}"));
                info!(server, "Diagnostics aborted: target unresolvable");
                return report;
            }
        };

        let system = self.system_config().await;
        let firewall = self.firewall_status().await;
        let tracking = self.connection_tracking(port).await;
        let ephemeral = self.ephemeral_port_test(ip, port).await;
        let quick = self.quick_test(server, port).await;

        let (status, issues, recommendations) = roll_up(&system.warnings, &quick);
        report.overall_status = status;
        report.critical_issues = issues;
        report.recommendations = recommendations;
        report.system_config = Some(system);
        report.firewall = Some(firewall);
        report.connection_tracking = Some(tracking);
        report.ephemeral_port_test = Some(ephemeral);
        report.quick_test = Some(quick);

        info!(
            server,
            status = ?report.overall_status,
            issues = report.critical_issues.len(),
            "Diagnostics completed"
        );
        report
    }
}

async fn sysctl(key: &str) -> Option<String> {
    let out = run_command("sysctl", [key], COMMAND_TIMEOUT).await;
    if !out.success {
        return None;
    }
    out.stdout
        .split_once('=')
        .map(|(_, value)| value.trim().to_string())
}

async fn sysctl_number(key: &str) -> Option<u64> {
    sysctl(key).await.and_then(|v| v.split_whitespace().next()?.parse().ok())
}

fn parse_port_range(value: &str) -> Option<PortRange> {
    let mut parts = value.split_whitespace().map(str::parse::<u32>);
    let start = parts.next()?.ok()?;
    let end = parts.next()?.ok()?;
    (end >= start).then(|| PortRange {
        start,
        end,
        count: end - start + 1,
    })
}

fn evaluate_warnings(config: &SystemConfig) -> Vec<ConfigWarning> {
    let mut warnings = Vec::new();

    if let Some(range) = config.ephemeral_ports {
        let (low, high) = RECOMMENDED_PORT_RANGE;
        if range.start > low || range.end < high {
            warnings.push(ConfigWarning {
                category: "ephemeral_ports",
                severity: WarningLevel::Medium,
                message: format!(
                    "Ephemeral port range {}-{} may not cover the recommended range {low}-{high}",
                    range.start, range.end
                ),
                recommendation: format!(
                    "Expand the range with: sudo sysctl -w net.ipv4.ip_local_port_range=\"{low} {high}\""
                ),
            });
        }
    }

    for (name, value) in [
        ("Receive", config.socket_buffers.rmem_max),
        ("Send", config.socket_buffers.wmem_max),
    ] {
        if let Some(value) = value.filter(|v| *v < MIN_SOCKET_BUFFER) {
            let key = if name == "Receive" { "rmem_max" } else { "wmem_max" };
            warnings.push(ConfigWarning {
                category: "socket_buffers",
                severity: WarningLevel::High,
                message: format!("{name} buffer size {value} is below the 2MB the binary needs"),
                recommendation: format!("Increase with: sudo sysctl -w net.core.{key}=134217728"),
            });
        }
    }

    if let Some(timeout) = config
        .udp_conntrack
        .timeout
        .filter(|t| *t < MIN_CONNTRACK_UDP_TIMEOUT)
    {
        warnings.push(ConfigWarning {
            category: "conntrack",
            severity: WarningLevel::Low,
            message: format!("UDP conntrack timeout {timeout}s is low"),
            recommendation: format!(
                "Consider raising net.netfilter.nf_conntrack_udp_timeout to {MIN_CONNTRACK_UDP_TIMEOUT}s or more"
            ),
        });
    }

    warnings
}

fn udp_rule_lines(iptables: &str) -> Vec<String> {
    iptables
        .lines()
        .filter(|line| line.to_lowercase().contains("udp"))
        .take(FIREWALL_RULE_LINES)
        .map(|line| line.trim().to_string())
        .collect()
}

fn parse_ufw(output: &str) -> UfwStatus {
    UfwStatus {
        available: true,
        enabled: output.to_lowercase().contains("status: active"),
        rules: output
            .lines()
            .filter(|l| l.contains("ALLOW") || l.contains("DENY") || l.contains("REJECT"))
            .map(|l| l.trim().to_string())
            .collect(),
    }
}

fn scan_conntrack(output: &str, port: u16) -> ConnectionTracking {
    let lines: Vec<&str> = output.lines().filter(|l| !l.trim().is_empty()).collect();
    let dport = format!("dport={port}");
    let sport = format!("sport={port}");

    // conntrack prints "dport=250001" for other ports too, so match whole tokens
    let active_connections: Vec<String> = lines
        .iter()
        .take(CONNTRACK_SCAN_LINES)
        .filter(|line| {
            line.split_whitespace()
                .any(|token| token == dport || token == sport)
        })
        .map(|line| line.trim().to_string())
        .collect();

    ConnectionTracking {
        available: true,
        total_udp: lines.len(),
        udpst_related: active_connections.len(),
        active_connections,
        error: None,
    }
}

fn send_from_ephemeral_port(
    target: SocketAddr,
) -> Result<u16, (Option<u16>, std::io::Error)> {
    let socket = Socket::new(Domain::for_address(target), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| (None, e))?;
    let local: SocketAddr = if target.is_ipv6() {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    };
    socket.bind(&local.into()).map_err(|e| (None, e))?;
    let local_port = socket
        .local_addr()
        .ok()
        .and_then(|addr| addr.as_socket())
        .map(|addr| addr.port());
    socket
        .set_write_timeout(Some(Duration::from_secs(2)))
        .map_err(|e| (local_port, e))?;
    socket
        .send_to(b"TEST", &target.into())
        .map_err(|e| (local_port, e))?;
    local_port.ok_or((None, std::io::Error::other("no local port")))
}

/// Overall status from configuration warnings and the quick test
fn roll_up(
    warnings: &[ConfigWarning],
    quick: &QuickTest,
) -> (OverallStatus, Vec<String>, Vec<String>) {
    let mut issues = Vec::new();
    let mut recommendations = Vec::new();

    for warning in warnings.iter().filter(|w| w.severity == WarningLevel::High) {
        issues.push(warning.message.clone());
        recommendations.push(warning.recommendation.clone());
    }

    if !quick.success {
        issues.push(format!(
            "Quick test failed: {}",
            quick.error.as_deref().unwrap_or("Unknown error")
        ));
        recommendations
            .push("Verify the UDPST server is running and network connectivity is working".to_string());
    }

    let status = if !issues.is_empty() {
        OverallStatus::Critical
    } else if !warnings.is_empty() {
        OverallStatus::Warning
    } else {
        OverallStatus::Healthy
    };

    (status, issues, recommendations)
}
