//! Reachability checks for measurement servers
//!
//! A host counts as reachable only if it answers a ping AND its UDP service
//! looks responsive. Each check carries its own timeout so a probe always
//! resolves.

mod icmp;
mod udp;

pub use icmp::resolve_hostname;

use crate::config::{BinaryConfig, ProbeConfig};
use futures::future::join_all;
use serde::Serialize;
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Serialize)]
pub struct NamedCheck {
    pub name: &'static str,
    pub passed: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerReport {
    pub host: String,
    pub port: u16,
    pub reachable: bool,
    pub ping_successful: bool,
    pub udp_service_responsive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    pub checks: Vec<NamedCheck>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiServerReport {
    pub all_reachable: bool,
    pub total_servers: usize,
    pub reachable_servers: usize,
    pub unreachable_servers: usize,
    pub servers: Vec<ServerReport>,
}

#[derive(Debug, Clone)]
pub struct Prober {
    probe: ProbeConfig,
    binary: BinaryConfig,
}

impl Prober {
    pub fn new(probe: ProbeConfig, binary: BinaryConfig) -> Self {
        Self { probe, binary }
    }

    fn binary_usable(&self) -> bool {
        std::fs::metadata(&self.binary.path)
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }

    pub async fn check_server(&self, host: &str, port: u16) -> ServerReport {
        let ping_timeout = Duration::from_millis(self.probe.ping_timeout_ms);
        let udp_timeout = Duration::from_millis(self.probe.udp_timeout_ms);

        let mut report = ServerReport {
            host: host.to_string(),
            port,
            reachable: false,
            ping_successful: false,
            udp_service_responsive: false,
            latency_ms: None,
            checks: Vec::new(),
            error: None,
            recommendation: None,
        };

        let ip = match resolve_hostname(host, ping_timeout).await {
            Ok(ip) => ip,
            Err(e) => {
                let message = format!("{e:#}");
                report.checks.push(NamedCheck {
                    name: "Name Resolution",
                    passed: false,
                    message: message.clone(),
                });
                report.error = Some(message);
                report.recommendation = Some(format!(
                    "The host name {host} could not be resolved. Check the spelling or use an IP address."
                ));
                return report;
            }
        };

        let ping = icmp::ping(host, ip, ping_timeout);
        let udp = async {
            if self.binary_usable() {
                udp::probe_with_binary(&self.binary, &self.probe, host, port).await
            } else {
                udp::probe_raw(ip, port, udp_timeout).await
            }
        };
        let (ping, udp) = tokio::join!(ping, udp);

        match ping {
            Ok(rtt) => {
                report.ping_successful = true;
                report.latency_ms = Some(rtt);
                report.checks.push(NamedCheck {
                    name: "Network Ping",
                    passed: true,
                    message: format!("Host {host} is reachable"),
                });
            }
            Err(e) => report.checks.push(NamedCheck {
                name: "Network Ping",
                passed: false,
                message: format!("Host {host} is not reachable via ping: {e:#}"),
            }),
        }

        report.udp_service_responsive = udp.passed;
        report.checks.push(NamedCheck {
            name: "UDP Service",
            passed: udp.passed,
            message: udp.message,
        });

        report.reachable = report.ping_successful && report.udp_service_responsive;

        if !report.reachable {
            let mut issues = Vec::new();
            if !report.ping_successful {
                issues.push("Host is not reachable on the network".to_string());
            }
            if !report.udp_service_responsive {
                issues.push(format!("UDP service port {port} is not responding"));
            }
            report.error = Some(issues.join(". "));
            report.recommendation = Some(recommendation(&report));
        }

        info!(
            host,
            port,
            reachable = report.reachable,
            ping = report.ping_successful,
            udp = report.udp_service_responsive,
            "Server health check completed"
        );
        report
    }

    /// Probe every host concurrently.
    pub async fn check_multiple(&self, hosts: &[String], port: u16) -> MultiServerReport {
        let servers = join_all(hosts.iter().map(|host| self.check_server(host, port))).await;
        let reachable_servers = servers.iter().filter(|r| r.reachable).count();

        MultiServerReport {
            all_reachable: reachable_servers == servers.len(),
            total_servers: servers.len(),
            reachable_servers,
            unreachable_servers: servers.len() - reachable_servers,
            servers,
        }
    }
}

fn recommendation(report: &ServerReport) -> String {
    let mut parts = Vec::new();

    if !report.ping_successful {
        parts.push(format!(
            "The server at {} is not reachable. Verify the address is correct and the machine is \
             powered on, then check connectivity between this machine and the server.",
            report.host
        ));
    }

    if !report.udp_service_responsive {
        parts.push(format!(
            "UDP port {port} is not answering on {host}. Ensure the UDPST server is running there \
             (udpst -4 -x {host} for IPv4, udpst -6 -x {host} for IPv6) and that firewalls allow \
             inbound UDP on port {port}.",
            port = report.port,
            host = report.host
        ));
    }

    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Instant;

    fn prober() -> Prober {
        let binary = BinaryConfig {
            path: PathBuf::from("/nonexistent/udpst"),
            ..Default::default()
        };
        Prober::new(ProbeConfig::default(), binary)
    }

    #[tokio::test]
    async fn test_blackhole_address_is_unreachable_within_bound() {
        let started = Instant::now();
        let report = prober().check_server("192.0.2.1", 25000).await;

        assert!(!report.reachable);
        assert!(!report.ping_successful);
        assert!(report.error.is_some());
        assert!(report.recommendation.is_some());
        assert!(started.elapsed() < Duration::from_secs(8));
    }

    #[tokio::test]
    async fn test_unresolvable_host() {
        let report = prober().check_server("no-such-host.invalid", 25000).await;
        assert!(!report.reachable);
        assert_eq!(report.checks[0].name, "Name Resolution");
    }

    #[tokio::test]
    async fn test_multiple_aggregates_counts() {
        let hosts = vec!["192.0.2.1".to_string(), "192.0.2.2".to_string()];
        let started = Instant::now();
        let summary = prober().check_multiple(&hosts, 25000).await;

        assert_eq!(summary.total_servers, 2);
        assert_eq!(summary.unreachable_servers, 2);
        assert_eq!(summary.reachable_servers, 0);
        assert!(!summary.all_reachable);
        // concurrent, so roughly one probe's worth of time
        assert!(started.elapsed() < Duration::from_secs(8));
    }

    #[test]
    fn test_recommendation_mentions_failed_parts() {
        let report = ServerReport {
            host: "10.0.0.5".to_string(),
            port: 25001,
            reachable: false,
            ping_successful: true,
            udp_service_responsive: false,
            latency_ms: Some(1.0),
            checks: Vec::new(),
            error: None,
            recommendation: None,
        };
        let text = recommendation(&report);
        assert!(text.contains("25001"));
        assert!(!text.contains("not reachable"));
    }
}
