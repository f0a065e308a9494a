//! UDP service responsiveness

use crate::command::run_command;
use crate::config::{BinaryConfig, ProbeConfig};
use protocol::{ArgBuilder, ClientParams, ErrorStatus, IpVersion, TestType, parse_output};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::debug;

/// Result of one UDP check
#[derive(Debug, Clone, PartialEq)]
pub struct UdpCheck {
    pub passed: bool,
    pub message: String,
}

impl UdpCheck {
    fn pass(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
        }
    }

    fn fail(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
        }
    }
}

/// Run a one-second downstream test with the binary and read its verdict.
pub async fn probe_with_binary(
    binary: &BinaryConfig,
    probe: &ProbeConfig,
    host: &str,
    port: u16,
) -> UdpCheck {
    let params = ClientParams {
        test_type: TestType::Downstream,
        servers: vec![host.to_string()],
        port,
        duration: 1,
        ip_version: if host.contains(':') {
            IpVersion::Ipv6
        } else {
            IpVersion::Ipv4
        },
        json_output: true,
        ..Default::default()
    };
    let args = ArgBuilder::new(&binary.flags, binary.default_port).client(&params);
    let timeout = Duration::from_millis(probe.binary_probe_timeout_ms);

    let out = run_command(&binary.path, &args, timeout).await;
    if out.timed_out {
        return UdpCheck::fail(format!(
            "No answer from UDP port {port} within {}ms",
            timeout.as_millis()
        ));
    }
    if let Some(e) = out.error {
        return UdpCheck::fail(e);
    }

    interpret_binary_output(&out.stdout, &out.combined_lower(), probe, port)
}

fn interpret_binary_output(stdout: &str, combined: &str, probe: &ProbeConfig, port: u16) -> UdpCheck {
    if let Ok(parsed) = parse_output(stdout) {
        let status = ErrorStatus::from_code(parsed.error_status);
        return match status {
            ErrorStatus::Success | ErrorStatus::Inconclusive(_) => {
                UdpCheck::pass(format!("UDP service on port {port} is responding"))
            }
            ErrorStatus::ConnectionUnavailable | ErrorStatus::MinConnectionsUnavailable => {
                UdpCheck::fail(format!(
                    "UDP service on port {port} did not accept a connection (ErrorStatus {})",
                    parsed.error_status
                ))
            }
            ErrorStatus::ProtocolMismatch | ErrorStatus::AuthenticationMismatch => {
                UdpCheck::fail(format!(
                    "Server on port {port} rejected the session: protocol or authentication mismatch"
                ))
            }
            ErrorStatus::Other(code) => {
                UdpCheck::fail(format!("Probe failed with ErrorStatus {code}"))
            }
        };
    }

    if let Some(marker) = probe.failure_markers.iter().find(|m| combined.contains(m.as_str())) {
        return UdpCheck::fail(format!("UDP port {port} check failed: {marker}"));
    }
    if probe.success_markers.iter().any(|m| combined.contains(m.as_str())) {
        return UdpCheck::pass(format!("UDP service on port {port} is responding"));
    }
    UdpCheck::fail(format!("No recognizable response from UDP port {port}"))
}

/// Send one datagram and wait briefly for anything back.
///
/// The service only answers a proper control request, so silence is not a
/// failure; a send error or an ICMP unreachable (seen as a recv error) is.
pub async fn probe_raw(ip: IpAddr, port: u16, timeout: Duration) -> UdpCheck {
    let target = SocketAddr::new(ip, port);
    let socket = match bind_probe_socket(&target) {
        Ok(socket) => socket,
        Err(e) => return UdpCheck::fail(format!("Failed to open UDP socket: {e}")),
    };

    if let Err(e) = socket.connect(target).await {
        return UdpCheck::fail(format!("Cannot reach {target}: {e}"));
    }
    if let Err(e) = socket.send(b"udpst-panel probe").await {
        return UdpCheck::fail(format!("Failed to send to {target}: {e}"));
    }

    let mut buf = [0u8; 1500];
    match tokio::time::timeout(timeout, socket.recv(&mut buf)).await {
        Ok(Ok(n)) => UdpCheck::pass(format!("UDP port {port} answered with {n} bytes")),
        Ok(Err(e)) => UdpCheck::fail(format!("UDP port {port} unreachable: {e}")),
        Err(_) => {
            debug!(%target, "No UDP reply, treating as open");
            UdpCheck::pass(format!(
                "Datagram to UDP port {port} sent without error (no reply expected)"
            ))
        }
    }
}

fn bind_probe_socket(target: &SocketAddr) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(*target), Type::DGRAM, Some(Protocol::UDP))?;
    let local: SocketAddr = if target.is_ipv6() {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    };
    socket.set_nonblocking(true)?;
    socket.bind(&local.into())?;
    UdpSocket::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe() -> ProbeConfig {
        ProbeConfig::default()
    }

    #[test]
    fn test_json_status_decides() {
        let ok = interpret_binary_output(r#"{"ErrorStatus": 0}"#, "", &probe(), 25000);
        assert!(ok.passed);
        let inconclusive = interpret_binary_output(r#"{"ErrorStatus": 2}"#, "", &probe(), 25000);
        assert!(inconclusive.passed);
        for code in [3, 4, 5, 200] {
            let json = format!(r#"{{"ErrorStatus": {code}}}"#);
            assert!(!interpret_binary_output(&json, "", &probe(), 25000).passed);
        }
    }

    #[test]
    fn test_markers_without_json() {
        let failed = interpret_binary_output("", "error: connection refused", &probe(), 25000);
        assert!(!failed.passed);
        assert!(failed.message.contains("connection refused"));

        let passed = interpret_binary_output("", "sub-interval[1]: 900 mbps", &probe(), 25000);
        assert!(passed.passed);

        assert!(!interpret_binary_output("", "???", &probe(), 25000).passed);
    }

    #[tokio::test]
    async fn test_raw_probe_to_closed_local_port() {
        // Reserve a port, then close it so nothing listens there
        let port = {
            let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
            socket.local_addr().unwrap().port()
        };
        let check = probe_raw("127.0.0.1".parse().unwrap(), port, Duration::from_secs(1)).await;
        // Linux reports the ICMP port unreachable on the connected socket
        assert!(!check.passed, "{}", check.message);
    }

    #[tokio::test]
    async fn test_raw_probe_to_listening_port() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        let check = probe_raw("127.0.0.1".parse().unwrap(), port, Duration::from_millis(300)).await;
        assert!(check.passed, "{}", check.message);
    }
}
