//! Network-layer reachability

use crate::command::run_command;
use anyhow::{Context, Result};
use std::net::IpAddr;
use std::time::Duration;
use surge_ping::{Client, Config as PingConfig, ICMP, PingIdentifier, PingSequence};
use tracing::debug;

/// Ping `ip` once and return the round trip in milliseconds.
///
/// Uses an ICMP socket when the process may open one, otherwise the system
/// `ping`/`ping6` command.
pub async fn ping(host: &str, ip: IpAddr, timeout: Duration) -> Result<f64> {
    let kind = if ip.is_ipv6() { ICMP::V6 } else { ICMP::V4 };
    let client = match Client::new(&PingConfig::builder().kind(kind).build()) {
        Ok(client) => client,
        Err(e) => {
            debug!("ICMP socket unavailable ({}), using ping command", e);
            return ping_command(host, ip, timeout).await;
        }
    };

    let payload = [0u8; 56];
    let mut pinger = client.pinger(ip, PingIdentifier(rand::random())).await;
    pinger.timeout(timeout);

    match tokio::time::timeout(timeout, pinger.ping(PingSequence(0), &payload)).await {
        Ok(Ok((_packet, rtt))) => Ok(rtt.as_secs_f64() * 1000.0),
        Ok(Err(e)) => anyhow::bail!("Ping failed: {}", e),
        Err(_) => anyhow::bail!("Ping timeout after {:?}", timeout),
    }
}

async fn ping_command(host: &str, ip: IpAddr, timeout: Duration) -> Result<f64> {
    // ping6 for IPv6-shaped targets, matching what the host string asked for
    let program = if host.contains(':') || ip.is_ipv6() {
        "ping6"
    } else {
        "ping"
    };
    let wait_secs = timeout.as_secs_f64().ceil().max(1.0) as u64;
    let args = [
        "-c".to_string(),
        "1".to_string(),
        "-W".to_string(),
        wait_secs.to_string(),
        ip.to_string(),
    ];

    let out = run_command(program, &args, timeout + Duration::from_millis(500)).await;
    if let Some(e) = out.error {
        anyhow::bail!(e);
    }
    if !out.success {
        anyhow::bail!("{} reported no reply", program);
    }
    Ok(parse_rtt(&out.stdout).unwrap_or(0.0))
}

/// `time=12.3 ms` from ping's reply line
fn parse_rtt(output: &str) -> Option<f64> {
    let start = output.find("time=")? + "time=".len();
    let rest = &output[start..];
    let end = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(rest.len());
    rest[..end].parse().ok()
}

/// Resolve a host name or literal to one address.
pub async fn resolve_hostname(host: &str, timeout: Duration) -> Result<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }

    let lookup = tokio::net::lookup_host((host, 0));
    let mut addrs = tokio::time::timeout(timeout, lookup)
        .await
        .context("Name resolution timed out")?
        .with_context(|| format!("Failed to resolve {host}"))?;
    addrs
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| anyhow::anyhow!("No addresses found for {host}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rtt() {
        let line = "64 bytes from 1.1.1.1: icmp_seq=1 ttl=57 time=12.3 ms";
        assert_eq!(parse_rtt(line), Some(12.3));
        assert_eq!(parse_rtt("no reply"), None);
    }

    #[tokio::test]
    async fn test_resolve_literals() {
        let timeout = Duration::from_secs(1);
        assert_eq!(
            resolve_hostname("192.0.2.1", timeout).await.unwrap(),
            "192.0.2.1".parse::<IpAddr>().unwrap()
        );
        assert!(resolve_hostname("2001:db8::1", timeout).await.unwrap().is_ipv6());
    }
}
