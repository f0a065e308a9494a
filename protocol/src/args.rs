//! Command line construction for the measurement binary
//!
//! Every recognised parameter maps to zero or more arguments. Flag spellings
//! live in [`FlagSet`] so a deployment can follow a binary whose CLI drifts
//! without touching code.

use crate::constants::{DEFAULT_CONNECTIONS, DEFAULT_CONTROL_PORT, DEFAULT_DURATION_SEC};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Direction of a client test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestType {
    Upstream,
    Downstream,
}

impl TestType {
    pub fn as_str(self) -> &'static str {
        match self {
            TestType::Upstream => "upstream",
            TestType::Downstream => "downstream",
        }
    }
}

impl fmt::Display for TestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TestType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upstream" => Ok(TestType::Upstream),
            "downstream" => Ok(TestType::Downstream),
            other => Err(format!("unknown test type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpVersion {
    #[default]
    Ipv4,
    Ipv6,
}

impl IpVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            IpVersion::Ipv4 => "ipv4",
            IpVersion::Ipv6 => "ipv6",
        }
    }
}

/// Flag spellings understood by the binary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlagSet {
    pub upstream: String,
    pub downstream: String,
    pub port: String,
    pub connections: String,
    pub duration: String,
    pub bandwidth: String,
    pub ipv4: String,
    pub ipv6: String,
    pub disable_jumbo: String,
    pub auth_key: String,
    pub daemon: String,
    pub verbose: String,
    pub output_format: String,
    pub json_format: String,
}

impl Default for FlagSet {
    fn default() -> Self {
        Self {
            upstream: "-u".to_string(),
            downstream: "-d".to_string(),
            port: "-p".to_string(),
            connections: "-C".to_string(),
            duration: "-t".to_string(),
            bandwidth: "-B".to_string(),
            ipv4: "-4".to_string(),
            ipv6: "-6".to_string(),
            disable_jumbo: "-j".to_string(),
            auth_key: "-a".to_string(),
            daemon: "-x".to_string(),
            verbose: "-v".to_string(),
            output_format: "-f".to_string(),
            json_format: "json".to_string(),
        }
    }
}

/// Parameters for a server-mode subprocess
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerParams {
    pub port: u16,
    /// Address or interface to bind; empty means all
    pub interface: String,
    pub daemon: bool,
    pub auth_key: String,
    /// `None` leaves the choice to the binary
    pub ip_version: Option<IpVersion>,
    pub verbose: bool,
}

impl Default for ServerParams {
    fn default() -> Self {
        Self {
            port: DEFAULT_CONTROL_PORT,
            interface: String::new(),
            daemon: false,
            auth_key: String::new(),
            ip_version: None,
            verbose: false,
        }
    }
}

/// Parameters for a client-mode test run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientParams {
    pub test_type: TestType,
    pub servers: Vec<String>,
    pub port: u16,
    pub connections: u32,
    /// Seconds
    pub duration: u32,
    /// Mbps, 0 means uncapped
    pub bandwidth: u32,
    pub ip_version: IpVersion,
    pub jumbo_frames: bool,
    pub verbose: bool,
    pub json_output: bool,
}

impl Default for ClientParams {
    fn default() -> Self {
        Self {
            test_type: TestType::Downstream,
            servers: Vec::new(),
            port: DEFAULT_CONTROL_PORT,
            connections: DEFAULT_CONNECTIONS,
            duration: DEFAULT_DURATION_SEC,
            bandwidth: 0,
            ip_version: IpVersion::Ipv4,
            jumbo_frames: true,
            verbose: false,
            json_output: true,
        }
    }
}

/// Turns parameter sets into argument vectors
pub struct ArgBuilder<'a> {
    flags: &'a FlagSet,
    default_port: u16,
}

impl<'a> ArgBuilder<'a> {
    pub fn new(flags: &'a FlagSet, default_port: u16) -> Self {
        Self { flags, default_port }
    }

    pub fn server(&self, params: &ServerParams) -> Vec<String> {
        let mut args = Vec::new();

        if params.port != self.default_port {
            args.push(self.flags.port.clone());
            args.push(params.port.to_string());
        }

        match params.ip_version {
            Some(IpVersion::Ipv4) => args.push(self.flags.ipv4.clone()),
            Some(IpVersion::Ipv6) => args.push(self.flags.ipv6.clone()),
            None => {}
        }

        if params.daemon {
            args.push(self.flags.daemon.clone());
        }

        if !params.auth_key.is_empty() {
            args.push(self.flags.auth_key.clone());
            args.push(params.auth_key.clone());
        }

        if params.verbose {
            args.push(self.flags.verbose.clone());
        }

        // Bind address is positional and must come last
        if !params.interface.is_empty() {
            args.push(params.interface.clone());
        }

        args
    }

    pub fn client(&self, params: &ClientParams) -> Vec<String> {
        let mut args = Vec::new();

        args.push(match params.test_type {
            TestType::Upstream => self.flags.upstream.clone(),
            TestType::Downstream => self.flags.downstream.clone(),
        });
        args.extend(params.servers.iter().cloned());

        if params.port != self.default_port {
            args.push(self.flags.port.clone());
            args.push(params.port.to_string());
        }

        if params.connections > 1 {
            args.push(self.flags.connections.clone());
            args.push(params.connections.to_string());
        }

        if params.duration > 0 {
            args.push(self.flags.duration.clone());
            args.push(params.duration.to_string());
        }

        if params.bandwidth > 0 {
            args.push(self.flags.bandwidth.clone());
            args.push(params.bandwidth.to_string());
        }

        args.push(match params.ip_version {
            IpVersion::Ipv4 => self.flags.ipv4.clone(),
            IpVersion::Ipv6 => self.flags.ipv6.clone(),
        });

        if !params.jumbo_frames {
            args.push(self.flags.disable_jumbo.clone());
        }

        if params.verbose {
            args.push(self.flags.verbose.clone());
        }

        if params.json_output {
            args.push(self.flags.output_format.clone());
            args.push(self.flags.json_format.clone());
        }

        args
    }
}

/// Render an invocation for operator display, quoting arguments with spaces.
pub fn command_line(binary: &str, args: &[String]) -> String {
    std::iter::once(binary)
        .chain(args.iter().map(String::as_str))
        .map(|part| {
            if part.is_empty() || part.contains(char::is_whitespace) {
                format!("'{}'", part.replace('\'', r"'\''"))
            } else {
                part.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
