//! Common types used across harness components.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

/// Reserved for relaying slave log output to the master.
pub const LOG_RELAY_PORT: u16 = 10001;
/// Slave test VM request listener.
pub const SLAVE_REQUEST_PORT: u16 = 10002;
/// Master keep-alive listener.
pub const KEEPALIVE_PORT: u16 = 10003;
/// Out-of-band status/suspend channel.
pub const AUTOT_PORT: u16 = 10004;
/// Slave harness request listener.
pub const HARNESS_REQUEST_PORT: u16 = 10005;

/// Default time allowed for an activation daemon to become reachable.
pub const ACTIVATION_START_TIMEOUT: Duration = Duration::from_secs(60);

/// Prefix of the single status line a test VM writes to its original stderr.
pub const STATUS_PREFIX: &str = "dth-status: ";

/// Outcome classification for a test result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureType {
    /// Environment problem (setup, infrastructure).
    Env,
    /// The test itself failed.
    Test,
    /// Indeterminate.
    Indef,
    /// Test was skipped.
    Skip,
    /// Failed, but eligible for a rerun.
    Rerun,
    Passed,
    /// No classification; analyzers use this to abstain.
    Unknown,
}

impl FailureType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Env => "ENV",
            Self::Test => "TEST",
            Self::Indef => "INDEF",
            Self::Skip => "SKIP",
            Self::Rerun => "RERUN",
            Self::Passed => "PASSED",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ENV" => Some(Self::Env),
            "TEST" => Some(Self::Test),
            "INDEF" => Some(Self::Indef),
            "SKIP" => Some(Self::Skip),
            "RERUN" => Some(Self::Rerun),
            "PASSED" => Some(Self::Passed),
            "UNKNOWN" => Some(Self::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the topology this process runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostRole {
    Master,
    Slave,
}

/// One entry of the ordered host list (`host` or `host:port`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostEntry {
    pub host: String,
    pub port: Option<u16>,
}

impl HostEntry {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        // Bracketed IPv6 literal: [::1]:10002
        if let Some(rest) = raw.strip_prefix('[') {
            let (host, tail) = rest.split_once(']')?;
            let port = tail.strip_prefix(':').and_then(|p| p.parse().ok());
            return Some(Self {
                host: host.to_string(),
                port,
            });
        }
        match raw.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => match port.parse() {
                Ok(port) => Some(Self {
                    host: host.to_string(),
                    port: Some(port),
                }),
                Err(_) => Some(Self {
                    host: raw.to_string(),
                    port: None,
                }),
            },
            _ => Some(Self {
                host: raw.to_string(),
                port: None,
            }),
        }
    }

    /// `host:port`, using `default_port` when the entry carries none.
    pub fn endpoint(&self, default_port: u16) -> String {
        let port = self.port.unwrap_or(default_port);
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, port)
        } else {
            format!("{}:{}", self.host, port)
        }
    }

    /// True when this entry names the machine we are running on.
    pub fn is_local(&self, local_host: &str) -> bool {
        if self.host.eq_ignore_ascii_case(local_host) || self.host.eq_ignore_ascii_case("localhost")
        {
            return true;
        }
        if let Ok(ip) = self.host.parse::<IpAddr>() {
            return ip.is_loopback();
        }
        // Short name vs fully qualified name.
        let short = |h: &str| h.split('.').next().unwrap_or(h).to_ascii_lowercase();
        short(&self.host) == short(local_host)
    }
}

impl fmt::Display for HostEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.host, port),
            None => f.write_str(&self.host),
        }
    }
}

/// Parse a comma- or whitespace-separated host list.
pub fn parse_host_list(raw: &str) -> Vec<HostEntry> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter_map(HostEntry::parse)
        .collect()
}

/// Resolve `endpoint` (`host:port`) to the first socket address.
pub fn resolve_endpoint(endpoint: &str) -> std::io::Result<SocketAddr> {
    endpoint.to_socket_addrs()?.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            format!("no address for {endpoint}"),
        )
    })
}

/// Local host name, falling back to `localhost`.
pub fn local_host_name() -> String {
    whoami::hostname().unwrap_or_else(|_| "localhost".to_string())
}
