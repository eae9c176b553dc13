use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use crate::error::AddressError;

/// Command name for a single-hop probe
pub const SEND_PROBE: &str = "send-probe";

/// IP family of a trace target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }

    /// Token naming the local origin address family
    pub fn local_token(&self) -> &'static str {
        match self {
            Self::V4 => "local-ip-4",
            Self::V6 => "local-ip-6",
        }
    }

    /// Token naming the target address family
    pub fn target_token(&self) -> &'static str {
        match self {
            Self::V4 => "ip-4",
            Self::V6 => "ip-6",
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4 => write!(f, "IPv4"),
            Self::V6 => write!(f, "IPv6"),
        }
    }
}

/// One ICMP probe sent by the helper with a fixed TTL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeRequest {
    pub local: IpAddr,
    pub target: IpAddr,
    /// How long the helper itself waits for the probe
    pub timeout: Duration,
    pub ttl: u8,
}

impl ProbeRequest {
    /// Build the request tokens (everything after the counter)
    ///
    /// The helper only understands whole seconds for `timeout`.
    pub fn to_tokens(&self) -> Vec<String> {
        let family = Family::of(&self.target);
        vec![
            SEND_PROBE.to_string(),
            family.local_token().to_string(),
            self.local.to_string(),
            family.target_token().to_string(),
            self.target.to_string(),
            "timeout".to_string(),
            self.timeout.as_secs().to_string(),
            "ttl".to_string(),
            self.ttl.to_string(),
        ]
    }
}

/// Parse a textual IPv4 or IPv6 address (no prefix length, no port)
pub fn parse_ip(s: &str) -> Result<IpAddr, AddressError> {
    let trimmed = s.trim();
    trimmed
        .parse::<IpAddr>()
        .map_err(|_| AddressError(trimmed.to_string()))
}
