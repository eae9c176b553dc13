//! Classification of mtr-packet responses.
//!
//! Response tokens (after the counter) look like:
//!
//! ```text
//! reply ip-4 1.2.3.4 round-trip-time 254144
//! ttl-expired ip-4 10.0.0.1 round-trip-time 400
//! no-reply
//! probes-exhausted
//! ```
//!
//! The responder address and round-trip time sit at fixed offsets 2 and 4.

use std::net::IpAddr;

/// Offset of the responder address in `reply` / `ttl-expired`
const ADDRESS_INDEX: usize = 2;
/// Offset of the round-trip time (microseconds)
const RTT_INDEX: usize = 4;

/// A parsed response to a `send-probe` request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResponse {
    /// The target itself answered
    Reply { address: IpAddr, rtt_us: u64 },
    /// An intermediate router answered with time exceeded
    TtlExpired { address: IpAddr, rtt_us: u64 },
    /// Nothing answered within the probe timeout
    NoReply,
    NoRoute,
    NetworkDown,
    PermissionDenied,
    /// Too many probes already in flight inside the helper
    ProbesExhausted,
    /// The response carried no tokens at all
    Empty,
    /// A `reply` / `ttl-expired` with a missing or unparsable address or RTT
    Malformed(String),
    Unknown(String),
}

impl ProbeResponse {
    pub fn parse<S: AsRef<str>>(tokens: &[S]) -> Self {
        let Some(kind) = tokens.first().map(|t| t.as_ref()) else {
            return Self::Empty;
        };
        match kind {
            "reply" => match responder(tokens) {
                Some((address, rtt_us)) => Self::Reply { address, rtt_us },
                None => Self::Malformed(join(tokens)),
            },
            "ttl-expired" => match responder(tokens) {
                Some((address, rtt_us)) => Self::TtlExpired { address, rtt_us },
                None => Self::Malformed(join(tokens)),
            },
            "no-reply" => Self::NoReply,
            "no-route" => Self::NoRoute,
            "network-down" => Self::NetworkDown,
            "permission-denied" => Self::PermissionDenied,
            "probes-exhausted" => Self::ProbesExhausted,
            other => Self::Unknown(other.to_string()),
        }
    }
}

fn responder<S: AsRef<str>>(tokens: &[S]) -> Option<(IpAddr, u64)> {
    let address: IpAddr = tokens.get(ADDRESS_INDEX)?.as_ref().parse().ok()?;
    let rtt_us: u64 = tokens.get(RTT_INDEX)?.as_ref().parse().ok()?;
    Some((address, rtt_us))
}

fn join<S: AsRef<str>>(tokens: &[S]) -> String {
    tokens
        .iter()
        .map(|t| t.as_ref())
        .collect::<Vec<&str>>()
        .join(" ")
}
