use chrono::{DateTime, Utc};
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;
use tracing::warn;

use crate::error::{MuxError, TraceError};
use crate::probe::{ProbeRequest, ProbeResponse};
use crate::trace::TIMEOUT;

/// Position of a session in its TTL walk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProbeState {
    /// TTL of the next probe
    pub ttl: u8,
    /// Hop number recorded for the next probe's result
    pub hop: u32,
    /// Consecutive `no-reply` results so far
    pub no_reply: u32,
}

impl ProbeState {
    pub fn initial() -> Self {
        Self {
            ttl: 1,
            hop: 1,
            no_reply: 0,
        }
    }

    /// State for the following TTL (None when the TTL would overflow)
    fn next(self) -> Option<Self> {
        Some(Self {
            ttl: self.ttl.checked_add(1)?,
            hop: self.hop + 1,
            no_reply: self.no_reply,
        })
    }
}

impl Default for ProbeState {
    fn default() -> Self {
        Self::initial()
    }
}

/// One measured (or silent) hop of a route
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hop {
    pub number: u32,
    /// Responding address, None for a hop that never answered
    pub address: Option<IpAddr>,
    /// Round-trip time in microseconds, None together with `address`
    pub rtt_us: Option<u64>,
}

impl Hop {
    pub fn responded(number: u32, address: IpAddr, rtt_us: u64) -> Self {
        Self {
            number,
            address: Some(address),
            rtt_us: Some(rtt_us),
        }
    }

    pub fn silent(number: u32) -> Self {
        Self {
            number,
            address: None,
            rtt_us: None,
        }
    }

    pub fn rtt(&self) -> Option<Duration> {
        self.rtt_us.map(Duration::from_micros)
    }
}

impl fmt::Display for Hop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.address, self.rtt_us) {
            (Some(address), Some(rtt_us)) => write!(f, "{} {} {}", self.number, address, rtt_us),
            _ => write!(f, "{} * *", self.number),
        }
    }
}

/// A completed route
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trace<X> {
    pub target: IpAddr,
    pub started_at: DateTime<Utc>,
    pub hops: Vec<Hop>,
    /// Caller data passed to `trace()`
    pub extra: X,
}

/// A trace that ended in failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFailure<X> {
    pub target: IpAddr,
    pub error: TraceError,
    /// Hops recorded before the failure
    pub hops: Vec<Hop>,
    pub extra: X,
}

impl<X> fmt::Display for TraceFailure<X> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trace to {} failed: {}", self.target, self.error)
    }
}

impl<X: fmt::Debug> std::error::Error for TraceFailure<X> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// What the session driver must do next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Send a probe for this state now
    Probe(ProbeState),
    /// Send a probe for this state after the retry delay
    Retry(ProbeState),
    /// Terminal: the route, or why there is none
    Done(Result<Vec<Hop>, TraceError>),
    /// The session already finished; nothing to do
    Idle,
}

/// Limits applied to one walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkLimits {
    /// Highest TTL a probe may carry
    pub max_ttl: u8,
    /// Consecutive silent hops after which the walk is considered complete
    pub no_reply_max: u32,
    /// Probe timeout handed to the helper
    pub request_timeout: Duration,
}

/// TTL-stepping state machine for one target.
///
/// The session never performs I/O: the driver asks for the next `Step`,
/// sends `request(state)` through the multiplexer, and feeds the outcome
/// back through `on_response` / `on_error`. The terminal `Step::Done` is
/// produced at most once.
#[derive(Debug)]
pub struct TraceSession {
    target: IpAddr,
    local: IpAddr,
    limits: WalkLimits,
    hops: Vec<Hop>,
    completed: bool,
}

impl TraceSession {
    pub fn new(target: IpAddr, local: IpAddr, limits: WalkLimits) -> Self {
        Self {
            target,
            local,
            limits,
            hops: Vec::new(),
            completed: false,
        }
    }

    pub fn target(&self) -> IpAddr {
        self.target
    }

    pub fn hops(&self) -> &[Hop] {
        &self.hops
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Hops recorded so far (empty after a successful finish)
    pub fn into_hops(self) -> Vec<Hop> {
        self.hops
    }

    /// First step of the walk
    pub fn start(&mut self) -> Step {
        if self.completed {
            return Step::Idle;
        }
        self.advance_to(Some(ProbeState::initial()))
    }

    /// The probe to send for `state`
    pub fn request(&self, state: ProbeState) -> ProbeRequest {
        ProbeRequest {
            local: self.local,
            target: self.target,
            timeout: self.limits.request_timeout,
            ttl: state.ttl,
        }
    }

    /// Feed the helper's response to the probe sent for `state`
    pub fn on_response(&mut self, state: ProbeState, response: ProbeResponse) -> Step {
        if self.completed {
            return Step::Idle;
        }
        match response {
            ProbeResponse::TtlExpired { address, rtt_us } => {
                self.hops.push(Hop::responded(state.hop, address, rtt_us));
                self.advance_to(state.next())
            }
            ProbeResponse::Reply { address, rtt_us } => {
                self.hops.push(Hop::responded(state.hop, address, rtt_us));
                self.succeed()
            }
            ProbeResponse::NoReply => {
                self.hops.push(Hop::silent(state.hop));
                let state = ProbeState {
                    no_reply: state.no_reply + 1,
                    ..state
                };
                if state.no_reply >= self.limits.no_reply_max {
                    // A silent tail ends the route rather than failing it
                    self.succeed()
                } else {
                    self.advance_to(state.next())
                }
            }
            ProbeResponse::ProbesExhausted => {
                warn!(
                    "Failed to send probe to {} with TTL {}: too many probes in flight, will retry",
                    self.target,
                    state.ttl
                );
                Step::Retry(state)
            }
            ProbeResponse::NoRoute => self.send_failed("no route to host"),
            ProbeResponse::NetworkDown => self.send_failed("network is down"),
            ProbeResponse::PermissionDenied => self.send_failed("permission denied"),
            ProbeResponse::Empty => self.fail(TraceError::Helper("no response line".to_string())),
            ProbeResponse::Malformed(line) => {
                self.fail(TraceError::Helper(format!("malformed response: {}", line)))
            }
            ProbeResponse::Unknown(kind) => {
                self.fail(TraceError::Helper(format!("unknown response type: {}", kind)))
            }
        }
    }

    /// Feed a request failure (anything but a response line)
    ///
    /// Watchdog timeouts retry the same state; any other reason ends the
    /// session with that reason.
    pub fn on_error(&mut self, state: ProbeState, reason: &str) -> Step {
        if self.completed {
            return Step::Idle;
        }
        if reason == TIMEOUT {
            warn!(
                "Probe to {} with TTL {} had no reply from the helper, retrying",
                self.target,
                state.ttl
            );
            return Step::Retry(state);
        }
        self.fail(TraceError::Helper(reason.to_string()))
    }

    /// The probe could not be issued at all
    pub fn on_send_error(&mut self, error: MuxError) -> Step {
        if self.completed {
            return Step::Idle;
        }
        self.fail(TraceError::Mux(error))
    }

    fn advance_to(&mut self, next: Option<ProbeState>) -> Step {
        match next.filter(|s| s.ttl <= self.limits.max_ttl) {
            Some(state) => Step::Probe(state),
            None => self.fail(TraceError::MaxHopsExceeded {
                target: self.target,
                max_ttl: self.limits.max_ttl,
            }),
        }
    }

    fn send_failed(&mut self, what: &str) -> Step {
        let message = format!("failed to send-probe to {}: {}", self.target, what);
        self.fail(TraceError::Helper(message))
    }

    fn succeed(&mut self) -> Step {
        self.completed = true;
        Step::Done(Ok(std::mem::take(&mut self.hops)))
    }

    fn fail(&mut self, error: TraceError) -> Step {
        self.completed = true;
        Step::Done(Err(error))
    }
}
