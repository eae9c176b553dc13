//! Error types for mtr-trace
//!
//! Library errors are grouped by the layer that raises them. Only
//! `ConfigError` and `TraceError` are ever seen by callers of `Tracer`;
//! codec errors are logged and dropped inside the multiplexer.

use std::io;
use std::net::IpAddr;
use std::path::PathBuf;

use thiserror::Error;

use crate::probe::Family;

/// Engine construction and per-trace configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A trace (or the engine) needs a local origin for this family
    #[error("no local {0} origin has been configured")]
    NoLocalAddress(Family),

    /// Neither a local IPv4 nor a local IPv6 origin was given
    #[error("at least one of local_ipv4 or local_ipv6 must be set")]
    NoLocalOrigin,

    /// The tracer was shut down; no new trace can start
    #[error("tracer has been shut down")]
    ShutDown,

    /// Invalid timing or TTL settings
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// Config file could not be read
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Config file is not valid TOML for `Config`
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// A string that is neither an IPv4 nor an IPv6 address
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to parse {0:?} as either an IPv4 or IPv6 address")]
pub struct AddressError(pub String);

/// Failure to start or wire up the mtr-packet helper
#[derive(Debug, Error)]
pub enum HelperError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to spawn helper {}: {source}", path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The child was spawned without one of its piped streams
    #[error("helper process has no {0} pipe")]
    MissingPipe(&'static str),
}

/// An incoming line that cannot be correlated to any request
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("response line is empty")]
    Empty,

    #[error("failed to parse request counter {0:?}")]
    BadCounter(String),
}

/// Errors raised by the request multiplexer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MuxError {
    /// More requests in flight than the id space can represent. Fatal:
    /// the multiplexer refuses all further requests once raised.
    #[error("request id space exhausted: id {0} is still outstanding")]
    IdSpaceExhausted(u32),

    /// The line could not be handed to the helper
    #[error("transport error: {0}")]
    Transport(String),
}

impl MuxError {
    /// Whether the engine can keep serving requests after this error
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::IdSpaceExhausted(_))
    }
}

/// Terminal failure of one trace session
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TraceError {
    /// The helper reported an unroutable or blocked probe, or an
    /// unusable response
    #[error("{0}")]
    Helper(String),

    /// The walk went past the configured maximum TTL
    #[error("max hops exceeded: no reply from {target} within {max_ttl} hops")]
    MaxHopsExceeded { target: IpAddr, max_ttl: u8 },

    /// The multiplexer could not carry the probe
    #[error(transparent)]
    Mux(#[from] MuxError),
}
