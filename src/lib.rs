//! Concurrent traceroute driven through the mtr-packet helper.
//!
//! A [`Tracer`] multiplexes the probes of every running trace over one
//! helper process; each trace walks TTLs one probe at a time until the
//! target answers, the route goes quiet, or the helper reports a fatal
//! condition.

// Public API - engine facade and data types
pub mod config;
pub mod error;
pub mod helper;
pub mod state;
pub mod tracer;

// Protocol layers, public for embedding with a custom transport
pub mod probe;
pub mod trace;

pub use config::Config;
pub use error::{ConfigError, HelperError, MuxError, TraceError};
pub use state::{Hop, Trace, TraceFailure};
pub use tracer::{PendingTrace, TraceResult, Tracer};
