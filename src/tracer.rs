//! Engine facade: one multiplexer shared by any number of concurrent traces.

use chrono::Utc;
use std::future::Future;
use std::net::IpAddr;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config::Config;
use crate::error::{ConfigError, HelperError};
use crate::helper::HelperProcess;
use crate::probe::{Family, ProbeResponse};
use crate::state::{ProbeState, Step, Trace, TraceFailure, TraceSession};
use crate::trace::{ChannelSink, LineSink, Multiplexer, Outcome, run_reader, run_stderr_logger, run_writer};

/// Final result of one trace
pub type TraceResult<X> = Result<Trace<X>, TraceFailure<X>>;

/// Runs traceroutes through a single mtr-packet helper.
///
/// Every trace started on one `Tracer` shares its request counter and
/// helper pipe. Dropping the `Tracer` does not stop running traces; call
/// `shutdown` for that.
#[derive(Clone)]
pub struct Tracer {
    config: Arc<Config>,
    mux: Multiplexer<ProbeState>,
    cancel: CancellationToken,
}

impl Tracer {
    /// Create an engine writing requests to `sink`
    ///
    /// Response lines must be fed back through `handle_line` (or a
    /// `run_reader` task on `multiplexer()`).
    pub fn new(config: Config, sink: Arc<dyn LineSink>) -> Result<Self, ConfigError> {
        config.validate()?;
        let mux = Multiplexer::new(sink, config.wait_timeout);
        Ok(Self {
            config: Arc::new(config),
            mux,
            cancel: CancellationToken::new(),
        })
    }

    /// Spawn the helper at `path` and wire its pipes to a new engine
    pub fn spawn(config: Config, path: &Path) -> Result<(Self, HelperProcess), HelperError> {
        let (sink, lines) = ChannelSink::new();
        let tracer = Self::new(config, Arc::new(sink))?;
        let mut helper = HelperProcess::spawn(path)?;
        let (stdin, stdout, stderr) = helper.take_pipes()?;
        debug!("Connected to helper {}", path.display());

        let cancel = tracer.cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = run_writer(lines, stdin, cancel).await {
                error!("Writing to helper failed: {}", e);
            }
        });
        let mux = tracer.mux.clone();
        let cancel = tracer.cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = run_reader(stdout, mux, cancel).await {
                error!("Reading from helper failed: {}", e);
            }
        });
        let cancel = tracer.cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = run_stderr_logger(stderr, cancel).await {
                error!("Reading helper stderr failed: {}", e);
            }
        });

        Ok((tracer, helper))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn multiplexer(&self) -> &Multiplexer<ProbeState> {
        &self.mux
    }

    /// Feed one line read from the helper
    pub fn handle_line(&self, line: &str) {
        self.mux.on_incoming_line(line);
    }

    /// Start a trace to `target`; the returned future resolves once
    ///
    /// Must be called from within a tokio runtime. Fails immediately if no
    /// local origin is configured for the target's family, or after
    /// `shutdown`.
    pub fn trace<X>(&self, target: IpAddr, extra: X) -> Result<PendingTrace<X>, ConfigError>
    where
        X: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.trace_with(target, extra, move |result| {
            let _ = tx.send(result);
        })?;
        Ok(PendingTrace { rx })
    }

    /// Start a trace to `target` and call `on_done` with its result
    ///
    /// `on_done` runs at most once; it never runs if the tracer is shut
    /// down first.
    pub fn trace_with<X, F>(&self, target: IpAddr, extra: X, on_done: F) -> Result<(), ConfigError>
    where
        X: Send + 'static,
        F: FnOnce(TraceResult<X>) + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            return Err(ConfigError::ShutDown);
        }
        let local = self.config.local_for(Family::of(&target))?;
        let session = TraceSession::new(target, local, self.config.walk_limits());
        let driver = Driver {
            mux: self.mux.clone(),
            config: Arc::clone(&self.config),
            cancel: self.cancel.clone(),
        };

        debug!("Starting trace to {}", target);
        tokio::spawn(async move {
            if let Some(result) = driver.run(session, extra).await {
                on_done(result);
            }
        });
        Ok(())
    }

    /// Stop every running trace (and the helper pumps) without reporting
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Number of probes awaiting a helper response
    pub fn outstanding(&self) -> usize {
        self.mux.outstanding()
    }
}

/// Future for the result of `Tracer::trace`
///
/// Resolves to `None` if the tracer was shut down before the trace ended.
/// Dropping it does not stop the trace.
pub struct PendingTrace<X> {
    rx: oneshot::Receiver<TraceResult<X>>,
}

impl<X> Future for PendingTrace<X> {
    type Output = Option<TraceResult<X>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(Result::ok)
    }
}

/// Drives one `TraceSession` over the shared multiplexer
struct Driver {
    mux: Multiplexer<ProbeState>,
    config: Arc<Config>,
    cancel: CancellationToken,
}

impl Driver {
    /// Walk until the session finishes; None when cancelled
    async fn run<X>(self, mut session: TraceSession, extra: X) -> Option<TraceResult<X>> {
        let target = session.target();
        let started_at = Utc::now();
        let mut step = session.start();

        loop {
            let state = match step {
                Step::Probe(state) => state,
                Step::Retry(state) => {
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return None,
                        _ = tokio::time::sleep(self.config.retry_wait) => {}
                    }
                    state
                }
                Step::Done(Ok(hops)) => {
                    debug!("Trace to {} finished after {} hops", target, hops.len());
                    return Some(Ok(Trace {
                        target,
                        started_at,
                        hops,
                        extra,
                    }));
                }
                Step::Done(Err(error)) => {
                    debug!("Trace to {} failed: {}", target, error);
                    return Some(Err(TraceFailure {
                        target,
                        error,
                        hops: session.into_hops(),
                        extra,
                    }));
                }
                Step::Idle => return None,
            };

            if self.cancel.is_cancelled() {
                return None;
            }
            let tokens = session.request(state).to_tokens();
            let rx = match self.mux.request(tokens, state) {
                Ok(rx) => rx,
                Err(e) => {
                    if e.is_fatal() {
                        error!("Multiplexer can no longer issue probes: {}", e);
                    }
                    step = session.on_send_error(e);
                    continue;
                }
            };

            // Cancellation wins over an outcome that is already waiting
            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                outcome = rx => outcome,
            };
            step = match outcome {
                Ok(Outcome::Reply(reply)) => {
                    session.on_response(reply.extra, ProbeResponse::parse(&reply.response))
                }
                Ok(Outcome::Failure(failure)) => session.on_error(failure.extra, &failure.reason),
                // The request was dropped by a multiplexer reset
                Err(_) => session.on_error(state, "request dropped before a response arrived"),
            };
        }
    }
}
