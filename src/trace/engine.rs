use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::error::MuxError;
use crate::probe::{decode, encode};
use crate::trace::pending::{Failure, PendingRequest, Reply, RequestTable, TIMEOUT};
use crate::trace::transport::LineSink;

/// What eventually happened to one request
#[derive(Debug)]
pub enum Outcome<E> {
    Reply(Reply<E>),
    Failure(Failure<E>),
}

struct Inner<E> {
    table: Mutex<RequestTable<E>>,
    sink: Arc<dyn LineSink>,
    wait_timeout: Duration,
}

/// Correlates requests written to the helper with the response lines it
/// sends back, by counter, and times out requests that never get one.
///
/// Cloning is cheap; all clones share one id space and request table.
/// `send` must be called from within a tokio runtime (watchdogs are tasks).
pub struct Multiplexer<E> {
    inner: Arc<Inner<E>>,
}

impl<E> Clone for Multiplexer<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: Send + 'static> Multiplexer<E> {
    pub fn new(sink: Arc<dyn LineSink>, wait_timeout: Duration) -> Self {
        Self::with_table(sink, wait_timeout, RequestTable::new())
    }

    /// Build around an existing table (e.g. one with a preset allocator)
    pub fn with_table(sink: Arc<dyn LineSink>, wait_timeout: Duration, table: RequestTable<E>) -> Self {
        Self {
            inner: Arc::new(Inner {
                table: Mutex::new(table),
                sink,
                wait_timeout,
            }),
        }
    }

    /// Issue a request and register its callbacks
    ///
    /// Exactly one of `on_reply` / `on_error` runs later, unless the request
    /// is dropped by `reset`. Returns the allocated id.
    pub fn send<R, F>(&self, tokens: Vec<String>, on_reply: R, on_error: F, extra: E) -> Result<u32, MuxError>
    where
        R: FnOnce(Reply<E>) + Send + 'static,
        F: FnOnce(Failure<E>) + Send + 'static,
    {
        let (id, line) = {
            let mut table = self.inner.table.lock();
            let id = match table.allocate() {
                Ok(id) => id,
                Err(e) => {
                    error!("Cannot issue request {:?}: {}", tokens.join(" "), e);
                    return Err(e);
                }
            };
            let line = encode(id, &tokens);

            // Register before writing so a fast response always finds its entry
            let timer = self.arm_watchdog(id);
            table.insert(PendingRequest {
                id,
                tokens,
                on_reply: Box::new(on_reply),
                on_error: Box::new(on_error),
                extra,
                timer: Some(timer),
            });
            (id, line)
        };

        debug!("Sending request \"{}\"", line.trim_end());
        if let Err(e) = self.inner.sink.send_line(line) {
            // Nothing was written, so nothing can answer this id
            if let Some(mut request) = self.inner.table.lock().remove(id) {
                request.cancel_timer();
            }
            warn!("Failed to write request {}: {}", id, e);
            return Err(e);
        }
        Ok(id)
    }

    /// Issue a request and receive its outcome on a channel
    pub fn request(&self, tokens: Vec<String>, extra: E) -> Result<oneshot::Receiver<Outcome<E>>, MuxError> {
        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let on_error_tx = Arc::clone(&tx);
        self.send(
            tokens,
            move |reply| {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(Outcome::Reply(reply));
                }
            },
            move |failure| {
                if let Some(tx) = on_error_tx.lock().take() {
                    let _ = tx.send(Outcome::Failure(failure));
                }
            },
            extra,
        )?;
        Ok(rx)
    }

    /// Handle one line read from the helper's stdout
    pub fn on_incoming_line(&self, line: &str) {
        let (id, response) = match decode(line) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("Dropping response line {:?}: {}", line, e);
                return;
            }
        };

        let (request, remaining) = {
            let mut table = self.inner.table.lock();
            let request = table.remove(id);
            (request, table.len())
        };
        let Some(request) = request else {
            warn!("Received response for an unknown request: {:?}", line.trim_end());
            return;
        };

        debug!(
            "Received response for \"{} {}\" -> \"{} {}\" ({} requests outstanding)",
            id,
            request.tokens.join(" "),
            id,
            response.join(" "),
            remaining
        );
        request.reply(response);
    }

    /// Watchdog expiry for `id`
    pub fn on_timer_fire(&self, id: u32) {
        let request = self.inner.table.lock().remove(id);
        let Some(mut request) = request else {
            debug!("Timeout fired for a request which no longer exists: {}", id);
            return;
        };
        // The watchdog is the running task; nothing to abort
        request.timer = None;
        debug!(
            "Request \"{} {}\" timed out after {:?}",
            id,
            request.tokens.join(" "),
            self.inner.wait_timeout
        );
        request.fail(TIMEOUT);
    }

    /// Number of requests awaiting a response
    pub fn outstanding(&self) -> usize {
        self.inner.table.lock().len()
    }

    /// Whether the id space has been exhausted
    pub fn is_poisoned(&self) -> bool {
        self.inner.table.lock().is_poisoned()
    }

    /// Forget every outstanding request (without callbacks) and restart
    /// the counter at 0, e.g. after the helper was restarted
    pub fn reset(&self) {
        let dropped = self.inner.table.lock().clear();
        if dropped > 0 {
            warn!("Reset dropped {} outstanding requests", dropped);
        }
    }

    fn arm_watchdog(&self, id: u32) -> tokio::task::AbortHandle {
        let weak: Weak<Inner<E>> = Arc::downgrade(&self.inner);
        let wait = self.inner.wait_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            if let Some(inner) = weak.upgrade() {
                Multiplexer { inner }.on_timer_fire(id);
            }
        })
        .abort_handle()
    }
}
