//! Outstanding request tracking.
//!
//! The multiplexer registers a `PendingRequest` before writing its line to
//! the helper and removes it exactly once: when the matching response line
//! arrives or when its watchdog fires.

use std::collections::HashMap;
use tokio::task::AbortHandle;

use crate::error::MuxError;
use crate::probe::MAX_REQUEST_ID;

/// Reason passed to `on_error` when the watchdog fires
pub const TIMEOUT: &str = "timeout";

/// A correlated response
#[derive(Debug)]
pub struct Reply<E> {
    pub id: u32,
    /// Tokens originally sent (without the id)
    pub request: Vec<String>,
    /// Tokens received (without the id)
    pub response: Vec<String>,
    pub extra: E,
}

/// A request that never got a response
#[derive(Debug)]
pub struct Failure<E> {
    pub id: u32,
    pub request: Vec<String>,
    pub reason: String,
    pub extra: E,
}

pub type ReplyFn<E> = Box<dyn FnOnce(Reply<E>) + Send>;
pub type ErrorFn<E> = Box<dyn FnOnce(Failure<E>) + Send>;

/// One request awaiting its response line
pub struct PendingRequest<E> {
    pub id: u32,
    pub tokens: Vec<String>,
    pub on_reply: ReplyFn<E>,
    pub on_error: ErrorFn<E>,
    pub extra: E,
    /// Watchdog task; aborting it cancels the timeout
    pub timer: Option<AbortHandle>,
}

impl<E> PendingRequest<E> {
    /// Stop the watchdog (no-op if it already fired)
    pub fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// Consume the entry and deliver a response to its waiter
    pub fn reply(mut self, response: Vec<String>) {
        self.cancel_timer();
        (self.on_reply)(Reply {
            id: self.id,
            request: self.tokens,
            response,
            extra: self.extra,
        });
    }

    /// Consume the entry and deliver a failure to its waiter
    pub fn fail(mut self, reason: &str) {
        self.cancel_timer();
        (self.on_error)(Failure {
            id: self.id,
            request: self.tokens,
            reason: reason.to_string(),
            extra: self.extra,
        });
    }
}

/// Monotonic request counter bounded to `0..=MAX_REQUEST_ID`
#[derive(Debug, Clone, Default)]
pub struct IdAllocator {
    next: u32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start counting from `next` (clamped to the id range)
    pub fn starting_at(next: u32) -> Self {
        Self {
            next: next.min(MAX_REQUEST_ID),
        }
    }

    /// Id the next successful `allocate` will return
    pub fn peek(&self) -> u32 {
        self.next
    }

    /// Take the next id, wrapping to 0 after `MAX_REQUEST_ID`
    ///
    /// Fails if the id handed out, or id 0 at the wrap point, is still in
    /// use: the table then holds more requests than the id space can
    /// represent.
    pub fn allocate(&mut self, in_use: impl Fn(u32) -> bool) -> Result<u32, MuxError> {
        let id = self.next;
        if in_use(id) {
            return Err(MuxError::IdSpaceExhausted(id));
        }
        if id >= MAX_REQUEST_ID {
            if in_use(0) {
                return Err(MuxError::IdSpaceExhausted(0));
            }
            self.next = 0;
        } else {
            self.next = id + 1;
        }
        Ok(id)
    }

    pub fn reset(&mut self) {
        self.next = 0;
    }
}

/// Id allocator plus the in-flight request map
pub struct RequestTable<E> {
    ids: IdAllocator,
    requests: HashMap<u32, PendingRequest<E>>,
    /// Set once the id space is exhausted; every later allocation fails
    poisoned: Option<MuxError>,
}

impl<E> Default for RequestTable<E> {
    fn default() -> Self {
        Self::with_allocator(IdAllocator::new())
    }
}

impl<E> RequestTable<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_allocator(ids: IdAllocator) -> Self {
        Self {
            ids,
            requests: HashMap::new(),
            poisoned: None,
        }
    }

    /// Allocate an id for a new request
    pub fn allocate(&mut self) -> Result<u32, MuxError> {
        if let Some(err) = &self.poisoned {
            return Err(err.clone());
        }
        let requests = &self.requests;
        match self.ids.allocate(|id| requests.contains_key(&id)) {
            Ok(id) => Ok(id),
            Err(err) => {
                self.poisoned = Some(err.clone());
                Err(err)
            }
        }
    }

    pub fn insert(&mut self, request: PendingRequest<E>) {
        let previous = self.requests.insert(request.id, request);
        debug_assert!(previous.is_none(), "request id reused while outstanding");
    }

    pub fn remove(&mut self, id: u32) -> Option<PendingRequest<E>> {
        self.requests.remove(&id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.requests.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.is_some()
    }

    /// Drop every outstanding request without invoking its callbacks and
    /// rewind the counter. Returns how many requests were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.requests.len();
        for (_, mut request) in self.requests.drain() {
            request.cancel_timer();
        }
        self.ids.reset();
        self.poisoned = None;
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request(id: u32, replies: Arc<AtomicUsize>, errors: Arc<AtomicUsize>) -> PendingRequest<u32> {
        PendingRequest {
            id,
            tokens: vec!["send-probe".to_string()],
            on_reply: Box::new(move |_| {
                replies.fetch_add(1, Ordering::SeqCst);
            }),
            on_error: Box::new(move |_| {
                errors.fetch_add(1, Ordering::SeqCst);
            }),
            extra: id,
            timer: None,
        }
    }

    fn noop(id: u32) -> PendingRequest<u32> {
        request(id, Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)))
    }

    #[test]
    fn test_allocate_sequential() {
        let mut ids = IdAllocator::new();
        assert_eq!(ids.allocate(|_| false).unwrap(), 0);
        assert_eq!(ids.allocate(|_| false).unwrap(), 1);
        assert_eq!(ids.allocate(|_| false).unwrap(), 2);
        assert_eq!(ids.peek(), 3);
    }

    #[test]
    fn test_allocate_wraps_to_zero() {
        let mut ids = IdAllocator::starting_at(MAX_REQUEST_ID);
        assert_eq!(ids.allocate(|_| false).unwrap(), MAX_REQUEST_ID);
        assert_eq!(ids.allocate(|_| false).unwrap(), 0);
    }

    #[test]
    fn test_wrap_with_zero_outstanding_is_fatal() {
        let mut ids = IdAllocator::starting_at(MAX_REQUEST_ID);
        let err = ids.allocate(|id| id == 0).unwrap_err();
        assert_eq!(err, MuxError::IdSpaceExhausted(0));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_allocate_refuses_outstanding_id() {
        let mut ids = IdAllocator::starting_at(5);
        assert_eq!(
            ids.allocate(|id| id == 5),
            Err(MuxError::IdSpaceExhausted(5))
        );
    }

    #[test]
    fn test_reset_rewinds_to_zero() {
        let mut ids = IdAllocator::starting_at(41);
        assert_eq!(ids.allocate(|_| false), Ok(41));
        ids.reset();
        assert_eq!(ids.peek(), 0);
        assert_eq!(ids.allocate(|_| false), Ok(0));
    }

    #[test]
    fn test_starting_at_clamps() {
        assert_eq!(IdAllocator::starting_at(u32::MAX).peek(), MAX_REQUEST_ID);
    }

    #[test]
    fn test_table_ids_unique_while_outstanding() {
        let mut table = RequestTable::new();
        let mut seen = HashSet::new();
        for _ in 0..100 {
            let id = table.allocate().unwrap();
            assert!(seen.insert(id));
            table.insert(noop(id));
        }
        assert_eq!(table.len(), 100);
    }

    #[test]
    fn test_table_exhaustion_poisons() {
        let mut table = RequestTable::with_allocator(IdAllocator::starting_at(MAX_REQUEST_ID));
        table.insert(noop(0));

        assert_eq!(table.allocate(), Err(MuxError::IdSpaceExhausted(0)));
        assert!(table.is_poisoned());

        // Freeing id 0 does not make the engine usable again
        table.remove(0);
        assert_eq!(table.allocate(), Err(MuxError::IdSpaceExhausted(0)));
    }

    #[test]
    fn test_reply_invokes_only_on_reply() {
        let replies = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));
        request(1, replies.clone(), errors.clone()).reply(vec!["no-reply".to_string()]);
        assert_eq!(replies.load(Ordering::SeqCst), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_fail_passes_reason_and_extra() {
        let mut pending = noop(9);
        let seen = Arc::new(parking_lot::Mutex::new(None));
        let sink = seen.clone();
        pending.on_error = Box::new(move |failure| {
            *sink.lock() = Some((failure.id, failure.reason, failure.extra));
        });
        pending.fail(TIMEOUT);
        assert_eq!(*seen.lock(), Some((9, "timeout".to_string(), 9)));
    }

    #[test]
    fn test_clear_drops_without_callbacks() {
        let replies = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));
        let mut table = RequestTable::new();
        for _ in 0..3 {
            let id = table.allocate().unwrap();
            table.insert(request(id, replies.clone(), errors.clone()));
        }
        assert_eq!(table.clear(), 3);
        assert!(table.is_empty());
        assert_eq!(table.allocate().unwrap(), 0);
        assert_eq!(replies.load(Ordering::SeqCst), 0);
        assert_eq!(errors.load(Ordering::SeqCst), 0);
    }
}
