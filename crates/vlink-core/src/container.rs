//! Request containers — FIFO queues of pending requests with an
//! enable/disable lifecycle.
//!
//! A single concrete type covers all execution contexts; the phase tag
//! decides which request phase a dequeued request runs. Processor contexts
//! run the processing phase (the actual operation), completion contexts run
//! the completion phase (the user callback), and a worker's own container
//! decides per request.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{CoreError, CoreResult};
use crate::fatal_internal;
use crate::request::{Request, RequestStatus};
use crate::vinfo;
use crate::waiter::{RequestWaiter, Waiter};

/// Which request phase a container executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Dequeued requests run their processing phase.
    Processor,
    /// Dequeued requests run their completion phase.
    Completion,
    /// Per-request decision; used by workers which service both phases
    /// through one queue.
    Any,
}

/// Generic container for queued requests.
///
/// Passive data structure: any thread may submit, one consumer at a time
/// drains it (by convention, not enforced). Requests within one container
/// are processed in submission order; there is no cross-container ordering.
pub struct RequestContainer {
    name: String,
    phase: Phase,
    /// Temporal containers serve exactly one synchronous call site: they are
    /// enabled at creation and disabled when the last reference drops.
    temporal: bool,
    waiter: Mutex<Arc<dyn Waiter>>,
    queue: Mutex<VecDeque<Arc<Request>>>,
    enabled: AtomicBool,
    disable_ongoing: AtomicBool,
    /// Set while queued requests are being aborted; only AbortPending
    /// submissions are accepted in this phase.
    abort_ongoing: AtomicBool,
}

impl RequestContainer {
    /// Create a container with a default waiter.
    pub fn new(name: &str, phase: Phase) -> Arc<RequestContainer> {
        Self::with_waiter(name, phase, Arc::new(RequestWaiter::new()))
    }

    /// Create a container sharing the given waiter.
    pub fn with_waiter(
        name: &str,
        phase: Phase,
        waiter: Arc<dyn Waiter>,
    ) -> Arc<RequestContainer> {
        Arc::new(RequestContainer {
            name: name.to_owned(),
            phase,
            temporal: false,
            waiter: Mutex::new(waiter),
            queue: Mutex::new(VecDeque::new()),
            enabled: AtomicBool::new(false),
            disable_ongoing: AtomicBool::new(false),
            abort_ongoing: AtomicBool::new(false),
        })
    }

    /// Create a temporal completion context: enabled immediately, disabled
    /// when the last reference is dropped. Operation waiters bound to a
    /// temporal context block in their destructor until completion, since no
    /// dedicated thread pumps the queue.
    pub fn new_temporal() -> Arc<RequestContainer> {
        let ctx = Arc::new(RequestContainer {
            name: "temporal completion context".to_owned(),
            phase: Phase::Completion,
            temporal: true,
            waiter: Mutex::new(Arc::new(RequestWaiter::new())),
            queue: Mutex::new(VecDeque::new()),
            enabled: AtomicBool::new(false),
            disable_ongoing: AtomicBool::new(false),
            abort_ongoing: AtomicBool::new(false),
        });
        ctx.enable().expect("fresh container");
        ctx
    }

    /// Container name for diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execution phase of this container.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Check if this is a temporal completion context.
    pub fn is_temporal(&self) -> bool {
        self.temporal
    }

    /// Get the waiter associated with this container.
    pub fn waiter(&self) -> Arc<dyn Waiter> {
        self.waiter.lock().unwrap().clone()
    }

    /// Set the waiter associated with this container. Workers rebind their
    /// containers to the worker's own waiter.
    pub fn set_waiter(&self, waiter: Arc<dyn Waiter>) {
        *self.waiter.lock().unwrap() = waiter;
    }

    /// Submit a request to this container for processing or completion
    /// notification. Submissions to a fully disabled container are an
    /// internal error; during the abort drain only AbortPending requests
    /// are accepted.
    pub fn submit(&self, request: Arc<Request>) {
        {
            let mut queue = self.queue.lock().unwrap();
            if !self.is_enabled() {
                if !self.abort_ongoing.load(Ordering::SeqCst) {
                    fatal_internal!(
                        "request in state {:?} submitted to fully disabled container [{}]",
                        request.status(),
                        self.name
                    );
                }
                if request.status() != RequestStatus::AbortPending {
                    fatal_internal!(
                        "request in state {:?} submitted to disabled container [{}]",
                        request.status(),
                        self.name
                    );
                }
            }
            queue.push_back(request);
        }
        self.waiter().notify();
    }

    /// Process currently queued requests, up to `limit` (0 = no limit).
    /// Returns the number of requests processed.
    pub fn process_requests(&self, limit: usize) -> usize {
        let mut processed = 0;
        while limit == 0 || processed < limit {
            let request = self.queue.lock().unwrap().pop_front();
            match request {
                Some(request) => {
                    self.process_request(request);
                    processed += 1;
                }
                None => break,
            }
        }
        processed
    }

    /// Dispatch one dequeued request according to the container phase.
    fn process_request(&self, request: Arc<Request>) {
        match self.phase {
            Phase::Processor => request.process(true),
            Phase::Completion => request.process(false),
            Phase::Any => {
                let needs_processing = request.needs_processing();
                request.process(needs_processing);
            }
        }
    }

    /// Enable the container; it accepts requests after this.
    pub fn enable(&self) -> CoreResult<()> {
        if self.enabled.swap(true, Ordering::SeqCst) {
            return Err(CoreError::AlreadyEnabled);
        }
        Ok(())
    }

    /// Disable the container: stop accepting work and abort everything that
    /// is still queued. Idempotent; safe to call from any thread.
    pub fn disable(&self) {
        if !self.begin_disable() {
            return;
        }
        self.set_disabled();
        self.finish_disable();
    }

    /// Check if the container is currently enabled.
    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// First half of disable: claim the disable transition. Returns false
    /// when another disable already ran (repeat is logged, not an error).
    pub(crate) fn begin_disable(&self) -> bool {
        if self.disable_ongoing.swap(true, Ordering::SeqCst) {
            vinfo!("repeated disable of request container [{}]", self.name);
            return false;
        }
        true
    }

    /// Mark disabled and wake any consumer blocked on the waiter.
    pub(crate) fn set_disabled(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        self.waiter().notify();
    }

    /// Second half of disable: abort queued requests and verify the queue
    /// drained. The queue must be empty afterwards.
    pub(crate) fn finish_disable(&self) {
        self.abort_requests();
        let queue = self.queue.lock().unwrap();
        if !queue.is_empty() {
            fatal_internal!(
                "{} requests still present after container [{}] is disabled",
                queue.len(),
                self.name
            );
        }
    }

    /// Abort all queued requests. Aborting may generate follow-up
    /// submissions (AbortPending round trips), so run in rounds until the
    /// queue stays empty.
    fn abort_requests(&self) {
        self.abort_ongoing.store(true, Ordering::SeqCst);
        loop {
            let drained: Vec<Arc<Request>> = {
                let mut queue = self.queue.lock().unwrap();
                queue.drain(..).collect()
            };
            if drained.is_empty() {
                break;
            }
            for request in drained {
                request.abort();
                /* Run the completion phase to finalize AbortPending. */
                request.process(false);
            }
        }
        self.abort_ongoing.store(false, Ordering::SeqCst);
    }

    /// Number of queued requests. Diagnostic only, immediately stale.
    pub fn queue_len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

impl Drop for RequestContainer {
    fn drop(&mut self) {
        /* Temporal contexts disable themselves when the last holder lets
         * go; regular containers must be disabled by their owner. */
        if self.temporal && self.is_enabled() {
            self.disable();
        }
    }
}

impl std::fmt::Debug for RequestContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContainer")
            .field("name", &self.name)
            .field("phase", &self.phase)
            .field("enabled", &self.is_enabled())
            .field("queued", &self.queue_len())
            .finish()
    }
}
