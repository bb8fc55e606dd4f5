//! Request — a unit of deferred work with a single eventual completion.
//!
//! A request carries a processing handler (the actual operation, executed in
//! a processor context), a completion handler (user notification, executed
//! in a completion context) and optional cancellation/done handlers. The
//! reliability contract of the whole pipeline hangs on this type: every
//! submitted request reaches exactly one terminal callback, whether it
//! completes normally, is canceled, aborted or times out.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::container::RequestContainer;
use crate::error::{CoreError, CoreResult};
use crate::fatal_internal;

/// Callback denoting a handler of the request.
pub type Handler = Box<dyn FnOnce() + Send>;

/// Request processing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestStatus {
    /// Waiting for processing. Initial state.
    Pending = 0,

    /// Not yet taken from the processor input queue and cancel() was called.
    CancellationPending = 1,

    /// Taken from the processor input queue in CancellationPending state.
    Canceling = 2,

    /// Processing handler was called and the request is being processed.
    Processing = 3,

    /// abort() was called and the request is submitted to the completion
    /// context so that the completion handler is released in a user context
    /// rather than in the aborting thread.
    AbortPending = 4,

    /// abort() was called and full cleanup is done.
    Aborted = 5,

    /// Request successfully processed. Result code.
    Ok = 6,

    /// Request was canceled. Result code.
    Canceled = 7,
}

impl RequestStatus {
    /// Result codes are the terminal states passed to complete_with().
    #[inline]
    pub const fn is_result(&self) -> bool {
        matches!(self, RequestStatus::Ok | RequestStatus::Canceled)
    }
}

impl From<u8> for RequestStatus {
    fn from(v: u8) -> Self {
        match v {
            0 => RequestStatus::Pending,
            1 => RequestStatus::CancellationPending,
            2 => RequestStatus::Canceling,
            3 => RequestStatus::Processing,
            4 => RequestStatus::AbortPending,
            5 => RequestStatus::Aborted,
            6 => RequestStatus::Ok,
            _ => RequestStatus::Canceled,
        }
    }
}

/// Handler slots and the completion context. Protected by the request mutex.
struct Inner {
    processing_handler: Option<Handler>,
    completion_handler: Option<Handler>,
    cancellation_handler: Option<Handler>,
    done_handler: Option<Handler>,
    completion_context: Option<Arc<RequestContainer>>,
}

/// Generic request for inter-thread communication and asynchronous
/// operations. Shared between the submitter (via an operation waiter), the
/// processor container and the completion container; lives as long as the
/// longest holder.
pub struct Request {
    inner: Mutex<Inner>,
    /// Signaled on every state change; wait_done() sleeps here.
    done_cv: Condvar,
    /// Mirror of the state for lock-free reads. Written under the mutex.
    status: AtomicU8,
    /// complete_with() was invoked.
    completion_processed: AtomicBool,
    /// Completion handler was invoked and returned.
    completion_delivered: AtomicBool,
    /// The operation timed out. Set by the timeout path, read by I/O
    /// completion to pick TimedOut over Canceled.
    timed_out: AtomicBool,
    this: Weak<Request>,
}

impl Request {
    pub fn new() -> Arc<Request> {
        Arc::new_cyclic(|this| Request {
            inner: Mutex::new(Inner {
                processing_handler: None,
                completion_handler: None,
                cancellation_handler: None,
                done_handler: None,
                completion_context: None,
            }),
            done_cv: Condvar::new(),
            status: AtomicU8::new(RequestStatus::Pending as u8),
            completion_processed: AtomicBool::new(false),
            completion_delivered: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    fn shared(&self) -> Arc<Request> {
        // The weak self-reference is set at construction and the caller
        // holds at least one strong reference.
        self.this.upgrade().expect("request self reference")
    }

    /// Current request status.
    #[inline]
    pub fn status(&self) -> RequestStatus {
        self.status.load(Ordering::SeqCst).into()
    }

    #[inline]
    fn set_status(&self, status: RequestStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
    }

    /// Check if the request reached a result code.
    #[inline]
    pub fn is_completed(&self) -> bool {
        self.status().is_result()
    }

    /// Check if the request is aborted or abort is pending.
    #[inline]
    pub fn is_aborted(&self) -> bool {
        matches!(
            self.status(),
            RequestStatus::Aborted | RequestStatus::AbortPending
        )
    }

    /// Check if the request is currently being processed.
    #[inline]
    pub fn is_processing(&self) -> bool {
        self.status() == RequestStatus::Processing
    }

    /// Check if the completion notification was delivered.
    #[inline]
    pub fn is_completion_delivered(&self) -> bool {
        self.completion_delivered.load(Ordering::SeqCst)
    }

    /// Check if the request is fully processed: all handlers were invoked
    /// and no more actions are pending.
    #[inline]
    pub fn is_done(&self) -> bool {
        self.is_completion_delivered() || self.is_aborted()
    }

    /// True only if the processing phase (process(true)) is still needed.
    /// AbortPending requests go to completion contexts only.
    #[inline]
    pub fn needs_processing(&self) -> bool {
        !self.is_completed() && self.status() != RequestStatus::AbortPending
    }

    /// Check the timed-out mark.
    #[inline]
    pub fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    /// Mark the request as timed out.
    #[inline]
    pub fn mark_timed_out(&self) {
        self.timed_out.store(true, Ordering::SeqCst);
    }

    /// Set the processing handler. It is called when the request is about to
    /// be processed in the target processor context.
    pub fn set_processing_handler(&self, handler: Handler) -> CoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if self.status() != RequestStatus::Pending {
            return Err(CoreError::InvalidState);
        }
        inner.processing_handler = Some(handler);
        Ok(())
    }

    /// Set the completion handler and the context it must be delivered to.
    pub fn set_completion_handler(
        &self,
        context: Arc<RequestContainer>,
        handler: Handler,
    ) -> CoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if self.status() != RequestStatus::Pending {
            return Err(CoreError::InvalidState);
        }
        inner.completion_context = Some(context);
        inner.completion_handler = Some(handler);
        Ok(())
    }

    /// Set the cancellation handler. It fires when cancel() or abort() hits
    /// the request while it is in Processing state. The handler should take
    /// whatever cooperative action the operation supports; completing the
    /// request from it (with a Canceled result) is legal.
    pub fn set_cancellation_handler(&self, handler: Handler) -> CoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if self.status() != RequestStatus::Pending {
            return Err(CoreError::InvalidState);
        }
        inner.cancellation_handler = Some(handler);
        Ok(())
    }

    /// Set or clear the done handler. It is invoked when the request reaches
    /// the done state, in both completion and abortion scenarios. If the
    /// request is already done the handler is invoked immediately from this
    /// call.
    pub fn set_done_handler(&self, handler: Option<Handler>) {
        let mut inner = self.inner.lock().unwrap();
        let is_done = self.is_done();
        if !is_done {
            inner.done_handler = handler;
            return;
        }
        drop(inner);
        if let Some(handler) = handler {
            handler();
        }
    }

    /// Get the completion context associated with the request. None if the
    /// request is already fully processed or was never given one.
    pub fn completion_context(&self) -> Option<Arc<RequestContainer>> {
        self.inner.lock().unwrap().completion_context.clone()
    }

    /// Process the request: run either the processing phase (true) or the
    /// completion notification phase (false). Called by containers when the
    /// request is dequeued.
    pub fn process(&self, process_request: bool) {
        let mut inner = self.inner.lock().unwrap();
        match self.status() {
            RequestStatus::Aborted => {
                /* Typical when a third party aborts a request which is still
                 * queued in some container. */
                return;
            }
            RequestStatus::AbortPending => {
                if process_request {
                    /* Only completion processing finalizes the pending state. */
                    return;
                }
                self.set_status(RequestStatus::Aborted);
                let completion_handler = inner.completion_handler.take();
                inner.processing_handler = None;
                inner.cancellation_handler = None;
                self.done_cv.notify_all();
                drop(inner);
                /* Aborted requests still deliver their terminal callback:
                 * the caller observes exactly one completion whatever the
                 * path. The handler runs outside the lock; its result slot
                 * still holds whatever the operation managed to record. */
                if let Some(completion_handler) = completion_handler {
                    completion_handler();
                }
                return;
            }
            _ => {}
        }
        if process_request {
            let status = self.status();
            if status != RequestStatus::Pending && status != RequestStatus::CancellationPending {
                fatal_internal!(
                    "attempted to process request in invalid state {:?}",
                    status
                );
            }
            let handler = match inner.processing_handler.take() {
                Some(handler) => handler,
                None => fatal_internal!("processing handler not set"),
            };
            if status == RequestStatus::Pending {
                self.set_status(RequestStatus::Processing);
            } else {
                self.set_status(RequestStatus::Canceling);
            }
            self.done_cv.notify_all();
            drop(inner);
            handler();
        } else {
            if !self.status().is_result() {
                fatal_internal!(
                    "attempted to process completion notification in state {:?}",
                    self.status()
                );
            }
            if inner.completion_handler.is_some() {
                let handler = inner.completion_handler.take().unwrap();
                let context = inner.completion_context.take();
                drop(inner);
                handler();
                let mut inner = self.inner.lock().unwrap();
                self.completion_delivered.store(true, Ordering::SeqCst);
                /* Wake operation waiters blocked on the context. */
                if let Some(context) = &context {
                    context.waiter().notify();
                }
                self.done_cv.notify_all();
                inner.processing_handler = None;
                inner.cancellation_handler = None;
                let done_handler = inner.done_handler.take();
                drop(inner);
                if let Some(done_handler) = done_handler {
                    done_handler();
                }
            } else {
                let done_handler = inner.done_handler.take();
                drop(inner);
                if let Some(done_handler) = done_handler {
                    done_handler();
                }
            }
        }
    }

    /// Complete the request with the Ok result code.
    pub fn complete(&self) {
        self.complete_with(RequestStatus::Ok);
    }

    /// Complete the request processing. The request is submitted to the
    /// associated completion context with the specified result code, or the
    /// done state is reached immediately when no context is attached.
    pub fn complete_with(&self, status: RequestStatus) {
        let mut inner = self.inner.lock().unwrap();
        let current = self.status();
        if current == RequestStatus::Aborted || current == RequestStatus::AbortPending {
            /* Asynchronously aborted by a third party, nothing to deliver. */
            return;
        }
        if current != RequestStatus::Processing && current != RequestStatus::Canceling {
            fatal_internal!("request completed in invalid state {:?}", current);
        }
        if self.completion_processed.load(Ordering::SeqCst) {
            fatal_internal!("request is already completed");
        }
        if !status.is_result() {
            fatal_internal!("disallowed completion status {:?}", status);
        }
        self.set_status(status);
        inner.cancellation_handler = None;
        self.completion_processed.store(true, Ordering::SeqCst);
        self.done_cv.notify_all();
        if let Some(context) = inner.completion_context.clone() {
            drop(inner);
            context.submit(self.shared());
        } else {
            /* No notification requested. */
            self.completion_delivered.store(true, Ordering::SeqCst);
            let done_handler = inner.done_handler.take();
            inner.processing_handler = None;
            drop(inner);
            if let Some(done_handler) = done_handler {
                done_handler();
            }
        }
    }

    /// Request cooperative cancellation. Does nothing once the request is
    /// completed or aborted; the effect on an in-flight operation is defined
    /// by the specific processor.
    pub fn cancel(&self) {
        let mut inner = self.inner.lock().unwrap();
        match self.status() {
            RequestStatus::Pending => {
                /* Not yet taken from the input queue, just mark. */
                self.set_status(RequestStatus::CancellationPending);
            }
            RequestStatus::Processing => {
                /* It is up to the processor to take action if possible. */
                if let Some(handler) = inner.cancellation_handler.take() {
                    drop(inner);
                    handler();
                }
            }
            _ => {}
        }
    }

    /// Remove the request's interest without waiting for the native
    /// operation: used during forced teardown. The completion handler, if
    /// any, is released in the completion context (AbortPending round trip);
    /// the done handler fires exactly once either way.
    pub fn abort(&self) {
        let mut inner = self.inner.lock().unwrap();
        let delivering_started = self.completion_processed.load(Ordering::SeqCst)
            && inner.completion_handler.is_none();
        if delivering_started || self.is_done() {
            return;
        }

        let prior = self.status();
        let mut submit_needed = false;
        if inner.completion_handler.is_some() {
            /* Completion handler release must happen in the completion
             * context. The request may already be queued there. */
            self.set_status(RequestStatus::AbortPending);
            if !self.completion_processed.load(Ordering::SeqCst) {
                /* Not yet submitted to the completion context and no one
                 * else will do it now, because of the status. */
                submit_needed = true;
            }
        } else {
            self.set_status(RequestStatus::Aborted);
        }

        if prior == RequestStatus::Processing {
            if let Some(handler) = inner.cancellation_handler.take() {
                drop(inner);
                handler();
                inner = self.inner.lock().unwrap();
            }
        }

        /* Break possible cyclic references. */
        inner.processing_handler = None;
        inner.cancellation_handler = None;
        let context = inner.completion_context.take();
        let done_handler = inner.done_handler.take();
        drop(inner);

        if let Some(context) = &context {
            context.waiter().notify();
        }
        self.done_cv.notify_all();
        if let Some(done_handler) = done_handler {
            done_handler();
        }
        if submit_needed {
            context
                .expect("abort pending requires completion context")
                .submit(self.shared());
        }
    }

    /// Wait for the request to be fully processed.
    ///
    /// When `process_ctx` is set and a completion context is attached, the
    /// context's queue is pumped from the calling thread while waiting. This
    /// is mandatory for contexts which are normally processed in the calling
    /// thread (temporal contexts), and protects against self-deadlock when
    /// the caller is the thread responsible for the completion.
    ///
    /// Returns true when done, false when the timeout expired first.
    pub fn wait_done(&self, process_ctx: bool, timeout: Option<Duration>) -> bool {
        if self.is_done() {
            return true;
        }
        let context = self.completion_context();
        if !process_ctx || context.is_none() {
            let mut inner = self.inner.lock().unwrap();
            match timeout {
                Some(timeout) => {
                    let deadline = Instant::now() + timeout;
                    while !self.is_done() {
                        let now = Instant::now();
                        if now >= deadline {
                            break;
                        }
                        let (guard, _) = self
                            .done_cv
                            .wait_timeout(inner, deadline - now)
                            .unwrap();
                        inner = guard;
                    }
                }
                None => {
                    while !self.is_done() {
                        inner = self.done_cv.wait(inner).unwrap();
                    }
                }
            }
            return self.is_done();
        }
        let context = context.unwrap();
        let waiter = context.waiter();
        waiter.wait_and_process(
            &[context.clone()],
            timeout,
            0,
            Some(&mut || self.is_done()),
        );
        self.is_done()
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("status", &self.status())
            .field("done", &self.is_done())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{Phase, RequestContainer};
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_status_conversions() {
        for v in 0..8u8 {
            let status = RequestStatus::from(v);
            assert_eq!(status as u8, v);
        }
        assert!(RequestStatus::Ok.is_result());
        assert!(RequestStatus::Canceled.is_result());
        assert!(!RequestStatus::Processing.is_result());
    }

    #[test]
    fn test_handler_setters_require_pending() {
        let request = Request::new();
        let r = request.clone();
        request
            .set_processing_handler(Box::new(move || r.complete()))
            .unwrap();
        request.process(true);
        assert!(request.is_completed());
        assert_eq!(
            request.set_processing_handler(Box::new(|| {})),
            Err(CoreError::InvalidState)
        );
        assert_eq!(
            request.set_cancellation_handler(Box::new(|| {})),
            Err(CoreError::InvalidState)
        );
    }

    #[test]
    fn test_complete_without_context_is_done() {
        let request = Request::new();
        let done = Arc::new(AtomicUsize::new(0));
        let d = done.clone();
        request.set_done_handler(Some(Box::new(move || {
            d.fetch_add(1, Ordering::SeqCst);
        })));
        let r = request.clone();
        request
            .set_processing_handler(Box::new(move || r.complete()))
            .unwrap();
        request.process(true);
        assert!(request.is_done());
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_completion_through_context() {
        let ctx = RequestContainer::new("test completion", Phase::Completion);
        ctx.enable().unwrap();
        let completed = Arc::new(AtomicUsize::new(0));

        let request = Request::new();
        let c = completed.clone();
        request
            .set_completion_handler(ctx.clone(), Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        let r = request.clone();
        request
            .set_processing_handler(Box::new(move || r.complete()))
            .unwrap();

        request.process(true);
        assert!(request.is_completed());
        assert!(!request.is_done());
        assert_eq!(ctx.process_requests(0), 1);
        assert!(request.is_done());
        assert_eq!(completed.load(Ordering::SeqCst), 1);
        ctx.disable();
    }

    #[test]
    fn test_cancel_pending_then_process() {
        let request = Request::new();
        let r = request.clone();
        request
            .set_processing_handler(Box::new(move || {
                /* A processor observing Canceling normally completes with
                 * the Canceled result code. */
                assert_eq!(r.status(), RequestStatus::Canceling);
                r.complete_with(RequestStatus::Canceled);
            }))
            .unwrap();
        request.cancel();
        assert_eq!(request.status(), RequestStatus::CancellationPending);
        request.process(true);
        assert_eq!(request.status(), RequestStatus::Canceled);
    }

    #[test]
    fn test_cancellation_handler_fires_while_processing() {
        let request = Request::new();
        let canceled = Arc::new(AtomicUsize::new(0));
        let c = canceled.clone();
        request
            .set_cancellation_handler(Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        request
            .set_processing_handler(Box::new(|| { /* stays in Processing */ }))
            .unwrap();
        request.process(true);
        assert!(request.is_processing());
        request.cancel();
        assert_eq!(canceled.load(Ordering::SeqCst), 1);
        /* Second cancel has nothing left to invoke. */
        request.cancel();
        assert_eq!(canceled.load(Ordering::SeqCst), 1);
        request.complete();
    }

    #[test]
    fn test_abort_delivers_completion_in_context() {
        let ctx = RequestContainer::new("abort ctx", Phase::Completion);
        ctx.enable().unwrap();
        let completed = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        let request = Request::new();
        let c = completed.clone();
        request
            .set_completion_handler(ctx.clone(), Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        request.set_processing_handler(Box::new(|| {})).unwrap();
        let d = done.clone();
        request.set_done_handler(Some(Box::new(move || {
            d.fetch_add(1, Ordering::SeqCst);
        })));

        request.abort();
        assert_eq!(request.status(), RequestStatus::AbortPending);
        assert_eq!(done.load(Ordering::SeqCst), 1);
        /* The abort placed the request into the completion context; the
         * terminal callback is delivered there. */
        assert_eq!(ctx.process_requests(0), 1);
        assert_eq!(request.status(), RequestStatus::Aborted);
        assert_eq!(completed.load(Ordering::SeqCst), 1);
        /* Finalization is one-shot. */
        request.process(false);
        assert_eq!(completed.load(Ordering::SeqCst), 1);
        ctx.disable();
    }

    #[test]
    fn test_abort_after_done_is_noop() {
        let request = Request::new();
        let r = request.clone();
        request
            .set_processing_handler(Box::new(move || r.complete()))
            .unwrap();
        request.process(true);
        assert!(request.is_done());
        request.abort();
        assert_eq!(request.status(), RequestStatus::Ok);
    }

    #[test]
    fn test_done_handler_immediate_when_already_done() {
        let request = Request::new();
        let r = request.clone();
        request
            .set_processing_handler(Box::new(move || r.complete()))
            .unwrap();
        request.process(true);
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        request.set_done_handler(Some(Box::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        })));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wait_done_timeout() {
        let request = Request::new();
        let start = Instant::now();
        assert!(!request.wait_done(false, Some(Duration::from_millis(50))));
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_wait_done_cross_thread() {
        let request = Request::new();
        let r = request.clone();
        request
            .set_processing_handler(Box::new(move || r.complete()))
            .unwrap();
        let r = request.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            r.process(true);
        });
        assert!(request.wait_done(false, Some(Duration::from_secs(5))));
        handle.join().unwrap();
    }
}
