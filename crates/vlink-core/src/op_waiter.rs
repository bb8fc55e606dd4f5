//! Operation waiter — caller-facing handle for a submitted asynchronous
//! operation.
//!
//! Every asynchronous call returns one of these. The caller may ignore it,
//! block on it, cancel or abort the operation, or arm a timeout. When the
//! operation was bound to a temporal completion context (the synchronous
//! call pattern), dropping the waiter blocks until completion so the user
//! callback can never fire into a destroyed stack frame.

use std::sync::Arc;
use std::time::Duration;

use crate::container::RequestContainer;
use crate::error::{CoreError, CoreResult};
use crate::request::Request;
use crate::timer::TimerProcessor;

/// Handler invoked when an armed timeout fires before the operation
/// completes. Receives a fresh waiter for the same operation.
pub type TimeoutHandler = Box<dyn FnOnce(OperationWaiter) + Send>;

/// Handle for a submitted asynchronous operation.
#[must_use = "dropping the waiter of a temporal-context operation blocks until completion"]
pub struct OperationWaiter {
    request: Option<Arc<Request>>,
    timeout_armed: bool,
}

impl OperationWaiter {
    pub fn new(request: Arc<Request>) -> Self {
        Self {
            request: Some(request),
            timeout_armed: false,
        }
    }

    /// Create a waiter which is already done (for operations rejected
    /// before submission).
    pub fn empty() -> Self {
        Self {
            request: None,
            timeout_armed: false,
        }
    }

    /// Check whether the operation reached its terminal state.
    pub fn is_done(&self) -> bool {
        match &self.request {
            Some(request) => request.is_done(),
            None => true,
        }
    }

    /// Wait for the operation to complete.
    ///
    /// `process_ctx` pumps the operation's completion context from the
    /// calling thread; this is required for temporal contexts and protects
    /// against self-deadlock when the caller owns the completing thread.
    /// Returns true when done, false when the timeout expired first.
    pub fn wait(&self, process_ctx: bool, timeout: Option<Duration>) -> bool {
        match &self.request {
            Some(request) => request.wait_done(process_ctx, timeout),
            None => true,
        }
    }

    /// Request cooperative cancellation. No effect once the operation
    /// completed or was aborted.
    pub fn cancel(&self) {
        if let Some(request) = &self.request {
            request.cancel();
        }
    }

    /// Force teardown of the operation's interest: the completion handler
    /// is released without being invoked and the native operation is not
    /// awaited. Always safe during shutdown.
    pub fn abort(&self) {
        if let Some(request) = &self.request {
            request.abort();
        }
    }

    /// Release interest in the operation without waiting, even for
    /// temporal contexts. The operation itself continues. A detached
    /// temporal-context completion stays queued until the process exits,
    /// since nothing pumps that context anymore; prefer wait() or drop.
    pub fn detach(&mut self) {
        self.request = None;
    }

    /// Arm a timeout for the operation.
    ///
    /// When the timer fires before the operation completes, the request is
    /// marked timed-out, optionally canceled (`cancel_operation`), and
    /// `handler` is invoked with a fresh waiter. When the operation
    /// completes first, its done handler cancels the timer: whichever side
    /// finishes first disarms the other.
    ///
    /// The timeout handler runs in `ctx`, or in the operation's own
    /// completion context when `ctx` is None.
    ///
    /// Arming a second timeout on the same waiter is rejected. Arming a
    /// timeout on an operation which already completed (its completion
    /// context is gone) is a no-op.
    pub fn timeout(
        &mut self,
        timeout: Duration,
        handler: Option<TimeoutHandler>,
        cancel_operation: bool,
        ctx: Option<Arc<RequestContainer>>,
    ) -> CoreResult<()> {
        let request = match &self.request {
            Some(request) => request.clone(),
            None => return Ok(()),
        };
        if self.timeout_armed {
            return Err(CoreError::TimeoutAlreadyArmed);
        }
        let completion_ctx = match ctx.or_else(|| request.completion_context()) {
            Some(ctx) => ctx,
            /* No completion context left: the request has already been
             * completed, nothing to race against. */
            None => return Ok(()),
        };

        let timer_request = request.clone();
        let mut handler = handler;
        let timer = TimerProcessor::instance().create_timer(
            timeout,
            Box::new(move || {
                /* The operation side must not cancel the timer anymore:
                 * this side won the race. */
                timer_request.set_done_handler(None);
                timer_request.mark_timed_out();
                if timer_request.is_completed() || timer_request.is_aborted() {
                    return false;
                }
                if cancel_operation {
                    timer_request.cancel();
                }
                if let Some(handler) = handler.take() {
                    handler(OperationWaiter::new(timer_request.clone()));
                }
                false
            }),
            completion_ctx,
        )?;
        let t = timer.clone();
        request.set_done_handler(Some(Box::new(move || t.cancel())));
        self.timeout_armed = true;
        Ok(())
    }
}

impl From<Arc<Request>> for OperationWaiter {
    fn from(request: Arc<Request>) -> Self {
        Self::new(request)
    }
}

impl Drop for OperationWaiter {
    fn drop(&mut self) {
        let request = match self.request.take() {
            Some(request) => request,
            None => return,
        };
        /* Operations in temporal contexts are always synchronized: no
         * dedicated thread pumps the context, and the callback may borrow
         * the caller's frame. */
        if let Some(ctx) = request.completion_context() {
            if ctx.is_temporal() {
                request.wait_done(true, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{Phase, RequestContainer};
    use crate::request::RequestStatus;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Instant;

    /// Request wired to a completion context, completing when asked.
    fn make_op(ctx: &Arc<RequestContainer>, completions: &Arc<AtomicUsize>) -> Arc<Request> {
        let request = Request::new();
        let c = completions.clone();
        request
            .set_completion_handler(ctx.clone(), Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        request
            .set_processing_handler(Box::new(|| { /* completes later */ }))
            .unwrap();
        request
    }

    #[test]
    fn test_wait_returns_after_completion() {
        let ctx = RequestContainer::new("wait", Phase::Completion);
        ctx.enable().unwrap();
        let completions = Arc::new(AtomicUsize::new(0));
        let request = make_op(&ctx, &completions);
        request.process(true);

        let waiter = OperationWaiter::new(request.clone());
        let r = request.clone();
        let c = ctx.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            r.complete();
            c.process_requests(0);
        });
        assert!(waiter.wait(false, Some(Duration::from_secs(5))));
        handle.join().unwrap();
        assert_eq!(completions.load(Ordering::SeqCst), 1);
        waiter.cancel();
        drop(waiter);
        ctx.disable();
    }

    #[test]
    fn test_wait_pumps_context() {
        /* With process_ctx the caller's thread delivers the completion. */
        let ctx = RequestContainer::new("pump", Phase::Completion);
        ctx.enable().unwrap();
        let completions = Arc::new(AtomicUsize::new(0));
        let request = make_op(&ctx, &completions);
        request.process(true);
        request.complete();
        assert!(!request.is_done());

        let waiter = OperationWaiter::new(request.clone());
        assert!(waiter.wait(true, Some(Duration::from_secs(5))));
        assert_eq!(completions.load(Ordering::SeqCst), 1);
        drop(waiter);
        ctx.disable();
    }

    #[test]
    fn test_timeout_fires_and_cancels() {
        let ctx = RequestContainer::new("timeout", Phase::Completion);
        ctx.enable().unwrap();
        let completions = Arc::new(AtomicUsize::new(0));
        let request = make_op(&ctx, &completions);
        request.process(true);

        let timed_out = Arc::new(AtomicBool::new(false));
        let t = timed_out.clone();
        let mut waiter = OperationWaiter::new(request.clone());
        waiter
            .timeout(
                Duration::from_millis(30),
                Some(Box::new(move |_w| {
                    t.store(true, Ordering::SeqCst);
                })),
                true,
                Some(ctx.clone()),
            )
            .unwrap();

        /* Pump the context until the timeout handler ran. */
        let deadline = Instant::now() + Duration::from_secs(5);
        while !timed_out.load(Ordering::SeqCst) && Instant::now() < deadline {
            ctx.waiter().wait_and_process(
                &[ctx.clone()],
                Some(Duration::from_millis(10)),
                0,
                None,
            );
        }
        assert!(timed_out.load(Ordering::SeqCst));
        assert!(request.timed_out());

        /* The operation is still processing (no cancellation handler was
         * able to stop it); finish it now. */
        request.complete_with(RequestStatus::Canceled);
        assert!(waiter.wait(true, Some(Duration::from_secs(5))));
        drop(waiter);
        ctx.disable();
    }

    #[test]
    fn test_completion_disarms_timer() {
        let ctx = RequestContainer::new("disarm", Phase::Completion);
        ctx.enable().unwrap();
        let completions = Arc::new(AtomicUsize::new(0));
        let request = make_op(&ctx, &completions);
        request.process(true);

        let timed_out = Arc::new(AtomicBool::new(false));
        let t = timed_out.clone();
        let mut waiter = OperationWaiter::new(request.clone());
        waiter
            .timeout(
                Duration::from_millis(100),
                Some(Box::new(move |_w| {
                    t.store(true, Ordering::SeqCst);
                })),
                true,
                Some(ctx.clone()),
            )
            .unwrap();

        /* Complete well before the timeout. */
        request.complete();
        assert!(waiter.wait(true, Some(Duration::from_secs(5))));
        assert_eq!(completions.load(Ordering::SeqCst), 1);

        /* Wait out the timer interval: the handler must never fire. */
        let deadline = Instant::now() + Duration::from_millis(200);
        while Instant::now() < deadline {
            ctx.waiter().wait_and_process(
                &[ctx.clone()],
                Some(Duration::from_millis(20)),
                0,
                None,
            );
        }
        assert!(!timed_out.load(Ordering::SeqCst));
        assert!(!request.timed_out());
        drop(waiter);
        ctx.disable();
    }

    #[test]
    fn test_double_timeout_rejected() {
        let ctx = RequestContainer::new("double", Phase::Completion);
        ctx.enable().unwrap();
        let completions = Arc::new(AtomicUsize::new(0));
        let request = make_op(&ctx, &completions);
        request.process(true);

        let mut waiter = OperationWaiter::new(request.clone());
        waiter
            .timeout(Duration::from_secs(10), None, true, Some(ctx.clone()))
            .unwrap();
        assert_eq!(
            waiter.timeout(Duration::from_secs(10), None, true, Some(ctx.clone())),
            Err(CoreError::TimeoutAlreadyArmed)
        );

        request.complete();
        assert!(waiter.wait(true, Some(Duration::from_secs(5))));
        drop(waiter);
        ctx.disable();
    }

    #[test]
    fn test_abort_makes_waiter_done() {
        let ctx = RequestContainer::new("abort", Phase::Completion);
        ctx.enable().unwrap();
        let completions = Arc::new(AtomicUsize::new(0));
        let request = make_op(&ctx, &completions);

        let waiter = OperationWaiter::new(request.clone());
        waiter.abort();
        assert!(waiter.is_done());
        /* The terminal callback is still delivered through the context. */
        ctx.process_requests(0);
        assert_eq!(completions.load(Ordering::SeqCst), 1);
        drop(waiter);
        ctx.disable();
    }

    #[test]
    fn test_temporal_drop_blocks_until_done() {
        let ctx = RequestContainer::new_temporal();
        let completions = Arc::new(AtomicUsize::new(0));
        let request = make_op(&ctx, &completions);
        request.process(true);

        let waiter = OperationWaiter::new(request.clone());
        let r = request.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            r.complete();
        });
        /* Drop pumps the temporal context until the completion handler has
         * run in this thread. */
        drop(waiter);
        assert!(request.is_done());
        assert_eq!(completions.load(Ordering::SeqCst), 1);
        handle.join().unwrap();
    }
}
