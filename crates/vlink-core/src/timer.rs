//! Timer processor — asynchronous timers built on the request pipeline.
//!
//! The processor is itself a request processor with a dedicated thread: a
//! timer is a request whose processing phase (on the timer thread) files it
//! into a deadline tree, and whose completion phase (in the user-supplied
//! container) runs the user handler. The thread sleeps until the nearest
//! deadline using the container waiter, so timer submissions and expirations
//! share one wake mechanism.
//!
//! The process-wide instance is weak-cached: it is created on first use and
//! torn down when the last holder releases it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::container::{Phase, RequestContainer};
use crate::error::{CoreError, CoreResult};
use crate::request::Request;
use crate::singleton::Singleton;
use crate::waiter::Waiter;
use crate::vwarn;

/// Timer handler. Returning `true` re-schedules the next invocation after
/// the initial interval; `false` stops the timer.
pub type TimerHandler = Box<dyn FnMut() -> bool + Send>;

type SharedHandler = Arc<Mutex<TimerHandler>>;

/// Tick type for indexing the deadline tree, milliseconds from processor
/// start.
type Tick = i64;

static SINGLETON: Singleton<TimerProcessor> = Singleton::new();

struct TimerState {
    /// Keeps the processor alive while the timer is scheduled.
    processor: Option<Arc<TimerProcessor>>,
    running: bool,
    interval: Duration,
    fire_time: Instant,
    /// Request for the pending firing cycle.
    request: Option<Arc<Request>>,
}

/// A scheduled timer. Firings continue while the handler returns true;
/// cancel() stops them at any point.
pub struct Timer {
    state: Mutex<TimerState>,
}

impl Timer {
    fn new(processor: Arc<TimerProcessor>, interval: Duration) -> Arc<Timer> {
        Arc::new(Timer {
            state: Mutex::new(TimerState {
                processor: Some(processor),
                running: true,
                interval,
                fire_time: Instant::now() + interval,
                request: None,
            }),
        })
    }

    /// Check if the timer will still produce handler invocations.
    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().running
    }

    /// Time of the next firing.
    pub fn fire_time(&self) -> Instant {
        self.state.lock().unwrap().fire_time
    }

    /// Cancel the timer. Does nothing if it is no longer running.
    pub fn cancel(self: &Arc<Self>) {
        let state = self.state.lock().unwrap();
        if !state.running {
            return;
        }
        let processor = state.processor.clone();
        drop(state);
        if let Some(processor) = processor {
            processor.cancel_timer(self);
        }
    }

    /// Complete the pending request so the handler runs in its container.
    fn fire(&self) {
        let state = self.state.lock().unwrap();
        if !state.running {
            /* Canceled while still filed in the tree. */
            return;
        }
        let request = state.request.clone();
        drop(state);
        if let Some(request) = request {
            request.complete();
        }
    }

    /// Advance the deadline by one interval, without accumulating missed
    /// firings.
    fn advance(&self) {
        let mut state = self.state.lock().unwrap();
        let interval = state.interval;
        state.fire_time += interval;
        let now = Instant::now();
        if state.fire_time < now {
            state.fire_time = now;
        }
    }

    /// Attach the request for the next firing cycle, aborting a previous
    /// one if any.
    fn set_request(&self, request: Arc<Request>) {
        let mut state = self.state.lock().unwrap();
        let old = state.request.replace(request);
        drop(state);
        if let Some(old) = old {
            old.abort();
        }
    }

    /// Stop the timer and release its request and processor reference.
    fn destroy(&self, cancel: bool) {
        let mut state = self.state.lock().unwrap();
        if !state.running {
            return;
        }
        state.running = false;
        let request = state.request.take();
        let processor = state.processor.take();
        drop(state);
        if let Some(request) = request {
            if !cancel || !request.is_completion_delivered() {
                request.abort();
            }
        }
        drop(processor);
    }
}

/// Shared state between the processor handle, the timer thread and the
/// request handlers.
struct TimerShared {
    container: Arc<RequestContainer>,
    tree: Mutex<BTreeMap<Tick, Vec<Arc<Timer>>>>,
    epoch: Instant,
}

impl TimerShared {
    fn ticks(&self, time: Instant) -> Tick {
        time.saturating_duration_since(self.epoch).as_millis() as Tick
    }

    /// Create and submit the request driving one firing cycle.
    fn create_request(
        self: &Arc<Self>,
        timer: &Arc<Timer>,
        handler: &SharedHandler,
        container: &Arc<RequestContainer>,
    ) {
        let request = Request::new();
        let shared = self.clone();
        let t = timer.clone();
        request
            .set_processing_handler(Box::new(move || shared.process_timer(&t)))
            .expect("fresh request");
        let shared = self.clone();
        let t = timer.clone();
        let h = handler.clone();
        let c = container.clone();
        request
            .set_completion_handler(
                container.clone(),
                Box::new(move || shared.timer_fired(&t, &h, &c)),
            )
            .expect("fresh request");
        timer.set_request(request.clone());
        self.container.submit(request);
    }

    /// Processing phase, on the timer thread: file the timer into the tree
    /// or fire it right away if the deadline already passed.
    fn process_timer(&self, timer: &Arc<Timer>) {
        if !timer.is_running() {
            return;
        }
        if timer.fire_time() <= Instant::now() {
            timer.fire();
            return;
        }
        let mut tree = self.tree.lock().unwrap();
        let tick = self.ticks(timer.fire_time());
        tree.entry(tick).or_default().push(timer.clone());
    }

    /// Completion phase, in the user container: run the handler and either
    /// re-arm or tear the timer down.
    fn timer_fired(
        self: &Arc<Self>,
        timer: &Arc<Timer>,
        handler: &SharedHandler,
        container: &Arc<RequestContainer>,
    ) {
        if !timer.is_running() {
            /* Canceled while the firing was already queued; the handler
             * must not run anymore. */
            return;
        }
        let again = (handler.lock().unwrap())();
        if again && timer.is_running() {
            timer.advance();
            self.create_request(timer, handler, container);
        } else {
            timer.destroy(false);
        }
    }

    /// Remove the timer from the tree and stop it.
    fn cancel_timer(&self, timer: &Arc<Timer>) {
        {
            let mut tree = self.tree.lock().unwrap();
            let tick = self.ticks(timer.fire_time());
            if let Some(slot) = tree.get_mut(&tick) {
                slot.retain(|t| !Arc::ptr_eq(t, timer));
                if slot.is_empty() {
                    tree.remove(&tick);
                }
            }
        }
        timer.destroy(true);
    }

    /// Timer thread: fire expired slots, then sleep until the nearest
    /// deadline or the next submission.
    fn processing_loop(&self) {
        while self.container.is_enabled() {
            let mut due: Vec<Arc<Timer>> = Vec::new();
            let mut delay = None;
            {
                let mut tree = self.tree.lock().unwrap();
                let now = self.ticks(Instant::now());
                loop {
                    match tree.first_key_value().map(|(tick, _)| *tick) {
                        None => break,
                        Some(tick) if tick <= now => {
                            let (_, timers) = tree.pop_first().unwrap();
                            due.extend(timers);
                        }
                        Some(tick) => {
                            delay = Some(Duration::from_millis((tick - now) as u64));
                            break;
                        }
                    }
                }
            }
            if !due.is_empty() {
                for timer in due {
                    timer.fire();
                }
                continue;
            }
            self.container
                .waiter()
                .wait_and_process(&[self.container.clone()], delay, 0, None);
        }
    }
}

/// Timer processor handle. Owns the dedicated thread; disabling (or
/// dropping the last handle) stops the thread and cancels remaining
/// timers.
pub struct TimerProcessor {
    shared: Arc<TimerShared>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl TimerProcessor {
    /// Get the process-wide instance, creating and enabling it on demand.
    /// The instance lives until the last holder (including scheduled
    /// timers) releases it.
    pub fn instance() -> Arc<TimerProcessor> {
        SINGLETON.get_or_create(|| {
            let processor = TimerProcessor::new();
            processor.enable().expect("fresh timer processor");
            processor
        })
    }

    /// Create a detached (non-singleton) processor. It must be enabled
    /// before use.
    pub fn new() -> Arc<TimerProcessor> {
        Arc::new(TimerProcessor {
            shared: Arc::new(TimerShared {
                container: RequestContainer::new("timer processor", Phase::Processor),
                tree: Mutex::new(BTreeMap::new()),
                epoch: Instant::now(),
            }),
            thread: Mutex::new(None),
        })
    }

    /// Start the timer thread.
    pub fn enable(self: &Arc<Self>) -> CoreResult<()> {
        self.shared.container.enable()?;
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("vlink-timer".to_owned())
            .spawn(move || shared.processing_loop())
            .expect("failed to spawn timer thread");
        *self.thread.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Stop the timer thread and cancel all remaining timers. Users should
    /// cancel their own timers first; leftovers are reported. Idempotent.
    pub fn disable(&self) {
        if !self.shared.container.begin_disable() {
            return;
        }
        self.shared.container.set_disabled();
        let handle = self.thread.lock().unwrap().take();
        if let Some(handle) = handle {
            /* The last reference can be dropped from a handler running on
             * the timer thread itself; the loop exits on its own then. */
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        loop {
            let timer = {
                let tree = self.shared.tree.lock().unwrap();
                tree.values().next().and_then(|slot| slot.first().cloned())
            };
            match timer {
                Some(timer) => {
                    vwarn!("timer still scheduled at processor teardown");
                    self.shared.cancel_timer(&timer);
                }
                None => break,
            }
        }
        self.shared.container.finish_disable();
    }

    /// Create and schedule a timer. The first firing happens `interval`
    /// after this call; the handler decides about repetition by its return
    /// value. The handler runs in `container`.
    pub fn create_timer(
        self: &Arc<Self>,
        interval: Duration,
        handler: TimerHandler,
        container: Arc<RequestContainer>,
    ) -> CoreResult<Arc<Timer>> {
        if !self.shared.container.is_enabled() {
            return Err(CoreError::InvalidState);
        }
        let timer = Timer::new(self.clone(), interval);
        let handler: SharedHandler = Arc::new(Mutex::new(handler));
        self.shared.create_request(&timer, &handler, &container);
        Ok(timer)
    }

    /// Cancel the specified timer in case it is running.
    pub fn cancel_timer(&self, timer: &Arc<Timer>) {
        self.shared.cancel_timer(timer);
    }
}

impl Drop for TimerProcessor {
    fn drop(&mut self) {
        self.disable();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pump_until<F: Fn() -> bool>(ctx: &Arc<RequestContainer>, timeout: Duration, cond: F) {
        let deadline = Instant::now() + timeout;
        while !cond() && Instant::now() < deadline {
            ctx.waiter().wait_and_process(
                &[ctx.clone()],
                Some(Duration::from_millis(10)),
                0,
                None,
            );
        }
    }

    fn test_ctx(name: &str) -> Arc<RequestContainer> {
        let ctx = RequestContainer::new(name, Phase::Completion);
        ctx.enable().unwrap();
        ctx
    }

    #[test]
    fn test_one_shot_fires_once() {
        let processor = TimerProcessor::new();
        processor.enable().unwrap();
        let ctx = test_ctx("one-shot");
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let _timer = processor
            .create_timer(
                Duration::from_millis(20),
                Box::new(move || {
                    f.fetch_add(1, Ordering::SeqCst);
                    false
                }),
                ctx.clone(),
            )
            .unwrap();
        pump_until(&ctx, Duration::from_secs(5), || {
            fired.load(Ordering::SeqCst) >= 1
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        /* Give a spurious repeat a chance to show up. */
        pump_until(&ctx, Duration::from_millis(60), || false);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        processor.disable();
        ctx.disable();
    }

    #[test]
    fn test_periodic_reschedules() {
        let processor = TimerProcessor::new();
        processor.enable().unwrap();
        let ctx = test_ctx("periodic");
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let _timer = processor
            .create_timer(
                Duration::from_millis(10),
                Box::new(move || f.fetch_add(1, Ordering::SeqCst) < 2),
                ctx.clone(),
            )
            .unwrap();
        pump_until(&ctx, Duration::from_secs(5), || {
            fired.load(Ordering::SeqCst) >= 3
        });
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        processor.disable();
        ctx.disable();
    }

    #[test]
    fn test_cancel_before_fire() {
        let processor = TimerProcessor::new();
        processor.enable().unwrap();
        let ctx = test_ctx("cancel");
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let timer = processor
            .create_timer(
                Duration::from_millis(200),
                Box::new(move || {
                    f.fetch_add(1, Ordering::SeqCst);
                    false
                }),
                ctx.clone(),
            )
            .unwrap();
        timer.cancel();
        assert!(!timer.is_running());
        pump_until(&ctx, Duration::from_millis(300), || false);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        /* Second cancel is a no-op. */
        timer.cancel();
        processor.disable();
        ctx.disable();
    }

    #[test]
    fn test_create_on_disabled_processor_fails() {
        let processor = TimerProcessor::new();
        let ctx = test_ctx("disabled");
        let result = processor.create_timer(
            Duration::from_millis(10),
            Box::new(|| false),
            ctx.clone(),
        );
        assert_eq!(result.err(), Some(CoreError::InvalidState));
        ctx.disable();
    }

    #[test]
    fn test_singleton_weak_cache() {
        let a = TimerProcessor::instance();
        let b = TimerProcessor::instance();
        assert!(Arc::ptr_eq(&a, &b));
        drop(a);
        drop(b);
        /* Recreated on demand after the last release. */
        let c = TimerProcessor::instance();
        let ctx = test_ctx("singleton");
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let _timer = c
            .create_timer(
                Duration::from_millis(10),
                Box::new(move || {
                    f.fetch_add(1, Ordering::SeqCst);
                    false
                }),
                ctx.clone(),
            )
            .unwrap();
        pump_until(&ctx, Duration::from_secs(5), || {
            fired.load(Ordering::SeqCst) >= 1
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        ctx.disable();
    }
}
