//! Waiters — the wake primitive shared by one or more containers.
//!
//! A waiter parks a consumer until work is submitted. Notification is
//! edge-triggered: any number of notify() calls before the next wait()
//! collapse into a single wake-up, and a successful wait() consumes the
//! event so the following wait() blocks again.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::container::RequestContainer;

/// Wake primitive for request containers.
///
/// **Contract:**
/// - `notify()` is safe to call concurrently from any thread and never
///   blocks.
/// - At least one `wait()` following a `notify()` observes the event;
///   multiple notifications coalesce.
/// - `wait()` consumes the event.
pub trait Waiter: Send + Sync {
    /// Signal that work is available.
    fn notify(&self);

    /// Block until notified or the timeout expires. `None` waits
    /// indefinitely. Returns true when the event was observed, false on
    /// timeout.
    fn wait(&self, timeout: Option<Duration>) -> bool;

    /// Wait for request submission and process queued work.
    ///
    /// Drains the given containers in rounds (processing may generate new
    /// submissions for the same containers) until the predicate holds or
    /// the timeout expires, parking on the waiter in between. The default
    /// predicate is satisfied once anything was processed or any container
    /// is disabled. `limit` bounds the number of requests processed per
    /// call (0 = no limit).
    ///
    /// Containers are drained in the order given; only the FIFO order
    /// within each container is guaranteed.
    ///
    /// Returns the number of requests processed.
    fn wait_and_process(
        &self,
        containers: &[Arc<RequestContainer>],
        timeout: Option<Duration>,
        limit: usize,
        mut predicate: Option<&mut dyn FnMut() -> bool>,
    ) -> usize {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut total = 0;
        loop {
            let mut processed_now = 0;
            let mut disabled = false;
            loop {
                let mut current = 0;
                for container in containers {
                    if !container.is_enabled() {
                        disabled = true;
                        continue;
                    }
                    let remaining = if limit == 0 {
                        0
                    } else {
                        let used = total + processed_now + current;
                        if used >= limit {
                            break;
                        }
                        limit - used
                    };
                    current += container.process_requests(remaining);
                }
                processed_now += current;
                if current == 0 || (limit != 0 && total + processed_now >= limit) {
                    break;
                }
            }
            total += processed_now;

            let satisfied = match predicate.as_mut() {
                Some(p) => p(),
                None => processed_now > 0 || disabled,
            };
            if satisfied || (limit != 0 && total >= limit) {
                return total;
            }

            let wait_timeout = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return total;
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            if !self.wait(wait_timeout) {
                /* Timed out: one final drain so work submitted right at the
                 * deadline is not stranded until the next call. */
                for container in containers {
                    if container.is_enabled() {
                        let remaining = if limit == 0 { 0 } else { limit - total };
                        total += container.process_requests(remaining);
                    }
                }
                return total;
            }
        }
    }
}

/// Default waiter: mutex + condition variable + edge-triggered flag.
pub struct RequestWaiter {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl RequestWaiter {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(false),
            cond: Condvar::new(),
        }
    }
}

impl Default for RequestWaiter {
    fn default() -> Self {
        Self::new()
    }
}

impl Waiter for RequestWaiter {
    fn notify(&self) {
        let mut pending = self.pending.lock().unwrap();
        *pending = true;
        self.cond.notify_all();
    }

    fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut pending = self.pending.lock().unwrap();
        match timeout {
            None => {
                while !*pending {
                    pending = self.cond.wait(pending).unwrap();
                }
                *pending = false;
                true
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while !*pending {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (guard, _) = self.cond.wait_timeout(pending, deadline - now).unwrap();
                    pending = guard;
                }
                *pending = false;
                true
            }
        }
    }
}
