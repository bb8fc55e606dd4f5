//! Request worker — a dedicated thread draining a fixed set of containers.

use std::sync::{Arc, Mutex};
use std::thread;

use crate::container::{Phase, RequestContainer};
use crate::error::CoreResult;
use crate::vdebug;
use crate::waiter::Waiter;

/// A worker owns one OS thread and repeatedly waits-and-processes a set of
/// containers. The worker has a container of its own (phase Any) which can
/// be used as a completion context, so a processor and its completion
/// handling can share one thread.
///
/// Containers are drained in the order they were handed over; that order is
/// an implementation detail, not a contract. Only the FIFO order within
/// each container is guaranteed.
pub struct RequestWorker {
    /// The worker's own container. Its waiter is the worker's wake source;
    /// all serviced containers are rebound to it.
    context: Arc<RequestContainer>,
    containers: Mutex<Vec<Arc<RequestContainer>>>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl RequestWorker {
    /// Create a worker servicing the given containers. Their waiters are
    /// rebound to the worker's waiter so submissions wake this thread.
    pub fn new(name: &str, containers: Vec<Arc<RequestContainer>>) -> Arc<RequestWorker> {
        let context = RequestContainer::new(name, Phase::Any);
        for container in &containers {
            container.set_waiter(context.waiter());
        }
        Arc::new(RequestWorker {
            context,
            containers: Mutex::new(containers),
            thread: Mutex::new(None),
        })
    }

    /// The worker's own container, usable as a completion context.
    pub fn completion_context(&self) -> Arc<RequestContainer> {
        self.context.clone()
    }

    /// Submit a request to the worker's own container.
    pub fn submit(&self, request: Arc<crate::request::Request>) {
        self.context.submit(request);
    }

    /// Check if the worker is running.
    pub fn is_enabled(&self) -> bool {
        self.context.is_enabled()
    }

    /// Start the worker thread.
    pub fn enable(self: &Arc<Self>) -> CoreResult<()> {
        self.context.enable()?;
        self.containers.lock().unwrap().push(self.context.clone());
        let worker = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("vlink-worker-{}", self.context.name()))
            .spawn(move || worker.processing_loop())
            .expect("failed to spawn worker thread");
        *self.thread.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Stop the worker: mark disabled, join the thread and abort whatever
    /// is still queued in the worker's own container. When this returns, no
    /// request processing is in flight on the worker thread. Idempotent.
    pub fn disable(&self) {
        if !self.context.begin_disable() {
            return;
        }
        self.context.set_disabled();
        let handle = self.thread.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        self.context.finish_disable();
        self.containers.lock().unwrap().clear();
    }

    /// Enable all serviced containers (except the worker's own, which is
    /// controlled by enable()).
    pub fn enable_containers(&self) -> CoreResult<()> {
        let containers = self.containers.lock().unwrap().clone();
        for container in containers {
            if !Arc::ptr_eq(&container, &self.context) {
                container.enable()?;
            }
        }
        Ok(())
    }

    /// Disable all serviced containers (except the worker's own, which is
    /// controlled by disable()).
    pub fn disable_containers(&self) {
        let containers = self.containers.lock().unwrap().clone();
        for container in containers {
            if !Arc::ptr_eq(&container, &self.context) {
                container.disable();
            }
        }
    }

    fn processing_loop(&self) {
        while self.context.is_enabled() {
            let containers = self.containers.lock().unwrap().clone();
            self.context
                .waiter()
                .wait_and_process(&containers, None, 0, None);
        }
        let leftover = self.context.queue_len();
        if leftover > 0 {
            vdebug!(
                "request worker [{}] exits with {} queued requests",
                self.context.name(),
                leftover
            );
        }
    }
}

impl Drop for RequestWorker {
    fn drop(&mut self) {
        /* Should be disabled by the owner; recover here so the thread does
         * not outlive the worker object. */
        if self.context.is_enabled() {
            self.disable();
        }
    }
}
