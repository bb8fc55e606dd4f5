//! # vlink-core — asynchronous request/completion engine
//!
//! Producer/consumer request pipeline for vehicle integration services:
//! requests with explicit lifecycle and exactly-once completion, FIFO
//! containers with enable/disable semantics, shared wake primitives
//! (condition-variable and self-pipe backed), dedicated worker threads,
//! caller-facing operation waiters with cancellation and timeout, and a
//! request-driven timer processor.
//!
//! ## Pipeline shape
//!
//! ```text
//!  caller ──► Request ──► processor container ──► worker thread
//!     │                                               │ (operation)
//!     │                                               ▼
//!     │◄── OperationWaiter          completion container ──► user callback
//! ```
//!
//! A caller constructs a request, submits it to a processor container and
//! keeps the returned operation waiter. A worker wakes through the shared
//! waiter, runs the processing phase, and completion is delivered through
//! the completion container: exactly once, whether the request completes,
//! is canceled, aborted or times out.

pub mod container;
pub mod error;
pub mod op_waiter;
pub mod piped_waiter;
pub mod request;
pub mod singleton;
pub mod timer;
pub mod vprint;
pub mod waiter;
pub mod worker;

pub use container::{Phase, RequestContainer};
pub use error::{CoreError, CoreResult};
pub use op_waiter::{OperationWaiter, TimeoutHandler};
pub use piped_waiter::PipedRequestWaiter;
pub use request::{Handler, Request, RequestStatus};
pub use singleton::Singleton;
pub use timer::{Timer, TimerHandler, TimerProcessor};
pub use waiter::{RequestWaiter, Waiter};
pub use worker::RequestWorker;
