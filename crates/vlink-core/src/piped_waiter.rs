//! Self-pipe waiter for integration with native I/O readiness loops.
//!
//! Reactors that watch file descriptors cannot park on a condition
//! variable. This waiter is backed by a self-connected socket pair:
//! `notify()` writes one byte (coalesced through an atomic flag so
//! concurrent notifications never overflow the pipe) and `wait()` polls
//! the read end. The read descriptor can be registered in any poll/select
//! set alongside real I/O descriptors.
//!
//! On non-unix targets the condvar waiter is used instead.

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(unix)] {
        pub use unix_impl::PipedRequestWaiter;
    } else {
        pub use crate::waiter::RequestWaiter as PipedRequestWaiter;
    }
}

#[cfg(unix)]
mod unix_impl {
    use std::os::fd::{AsRawFd, OwnedFd, RawFd};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

    use crate::error::{CoreError, CoreResult};
    use crate::waiter::Waiter;
    use crate::vwarn;

    /// Waiter backed by a self-connected non-blocking socket pair.
    pub struct PipedRequestWaiter {
        read_pipe: OwnedFd,
        write_pipe: OwnedFd,
        /// Coalesces notifications: only the first notify() after an ack
        /// writes a byte into the pipe.
        notified: AtomicBool,
    }

    impl PipedRequestWaiter {
        pub fn new() -> CoreResult<Self> {
            let (read_pipe, write_pipe) = socketpair(
                AddressFamily::Unix,
                SockType::Stream,
                None,
                SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            )
            .map_err(|e| CoreError::Os(e as i32))?;
            Ok(Self {
                read_pipe,
                write_pipe,
                notified: AtomicBool::new(false),
            })
        }

        /// The readable event descriptor: becomes ready when notify() is
        /// called. Register it in a reactor poll set to integrate container
        /// wake-ups with native I/O readiness.
        pub fn fd(&self) -> RawFd {
            self.read_pipe.as_raw_fd()
        }

        /// Consume the notification event after a successful readiness
        /// wait. Must be called exactly once per observed readiness; the
        /// reactor calls this when the descriptor from fd() fires.
        pub fn ack(&self) {
            let mut byte = [0u8; 1];
            let rc = unsafe {
                libc::recv(
                    self.read_pipe.as_raw_fd(),
                    byte.as_mut_ptr() as *mut libc::c_void,
                    1,
                    0,
                )
            };
            self.notified.store(false, Ordering::SeqCst);
            if rc < 0 {
                let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
                /* Another thread raced us to the byte; the event was
                 * observed either way. */
                if errno != libc::EAGAIN && errno != libc::EWOULDBLOCK {
                    vwarn!("wait pipe read error: errno {}", errno);
                }
            }
        }
    }

    impl Waiter for PipedRequestWaiter {
        fn notify(&self) {
            if self.notified.swap(true, Ordering::SeqCst) {
                return;
            }
            let rc = unsafe {
                libc::send(
                    self.write_pipe.as_raw_fd(),
                    b"x".as_ptr() as *const libc::c_void,
                    1,
                    0,
                )
            };
            if rc < 0 {
                let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
                /* A full pipe means a wake-up is already pending. */
                if errno != libc::EAGAIN && errno != libc::EWOULDBLOCK {
                    vwarn!("notify pipe write error: errno {}", errno);
                }
            }
        }

        fn wait(&self, timeout: Option<Duration>) -> bool {
            let timeout_ms: libc::c_int = match timeout {
                Some(t) => t.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
                None => -1,
            };
            let mut pollfd = libc::pollfd {
                fd: self.read_pipe.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            loop {
                let rc = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
                if rc == 0 {
                    return false;
                }
                if rc < 0 {
                    let errno =
                        std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
                    if errno == libc::EINTR {
                        continue;
                    }
                    vwarn!("wait pipe poll error: errno {}", errno);
                    return false;
                }
                self.ack();
                return true;
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::sync::Arc;
        use std::thread;
        use std::time::Instant;

        #[test]
        fn test_self_notify_suppression() {
            let waiter = PipedRequestWaiter::new().unwrap();
            /* Two rapid notifications... */
            waiter.notify();
            waiter.notify();
            /* ...observed as a single event... */
            assert!(waiter.wait(Some(Duration::from_millis(10))));
            /* ...and the following wait blocks again. */
            assert!(!waiter.wait(Some(Duration::from_millis(10))));
        }

        #[test]
        fn test_wait_timeout() {
            let waiter = PipedRequestWaiter::new().unwrap();
            let start = Instant::now();
            assert!(!waiter.wait(Some(Duration::from_millis(50))));
            assert!(start.elapsed() >= Duration::from_millis(40));
        }

        #[test]
        fn test_cross_thread_wake() {
            let waiter = Arc::new(PipedRequestWaiter::new().unwrap());
            let w = waiter.clone();
            let handle = thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                w.notify();
            });
            assert!(waiter.wait(Some(Duration::from_secs(5))));
            handle.join().unwrap();
        }

        #[test]
        fn test_notify_after_ack_fires_again() {
            let waiter = PipedRequestWaiter::new().unwrap();
            waiter.notify();
            assert!(waiter.wait(Some(Duration::from_millis(10))));
            waiter.notify();
            assert!(waiter.wait(Some(Duration::from_millis(10))));
        }

        #[test]
        fn test_fd_is_pollable() {
            let waiter = PipedRequestWaiter::new().unwrap();
            assert!(waiter.fd() >= 0);
            waiter.notify();
            let mut pollfd = libc::pollfd {
                fd: waiter.fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            let rc = unsafe { libc::poll(&mut pollfd, 1, 100) };
            assert_eq!(rc, 1);
            waiter.ack();
        }

        #[test]
        fn test_concurrent_notifies_never_overflow() {
            let waiter = Arc::new(PipedRequestWaiter::new().unwrap());
            let mut handles = Vec::new();
            for _ in 0..8 {
                let w = waiter.clone();
                handles.push(thread::spawn(move || {
                    for _ in 0..1000 {
                        w.notify();
                    }
                }));
            }
            for handle in handles {
                handle.join().unwrap();
            }
            /* However many notifications raced, at most one byte is
             * buffered. */
            assert!(waiter.wait(Some(Duration::from_millis(10))));
        }
    }
}
