//! Dispatcher-thread I/O controller.
//!
//! Operations are pushed into a bounded lock-free queue; a dedicated
//! dispatcher thread, woken through a self-pipe waiter (the same
//! primitive reactors use), pops them, performs the positioned syscalls
//! and invokes the completion callbacks. Streams serialize their own
//! reads and writes, so one dispatcher executing operations back to back
//! matches the concurrency the layer above actually produces.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_queue::ArrayQueue;

use vlink_core::{PipedRequestWaiter, Waiter};

use crate::error::{IoError, Result};
use crate::native::{NativeCallback, NativeCompletion, NativeController, NativeOp, Offset, OpToken};

struct QueuedOp {
    op: NativeOp,
    token: Arc<OpToken>,
    callback: NativeCallback,
}

struct ControllerShared {
    queue: ArrayQueue<QueuedOp>,
    wake: PipedRequestWaiter,
    shutdown: AtomicBool,
}

/// Poll-style native controller: bounded submission queue, self-pipe wake,
/// one dispatcher thread.
pub struct PollIoController {
    shared: Arc<ControllerShared>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

/// Submission queue depth. Streams keep at most one read and one write in
/// flight each, so this bounds the number of simultaneously open streams
/// the controller serves without pushback.
const QUEUE_DEPTH: usize = 1024;

impl PollIoController {
    pub fn new() -> Result<Self> {
        let wake = PipedRequestWaiter::new().map_err(IoError::from)?;
        Ok(Self {
            shared: Arc::new(ControllerShared {
                queue: ArrayQueue::new(QUEUE_DEPTH),
                wake,
                shutdown: AtomicBool::new(false),
            }),
            thread: Mutex::new(None),
        })
    }
}

impl NativeController for PollIoController {
    fn enable(&self) -> Result<()> {
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("vlink-io-dispatcher".to_owned())
            .spawn(move || dispatcher_loop(&shared))
            .expect("failed to spawn dispatcher thread");
        *self.thread.lock().unwrap() = Some(handle);
        Ok(())
    }

    fn disable(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.wake.notify();
        let handle = self.thread.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn queue(&self, op: NativeOp, callback: NativeCallback) -> Arc<OpToken> {
        let token = Arc::new(OpToken::new());
        let queued = QueuedOp {
            op,
            token: token.clone(),
            callback,
        };
        if self.shared.shutdown.load(Ordering::SeqCst) {
            complete_unexecuted(queued, libc::ECANCELED);
            return token;
        }
        match self.shared.queue.push(queued) {
            Ok(()) => self.shared.wake.notify(),
            Err(queued) => {
                /* Queue full: push back to the caller immediately. */
                complete_unexecuted(queued, libc::EAGAIN);
            }
        }
        token
    }
}

impl Drop for PollIoController {
    fn drop(&mut self) {
        self.disable();
    }
}

/// Complete an operation that never reached execution.
fn complete_unexecuted(queued: QueuedOp, errno: i32) {
    if queued.token.begin() {
        (queued.callback)(NativeCompletion {
            result: Err(errno),
            data: None,
        });
        queued.token.finish();
    }
}

fn dispatcher_loop(shared: &ControllerShared) {
    loop {
        while let Some(queued) = shared.queue.pop() {
            if !queued.token.begin() {
                /* Canceled before execution; the canceler owns the
                 * completion and the callback must not fire. */
                continue;
            }
            let completion = execute(&queued.op);
            queued.token.finish();
            (queued.callback)(completion);
        }
        if shared.shutdown.load(Ordering::SeqCst) {
            /* Drain whatever raced in after the last pop. */
            while let Some(queued) = shared.queue.pop() {
                complete_unexecuted(queued, libc::ECANCELED);
            }
            break;
        }
        shared.wake.wait(None);
    }
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

fn execute(op: &NativeOp) -> NativeCompletion {
    match op {
        NativeOp::Write { fd, data, offset } => {
            let result = write_all(*fd, data.as_slice(), *offset);
            NativeCompletion { result, data: None }
        }
        NativeOp::Read {
            fd,
            max,
            min,
            offset,
        } => {
            let mut buf = vec![0u8; *max];
            match read_at_least(*fd, &mut buf, *min, *offset) {
                Ok(total) => {
                    buf.truncate(total);
                    NativeCompletion {
                        result: Ok(total),
                        data: Some(buf),
                    }
                }
                Err(errno) => NativeCompletion {
                    result: Err(errno),
                    data: None,
                },
            }
        }
    }
}

/// Write the whole buffer, restarting on EINTR and short writes.
fn write_all(fd: i32, data: &[u8], offset: Offset) -> std::result::Result<usize, i32> {
    if let Offset::End = offset {
        if unsafe { libc::lseek(fd, 0, libc::SEEK_END) } < 0 {
            return Err(last_errno());
        }
    }
    let mut written = 0;
    while written < data.len() {
        let remaining = &data[written..];
        let rc = match offset {
            Offset::At(pos) => unsafe {
                libc::pwrite(
                    fd,
                    remaining.as_ptr() as *const libc::c_void,
                    remaining.len(),
                    (pos as i64 + written as i64) as libc::off_t,
                )
            },
            _ => unsafe {
                libc::write(fd, remaining.as_ptr() as *const libc::c_void, remaining.len())
            },
        };
        if rc < 0 {
            let errno = last_errno();
            if errno == libc::EINTR {
                continue;
            }
            return Err(errno);
        }
        if rc == 0 {
            break;
        }
        written += rc as usize;
    }
    Ok(written)
}

/// Read until at least `min` bytes arrived or end of file.
fn read_at_least(
    fd: i32,
    buf: &mut [u8],
    min: usize,
    offset: Offset,
) -> std::result::Result<usize, i32> {
    if let Offset::End = offset {
        if unsafe { libc::lseek(fd, 0, libc::SEEK_END) } < 0 {
            return Err(last_errno());
        }
    }
    let mut total = 0;
    while total < buf.len() {
        let remaining = &mut buf[total..];
        let rc = match offset {
            Offset::At(pos) => unsafe {
                libc::pread(
                    fd,
                    remaining.as_mut_ptr() as *mut libc::c_void,
                    remaining.len(),
                    (pos as i64 + total as i64) as libc::off_t,
                )
            },
            _ => unsafe {
                libc::read(
                    fd,
                    remaining.as_mut_ptr() as *mut libc::c_void,
                    remaining.len(),
                )
            },
        };
        if rc < 0 {
            let errno = last_errno();
            if errno == libc::EINTR {
                continue;
            }
            return Err(errno);
        }
        if rc == 0 {
            /* End of file before the minimum; the stream layer grades the
             * partial result. */
            break;
        }
        total += rc as usize;
        if total >= min {
            break;
        }
    }
    Ok(total)
}
