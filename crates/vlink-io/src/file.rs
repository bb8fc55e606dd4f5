//! File processor — asynchronous file streams on top of the request
//! pipeline.
//!
//! Mostly intended for special files such as mapped devices; for regular
//! files the value is the uniform asynchronous interface and the advisory
//! lock support. Operations are asynchronous but not concurrent: each
//! stream serializes its reads and its writes, so writes complete in
//! submission order.
//!
//! Lock acquisition runs on a per-stream locker thread: a blocked flock
//! must never stall the processor worker.

use std::collections::VecDeque;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;

use vlink_core::{
    OperationWaiter, Phase, Request, RequestContainer, RequestStatus, RequestWorker, Singleton,
};
use vlink_core::{vdebug, vwarn};

use crate::buffer::IoBuffer;
use crate::error::{IoError, Result};
use crate::native::{map_errno, NativeCompletion, NativeController, NativeOp, Offset, OpToken};
use crate::poll_controller::PollIoController;
use crate::result::IoResult;
use crate::stream::{RefCounted, RefGuard, StreamBase, StreamKind, StreamState};

/// Completion handler of a read operation: the data read (None on
/// failure) and the result code.
pub type ReadHandler = Box<dyn FnOnce(Option<IoBuffer>, IoResult) + Send>;

/// Completion handler of a write operation.
pub type WriteHandler = Box<dyn FnOnce(IoResult) + Send>;

/// Completion handler of a lock or unlock operation.
pub type LockHandler = Box<dyn FnOnce(IoResult) + Send>;

/// Completion handler of a close operation.
pub type CloseHandler = Box<dyn FnOnce() + Send>;

static SINGLETON: Singleton<FileProcessor> = Singleton::new();

/// Opening mode, fopen-style.
///
/// `r` opens an existing file for reading, `w` creates/truncates for
/// writing, `+` extends either to read-write without truncation side
/// effects, `x` with `w` demands the file not exist. `rx` additionally
/// creates a missing file while keeping read-only semantics.
#[derive(Debug, Clone, Copy)]
pub struct Mode {
    pub read: bool,
    pub write: bool,
    pub extended: bool,
    pub should_not_exist: bool,
}

impl Mode {
    pub fn parse(mode_str: &str) -> Result<Mode> {
        let mut mode = Mode {
            read: false,
            write: false,
            extended: false,
            should_not_exist: false,
        };
        for c in mode_str.chars() {
            match c {
                'r' => mode.read = true,
                'w' => mode.write = true,
                '+' => mode.extended = true,
                'x' => mode.should_not_exist = true,
                _ => return Err(IoError::InvalidMode(mode_str.to_owned())),
            }
        }
        if mode.read == mode.write {
            /* Exactly one of r/w required. */
            return Err(IoError::InvalidMode(mode_str.to_owned()));
        }
        Ok(mode)
    }
}

/// Result slot shared between the native completion path and the user
/// completion handler.
struct OpOut {
    result: Mutex<IoResult>,
    data: Mutex<Option<IoBuffer>>,
}

impl OpOut {
    fn new() -> Arc<OpOut> {
        Arc::new(OpOut {
            result: Mutex::new(IoResult::OtherFailure),
            data: Mutex::new(None),
        })
    }

    fn set_result(&self, result: IoResult) {
        *self.result.lock().unwrap() = result;
    }

    fn result(&self) -> IoResult {
        *self.result.lock().unwrap()
    }

    fn set_data(&self, data: IoBuffer) {
        *self.data.lock().unwrap() = Some(data);
    }

    fn take_data(&self) -> Option<IoBuffer> {
        self.data.lock().unwrap().take()
    }
}

struct ReadOp {
    request: Arc<Request>,
    max: usize,
    min: usize,
    offset: Mutex<Offset>,
    out: Arc<OpOut>,
}

struct WriteOp {
    request: Arc<Request>,
    buffer: IoBuffer,
    offset: Mutex<Offset>,
    out: Arc<OpOut>,
}

struct LockOp {
    request: Arc<Request>,
    out: Arc<OpOut>,
}

/// Per-stream operation state. One mutex guards it all; the locker thread
/// condvar is paired with the same mutex.
struct OpState {
    file: Option<File>,
    maintain_pos: bool,
    cur_pos: u64,
    cur_read: Option<Arc<ReadOp>>,
    cur_write: Option<Arc<WriteOp>>,
    read_queue: VecDeque<Arc<ReadOp>>,
    write_queue: VecDeque<Arc<WriteOp>>,
    read_token: Option<Arc<OpToken>>,
    write_token: Option<Arc<OpToken>>,
    /// Only one outstanding lock and one outstanding unlock per stream.
    cur_lock: Option<Arc<LockOp>>,
    cur_unlock: Option<Arc<LockOp>>,
    /// Locker thread control block.
    flock_thread_active: bool,
    flock_acquire_requested: bool,
    flock_acquired: bool,
}

/// An open file stream.
pub struct FileStream {
    base: StreamBase,
    processor: Weak<FileProcessor>,
    op: Mutex<OpState>,
    /// Wakes the locker thread on acquire requests and teardown.
    flock_notifier: Condvar,
    this: Weak<FileStream>,
}

impl FileStream {
    fn new(
        processor: &Arc<FileProcessor>,
        path: &str,
        maintain_pos: bool,
        file: File,
    ) -> Arc<FileStream> {
        Arc::new_cyclic(|this| FileStream {
            base: StreamBase::new(path, StreamKind::File),
            processor: Arc::downgrade(processor),
            op: Mutex::new(OpState {
                file: Some(file),
                maintain_pos,
                cur_pos: 0,
                cur_read: None,
                cur_write: None,
                read_queue: VecDeque::new(),
                write_queue: VecDeque::new(),
                read_token: None,
                write_token: None,
                cur_lock: None,
                cur_unlock: None,
                flock_thread_active: false,
                flock_acquire_requested: false,
                flock_acquired: false,
            }),
            flock_notifier: Condvar::new(),
            this: this.clone(),
        })
    }

    fn shared(&self) -> Arc<FileStream> {
        self.this.upgrade().expect("stream self reference")
    }

    /// Human readable stream name.
    pub fn name(&self) -> String {
        self.base.name()
    }

    pub fn state(&self) -> StreamState {
        self.base.state()
    }

    pub fn kind(&self) -> StreamKind {
        self.base.kind()
    }

    pub fn is_closed(&self) -> bool {
        self.base.is_closed()
    }

    /// Current position for streams which maintain one.
    pub fn current_pos(&self) -> u64 {
        self.op.lock().unwrap().cur_pos
    }

    /// Set the stream position. Does nothing unless the stream maintains
    /// its position; seeking while I/O is in progress gives undefined
    /// positions.
    pub fn seek(&self, pos: i64, relative: bool) -> Result<u64> {
        let mut st = self.op.lock().unwrap();
        if !st.maintain_pos {
            return Ok(0);
        }
        let new_pos = if relative {
            st.cur_pos as i64 + pos
        } else {
            pos
        };
        if new_pos < 0 {
            return Err(IoError::InvalidParam);
        }
        st.cur_pos = new_pos as u64;
        Ok(st.cur_pos)
    }

    /* ── Read ── */

    /// Initiate a read of at most `max` and at least `min` bytes. The
    /// operation completes once `min` bytes arrived or the file ended;
    /// an end-of-file result still carries the partial data.
    ///
    /// The handler runs synchronously for the caller: wait on (or drop)
    /// the returned waiter.
    pub fn read(&self, max: usize, min: usize, offset: Offset, handler: ReadHandler) -> OperationWaiter {
        self.read_impl(max, min, offset, handler, RequestContainer::new_temporal())
    }

    /// Same as [`FileStream::read`] with an explicit completion context.
    pub fn read_in(
        &self,
        max: usize,
        min: usize,
        offset: Offset,
        handler: ReadHandler,
        ctx: &Arc<RequestContainer>,
    ) -> OperationWaiter {
        self.read_impl(max, min, offset, handler, ctx.clone())
    }

    fn read_impl(
        &self,
        max: usize,
        min: usize,
        offset: Offset,
        handler: ReadHandler,
        ctx: Arc<RequestContainer>,
    ) -> OperationWaiter {
        let request = Request::new();
        let out = OpOut::new();
        let o = out.clone();
        request
            .set_completion_handler(ctx, Box::new(move || handler(o.take_data(), o.result())))
            .expect("fresh request");
        if max < min {
            vwarn!("read with max {} < min {} rejected", max, min);
            return Self::complete_inline(request);
        }
        if self.base.state() != StreamState::Opened {
            out.set_result(IoResult::Closed);
            return Self::complete_inline(request);
        }
        let op = Arc::new(ReadOp {
            request: request.clone(),
            max,
            min,
            offset: Mutex::new(offset),
            out,
        });
        let stream = self.shared();
        let o = op.clone();
        request
            .set_processing_handler(Box::new(move || stream.handle_read(&o)))
            .expect("fresh request");
        let stream = self.shared();
        let o = op.clone();
        request
            .set_cancellation_handler(Box::new(move || stream.handle_read_cancel(&o)))
            .expect("fresh request");
        let mut st = self.op.lock().unwrap();
        if st.cur_read.is_some() {
            st.read_queue.push_back(op);
        } else {
            Self::resolve_offset(&mut st, &op.offset);
            st.cur_read = Some(op.clone());
            drop(st);
            self.submit_or_run(&op.request);
        }
        OperationWaiter::new(request)
    }

    fn handle_read(&self, op: &Arc<ReadOp>) {
        let mut st = self.op.lock().unwrap();
        if !Self::is_cur_read(&st, op) {
            /* Canceled and superseded before processing started. */
            return;
        }
        if st.file.is_none() {
            self.finish_read(&mut st, op, IoResult::Closed, RequestStatus::Ok);
            return;
        }
        if op.request.status() == RequestStatus::Canceling {
            self.finish_read(&mut st, op, IoResult::Canceled, RequestStatus::Ok);
            return;
        }
        let processor = match self.processor.upgrade() {
            Some(processor) => processor,
            None => {
                self.finish_read(&mut st, op, IoResult::OtherFailure, RequestStatus::Ok);
                return;
            }
        };
        let fd = st.file.as_ref().unwrap().as_raw_fd();
        let offset = *op.offset.lock().unwrap();
        let stream = self.shared();
        let o = op.clone();
        let token = processor.controller.queue(
            NativeOp::Read {
                fd,
                max: op.max,
                min: op.min,
                offset,
            },
            Box::new(move |completion| stream.read_complete(&o, completion)),
        );
        st.read_token = Some(token);
    }

    fn read_complete(&self, op: &Arc<ReadOp>, completion: NativeCompletion) {
        let mut st = self.op.lock().unwrap();
        st.read_token = None;
        if !Self::is_cur_read(&st, op) {
            return;
        }
        let status = op.request.status();
        if status != RequestStatus::Processing && status != RequestStatus::Canceling {
            /* Aborted while the syscall ran; just advance the queue. */
            self.push_read_queue(&mut st);
            return;
        }
        match completion.result {
            Ok(total) => {
                let data = completion.data.unwrap_or_default();
                if st.maintain_pos {
                    if let Offset::At(pos) = *op.offset.lock().unwrap() {
                        st.cur_pos = pos + total as u64;
                    }
                }
                op.out.set_data(IoBuffer::new(data));
                let result = if total >= op.min {
                    IoResult::Ok
                } else {
                    IoResult::EndOfFile
                };
                self.finish_read(&mut st, op, result, RequestStatus::Ok);
            }
            Err(errno) => {
                self.finish_read(&mut st, op, map_errno(errno), RequestStatus::Ok);
            }
        }
    }

    fn handle_read_cancel(&self, op: &Arc<ReadOp>) {
        let mut st = self.op.lock().unwrap();
        if !Self::is_cur_read(&st, op) {
            /* Too late. */
            return;
        }
        let cancelable = match st.read_token.take() {
            Some(token) => token.cancel(),
            None => true,
        };
        if !cancelable {
            /* The native operation is running; its completion delivers. */
            return;
        }
        op.out.set_data(IoBuffer::empty());
        self.finish_read(&mut st, op, IoResult::Canceled, RequestStatus::Canceled);
    }

    fn finish_read(
        &self,
        st: &mut OpState,
        op: &Arc<ReadOp>,
        result: IoResult,
        status: RequestStatus,
    ) {
        let resolved = Self::resolve_result(st, &op.request, result);
        op.out.set_result(resolved);
        st.read_token = None;
        if Self::is_cur_read(st, op) {
            self.push_read_queue(st);
        }
        let request_status = op.request.status();
        if request_status == RequestStatus::Processing || request_status == RequestStatus::Canceling
        {
            op.request.complete_with(status);
        }
    }

    fn push_read_queue(&self, st: &mut OpState) {
        st.cur_read = None;
        if let Some(next) = st.read_queue.pop_front() {
            Self::resolve_offset(st, &next.offset);
            st.cur_read = Some(next.clone());
            self.submit_or_run(&next.request);
        }
    }

    fn is_cur_read(st: &OpState, op: &Arc<ReadOp>) -> bool {
        st.cur_read
            .as_ref()
            .map_or(false, |cur| Arc::ptr_eq(cur, op))
    }

    /* ── Write ── */

    /// Initiate a write. Writes on one stream complete in submission
    /// order.
    pub fn write(&self, buffer: IoBuffer, offset: Offset, handler: WriteHandler) -> OperationWaiter {
        self.write_impl(buffer, offset, handler, RequestContainer::new_temporal())
    }

    /// Same as [`FileStream::write`] with an explicit completion context.
    pub fn write_in(
        &self,
        buffer: IoBuffer,
        offset: Offset,
        handler: WriteHandler,
        ctx: &Arc<RequestContainer>,
    ) -> OperationWaiter {
        self.write_impl(buffer, offset, handler, ctx.clone())
    }

    fn write_impl(
        &self,
        buffer: IoBuffer,
        offset: Offset,
        handler: WriteHandler,
        ctx: Arc<RequestContainer>,
    ) -> OperationWaiter {
        let request = Request::new();
        let out = OpOut::new();
        let o = out.clone();
        request
            .set_completion_handler(ctx, Box::new(move || handler(o.result())))
            .expect("fresh request");
        if self.base.state() != StreamState::Opened {
            out.set_result(IoResult::Closed);
            return Self::complete_inline(request);
        }
        let op = Arc::new(WriteOp {
            request: request.clone(),
            buffer,
            offset: Mutex::new(offset),
            out,
        });
        let stream = self.shared();
        let o = op.clone();
        request
            .set_processing_handler(Box::new(move || stream.handle_write(&o)))
            .expect("fresh request");
        let stream = self.shared();
        let o = op.clone();
        request
            .set_cancellation_handler(Box::new(move || stream.handle_write_cancel(&o)))
            .expect("fresh request");
        let mut st = self.op.lock().unwrap();
        if st.cur_write.is_some() {
            st.write_queue.push_back(op);
        } else {
            Self::resolve_offset(&mut st, &op.offset);
            st.cur_write = Some(op.clone());
            drop(st);
            self.submit_or_run(&op.request);
        }
        OperationWaiter::new(request)
    }

    fn handle_write(&self, op: &Arc<WriteOp>) {
        let mut st = self.op.lock().unwrap();
        if !Self::is_cur_write(&st, op) {
            return;
        }
        if st.file.is_none() {
            self.finish_write(&mut st, op, IoResult::Closed, RequestStatus::Ok);
            return;
        }
        if op.request.status() == RequestStatus::Canceling {
            self.finish_write(&mut st, op, IoResult::Canceled, RequestStatus::Ok);
            return;
        }
        let processor = match self.processor.upgrade() {
            Some(processor) => processor,
            None => {
                self.finish_write(&mut st, op, IoResult::OtherFailure, RequestStatus::Ok);
                return;
            }
        };
        let fd = st.file.as_ref().unwrap().as_raw_fd();
        let offset = *op.offset.lock().unwrap();
        let stream = self.shared();
        let o = op.clone();
        let token = processor.controller.queue(
            NativeOp::Write {
                fd,
                data: op.buffer.clone(),
                offset,
            },
            Box::new(move |completion| stream.write_complete(&o, completion)),
        );
        st.write_token = Some(token);
    }

    fn write_complete(&self, op: &Arc<WriteOp>, completion: NativeCompletion) {
        let mut st = self.op.lock().unwrap();
        st.write_token = None;
        if !Self::is_cur_write(&st, op) {
            return;
        }
        let status = op.request.status();
        if status != RequestStatus::Processing && status != RequestStatus::Canceling {
            self.push_write_queue(&mut st);
            return;
        }
        match completion.result {
            Ok(written) => {
                if st.maintain_pos {
                    if let Offset::At(pos) = *op.offset.lock().unwrap() {
                        st.cur_pos = pos + written as u64;
                    }
                }
                self.finish_write(&mut st, op, IoResult::Ok, RequestStatus::Ok);
            }
            Err(errno) => {
                self.finish_write(&mut st, op, map_errno(errno), RequestStatus::Ok);
            }
        }
    }

    fn handle_write_cancel(&self, op: &Arc<WriteOp>) {
        let mut st = self.op.lock().unwrap();
        if !Self::is_cur_write(&st, op) {
            return;
        }
        let cancelable = match st.write_token.take() {
            Some(token) => token.cancel(),
            None => true,
        };
        if !cancelable {
            return;
        }
        self.finish_write(&mut st, op, IoResult::Canceled, RequestStatus::Canceled);
    }

    fn finish_write(
        &self,
        st: &mut OpState,
        op: &Arc<WriteOp>,
        result: IoResult,
        status: RequestStatus,
    ) {
        let resolved = Self::resolve_result(st, &op.request, result);
        op.out.set_result(resolved);
        st.write_token = None;
        if Self::is_cur_write(st, op) {
            self.push_write_queue(st);
        }
        let request_status = op.request.status();
        if request_status == RequestStatus::Processing || request_status == RequestStatus::Canceling
        {
            op.request.complete_with(status);
        }
    }

    fn push_write_queue(&self, st: &mut OpState) {
        st.cur_write = None;
        if let Some(next) = st.write_queue.pop_front() {
            Self::resolve_offset(st, &next.offset);
            st.cur_write = Some(next.clone());
            self.submit_or_run(&next.request);
        }
    }

    fn is_cur_write(st: &OpState, op: &Arc<WriteOp>) -> bool {
        st.cur_write
            .as_ref()
            .map_or(false, |cur| Arc::ptr_eq(cur, op))
    }

    /* ── Lock / Unlock ── */

    /// Put an exclusive advisory lock on the file (flock). The stream can
    /// be locked again only after a successful unlock: a second lock on
    /// the same stream fails with [`IoResult::LockError`].
    ///
    /// A waiter timeout or cancellation completes the operation with
    /// `TimedOut`/`Canceled` but does not interrupt a lock attempt already
    /// blocked in the kernel; the locker thread releases an unwanted lock
    /// as soon as it acquires it.
    pub fn lock(&self, handler: LockHandler) -> OperationWaiter {
        self.lock_impl(handler, RequestContainer::new_temporal(), true)
    }

    /// Same as [`FileStream::lock`] with an explicit completion context.
    pub fn lock_in(&self, handler: LockHandler, ctx: &Arc<RequestContainer>) -> OperationWaiter {
        self.lock_impl(handler, ctx.clone(), true)
    }

    /// Remove the lock. Unlocking while not locked fails with
    /// [`IoResult::LockError`]; unlocking while a lock request is still
    /// pending fails that pending lock instead.
    pub fn unlock(&self, handler: LockHandler) -> OperationWaiter {
        self.lock_impl(handler, RequestContainer::new_temporal(), false)
    }

    /// Same as [`FileStream::unlock`] with an explicit completion context.
    pub fn unlock_in(&self, handler: LockHandler, ctx: &Arc<RequestContainer>) -> OperationWaiter {
        self.lock_impl(handler, ctx.clone(), false)
    }

    fn lock_impl(
        &self,
        handler: LockHandler,
        ctx: Arc<RequestContainer>,
        do_lock: bool,
    ) -> OperationWaiter {
        let request = Request::new();
        let out = OpOut::new();
        let o = out.clone();
        request
            .set_completion_handler(ctx, Box::new(move || handler(o.result())))
            .expect("fresh request");

        let mut st = self.op.lock().unwrap();
        /* One outstanding lock and one outstanding unlock per stream. */
        if st.cur_unlock.is_some() || (do_lock && st.cur_lock.is_some()) {
            drop(st);
            out.set_result(IoResult::LockError);
            return Self::complete_inline(request);
        }
        let op = Arc::new(LockOp {
            request: request.clone(),
            out,
        });
        let stream = self.shared();
        let o = op.clone();
        if do_lock {
            request
                .set_processing_handler(Box::new(move || stream.handle_lock(&o)))
                .expect("fresh request");
            let stream = self.shared();
            let o = op.clone();
            request
                .set_cancellation_handler(Box::new(move || stream.handle_lock_cancel(&o)))
                .expect("fresh request");
            st.cur_lock = Some(op);
        } else {
            request
                .set_processing_handler(Box::new(move || stream.handle_unlock(&o)))
                .expect("fresh request");
            st.cur_unlock = Some(op);
        }
        drop(st);
        self.submit_or_run(&request);
        OperationWaiter::new(request)
    }

    fn handle_lock(&self, op: &Arc<LockOp>) {
        let mut st = self.op.lock().unwrap();
        if !st
            .cur_lock
            .as_ref()
            .map_or(false, |cur| Arc::ptr_eq(cur, op))
        {
            return;
        }
        if op.request.status() == RequestStatus::Canceling || st.file.is_none() {
            self.complete_lock_request(&mut st, true, IoResult::OtherFailure);
            return;
        }
        if st.flock_acquire_requested || st.flock_acquired {
            /* Double lock. */
            self.complete_lock_request(&mut st, true, IoResult::LockError);
            return;
        }
        st.flock_acquire_requested = true;
        if st.flock_thread_active {
            self.flock_notifier.notify_all();
        } else {
            st.flock_thread_active = true;
            let stream = self.shared();
            /* Detached: the thread keeps the stream alive while running. */
            thread::Builder::new()
                .name("vlink-flock".to_owned())
                .spawn(move || stream.locker_thread())
                .expect("failed to spawn locker thread");
        }
    }

    fn handle_unlock(&self, op: &Arc<LockOp>) {
        let mut st = self.op.lock().unwrap();
        if !st
            .cur_unlock
            .as_ref()
            .map_or(false, |cur| Arc::ptr_eq(cur, op))
        {
            return;
        }
        if op.request.status() == RequestStatus::Canceling {
            self.complete_lock_request(&mut st, false, IoResult::OtherFailure);
            return;
        }
        let mut unlock_result = IoResult::Ok;
        if st.flock_acquire_requested {
            /* A lock request is still pending; fail it instead. */
            st.flock_acquire_requested = false;
            self.complete_lock_request(&mut st, true, IoResult::LockError);
        } else if st.flock_acquired {
            if Self::flock_unlock(&st) {
                st.flock_acquired = false;
            } else {
                vwarn!("failed to unlock file [{}]", self.name());
                unlock_result = IoResult::LockError;
            }
        } else {
            /* Unlock while not locked. */
            unlock_result = IoResult::LockError;
        }
        self.complete_lock_request(&mut st, false, unlock_result);
    }

    fn handle_lock_cancel(&self, op: &Arc<LockOp>) {
        let mut st = self.op.lock().unwrap();
        if st
            .cur_lock
            .as_ref()
            .map_or(false, |cur| Arc::ptr_eq(cur, op))
        {
            self.cancel_lock_operation(&mut st, false);
        }
    }

    /// Complete the pending lock request (when canceled) and optionally
    /// stop the locker thread. Call with the op state locked.
    fn cancel_lock_operation(&self, st: &mut OpState, stop_locker_thread: bool) {
        if st.cur_lock.is_some() && st.flock_acquire_requested {
            st.flock_acquire_requested = false;
            self.complete_lock_request(st, true, IoResult::Canceled);
        }
        if st.flock_thread_active && stop_locker_thread {
            st.flock_thread_active = false;
            self.flock_notifier.notify_all();
        }
    }

    /// Complete the current lock (`lock_slot`) or unlock request with the
    /// resolved result and clear its slot.
    fn complete_lock_request(&self, st: &mut OpState, lock_slot: bool, result: IoResult) {
        let op = if lock_slot {
            st.cur_lock.take()
        } else {
            st.cur_unlock.take()
        };
        let op = match op {
            Some(op) => op,
            None => return,
        };
        let resolved = Self::resolve_result(st, &op.request, result);
        op.out.set_result(resolved);
        let status = op.request.status();
        if status == RequestStatus::Processing || status == RequestStatus::Canceling {
            op.request.complete_with(RequestStatus::Ok);
        }
    }

    /// Per-stream lock acquisition loop. flock blocks until the owner
    /// releases; a request canceled in the meantime is completed by the
    /// canceler, and the no-longer-wanted lock is released here as soon as
    /// it is acquired.
    fn locker_thread(&self) {
        let mut st = self.op.lock().unwrap();
        loop {
            let mut file_locked = false;
            if st.flock_acquire_requested {
                let fd = st.file.as_ref().map(|file| file.as_raw_fd());
                drop(st);
                file_locked = match fd {
                    Some(fd) => Self::flock_blocking(fd),
                    None => false,
                };
                st = self.op.lock().unwrap();
            }
            if st.flock_acquire_requested {
                if file_locked {
                    st.flock_acquired = true;
                    self.complete_lock_request(&mut st, true, IoResult::Ok);
                } else {
                    self.complete_lock_request(&mut st, true, IoResult::LockError);
                }
                st.flock_acquire_requested = false;
            } else if file_locked && st.file.is_some() {
                /* Acquired a lock nobody wants anymore. */
                if !Self::flock_unlock(&st) {
                    vwarn!("failed to release unwanted lock [{}]", self.name());
                }
            }
            if !st.flock_thread_active {
                break;
            }
            st = self
                .flock_notifier
                .wait_while(st, |st| {
                    !st.flock_acquire_requested && st.flock_thread_active
                })
                .unwrap();
        }
    }

    fn flock_blocking(fd: i32) -> bool {
        loop {
            if unsafe { libc::flock(fd, libc::LOCK_EX) } == 0 {
                return true;
            }
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno != libc::EINTR {
                return false;
            }
        }
    }

    fn flock_unlock(st: &OpState) -> bool {
        match st.file.as_ref() {
            Some(file) => unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) == 0 },
            None => false,
        }
    }

    /* ── Close ── */

    /// Initiate stream close: in-flight reads and writes complete with
    /// `Closed`/`Canceled`, a pending lock fails, the locker thread stops
    /// and the native handle is released. Idempotent.
    pub fn close(&self) -> OperationWaiter {
        self.close_impl(None)
    }

    /// Close with a completion notification in the given context.
    pub fn close_in(&self, handler: CloseHandler, ctx: &Arc<RequestContainer>) -> OperationWaiter {
        self.close_impl(Some((handler, ctx.clone())))
    }

    fn close_impl(&self, completion: Option<(CloseHandler, Arc<RequestContainer>)>) -> OperationWaiter {
        self.base.set_state(StreamState::Closing);
        let request = Request::new();
        if let Some((handler, ctx)) = completion {
            request
                .set_completion_handler(ctx, Box::new(move || handler()))
                .expect("fresh request");
        }
        let stream = self.shared();
        let r = request.clone();
        request
            .set_processing_handler(Box::new(move || {
                stream.handle_close(&r);
                r.complete();
            }))
            .expect("fresh request");
        /* Closing must happen even when the request is aborted during
         * container teardown. */
        let stream = self.shared();
        let r = request.clone();
        request.set_done_handler(Some(Box::new(move || stream.handle_close(&r))));
        match self.processor.upgrade() {
            Some(processor) => processor.proc_ctx.submit(request.clone()),
            None => request.process(true),
        }
        OperationWaiter::new(request)
    }

    fn handle_close(&self, _request: &Arc<Request>) {
        let mut st = self.op.lock().unwrap();
        if st.file.is_some() {
            /* Dropping the handle closes the descriptor; in-flight native
             * operations then fail and resolve to Closed. */
            st.file = None;
            self.base.set_state(StreamState::Closed);
        }
        self.cancel_lock_operation(&mut st, true);
        let read = st.cur_read.clone();
        let write = st.cur_write.clone();
        drop(st);
        if let Some(read) = read {
            read.request.cancel();
        }
        if let Some(write) = write {
            write.request.cancel();
        }
    }

    /* ── Helpers ── */

    /// Resolve a completion result against the stream and request state:
    /// closing overrides everything, a failed request that timed out
    /// reports the timeout, a canceled one the cancellation.
    fn resolve_result(st: &OpState, request: &Arc<Request>, result: IoResult) -> IoResult {
        if st.file.is_none() {
            return IoResult::Closed;
        }
        if result != IoResult::Ok {
            if request.timed_out() {
                return IoResult::TimedOut;
            }
            if request.status() == RequestStatus::Canceling {
                return IoResult::Canceled;
            }
        }
        result
    }

    /// Resolve an automatic offset to the maintained position.
    fn resolve_offset(st: &mut OpState, offset: &Mutex<Offset>) {
        let mut offset = offset.lock().unwrap();
        if st.maintain_pos && *offset == Offset::Auto {
            *offset = Offset::At(st.cur_pos);
        }
    }

    /// Submit to the processor, or run inline when it is gone (the
    /// handler reports the failure through the normal completion path).
    fn submit_or_run(&self, request: &Arc<Request>) {
        match self.processor.upgrade() {
            Some(processor) => processor.proc_ctx.submit(request.clone()),
            None => request.process(true),
        }
    }

    /// Complete a rejected operation without entering the pipeline; the
    /// completion still flows through its context.
    fn complete_inline(request: Arc<Request>) -> OperationWaiter {
        let r = request.clone();
        request
            .set_processing_handler(Box::new(move || r.complete()))
            .expect("fresh request");
        request.process(true);
        OperationWaiter::new(request)
    }
}

impl RefCounted for FileStream {
    fn add_ref(&self) {
        self.base.add_ref();
    }

    /// Releasing the last reference closes the stream synchronously.
    fn release_ref(&self) {
        let previous = self.base.release_ref();
        if previous <= 0 {
            vlink_core::fatal_internal!("stream reference counter underflow");
        }
        if previous == 1 && !self.is_closed() {
            let waiter = self.close();
            waiter.wait(true, None);
        }
    }
}

impl std::fmt::Debug for FileStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStream")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

/// Processor for filesystem I/O: one worker thread services the
/// processing and completion containers, a native controller performs the
/// syscalls.
pub struct FileProcessor {
    proc_ctx: Arc<RequestContainer>,
    comp_ctx: Arc<RequestContainer>,
    worker: Arc<RequestWorker>,
    controller: PollIoController,
}

impl FileProcessor {
    /// Get the process-wide instance, created and enabled on demand, torn
    /// down when the last holder releases it. Streams keep only a weak
    /// reference: keep the processor handle alive while streams are used.
    pub fn instance() -> Arc<FileProcessor> {
        SINGLETON.get_or_create(|| {
            let processor = FileProcessor::new().expect("file processor setup");
            processor.enable().expect("file processor enable");
            processor
        })
    }

    /// Create a detached (non-singleton) processor. Must be enabled before
    /// use.
    pub fn new() -> Result<Arc<FileProcessor>> {
        let proc_ctx = RequestContainer::new("file processor", Phase::Processor);
        let comp_ctx = RequestContainer::new("file processor completion", Phase::Completion);
        let worker = RequestWorker::new(
            "file processor worker",
            vec![proc_ctx.clone(), comp_ctx.clone()],
        );
        Ok(Arc::new(FileProcessor {
            proc_ctx,
            comp_ctx,
            worker,
            controller: PollIoController::new()?,
        }))
    }

    pub fn enable(self: &Arc<Self>) -> Result<()> {
        self.controller.enable()?;
        self.worker.enable_containers()?;
        self.worker.enable()?;
        Ok(())
    }

    /// Disable the processor. The controller drains first so no native
    /// completion arrives after the contexts are gone.
    pub fn disable(&self) {
        self.controller.disable();
        self.worker.disable();
        self.proc_ctx.disable();
        self.comp_ctx.disable();
    }

    /// Completion context serviced by the processor's worker thread, for
    /// callers which do not want to pump completions themselves.
    pub fn completion_context(&self) -> Arc<RequestContainer> {
        self.comp_ctx.clone()
    }

    /// Open a file and wrap it into an asynchronous stream.
    ///
    /// `maintain_pos` selects whether the stream maintains the read/write
    /// position itself; pass false for devices which do not support
    /// seeking.
    pub fn open(
        self: &Arc<Self>,
        path: &str,
        mode_str: &str,
        maintain_pos: bool,
    ) -> Result<RefGuard<FileStream>> {
        let mode = Mode::parse(mode_str)?;
        let file = Self::open_native(path, &mode)?;
        let stream = FileStream::new(self, path, maintain_pos, file);
        vdebug!("opened file stream [{}]", path);
        Ok(RefGuard::new(stream))
    }

    fn open_native(path: &str, mode: &Mode) -> Result<File> {
        let mut options = std::fs::OpenOptions::new();
        if mode.read {
            options.read(true);
            if mode.extended {
                options.write(true);
            }
            if mode.should_not_exist {
                /* "rx": create the file when missing, read-only access
                 * semantics otherwise. */
                options.write(true).create(true);
            }
        } else {
            options.write(true);
            if mode.extended {
                options.read(true);
            }
            if mode.should_not_exist {
                options.create_new(true);
            } else {
                options.create(true).truncate(true);
            }
        }
        options.open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => IoError::NotFound(path.to_owned()),
            std::io::ErrorKind::PermissionDenied => IoError::PermissionDenied(path.to_owned()),
            std::io::ErrorKind::AlreadyExists => IoError::AlreadyExists(path.to_owned()),
            _ => IoError::Os(e.raw_os_error().unwrap_or(0)),
        })
    }
}

impl Drop for FileProcessor {
    fn drop(&mut self) {
        self.disable();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn temp_path(tag: &str) -> String {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let n = COUNTER.fetch_add(1, Ordering::SeqCst);
        std::env::temp_dir()
            .join(format!("vlink-file-{}-{}-{}.tmp", std::process::id(), tag, n))
            .to_string_lossy()
            .into_owned()
    }

    fn enabled_processor() -> Arc<FileProcessor> {
        let processor = FileProcessor::new().unwrap();
        processor.enable().unwrap();
        processor
    }

    fn write_sync(stream: &FileStream, data: &[u8], offset: Offset) -> IoResult {
        let slot = Arc::new(Mutex::new(None));
        let s = slot.clone();
        let waiter = stream.write(
            IoBuffer::from_slice(data),
            offset,
            Box::new(move |result| {
                *s.lock().unwrap() = Some(result);
            }),
        );
        assert!(waiter.wait(true, Some(Duration::from_secs(10))));
        drop(waiter);
        let result = slot.lock().unwrap().take();
        result.expect("write completion delivered")
    }

    fn read_sync(
        stream: &FileStream,
        max: usize,
        min: usize,
        offset: Offset,
    ) -> (Option<IoBuffer>, IoResult) {
        let slot = Arc::new(Mutex::new(None));
        let s = slot.clone();
        let waiter = stream.read(
            max,
            min,
            offset,
            Box::new(move |data, result| {
                *s.lock().unwrap() = Some((data, result));
            }),
        );
        assert!(waiter.wait(true, Some(Duration::from_secs(10))));
        drop(waiter);
        let result = slot.lock().unwrap().take();
        result.expect("read completion delivered")
    }

    fn lock_sync(stream: &FileStream, timeout: Option<Duration>) -> IoResult {
        let slot = Arc::new(Mutex::new(None));
        let s = slot.clone();
        let mut waiter = stream.lock(Box::new(move |result| {
            *s.lock().unwrap() = Some(result);
        }));
        if let Some(timeout) = timeout {
            waiter.timeout(timeout, None, true, None).unwrap();
        }
        assert!(waiter.wait(true, Some(Duration::from_secs(10))));
        drop(waiter);
        let result = slot.lock().unwrap().take();
        result.expect("lock completion delivered")
    }

    fn unlock_sync(stream: &FileStream) -> IoResult {
        let slot = Arc::new(Mutex::new(None));
        let s = slot.clone();
        let waiter = stream.unlock(Box::new(move |result| {
            *s.lock().unwrap() = Some(result);
        }));
        assert!(waiter.wait(true, Some(Duration::from_secs(10))));
        drop(waiter);
        let result = slot.lock().unwrap().take();
        result.expect("unlock completion delivered")
    }

    #[test]
    fn test_mode_parse() {
        let mode = Mode::parse("r").unwrap();
        assert!(mode.read && !mode.write && !mode.extended);
        let mode = Mode::parse("w+").unwrap();
        assert!(mode.write && mode.extended);
        let mode = Mode::parse("rx").unwrap();
        assert!(mode.read && mode.should_not_exist);
        assert!(Mode::parse("a").is_err());
        assert!(Mode::parse("rw").is_err());
        assert!(Mode::parse("").is_err());
    }

    #[test]
    fn test_open_missing_file_fails() {
        let processor = enabled_processor();
        let result = processor.open("/definitely/not/here.tmp", "r", true);
        assert!(matches!(result, Err(IoError::NotFound(_))));
        processor.disable();
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let processor = enabled_processor();
        let path = temp_path("roundtrip");

        let stream = processor.open(&path, "w+", true).unwrap();
        assert_eq!(write_sync(&stream, b"hello stream", Offset::Auto), IoResult::Ok);
        assert_eq!(stream.current_pos(), 12);

        let (data, result) = read_sync(&stream, 64, 1, Offset::At(0));
        assert_eq!(result, IoResult::Ok);
        assert_eq!(data.unwrap().as_slice(), b"hello stream");

        drop(stream);
        processor.disable();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_read_past_end_reports_eof() {
        let processor = enabled_processor();
        let path = temp_path("eof");
        let stream = processor.open(&path, "w+", true).unwrap();
        assert_eq!(write_sync(&stream, b"abc", Offset::Auto), IoResult::Ok);

        let (data, result) = read_sync(&stream, 16, 10, Offset::At(0));
        assert_eq!(result, IoResult::EndOfFile);
        assert_eq!(data.unwrap().as_slice(), b"abc");

        drop(stream);
        processor.disable();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_writes_complete_in_submission_order() {
        let processor = enabled_processor();
        let path = temp_path("order");
        let stream = processor.open(&path, "w+", true).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let ctx = processor.completion_context();

        let mut waiters = Vec::new();
        for i in 0..8u8 {
            let o = order.clone();
            waiters.push(stream.write_in(
                IoBuffer::new(vec![b'0' + i]),
                Offset::Auto,
                Box::new(move |result| {
                    assert_eq!(result, IoResult::Ok);
                    o.lock().unwrap().push(i);
                }),
                &ctx,
            ));
        }
        for waiter in &waiters {
            assert!(waiter.wait(false, Some(Duration::from_secs(10))));
        }
        drop(waiters);
        assert_eq!(*order.lock().unwrap(), (0..8).collect::<Vec<_>>());

        let (data, result) = read_sync(&stream, 64, 1, Offset::At(0));
        assert_eq!(result, IoResult::Ok);
        assert_eq!(data.unwrap().as_slice(), b"01234567");

        drop(stream);
        processor.disable();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_closed_stream_rejects_new_operations() {
        let processor = enabled_processor();
        let path = temp_path("closed");
        let stream = processor.open(&path, "w", true).unwrap();

        let close_waiter = stream.close();
        assert!(close_waiter.wait(true, Some(Duration::from_secs(10))));
        drop(close_waiter);
        assert!(stream.is_closed());

        assert_eq!(write_sync(&stream, b"nope", Offset::Auto), IoResult::Closed);
        let (_, result) = read_sync(&stream, 8, 1, Offset::Auto);
        assert_eq!(result, IoResult::Closed);

        /* Close is idempotent. */
        let again = stream.close();
        assert!(again.wait(true, Some(Duration::from_secs(10))));
        drop(again);

        drop(stream);
        processor.disable();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_reference_counted_close() {
        let processor = enabled_processor();
        let path = temp_path("refs");
        let guard = processor.open(&path, "w", true).unwrap();
        let stream = guard.arc();

        stream.add_ref();
        stream.add_ref();
        stream.release_ref();
        stream.release_ref();
        assert!(!stream.is_closed());

        /* Final reference: implicit close. */
        drop(guard);
        assert!(stream.is_closed());

        processor.disable();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_lock_contention_scenario() {
        let processor = enabled_processor();
        let path = temp_path("flock");

        let m1 = processor.open(&path, "w", true).unwrap();
        let m2 = processor.open(&path, "r", true).unwrap();

        /* m1 takes the lock. */
        assert_eq!(lock_sync(&m1, None), IoResult::Ok);
        /* Double lock on the same stream is refused outright. */
        assert_eq!(lock_sync(&m1, None), IoResult::LockError);
        /* m2 blocks on the kernel lock and times out. */
        assert_eq!(
            lock_sync(&m2, Some(Duration::from_millis(100))),
            IoResult::TimedOut
        );
        /* After m1 releases, m2 can take it. */
        assert_eq!(unlock_sync(&m1), IoResult::Ok);
        assert_eq!(lock_sync(&m2, None), IoResult::Ok);
        assert_eq!(unlock_sync(&m2), IoResult::Ok);

        /* Unlock while not locked. */
        assert_eq!(unlock_sync(&m2), IoResult::LockError);

        drop(m1);
        drop(m2);
        processor.disable();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_completion_in_processor_context() {
        let processor = enabled_processor();
        let path = temp_path("ctx");
        let stream = processor.open(&path, "w", true).unwrap();

        let done = Arc::new(AtomicUsize::new(0));
        let d = done.clone();
        let waiter = stream.write_in(
            IoBuffer::from_slice(b"ctx"),
            Offset::Auto,
            Box::new(move |result| {
                assert_eq!(result, IoResult::Ok);
                d.fetch_add(1, Ordering::SeqCst);
            }),
            &processor.completion_context(),
        );
        /* The worker delivers the completion on its own; no pumping. */
        assert!(waiter.wait(false, Some(Duration::from_secs(10))));
        drop(waiter);
        assert_eq!(done.load(Ordering::SeqCst), 1);

        drop(stream);
        processor.disable();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_seek_maintained_position() {
        let processor = enabled_processor();
        let path = temp_path("seek");
        let stream = processor.open(&path, "w+", true).unwrap();
        assert_eq!(write_sync(&stream, b"0123456789", Offset::Auto), IoResult::Ok);

        assert_eq!(stream.seek(4, false).unwrap(), 4);
        let (data, result) = read_sync(&stream, 3, 3, Offset::Auto);
        assert_eq!(result, IoResult::Ok);
        assert_eq!(data.unwrap().as_slice(), b"456");
        assert_eq!(stream.current_pos(), 7);

        assert_eq!(stream.seek(-2, true).unwrap(), 5);
        assert!(stream.seek(-100, true).is_err());

        drop(stream);
        processor.disable();
        let _ = std::fs::remove_file(&path);
    }
}
