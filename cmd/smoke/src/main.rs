//! End-to-End Smoke Test
//!
//! Exercises the full stack:
//!   Part A — Request pipeline: containers, waiters, workers
//!   Part B — Operation waiters: wait, cancel, timeout race
//!   Part C — File streams: write/read round trip, ordering, close
//!   Part D — File locks: contention, timeout, release
//!
//! Run: ./target/release/smoke

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use vlink_core::{Phase, Request, RequestContainer, RequestWorker, Waiter};
use vlink_io::native::Offset;
use vlink_io::{FileProcessor, FileStream, IoBuffer, IoResult};

// ── Test harness ──

struct TestRunner {
    total: usize,
    passed: usize,
    failed: usize,
}

const LINE: &str = "────────────────────────────────────────────────────────────";

impl TestRunner {
    fn new() -> Self {
        Self {
            total: 0,
            passed: 0,
            failed: 0,
        }
    }

    fn section(&self, name: &str) {
        println!("\n{}", LINE);
        println!("  {}", name);
        println!("{}", LINE);
    }

    fn pass(&mut self, name: &str) {
        self.total += 1;
        self.passed += 1;
        println!("  [{:2}] {:<52} PASS", self.total, name);
    }

    fn fail(&mut self, name: &str, reason: &str) {
        self.total += 1;
        self.failed += 1;
        println!("  [{:2}] {:<52} FAIL: {}", self.total, name, reason);
    }

    fn check(&mut self, name: &str, ok: bool, reason: &str) {
        if ok {
            self.pass(name);
        } else {
            self.fail(name, reason);
        }
    }

    fn summary(&self) -> i32 {
        println!("\n{}", LINE);
        println!(
            "  total: {}  passed: {}  failed: {}",
            self.total, self.passed, self.failed
        );
        println!("{}", LINE);
        if self.failed > 0 {
            1
        } else {
            0
        }
    }
}

fn temp_path(tag: &str) -> String {
    std::env::temp_dir()
        .join(format!("vlink-smoke-{}-{}.tmp", std::process::id(), tag))
        .to_string_lossy()
        .into_owned()
}

fn write_sync(stream: &FileStream, data: &[u8]) -> IoResult {
    let slot = Arc::new(Mutex::new(None));
    let s = slot.clone();
    let waiter = stream.write(
        IoBuffer::from_slice(data),
        Offset::Auto,
        Box::new(move |result| {
            *s.lock().unwrap() = Some(result);
        }),
    );
    waiter.wait(true, Some(Duration::from_secs(10)));
    drop(waiter);
    let result = slot.lock().unwrap().take();
    result.unwrap_or(IoResult::OtherFailure)
}

fn read_sync(stream: &FileStream, max: usize, offset: Offset) -> (Vec<u8>, IoResult) {
    let slot = Arc::new(Mutex::new(None));
    let s = slot.clone();
    let waiter = stream.read(
        max,
        1,
        offset,
        Box::new(move |data, result| {
            *s.lock().unwrap() = Some((data.map(|b| b.to_vec()).unwrap_or_default(), result));
        }),
    );
    waiter.wait(true, Some(Duration::from_secs(10)));
    drop(waiter);
    let result = slot.lock().unwrap().take();
    result.unwrap_or((Vec::new(), IoResult::OtherFailure))
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
    waiter.wait(true, Some(Duration::from_secs(10)));
    drop(waiter);
    let result = slot.lock().unwrap().take();
    result.unwrap_or(IoResult::OtherFailure)
}

fn unlock_sync(stream: &FileStream) -> IoResult {
    let slot = Arc::new(Mutex::new(None));
    let s = slot.clone();
    let waiter = stream.unlock(Box::new(move |result| {
        *s.lock().unwrap() = Some(result);
    }));
    waiter.wait(true, Some(Duration::from_secs(10)));
    drop(waiter);
    let result = slot.lock().unwrap().take();
    result.unwrap_or(IoResult::OtherFailure)
}

fn part_a_pipeline(t: &mut TestRunner) {
    t.section("Part A — Request pipeline");

    let processor = RequestContainer::new("smoke processor", Phase::Processor);
    processor.enable().unwrap();
    let worker = RequestWorker::new("smoke", vec![processor.clone()]);
    worker.enable().unwrap();

    let counter = Arc::new(AtomicUsize::new(0));
    let order = Arc::new(Mutex::new(Vec::new()));
    let mut requests = Vec::new();
    for id in 0..100usize {
        let request = Request::new();
        let r = request.clone();
        let c = counter.clone();
        let o = order.clone();
        request
            .set_processing_handler(Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
                o.lock().unwrap().push(id);
                r.complete();
            }))
            .unwrap();
        processor.submit(request.clone());
        requests.push(request);
    }
    let all_done = requests
        .iter()
        .all(|r| r.wait_done(false, Some(Duration::from_secs(10))));
    t.check("100 requests processed", all_done, "wait_done timed out");
    t.check(
        "exactly-once processing",
        counter.load(Ordering::SeqCst) == 100,
        "handler count mismatch",
    );
    t.check(
        "FIFO order within container",
        *order.lock().unwrap() == (0..100).collect::<Vec<_>>(),
        "order violated",
    );

    let waiter = processor.waiter();
    waiter.notify();
    waiter.notify();
    let first = waiter.wait(Some(Duration::from_millis(10)));
    let second = waiter.wait(Some(Duration::from_millis(10)));
    t.check(
        "waiter coalesces notifications",
        first && !second,
        "coalescing broken",
    );

    worker.disable();
    worker.disable();
    processor.disable();
    t.check("repeated disable is harmless", !worker.is_enabled(), "still enabled");
}

fn part_b_operation_waiters(t: &mut TestRunner) {
    t.section("Part B — Operation waiters");

    let ctx = RequestContainer::new("smoke completions", Phase::Completion);
    ctx.enable().unwrap();

    /* Completion before timeout: the timer must be disarmed. */
    let completed = Arc::new(AtomicUsize::new(0));
    let timed_out = Arc::new(AtomicUsize::new(0));
    let request = Request::new();
    let c = completed.clone();
    request
        .set_completion_handler(ctx.clone(), Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
    request.set_processing_handler(Box::new(|| {})).unwrap();
    request.process(true);

    let mut waiter = vlink_core::OperationWaiter::new(request.clone());
    let to = timed_out.clone();
    waiter
        .timeout(
            Duration::from_millis(200),
            Some(Box::new(move |_w| {
                to.fetch_add(1, Ordering::SeqCst);
            })),
            true,
            Some(ctx.clone()),
        )
        .unwrap();
    request.complete();
    let done = waiter.wait(true, Some(Duration::from_secs(10)));
    t.check("completion observed", done, "wait failed");

    /* Let the (canceled) timer interval pass. */
    let deadline = std::time::Instant::now() + Duration::from_millis(300);
    while std::time::Instant::now() < deadline {
        ctx.waiter()
            .wait_and_process(&[ctx.clone()], Some(Duration::from_millis(20)), 0, None);
    }
    t.check(
        "timer disarmed by completion",
        timed_out.load(Ordering::SeqCst) == 0 && completed.load(Ordering::SeqCst) == 1,
        "timeout handler fired",
    );

    /* Timeout before completion. */
    let timed_out = Arc::new(AtomicUsize::new(0));
    let request = Request::new();
    request
        .set_completion_handler(ctx.clone(), Box::new(|| {}))
        .unwrap();
    request.set_processing_handler(Box::new(|| {})).unwrap();
    request.process(true);
    let mut waiter = vlink_core::OperationWaiter::new(request.clone());
    let to = timed_out.clone();
    waiter
        .timeout(
            Duration::from_millis(30),
            Some(Box::new(move |_w| {
                to.fetch_add(1, Ordering::SeqCst);
            })),
            true,
            Some(ctx.clone()),
        )
        .unwrap();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while timed_out.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
        ctx.waiter()
            .wait_and_process(&[ctx.clone()], Some(Duration::from_millis(10)), 0, None);
    }
    t.check(
        "timeout fires on slow operation",
        timed_out.load(Ordering::SeqCst) == 1 && request.timed_out(),
        "no timeout",
    );
    request.complete_with(vlink_core::RequestStatus::Canceled);
    waiter.wait(true, Some(Duration::from_secs(10)));
    drop(waiter);

    ctx.disable();
}

fn part_c_file_streams(t: &mut TestRunner) {
    t.section("Part C — File streams");

    let processor = FileProcessor::new().unwrap();
    processor.enable().unwrap();
    let path = temp_path("stream");

    let stream = processor.open(&path, "w+", true).unwrap();
    t.check(
        "write round trip",
        write_sync(&stream, b"smoke payload") == IoResult::Ok,
        "write failed",
    );
    let (data, result) = read_sync(&stream, 64, Offset::At(0));
    t.check(
        "read returns written bytes",
        result == IoResult::Ok && data == b"smoke payload",
        "read mismatch",
    );

    let mut waiters = Vec::new();
    let order = Arc::new(Mutex::new(Vec::new()));
    let ctx = processor.completion_context();
    for i in 0..8u8 {
        let o = order.clone();
        waiters.push(stream.write_in(
            IoBuffer::new(vec![b'a' + i]),
            Offset::Auto,
            Box::new(move |_| {
                o.lock().unwrap().push(i);
            }),
            &ctx,
        ));
    }
    for waiter in &waiters {
        waiter.wait(false, Some(Duration::from_secs(10)));
    }
    drop(waiters);
    t.check(
        "writes complete in submission order",
        *order.lock().unwrap() == (0..8).collect::<Vec<_>>(),
        "order violated",
    );

    let close_waiter = stream.close();
    close_waiter.wait(true, Some(Duration::from_secs(10)));
    drop(close_waiter);
    t.check("close reached", stream.is_closed(), "not closed");
    t.check(
        "closed stream rejects writes",
        write_sync(&stream, b"nope") == IoResult::Closed,
        "write on closed stream",
    );

    drop(stream);
    processor.disable();
    let _ = std::fs::remove_file(&path);
}

fn part_d_file_locks(t: &mut TestRunner) {
    t.section("Part D — File locks");

    let processor = FileProcessor::new().unwrap();
    processor.enable().unwrap();
    let path = temp_path("lock");

    let m1 = processor.open(&path, "w", true).unwrap();
    let m2 = processor.open(&path, "r", true).unwrap();

    t.check("first lock acquired", lock_sync(&m1, None) == IoResult::Ok, "lock failed");
    t.check(
        "double lock refused",
        lock_sync(&m1, None) == IoResult::LockError,
        "double lock allowed",
    );
    t.check(
        "contended lock times out",
        lock_sync(&m2, Some(Duration::from_millis(100))) == IoResult::TimedOut,
        "no timeout",
    );
    t.check("lock released", unlock_sync(&m1) == IoResult::Ok, "unlock failed");
    t.check(
        "lock acquired after release",
        lock_sync(&m2, None) == IoResult::Ok,
        "second lock failed",
    );
    t.check("second release", unlock_sync(&m2) == IoResult::Ok, "unlock failed");

    drop(m1);
    drop(m2);
    processor.disable();
    let _ = std::fs::remove_file(&path);
}

fn main() {
    vlink_core::vprint::init();
    println!("=== vlink end-to-end smoke test ===");

    let mut t = TestRunner::new();
    part_a_pipeline(&mut t);
    part_b_operation_waiters(&mut t);
    part_c_file_streams(&mut t);
    part_d_file_locks(&mut t);

    std::process::exit(t.summary());
}
