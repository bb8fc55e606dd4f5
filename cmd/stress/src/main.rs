//! Stress test — many submitters, one pipeline.
//!
//! Hammers a worker-backed processor container from several producer
//! threads and verifies the exactly-once completion contract under load.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use vlink_core::{Phase, Request, RequestContainer, RequestWorker};

fn main() {
    println!("=== vlink pipeline stress test ===\n");

    let num_requests: usize = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(100_000);
    let num_producers: usize = std::env::args()
        .nth(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or(8);

    println!(
        "Submitting {} requests from {} producer threads...",
        num_requests, num_producers
    );

    let processor = RequestContainer::new("stress processor", Phase::Processor);
    processor.enable().unwrap();
    let worker = RequestWorker::new("stress", vec![processor.clone()]);
    worker.enable().unwrap();

    let processed = Arc::new(AtomicU64::new(0));
    let completed = Arc::new(AtomicU64::new(0));

    let start = Instant::now();
    let per_producer = num_requests / num_producers;
    let mut handles = Vec::new();
    for _ in 0..num_producers {
        let processor = processor.clone();
        let worker_ctx = worker.completion_context();
        let processed = processed.clone();
        let completed = completed.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..per_producer {
                let request = Request::new();
                let r = request.clone();
                let p = processed.clone();
                request
                    .set_processing_handler(Box::new(move || {
                        p.fetch_add(1, Ordering::Relaxed);
                        r.complete();
                    }))
                    .unwrap();
                let c = completed.clone();
                request
                    .set_completion_handler(worker_ctx.clone(), Box::new(move || {
                        c.fetch_add(1, Ordering::Relaxed);
                    }))
                    .unwrap();
                processor.submit(request);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    let submit_time = start.elapsed();
    println!("Submit time: {:?}", submit_time);

    let expected = (per_producer * num_producers) as u64;
    let run_start = Instant::now();
    loop {
        let done = completed.load(Ordering::Relaxed);
        if done >= expected {
            break;
        }
        if run_start.elapsed().as_secs() > 60 {
            println!("Timeout! Only {}/{} completed", done, expected);
            std::process::exit(1);
        }
        thread::sleep(Duration::from_millis(5));
    }
    let total_time = start.elapsed();

    worker.disable();
    processor.disable();

    let final_processed = processed.load(Ordering::Relaxed);
    let final_completed = completed.load(Ordering::Relaxed);
    println!("\nProcessed: {}", final_processed);
    println!("Completed: {}", final_completed);
    println!("Total time: {:?}", total_time);
    println!(
        "Throughput: {:.0} requests/sec",
        expected as f64 / total_time.as_secs_f64()
    );

    if final_processed != expected || final_completed != expected {
        println!("FAIL: exactly-once contract violated");
        std::process::exit(1);
    }
    println!("\nOK: every request processed and completed exactly once");
}
