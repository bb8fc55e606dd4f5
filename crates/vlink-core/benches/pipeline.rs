//! Request pipeline round-trip throughput.

use criterion::{criterion_group, criterion_main, Criterion};

use std::sync::Arc;
use std::time::Duration;

use vlink_core::{Phase, Request, RequestContainer, RequestWorker};

fn bench_submit_complete(c: &mut Criterion) {
    let processor = RequestContainer::new("bench", Phase::Processor);
    processor.enable().unwrap();
    let worker = RequestWorker::new("bench", vec![processor.clone()]);
    worker.enable().unwrap();

    c.bench_function("request_round_trip", |b| {
        b.iter(|| {
            let request = Request::new();
            let r = request.clone();
            request
                .set_processing_handler(Box::new(move || r.complete()))
                .unwrap();
            processor.submit(request.clone());
            request.wait_done(false, Some(Duration::from_secs(10)));
        })
    });

    c.bench_function("request_batch_64", |b| {
        b.iter(|| {
            let requests: Vec<Arc<Request>> = (0..64)
                .map(|_| {
                    let request = Request::new();
                    let r = request.clone();
                    request
                        .set_processing_handler(Box::new(move || r.complete()))
                        .unwrap();
                    request
                })
                .collect();
            for request in &requests {
                processor.submit(request.clone());
            }
            for request in &requests {
                request.wait_done(false, Some(Duration::from_secs(10)));
            }
        })
    });

    worker.disable();
    processor.disable();
}

criterion_group!(benches, bench_submit_complete);
criterion_main!(benches);
