//! Post/drain throughput of the runner under single- and multi-producer load.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use spool::TaskRunner;

fn drain(runner: &TaskRunner, expected: usize, counter: &Arc<AtomicUsize>) {
    let stopper = runner.clone();
    let observed = Arc::clone(counter);
    fn check(runner: &TaskRunner, observed: &Arc<AtomicUsize>, expected: usize) {
        if observed.load(Ordering::Relaxed) >= expected {
            runner.quit();
        } else {
            let runner_again = runner.clone();
            let observed_again = Arc::clone(observed);
            runner.post_task(move || check(&runner_again, &observed_again, expected));
        }
    }
    runner.post_task(move || check(&stopper, &observed, expected));
    runner.run();
}

fn single_producer(c: &mut Criterion) {
    let mut group = c.benchmark_group("single_producer");
    for &tasks in &[1_000usize, 100_000] {
        group.throughput(Throughput::Elements(tasks as u64));
        group.bench_with_input(BenchmarkId::from_parameter(tasks), &tasks, |b, &tasks| {
            b.iter(|| {
                let runner = TaskRunner::new().unwrap();
                let counter = Arc::new(AtomicUsize::new(0));
                for _ in 0..tasks {
                    let counter = Arc::clone(&counter);
                    runner.post_task(move || {
                        counter.fetch_add(1, Ordering::Relaxed);
                    });
                }
                drain(&runner, tasks, &counter);
            });
        });
    }
    group.finish();
}

fn contended_producers(c: &mut Criterion) {
    let mut group = c.benchmark_group("contended_producers");
    for &threads in &[2usize, 8] {
        let per_thread = 20_000usize;
        group.throughput(Throughput::Elements((threads * per_thread) as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(threads),
            &threads,
            |b, &threads| {
                b.iter(|| {
                    let runner = TaskRunner::new().unwrap();
                    let counter = Arc::new(AtomicUsize::new(0));
                    let producers: Vec<_> = (0..threads)
                        .map(|_| {
                            let poster = runner.clone();
                            let counter = Arc::clone(&counter);
                            thread::spawn(move || {
                                for _ in 0..per_thread {
                                    let counter = Arc::clone(&counter);
                                    poster.post_task(move || {
                                        counter.fetch_add(1, Ordering::Relaxed);
                                    });
                                }
                            })
                        })
                        .collect();
                    drain(&runner, threads * per_thread, &counter);
                    for producer in producers {
                        producer.join().unwrap();
                    }
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, single_producer, contended_producers);
criterion_main!(benches);
