//! Overflow and reclamation stress: many producers push far more tasks than
//! one slab holds while the consumer drains and recycles slabs underneath
//! them. Run under a memory-safety sanitizer in CI; the assertions here check
//! exact delivery counts and per-producer FIFO.

#![cfg(unix)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

use spool::TaskRunner;

// Slab capacity is 512; ten slabs' worth per producer forces repeated
// overflow, tail races, and reclamation of drained slabs mid-run.
const PRODUCERS: usize = 8;
const PER_PRODUCER: usize = 5120;

#[test]
fn overflow_under_contention_loses_nothing() {
    let runner = TaskRunner::new().unwrap();
    let delivered = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(PRODUCERS));

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|_| {
            let poster = runner.clone();
            let delivered = Arc::clone(&delivered);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for _ in 0..PER_PRODUCER {
                    let delivered = Arc::clone(&delivered);
                    poster.post_task(move || {
                        delivered.fetch_add(1, Ordering::Relaxed);
                    });
                }
            })
        })
        .collect();

    for producer in producers {
        producer.join().unwrap();
    }
    let stopper = runner.clone();
    runner.post_task(move || stopper.quit());

    runner.run();
    assert_eq!(delivered.load(Ordering::Relaxed), PRODUCERS * PER_PRODUCER);
    assert!(runner.is_idle_for_testing());
}

#[test]
fn per_producer_order_survives_contention() {
    let runner = TaskRunner::new().unwrap();
    let logs: Vec<_> = (0..PRODUCERS)
        .map(|_| Arc::new(Mutex::new(Vec::new())))
        .collect();
    let start = Arc::new(Barrier::new(PRODUCERS));

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let poster = runner.clone();
            let log = Arc::clone(&logs[producer]);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for seq in 0..PER_PRODUCER {
                    let log = Arc::clone(&log);
                    poster.post_task(move || log.lock().unwrap().push(seq));
                }
            })
        })
        .collect();

    for producer in producers {
        producer.join().unwrap();
    }
    let stopper = runner.clone();
    runner.post_task(move || stopper.quit());

    runner.run();
    for log in &logs {
        let log = log.lock().unwrap();
        assert_eq!(log.len(), PER_PRODUCER);
        assert!(
            log.windows(2).all(|w| w[0] < w[1]),
            "tasks from one producer popped out of order"
        );
    }
}

#[test]
fn concurrent_posting_while_consumer_drains() {
    let runner = TaskRunner::new().unwrap();
    let delivered = Arc::new(AtomicUsize::new(0));
    let total = PRODUCERS * PER_PRODUCER;

    // Producers race the running loop instead of finishing first, so slabs
    // are reclaimed while the tail is still moving.
    let producers: Vec<_> = (0..PRODUCERS)
        .map(|_| {
            let poster = runner.clone();
            let delivered = Arc::clone(&delivered);
            thread::spawn(move || {
                for _ in 0..PER_PRODUCER {
                    let delivered = Arc::clone(&delivered);
                    poster.post_task(move || {
                        delivered.fetch_add(1, Ordering::Relaxed);
                    });
                }
            })
        })
        .collect();

    let watchdog = runner.clone();
    let observed = Arc::clone(&delivered);
    fn poll_done(runner: &TaskRunner, observed: &Arc<AtomicUsize>, total: usize) {
        if observed.load(Ordering::Relaxed) == total {
            runner.quit();
        } else {
            let runner_again = runner.clone();
            let observed_again = Arc::clone(observed);
            runner.post_delayed_task(
                move || poll_done(&runner_again, &observed_again, total),
                1,
            );
        }
    }
    runner.post_task(move || poll_done(&watchdog, &observed, total));

    runner.run();
    for producer in producers {
        producer.join().unwrap();
    }
    assert_eq!(delivered.load(Ordering::Relaxed), total);
}
