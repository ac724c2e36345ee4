//! Lock-free multi-producer / single-consumer task runner.
//!
//! Many threads enqueue closures and timers; one dedicated thread executes
//! them, without any producer ever blocking on a mutex to post work.
//!
//! # Architecture
//!
//! ```text
//!  producers (any thread)                 consumer (one thread)
//!  ──────────────────────                 ─────────────────────
//!  post_task ──► slab chain ───────────►  run loop: pop ≤1 task
//!                (tail CAS,               │          pop ≤1 timer
//!                 written bitmaps)        │          poll(wake + watches)
//!  post_delayed_task ─┐                   │          run popped work
//!  add_fd_watch ──────┼─ forwarded as ──► │
//!  remove_fd_watch ───┤  posted tasks     ├─ delayed queue (min-heap)
//!  quit ──────────────┘                   ├─ watch table (fd → callback)
//!                                         └─ wake channel (eventfd/pipe)
//! ```
//!
//! Producers claim a slot in the tail slab with a relaxed fetch-add and
//! publish it with a release-store into a bitmap; the consumer acquire-loads
//! the bitmap and moves tasks out oldest-slab-first. That one release/acquire
//! pair per slot is the entire producer/consumer synchronization.
//!
//! # Guarantees
//!
//! - Tasks posted by one thread run in the order they were posted.
//! - Every task posted before `quit` is popped at most once and never lost
//!   while the loop is driven; tasks still queued when the runner drops are
//!   destroyed without running.
//! - Timers with equal deadlines run in posting order.
//! - Immediate tasks, timers, and fd watches interleave one-per-iteration,
//!   so none starves the others.
//!
//! There is deliberately *no* cross-thread total order: two tasks posted by
//! unrelated threads may pop in either order. A mutex-protected queue would
//! give a global FIFO; this design trades that for wait-free posting.
//!
//! # Failure policy
//!
//! Contract violations (double-watching a descriptor, removing an unknown
//! watch, driving the loop from the wrong thread) and unrecoverable OS
//! failures (a broken `poll`) abort via panic: this is an in-process
//! foundation, not a fault-tolerant service surface. The only `Result` in
//! the API is construction, where the wake channel descriptor is allocated.

#![cfg(unix)]

mod bits;
mod chain;
mod delay;
mod poller;
mod runner;
mod slab;
mod wake;
mod watch;

pub use runner::TaskRunner;
pub use slab::Task;
pub use watch::WatchFn;

/// Errors surfaced while constructing a [`TaskRunner`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The wake channel descriptor could not be created.
    #[error("failed to create wake channel: {0}")]
    WakeChannel(#[source] std::io::Error),
}
