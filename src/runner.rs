//! The task runner: a single-consumer event loop fed by many producers.
//!
//! One thread (the one that created the runner) calls [`TaskRunner::run`] and
//! executes every task and watch callback. Any thread may post work. The only
//! cross-thread-mutated state is the lock-free slab chain, the refcount
//! table, and the wake channel; everything else — the delayed-task queue, the
//! watch table, the quit flag, the test clock offset — belongs to the
//! consumer thread alone. Cross-thread calls that would touch consumer state
//! (`post_delayed_task`, `add_fd_watch`, `remove_fd_watch`, `quit`) forward
//! themselves as posted tasks instead of locking: message passing in place of
//! a mutex.
//!
//! # Fairness
//!
//! Each loop iteration pops at most one immediate task and one due timer
//! before returning to the poller, so immediates, timers, and fd readiness
//! interleave and none can starve the others. A runner with a full slab of
//! immediate work still services a due timer every iteration.

use std::cell::UnsafeCell;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use tracing::trace_span;

use crate::chain::TaskChain;
use crate::delay::DelayQueue;
use crate::poller;
use crate::slab::Task;
use crate::wake::WakeChannel;
use crate::watch::{WatchFn, WatchTable};
use crate::Error;

struct Inner {
    chain: TaskChain,
    wake: WakeChannel,
    consumer: ThreadId,
    // Consumer-thread-only state. Never touched off-thread; off-thread API
    // calls are forwarded as posted tasks, which preserves the single-writer
    // invariant without any lock.
    delayed: UnsafeCell<DelayQueue>,
    watches: UnsafeCell<WatchTable>,
    quit: UnsafeCell<bool>,
    time_offset: UnsafeCell<Duration>,
}

// The `UnsafeCell` fields are only ever accessed from the thread recorded in
// `consumer`; the remaining fields are thread-safe by construction.
unsafe impl Send for Inner {}
unsafe impl Sync for Inner {}

impl Inner {
    #[inline]
    fn on_consumer(&self) -> bool {
        thread::current().id() == self.consumer
    }

    fn assert_consumer(&self, operation: &str) {
        assert!(
            self.on_consumer(),
            "{operation} must be called on the task runner thread"
        );
    }

    /// Current time as the run loop sees it, including any test-injected
    /// advance. Consumer thread only.
    fn now(&self) -> Instant {
        Instant::now() + unsafe { *self.time_offset.get() }
    }
}

/// Cheaply cloneable handle to a single-consumer task runner.
///
/// Created on the thread that will drive it; that thread calls [`run`]
/// (`TaskRunner::run`) while any number of other threads post work through
/// clones of the handle.
pub struct TaskRunner {
    inner: Arc<Inner>,
}

impl Clone for TaskRunner {
    fn clone(&self) -> Self {
        TaskRunner {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl TaskRunner {
    /// Creates a runner bound to the calling thread as its consumer.
    pub fn new() -> Result<TaskRunner, Error> {
        Ok(TaskRunner {
            inner: Arc::new(Inner {
                chain: TaskChain::new(),
                wake: WakeChannel::new().map_err(Error::WakeChannel)?,
                consumer: thread::current().id(),
                delayed: UnsafeCell::new(DelayQueue::new()),
                watches: UnsafeCell::new(WatchTable::new()),
                quit: UnsafeCell::new(false),
                time_offset: UnsafeCell::new(Duration::ZERO),
            }),
        })
    }

    /// Posts a task for execution on the runner thread. Never blocks; wakes
    /// the consumer when called from another thread.
    pub fn post_task(&self, f: impl FnOnce() + Send + 'static) {
        self.post_boxed(Box::new(f));
    }

    fn post_boxed(&self, task: Task) {
        self.inner.chain.post(task);
        if !self.inner.on_consumer() {
            self.inner.wake.wake();
        }
    }

    /// Posts a task to run once `delay_ms` milliseconds have elapsed.
    /// Equal-delay tasks run in posting order.
    pub fn post_delayed_task(&self, f: impl FnOnce() + Send + 'static, delay_ms: u32) {
        self.post_delayed_boxed(Box::new(f), delay_ms);
    }

    fn post_delayed_boxed(&self, task: Task, delay_ms: u32) {
        if !self.inner.on_consumer() {
            // The delayed queue is consumer-only; bounce the request over as
            // an immediate task instead of synchronizing the queue.
            let runner = self.clone();
            self.post_boxed(Box::new(move || runner.post_delayed_boxed(task, delay_ms)));
            return;
        }
        let due = self.inner.now() + Duration::from_millis(u64::from(delay_ms));
        unsafe { (*self.inner.delayed.get()).push(due, task) };
    }

    /// Invokes `f` on the runner thread whenever `fd` becomes readable.
    /// Exactly one watch per descriptor; duplicates are a caller bug.
    pub fn add_fd_watch(&self, fd: RawFd, f: impl FnMut() + Send + 'static) {
        self.add_watch_boxed(fd, Box::new(f));
    }

    fn add_watch_boxed(&self, fd: RawFd, callback: WatchFn) {
        if !self.inner.on_consumer() {
            let runner = self.clone();
            self.post_boxed(Box::new(move || runner.add_watch_boxed(fd, callback)));
            return;
        }
        unsafe { (*self.inner.watches.get()).add(fd, callback) };
    }

    /// Stops watching `fd`. Removing a descriptor that is not watched is a
    /// caller bug.
    pub fn remove_fd_watch(&self, fd: RawFd) {
        if !self.inner.on_consumer() {
            let runner = self.clone();
            self.post_boxed(Box::new(move || runner.remove_fd_watch(fd)));
            return;
        }
        unsafe { (*self.inner.watches.get()).remove(fd) };
    }

    /// Requests the loop to stop. Tasks already queued are not retracted;
    /// they are destroyed unrun when the runner is dropped. A quit observed
    /// mid-iteration still lets the current task finish.
    pub fn quit(&self) {
        if !self.inner.on_consumer() {
            let runner = self.clone();
            self.post_boxed(Box::new(move || runner.quit()));
            return;
        }
        unsafe { *self.inner.quit.get() = true };
    }

    /// Whether the calling thread is the one that executes posted tasks.
    pub fn runs_tasks_on_current_thread(&self) -> bool {
        self.inner.on_consumer()
    }

    /// Drives the loop until [`quit`](Self::quit) is observed. May be called
    /// again after it returns.
    pub fn run(&self) {
        self.inner.assert_consumer("run");
        unsafe { *self.inner.quit.get() = false };
        let wake_fd = self.inner.wake.poll_fd();
        let mut ready: Vec<RawFd> = Vec::new();

        loop {
            if unsafe { *self.inner.quit.get() } {
                return;
            }

            // At most one immediate and one due timer per iteration.
            let immediate = unsafe { self.inner.chain.try_pop() };
            let now = self.inner.now();
            let (delayed, timeout) = {
                let queue = unsafe { &mut *self.inner.delayed.get() };
                let delayed = queue.pop_due(now);
                let timeout = if immediate.is_some() || delayed.is_some() {
                    // Something is about to run; come straight back.
                    Some(Duration::ZERO)
                } else {
                    queue
                        .next_due()
                        .map(|due| due.saturating_duration_since(now))
                };
                (delayed, timeout)
            };

            ready.clear();
            {
                let watches = unsafe { &mut *self.inner.watches.get() };
                let pollfds = watches.pollfds(wake_fd);
                if poller::wait(pollfds, timeout) > 0 {
                    ready.extend(
                        pollfds
                            .iter()
                            .filter(|pollfd| pollfd.revents != 0)
                            .map(|pollfd| pollfd.fd),
                    );
                }
            }

            for &fd in &ready {
                if fd == wake_fd {
                    // Cleared inline; user code never runs for the wake fd.
                    self.inner.wake.clear();
                    continue;
                }
                let generation =
                    unsafe { (*self.inner.watches.get()).set_pending(fd) };
                if let Some(generation) = generation {
                    let runner = self.clone();
                    self.inner
                        .chain
                        .post(Box::new(move || runner.run_fd_watch(fd, generation)));
                }
            }

            if let Some(task) = immediate {
                self.run_task(task);
            }
            if let Some(task) = delayed {
                self.run_task(task);
            }
        }
    }

    /// Dispatch task body for a readiness edge on `fd`. Runs on the consumer
    /// thread; tolerates the watch having been removed or replaced since the
    /// edge was observed.
    fn run_fd_watch(&self, fd: RawFd, generation: u64) {
        let callback = {
            let watches = unsafe { &mut *self.inner.watches.get() };
            watches.begin_dispatch(fd, generation)
        };
        let Some(mut callback) = callback else {
            return;
        };
        // No table borrow is live here: the callback may add or remove
        // watches on this same runner.
        callback();
        let watches = unsafe { &mut *self.inner.watches.get() };
        watches.finish_dispatch(fd, generation, callback);
    }

    /// Every task and callback funnels through here so an external watchdog
    /// can observe entry and exit of each invocation.
    fn run_task(&self, task: Task) {
        let _span = trace_span!("run_task").entered();
        task();
    }

    /// True iff no posted immediate task anywhere in the slab chain is still
    /// unread. Timers and watches do not count. Consumer thread only.
    pub fn is_idle_for_testing(&self) -> bool {
        self.inner.assert_consumer("is_idle_for_testing");
        !unsafe { self.inner.chain.has_unread() }
    }

    /// Shifts the loop's notion of "now" forward by `ms` milliseconds so
    /// timer tests need not sleep. Consumer thread only.
    pub fn advance_time_for_testing(&self, ms: u64) {
        self.inner.assert_consumer("advance_time_for_testing");
        unsafe { *self.inner.time_offset.get() += Duration::from_millis(ms) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn runs_tasks_on_current_thread_tracks_creator() {
        let runner = TaskRunner::new().unwrap();
        assert!(runner.runs_tasks_on_current_thread());
        let handle = runner.clone();
        thread::spawn(move || {
            assert!(!handle.runs_tasks_on_current_thread());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn quit_posted_from_consumer_stops_run() {
        let runner = TaskRunner::new().unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let observed = Arc::clone(&ran);
        let stopper = runner.clone();
        runner.post_task(move || {
            observed.store(true, Ordering::Relaxed);
            stopper.quit();
        });
        runner.run();
        assert!(ran.load(Ordering::Relaxed));
        assert!(runner.is_idle_for_testing());
    }

    #[test]
    fn quit_from_other_thread_is_forwarded() {
        let runner = TaskRunner::new().unwrap();
        let handle = runner.clone();
        let quitter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            handle.quit();
        });
        runner.run();
        quitter.join().unwrap();
    }

    #[test]
    fn run_can_be_reentered_after_quit() {
        let runner = TaskRunner::new().unwrap();
        let stopper = runner.clone();
        runner.post_task(move || stopper.quit());
        runner.run();

        let ran = Arc::new(AtomicBool::new(false));
        let observed = Arc::clone(&ran);
        let stopper = runner.clone();
        runner.post_task(move || {
            observed.store(true, Ordering::Relaxed);
            stopper.quit();
        });
        runner.run();
        assert!(ran.load(Ordering::Relaxed));
    }

    #[test]
    fn posting_marks_runner_busy_until_drained() {
        let runner = TaskRunner::new().unwrap();
        assert!(runner.is_idle_for_testing());
        let stopper = runner.clone();
        runner.post_task(move || stopper.quit());
        assert!(!runner.is_idle_for_testing());
        runner.run();
        assert!(runner.is_idle_for_testing());
    }
}
