//! Readiness watch table, private to the consumer thread.
//!
//! Maps a watched descriptor to its callback and derives the `pollfd` set the
//! run loop hands to the poller. A watch whose readiness has been observed
//! but whose dispatch task has not yet run is `pending` and is excluded from
//! the poll set, so a descriptor that stays readable across iterations fires
//! once per dispatch instead of storming the loop.
//!
//! Every watch carries a generation number. Dispatch tasks capture the
//! generation they were posted for; if the watch was removed (or removed and
//! re-added) in the meantime the stale dispatch is dropped on the floor.

use std::collections::HashMap;
use std::os::unix::io::RawFd;

use tracing::debug;

/// A watch callback. Invoked on the consumer thread, once per dispatched
/// readiness edge. `Send` because watches may be registered from any thread.
pub type WatchFn = Box<dyn FnMut() + Send + 'static>;

struct Watch {
    /// Taken out of the slot for the duration of an invocation so the
    /// callback may re-enter add/remove on the same table.
    callback: Option<WatchFn>,
    generation: u64,
    pending: bool,
}

pub(crate) struct WatchTable {
    watches: HashMap<RawFd, Watch>,
    pollfds: Vec<libc::pollfd>,
    stale: bool,
    next_generation: u64,
}

impl WatchTable {
    pub fn new() -> Self {
        WatchTable {
            watches: HashMap::new(),
            pollfds: Vec::new(),
            stale: true,
            next_generation: 0,
        }
    }

    /// Registers `callback` for `fd`. Watching a descriptor twice is a
    /// caller bug.
    pub fn add(&mut self, fd: RawFd, callback: WatchFn) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        let replaced = self.watches.insert(
            fd,
            Watch {
                callback: Some(callback),
                generation,
                pending: false,
            },
        );
        assert!(replaced.is_none(), "fd {fd} is already watched");
        debug!(fd, generation, "added fd watch");
        self.stale = true;
        generation
    }

    /// Drops the watch for `fd`. Removing an unknown descriptor is a caller
    /// bug.
    pub fn remove(&mut self, fd: RawFd) {
        let removed = self.watches.remove(&fd);
        assert!(removed.is_some(), "fd {fd} is not watched");
        debug!(fd, "removed fd watch");
        self.stale = true;
    }

    /// Marks `fd` pending so it leaves the poll set until its dispatch task
    /// runs. Returns the generation to stamp on the dispatch task.
    pub fn set_pending(&mut self, fd: RawFd) -> Option<u64> {
        let watch = self.watches.get_mut(&fd)?;
        watch.pending = true;
        self.stale = true;
        Some(watch.generation)
    }

    /// Begins dispatching the watch posted for (`fd`, `generation`): clears
    /// `pending`, re-admits the descriptor to the poll set, and hands out the
    /// callback. Returns `None` if the watch is gone or was replaced.
    pub fn begin_dispatch(&mut self, fd: RawFd, generation: u64) -> Option<WatchFn> {
        let watch = self.watches.get_mut(&fd)?;
        if watch.generation != generation {
            return None;
        }
        watch.pending = false;
        self.stale = true;
        watch.callback.take()
    }

    /// Returns the callback after an invocation, unless the callback removed
    /// its own watch (entry gone) or re-added the descriptor (generation
    /// moved on), in which case the old callback is dropped.
    pub fn finish_dispatch(&mut self, fd: RawFd, generation: u64, callback: WatchFn) {
        if let Some(watch) = self.watches.get_mut(&fd) {
            if watch.generation == generation && watch.callback.is_none() {
                watch.callback = Some(callback);
            }
        }
    }

    /// The poll set: the wake descriptor first, then every non-pending
    /// watch. Rebuilt only when the table changed since the last call.
    pub fn pollfds(&mut self, wake_fd: RawFd) -> &mut [libc::pollfd] {
        if self.stale {
            self.pollfds.clear();
            self.pollfds.push(libc::pollfd {
                fd: wake_fd,
                events: libc::POLLIN,
                revents: 0,
            });
            for (&fd, watch) in &self.watches {
                if !watch.pending && watch.callback.is_some() {
                    self.pollfds.push(libc::pollfd {
                        fd,
                        events: libc::POLLIN,
                        revents: 0,
                    });
                }
            }
            self.stale = false;
        } else {
            for pollfd in &mut self.pollfds {
                pollfd.revents = 0;
            }
        }
        &mut self.pollfds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_remove_rebuild_the_poll_set() {
        let mut table = WatchTable::new();
        assert_eq!(table.pollfds(99).len(), 1);
        table.add(5, Box::new(|| {}));
        table.add(6, Box::new(|| {}));
        assert_eq!(table.pollfds(99).len(), 3);
        table.remove(5);
        let fds: Vec<_> = table.pollfds(99).iter().map(|p| p.fd).collect();
        assert_eq!(fds.len(), 2);
        assert_eq!(fds[0], 99);
        assert!(fds.contains(&6));
    }

    #[test]
    #[should_panic(expected = "already watched")]
    fn duplicate_watch_panics() {
        let mut table = WatchTable::new();
        table.add(5, Box::new(|| {}));
        table.add(5, Box::new(|| {}));
    }

    #[test]
    #[should_panic(expected = "not watched")]
    fn removing_unknown_watch_panics() {
        let mut table = WatchTable::new();
        table.remove(5);
    }

    #[test]
    fn pending_watch_leaves_the_poll_set_until_dispatched() {
        let mut table = WatchTable::new();
        let generation = table.add(5, Box::new(|| {}));
        assert_eq!(table.pollfds(99).len(), 2);

        assert_eq!(table.set_pending(5), Some(generation));
        assert_eq!(table.pollfds(99).len(), 1);

        let callback = table.begin_dispatch(5, generation).unwrap();
        table.finish_dispatch(5, generation, callback);
        assert_eq!(table.pollfds(99).len(), 2);
    }

    #[test]
    fn stale_generation_dispatch_is_dropped() {
        let mut table = WatchTable::new();
        let old = table.add(5, Box::new(|| {}));
        table.remove(5);
        assert!(table.begin_dispatch(5, old).is_none());

        // Re-added watch gets a new generation; the stale dispatch still
        // misses.
        let new = table.add(5, Box::new(|| {}));
        assert_ne!(old, new);
        assert!(table.begin_dispatch(5, old).is_none());
    }

    #[test]
    fn callback_removed_during_dispatch_is_not_restored() {
        let mut table = WatchTable::new();
        let generation = table.add(5, Box::new(|| {}));
        table.set_pending(5);
        let callback = table.begin_dispatch(5, generation).unwrap();
        table.remove(5);
        table.finish_dispatch(5, generation, callback);
        assert!(table.begin_dispatch(5, generation).is_none());
        assert_eq!(table.pollfds(99).len(), 1);
    }
}
