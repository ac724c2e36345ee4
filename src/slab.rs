//! Fixed-capacity slab of task slots shared between producers and the
//! consumer.
//!
//! A `Slab` holds `SLAB_CAP` slots. Producers claim a slot index with a
//! relaxed fetch-add on `next_slot`, move the task into the slot, and then
//! publish it by setting the matching bit of the `written` bitmap with
//! release ordering. The consumer acquire-loads `written`, diffs it against
//! its private `read` bitmap, and moves tasks out lowest-index-first. That
//! single release/acquire pair per slot is the only synchronization between
//! the two sides; no lock is ever taken.
//!
//! Claim order is deliberately decoupled from publish order: the fetch-add
//! only reserves an index, and relaxed ordering suffices because a slot is
//! invisible to the consumer until its `written` bit lands.
//!
//! A claim that returns an index at or past `SLAB_CAP` is the overflow
//! signal; the caller must chain a fresh slab instead of writing here (see
//! `chain`). `prev` links a slab to its chronologically older neighbor and is
//! written exactly once, by the producer that allocated the slab, before the
//! slab becomes reachable.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::bits;

/// Slots per slab. Power of two so the bitmap math stays shift-and-mask.
pub(crate) const SLAB_CAP: usize = 512;
/// Number of `u64` words backing each bitmap.
pub(crate) const SLAB_WORDS: usize = SLAB_CAP / 64;

/// An owned, move-only, zero-argument callable. Consumed exactly once.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct Slab {
    /// Monotonic claim cursor. May run past `SLAB_CAP`; that is the overflow
    /// signal, not an error.
    next_slot: CachePadded<AtomicUsize>,
    /// One bit per slot, set with release ordering once the task is in place.
    written: [AtomicU64; SLAB_WORDS],
    /// Consumer-private mirror of `written`: bits for slots already popped.
    read: UnsafeCell<[u64; SLAB_WORDS]>,
    /// Task storage. A slot is initialized iff its `written` bit is set and
    /// its `read` bit is clear.
    tasks: [UnsafeCell<MaybeUninit<Task>>; SLAB_CAP],
    /// Link to the chronologically previous slab. Written once by the
    /// allocating producer before the slab is reachable; thereafter touched
    /// only by the consumer.
    prev: AtomicPtr<Slab>,
}

// Access discipline, not the type system, partitions this struct: `written`
// and `tasks` are the cross-thread surface (guarded by the claim/publish
// protocol), `read` is consumer-only, `prev` is single-writer-then-consumer.
unsafe impl Send for Slab {}
unsafe impl Sync for Slab {}

impl Slab {
    pub fn boxed() -> Box<Slab> {
        Box::new(Slab {
            next_slot: CachePadded::new(AtomicUsize::new(0)),
            written: std::array::from_fn(|_| AtomicU64::new(0)),
            read: UnsafeCell::new([0; SLAB_WORDS]),
            tasks: std::array::from_fn(|_| UnsafeCell::new(MaybeUninit::uninit())),
            prev: AtomicPtr::new(ptr::null_mut()),
        })
    }

    /// Reserves the next slot index. An index `>= SLAB_CAP` means this slab
    /// is exhausted and the caller must move to a fresh tail.
    #[inline(always)]
    pub fn claim(&self) -> usize {
        self.next_slot.fetch_add(1, Ordering::Relaxed)
    }

    /// Moves `task` into slot `index` and publishes it.
    ///
    /// # Safety
    ///
    /// `index` must have been returned by [`claim`](Self::claim) on this slab
    /// by the calling producer, must be `< SLAB_CAP`, and must not have been
    /// published before.
    #[inline]
    pub unsafe fn publish(&self, index: usize, task: Task) {
        debug_assert!(index < SLAB_CAP);
        unsafe { (*self.tasks[index].get()).write(task) };
        let was_clear = bits::publish(&self.written[index / 64], index % 64);
        debug_assert!(was_clear, "slot {index} published twice");
    }

    /// Pops the lowest-index published-but-unread task, if any.
    ///
    /// # Safety
    ///
    /// Consumer thread only: mutates the private `read` bitmap.
    pub unsafe fn try_pop(&self) -> Option<Task> {
        let read = unsafe { &mut *self.read.get() };
        for word in 0..SLAB_WORDS {
            let written = self.written[word].load(Ordering::Acquire);
            if let Some(bit) = bits::lowest_unread(written, read[word]) {
                read[word] |= 1 << bit;
                let index = word * 64 + bit;
                // The acquire load above observed the written bit, so the
                // release store in `publish` ordered the task write before us.
                let task = unsafe { (*self.tasks[index].get()).assume_init_read() };
                return Some(task);
            }
        }
        None
    }

    /// Whether any published task is still unread.
    ///
    /// # Safety
    ///
    /// Consumer thread only: reads the private `read` bitmap.
    pub unsafe fn has_unread(&self) -> bool {
        let read = unsafe { &*self.read.get() };
        (0..SLAB_WORDS)
            .any(|word| self.written[word].load(Ordering::Acquire) & !read[word] != 0)
    }

    /// Whether every written bit has been read. Note this says nothing about
    /// claimed-but-unpublished slots; the chain's refcount check covers those
    /// (a producer holds its bucket for the whole claim-to-publish window).
    ///
    /// # Safety
    ///
    /// Consumer thread only: reads the private `read` bitmap.
    pub unsafe fn is_drained(&self) -> bool {
        let read = unsafe { &*self.read.get() };
        (0..SLAB_WORDS).all(|word| self.written[word].load(Ordering::Acquire) == read[word])
    }

    #[inline]
    pub fn prev(&self) -> *mut Slab {
        self.prev.load(Ordering::Acquire)
    }

    /// Links this slab to the previous tail. Called by the allocating
    /// producer before the tail CAS makes the slab reachable.
    #[inline]
    pub fn set_prev(&self, prev: *mut Slab) {
        self.prev.store(prev, Ordering::Release);
    }

    /// Splices this slab out of the chain. Consumer only.
    #[inline]
    pub fn clear_prev(&self) {
        self.prev.store(ptr::null_mut(), Ordering::Release);
    }

    /// Returns a drained slab to its freshly-allocated state so it can be
    /// reused. Exclusive access makes every field plain data here.
    pub fn reset(&mut self) {
        debug_assert!(
            (0..SLAB_WORDS).all(|w| *self.written[w].get_mut() == self.read.get_mut()[w]),
            "resetting a slab with unread tasks"
        );
        *self.next_slot.get_mut() = 0;
        for word in &mut self.written {
            *word.get_mut() = 0;
        }
        self.read.get_mut().fill(0);
        *self.prev.get_mut() = ptr::null_mut();
    }
}

impl Drop for Slab {
    fn drop(&mut self) {
        // Destroy published-but-unread tasks without running them. Slots that
        // were claimed but never published hold no task.
        let read = *self.read.get_mut();
        for word in 0..SLAB_WORDS {
            let mut pending = *self.written[word].get_mut() & !read[word];
            while pending != 0 {
                let bit = pending.trailing_zeros() as usize;
                pending &= pending - 1;
                unsafe { self.tasks[word * 64 + bit].get_mut().assume_init_drop() };
            }
        }
    }
}
