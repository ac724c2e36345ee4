//! The slab chain: an atomically-swapped tail plus backward `prev` links.
//!
//! # Architecture
//!
//! ```text
//!                    tail (AtomicPtr)
//!                         │
//!                         ▼
//!   [oldest] ◀─prev─ [ ... ] ◀─prev─ [newest]
//!      ▲                                 ▲
//!      │                                 │
//!   consumer pops here            producers claim here
//! ```
//!
//! Producers only ever touch the slab behind the tail pointer. When a claim
//! overflows, the claiming producer allocates a fresh slab, links it to the
//! old tail, self-reserves slot 0, and installs it with a single CAS. Losers
//! recycle their slab and retry against the newer tail; the retry loop is
//! bounded in the sense that every failure observes forward progress by
//! someone else.
//!
//! The consumer walks `prev` links oldest-first so pops preserve FIFO across
//! slabs, and is the only thread that ever unlinks or frees a slab.
//!
//! # Reclamation
//!
//! A non-tail slab may be freed only when all three hold:
//!
//! 1. drained: every `written` word equals the consumer's `read` word,
//! 2. linked: its successor's `prev` still points at it,
//! 3. unreferenced: its refcount bucket reads zero.
//!
//! The refcount table is a small fixed array of counters hashed by slab
//! address. A producer increments the bucket for a tail pointer it loaded,
//! then re-checks that the pointer is still the tail before dereferencing;
//! if the tail moved it backs out and retries. The re-validation closes the
//! window where the consumer frees a slab between the producer's tail load
//! and its bucket increment. Hash collisions merely defer reclamation; they
//! can never cause a premature free.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;
use tracing::{debug, trace};

use crate::slab::{Slab, Task, SLAB_CAP};

/// Refcount buckets. Power of two; collisions only delay reclamation.
const REF_BUCKETS: usize = 64;
/// Slabs are heap allocations comfortably past this alignment, so the low
/// bits carry no entropy.
const REF_HASH_SHIFT: usize = 6;

pub(crate) struct TaskChain {
    tail: CachePadded<AtomicPtr<Slab>>,
    /// One-slot free list: the most recently reclaimed slab, kept warm for
    /// the next overflow instead of a round trip through the allocator.
    free: CachePadded<AtomicPtr<Slab>>,
    refcounts: [CachePadded<AtomicUsize>; REF_BUCKETS],
}

unsafe impl Send for TaskChain {}
unsafe impl Sync for TaskChain {}

impl TaskChain {
    pub fn new() -> Self {
        TaskChain {
            tail: CachePadded::new(AtomicPtr::new(Box::into_raw(Slab::boxed()))),
            free: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            refcounts: std::array::from_fn(|_| CachePadded::new(AtomicUsize::new(0))),
        }
    }

    #[inline(always)]
    fn bucket(&self, slab: *mut Slab) -> &AtomicUsize {
        &self.refcounts[(slab as usize >> REF_HASH_SHIFT) & (REF_BUCKETS - 1)]
    }

    /// Pins `slab` against reclamation. Returns false (after backing out) if
    /// `slab` stopped being the tail, in which case the caller must reload.
    #[inline]
    fn pin_tail(&self, slab: *mut Slab) -> bool {
        self.bucket(slab).fetch_add(1, Ordering::SeqCst);
        if self.tail.load(Ordering::SeqCst) == slab {
            true
        } else {
            self.bucket(slab).fetch_sub(1, Ordering::SeqCst);
            false
        }
    }

    #[inline]
    fn unpin(&self, slab: *mut Slab) {
        let previous = self.bucket(slab).fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "refcount bucket underflow");
    }

    /// Appends a task. Wait-free on the common path; a bounded CAS retry on
    /// tail overflow. Callable from any thread, never blocks.
    pub fn post(&self, task: Task) {
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            if !self.pin_tail(tail) {
                continue;
            }
            let slab = unsafe { &*tail };
            let index = slab.claim();
            if index < SLAB_CAP {
                unsafe { slab.publish(index, task) };
                self.unpin(tail);
                return;
            }

            // Overflow: chain a fresh slab and race to install it.
            let fresh = self.take_free().unwrap_or_else(Slab::boxed);
            fresh.set_prev(tail);
            let reserved = fresh.claim();
            debug_assert_eq!(reserved, 0);
            let fresh_ptr = Box::into_raw(fresh);
            // Pin before the CAS: the moment the slab is reachable other
            // producers can fill it and the consumer may judge it drained
            // while our publish into slot 0 is still in flight.
            self.bucket(fresh_ptr).fetch_add(1, Ordering::SeqCst);
            // SeqCst keeps the tail swap in the same total order as the
            // refcount traffic: a producer whose re-validation read the old
            // tail is ordered before this swap, so its bucket increment is
            // visible to any reclamation check that runs after it.
            match self.tail.compare_exchange(
                tail,
                fresh_ptr,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    trace!(slab = ?fresh_ptr, "chained new tail slab");
                    self.unpin(tail);
                    unsafe { (*fresh_ptr).publish(0, task) };
                    self.unpin(fresh_ptr);
                    return;
                }
                Err(_) => {
                    // Someone else won the overflow race; recycle and retry
                    // against the tail they installed.
                    self.unpin(fresh_ptr);
                    self.unpin(tail);
                    let mut lost = unsafe { Box::from_raw(fresh_ptr) };
                    lost.reset();
                    self.stash_free(lost);
                }
            }
        }
    }

    /// Pops the oldest unread task in the chain, reclaiming drained slabs
    /// encountered along the way.
    ///
    /// # Safety
    ///
    /// Consumer thread only.
    pub unsafe fn try_pop(&self) -> Option<Task> {
        let tail = self.tail.load(Ordering::Acquire);
        unsafe { self.pop_oldest(tail) }
    }

    /// Recursive oldest-first walk: drain `slab`'s ancestors before `slab`
    /// itself so FIFO order holds across slab boundaries.
    unsafe fn pop_oldest(&self, slab: *mut Slab) -> Option<Task> {
        let prev = unsafe { (*slab).prev() };
        if !prev.is_null() {
            if let Some(task) = unsafe { self.pop_oldest(prev) } {
                return Some(task);
            }
            // The older slab yielded nothing; it may be reclaimable now.
            unsafe { self.try_reclaim(slab, prev) };
        }
        unsafe { (*slab).try_pop() }
    }

    /// Frees `slab` (the predecessor of `successor`) if it is drained and no
    /// producer can still reach it. Consumer only.
    unsafe fn try_reclaim(&self, successor: *mut Slab, slab: *mut Slab) {
        debug_assert_eq!(unsafe { (*successor).prev() }, slab);
        if !unsafe { (*slab).is_drained() } {
            return;
        }
        if self.bucket(slab).load(Ordering::SeqCst) != 0 {
            return;
        }
        // Splice it out, then recycle. `slab` is non-tail (it has a
        // successor), so producers re-validating against the tail can no
        // longer pin it, and the zero bucket says none still holds it.
        let older = unsafe { (*slab).prev() };
        unsafe { (*successor).set_prev(older) };
        unsafe { (*slab).clear_prev() };
        debug!(slab = ?slab, "reclaimed drained slab");
        let mut reclaimed = unsafe { Box::from_raw(slab) };
        reclaimed.reset();
        self.stash_free(reclaimed);
    }

    /// Whether any published task anywhere in the chain is still unread.
    ///
    /// # Safety
    ///
    /// Consumer thread only.
    pub unsafe fn has_unread(&self) -> bool {
        let mut slab = self.tail.load(Ordering::Acquire);
        while !slab.is_null() {
            if unsafe { (*slab).has_unread() } {
                return true;
            }
            slab = unsafe { (*slab).prev() };
        }
        false
    }

    fn stash_free(&self, slab: Box<Slab>) {
        let ptr = Box::into_raw(slab);
        if self
            .free
            .compare_exchange(ptr::null_mut(), ptr, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Free slot occupied; give the slab back to the allocator.
            drop(unsafe { Box::from_raw(ptr) });
        }
    }

    fn take_free(&self) -> Option<Box<Slab>> {
        let ptr = self.free.swap(ptr::null_mut(), Ordering::AcqRel);
        if ptr.is_null() {
            None
        } else {
            Some(unsafe { Box::from_raw(ptr) })
        }
    }
}

impl Drop for TaskChain {
    fn drop(&mut self) {
        // By the time the chain drops no producer handle exists, so raw
        // ownership of every slab reverts to us. Unrun tasks are destroyed
        // by `Slab::drop` without being run.
        let mut slab = *self.tail.get_mut();
        while !slab.is_null() {
            let boxed = unsafe { Box::from_raw(slab) };
            slab = boxed.prev();
        }
        let free = *self.free.get_mut();
        if !free.is_null() {
            drop(unsafe { Box::from_raw(free) });
        }
    }
}
