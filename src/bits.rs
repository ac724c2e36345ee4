//! Bitset word helpers for the slab bitmaps.

use std::sync::atomic::{AtomicU64, Ordering};

/// Sets bit `index` of `word` with release ordering, publishing everything
/// written before the call to any thread that acquire-loads the word and
/// observes the bit. Returns `true` if the bit was previously clear.
#[inline(always)]
pub fn publish(word: &AtomicU64, index: usize) -> bool {
    debug_assert!(index < 64);
    let bit = 1u64 << index;
    let previous = word.fetch_or(bit, Ordering::Release);
    (previous & bit) == 0
}

/// Returns the lowest bit index that is set in `written` but clear in `read`,
/// or `None` when every written bit has already been read.
#[inline(always)]
pub fn lowest_unread(written: u64, read: u64) -> Option<usize> {
    let unread = written & !read;
    if unread == 0 {
        None
    } else {
        Some(unread.trailing_zeros() as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_reports_first_set_only() {
        let word = AtomicU64::new(0);
        assert!(publish(&word, 3));
        assert!(!publish(&word, 3));
        assert_eq!(word.load(Ordering::Relaxed), 0b1000);
    }

    #[test]
    fn lowest_unread_skips_read_bits() {
        assert_eq!(lowest_unread(0, 0), None);
        assert_eq!(lowest_unread(0b1010, 0), Some(1));
        assert_eq!(lowest_unread(0b1010, 0b0010), Some(3));
        assert_eq!(lowest_unread(0b1010, 0b1010), None);
        assert_eq!(lowest_unread(u64::MAX, u64::MAX >> 1), Some(63));
    }
}
