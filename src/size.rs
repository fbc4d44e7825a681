//! Size-class math.
//!
//! All allocation paths normalize a requested byte count through
//! [`internal_size`] before touching any allocator state. Buddy-managed
//! blocks have power-of-two internal sizes in `[MIN_SIZE, PAGE_SIZE]`; larger
//! requests are rounded to whole pages and handled outside the buddy
//! structure.

use crate::base::{HEADER_SIZE, MAX_BLOCK_SIZE};

/// Base-2 logarithm of the page size.
pub const PAGE_SHIFT: u32 = 12;

/// The size of one page, the boundary above which the buddy structure no
/// longer applies.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Base-2 logarithm of the minimum block size.
pub const MIN_SHIFT: u32 = 5;

/// The smallest allocatable block: one header word plus the minimum payload.
pub const MIN_SIZE: usize = 1 << MIN_SHIFT;

/// Number of free-list buckets.
///
/// Bucket `i` holds free blocks of exactly `MIN_SIZE << i` bytes, so the
/// buckets cover `MIN_SIZE` through `PAGE_SIZE / 2`. Whole-page blocks are
/// transient (freshly mapped, in use, or about to be unmapped) and are never
/// listed.
pub(crate) const ORDER_COUNT: usize = (PAGE_SHIFT - MIN_SHIFT) as usize;

/// Returns the order of a power-of-two block size.
///
/// The result for zero is out of range for any bucket; zero never occurs on
/// paths that have gone through [`internal_size`].
#[inline]
pub(crate) fn order(size: usize) -> u32 {
    debug_assert!(size.is_power_of_two());
    size.trailing_zeros()
}

/// Returns the smallest power of two greater than or equal to `n`, or `None`
/// if it would overflow.
#[inline]
pub(crate) fn round_up_pow2(n: usize) -> Option<usize> {
    n.checked_next_power_of_two()
}

/// Returns the number of pages needed to hold `size` bytes.
#[inline]
pub(crate) fn pages_for(size: usize) -> usize {
    (size >> PAGE_SHIFT) + usize::from(size & (PAGE_SIZE - 1) != 0)
}

/// Computes the internal size reserved for a request of `requested` bytes.
///
/// Adds the header word, then rounds: requests that reach a full page round
/// up to whole pages, everything else clamps to `MIN_SIZE` and rounds up to
/// the next power of two. Returns `None` when the result would overflow or
/// exceed [`MAX_BLOCK_SIZE`], the largest size the header word can encode.
pub(crate) fn internal_size(requested: usize) -> Option<usize> {
    let total = requested.checked_add(HEADER_SIZE)?;

    if total >= PAGE_SIZE {
        let bytes = pages_for(total).checked_mul(PAGE_SIZE)?;
        if bytes > MAX_BLOCK_SIZE {
            return None;
        }
        Some(bytes)
    } else {
        round_up_pow2(total.max(MIN_SIZE))
    }
}

/// Returns the free-list bucket index for a buddy block size.
#[inline]
pub(crate) fn bucket_of(size: usize) -> usize {
    (order(size) - MIN_SHIFT) as usize
}

/// Returns the block size held by a free-list bucket.
#[inline]
pub(crate) fn bucket_size(bucket: usize) -> usize {
    MIN_SIZE << bucket
}
