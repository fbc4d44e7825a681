//! A buddy-system heap over OS pages.
//!
//! The heap hands out power-of-two blocks between [`MIN_SIZE`] and
//! [`PAGE_SIZE`] bytes, carved out of single pages obtained from a
//! [`PageSource`]. Requests past one page bypass the buddy structure and map
//! whole pages directly.
//!
//! ## Characteristics
//!
//! | Operation       | Complexity                         |
//! |-----------------|------------------------------------|
//! | `allocate`      | O(log _page size_) plus one page map on miss |
//! | `release`       | O(log _page size_)                 |
//! | `resize`        | O(log _page size_) in place, O(_n_) when the payload moves |
//! | `zero_allocate` | O(_n_)                             |
//!
//! Every block is preceded by a one-word header encoding its size and a free
//! bit. Free blocks of each size class form an intrusive doubly linked list
//! overlaid on their payload bytes; a freed block is merged with its buddy
//! (address XOR size) as many times as possible before being listed, so no
//! two equal-size free buddies ever coexist. A block merged all the way back
//! up to a full page is returned to the page source.

use core::{
    cmp, fmt,
    num::NonZeroUsize,
    ptr::{self, NonNull},
};

use crate::{
    base::{BlockPtr, FreeLink, Header, HEADER_SIZE},
    size::{bucket_of, internal_size, pages_for, MIN_SIZE, ORDER_COUNT, PAGE_SIZE},
    AllocError, PageSource,
};

#[cfg(unix)]
use crate::Mmap;

/// The free-list registry: one list head per size class.
///
/// Bucket `i` holds free blocks of exactly `MIN_SIZE << i` bytes. Heads and
/// links store block addresses; pointers are re-derived through [`BlockPtr`].
#[derive(Debug)]
struct FreeLists {
    heads: [Option<NonZeroUsize>; ORDER_COUNT],
}

impl FreeLists {
    const fn new() -> FreeLists {
        FreeLists {
            heads: [None; ORDER_COUNT],
        }
    }

    /// Marks `block` free and pushes it onto the list for its size class.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `block` must be a live buddy block of this heap with an initialized
    ///   header, smaller than a page.
    /// - `block` must not already be in any free list.
    /// - No caller-owned pointer into the block's payload may be used again.
    unsafe fn push(&mut self, block: BlockPtr) {
        let size = unsafe { block.header().size() };
        debug_assert!(size < PAGE_SIZE);

        let bucket = bucket_of(size);
        let old_head = self.heads[bucket];

        if let Some(old) = old_head {
            // `old_head` points back to the new head.
            unsafe { BlockPtr::from_addr(old).link_mut().prev = Some(block.addr()) };
        }

        unsafe {
            block.set_header(Header::new(size, true));
            block.init_link(FreeLink {
                prev: None,
                next: old_head,
            });
        }

        self.heads[bucket] = Some(block.addr());
    }

    /// Unlinks `block` from its list and marks it in-use.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `block` must be an element of the free list for its own size class.
    unsafe fn remove(&mut self, block: BlockPtr) {
        let header = unsafe { block.header() };
        debug_assert!(header.is_free());

        let removed = unsafe { block.link() };

        match removed.prev {
            // Link `prev` forward to `next`.
            Some(p) => unsafe { BlockPtr::from_addr(p).link_mut().next = removed.next },

            // If there's no previous block, then `block` is the head of its
            // bucket.
            None => self.heads[bucket_of(header.size())] = removed.next,
        }

        if let Some(n) = removed.next {
            // Link `next` back to `prev`.
            unsafe { BlockPtr::from_addr(n).link_mut().prev = removed.prev };
        }

        unsafe { block.set_header(Header::new(header.size(), false)) };
    }

    /// Removes and returns the first free block of at least `size` bytes,
    /// scanning ascending size classes.
    ///
    /// The returned block is marked in-use and may be larger than `size`;
    /// it is never smaller.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - All listed blocks must be live, free buddy blocks of this heap.
    unsafe fn find_free(&mut self, size: usize) -> Option<BlockPtr> {
        for bucket in bucket_of(size)..ORDER_COUNT {
            if let Some(head) = self.heads[bucket] {
                let block = BlockPtr::from_addr(head);
                unsafe { self.remove(block) };
                return Some(block);
            }
        }

        None
    }
}

/// A buddy-system heap.
///
/// The heap owns a free-list registry and a [`PageSource`] from which it
/// acquires pages lazily, one at a time for buddy-size requests and in runs
/// for larger ones. All methods take `&mut self`; exclusive ownership is the
/// synchronization. For a process-wide, internally locked instance see the
/// [`global`](crate::global) module.
///
/// Pages are returned to the source only through [`release`] (or a moving
/// [`resize`]): the heap does not track its mappings, so dropping it abandons
/// any that are still live. A process-lifetime heap never notices; short-lived
/// heaps should release everything they allocated.
///
/// [`release`]: Heap::release
/// [`resize`]: Heap::resize
pub struct Heap<S: PageSource> {
    free_lists: FreeLists,
    source: S,
}

#[cfg(unix)]
impl Heap<Mmap> {
    /// Creates a heap backed by anonymous memory mappings.
    pub const fn new() -> Heap<Mmap> {
        Heap::new_in(Mmap)
    }
}

#[cfg(unix)]
impl Default for Heap<Mmap> {
    fn default() -> Heap<Mmap> {
        Heap::new()
    }
}

impl<S: PageSource> Heap<S> {
    /// Creates a heap backed by `source`.
    pub const fn new_in(source: S) -> Heap<S> {
        Heap {
            free_lists: FreeLists::new(),
            source,
        }
    }

    /// Consumes the heap and returns its page source.
    ///
    /// Any pages still mapped are abandoned, exactly as on drop.
    pub fn into_source(self) -> S {
        self.source
    }

    /// Attempts to allocate `size` bytes.
    ///
    /// The payload is not initialized, except that memory never handed out
    /// before is as the page source mapped it (zero-filled).
    ///
    /// # Errors
    ///
    /// Returns `Err` if `size` is zero, if the internal size would exceed the
    /// largest encodable block, or if the page source fails to map.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        if size == 0 {
            return Err(AllocError);
        }

        let internal = internal_size(size).ok_or(AllocError)?;

        if internal > PAGE_SIZE {
            return self.allocate_pages(internal);
        }

        // If a listed block fits, take it; otherwise start a fresh page as
        // one maximal block.
        let block = match unsafe { self.free_lists.find_free(internal) } {
            Some(block) => block,
            None => self.map_buddy_page()?,
        };

        unsafe { self.split_to(block, internal) };

        Ok(block.user_ptr())
    }

    /// Releases the block behind `ptr`.
    ///
    /// The block is fused with its free buddies as far as possible; a full
    /// page goes back to the page source, anything smaller is listed for
    /// reuse. Large blocks are unmapped directly.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block of memory currently allocated via this heap.
    pub unsafe fn release(&mut self, ptr: NonNull<u8>) {
        let block = BlockPtr::from_user(ptr);

        let block = unsafe { self.fuse(block, PAGE_SIZE) };
        let size = unsafe { block.header().size() };

        if size >= PAGE_SIZE {
            unsafe { self.release_pages(block, size) };
        } else {
            unsafe { self.free_lists.push(block) };
        }
    }

    /// Attempts to resize the block behind `ptr` to `new_size` bytes.
    ///
    /// Shrinking within the buddy regime splits in place and always returns
    /// `ptr` itself. Growing within the buddy regime succeeds in place when
    /// fusing the block with free buddies lands exactly on the new size; the
    /// payload moves down only if the merged block starts below the original
    /// (the returned pointer differs from `ptr` in that case). Every other
    /// combination allocates a fresh block, copies
    /// `min(new_size, old usable size)` bytes and releases the old block.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the new internal size is not representable or a
    /// needed fresh allocation fails. The original block is untouched and
    /// remains valid.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `ptr` must denote a block of memory currently allocated via this
    ///   heap.
    /// - `new_size` must be nonzero.
    pub unsafe fn resize(
        &mut self,
        ptr: NonNull<u8>,
        new_size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        debug_assert!(new_size != 0);

        let block = BlockPtr::from_user(ptr);
        let old_internal = unsafe { block.header().size() };

        let internal = internal_size(new_size).ok_or(AllocError)?;

        if internal == old_internal {
            return Ok(ptr);
        }

        if old_internal <= PAGE_SIZE && internal <= PAGE_SIZE {
            if internal < old_internal {
                // Shrink in place; the address never changes.
                unsafe { self.split_to(block, internal) };
                return Ok(ptr);
            }

            if let Some(merged) = unsafe { self.try_fuse_exact(block, internal) } {
                if merged.addr() != block.addr() {
                    // The original block was the upper half of its pair;
                    // slide the payload down to the merged base. The ranges
                    // cannot overlap: the old block starts at least one old
                    // block size past the merged base.
                    let len = old_internal - HEADER_SIZE;
                    unsafe {
                        ptr::copy_nonoverlapping(ptr.as_ptr(), merged.user_ptr().as_ptr(), len);
                    }
                }

                return Ok(merged.user_ptr());
            }
        }

        // Regime change, or no in-place room: move the allocation.
        let new_ptr = self.allocate(new_size)?;
        let len = cmp::min(new_size, old_internal - HEADER_SIZE);

        unsafe {
            ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), len);
            self.release(ptr);
        }

        Ok(new_ptr)
    }

    /// Attempts to allocate a zero-filled region for `count` elements of
    /// `elem_size` bytes each.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `count * elem_size` is zero or overflows, or if the
    /// allocation itself fails.
    pub fn zero_allocate(
        &mut self,
        count: usize,
        elem_size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let total = count.checked_mul(elem_size).ok_or(AllocError)?;

        if total == 0 {
            return Err(AllocError);
        }

        let ptr = self.allocate(total)?;

        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, total) };

        Ok(ptr)
    }

    /// Maps one page and stamps it as a single maximal in-use block.
    fn map_buddy_page(&mut self) -> Result<BlockPtr, AllocError> {
        let page = self.source.map(1).map_err(|_| {
            log::error!("[ALLOC] MMAP ERROR");
            AllocError
        })?;

        let block = BlockPtr::from_base(page);

        // SAFETY: the mapping is at least one page, and the block is not yet
        // reachable from the registry.
        unsafe { block.set_header(Header::new(PAGE_SIZE, false)) };

        Ok(block)
    }

    /// Allocates a page run for an internal size past one page.
    fn allocate_pages(&mut self, internal: usize) -> Result<NonNull<u8>, AllocError> {
        let base = self.source.map(pages_for(internal)).map_err(|_| {
            log::error!("[ALLOC] MMAP ERROR");
            AllocError
        })?;

        let block = BlockPtr::from_base(base);

        // SAFETY: the mapping covers `internal` bytes.
        unsafe { block.set_header(Header::new(internal, false)) };

        Ok(block.user_ptr())
    }

    /// Returns a block's pages to the source.
    ///
    /// An unmap failure is reported on the diagnostic channel and otherwise
    /// ignored; the OS call itself failed, so there is nothing coherent left
    /// to do with the memory.
    ///
    /// # Safety
    ///
    /// `block` must be the base of a live mapping of `pages_for(size)` pages
    /// obtained from this heap's source, with no outstanding references.
    unsafe fn release_pages(&mut self, block: BlockPtr, size: usize) {
        let pages = pages_for(size);

        if unsafe { self.source.unmap(block.base(), pages) }.is_err() {
            log::error!("[ALLOC] MUNMAP ERROR");
        }
    }

    /// Splits `block` in place until it is `target` bytes.
    ///
    /// Each round halves the block: the upper half becomes a free buddy and
    /// is listed, the lower half keeps the original address and stays in-use.
    /// This is the only mechanism that subdivides memory.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `block` must be a live, in-use block of this heap, not in any free
    ///   list, with no caller-visible payload contents to preserve beyond
    ///   `target` bytes.
    /// - `target` must be a power of two with
    ///   `MIN_SIZE <= target <= block size`.
    unsafe fn split_to(&mut self, block: BlockPtr, target: usize) {
        debug_assert!(target >= MIN_SIZE);

        let mut size = unsafe { block.header().size() };

        while size > target && size > MIN_SIZE {
            size /= 2;

            let upper = block.buddy(size);

            unsafe {
                upper.set_header(Header::new(size, false));
                self.free_lists.push(upper);

                block.set_header(Header::new(size, false));
            }
        }
    }

    /// Fuses `block` with its buddy as long as the buddy is free, of equal
    /// size, and the result stays below `limit`.
    ///
    /// Returns the owning block of the merged run (the lowest address),
    /// marked in-use. This is the sole coalescing mechanism.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `block` must be a live block of this heap, not in any free list.
    /// - `limit` must be a power of two no greater than `PAGE_SIZE`.
    unsafe fn fuse(&mut self, mut block: BlockPtr, limit: usize) -> BlockPtr {
        let mut size = unsafe { block.header().size() };

        while size < limit {
            let buddy = block.buddy(size);
            let buddy_header = unsafe { buddy.header() };

            if !buddy_header.is_free() || buddy_header.size() != size {
                break;
            }

            unsafe { self.free_lists.remove(buddy) };

            // The merge keeps the lower of the two addresses.
            if buddy.addr() < block.addr() {
                block = buddy;
            }

            size *= 2;

            unsafe { block.set_header(Header::new(size, false)) };
        }

        block
    }

    /// Attempts to fuse `block` up to exactly `target` bytes.
    ///
    /// A read-only probe first walks the would-be fusion chain; only if it
    /// reaches `target` exactly is the merge committed through [`fuse`].
    /// On `None`, neither the block nor the registry has been touched.
    ///
    /// [`fuse`]: Heap::fuse
    ///
    /// # Safety
    ///
    /// Same contract as [`fuse`], with `target` a power of two no greater
    /// than `PAGE_SIZE`.
    unsafe fn try_fuse_exact(&mut self, block: BlockPtr, target: usize) -> Option<BlockPtr> {
        debug_assert!(target <= PAGE_SIZE);

        let mut low = block;
        let mut size = unsafe { block.header().size() };

        while size < target {
            let buddy = low.buddy(size);
            let buddy_header = unsafe { buddy.header() };

            if !buddy_header.is_free() || buddy_header.size() != size {
                return None;
            }

            if buddy.addr() < low.addr() {
                low = buddy;
            }

            size *= 2;
        }

        // The probe reached `target`, so the committed fusion cannot stop
        // early.
        Some(unsafe { self.fuse(block, target) })
    }
}

impl<S: PageSource + fmt::Debug> fmt::Debug for Heap<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("free_lists", &self.free_lists)
            .field("source", &self.source)
            .finish()
    }
}

#[cfg(test)]
impl<S: PageSource> Heap<S> {
    /// Asserts every registry invariant: listed blocks are free and exactly
    /// bucket-sized, links are reciprocal, and no free buddy pair was left
    /// unmerged.
    pub(crate) fn assert_registry_consistent(&self) {
        use crate::size::bucket_size;

        for bucket in 0..ORDER_COUNT {
            let expected = bucket_size(bucket);
            let mut prev: Option<NonZeroUsize> = None;
            let mut cursor = self.free_lists.heads[bucket];
            let mut steps = 0usize;

            while let Some(addr) = cursor {
                steps += 1;
                assert!(steps <= 1 << 16, "free list cycle in bucket {bucket}");

                let block = BlockPtr::from_addr(addr);
                let header = unsafe { block.header() };

                assert!(header.is_free(), "listed block not marked free");
                assert_eq!(header.size(), expected, "block listed in wrong bucket");

                let link = unsafe { block.link() };
                assert_eq!(link.prev, prev, "free list links not reciprocal");

                let buddy_header = unsafe { block.buddy(expected).header() };
                assert!(
                    !(buddy_header.is_free() && buddy_header.size() == expected),
                    "unmerged free buddy pair in bucket {bucket}"
                );

                prev = Some(addr);
                cursor = link.next;
            }
        }
    }

    /// Returns the number of listed free blocks across all buckets.
    pub(crate) fn count_free_blocks(&self) -> usize {
        let mut count = 0;

        for bucket in 0..ORDER_COUNT {
            let mut cursor = self.free_lists.heads[bucket];

            while let Some(addr) = cursor {
                count += 1;
                cursor = unsafe { BlockPtr::from_addr(addr).link() }.next;
            }
        }

        count
    }
}
