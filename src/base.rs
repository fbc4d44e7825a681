//! The raw block model: the header word, the free-list link pair, and the
//! [`BlockPtr`] handle used for all block-level memory access.

use core::{
    fmt, mem,
    num::NonZeroUsize,
    ptr::{self, NonNull},
};

/// The size of the header word that precedes every block's payload.
pub(crate) const HEADER_SIZE: usize = mem::size_of::<usize>();

/// The header bit that marks a block free.
pub(crate) const FREE_BIT: usize = 1 << (usize::BITS - 1);

/// The largest block size the header word can encode.
pub(crate) const MAX_BLOCK_SIZE: usize = !FREE_BIT;

/// The header word of a block: the block's total size with the free flag
/// packed into the high bit.
///
/// The raw word is never read or written except through this type.
#[derive(Copy, Clone, PartialEq, Eq)]
pub(crate) struct Header(usize);

impl Header {
    #[inline]
    pub fn new(size: usize, free: bool) -> Header {
        debug_assert!(size <= MAX_BLOCK_SIZE);
        Header(size | if free { FREE_BIT } else { 0 })
    }

    /// Returns the block's total size, header included.
    #[inline]
    pub fn size(self) -> usize {
        self.0 & !FREE_BIT
    }

    #[inline]
    pub fn is_free(self) -> bool {
        self.0 & FREE_BIT != 0
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("size", &self.size())
            .field("free", &self.is_free())
            .finish()
    }
}

// Rather than using pointers, the free lists store only the addresses of the
// previous and next blocks.  This avoids accidentally violating stacked
// borrows; the links "point to" other blocks, but by forgoing actual
// pointers, no borrow is implied.
//
// NOTE: Using this method, any actual pointer to a block must be re-derived
// through `BlockPtr`, and NOT by casting these addresses directly!

/// A pair of neighbor links in a size-class free list.
///
/// This type is written into the payload area of a free block, forming an
/// intrusive doubly linked list. It is only meaningful while the block's
/// free bit is set.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub(crate) struct FreeLink {
    pub prev: Option<NonZeroUsize>,
    pub next: Option<NonZeroUsize>,
}

/// A pointer to the base of a block, i.e. to its header word.
///
/// Blocks live inside page mappings obtained from a
/// [`PageSource`](crate::PageSource). Every pointer a source returns has
/// exposed provenance (it crossed an FFI boundary, or was exposed
/// explicitly), so a `BlockPtr` can be reconstructed from a bare address
/// stored in the registry. Within one block, derived pointers (user pointer,
/// buddy) share the block's own provenance.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) struct BlockPtr {
    ptr: NonNull<u8>,
}

impl BlockPtr {
    /// Creates a `BlockPtr` at the base of a fresh mapping.
    ///
    /// The returned value assumes the provenance of `ptr`.
    #[inline]
    pub fn from_base(ptr: NonNull<u8>) -> BlockPtr {
        BlockPtr { ptr }
    }

    /// Recovers the block handle from the user pointer handed out for it.
    #[inline]
    pub fn from_user(user: NonNull<u8>) -> BlockPtr {
        // User pointers sit one header word inside a mapping, so the
        // subtraction cannot reach zero.
        let addr = NonZeroUsize::new(user.addr().get() - HEADER_SIZE).unwrap();

        BlockPtr {
            ptr: user.with_addr(addr),
        }
    }

    /// Reconstructs a block handle from an address stored in the registry.
    #[inline]
    pub fn from_addr(addr: NonZeroUsize) -> BlockPtr {
        let raw = ptr::with_exposed_provenance_mut::<u8>(addr.get());

        // SAFETY: `addr` is non-zero, so the pointer is non-null.
        let ptr = unsafe { NonNull::new_unchecked(raw) };

        BlockPtr { ptr }
    }

    /// Returns the address of the block base.
    #[inline]
    pub fn addr(self) -> NonZeroUsize {
        self.ptr.addr()
    }

    /// Returns the raw pointer to the block base.
    #[inline]
    pub fn base(self) -> NonNull<u8> {
        self.ptr
    }

    /// Returns the address of the block's payload.
    #[inline]
    pub fn user_addr(self) -> NonZeroUsize {
        NonZeroUsize::new(self.ptr.addr().get() + HEADER_SIZE).unwrap()
    }

    /// Returns the pointer handed out to the caller for this block.
    #[inline]
    pub fn user_ptr(self) -> NonNull<u8> {
        self.ptr.with_addr(self.user_addr())
    }

    /// Returns the buddy of this block, assuming the block's size is `size`.
    ///
    /// A block's address is aligned to its own size, so the buddy is found by
    /// toggling the size bit of the address. Both halves of a buddy pair lie
    /// within the same page mapping, so the buddy shares this block's
    /// provenance.
    #[inline]
    pub fn buddy(self, size: usize) -> BlockPtr {
        debug_assert!(size.is_power_of_two());

        // The page base is page-aligned and non-null, so toggling a sub-page
        // bit cannot produce zero.
        let addr = NonZeroUsize::new(self.ptr.addr().get() ^ size).unwrap();

        BlockPtr {
            ptr: self.ptr.with_addr(addr),
        }
    }

    /// Reads the block's header word.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `self` must point to a live block of this allocator.
    /// - The block's header must have been initialized with [`set_header`].
    ///
    /// [`set_header`]: BlockPtr::set_header
    #[inline]
    pub unsafe fn header(self) -> Header {
        unsafe { Header(self.ptr.cast::<usize>().as_ptr().read()) }
    }

    /// Writes the block's header word.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `self` must point to the base of a block of this allocator, valid
    ///   for reads and writes for at least `header.size()` bytes.
    #[inline]
    pub unsafe fn set_header(self, header: Header) {
        unsafe { self.ptr.cast::<usize>().as_ptr().write(header.0) };
    }

    /// Reads the free-list link pair stored in the block's payload.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `self` must point to a live block of this allocator.
    /// - The block must be free, with its links initialized via
    ///   [`init_link`].
    ///
    /// [`init_link`]: BlockPtr::init_link
    #[inline]
    pub unsafe fn link(self) -> FreeLink {
        unsafe { self.user_ptr().cast::<FreeLink>().as_ptr().read() }
    }

    /// Initializes the free-list link pair in the block's payload.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `self` must point to a live block of this allocator, valid for
    ///   reads and writes for at least `MIN_SIZE` bytes.
    /// - The block's payload must be unallocated, i.e. not owned by any
    ///   caller.
    #[inline]
    pub unsafe fn init_link(self, link: FreeLink) {
        unsafe { self.user_ptr().cast::<FreeLink>().as_ptr().write(link) };
    }

    /// Returns a mutable reference to the free-list link pair.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `self` must point to a live, free block of this allocator whose
    ///   links were initialized via [`init_link`].
    /// - The reference must be dropped before any other access to this
    ///   block's memory.
    ///
    /// [`init_link`]: BlockPtr::init_link
    #[inline]
    pub unsafe fn link_mut<'a>(self) -> &'a mut FreeLink {
        unsafe { self.user_ptr().cast::<FreeLink>().as_mut() }
    }
}
