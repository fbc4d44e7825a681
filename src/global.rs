//! The process-wide heap.
//!
//! This module owns a single [`Heap`] backed by anonymous memory mappings
//! and exposes it three ways: the C-style free functions ([`allocate`],
//! [`release`], [`resize`] and [`zero_allocate`]), the [`TwinAlloc`] type
//! that installs it as the Rust global allocator, and, behind the `"ffi"`
//! feature, C-ABI exports for non-Rust callers.
//!
//! With the `"thread-safe"` feature (default) the heap sits behind a
//! spinlock, which never allocates and so cannot re-enter the heap. Without
//! it, everything in this module must only be called from a single thread.

use core::{
    alloc::{GlobalAlloc, Layout},
    cmp, mem,
    ptr::{self, NonNull},
};

use crate::{heap::Heap, Mmap};

#[cfg(not(feature = "thread-safe"))]
use core::cell::UnsafeCell;

#[cfg(feature = "thread-safe")]
use spin::Mutex;

/// The alignment of every pointer handed out by the heap.
const MIN_ALIGN: usize = mem::size_of::<usize>();

#[cfg(feature = "thread-safe")]
static HEAP: Mutex<Heap<Mmap>> = Mutex::new(Heap::new());

#[cfg(feature = "thread-safe")]
fn with_heap<T>(f: impl FnOnce(&mut Heap<Mmap>) -> T) -> T {
    f(&mut HEAP.lock())
}

#[cfg(not(feature = "thread-safe"))]
struct RacyHeap(UnsafeCell<Heap<Mmap>>);

// SAFETY: without the "thread-safe" feature, callers promise to use this
// module from a single thread only.
#[cfg(not(feature = "thread-safe"))]
unsafe impl Sync for RacyHeap {}

#[cfg(not(feature = "thread-safe"))]
static HEAP: RacyHeap = RacyHeap(UnsafeCell::new(Heap::new()));

#[cfg(not(feature = "thread-safe"))]
fn with_heap<T>(f: impl FnOnce(&mut Heap<Mmap>) -> T) -> T {
    // SAFETY: single-threaded per the module contract, and the heap never
    // calls back into this module.
    f(unsafe { &mut *HEAP.0.get() })
}

/// Allocates `size` bytes from the process heap.
///
/// Returns a null pointer if `size` is zero or if the allocation fails.
pub fn allocate(size: usize) -> *mut u8 {
    with_heap(|heap| match heap.allocate(size) {
        Ok(ptr) => ptr.as_ptr(),
        Err(_) => ptr::null_mut(),
    })
}

/// Releases an allocation made by this module.
///
/// A null `ptr` is ignored.
///
/// # Safety
///
/// `ptr` must be null or denote a block of memory currently allocated by the
/// process heap.
pub unsafe fn release(ptr: *mut u8) {
    if let Some(ptr) = NonNull::new(ptr) {
        with_heap(|heap| unsafe { heap.release(ptr) });
    }
}

/// Resizes an allocation made by this module to `new_size` bytes.
///
/// A null `ptr` behaves like [`allocate`]. A zero `new_size` releases the
/// block and returns null. Otherwise the call returns the block's possibly
/// new location, or null if it could not be resized, in which case the
/// original block is untouched and remains valid.
///
/// # Safety
///
/// `ptr` must be null or denote a block of memory currently allocated by the
/// process heap.
pub unsafe fn resize(ptr: *mut u8, new_size: usize) -> *mut u8 {
    let ptr = match NonNull::new(ptr) {
        Some(ptr) => ptr,
        None => return allocate(new_size),
    };

    if new_size == 0 {
        with_heap(|heap| unsafe { heap.release(ptr) });
        return ptr::null_mut();
    }

    with_heap(|heap| match unsafe { heap.resize(ptr, new_size) } {
        Ok(new) => new.as_ptr(),
        Err(_) => ptr::null_mut(),
    })
}

/// Allocates zero-filled memory for `count` elements of `elem_size` bytes
/// each from the process heap.
///
/// Returns a null pointer if the total size is zero, overflows, or cannot be
/// allocated.
pub fn zero_allocate(count: usize, elem_size: usize) -> *mut u8 {
    with_heap(|heap| match heap.zero_allocate(count, elem_size) {
        Ok(ptr) => ptr.as_ptr(),
        Err(_) => ptr::null_mut(),
    })
}

/// A [`GlobalAlloc`] adapter over the process heap.
///
/// The heap aligns to one word natively; layouts with a larger alignment are
/// over-allocated, and the block's true location is stashed one word below
/// the returned pointer.
///
/// Mapping failures are reported through `log`. With this type installed as
/// the global allocator, the logging backend must not itself allocate, or a
/// failing map can re-enter the heap.
///
/// # Example
///
/// ```
/// use twinalloc::TwinAlloc;
///
/// #[global_allocator]
/// static ALLOC: TwinAlloc = TwinAlloc;
///
/// fn main() {
///     let v = vec![1u32, 2, 3];
///     assert_eq!(v.iter().sum::<u32>(), 6);
/// }
/// ```
#[derive(Copy, Clone, Default, Debug)]
pub struct TwinAlloc;

unsafe impl GlobalAlloc for TwinAlloc {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.size() == 0 {
            return sptr::invalid_mut(layout.align());
        }

        if layout.align() <= MIN_ALIGN {
            return allocate(layout.size());
        }

        aligned_alloc(layout)
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if layout.size() == 0 {
            return;
        }

        if layout.align() <= MIN_ALIGN {
            unsafe { release(ptr) };
            return;
        }

        // Recover the heap's own pointer from the stash word.
        let base = ptr.with_addr(unsafe { ptr.cast::<usize>().sub(1).read() });

        unsafe { release(base) };
    }

    #[inline]
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.size() == 0 {
            return sptr::invalid_mut(layout.align());
        }

        if layout.align() <= MIN_ALIGN {
            return zero_allocate(layout.size(), 1);
        }

        let ptr = aligned_alloc(layout);

        if !ptr.is_null() {
            unsafe { ptr.write_bytes(0, layout.size()) };
        }

        ptr
    }

    #[inline]
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.size() == 0 {
            // The zero-size sentinel is not a heap pointer; start fresh.
            let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
            return unsafe { self.alloc(new_layout) };
        }

        if layout.align() <= MIN_ALIGN {
            return unsafe { resize(ptr, new_size) };
        }

        // Over-aligned blocks cannot move in place; allocate, copy, release.
        let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
        let new_ptr = unsafe { self.alloc(new_layout) };

        if !new_ptr.is_null() {
            unsafe {
                ptr::copy_nonoverlapping(ptr, new_ptr, cmp::min(layout.size(), new_size));
                self.dealloc(ptr, layout);
            }
        }

        new_ptr
    }
}

/// Serves a layout aligned past one word.
///
/// The heap is asked for `size + align` bytes, the returned pointer is
/// rounded up to the requested alignment, and the address of the heap's own
/// pointer is stashed in the word just below it for [`GlobalAlloc::dealloc`]
/// to recover.
#[cold]
fn aligned_alloc(layout: Layout) -> *mut u8 {
    let total = match layout.size().checked_add(layout.align()) {
        Some(total) => total,
        None => return ptr::null_mut(),
    };

    let base = allocate(total);

    if base.is_null() {
        return ptr::null_mut();
    }

    // Heap pointers are one word past an even-word boundary, so rounding
    // `base + MIN_ALIGN` up to the alignment stays at least one word past
    // `base` and at most `align - MIN_ALIGN` past it.
    let base_addr = base.addr();
    let aligned_addr = (base_addr + MIN_ALIGN + layout.align() - 1) & !(layout.align() - 1);
    let aligned = base.with_addr(aligned_addr);

    // SAFETY: the stash word lies within the over-allocated block, below the
    // payload.
    unsafe { aligned.cast::<usize>().sub(1).write(base_addr) };

    aligned
}

/// C-ABI exports over the process heap, for linking from non-Rust code.
///
/// The symbols carry a `twinalloc_` prefix rather than interposing the
/// platform allocator; a shim that builds the final static or shared library
/// can rename them as needed.
#[cfg(feature = "ffi")]
pub mod ffi {
    use core::ffi::c_void;

    /// C-style `malloc`: allocates `size` bytes, or returns null.
    #[no_mangle]
    pub extern "C" fn twinalloc_malloc(size: usize) -> *mut c_void {
        super::allocate(size).cast()
    }

    /// C-style `free`: releases an allocation; null is ignored.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a pointer returned by these entry points that
    /// has not been freed since.
    #[no_mangle]
    pub unsafe extern "C" fn twinalloc_free(ptr: *mut c_void) {
        unsafe { super::release(ptr.cast()) };
    }

    /// C-style `realloc`: null `ptr` allocates, zero `size` frees, and on
    /// failure the original block is untouched and null is returned.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a pointer returned by these entry points that
    /// has not been freed since.
    #[no_mangle]
    pub unsafe extern "C" fn twinalloc_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
        unsafe { super::resize(ptr.cast(), size) }.cast()
    }

    /// C-style `calloc`: allocates zeroed memory for `count` elements of
    /// `elem_size` bytes, or returns null.
    #[no_mangle]
    pub extern "C" fn twinalloc_calloc(count: usize, elem_size: usize) -> *mut c_void {
        super::zero_allocate(count, elem_size).cast()
    }
}
