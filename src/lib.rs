//! A buddy-system general-purpose allocator.
//!
//! Memory is managed in power-of-two blocks carved out of OS pages. Small
//! requests are rounded up to a block size between [`MIN_SIZE`] and
//! [`PAGE_SIZE`] bytes and served from per-size free lists; freed blocks are
//! merged with their buddies as far as possible, and fully merged pages are
//! returned to the OS. Requests past one page are mapped directly as whole
//! page runs. See [`Heap`] for the typed interface and [`global`] for the
//! process-wide instance behind the C-style entry points and the
//! [`GlobalAlloc`] adapter.
//!
//! [`GlobalAlloc`]: core::alloc::GlobalAlloc
//!
//! # Example
//!
//! ```
//! use twinalloc::Heap;
//!
//! # fn main() -> Result<(), twinalloc::AllocError> {
//! let mut heap = Heap::new();
//!
//! let ptr = heap.allocate(256)?;
//!
//! unsafe {
//!     ptr.as_ptr().write_bytes(0xff, 256);
//!     heap.release(ptr);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! All of the following crate features are enabled by default:
//! - `"std"`: Links `std`, implementing [`std::error::Error`] for the error
//!   types. Disable it for `no_std` builds.
//! - `"alloc"`: Provides [`HeapPages`], a page source backed by the global
//!   Rust allocator.
//! - `"thread-safe"`: Guards the [`global`] heap with a spinlock so it can be
//!   shared between threads. Without it the global entry points are restricted
//!   to single-threaded processes.
//!
//! The `"ffi"` feature additionally exports the [`global`] entry points as
//! C-ABI symbols for non-Rust callers.

#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![cfg_attr(not(feature = "std"), no_std)]
#![doc(html_root_url = "https://docs.rs/twinalloc/0.1.0")]

#[cfg(any(feature = "alloc", test))]
extern crate alloc;

mod base;
pub mod heap;
mod size;

#[cfg(unix)]
pub mod global;

mod tests;

use core::{fmt, ptr::NonNull};

pub use crate::heap::Heap;
pub use crate::size::{MIN_SIZE, PAGE_SIZE};

#[cfg(unix)]
pub use crate::global::TwinAlloc;

/// Indicates an allocation failure due to resource exhaustion or an
/// unsupported set of arguments.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct AllocError;

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("memory allocation failed")
    }
}

#[cfg(feature = "std")]
impl std::error::Error for AllocError {}

/// Indicates that a [`PageSource`] failed to map or unmap pages.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct MapError;

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("page mapping failed")
    }
}

#[cfg(feature = "std")]
impl std::error::Error for MapError {}

/// Types which provide page-granular memory to a [`Heap`].
///
/// A heap obtains all of its memory through this trait, one page at a time
/// for buddy blocks and in runs for larger allocations. It is implemented by
/// the following types:
/// - [`Mmap`] hands out anonymous memory mappings obtained from the OS.
/// - [`HeapPages`] hands out page-aligned regions obtained from the global
///   Rust allocator, which is useful under a test harness or on hosted
///   targets without `mmap`.
///
/// The heap reconstructs pointers into mapped pages from bare addresses, so
/// every pointer a source returns must have exposed provenance. Pointers that
/// cross an FFI boundary qualify; a source implemented in Rust must expose
/// them itself.
pub trait PageSource: Sealed {
    /// Attempts to map `pages` contiguous, zero-filled pages.
    ///
    /// On success, the returned pointer is page-aligned, valid for reads and
    /// writes for `pages * PAGE_SIZE` bytes, and its address has exposed
    /// provenance.
    fn map(&self, pages: usize) -> Result<NonNull<u8>, MapError>;

    /// Unmaps the `pages` pages at `ptr`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `ptr` must have been returned by a call to [`map`] on this same
    ///   source with the same `pages` argument, and not unmapped since.
    /// - There must be no outstanding pointers into the mapping.
    ///
    /// [`map`]: PageSource::map
    unsafe fn unmap(&self, ptr: NonNull<u8>, pages: usize) -> Result<(), MapError>;
}

/// A page source backed by anonymous memory mappings.
#[cfg(unix)]
#[derive(Copy, Clone, Default, Debug)]
pub struct Mmap;

#[cfg(unix)]
impl Sealed for Mmap {}

#[cfg(unix)]
impl PageSource for Mmap {
    fn map(&self, pages: usize) -> Result<NonNull<u8>, MapError> {
        let len = pages.checked_mul(PAGE_SIZE).ok_or(MapError)?;

        // SAFETY: an anonymous mapping reads no memory through its
        // arguments.
        let raw = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if raw == libc::MAP_FAILED {
            return Err(MapError);
        }

        // A pointer returned over FFI carries exposed provenance.
        NonNull::new(raw.cast::<u8>()).ok_or(MapError)
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>, pages: usize) -> Result<(), MapError> {
        // SAFETY: the caller passes the base and length of a live mapping.
        let rc = unsafe { libc::munmap(ptr.as_ptr().cast(), pages * PAGE_SIZE) };

        match rc {
            0 => Ok(()),
            _ => Err(MapError),
        }
    }
}

/// A page source backed by the global Rust allocator.
#[cfg(any(feature = "alloc", test))]
#[derive(Copy, Clone, Default, Debug)]
pub struct HeapPages;

#[cfg(any(feature = "alloc", test))]
impl Sealed for HeapPages {}

#[cfg(any(feature = "alloc", test))]
impl PageSource for HeapPages {
    fn map(&self, pages: usize) -> Result<NonNull<u8>, MapError> {
        use alloc::alloc::{alloc_zeroed, Layout};

        let len = pages.checked_mul(PAGE_SIZE).ok_or(MapError)?;

        if len == 0 {
            return Err(MapError);
        }

        let layout = Layout::from_size_align(len, PAGE_SIZE).map_err(|_| MapError)?;

        // SAFETY: `layout` has nonzero size.
        let raw = unsafe { alloc_zeroed(layout) };

        let ptr = NonNull::new(raw).ok_or(MapError)?;

        // Unlike an FFI pointer, this one must have its provenance exposed
        // by hand before the heap stores its address.
        let _ = ptr.as_ptr().expose_provenance();

        Ok(ptr)
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>, pages: usize) -> Result<(), MapError> {
        use alloc::alloc::{dealloc, Layout};

        let layout =
            Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).map_err(|_| MapError)?;

        // SAFETY: the caller passes a pointer obtained from `map` with the
        // same page count, which allocated exactly this layout.
        unsafe { dealloc(ptr.as_ptr(), layout) };

        Ok(())
    }
}

#[doc(hidden)]
mod private {
    pub trait Sealed {}
}
use private::Sealed;
