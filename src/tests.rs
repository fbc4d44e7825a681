#![cfg(test)]
extern crate std;

use core::{cmp, ptr::NonNull, slice};

use alloc::vec::Vec;
use quickcheck::{Arbitrary, Gen, QuickCheck};

use crate::{heap::Heap, AllocError, HeapPages};

// Property harness ===========================================================

enum AllocatorOpTag {
    Allocate,
    Free,
    Resize,
    ZeroAllocate,
}

#[derive(Clone, Debug)]
enum AllocatorOp {
    /// Allocate a buffer that can hold `len` `u32` values.
    Allocate { len: usize },
    /// Free an existing allocation.
    ///
    /// Given `n` outstanding allocations, the allocation to free is at index
    /// `index % n`.
    Free { index: usize },
    /// Resize an existing allocation to hold `len` `u32` values.
    Resize { index: usize, len: usize },
    /// Allocate a zeroed buffer for `count` elements of `elem_size` bytes.
    ZeroAllocate { count: usize, elem_size: usize },
}

/// Limit on allocation size, expressed in bits.
///
/// The limit is past the page size, so ops are spread over both buddy blocks
/// and whole-page mappings.
const ALLOC_LIMIT_BITS: u8 = 16;

fn limited_size(g: &mut Gen) -> usize {
    let exp = u8::arbitrary(g) % (ALLOC_LIMIT_BITS + 1);
    usize::arbitrary(g) % 2_usize.pow(exp.into())
}

impl Arbitrary for AllocatorOp {
    fn arbitrary(g: &mut Gen) -> Self {
        match g
            .choose(&[
                AllocatorOpTag::Allocate,
                AllocatorOpTag::Free,
                AllocatorOpTag::Resize,
                AllocatorOpTag::ZeroAllocate,
            ])
            .unwrap()
        {
            AllocatorOpTag::Allocate => AllocatorOp::Allocate {
                len: limited_size(g),
            },
            AllocatorOpTag::Free => AllocatorOp::Free {
                index: usize::arbitrary(g),
            },
            AllocatorOpTag::Resize => AllocatorOp::Resize {
                index: usize::arbitrary(g),
                len: limited_size(g),
            },
            AllocatorOpTag::ZeroAllocate => AllocatorOp::ZeroAllocate {
                count: limited_size(g),
                elem_size: *g.choose(&[1, 2, 4, 8]).unwrap(),
            },
        }
    }
}

type OpId = u32;

struct Allocation {
    id: OpId,
    ptr: NonNull<u8>,
    /// Length in `u32` values, not bytes.
    len: usize,
}

/// Stamps the first `len` `u32` slots of an allocation with the id of the op
/// that produced it.
fn fill(a: &Allocation) {
    let slice = unsafe { slice::from_raw_parts_mut(a.ptr.as_ptr().cast::<u32>(), a.len) };
    slice.fill(a.id);
}

/// Checks that the eventual free or resize still sees the stamp, i.e. that no
/// other allocation was given overlapping memory in between.
fn verify(a: &Allocation, len: usize) -> bool {
    let slice = unsafe { slice::from_raw_parts(a.ptr.as_ptr().cast::<u32>(), len) };
    slice.iter().all(|&word| word == a.id)
}

struct AllocatorChecker {
    heap: Heap<HeapPages>,
    allocations: Vec<Allocation>,
    num_ops: u32,
}

impl AllocatorChecker {
    fn new(capacity: usize) -> Self {
        AllocatorChecker {
            heap: Heap::new_in(HeapPages),
            allocations: Vec::with_capacity(capacity),
            num_ops: 0,
        }
    }

    fn do_op(&mut self, op: AllocatorOp) -> bool {
        let op_id = self.num_ops;
        self.num_ops += 1;

        match op {
            AllocatorOp::Allocate { len } => {
                match self.heap.allocate(4 * len) {
                    Ok(ptr) => {
                        let a = Allocation { id: op_id, ptr, len };
                        fill(&a);
                        self.allocations.push(a);
                    }

                    // Zero-size requests are the only errors expected here.
                    Err(AllocError) => {
                        if len != 0 {
                            return false;
                        }
                    }
                }
            }

            AllocatorOp::Free { index } => {
                if self.allocations.is_empty() {
                    return true;
                }

                let index = index % self.allocations.len();
                let a = self.allocations.swap_remove(index);

                if !verify(&a, a.len) {
                    return false;
                }

                unsafe { self.heap.release(a.ptr) };
            }

            AllocatorOp::Resize { index, len } => {
                if self.allocations.is_empty() || len == 0 {
                    return true;
                }

                let index = index % self.allocations.len();
                let a = &mut self.allocations[index];

                match unsafe { self.heap.resize(a.ptr, 4 * len) } {
                    Ok(new_ptr) => {
                        // The payload must survive the resize up to the
                        // smaller of the two lengths, wherever it landed.
                        let preserved = Allocation {
                            id: a.id,
                            ptr: new_ptr,
                            len: cmp::min(a.len, len),
                        };

                        if !verify(&preserved, preserved.len) {
                            return false;
                        }

                        *a = Allocation {
                            id: op_id,
                            ptr: new_ptr,
                            len,
                        };
                        fill(a);
                    }

                    // On failure the original allocation must be untouched.
                    Err(AllocError) => {
                        if !verify(a, a.len) {
                            return false;
                        }
                    }
                }
            }

            AllocatorOp::ZeroAllocate { count, elem_size } => {
                match self.heap.zero_allocate(count, elem_size) {
                    Ok(ptr) => {
                        let bytes = count * elem_size;
                        let slice = unsafe { slice::from_raw_parts(ptr.as_ptr(), bytes) };

                        if slice.iter().any(|&byte| byte != 0) {
                            return false;
                        }

                        let a = Allocation {
                            id: op_id,
                            ptr,
                            len: bytes / 4,
                        };
                        fill(&a);
                        self.allocations.push(a);
                    }

                    Err(AllocError) => {
                        if count != 0 && elem_size != 0 {
                            return false;
                        }
                    }
                }
            }
        }

        self.heap.assert_registry_consistent();

        true
    }

    fn run(&mut self, ops: Vec<AllocatorOp>) -> bool {
        if !ops.into_iter().all(|op| self.do_op(op)) {
            return false;
        }

        // Free any outstanding allocations.
        for a in self.allocations.drain(..) {
            unsafe { self.heap.release(a.ptr) };
        }

        // With nothing left allocated, every page must have fused back
        // together and left the heap.
        self.heap.assert_registry_consistent();
        self.heap.count_free_blocks() == 0
    }
}

fn check(ops: Vec<AllocatorOp>) -> bool {
    let mut checker = AllocatorChecker::new(ops.capacity());
    checker.run(ops)
}

// Miri is substantially slower to run property tests, so the number of test
// cases is reduced to keep the runtime in check.

#[cfg(not(miri))]
const MAX_TESTS: u64 = 100;

#[cfg(miri)]
const MAX_TESTS: u64 = 20;

#[test]
fn heap_allocations_are_mutually_exclusive() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(check as fn(_) -> bool);
}

// Global entry points ========================================================

// The harness runs tests concurrently, so the shared heap needs its lock.
#[cfg(all(unix, feature = "thread-safe"))]
mod global_api {
    use core::{
        alloc::{GlobalAlloc, Layout},
        ptr,
    };

    use crate::{global, TwinAlloc};

    #[test]
    fn allocate_rejects_zero() {
        assert!(global::allocate(0).is_null());
    }

    #[test]
    fn release_ignores_null() {
        unsafe { global::release(ptr::null_mut()) };
    }

    #[test]
    fn resize_of_null_allocates() {
        unsafe {
            let p = global::resize(ptr::null_mut(), 64);
            assert!(!p.is_null());
            global::release(p);
        }
    }

    #[test]
    fn resize_to_zero_releases() {
        unsafe {
            let p = global::allocate(64);
            assert!(!p.is_null());
            assert!(global::resize(p, 0).is_null());
        }
    }

    #[test]
    fn resize_preserves_content_across_regimes() {
        unsafe {
            let p = global::allocate(100);
            assert!(!p.is_null());

            for i in 0..100 {
                p.add(i).write(i as u8);
            }

            let q = global::resize(p, 50_000);
            assert!(!q.is_null());

            for i in 0..100 {
                assert_eq!(q.add(i).read(), i as u8);
            }

            global::release(q);
        }
    }

    #[test]
    fn zero_allocate_zeroes_and_rejects_overflow() {
        assert!(global::zero_allocate(usize::MAX, 2).is_null());
        assert!(global::zero_allocate(0, 8).is_null());

        let p = global::zero_allocate(100, 8);
        assert!(!p.is_null());

        unsafe {
            for i in 0..800 {
                assert_eq!(p.add(i).read(), 0);
            }

            global::release(p);
        }
    }

    #[test]
    fn adapter_serves_over_aligned_layouts() {
        let layout = Layout::from_size_align(96, 64).unwrap();

        unsafe {
            let p = TwinAlloc.alloc(layout);
            assert!(!p.is_null());
            assert_eq!(p as usize % 64, 0);

            p.write_bytes(0xee, 96);

            let q = TwinAlloc.realloc(p, layout, 200);
            assert!(!q.is_null());
            assert_eq!(q as usize % 64, 0);

            for i in 0..96 {
                assert_eq!(q.add(i).read(), 0xee);
            }

            TwinAlloc.dealloc(q, Layout::from_size_align(200, 64).unwrap());
        }
    }

    #[test]
    fn adapter_zeroes_over_aligned_layouts() {
        let layout = Layout::from_size_align(128, 32).unwrap();

        unsafe {
            let p = TwinAlloc.alloc_zeroed(layout);
            assert!(!p.is_null());
            assert_eq!(p as usize % 32, 0);

            for i in 0..128 {
                assert_eq!(p.add(i).read(), 0);
            }

            TwinAlloc.dealloc(p, layout);
        }
    }

    #[test]
    fn adapter_zero_size_allocations_bypass_the_heap() {
        let layout = Layout::from_size_align(0, 16).unwrap();

        unsafe {
            let p = TwinAlloc.alloc(layout);
            assert_eq!(p as usize, 16);
            TwinAlloc.dealloc(p, layout);
        }
    }
}

// Version sync ================================================================
#[test]
fn html_root_url() {
    version_sync::assert_html_root_url_updated!("src/lib.rs");
}

#[test]
fn readme_deps() {
    version_sync::assert_markdown_deps_updated!("README.md");
}
