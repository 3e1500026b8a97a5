//! Fixed-capacity pool allocator for memory that must stay out of snapshots
//!
//! This crate provides a [`Pool`]: a coalescing free-list allocator over a
//! fixed-size backing region, intended as the heap for memory that an
//! external checkpoint/rollback mechanism must *not* capture. Emulator and
//! rewind-style runtimes snapshot their whole mutable state; caches, script
//! interned data and other recomputable storage would bloat every snapshot
//! and, worse, get rolled back together with the real state. Such clients
//! allocate from a `Pool` placed in a memory region the snapshotter is told
//! to skip, and the snapshots never see it.
//!
//! # Usage
//! Declare the pool as a `static` and hand out memory through the byte-level
//! API, the typed adapter ([`TypedPool`]) or the [`core::alloc::GlobalAlloc`]
//! implementation:
//! ```no_run
//! static POOL: shadowpool::Pool<{ shadowpool::POOL_SIZE }> = shadowpool::Pool::new();
//!
//! let ptr = POOL.allocate_bytes(256).expect("pool exhausted");
//! // ... use the memory ...
//! unsafe { POOL.deallocate_bytes(ptr).unwrap() };
//! ```
//! All pool state — the backing bytes, the high-water mark, the free-list
//! anchor and the roving pointer — lives inside the `Pool` value itself, so
//! a single placement attribute on the `static` puts the whole allocator
//! into the snapshot-excluded region your runtime recognises:
//! ```no_run
//! #[link_section = ".invisible"]
//! static POOL: shadowpool::Pool<{ shadowpool::POOL_SIZE }> = shadowpool::Pool::new();
//! ```
//! The section must be set up by your linker script as uninitialised
//! (NOLOAD/nobits) storage; the pool needs no initialised image at all, which
//! is also checked by the crate's test suite (a pool `static` must land in
//! `.bss`, never in `.data`).
//!
//! # Implementation
//! The allocator accounts in *quanta* of 16 bytes, the size and alignment of
//! the in-band block header. Every block starts with such a header holding
//! the block's total size in quanta; the payload handed to the caller begins
//! one quantum later and is therefore aligned for every scalar type.
//!
//! 1.  Free blocks form a circular, singly-linked list sorted by address and
//!     anchored by a size-zero sentinel:
//!     ```text
//!     sentinel ->  [hdr|............]  ->  [hdr|....]  -> (wraps to sentinel)
//!                  size = 24 quanta       size = 5 quanta
//!     ```
//! 2.  `alloc` walks the list first-fit, starting at the *roving pointer* —
//!     the node just before the one the previous operation touched — so
//!     consecutive allocations spread across the list instead of scanning
//!     the same prefix over and over.
//! 3.  A block that fits exactly is unlinked. A bigger block is split from
//!     the tail; the resident header just shrinks and no links move:
//!     ```text
//!     before:  [hdr|..............................]   free, 24 quanta
//!     after:   [hdr|.....................][hdr|###]   free 20, allocated 4
//!     ```
//! 4.  When the walk comes full circle, a fresh block (at least 16 quanta)
//!     is carved from the backing region's high-water mark and pushed onto
//!     the list through the free path; the walk then continues and finds it.
//!     Once the region is drained, `alloc` reports exhaustion — memory is
//!     never requested from the host.
//! 5.  `free` reinserts the block sorted by address and merges it with both
//!     physical neighbours when they are free, so no two free blocks are
//!     ever adjacent and churn cannot fragment the pool permanently.
//!
//! The pool serves one thread of execution; a spin mutex makes the `static`
//! form safe and keeps the `GlobalAlloc` surface sound, but the allocator is
//! not designed for contended use.
#![no_std]

#[cfg(test)]
extern crate std;

mod free_list;
mod typed;

pub use crate::free_list::header::QUANTUM;
pub use crate::free_list::region::MIN_REGION_QUANTAS;
pub use crate::free_list::FreeError;
pub use crate::typed::{AllocError, TypedPool};

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};

/// The default pool capacity in bytes: 128 MiB.
pub const POOL_SIZE: usize = 128 * 1024 * 1024;

/// A fixed-capacity, coalescing free-list pool allocator.
///
/// The pool owns `N` bytes of backing storage and never asks the host for
/// more: once the region is drained and the free list cannot satisfy a
/// request, allocation fails. Freed blocks are merged with their physical
/// neighbours immediately, so a fully released pool always collapses back
/// into contiguous storage.
///
/// The type is designed to be a `static` (its backing bytes would overflow
/// most stacks at the default size) and carries no initialised image, so the
/// `static` lands in `.bss` — or in whatever snapshot-excluded section a
/// `#[link_section]` attribute names. See the [crate-level](crate)
/// documentation for the placement contract.
pub struct Pool<const N: usize> {
    free_list: spin::Mutex<free_list::FreeList<N>>,
}

impl<const N: usize> Pool<N> {
    /// Create a new, empty pool.
    ///
    /// This function is a `const fn`, therefore you can call it directly when
    /// declaring the pool `static`.
    ///
    /// # Panics
    /// This function will panic if `N` is not a multiple of the 16-byte
    /// quantum or is smaller than one minimum backing request (256 bytes).
    #[must_use = "assign the pool to a static variable; a pool dropped on the spot serves no allocations"]
    pub const fn new() -> Self {
        assert!(N % QUANTUM == 0, "pool size has to be a multiple of 16");
        assert!(
            N >= MIN_REGION_QUANTAS * QUANTUM,
            "too small pool: minimum size is 256"
        );
        Self {
            free_list: spin::Mutex::new(free_list::FreeList::new()),
        }
    }

    /// Allocate `n_bytes` of payload from the pool.
    ///
    /// The returned pointer is aligned to the maximum scalar alignment and
    /// points to at least `n_bytes` of usable memory. `n_bytes == 0` is
    /// legal and returns a distinct, freeable pointer. `None` means the
    /// request can never be satisfied: the free list has no fitting block
    /// and the backing region cannot supply a fresh one.
    pub fn allocate_bytes(&self, n_bytes: usize) -> Option<NonNull<u8>> {
        self.free_list.lock().alloc(n_bytes)
    }

    /// Return an allocation to the pool.
    ///
    /// Out-of-pool and misaligned pointers as well as double frees are
    /// reported as [`FreeError`]s and leave the pool untouched.
    ///
    /// # Safety
    /// `ptr` must have been returned by [`allocate_bytes`] on this very pool
    /// and not freed since. A stale pointer that happens to point at a
    /// *live* block's payload is indistinguishable from that block's owner
    /// and frees it under the owner's feet.
    ///
    /// [`allocate_bytes`]: Self::allocate_bytes
    pub unsafe fn deallocate_bytes(&self, ptr: NonNull<u8>) -> Result<(), FreeError> {
        self.free_list.lock().free(ptr)
    }
}

unsafe impl<const N: usize> GlobalAlloc for Pool<N> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // Payloads are quantum-aligned by construction; stricter alignments
        // are out of contract for this pool.
        if layout.align() > QUANTUM {
            return ptr::null_mut();
        }
        match self.allocate_bytes(layout.size()) {
            Some(payload) => payload.as_ptr(),
            None => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            // An allocator must not unwind; a bad pointer here is a caller
            // bug that the free list already refused to act on.
            let _ = self.deallocate_bytes(ptr);
        }
    }
}
