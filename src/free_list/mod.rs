//! The free-list core: a circular, address-sorted list of free blocks with a
//! roving search pointer.
//!
//! This module implements the two primitive operations of the pool. Both work
//! in *quanta* — multiples of the in-band header size — and keep the list in
//! shape at all times: sorted by increasing block address with exactly one
//! wrap-around edge, anchored by a size-zero sentinel, and with no two
//! physically adjacent free blocks (every free coalesces with its neighbours
//! on the spot).
//!
//! # Algorithm
//! `alloc` does a first-fit walk starting at the *roving pointer*, the node
//! just before the one touched by the previous operation. An exactly-fitting
//! block is unlinked; an oversized one is split *from the tail*, so the
//! resident header only has its size reduced and no other node's link needs
//! rewriting. When the walk comes back around to the rover, the list is
//! exhausted and a fresh block is minted from the backing region, inserted
//! through the free path (so it coalesces with the previous top of the
//! region) and found on the following iterations of the same walk.
//!
//! `free` steps back one quantum to the header, walks from the rover to the
//! unique gap that contains the block in address order and links it in,
//! absorbing the successor and/or being absorbed by the predecessor whenever
//! they touch.
//!
//! Starting the search where the last operation ended amortises the walk
//! across the list instead of concentrating it on a long prefix of small
//! blocks, and it gives forward coalescing a warm start right next to recent
//! frees.
pub mod header;
pub mod region;

use header::{Header, QUANTUM, SENTINEL};
use region::Region;

use core::ptr::NonNull;

/// An error occurred when calling `free()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeError {
    /// There is a double-free detected. An already-freed-up block is freed up
    /// again.
    DoubleFreeDetected,
    /// An invalid pointer was freed up (either a pointer outside of the pool
    /// memory or a pointer not on a payload boundary).
    AllocationNotFound,
}

/// The free-list state machine over a backing region of `N` bytes.
///
/// This is the single-threaded core; the public [`Pool`](crate::Pool) wraps
/// it in a mutex. The sentinel is a *virtual* node addressed by [`SENTINEL`]:
/// its link lives in `sentinel_next` and its size reads as zero, so it can
/// anchor the circular list without occupying region bytes and without ever
/// satisfying a request or taking part in coalescing.
pub struct FreeList<const N: usize> {
    region: Region<N>,
    /// The sentinel's `next` link. Meaningless until `rover` is `Some`.
    sentinel_next: usize,
    /// The roving pointer; `None` until the first allocation touches the
    /// list, which distinguishes "never used" from "exhausted".
    rover: Option<usize>,
}

impl<const N: usize> FreeList<N> {
    /// Create a new, untouched free list.
    ///
    /// # Panics
    /// This function panics under the same conditions as
    /// [`Region::new`](region::Region::new).
    pub const fn new() -> Self {
        Self {
            region: Region::new(),
            sentinel_next: 0,
            rover: None,
        }
    }

    /// The `next` link of a node, sentinel included.
    fn next_of(&self, node: usize) -> usize {
        if node == SENTINEL {
            self.sentinel_next
        } else {
            self.region.header(node).next
        }
    }

    /// Overwrite the `next` link of a node, sentinel included.
    fn set_next(&mut self, node: usize, next: usize) {
        if node == SENTINEL {
            self.sentinel_next = next;
        } else {
            self.region.set_next(node, next);
        }
    }

    /// The size of a node in quanta; the sentinel reads as zero.
    fn size_of(&self, node: usize) -> usize {
        if node == SENTINEL {
            0
        } else {
            self.region.header(node).size
        }
    }

    /// Allocate `n_bytes` of payload.
    ///
    /// Returns the payload address, one quantum past the block's in-band
    /// header, or `None` once both the list and the backing region are
    /// exhausted. `n_bytes == 0` is legal and occupies one quantum.
    pub fn alloc(&mut self, n_bytes: usize) -> Option<NonNull<u8>> {
        // enough quanta to house the requested bytes, plus one for the header
        let num_quantas = n_bytes.div_ceil(QUANTUM) + 1;

        // first call ever: set up the degenerate one-node list
        let mut prev = match self.rover {
            Some(node) => node,
            None => {
                self.sentinel_next = SENTINEL;
                self.rover = Some(SENTINEL);
                SENTINEL
            }
        };

        let mut current = self.next_of(prev);
        loop {
            let size = self.size_of(current);
            if size >= num_quantas {
                let block = if size == num_quantas {
                    // exact fit: unlink the block
                    let after = self.next_of(current);
                    self.set_next(prev, after);
                    current
                } else {
                    // Split from the tail: the head of the block stays in
                    // place with its link untouched, only its size shrinks.
                    // The carved-off tail gets a fresh header; its `next` is
                    // meaningless while allocated.
                    let remaining = size - num_quantas;
                    self.region.set_size(current, remaining);
                    let carved = current + remaining;
                    self.region.set_header(
                        carved,
                        Header {
                            next: SENTINEL,
                            size: num_quantas,
                        },
                    );
                    carved
                };
                self.rover = Some(prev);
                return Some(self.region.payload(block));
            }

            if Some(current) == self.rover {
                // Walked the whole circle without a fit. Mint a fresh block
                // and inject it through the free path, so it coalesces with
                // the previous top of the region; the continued walk will
                // find it.
                let fresh = self.region.mint(num_quantas)?;
                if self.insert(fresh).is_err() {
                    // a freshly minted block is above every distributed one,
                    // so the insert cannot actually fail
                    return None;
                }
                current = match self.rover {
                    Some(node) => node,
                    None => return None,
                };
            }

            prev = current;
            current = self.next_of(current);
        }
    }

    /// Free a payload pointer previously returned by [`alloc`](Self::alloc).
    ///
    /// The block is reinserted into the address-sorted list and merged with
    /// its physical neighbours when they touch.
    pub fn free(&mut self, payload: NonNull<u8>) -> Result<(), FreeError> {
        if self.rover.is_none() {
            // nothing was ever allocated, so the pointer cannot be ours
            return Err(FreeError::AllocationNotFound);
        }
        let block = self
            .region
            .index_of_payload(payload)
            .ok_or(FreeError::AllocationNotFound)?;
        self.insert(block)
    }

    /// Insert `block` into the sorted list and coalesce with its neighbours.
    ///
    /// The list must have been initialised (`rover` is `Some`).
    fn insert(&mut self, block: usize) -> Result<(), FreeError> {
        let mut prev = match self.rover {
            Some(node) => node,
            None => return Err(FreeError::AllocationNotFound),
        };

        // Find the unique pair `(prev, next)` with `prev < block < next` in
        // address order. The wrap-around edge is where `prev >= next`; the
        // block belongs there if it lies above the highest or below the
        // lowest node. A block that coincides with a node is already free.
        loop {
            let next = self.next_of(prev);
            if block == prev || block == next {
                return Err(FreeError::DoubleFreeDetected);
            }
            if prev < block && block < next {
                break;
            }
            if prev >= next && (block > prev || block < next) {
                break;
            }
            prev = next;
        }

        let next = self.next_of(prev);
        let size = self.region.header(block).size;

        // Combine with the higher neighbour if they touch. The sentinel can
        // never match: its virtual index lies above every reachable sum.
        if block + size == next {
            let absorbed = self.region.header(next);
            self.region.set_size(block, size + absorbed.size);
            self.region.set_next(block, absorbed.next);
        } else {
            self.region.set_next(block, next);
        }

        // Combine with the lower neighbour if they touch. The sentinel has
        // size zero and so never reaches the block.
        let prev_size = self.size_of(prev);
        if prev != SENTINEL && prev + prev_size == block {
            let merged = self.region.header(block);
            self.region.set_size(prev, prev_size + merged.size);
            self.set_next(prev, merged.next);
        } else {
            self.set_next(prev, block);
        }

        self.rover = Some(prev);
        Ok(())
    }

    /// Walk the free list once from the sentinel, yielding each block as
    /// `(index, size_in_quanta)` in increasing address order.
    #[cfg(test)]
    fn free_blocks(&self) -> std::vec::Vec<(usize, usize)> {
        let mut blocks = std::vec::Vec::new();
        if self.rover.is_none() {
            return blocks;
        }
        let mut node = self.sentinel_next;
        while node != SENTINEL {
            blocks.push((node, self.region.header(node).size));
            node = self.next_of(node);
        }
        blocks
    }
}

#[cfg(test)]
mod tests {
    use super::header::QUANTUM;
    use super::region::MIN_REGION_QUANTAS;
    use super::{FreeError, FreeList};

    use core::ptr::NonNull;
    use proptest::prelude::*;
    use std::vec::Vec;

    /// Quantum index of the block backing a payload pointer.
    fn block_of<const N: usize>(list: &FreeList<N>, payload: NonNull<u8>) -> usize {
        list.region.index_of_payload(payload).unwrap()
    }

    #[test]
    fn first_allocation_initialises_the_list() {
        let mut list = FreeList::<1024>::new();
        let payload = list.alloc(1).unwrap();
        assert_eq!(payload.as_ptr() as usize % QUANTUM, 0);
        // a 16-quanta block was minted and a 2-quanta tail carved off it
        assert_eq!(list.free_blocks(), [(0, 14)]);
        assert_eq!(block_of(&list, payload), 14);
    }

    #[test]
    fn alloc_free_alloc_returns_the_same_block() {
        let mut list = FreeList::<1024>::new();
        let first = list.alloc(1).unwrap();
        list.free(first).unwrap();
        assert_eq!(list.free_blocks(), [(0, 16)]);
        let second = list.alloc(1).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn zero_byte_allocation_is_legal() {
        let mut list = FreeList::<1024>::new();
        let payload = list.alloc(0).unwrap();
        list.free(payload).unwrap();
        assert_eq!(list.free_blocks(), [(0, 16)]);
    }

    #[test]
    fn exact_fit_consumes_the_whole_block() {
        let mut list = FreeList::<1024>::new();
        // 15 payload quanta + 1 header quantum == the 16-quanta backing floor
        let payload = list.alloc(15 * QUANTUM).unwrap();
        assert_eq!(block_of(&list, payload), 0);
        // no split happened: the list is back to just the sentinel
        assert!(list.free_blocks().is_empty());
    }

    #[test]
    fn one_byte_more_mints_a_fresh_block() {
        let mut list = FreeList::<1024>::new();
        let first = list.alloc(15 * QUANTUM).unwrap();
        // does not fit the (empty) list, so a second block is minted
        let second = list.alloc(15 * QUANTUM + 1).unwrap();
        assert_eq!(block_of(&list, first), 0);
        assert_eq!(block_of(&list, second), 16);
    }

    #[test]
    fn freed_split_block_is_reused_whole() {
        let mut list = FreeList::<16384>::new();
        let a = list.alloc(100 * QUANTUM).unwrap();
        let b = list.alloc(100 * QUANTUM).unwrap();
        list.free(a).unwrap();
        let c = list.alloc(100 * QUANTUM).unwrap();
        assert_eq!(a, c);
        assert_ne!(b, c);
    }

    #[test]
    fn forward_coalescing_merges_neighbours() {
        let mut list = FreeList::<1024>::new();
        let _a = list.alloc(QUANTUM).unwrap();
        let b = list.alloc(QUANTUM).unwrap();
        let c = list.alloc(QUANTUM).unwrap();
        // one 16-quanta block was minted; a, b and c are 2-quanta tails at
        // indices 14, 12 and 10, with the 10-quanta remainder at index 0
        list.free(b).unwrap();
        list.free(c).unwrap();
        // c (at 10) absorbed b (at 12) forward, then the remainder at 0
        // absorbed the pair backward
        assert_eq!(list.free_blocks(), [(0, 14)]);
    }

    #[test]
    fn coalescing_is_order_independent() {
        let mut shapes = Vec::new();
        let orders = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        for order in orders {
            let mut list = FreeList::<1024>::new();
            let blocks = [
                list.alloc(QUANTUM).unwrap(),
                list.alloc(QUANTUM).unwrap(),
                list.alloc(QUANTUM).unwrap(),
            ];
            for index in order {
                list.free(blocks[index]).unwrap();
            }
            shapes.push(list.free_blocks());
        }
        // all six permutations collapse to the same single merged block
        for shape in &shapes {
            assert_eq!(shape, &shapes[0]);
            assert_eq!(shape.len(), 1);
        }
    }

    #[test]
    fn oversized_requests_fail() {
        let mut list = FreeList::<1024>::new();
        assert!(list.alloc(1024).is_none());
        assert!(list.alloc(usize::MAX - 64).is_none());
        // the failed requests must not have distributed anything
        assert_eq!(list.region.high_water(), 0);
        assert!(list.alloc(1).is_some());
    }

    #[test]
    fn exhaustion_returns_none_and_free_recovers() {
        let mut list = FreeList::<512>::new();
        // 32 quanta total: two 16-quanta exact fits drain the region
        let a = list.alloc(15 * QUANTUM).unwrap();
        let b = list.alloc(15 * QUANTUM).unwrap();
        assert!(list.alloc(1).is_none());
        list.free(a).unwrap();
        assert!(list.alloc(15 * QUANTUM).is_some());
        list.free(b).unwrap();
    }

    #[test]
    fn free_detects_foreign_pointers() {
        let mut list = FreeList::<1024>::new();
        let payload = list.alloc(1).unwrap();
        let inside = NonNull::new(payload.as_ptr().wrapping_add(1)).unwrap();
        assert_eq!(list.free(inside), Err(FreeError::AllocationNotFound));
        list.free(payload).unwrap();
    }

    #[test]
    fn free_detects_double_frees() {
        let mut list = FreeList::<1024>::new();
        let a = list.alloc(QUANTUM).unwrap();
        let b = list.alloc(QUANTUM).unwrap();
        list.free(a).unwrap();
        assert_eq!(list.free(a), Err(FreeError::DoubleFreeDetected));
        list.free(b).unwrap();
    }

    #[test]
    fn free_before_any_allocation_is_rejected() {
        let mut list = FreeList::<1024>::new();
        let mut byte = 0u8;
        let foreign = NonNull::from(&mut byte);
        assert_eq!(list.free(foreign), Err(FreeError::AllocationNotFound));
    }

    #[test]
    fn minted_blocks_coalesce_with_the_region_top() {
        let mut list = FreeList::<2048>::new();
        // the second allocation does not fit the first minted block, so a
        // refill happens; once both are freed the pool must read as one
        // contiguous arena again
        let a = list.alloc(6 * QUANTUM).unwrap();
        let b = list.alloc(20 * QUANTUM).unwrap();
        list.free(a).unwrap();
        list.free(b).unwrap();
        assert_eq!(
            list.free_blocks(),
            [(0, MIN_REGION_QUANTAS + 21)],
            "pool did not collapse into a contiguous arena"
        );
    }

    /// Check the shape invariants: the walk from the sentinel visits blocks
    /// in strictly increasing address order, no two free blocks touch, and
    /// free plus live quanta account for every distributed quantum.
    fn assert_invariants<const N: usize>(list: &FreeList<N>, live: &[NonNull<u8>]) {
        let free = list.free_blocks();
        for pair in free.windows(2) {
            let (index, size) = pair[0];
            let (next_index, _) = pair[1];
            assert!(index + size < next_index, "unsorted or adjacent free blocks");
        }

        let free_quantas: usize = free.iter().map(|&(_, size)| size).sum();
        let live_quantas: usize = live
            .iter()
            .map(|&payload| list.region.header(block_of(list, payload)).size)
            .sum();
        assert_eq!(
            free_quantas + live_quantas,
            list.region.high_water() / QUANTUM,
            "distributed quanta not conserved"
        );

        for &payload in live {
            assert_eq!(payload.as_ptr() as usize % QUANTUM, 0);
        }
    }

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Alloc(usize),
        Free(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..=40 * QUANTUM).prop_map(Op::Alloc),
            any::<usize>().prop_map(Op::Free),
        ]
    }

    proptest! {
        #[test]
        fn invariants_hold_under_random_operation_sequences(
            ops in proptest::collection::vec(op(), 1..128),
        ) {
            let mut list = FreeList::<4096>::new();
            let mut live: Vec<NonNull<u8>> = Vec::new();

            for operation in ops {
                match operation {
                    Op::Alloc(n_bytes) => {
                        if let Some(payload) = list.alloc(n_bytes) {
                            live.push(payload);
                        }
                    }
                    Op::Free(choice) => {
                        if !live.is_empty() {
                            let payload = live.swap_remove(choice % live.len());
                            prop_assert!(list.free(payload).is_ok());
                        }
                    }
                }
                assert_invariants(&list, &live);
            }

            // release everything: since all minted blocks are contiguous the
            // pool must collapse back into a single block
            for payload in live.drain(..) {
                prop_assert!(list.free(payload).is_ok());
            }
            let free = list.free_blocks();
            if list.region.high_water() > 0 {
                prop_assert_eq!(free.len(), 1);
                prop_assert_eq!(free[0], (0, list.region.high_water() / QUANTUM));
            }
        }
    }
}
