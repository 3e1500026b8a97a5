//! The backing region: the byte buffer all blocks are minted from.
//!
//! The region owns `N` bytes plus a monotonically advancing high-water mark.
//! Blocks below the high-water mark have been distributed exactly once and
//! from then on circulate between the free list and the callers; bytes are
//! never handed back down here. Once the cursor reaches `N`, the pool is
//! exhausted for good.
use super::header::{Header, QUANTUM, SENTINEL};

use core::mem::MaybeUninit;
use core::ptr::{addr_of_mut, NonNull};

/// The smallest number of quanta carved out of the region in one go.
///
/// Coarsening the minimum request amortises the free-list bookkeeping when
/// clients make many small allocations and bounds the fragmentation caused by
/// splitting in the common case.
pub const MIN_REGION_QUANTAS: usize = 16;

/// The backing region: a quantum-aligned byte buffer and its high-water mark.
///
/// The buffer is uninitialised except for the headers the allocator has
/// stamped into it; `repr(C)` pins it at offset zero so the `align(16)` of
/// the struct carries over to the first quantum.
#[repr(C, align(16))]
pub struct Region<const N: usize> {
    bytes: [MaybeUninit<u8>; N],
    high_water: usize,
}

impl<const N: usize> Region<N> {
    /// Create a new, fully undistributed region.
    ///
    /// # Panics
    /// This function panics if `N` is not a multiple of the quantum or is too
    /// small to satisfy even a single minimum-sized backing request.
    pub const fn new() -> Self {
        assert!(N % QUANTUM == 0, "pool size has to be a multiple of 16");
        assert!(
            N >= MIN_REGION_QUANTAS * QUANTUM,
            "too small pool: minimum size is 256"
        );
        Self {
            bytes: [MaybeUninit::uninit(); N],
            high_water: 0,
        }
    }

    /// The number of bytes distributed so far.
    pub fn high_water(&self) -> usize {
        self.high_water
    }

    /// Mint a fresh block of at least `num_quantas` quanta.
    ///
    /// Requests below [`MIN_REGION_QUANTAS`] are rounded up. The new block's
    /// header is stamped with its size and the high-water mark advances past
    /// it. The caller is responsible for putting the block on the free list;
    /// `None` means the region cannot supply the bytes and never will.
    pub fn mint(&mut self, num_quantas: usize) -> Option<usize> {
        let num_quantas = num_quantas.max(MIN_REGION_QUANTAS);
        let total_bytes = num_quantas.checked_mul(QUANTUM)?;
        let new_high_water = self.high_water.checked_add(total_bytes)?;
        if new_high_water > N {
            return None;
        }

        let index = self.high_water / QUANTUM;
        // `next` is meaningless until the block is inserted into the list,
        // but writing a whole header keeps later reads fully initialised.
        self.set_header(
            index,
            Header {
                next: SENTINEL,
                size: num_quantas,
            },
        );
        self.high_water = new_high_water;
        Some(index)
    }

    /// Pointer to the header at a quantum index.
    ///
    /// # Panics
    /// This function panics if the index does not name a whole quantum inside
    /// the buffer.
    fn header_ptr(&self, index: usize) -> *const Header {
        assert!(index < N / QUANTUM);

        // Plain pointer arithmetic: the offset is a multiple of `QUANTUM`,
        // which is also the alignment of `Header`, and the buffer itself is
        // `align(16)`, so the resulting pointer is in bounds and aligned.
        self.bytes
            .as_ptr()
            .cast::<u8>()
            .wrapping_add(index * QUANTUM)
            .cast::<Header>()
    }

    /// Mutable variant of [`header_ptr`](Self::header_ptr).
    fn header_ptr_mut(&mut self, index: usize) -> *mut Header {
        assert!(index < N / QUANTUM);
        self.bytes
            .as_mut_ptr()
            .cast::<u8>()
            .wrapping_add(index * QUANTUM)
            .cast::<Header>()
    }

    /// Read the header at a quantum index.
    ///
    /// The buffer invariant (only ever read headers that were previously
    /// written by [`mint`](Self::mint) or the free-list core) has to be
    /// upheld.
    pub fn header(&self, index: usize) -> Header {
        // SAFETY: the pointer is in bounds and aligned (asserted in
        // `header_ptr`) and by the buffer invariant the 16 bytes read were
        // initialised when the block was minted or split.
        unsafe { *self.header_ptr(index) }
    }

    /// Overwrite the whole header at a quantum index.
    pub fn set_header(&mut self, index: usize, header: Header) {
        // SAFETY: in bounds and aligned as per `header_ptr_mut`; writing to
        // possibly-uninitialised memory is fine.
        unsafe { self.header_ptr_mut(index).write(header) };
    }

    /// Overwrite only the `next` link of the header at a quantum index.
    pub fn set_next(&mut self, index: usize, next: usize) {
        let header = self.header_ptr_mut(index);
        // SAFETY: field projection on an in-bounds, aligned header pointer.
        unsafe { addr_of_mut!((*header).next).write(next) };
    }

    /// Overwrite only the `size` of the header at a quantum index.
    pub fn set_size(&mut self, index: usize, size: usize) {
        let header = self.header_ptr_mut(index);
        // SAFETY: field projection on an in-bounds, aligned header pointer.
        unsafe { addr_of_mut!((*header).size).write(size) };
    }

    /// The payload address of the block at a quantum index: one quantum past
    /// the header.
    ///
    /// # Panics
    /// This function panics if the index does not name a quantum inside the
    /// buffer.
    pub fn payload(&mut self, index: usize) -> NonNull<u8> {
        assert!(index < N / QUANTUM);

        // SAFETY: `(index + 1) * QUANTUM <= N`, so this is at most the
        // one-past-the-end address of the buffer, which is a valid offset.
        let payload = unsafe {
            self.bytes
                .as_mut_ptr()
                .cast::<u8>()
                .add((index + 1) * QUANTUM)
        };
        // SAFETY: derived from a real object, hence never null.
        unsafe { NonNull::new_unchecked(payload) }
    }

    /// Translate a payload address back into the quantum index of its block
    /// header, i.e. step back one quantum.
    ///
    /// Returns `None` for pointers outside the buffer or not on a quantum
    /// boundary; such pointers cannot have originated from this pool.
    pub fn index_of_payload(&self, payload: NonNull<u8>) -> Option<usize> {
        let base = self.bytes.as_ptr() as usize;
        let address = payload.as_ptr() as usize;

        // a payload is always at least one quantum past the buffer base and
        // at most one-past-the-end (a zero-size payload of the last block)
        if address <= base || address > base + N {
            return None;
        }
        let offset = address - base;
        if offset % QUANTUM != 0 {
            return None;
        }
        Some(offset / QUANTUM - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::{Header, Region, MIN_REGION_QUANTAS, QUANTUM, SENTINEL};

    #[test]
    fn fresh_region_is_undistributed() {
        let region = Region::<1024>::new();
        assert_eq!(region.high_water(), 0);
    }

    #[test]
    fn mint_rounds_up_to_the_floor() {
        let mut region = Region::<1024>::new();
        let block = region.mint(2).unwrap();
        assert_eq!(block, 0);
        assert_eq!(region.header(block).size, MIN_REGION_QUANTAS);
        assert_eq!(region.high_water(), MIN_REGION_QUANTAS * QUANTUM);
    }

    #[test]
    fn mint_advances_monotonically() {
        let mut region = Region::<1024>::new();
        let first = region.mint(16).unwrap();
        let second = region.mint(16).unwrap();
        assert_eq!(first, 0);
        assert_eq!(second, 16);
        assert_eq!(region.high_water(), 512);
    }

    #[test]
    fn exhausted_region_fails() {
        let mut region = Region::<512>::new();
        assert!(region.mint(32).is_some());
        assert!(region.mint(1).is_none());
        assert_eq!(region.high_water(), 512);
    }

    #[test]
    fn oversized_mint_fails_without_advancing() {
        let mut region = Region::<512>::new();
        assert!(region.mint(33).is_none());
        assert!(region.mint(usize::MAX / 8).is_none());
        assert_eq!(region.high_water(), 0);
    }

    #[test]
    fn headers_round_trip() {
        let mut region = Region::<1024>::new();
        region.set_header(
            4,
            Header {
                next: SENTINEL,
                size: 7,
            },
        );
        region.set_next(4, 11);
        region.set_size(4, 9);
        assert_eq!(region.header(4), Header { next: 11, size: 9 });
    }

    #[test]
    fn payload_translation_round_trips() {
        let mut region = Region::<1024>::new();
        let block = region.mint(16).unwrap();
        let payload = region.payload(block);
        assert_eq!(payload.as_ptr() as usize % QUANTUM, 0);
        assert_eq!(region.index_of_payload(payload), Some(block));
    }

    #[test]
    fn foreign_pointers_are_rejected() {
        use core::ptr::NonNull;

        let mut region = Region::<1024>::new();
        let payload = region.payload(0).as_ptr();

        let misaligned = NonNull::new(payload.wrapping_add(1)).unwrap();
        assert_eq!(region.index_of_payload(misaligned), None);

        // the buffer base itself is a header address, not a payload
        let base = NonNull::new(payload.wrapping_sub(QUANTUM)).unwrap();
        assert_eq!(region.index_of_payload(base), None);

        let past_the_end = NonNull::new(payload.wrapping_add(1024)).unwrap();
        assert_eq!(region.index_of_payload(past_the_end), None);
    }
}
