//! The in-band block header.
//!
//! Every block handed out by the pool — free or allocated — starts with a
//! [`Header`]. The header stores the block's total size in *quanta* (multiples
//! of the header size, including the header itself) and, while the block sits
//! on the free list, the index of the next free block. While a block is
//! allocated the `next` field is meaningless; the payload begins exactly one
//! quantum past the header.
use core::mem;

/// The allocator's unit of accounting: the size of one [`Header`] in bytes.
///
/// The header is padded to the maximum scalar alignment (16 bytes), so every
/// payload — which starts one quantum past the block's base — satisfies any
/// scalar alignment requirement a client may have.
pub const QUANTUM: usize = mem::size_of::<Header>();

/// The virtual node index of the sentinel.
///
/// The free list is circular and anchored by a single size-zero node, which
/// does not live inside the backing region. It is addressed by this reserved
/// index, which orders *above* every real block, so the one wrap-around edge
/// of the circular list always passes through it.
pub const SENTINEL: usize = usize::MAX;

/// An in-band block header.
///
/// The `align(16)` forces both the size and the alignment of this type to the
/// maximum scalar alignment, independent of the pointer width. This is the
/// moral equivalent of a union with `max_align_t`: it keeps quanta and
/// payload addresses maximally aligned with no separate filler member.
#[repr(C, align(16))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    /// Quantum index of the next free block, or [`SENTINEL`].
    ///
    /// Only meaningful while the block is on the free list.
    pub next: usize,
    /// Total size of the block in quanta, inclusive of the header.
    pub size: usize,
}

// the "step back one quantum to find the header" rule relies on this
const _: () = assert!(mem::size_of::<Header>() == mem::align_of::<Header>());
const _: () = assert!(mem::size_of::<Header>() == 16);
