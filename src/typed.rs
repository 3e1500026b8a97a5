//! The typed adapter: element-typed array allocation on top of a [`Pool`].
//!
//! Container-style clients don't want to count bytes; they want `n` elements
//! of some `T`. [`TypedPool`] is a copyable, stateless handle that does the
//! multiplication, bounds-checks it against the pool capacity *before*
//! touching the allocator and translates the two possible failures into
//! distinct [`AllocError`] variants.
use crate::free_list::header::QUANTUM;
use crate::Pool;

use core::fmt;
use core::marker::PhantomData;
use core::mem;
use core::ptr::{self, NonNull};

/// A typed allocation request failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The element count alone exceeds the pool capacity. Raised before the
    /// allocator is consulted; the pool state is untouched.
    CapacityOverflow,
    /// The pool has no block large enough left and its backing region is
    /// drained.
    Exhausted,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CapacityOverflow => write!(f, "requested array exceeds the pool capacity"),
            Self::Exhausted => write!(f, "pool is exhausted"),
        }
    }
}

/// A typed handle to a [`Pool`], allocating arrays of `T`.
///
/// The handle holds nothing but the pool reference: it is `Copy`, free to
/// construct and adapter handles with *different* element types compare
/// equal as long as they name the same pool. That is the contract a generic
/// container needs to move storage between containers of related element
/// types.
pub struct TypedPool<'pool, T, const N: usize> {
    pool: &'pool Pool<N>,
    _element: PhantomData<fn() -> T>,
}

impl<'pool, T, const N: usize> TypedPool<'pool, T, N> {
    /// Create a handle allocating `T`s from `pool`.
    ///
    /// # Panics
    /// This function panics if `T` demands an alignment above the maximum
    /// scalar alignment; the pool never hands out memory aligned further
    /// than the 16-byte quantum.
    pub const fn new(pool: &'pool Pool<N>) -> Self {
        assert!(
            mem::align_of::<T>() <= QUANTUM,
            "element alignment exceeds the maximum scalar alignment"
        );
        Self {
            pool,
            _element: PhantomData,
        }
    }

    /// Allocate storage for `n` elements of `T`.
    ///
    /// The returned memory is uninitialised. A request that cannot fit the
    /// pool even in principle fails with [`AllocError::CapacityOverflow`]
    /// without touching the allocator; a pool that is merely out of memory
    /// reports [`AllocError::Exhausted`].
    pub fn allocate(&self, n: usize) -> Result<NonNull<T>, AllocError> {
        let element_size = mem::size_of::<T>();
        if element_size != 0 && n > N / element_size {
            return Err(AllocError::CapacityOverflow);
        }
        // cannot overflow: n <= N / element_size
        let n_bytes = n * element_size;
        match self.pool.allocate_bytes(n_bytes) {
            Some(payload) => Ok(payload.cast()),
            None => Err(AllocError::Exhausted),
        }
    }

    /// Return storage previously obtained from [`allocate`](Self::allocate).
    ///
    /// `_n` is accepted for interface symmetry with `allocate` and ignored;
    /// the block's in-band header already knows its size.
    ///
    /// # Safety
    /// `ptr` must have come from `allocate` on a handle to the same pool and
    /// not have been deallocated since.
    pub unsafe fn deallocate(&self, ptr: NonNull<T>, _n: usize) {
        // errors are caller bugs that the free list refused to act on
        let _ = self.pool.deallocate_bytes(ptr.cast());
    }
}

impl<T, const N: usize> Clone for TypedPool<'_, T, N> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T, const N: usize> Copy for TypedPool<'_, T, N> {}

impl<T, U, const N: usize> PartialEq<TypedPool<'_, U, N>> for TypedPool<'_, T, N> {
    /// Handles are equal when they name the same pool, regardless of their
    /// element types.
    fn eq(&self, other: &TypedPool<'_, U, N>) -> bool {
        ptr::eq(self.pool, other.pool)
    }
}
impl<T, const N: usize> Eq for TypedPool<'_, T, N> {}

impl<T, const N: usize> fmt::Debug for TypedPool<'_, T, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedPool")
            .field("pool", &(self.pool as *const _))
            .finish()
    }
}
