// Copyright © 2024 Andrea Corbellini and contributors
// SPDX-License-Identifier: BSD-3-Clause

use crate::alloc::Handle;
use crate::registry::PoolTag;
use core::cmp::Ordering;
use core::fmt;
use core::marker::PhantomData;
use core::ops::Add;
use core::ops::Sub;
use core::ptr::NonNull;

/// Bits needed to index `count` values (`0..count`). Never less than one.
const fn index_bits(count: usize) -> u32 {
    let bits = usize::BITS - (count - 1).leading_zeros();
    if bits == 0 {
        1
    } else {
        bits
    }
}

/// Bits needed to index `count` values plus one reserved sentinel.
const fn sentinel_bits(count: usize) -> u32 {
    usize::BITS - count.leading_zeros()
}

/// A bit-packed pointer into a [`GrowingPool`](crate::GrowingPool) tagged
/// with `G`.
///
/// A `PoolPtr` packs a `(manager, segment, offset)` triple into a single
/// `u16`, using exactly the bit widths the tag's geometry requires:
///
/// * `offset`: `ceil(log2(G::SUB_BLOCK_COUNT))` bits
/// * `segment`: `ceil(log2(G::MAX_SEGMENTS))` bits
/// * `manager`: `ceil(log2(G::MAX_MANAGERS + 1))` bits; the extra value
///   reserves the all-ones manager id as the null sentinel
///
/// This is what makes handle-linked structures affordable in a
/// kilobyte-scale arena: a `next` field costs one or two bytes instead of a
/// native pointer's eight.
///
/// Because the pointer stores no reference to its pool, resolution goes
/// through the process-wide slot of `G` (see
/// [`GrowingPool::register`](crate::GrowingPool::register)). A `PoolPtr`
/// resolves to an address if and only if it is non-null and its pool is
/// registered; handles from a pool with a different tag are a different
/// type and cannot be mixed in.
///
/// Offsets are sub-block-granular: `T` may be any type no larger than a
/// sub-block, and [`cast`](Self::cast) re-types a pointer freely within that
/// bound.
pub struct PoolPtr<T, G: PoolTag> {
    packed: u16,
    marker: PhantomData<fn() -> (T, G)>,
}

impl<T, G: PoolTag> PoolPtr<T, G> {
    /// Bits used by the `offset` field.
    pub const OFFSET_BITS: u32 = index_bits(G::SUB_BLOCK_COUNT);
    /// Bits used by the `segment` field.
    pub const SEGMENT_BITS: u32 = index_bits(G::MAX_SEGMENTS);
    /// Bits used by the `manager` field, including the null sentinel.
    pub const MANAGER_BITS: u32 = sentinel_bits(G::MAX_MANAGERS);
    /// Total bits of the packed representation.
    pub const TOTAL_BITS: u32 = Self::OFFSET_BITS + Self::SEGMENT_BITS + Self::MANAGER_BITS;

    const PACK_OK: () = assert!(
        Self::TOTAL_BITS <= u16::BITS && size_of::<T>() <= G::SUB_BLOCK_SIZE,
        "pool geometry does not fit the packed pointer representation, or \
         the pointee is larger than a sub-block"
    );

    const OFFSET_SHIFT: u32 = 0;
    const SEGMENT_SHIFT: u32 = Self::OFFSET_BITS;
    const MANAGER_SHIFT: u32 = Self::OFFSET_BITS + Self::SEGMENT_BITS;

    const OFFSET_MASK: u16 = ((1u32 << Self::OFFSET_BITS) - 1) as u16;
    const SEGMENT_MASK: u16 = ((1u32 << Self::SEGMENT_BITS) - 1) as u16;
    const MANAGER_MASK: u16 = ((1u32 << Self::MANAGER_BITS) - 1) as u16;

    /// Total sub-blocks addressable by this pointer type's pool.
    const CAPACITY: usize = G::MAX_MANAGERS * G::MAX_SEGMENTS * G::SUB_BLOCK_COUNT;

    /// The null pointer. The manager field holds the reserved all-ones
    /// value; the remaining fields are zero.
    pub const NULL: Self = Self {
        packed: Self::MANAGER_MASK << Self::MANAGER_SHIFT,
        marker: PhantomData,
    };

    /// Packs a `(manager, segment, offset)` triple.
    ///
    /// # Panics
    ///
    /// If any field is outside the range configured by `G`.
    #[must_use]
    pub fn new(manager_id: usize, segment_id: usize, offset: usize) -> Self {
        let () = Self::PACK_OK;
        assert!(manager_id < G::MAX_MANAGERS, "manager id out of range");
        assert!(segment_id < G::MAX_SEGMENTS, "segment id out of range");
        assert!(offset < G::SUB_BLOCK_COUNT, "offset out of range");
        let packed = ((manager_id as u16) << Self::MANAGER_SHIFT)
            | ((segment_id as u16) << Self::SEGMENT_SHIFT)
            | ((offset as u16) << Self::OFFSET_SHIFT);
        Self {
            packed,
            marker: PhantomData,
        }
    }

    /// Encodes a raw pointer previously resolved from this pool.
    ///
    /// The pool is consulted through the registration slot of `G`: first the
    /// owning manager is found (hint caches first, full scan as a last
    /// resort), then the segment, then the sub-block offset. If any step
    /// fails (the pool is not registered, the pointer is foreign, or it
    /// does not sit on a sub-block boundary), the result is null.
    #[must_use]
    pub fn from_raw(ptr: NonNull<T>) -> Self {
        let () = Self::PACK_OK;
        let byte = ptr.cast::<u8>();
        let Some(resolver) = G::registry().resolver() else {
            return Self::NULL;
        };
        // SAFETY: A resolver in the slot means a `PoolRegistration` guard is
        // alive, which keeps the registered pool borrowed and in place.
        let resolver = unsafe { resolver.as_ref() };

        let Ok(manager_id) = resolver.find_manager_for_pointer(byte) else {
            return Self::NULL;
        };
        let Ok(segment_id) = resolver.find_segment_in_manager(manager_id, byte) else {
            return Self::NULL;
        };
        let Ok(base) = resolver.segment_base(manager_id, segment_id) else {
            return Self::NULL;
        };

        let delta = byte.as_ptr() as usize - base.as_ptr() as usize;
        if delta % G::SUB_BLOCK_SIZE != 0 {
            return Self::NULL;
        }
        let offset = delta / G::SUB_BLOCK_SIZE;
        if offset >= G::SUB_BLOCK_COUNT {
            return Self::NULL;
        }
        Self::new(manager_id, segment_id, offset)
    }

    /// Returns `true` for the null pointer.
    #[inline]
    #[must_use]
    pub fn is_null(&self) -> bool {
        (self.packed >> Self::MANAGER_SHIFT) & Self::MANAGER_MASK == Self::MANAGER_MASK
    }

    /// The manager field.
    ///
    /// # Panics
    ///
    /// If the pointer is null.
    #[must_use]
    pub fn manager_id(&self) -> usize {
        assert!(!self.is_null(), "manager id of a null pool pointer");
        ((self.packed >> Self::MANAGER_SHIFT) & Self::MANAGER_MASK) as usize
    }

    /// The segment field.
    ///
    /// # Panics
    ///
    /// If the pointer is null.
    #[must_use]
    pub fn segment_id(&self) -> usize {
        assert!(!self.is_null(), "segment id of a null pool pointer");
        ((self.packed >> Self::SEGMENT_SHIFT) & Self::SEGMENT_MASK) as usize
    }

    /// The offset field, in sub-blocks.
    ///
    /// # Panics
    ///
    /// If the pointer is null.
    #[must_use]
    pub fn offset(&self) -> usize {
        assert!(!self.is_null(), "offset of a null pool pointer");
        ((self.packed >> Self::OFFSET_SHIFT) & Self::OFFSET_MASK) as usize
    }

    /// Resolves to an address, or `None` if the pointer is null or the pool
    /// of `G` is not currently registered.
    #[must_use]
    pub fn resolve(&self) -> Option<NonNull<T>> {
        if self.is_null() {
            return None;
        }
        let resolver = G::registry().resolver()?;
        // SAFETY: See `from_raw`.
        let resolver = unsafe { resolver.as_ref() };
        let base = resolver
            .segment_base(self.manager_id(), self.segment_id())
            .ok()?;
        // SAFETY: The offset stays inside the segment's backing block, whose
        // size is `SUB_BLOCK_SIZE * SUB_BLOCK_COUNT`.
        let addr = unsafe { base.byte_add(self.offset() * G::SUB_BLOCK_SIZE) };
        Some(addr.cast())
    }

    /// Resolves to an address.
    ///
    /// # Panics
    ///
    /// If the pointer is null or cannot be resolved. Dereferencing a null or
    /// dangling compact pointer is a programming error, not a runtime
    /// condition; use [`resolve`](Self::resolve) for the fallible form.
    #[must_use]
    pub fn get(&self) -> NonNull<T> {
        self.resolve()
            .expect("dereferenced a null or unresolvable pool pointer")
    }

    /// Re-types the pointer.
    ///
    /// The encoding is sub-block-granular, so any pointee no larger than a
    /// sub-block is admissible.
    #[must_use]
    pub fn cast<U>(self) -> PoolPtr<U, G> {
        let () = PoolPtr::<U, G>::PACK_OK;
        PoolPtr {
            packed: self.packed,
            marker: PhantomData,
        }
    }

    /// The pointer's position in the pool's linear address space:
    /// `manager × (segments × sub-blocks) + segment × sub-blocks + offset`.
    fn linear(&self) -> usize {
        let per_manager = G::MAX_SEGMENTS * G::SUB_BLOCK_COUNT;
        self.manager_id() * per_manager + self.segment_id() * G::SUB_BLOCK_COUNT + self.offset()
    }

    fn from_linear(linear: usize) -> Self {
        let per_manager = G::MAX_SEGMENTS * G::SUB_BLOCK_COUNT;
        Self::new(
            linear / per_manager,
            (linear % per_manager) / G::SUB_BLOCK_COUNT,
            linear % G::SUB_BLOCK_COUNT,
        )
    }

    /// Advances the pointer by `count` sub-blocks (negative to retreat).
    ///
    /// Advancing the null pointer is a no-op.
    ///
    /// # Panics
    ///
    /// On arithmetic past the start or the total capacity of the pool.
    #[must_use]
    pub fn advance(self, count: isize) -> Self {
        if self.is_null() {
            return self;
        }
        let linear = self.linear() as isize + count;
        assert!(linear >= 0, "pool pointer arithmetic past the start of the pool");
        assert!(
            (linear as usize) < Self::CAPACITY,
            "pool pointer arithmetic past the end of the pool"
        );
        Self::from_linear(linear as usize)
    }
}

impl<T, G: PoolTag> Add<isize> for PoolPtr<T, G> {
    type Output = Self;

    #[inline]
    fn add(self, count: isize) -> Self {
        self.advance(count)
    }
}

impl<T, G: PoolTag> Sub<isize> for PoolPtr<T, G> {
    type Output = Self;

    #[inline]
    fn sub(self, count: isize) -> Self {
        self.advance(-count)
    }
}

impl<T, G: PoolTag> Handle for PoolPtr<T, G> {
    const NULL: Self = Self::NULL;
}

impl<T, G: PoolTag> Default for PoolPtr<T, G> {
    #[inline]
    fn default() -> Self {
        Self::NULL
    }
}

impl<T, G: PoolTag> Clone for PoolPtr<T, G> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, G: PoolTag> Copy for PoolPtr<T, G> {}

impl<T, G: PoolTag> PartialEq for PoolPtr<T, G> {
    fn eq(&self, other: &Self) -> bool {
        match (self.is_null(), other.is_null()) {
            (true, true) => true,
            (false, false) => self.packed == other.packed,
            _ => false,
        }
    }
}

impl<T, G: PoolTag> Eq for PoolPtr<T, G> {}

impl<T, G: PoolTag> PartialEq<NonNull<T>> for PoolPtr<T, G> {
    /// A compact pointer equals a raw pointer when it resolves to the same
    /// address.
    fn eq(&self, other: &NonNull<T>) -> bool {
        self.resolve() == Some(*other)
    }
}

impl<T, G: PoolTag> PartialOrd for PoolPtr<T, G> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T, G: PoolTag> Ord for PoolPtr<T, G> {
    /// Null orders before every non-null pointer; non-null pointers order
    /// lexicographically on `(manager, segment, offset)`.
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.is_null(), other.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => self.linear().cmp(&other.linear()),
        }
    }
}

impl<T, G: PoolTag> fmt::Debug for PoolPtr<T, G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "PoolPtr(null)")
        } else {
            write!(
                f,
                "PoolPtr({}, {}, {})",
                self.manager_id(),
                self.segment_id(),
                self.offset()
            )
        }
    }
}
