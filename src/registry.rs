// Copyright © 2024 Andrea Corbellini and contributors
// SPDX-License-Identifier: BSD-3-Clause

use crate::error::Error;
use crate::error::Result;
use core::marker::PhantomData;
use core::ptr::NonNull;
use core::sync::atomic::AtomicU8;
use core::sync::atomic::Ordering;
use spin::Mutex;

/// Resolution interface a registered pool exposes to its compact pointers.
///
/// [`PoolPtr`](crate::PoolPtr) carries no reference to its pool (that is
/// the whole point of it), so dereferencing one goes through the
/// process-wide slot of the pool's tag, where the pool deposited itself as a
/// `dyn PoolResolver` at registration time.
pub trait PoolResolver {
    /// Base address of segment `segment_id` of manager `manager_id`.
    fn segment_base(&self, manager_id: usize, segment_id: usize) -> Result<NonNull<u8>>;

    /// Id of the manager whose memory contains `ptr`.
    fn find_manager_for_pointer(&self, ptr: NonNull<u8>) -> Result<usize>;

    /// Descriptor index, within manager `manager_id`, of the segment
    /// containing `ptr`.
    fn find_segment_in_manager(&self, manager_id: usize, ptr: NonNull<u8>) -> Result<usize>;
}

/// Compile-time identity of one pool.
///
/// A tag fixes the pool's geometry (and therefore the bit layout of its
/// compact pointers) and owns the process-wide registration slot that
/// compact-pointer resolution goes through. Two structurally identical pools
/// with different tags have incompatible pointer types; that is the
/// mechanism that keeps handles from one pool out of another.
///
/// Tags are declared with the [`pool_tag!`](crate::pool_tag) macro; do not
/// implement this trait by hand.
pub trait PoolTag: 'static {
    /// Size in bytes of the sub-blocks this pool vends. A power of two
    /// dividing the upstream block size.
    const SUB_BLOCK_SIZE: usize;
    /// Sub-blocks per segment: upstream block size / sub-block size.
    const SUB_BLOCK_COUNT: usize;
    /// Descriptor table cardinality of each segment manager.
    const MAX_SEGMENTS: usize;
    /// Cap on the manager chain length.
    const MAX_MANAGERS: usize;

    /// The process-wide registration slot of this tag.
    fn registry() -> &'static PoolRegistry;
}

/// Declares a [`PoolTag`]: a marker type with the pool geometry baked in,
/// plus its process-wide registration slot.
///
/// # Examples
///
/// ```
/// use thimble::max_segments_for;
/// use thimble::pool_tag;
///
/// pool_tag! {
///     /// Nodes of the byte-queue list.
///     pub struct ListNodes {
///         sub_block_size: 8,
///         sub_block_count: 2,
///         max_segments: max_segments_for(16),
///         max_managers: 32,
///     }
/// }
///
/// assert_eq!(<ListNodes as thimble::PoolTag>::SUB_BLOCK_SIZE, 8);
/// ```
#[macro_export]
macro_rules! pool_tag {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            sub_block_size: $sub:expr,
            sub_block_count: $count:expr,
            max_segments: $segs:expr,
            max_managers: $mgrs:expr $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
        $vis struct $name;

        impl $crate::PoolTag for $name {
            const SUB_BLOCK_SIZE: usize = $sub;
            const SUB_BLOCK_COUNT: usize = $count;
            const MAX_SEGMENTS: usize = $segs;
            const MAX_MANAGERS: usize = $mgrs;

            fn registry() -> &'static $crate::PoolRegistry {
                static REGISTRY: $crate::PoolRegistry = $crate::PoolRegistry::new();
                &REGISTRY
            }
        }
    };
}

/// Process-wide state of one [`PoolTag`]: the registered pool, if any, and
/// the two heuristic hint caches.
///
/// The hints memoize the last manager that satisfied an allocation and the
/// last manager that resolved a foreign pointer. They are heuristics only:
/// a stale hint costs a failed probe, never a wrong answer.
pub struct PoolRegistry {
    resolver: Mutex<Option<NonNull<dyn PoolResolver>>>,
    alloc_hint: AtomicU8,
    lookup_hint: AtomicU8,
}

// SAFETY: The crate is single-threaded by contract (see the crate-level
// documentation); the raw resolver pointer is only dereferenced while a
// `PoolRegistration` guard keeps the registered pool borrowed and in place.
unsafe impl Sync for PoolRegistry {}

impl PoolRegistry {
    /// An empty slot with cleared hints.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            resolver: Mutex::new(None),
            alloc_hint: AtomicU8::new(0),
            lookup_hint: AtomicU8::new(0),
        }
    }

    pub(crate) fn register(&self, resolver: &dyn PoolResolver) -> Result<()> {
        let mut slot = self.resolver.lock();
        if slot.is_some() {
            return Err(Error::RegistrationConflict);
        }
        // SAFETY: Only the lifetime is transmuted away. The caller
        // (`GrowingPool::register`) hands back a guard that borrows the pool
        // and clears this slot on drop, so the pointer never outlives the
        // pool it refers to.
        let resolver: NonNull<dyn PoolResolver> =
            unsafe { core::mem::transmute(NonNull::from(resolver)) };
        *slot = Some(resolver);
        Ok(())
    }

    pub(crate) fn unregister(&self) {
        *self.resolver.lock() = None;
        self.reset_hints();
    }

    /// Copies the registered resolver pointer out of the slot.
    pub(crate) fn resolver(&self) -> Option<NonNull<dyn PoolResolver>> {
        *self.resolver.lock()
    }

    pub(crate) fn alloc_hint(&self) -> usize {
        self.alloc_hint.load(Ordering::Relaxed) as usize
    }

    pub(crate) fn set_alloc_hint(&self, manager_id: usize) {
        debug_assert!(manager_id <= u8::MAX as usize, "hint out of range");
        self.alloc_hint.store(manager_id as u8, Ordering::Relaxed);
    }

    pub(crate) fn lookup_hint(&self) -> usize {
        self.lookup_hint.load(Ordering::Relaxed) as usize
    }

    pub(crate) fn set_lookup_hint(&self, manager_id: usize) {
        debug_assert!(manager_id <= u8::MAX as usize, "hint out of range");
        self.lookup_hint.store(manager_id as u8, Ordering::Relaxed);
    }

    pub(crate) fn reset_hints(&self) {
        self.alloc_hint.store(0, Ordering::Relaxed);
        self.lookup_hint.store(0, Ordering::Relaxed);
    }
}

impl Default for PoolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("registered", &self.resolver().is_some())
            .field("alloc_hint", &self.alloc_hint())
            .field("lookup_hint", &self.lookup_hint())
            .finish()
    }
}

/// Proof that a pool is registered for its tag.
///
/// Returned by [`GrowingPool::register`](crate::GrowingPool::register). The
/// guard borrows the pool, which makes the registration lifecycle a
/// compile-time property: the pool can neither move nor drop while its
/// address sits in the registry, and dropping the guard unregisters the tag
/// and clears its hint caches before the pool can go away.
#[derive(Debug)]
pub struct PoolRegistration<'p> {
    registry: &'static PoolRegistry,
    pool: PhantomData<&'p ()>,
}

impl<'p> PoolRegistration<'p> {
    pub(crate) fn new(registry: &'static PoolRegistry) -> Self {
        Self {
            registry,
            pool: PhantomData,
        }
    }
}

impl Drop for PoolRegistration<'_> {
    fn drop(&mut self) {
        self.registry.unregister();
    }
}
