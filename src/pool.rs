// Copyright © 2024 Andrea Corbellini and contributors
// SPDX-License-Identifier: BSD-3-Clause

use crate::alloc::BlockAllocator;
use crate::alloc::Handle;
use crate::error::Error;
use crate::error::Result;
use crate::manager::SegmentManager;
use crate::ptr::PoolPtr;
use crate::registry::PoolRegistration;
use crate::registry::PoolResolver;
use crate::registry::PoolTag;
use crate::usage::PoolUsage;
use core::fmt;
use core::marker::PhantomData;
use core::ptr::NonNull;
use spin::Mutex;

/// One link of the pool's manager chain, stored in a single upstream block.
struct ManagerNode<A: BlockAllocator, G: PoolTag, const MS: usize> {
    manager: SegmentManager<A, G, MS>,
    next: A::Handle,
}

#[derive(Copy, Clone)]
struct Chain<H> {
    head: H,
    count: u16,
}

/// A growing pool: a chain of segment managers, each subdividing upstream
/// blocks into `G::SUB_BLOCK_SIZE`-byte sub-blocks.
///
/// The pool starts empty. Allocation first consults the tag's allocation
/// hint, then scans the managers in reverse insertion order, and finally,
/// if no manager has capacity, recruits a fresh manager node from the
/// upstream allocator, up to `G::MAX_MANAGERS`. Manager nodes themselves
/// live in upstream blocks, chained through compact handles; manager ids are
/// assigned sequentially and stay stable while a manager is alive (the chain
/// is prepended, so the head is always the youngest, highest-id manager).
///
/// Deallocation reclaims aggressively: a segment that goes fully free
/// returns its block to the upstream allocator, and a manager left with no
/// segments is peeled off the chain if it sits at the head. Only the head
/// can go, because ids are positional from the tail; peeling the youngest
/// manager keeps every other id, and therefore every live pointer, intact.
/// An idle manager stuck behind a live one simply waits its turn.
///
/// Sub-blocks are addressed by [`PoolPtr<u8, G>`](PoolPtr). Resolving such a
/// pointer without the pool in hand requires the pool to be
/// [registered](Self::register) for its tag.
///
/// `MS` must equal `G::MAX_SEGMENTS` (stable Rust cannot size an array from
/// an associated constant).
pub struct GrowingPool<'a, A: BlockAllocator, G: PoolTag, const MS: usize> {
    upstream: &'a A,
    chain: Mutex<Chain<A::Handle>>,
    tag: PhantomData<G>,
}

impl<'a, A: BlockAllocator, G: PoolTag, const MS: usize> GrowingPool<'a, A, G, MS> {
    const NODE_OK: () = assert!(
        size_of::<ManagerNode<A, G, MS>>() <= A::BLOCK_SIZE
            && align_of::<ManagerNode<A, G, MS>>() <= A::BLOCK_SIZE
            && G::MAX_MANAGERS >= 1
            && G::MAX_MANAGERS <= u8::MAX as usize,
        "a manager node must fit in one upstream block, and the manager cap \
         must fit the hint caches"
    );

    /// Creates an empty pool on top of `upstream`.
    ///
    /// No upstream blocks are taken until the first allocation.
    #[must_use]
    pub fn new(upstream: &'a A) -> Self {
        let () = Self::NODE_OK;
        Self {
            upstream,
            chain: Mutex::new(Chain {
                head: <A::Handle as Handle>::NULL,
                count: 0,
            }),
            tag: PhantomData,
        }
    }

    /// Deposits this pool in the registration slot of `G`, enabling
    /// [`PoolPtr`] resolution.
    ///
    /// Fails with [`Error::RegistrationConflict`] if another pool is already
    /// registered for the tag. The returned guard borrows the pool and
    /// unregisters it (clearing the tag's hint caches) when dropped.
    pub fn register(&self) -> Result<PoolRegistration<'_>> {
        G::registry().register(self)?;
        Ok(PoolRegistration::new(G::registry()))
    }

    /// Number of managers currently in the chain.
    #[must_use]
    pub fn manager_count(&self) -> usize {
        self.chain.lock().count as usize
    }

    /// Returns usage information for this pool.
    #[must_use]
    pub fn usage(&self) -> PoolUsage {
        let chain = self.chain.lock();
        let mut usage = PoolUsage {
            managers: chain.count as usize,
            segments: 0,
            free: 0,
            capacity: G::MAX_MANAGERS * MS * G::SUB_BLOCK_COUNT,
        };
        self.walk(&chain, |_, node| {
            usage.segments += node.manager.segment_count();
            usage.free += node.manager.free_blocks();
            true
        });
        usage
    }

    fn node_at(&self, handle: A::Handle) -> NonNull<ManagerNode<A, G, MS>> {
        self.upstream.block_at(handle).cast()
    }

    /// Walks the chain head-first, handing `(id, node)` pairs to `visit`
    /// until it returns `false`. The head has the highest id.
    fn walk<F>(&self, chain: &Chain<A::Handle>, mut visit: F)
    where
        F: FnMut(usize, &mut ManagerNode<A, G, MS>) -> bool,
    {
        let mut handle = chain.head;
        let mut id = chain.count as usize;
        while !handle.is_null() {
            id -= 1;
            let mut node = self.node_at(handle);
            // SAFETY: The chain lock is held by the caller, so this node is
            // not aliased; the block stays valid while the pool owns it.
            let node = unsafe { node.as_mut() };
            if !visit(id, node) {
                return;
            }
            handle = node.next;
        }
    }

    fn manager_by_id<'c>(
        &self,
        chain: &'c Chain<A::Handle>,
        id: usize,
    ) -> Result<&'c mut ManagerNode<A, G, MS>> {
        if id >= chain.count as usize {
            return Err(Error::InvalidId);
        }
        let mut found = Err(Error::InvalidId);
        self.walk(chain, |node_id, node| {
            if node_id == id {
                // SAFETY: Same exclusivity argument as in `walk`; the
                // lifetime is capped to the chain-lock borrow `'c`.
                found = Ok(unsafe { &mut *core::ptr::from_mut(node) });
                false
            } else {
                true
            }
        });
        found
    }

    fn encode(
        &self,
        manager_id: usize,
        manager: &SegmentManager<A, G, MS>,
        block: NonNull<u8>,
    ) -> Result<PoolPtr<u8, G>> {
        let segment_id = manager.find_segment_for_pointer(self.upstream, block)?;
        let base = manager.segment_base(self.upstream, segment_id)?;
        let offset = (block.as_ptr() as usize - base.as_ptr() as usize) / G::SUB_BLOCK_SIZE;
        Ok(PoolPtr::new(manager_id, segment_id, offset))
    }

    fn allocate_new_manager(&self, chain: &mut Chain<A::Handle>) -> Result<PoolPtr<u8, G>> {
        if chain.count as usize >= G::MAX_MANAGERS {
            log::error!("pool exhausted: manager cap of {} reached", G::MAX_MANAGERS);
            return Err(Error::Exhausted);
        }

        let handle = self.upstream.allocate_block()?;
        let mut node = self.node_at(handle);
        // SAFETY: The block was just vended, so it is unaliased raw storage;
        // `NODE_OK` guarantees size and alignment.
        unsafe {
            node.write(ManagerNode {
                manager: SegmentManager::new(),
                next: chain.head,
            });
        }
        chain.head = handle;
        let id = chain.count as usize;
        chain.count += 1;
        G::registry().set_alloc_hint(id);
        log::debug!("pool grew to {} managers", chain.count);

        // SAFETY: See `walk`; the chain lock is held.
        let node = unsafe { node.as_mut() };
        let block = node.manager.try_allocate(self.upstream)?;
        self.encode(id, &node.manager, block)
    }

    /// Peels segment-less managers off the head of the chain, returning
    /// their nodes to the upstream allocator.
    fn reclaim_idle_managers(&self, chain: &mut Chain<A::Handle>) {
        while !chain.head.is_null() {
            let mut node = self.node_at(chain.head);
            // SAFETY: The chain lock is held by the caller.
            let node = unsafe { node.as_mut() };
            if node.manager.segment_count() != 0 {
                break;
            }
            let handle = chain.head;
            chain.head = node.next;
            chain.count -= 1;
            let _ = self.upstream.deallocate_block(handle);
            log::trace!("pool shrank to {} managers", chain.count);
        }
    }
}

impl<'a, A: BlockAllocator, G: PoolTag, const MS: usize> BlockAllocator
    for GrowingPool<'a, A, G, MS>
{
    const BLOCK_SIZE: usize = G::SUB_BLOCK_SIZE;
    const BLOCK_COUNT: usize = G::MAX_MANAGERS * G::MAX_SEGMENTS * G::SUB_BLOCK_COUNT;

    type Handle = PoolPtr<u8, G>;

    fn allocate_block(&self) -> Result<PoolPtr<u8, G>> {
        let mut chain = self.chain.lock();
        let registry = G::registry();

        // Hinted manager first.
        let hint = registry.alloc_hint();
        if hint < chain.count as usize {
            let node = self.manager_by_id(&chain, hint)?;
            if let Ok(block) = node.manager.try_allocate(self.upstream) {
                return self.encode(hint, &node.manager, block);
            }
        }

        // Full scan, reverse insertion order, skipping the hinted manager.
        let mut allocated = None;
        self.walk(&chain, |id, node| {
            if id == hint {
                return true;
            }
            match node.manager.try_allocate(self.upstream) {
                Ok(block) => {
                    registry.set_alloc_hint(id);
                    allocated = Some(self.encode(id, &node.manager, block));
                    false
                }
                Err(_) => true,
            }
        });
        if let Some(result) = allocated {
            return result;
        }

        self.allocate_new_manager(&mut chain)
    }

    fn deallocate_block(&self, ptr: PoolPtr<u8, G>) -> Result<()> {
        if ptr.is_null() {
            return Err(Error::NotOwned);
        }
        let mut chain = self.chain.lock();
        let manager_id = ptr.manager_id();
        let node = self.manager_by_id(&chain, manager_id)?;
        let base = node.manager.segment_base(self.upstream, ptr.segment_id())?;
        // SAFETY: The offset is within the segment's backing block per the
        // packed-field range checks.
        let block = unsafe { base.byte_add(ptr.offset() * G::SUB_BLOCK_SIZE) };
        node.manager.deallocate(self.upstream, block)?;
        self.reclaim_idle_managers(&mut chain);
        Ok(())
    }

    fn block_at(&self, handle: PoolPtr<u8, G>) -> NonNull<u8> {
        assert!(!handle.is_null(), "null pool pointer");
        let chain = self.chain.lock();
        let node = self
            .manager_by_id(&chain, handle.manager_id())
            .expect("pool pointer refers to a manager that is not present");
        let base = node
            .manager
            .segment_base(self.upstream, handle.segment_id())
            .expect("pool pointer refers to a segment that is not present");
        // SAFETY: See `deallocate_block`.
        unsafe { base.byte_add(handle.offset() * G::SUB_BLOCK_SIZE) }
    }

    fn handle_of(&self, ptr: NonNull<u8>) -> Result<PoolPtr<u8, G>> {
        let chain = self.chain.lock();
        let manager_id = self.find_manager_locked(&chain, ptr)?;
        let node = self.manager_by_id(&chain, manager_id)?;
        let segment_id = node.manager.find_segment_for_pointer(self.upstream, ptr)?;
        let base = node.manager.segment_base(self.upstream, segment_id)?;
        let offset = (ptr.as_ptr() as usize - base.as_ptr() as usize) / G::SUB_BLOCK_SIZE;
        Ok(PoolPtr::new(manager_id, segment_id, offset))
    }

    fn owns(&self, ptr: NonNull<u8>) -> bool {
        let chain = self.chain.lock();
        self.find_manager_locked(&chain, ptr).is_ok()
    }

    fn free_blocks(&self) -> usize {
        let chain = self.chain.lock();
        let mut total = 0;
        self.walk(&chain, |_, node| {
            total += node.manager.free_blocks();
            true
        });
        total
    }

    fn reset(&self) {
        let chain = self.chain.lock();
        self.walk(&chain, |_, node| {
            node.manager.rearm(self.upstream);
            true
        });
        G::registry().reset_hints();
    }
}

impl<'a, A: BlockAllocator, G: PoolTag, const MS: usize> GrowingPool<'a, A, G, MS> {
    /// Manager lookup with the three-level cache: allocation hint, lookup
    /// hint, then a full scan.
    fn find_manager_locked(&self, chain: &Chain<A::Handle>, ptr: NonNull<u8>) -> Result<usize> {
        let registry = G::registry();
        let count = chain.count as usize;
        let alloc_hint = registry.alloc_hint();
        let lookup_hint = registry.lookup_hint();

        if alloc_hint < count {
            let node = self.manager_by_id(chain, alloc_hint)?;
            if node.manager.owns(self.upstream, ptr) {
                registry.set_lookup_hint(alloc_hint);
                return Ok(alloc_hint);
            }
        }

        if lookup_hint < count && lookup_hint != alloc_hint {
            let node = self.manager_by_id(chain, lookup_hint)?;
            if node.manager.owns(self.upstream, ptr) {
                return Ok(lookup_hint);
            }
        }

        let mut found = Err(Error::NotOwned);
        self.walk(chain, |id, node| {
            if id == alloc_hint || id == lookup_hint {
                return true;
            }
            if node.manager.owns(self.upstream, ptr) {
                registry.set_lookup_hint(id);
                found = Ok(id);
                false
            } else {
                true
            }
        });
        found
    }
}

impl<'a, A: BlockAllocator, G: PoolTag, const MS: usize> PoolResolver
    for GrowingPool<'a, A, G, MS>
{
    fn segment_base(&self, manager_id: usize, segment_id: usize) -> Result<NonNull<u8>> {
        let chain = self.chain.lock();
        let node = self.manager_by_id(&chain, manager_id)?;
        node.manager.segment_base(self.upstream, segment_id)
    }

    fn find_manager_for_pointer(&self, ptr: NonNull<u8>) -> Result<usize> {
        let chain = self.chain.lock();
        self.find_manager_locked(&chain, ptr)
    }

    fn find_segment_in_manager(&self, manager_id: usize, ptr: NonNull<u8>) -> Result<usize> {
        let chain = self.chain.lock();
        let node = self.manager_by_id(&chain, manager_id)?;
        node.manager.find_segment_for_pointer(self.upstream, ptr)
    }
}

impl<'a, A: BlockAllocator, G: PoolTag, const MS: usize> Drop for GrowingPool<'a, A, G, MS> {
    /// Walks the chain, returns every manager's segments to the upstream
    /// allocator, then returns the manager nodes themselves.
    fn drop(&mut self) {
        let chain = *self.chain.get_mut();
        let mut handle = chain.head;
        while !handle.is_null() {
            let mut node = self.node_at(handle);
            // SAFETY: `&mut self` makes the chain unaliased.
            let node = unsafe { node.as_mut() };
            let next = node.next;
            node.manager.cleanup(self.upstream);
            let _ = self.upstream.deallocate_block(handle);
            handle = next;
        }
    }
}

impl<'a, A: BlockAllocator, G: PoolTag, const MS: usize> fmt::Debug for GrowingPool<'a, A, G, MS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrowingPool")
            .field("sub_block_size", &G::SUB_BLOCK_SIZE)
            .field("managers", &self.manager_count())
            .field("max_managers", &G::MAX_MANAGERS)
            .finish()
    }
}
