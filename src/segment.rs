// Copyright © 2024 Andrea Corbellini and contributors
// SPDX-License-Identifier: BSD-3-Clause

use crate::alloc::BlockAllocator;
use crate::alloc::Handle;
use crate::error::Error;
use crate::error::Result;
use crate::freelist::RawFreeList;
use crate::freelist::NULL_INDEX;
use core::ptr::NonNull;

/// Descriptor of one segment: an upstream block re-interpreted as a free list
/// of uniform sub-blocks.
///
/// A segment is not an object in memory: it is a discipline applied to one
/// upstream block. The block itself holds nothing but sub-blocks (free ones
/// thread the free list through their first bytes); everything the segment
/// needs to know about itself lives in this descriptor, which sits in a
/// [`SegmentManager`](crate::manager::SegmentManager) table.
///
/// A descriptor is *valid* iff its backing handle is non-null. The descriptor
/// invariant is `live sub-blocks + free == sub-block count` at all times.
#[derive(Copy, Clone, Debug)]
pub(crate) struct SegmentSlot<H> {
    backing: H,
    head: u16,
    free: u16,
}

impl<H: Handle> SegmentSlot<H> {
    pub(crate) const EMPTY: Self = Self {
        backing: H::NULL,
        head: NULL_INDEX,
        free: 0,
    };

    #[inline]
    #[must_use]
    pub(crate) fn is_valid(&self) -> bool {
        !self.backing.is_null()
    }

    #[inline]
    #[must_use]
    pub(crate) fn free_count(&self) -> usize {
        self.free as usize
    }

    #[inline]
    #[must_use]
    pub(crate) fn backing(&self) -> H {
        self.backing
    }

    /// View of the backing block as a sub-block free list.
    fn freelist<A>(&self, upstream: &A, sub_size: usize) -> RawFreeList
    where
        A: BlockAllocator<Handle = H>,
    {
        debug_assert!(self.is_valid(), "free list of an invalid segment");
        let base = upstream.block_at(self.backing);
        // SAFETY: The backing block is `A::BLOCK_SIZE` bytes, aligned to the
        // block size (which `sub_size` divides), and owned by this segment
        // for as long as `backing` is non-null.
        unsafe { RawFreeList::new(base, sub_size, A::BLOCK_SIZE / sub_size) }
    }

    /// Adopts `backing` as this segment's block and arms a full free list.
    pub(crate) fn init<A>(&mut self, upstream: &A, backing: H, sub_size: usize)
    where
        A: BlockAllocator<Handle = H>,
    {
        debug_assert!(!self.is_valid(), "segment already backed");
        self.backing = backing;
        let list = self.freelist(upstream, sub_size);
        list.reset(&mut self.head, &mut self.free);
    }

    /// Re-arms the free list without touching the backing block handle.
    pub(crate) fn rearm<A>(&mut self, upstream: &A, sub_size: usize)
    where
        A: BlockAllocator<Handle = H>,
    {
        if self.is_valid() {
            let list = self.freelist(upstream, sub_size);
            list.reset(&mut self.head, &mut self.free);
        }
    }

    /// Pops one sub-block, or `None` if the segment is invalid or full of
    /// live sub-blocks.
    pub(crate) fn try_allocate<A>(&mut self, upstream: &A, sub_size: usize) -> Option<NonNull<u8>>
    where
        A: BlockAllocator<Handle = H>,
    {
        if !self.is_valid() {
            return None;
        }
        let list = self.freelist(upstream, sub_size);
        list.pop(&mut self.head, &mut self.free).ok()
    }

    /// Pushes a sub-block back; returns the backing block to the upstream
    /// allocator once the segment is fully free.
    pub(crate) fn deallocate<A>(
        &mut self,
        upstream: &A,
        sub_size: usize,
        ptr: NonNull<u8>,
    ) -> Result<()>
    where
        A: BlockAllocator<Handle = H>,
    {
        if !self.is_valid() {
            return Err(Error::InvalidId);
        }
        let list = self.freelist(upstream, sub_size);
        list.push(ptr, &mut self.head, &mut self.free)?;

        if self.free as usize == list.block_count() {
            log::trace!("segment fully free, returning its block upstream");
            upstream.deallocate_block(self.backing)?;
            *self = Self::EMPTY;
        }
        Ok(())
    }

    /// Returns `true` if `ptr` lies inside this segment's backing block.
    pub(crate) fn owns<A>(&self, upstream: &A, sub_size: usize, ptr: NonNull<u8>) -> bool
    where
        A: BlockAllocator<Handle = H>,
    {
        self.is_valid() && self.freelist(upstream, sub_size).owns(ptr)
    }

    /// Base address of the backing block.
    pub(crate) fn base<A>(&self, upstream: &A) -> Option<NonNull<u8>>
    where
        A: BlockAllocator<Handle = H>,
    {
        self.is_valid().then(|| upstream.block_at(self.backing))
    }
}
