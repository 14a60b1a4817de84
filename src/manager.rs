// Copyright © 2024 Andrea Corbellini and contributors
// SPDX-License-Identifier: BSD-3-Clause

use crate::alloc::BlockAllocator;
use crate::alloc::BlockHandle;
use crate::error::Error;
use crate::error::Result;
use crate::registry::PoolTag;
use crate::segment::SegmentSlot;
use core::marker::PhantomData;
use core::ptr::NonNull;

/// Bytes of a manager node reserved for the high-water mark and the chain
/// link, so that the descriptor table plus bookkeeping still fits in one
/// upstream block.
const RESERVE: usize = 4;

/// Largest descriptor table that still lets a manager node fit in one
/// upstream block of `block_size` bytes.
///
/// Use this to pick the `max_segments` field of a
/// [`pool_tag!`](crate::pool_tag) declaration for a given arena geometry.
#[must_use]
pub const fn max_segments_for(block_size: usize) -> usize {
    (block_size - RESERVE) / size_of::<SegmentSlot<BlockHandle>>()
}

/// A fixed-cardinality table of segments: up to `MS` descriptors of segments
/// holding `G::SUB_BLOCK_SIZE`-byte sub-blocks, all backed by blocks of the
/// upstream allocator `A`.
///
/// Descriptor slots are recruited in lowest-index-first order and tracked
/// with a high-water mark: slots below the mark may be live or vacated,
/// slots at or above it have never been used. A vacated slot (its segment
/// went fully free and returned its block) is re-filled before the mark is
/// extended.
///
/// `MS` must equal `G::MAX_SEGMENTS`; it is a separate parameter only
/// because stable Rust cannot use an associated constant as an array length.
pub(crate) struct SegmentManager<A: BlockAllocator, G: PoolTag, const MS: usize> {
    slots: [SegmentSlot<A::Handle>; MS],
    high_water: u16,
    tag: PhantomData<G>,
}

impl<A: BlockAllocator, G: PoolTag, const MS: usize> SegmentManager<A, G, MS> {
    const SUB: usize = G::SUB_BLOCK_SIZE;

    const GEOMETRY_OK: () = assert!(
        G::SUB_BLOCK_SIZE.is_power_of_two()
            && G::SUB_BLOCK_SIZE >= size_of::<u16>()
            && A::BLOCK_SIZE % G::SUB_BLOCK_SIZE == 0
            && G::SUB_BLOCK_COUNT == A::BLOCK_SIZE / G::SUB_BLOCK_SIZE
            && G::SUB_BLOCK_COUNT >= 2
            && MS == G::MAX_SEGMENTS
            && MS >= 2
            && MS <= u16::MAX as usize,
        "pool tag geometry does not match the upstream block layout"
    );

    #[must_use]
    pub(crate) fn new() -> Self {
        let () = Self::GEOMETRY_OK;
        Self {
            slots: [SegmentSlot::EMPTY; MS],
            high_water: 0,
            tag: PhantomData,
        }
    }

    /// Pops a sub-block from the first segment that has one, creating a new
    /// segment if none does.
    pub(crate) fn try_allocate(&mut self, upstream: &A) -> Result<NonNull<u8>> {
        for slot in &mut self.slots[..self.high_water as usize] {
            if let Some(block) = slot.try_allocate(upstream, Self::SUB) {
                return Ok(block);
            }
        }
        self.allocate_new_segment(upstream)
    }

    fn allocate_new_segment(&mut self, upstream: &A) -> Result<NonNull<u8>> {
        let index = self
            .slots
            .iter()
            .position(|slot| !slot.is_valid())
            .ok_or(Error::Exhausted)?;
        if index as u16 >= self.high_water {
            self.high_water = index as u16 + 1;
        }

        let backing = upstream.allocate_block()?;
        log::debug!("segment manager: new segment in descriptor slot {index}");
        let slot = &mut self.slots[index];
        slot.init(upstream, backing, Self::SUB);

        slot.try_allocate(upstream, Self::SUB).ok_or(Error::Exhausted)
    }

    /// Returns a sub-block to the segment that owns it.
    pub(crate) fn deallocate(&mut self, upstream: &A, ptr: NonNull<u8>) -> Result<()> {
        let segment_id = self.find_segment_for_pointer(upstream, ptr)?;
        self.slots[segment_id].deallocate(upstream, Self::SUB, ptr)
    }

    /// Returns `true` if any segment of this manager contains `ptr`.
    #[must_use]
    pub(crate) fn owns(&self, upstream: &A, ptr: NonNull<u8>) -> bool {
        self.slots[..self.high_water as usize]
            .iter()
            .any(|slot| slot.owns(upstream, Self::SUB, ptr))
    }

    /// Finds the descriptor index of the segment containing `ptr`.
    pub(crate) fn find_segment_for_pointer(&self, upstream: &A, ptr: NonNull<u8>) -> Result<usize> {
        self.slots[..self.high_water as usize]
            .iter()
            .position(|slot| slot.owns(upstream, Self::SUB, ptr))
            .ok_or(Error::NotOwned)
    }

    /// Base address of the segment with the given descriptor index.
    pub(crate) fn segment_base(&self, upstream: &A, segment_id: usize) -> Result<NonNull<u8>> {
        if segment_id >= self.high_water as usize {
            return Err(Error::InvalidId);
        }
        self.slots[segment_id]
            .base(upstream)
            .ok_or(Error::InvalidId)
    }

    /// Sub-blocks currently free across all segments.
    #[must_use]
    pub(crate) fn free_blocks(&self) -> usize {
        self.slots[..self.high_water as usize]
            .iter()
            .filter(|slot| slot.is_valid())
            .map(SegmentSlot::free_count)
            .sum()
    }

    /// Segments currently backed by an upstream block.
    #[must_use]
    pub(crate) fn segment_count(&self) -> usize {
        self.slots[..self.high_water as usize]
            .iter()
            .filter(|slot| slot.is_valid())
            .count()
    }

    /// Re-arms the free list of every backed segment, discarding all live
    /// sub-blocks but keeping the upstream blocks.
    pub(crate) fn rearm(&mut self, upstream: &A) {
        for slot in &mut self.slots[..self.high_water as usize] {
            slot.rearm(upstream, Self::SUB);
        }
    }

    /// Returns every backed segment's block to the upstream allocator.
    ///
    /// Called when the pool that owns this manager is being torn down.
    pub(crate) fn cleanup(&mut self, upstream: &A) {
        for slot in &mut self.slots[..self.high_water as usize] {
            if slot.is_valid() {
                let _ = upstream.deallocate_block(slot.backing());
                *slot = SegmentSlot::EMPTY;
            }
        }
        self.high_water = 0;
    }
}
