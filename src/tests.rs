// Copyright © 2024 Andrea Corbellini and contributors
// SPDX-License-Identifier: BSD-3-Clause

use crate::pool_tag;
use crate::BlockAllocator;
use crate::Error;
use crate::GrowingPool;
use crate::ListNode;
use crate::OffsetList;
use crate::PoolPtr;
use crate::Queue;
use crate::RingBuffer;
use crate::SlotArena;
use core::alloc::GlobalAlloc;
use core::alloc::Layout;
use core::ptr::NonNull;
use rand::rngs::SmallRng;
use rand::Rng;
use rand::SeedableRng;
use std::collections::VecDeque;
use std::vec::Vec;

/// The canonical deployment geometry: a 2 KiB arena of 16-byte blocks with
/// 8-byte pool sub-blocks.
const BS: usize = 16;
const BC: usize = 128;
const MS: usize = crate::max_segments_for(BS);

type Arena2K<'a> = SlotArena<'a, BS, BC>;

#[repr(align(16))]
struct Memory2K([u8; BS * BC]);

impl Memory2K {
    fn new() -> Self {
        Self([0; BS * BC])
    }
}

// ============================================================================
// Root arena
// ============================================================================

#[test]
fn arena_vends_low_addresses_first() {
    let mut memory = Memory2K::new();
    let arena = Arena2K::from_slice(&mut memory.0);

    let first = arena.allocate_block().unwrap();
    let second = arena.allocate_block().unwrap();
    assert_eq!(arena.block_at(first), arena.base());
    assert_eq!(
        arena.block_at(second).as_ptr() as usize,
        arena.base().as_ptr() as usize + BS,
    );
}

#[test]
fn arena_usage_accounts_every_block() {
    let mut memory = Memory2K::new();
    let arena = Arena2K::from_slice(&mut memory.0);

    let mut held = Vec::new();
    for expected_used in 1..=10 {
        held.push(arena.allocate_block().unwrap());
        let usage = arena.usage();
        assert_eq!(usage.total, BC);
        assert_eq!(usage.used, expected_used);
        assert_eq!(usage.used + usage.free, usage.total);
    }
    for handle in held {
        arena.deallocate_block(handle).unwrap();
    }
    assert_eq!(arena.free_blocks(), BC);
}

#[test]
fn arena_exhaustion_and_reuse() {
    let mut memory = Memory2K::new();
    let arena = Arena2K::from_slice(&mut memory.0);

    let mut held = Vec::new();
    for _ in 0..BC {
        held.push(arena.allocate_block().unwrap());
    }
    assert_eq!(arena.allocate_block(), Err(Error::OutOfMemory));

    arena.deallocate_block(held.pop().unwrap()).unwrap();
    assert!(arena.allocate_block().is_ok());
}

#[test]
fn arena_ownership_round_trip() {
    let mut memory = Memory2K::new();
    let arena = Arena2K::from_slice(&mut memory.0);

    let handle = arena.allocate_block().unwrap();
    let ptr = arena.block_at(handle);
    assert!(arena.owns(ptr));
    assert_eq!(arena.handle_of(ptr).unwrap(), handle);

    let mut foreign = [0u8; 4];
    let foreign = NonNull::new(foreign.as_mut_ptr()).unwrap();
    assert!(!arena.owns(foreign));
    assert_eq!(arena.handle_of(foreign), Err(Error::NotOwned));
}

#[test]
fn arena_general_purpose_entry() {
    let mut memory = Memory2K::new();
    let arena = Arena2K::from_slice(&mut memory.0);

    // Fits in a block: vended from the arena.
    let small = Layout::from_size_align(8, 4).unwrap();
    let ptr = unsafe { arena.alloc(small) };
    assert!(!ptr.is_null());
    assert!(arena.owns(NonNull::new(ptr).unwrap()));
    assert_eq!(arena.free_blocks(), BC - 1);
    unsafe { arena.dealloc(ptr, small) };
    assert_eq!(arena.free_blocks(), BC);

    // Too large, and no upstream registered: fails.
    let large = Layout::from_size_align(64, 8).unwrap();
    assert!(unsafe { arena.alloc(large) }.is_null());
}

// ============================================================================
// Growing pool
// ============================================================================

#[test]
fn pool_reclaims_empty_segments() {
    pool_tag! {
        struct Reclaim {
            sub_block_size: 8,
            sub_block_count: 2,
            max_segments: crate::max_segments_for(16),
            max_managers: 32,
        }
    }

    let mut memory = Memory2K::new();
    let arena = Arena2K::from_slice(&mut memory.0);
    {
        let pool = GrowingPool::<_, Reclaim, MS>::new(&arena);
        let _registration = pool.register().unwrap();

        // First sub-block costs a manager node and a segment.
        let a = pool.allocate_block().unwrap();
        assert_eq!(arena.free_blocks(), BC - 2);
        // Second one shares the segment.
        let b = pool.allocate_block().unwrap();
        assert_eq!(arena.free_blocks(), BC - 2);
        // Third one opens a second segment.
        let c = pool.allocate_block().unwrap();
        assert_eq!(arena.free_blocks(), BC - 3);

        // Draining a segment returns its block to the arena; the manager
        // keeps its other segment, so its node stays.
        pool.deallocate_block(c).unwrap();
        assert_eq!(arena.free_blocks(), BC - 2);
        assert_eq!(pool.manager_count(), 1);

        // Draining the last segment leaves the manager idle, and an idle
        // manager at the head of the chain is peeled off with it.
        pool.deallocate_block(a).unwrap();
        pool.deallocate_block(b).unwrap();
        assert_eq!(arena.free_blocks(), BC);
        assert_eq!(pool.manager_count(), 0);

        // The pool grows again from scratch on the next request.
        let d = pool.allocate_block().unwrap();
        assert_eq!(d.manager_id(), 0);
        pool.deallocate_block(d).unwrap();
    }
    // Nothing left for the pool's drop to return.
    assert_eq!(arena.free_blocks(), BC);
}

#[test]
fn pool_refills_lowest_vacated_segment() {
    pool_tag! {
        struct Refill {
            sub_block_size: 8,
            sub_block_count: 2,
            max_segments: crate::max_segments_for(16),
            max_managers: 32,
        }
    }

    let mut memory = Memory2K::new();
    let arena = Arena2K::from_slice(&mut memory.0);
    let pool = GrowingPool::<_, Refill, MS>::new(&arena);
    let _registration = pool.register().unwrap();

    // Fill both segments of manager 0.
    let a = pool.allocate_block().unwrap();
    let b = pool.allocate_block().unwrap();
    let c = pool.allocate_block().unwrap();
    let _d = pool.allocate_block().unwrap();
    assert_eq!(a.segment_id(), 0);
    assert_eq!(c.segment_id(), 1);

    // Drain segment 0; its descriptor slot is vacated.
    pool.deallocate_block(a).unwrap();
    pool.deallocate_block(b).unwrap();

    // The next allocation recruits the lowest vacated slot.
    let e = pool.allocate_block().unwrap();
    assert_eq!(e.manager_id(), 0);
    assert_eq!(e.segment_id(), 0);
}

#[test]
fn pool_growth_and_hint_locality() {
    pool_tag! {
        struct Growth {
            sub_block_size: 8,
            sub_block_count: 2,
            max_segments: crate::max_segments_for(16),
            max_managers: 32,
        }
    }

    let mut memory = Memory2K::new();
    let arena = Arena2K::from_slice(&mut memory.0);
    let pool = GrowingPool::<_, Growth, MS>::new(&arena);
    let _registration = pool.register().unwrap();

    // Each manager holds MS segments × 2 sub-blocks. Fill three managers.
    let per_manager = MS * 2;
    let mut held = Vec::new();
    for _ in 0..3 * per_manager {
        held.push(pool.allocate_block().unwrap());
    }
    assert_eq!(pool.manager_count(), 3);
    assert_eq!(held[0].manager_id(), 0);
    assert_eq!(held[2 * per_manager].manager_id(), 2);
    assert_eq!(pool.free_blocks(), 0);

    // Free a single block from manager 0: the next allocation must find it
    // even though the allocation hint points at manager 2.
    let first = held.remove(0);
    pool.deallocate_block(first).unwrap();
    let again = pool.allocate_block().unwrap();
    assert_eq!(again.manager_id(), 0);
}

#[test]
fn pool_deallocate_rejects_bad_pointers() {
    pool_tag! {
        struct Reject {
            sub_block_size: 8,
            sub_block_count: 2,
            max_segments: crate::max_segments_for(16),
            max_managers: 32,
        }
    }

    let mut memory = Memory2K::new();
    let arena = Arena2K::from_slice(&mut memory.0);
    let pool = GrowingPool::<_, Reject, MS>::new(&arena);
    let _registration = pool.register().unwrap();

    let _live = pool.allocate_block().unwrap();
    assert_eq!(
        pool.deallocate_block(PoolPtr::NULL),
        Err(Error::NotOwned)
    );
    // Manager 5 does not exist.
    assert_eq!(
        pool.deallocate_block(PoolPtr::new(5, 0, 0)),
        Err(Error::InvalidId)
    );
}

#[test]
fn pool_size_tracks_free_sub_blocks() {
    pool_tag! {
        struct Sizes {
            sub_block_size: 8,
            sub_block_count: 2,
            max_segments: crate::max_segments_for(16),
            max_managers: 32,
        }
    }

    let mut memory = Memory2K::new();
    let arena = Arena2K::from_slice(&mut memory.0);
    let pool = GrowingPool::<_, Sizes, MS>::new(&arena);
    let _registration = pool.register().unwrap();

    assert_eq!(pool.free_blocks(), 0);
    let a = pool.allocate_block().unwrap();
    // One segment of two sub-blocks, one live.
    assert_eq!(pool.free_blocks(), 1);
    let usage = pool.usage();
    assert_eq!(usage.managers, 1);
    assert_eq!(usage.segments, 1);
    assert_eq!(usage.free, 1);

    pool.deallocate_block(a).unwrap();
    // The segment went fully free and was reclaimed.
    assert_eq!(pool.free_blocks(), 0);
}

#[test]
fn pool_reset_rearms_segments_in_place() {
    pool_tag! {
        struct Rearm {
            sub_block_size: 8,
            sub_block_count: 2,
            max_segments: crate::max_segments_for(16),
            max_managers: 32,
        }
    }

    let mut memory = Memory2K::new();
    let arena = Arena2K::from_slice(&mut memory.0);
    let pool = GrowingPool::<_, Rearm, MS>::new(&arena);
    let _registration = pool.register().unwrap();

    for _ in 0..4 {
        let _ = pool.allocate_block().unwrap();
    }
    let held_blocks = BC - arena.free_blocks();
    assert_eq!(pool.free_blocks(), 0);

    pool.reset();
    // Every sub-block is free again, but no arena block moved.
    assert_eq!(pool.free_blocks(), 4);
    assert_eq!(BC - arena.free_blocks(), held_blocks);
}

#[test]
fn pool_registration_conflict() {
    pool_tag! {
        struct Conflicted {
            sub_block_size: 8,
            sub_block_count: 2,
            max_segments: crate::max_segments_for(16),
            max_managers: 32,
        }
    }

    let mut memory = Memory2K::new();
    let arena = Arena2K::from_slice(&mut memory.0);
    let first = GrowingPool::<_, Conflicted, MS>::new(&arena);
    let second = GrowingPool::<_, Conflicted, MS>::new(&arena);

    let registration = first.register().unwrap();
    assert_eq!(second.register().err(), Some(Error::RegistrationConflict));

    // Unregistering frees the tag.
    drop(registration);
    assert!(second.register().is_ok());
}

// ============================================================================
// Compact pointers
// ============================================================================

#[test]
fn pointer_round_trip_through_raw() {
    pool_tag! {
        struct Trip {
            sub_block_size: 8,
            sub_block_count: 2,
            max_segments: crate::max_segments_for(16),
            max_managers: 32,
        }
    }

    let mut memory = Memory2K::new();
    let arena = Arena2K::from_slice(&mut memory.0);
    let pool = GrowingPool::<_, Trip, MS>::new(&arena);
    let _registration = pool.register().unwrap();

    for _ in 0..5 {
        let ptr = pool.allocate_block().unwrap();
        let raw = ptr.resolve().unwrap();
        assert!(arena.owns(raw));
        assert_eq!(PoolPtr::from_raw(raw), ptr);
        assert!(ptr == raw);
    }
}

#[test]
fn pointer_null_never_resolves() {
    pool_tag! {
        struct Nulls {
            sub_block_size: 8,
            sub_block_count: 2,
            max_segments: crate::max_segments_for(16),
            max_managers: 32,
        }
    }

    let null = PoolPtr::<u8, Nulls>::NULL;
    assert!(null.is_null());
    assert_eq!(null.resolve(), None);
    assert_eq!(PoolPtr::<u8, Nulls>::default(), null);

    // A non-null pointer with no registered pool does not resolve either.
    let dangling = PoolPtr::<u8, Nulls>::new(0, 0, 0);
    assert!(!dangling.is_null());
    assert_eq!(dangling.resolve(), None);
}

#[test]
fn pointer_ordering() {
    pool_tag! {
        struct Ordered {
            sub_block_size: 8,
            sub_block_count: 2,
            max_segments: crate::max_segments_for(16),
            max_managers: 32,
        }
    }

    type P = PoolPtr<u8, Ordered>;
    let mut pointers = [
        P::new(1, 0, 0),
        P::new(0, 0, 1),
        P::NULL,
        P::new(0, 1, 0),
        P::new(0, 0, 0),
    ];
    pointers.sort();
    assert_eq!(
        pointers,
        [
            P::NULL,
            P::new(0, 0, 0),
            P::new(0, 0, 1),
            P::new(0, 1, 0),
            P::new(1, 0, 0),
        ]
    );
}

#[test]
fn pointer_arithmetic_round_trip() {
    pool_tag! {
        struct Math {
            sub_block_size: 8,
            sub_block_count: 2,
            max_segments: crate::max_segments_for(16),
            max_managers: 32,
        }
    }

    type P = PoolPtr<u8, Math>;
    let p = P::new(1, 1, 1);
    for n in 0..8isize {
        assert_eq!((p + n) - n, p);
    }
    // Advancement carries across segment and manager boundaries.
    assert_eq!(P::new(0, 0, 1) + 1, P::new(0, 1, 0));
    assert_eq!(P::new(0, MS - 1, 1) + 1, P::new(1, 0, 0));
    // Advancing null is a no-op.
    assert_eq!(P::NULL + 5, P::NULL);
}

#[test]
#[should_panic(expected = "past the start")]
fn pointer_arithmetic_underflow_is_fatal() {
    pool_tag! {
        struct Under {
            sub_block_size: 8,
            sub_block_count: 2,
            max_segments: crate::max_segments_for(16),
            max_managers: 32,
        }
    }

    let _ = PoolPtr::<u8, Under>::new(0, 0, 0) - 1;
}

#[test]
#[should_panic(expected = "past the end")]
fn pointer_arithmetic_overflow_is_fatal() {
    pool_tag! {
        struct Over {
            sub_block_size: 8,
            sub_block_count: 2,
            max_segments: crate::max_segments_for(16),
            max_managers: 32,
        }
    }

    let last = PoolPtr::<u8, Over>::new(31, MS - 1, 1);
    let _ = last + 1;
}

#[test]
#[should_panic(expected = "null pool pointer")]
fn pointer_field_access_on_null_is_fatal() {
    pool_tag! {
        struct NullField {
            sub_block_size: 8,
            sub_block_count: 2,
            max_segments: crate::max_segments_for(16),
            max_managers: 32,
        }
    }

    let _ = PoolPtr::<u8, NullField>::NULL.manager_id();
}

// ============================================================================
// Ring buffer
// ============================================================================

#[test]
fn ring_wrap_around() {
    let mut memory = Memory2K::new();
    let arena = Arena2K::from_slice(&mut memory.0);

    let mut ring = RingBuffer::<u8, _, 8>::new_in(&arena).unwrap();
    for byte in 0..8 {
        ring.push(&arena, byte).unwrap();
    }
    assert!(ring.is_full());
    assert_eq!(ring.push(&arena, 99), Err(Error::Full));

    for expected in 0..4 {
        assert_eq!(ring.pop(&arena).unwrap(), expected);
    }
    for byte in 8..12 {
        ring.push(&arena, byte).unwrap();
    }

    let seen: Vec<u8> = ring.iter(&arena).copied().collect();
    assert_eq!(seen, [4, 5, 6, 7, 8, 9, 10, 11]);
    assert_eq!(ring.len() + ring.free(), ring.capacity());

    ring.release(&arena).unwrap();
    assert_eq!(arena.free_blocks(), BC);
}

#[test]
fn ring_accessors() {
    let mut memory = Memory2K::new();
    let arena = Arena2K::from_slice(&mut memory.0);

    let mut ring = RingBuffer::<u8, _, 8>::new_in(&arena).unwrap();
    assert_eq!(ring.front(&arena), Err(Error::Empty));
    assert_eq!(ring.back(&arena), Err(Error::Empty));
    assert_eq!(ring.pop(&arena), Err(Error::Empty));

    for byte in 10..14 {
        ring.push_with(&arena, || byte).unwrap();
    }
    assert_eq!(*ring.front(&arena).unwrap(), 10);
    assert_eq!(*ring.back(&arena).unwrap(), 13);
    assert_eq!(ring.at(&arena, 2), Some(&12));
    assert_eq!(ring.at(&arena, 4), None);

    let reversed: Vec<u8> = ring.iter(&arena).rev().copied().collect();
    assert_eq!(reversed, [13, 12, 11, 10]);

    ring.clear(&arena);
    assert!(ring.is_empty());
    ring.release(&arena).unwrap();
}

// ============================================================================
// Offset list
// ============================================================================

pool_tag! {
    struct ListTag {
        sub_block_size: 8,
        sub_block_count: 2,
        max_segments: crate::max_segments_for(16),
        max_managers: 32,
    }
}

struct ValueNode {
    next: PoolPtr<ValueNode, ListTag>,
    value: u32,
}

impl ListNode for ValueNode {
    type Tag = ListTag;

    fn next(&self) -> PoolPtr<Self, ListTag> {
        self.next
    }

    fn set_next(&mut self, next: PoolPtr<Self, ListTag>) {
        self.next = next;
    }
}

fn make_node(
    pool: &impl BlockAllocator<Handle = PoolPtr<u8, ListTag>>,
    value: u32,
) -> PoolPtr<ValueNode, ListTag> {
    let raw = pool.allocate_block().unwrap();
    let node = raw.cast::<ValueNode>();
    unsafe {
        node.get().write(ValueNode {
            next: PoolPtr::NULL,
            value,
        });
    }
    node
}

fn values(list: &OffsetList<ValueNode>) -> Vec<u32> {
    list.iter()
        .map(|ptr| unsafe { ptr.get().as_ref() }.value)
        .collect()
}

#[test]
fn list_linking() {
    let mut memory = Memory2K::new();
    let arena = Arena2K::from_slice(&mut memory.0);
    let pool = GrowingPool::<_, ListTag, MS>::new(&arena);
    let _registration = pool.register().unwrap();

    let mut list = OffsetList::<ValueNode>::new();
    assert!(list.is_empty());
    assert_eq!(list.pop_front().err(), Some(Error::Empty));

    list.push_front(make_node(&pool, 2));
    list.push_front(make_node(&pool, 1));
    list.push_back(make_node(&pool, 3));
    assert_eq!(values(&list), [1, 2, 3]);
    assert_eq!(list.len(), 3);

    // Insert after the head, then erase it again.
    let head = list.front().unwrap();
    list.insert_after(head, make_node(&pool, 9));
    assert_eq!(values(&list), [1, 9, 2, 3]);
    let erased = list.erase_after(head).unwrap();
    assert_eq!(unsafe { erased.get().as_ref() }.value, 9);
    pool.deallocate_block(erased.cast()).unwrap();
    assert_eq!(values(&list), [1, 2, 3]);

    // Null position addresses the front.
    list.insert_after(PoolPtr::NULL, make_node(&pool, 0));
    assert_eq!(values(&list), [0, 1, 2, 3]);

    let back = list.pop_back().unwrap();
    assert_eq!(unsafe { back.get().as_ref() }.value, 3);
    pool.deallocate_block(back.cast()).unwrap();

    let target = list.front().unwrap();
    assert!(list.remove(target));
    assert!(!list.remove(target));
    pool.deallocate_block(target.cast()).unwrap();
    assert_eq!(values(&list), [1, 2]);

    while let Ok(node) = list.pop_front() {
        pool.deallocate_block(node.cast()).unwrap();
    }
    assert!(list.is_empty());
}

// ============================================================================
// Queue
// ============================================================================

#[test]
fn queue_node_birth_and_death() {
    pool_tag! {
        struct Birth {
            sub_block_size: 8,
            sub_block_count: 2,
            max_segments: crate::max_segments_for(16),
            max_managers: 32,
        }
    }

    let mut memory = Memory2K::new();
    let arena = Arena2K::from_slice(&mut memory.0);
    let pool = GrowingPool::<_, Birth, MS>::new(&arena);
    let _registration = pool.register().unwrap();

    // Per-node capacity of four bytes.
    let mut queue = Queue::<u8, _, Birth, 4>::new();
    for byte in 0..6 {
        queue.push(&arena, &pool, byte).unwrap();
    }
    // One full node (0..4), one holding 4 and 5.
    assert_eq!(queue.node_count(), 2);
    assert_eq!(queue.len(), 6);

    for expected in 0..4 {
        assert_eq!(queue.pop(&arena, &pool).unwrap(), expected);
    }
    // The drained node is gone.
    assert_eq!(queue.node_count(), 1);

    queue.push(&arena, &pool, 6).unwrap();
    assert_eq!(queue.node_count(), 1);
    assert_eq!(*queue.front(&arena).unwrap(), 4);
    assert_eq!(*queue.back(&arena).unwrap(), 6);
    for expected in 4..7 {
        assert_eq!(queue.pop(&arena, &pool).unwrap(), expected);
    }
    assert!(queue.is_empty());
    assert_eq!(queue.pop(&arena, &pool).err(), Some(Error::Empty));
}

#[test]
fn queue_interleaved_isolation() {
    pool_tag! {
        struct Interleaved {
            sub_block_size: 8,
            sub_block_count: 2,
            max_segments: crate::max_segments_for(16),
            max_managers: 32,
        }
    }

    let mut memory = Memory2K::new();
    let arena = Arena2K::from_slice(&mut memory.0);
    {
        let pool = GrowingPool::<_, Interleaved, MS>::new(&arena);
        let _registration = pool.register().unwrap();

        let mut q0 = Queue::<u8, _, Interleaved, 16>::new();
        q0.push(&arena, &pool, 0).unwrap();
        q0.push(&arena, &pool, 1).unwrap();

        let mut q1 = Queue::<u8, _, Interleaved, 16>::new();
        q1.push(&arena, &pool, 3).unwrap();
        q0.push(&arena, &pool, 2).unwrap();
        q1.push(&arena, &pool, 4).unwrap();

        assert_eq!(q0.pop(&arena, &pool).unwrap(), 0);
        assert_eq!(q0.pop(&arena, &pool).unwrap(), 1);
        assert_eq!(q1.len(), 2);

        q0.push(&arena, &pool, 5).unwrap();
        q1.push(&arena, &pool, 6).unwrap();
        assert_eq!(q0.pop(&arena, &pool).unwrap(), 2);
        assert_eq!(q0.pop(&arena, &pool).unwrap(), 5);
        q0.clear(&arena, &pool).unwrap();

        assert_eq!(q1.pop(&arena, &pool).unwrap(), 3);
        assert_eq!(q1.pop(&arena, &pool).unwrap(), 4);
        assert_eq!(q1.pop(&arena, &pool).unwrap(), 6);
        q1.clear(&arena, &pool).unwrap();
    }
    // Everything went back: the arena ends empty.
    assert_eq!(arena.free_blocks(), BC);
}

#[test]
fn queue_extend_and_length() {
    pool_tag! {
        struct Extend {
            sub_block_size: 8,
            sub_block_count: 2,
            max_segments: crate::max_segments_for(16),
            max_managers: 32,
        }
    }

    let mut memory = Memory2K::new();
    let arena = Arena2K::from_slice(&mut memory.0);
    let pool = GrowingPool::<_, Extend, MS>::new(&arena);
    let _registration = pool.register().unwrap();

    let mut queue = Queue::<u8, _, Extend, 16>::new();
    let payload: Vec<u8> = (0..48).collect();
    queue.extend_from_slice(&arena, &pool, &payload).unwrap();
    assert_eq!(queue.len(), 48);
    assert_eq!(queue.node_count(), 3);

    for expected in 0..48 {
        assert_eq!(queue.pop(&arena, &pool).unwrap(), expected);
    }
    assert!(queue.is_empty());
    queue.clear(&arena, &pool).unwrap();
}

#[test]
#[cfg(not(miri))]
fn queue_random_against_model() {
    pool_tag! {
        struct Model {
            sub_block_size: 8,
            sub_block_count: 2,
            max_segments: crate::max_segments_for(16),
            max_managers: 32,
        }
    }

    let mut memory = Memory2K::new();
    let arena = Arena2K::from_slice(&mut memory.0);
    let pool = GrowingPool::<_, Model, MS>::new(&arena);
    let _registration = pool.register().unwrap();

    let mut queue = Queue::<u8, _, Model, 16>::new();
    let mut model = VecDeque::new();
    let mut rng = SmallRng::seed_from_u64(12345);

    for _ in 0..4000 {
        if model.len() < 256 && rng.gen_range(0..3) > 0 {
            let byte: u8 = rng.gen();
            queue.push(&arena, &pool, byte).unwrap();
            model.push_back(byte);
        } else {
            assert_eq!(queue.pop(&arena, &pool).ok(), model.pop_front());
        }
        assert_eq!(queue.len(), model.len());
    }

    while let Some(expected) = model.pop_front() {
        assert_eq!(queue.pop(&arena, &pool).unwrap(), expected);
    }
    assert!(queue.is_empty());
    queue.clear(&arena, &pool).unwrap();
}

// ============================================================================
// Errors
// ============================================================================

#[test]
fn error_messages() {
    use std::format;
    assert_eq!(format!("{}", Error::OutOfMemory), "out of memory");
    assert_eq!(format!("{}", Error::Empty), "container is empty");
    assert_eq!(
        format!("{}", Error::RegistrationConflict),
        "a pool is already registered for this tag"
    );
}

// ============================================================================
// C interface
// ============================================================================

#[cfg(feature = "c-api")]
mod c_api {
    use crate::capi;
    use crate::BlockAllocator;
    use core::sync::atomic::AtomicBool;
    use core::sync::atomic::Ordering;
    use std::panic::catch_unwind;
    use std::vec::Vec;

    static OOM_HIT: AtomicBool = AtomicBool::new(false);

    fn recording_oom() -> ! {
        OOM_HIT.store(true, Ordering::Relaxed);
        panic!("recorded out-of-memory");
    }

    /// The whole C surface shares one process-wide arena, so it is
    /// exercised by a single sequential test.
    #[test]
    fn service_calibration_then_exhaustion() {
        use capi::create_queue;
        use capi::dequeue_byte;
        use capi::destroy_queue;
        use capi::enqueue_byte;
        use capi::queue_clear;
        use capi::queue_is_empty;
        use capi::queue_size;

        // --- Calibration -------------------------------------------------
        unsafe {
            let q0 = create_queue();
            assert!(!q0.is_null());
            enqueue_byte(q0, 0);
            enqueue_byte(q0, 1);
            let q1 = create_queue();
            enqueue_byte(q1, 3);
            enqueue_byte(q0, 2);
            enqueue_byte(q1, 4);

            assert_eq!(dequeue_byte(q0), 0);
            assert_eq!(dequeue_byte(q0), 1);
            enqueue_byte(q0, 5);
            enqueue_byte(q1, 6);
            assert_eq!(dequeue_byte(q0), 2);
            assert_eq!(dequeue_byte(q0), 5);
            destroy_queue(q0);

            assert_eq!(dequeue_byte(q1), 3);
            assert_eq!(dequeue_byte(q1), 4);
            assert_eq!(dequeue_byte(q1), 6);

            // Utility surface.
            assert!(queue_is_empty(q1));
            assert_eq!(queue_size(q1), 0);
            enqueue_byte(q1, 7);
            assert!(!queue_is_empty(q1));
            assert_eq!(queue_size(q1), 1);
            queue_clear(q1);
            assert!(queue_is_empty(q1));
            destroy_queue(q1);

            // With every queue destroyed, the arena must end empty.
            assert_eq!(
                capi::service_arena().free_blocks(),
                capi::ARENA_BLOCK_COUNT
            );
            assert_eq!(capi::service_usage().free, capi::ARENA_BLOCK_COUNT);

            // Null handles are rejected as illegal operations.
            assert!(queue_is_empty(core::ptr::null()));
            assert_eq!(queue_size(core::ptr::null()), 0);
            assert!(catch_unwind(|| unsafe { destroy_queue(core::ptr::null_mut()) }).is_err());
        }

        // --- Exhaustion --------------------------------------------------
        capi::set_out_of_memory_handler(recording_oom);

        let mut queues = Vec::new();
        loop {
            match catch_unwind(|| create_queue()) {
                Ok(q) => queues.push(q),
                Err(_) => break,
            }
        }
        assert!(OOM_HIT.load(Ordering::Relaxed));
        assert_eq!(capi::service_arena().free_blocks(), 0);
        assert_eq!(capi::service_usage().free, 0);

        // Destroying the queues makes the service usable again.
        for q in queues {
            unsafe { destroy_queue(q) };
        }
        assert!(capi::service_arena().free_blocks() > 0);
        unsafe {
            let q = create_queue();
            for byte in 0..64 {
                enqueue_byte(q, byte);
            }
            for byte in 0..64 {
                assert_eq!(dequeue_byte(q), byte);
            }
            destroy_queue(q);
        }
    }
}
