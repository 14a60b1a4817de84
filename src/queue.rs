// Copyright © 2024 Andrea Corbellini and contributors
// SPDX-License-Identifier: BSD-3-Clause

use crate::alloc::BlockAllocator;
use crate::error::Error;
use crate::error::Result;
use crate::list::ListNode;
use crate::list::OffsetList;
use crate::ptr::PoolPtr;
use crate::registry::PoolTag;
use crate::ring::RingBuffer;
use core::fmt;

/// One link of a queue: a ring buffer of `R` elements plus the compact link
/// to the next node. Nodes live in sub-blocks of the pool tagged `G` and are
/// never moved after construction, only linked and unlinked.
pub(crate) struct QueueNode<T, A: BlockAllocator, G: PoolTag, const R: usize> {
    ring: RingBuffer<T, A, R>,
    next: PoolPtr<Self, G>,
}

impl<T, A: BlockAllocator, G: PoolTag, const R: usize> ListNode for QueueNode<T, A, G, R> {
    type Tag = G;

    fn next(&self) -> PoolPtr<Self, G> {
        self.next
    }

    fn set_next(&mut self, next: PoolPtr<Self, G>) {
        self.next = next;
    }
}

/// A FIFO queue of `T` built as a list of ring buffers.
///
/// New elements go into the ring buffer of the *front* node; when it fills
/// up, a fresh node is prepended. Consumption happens from the *back* node,
/// which therefore always holds the oldest elements; when popping empties
/// it, the node is unlinked and returned to its pool. Interior nodes were
/// full at the moment they were prepended and stay full until they become
/// the back, so the queue never carries an empty node (except transiently
/// inside a pop that is about to remove it).
///
/// Two allocators collaborate, both passed to the operations rather than
/// stored (which is what keeps the control block at four bytes, small
/// enough to live in a pool sub-block itself):
///
/// * `store: &A` vends the blocks backing each node's ring-buffer storage;
/// * `pool` (any allocator whose handles are [`PoolPtr<u8, G>`], in
///   practice a [`GrowingPool`](crate::GrowingPool) tagged `G`) vends the
///   sub-blocks holding the nodes.
///
/// The pool of `G` must be [registered](crate::GrowingPool::register) while
/// the queue is in use, and the same allocator instances must be passed to
/// every call. The queue has no `Drop`: call [`clear`](Self::clear) before
/// letting go of one that still holds elements, or its blocks stay
/// allocated.
///
/// # Examples
///
/// ```
/// use thimble::max_segments_for;
/// use thimble::pool_tag;
/// use thimble::GrowingPool;
/// use thimble::Queue;
/// use thimble::SlotArena;
///
/// pool_tag! {
///     pub struct Nodes {
///         sub_block_size: 8,
///         sub_block_count: 2,
///         max_segments: max_segments_for(16),
///         max_managers: 32,
///     }
/// }
///
/// #[repr(align(16))]
/// struct Memory([u8; 2048]);
///
/// let mut memory = Memory([0; 2048]);
/// let arena = SlotArena::<16, 128>::from_slice(&mut memory.0);
/// let pool = GrowingPool::<_, Nodes, { max_segments_for(16) }>::new(&arena);
/// let registration = pool.register().unwrap();
///
/// let mut queue = Queue::<u8, _, Nodes, 16>::new();
/// queue.push(&arena, &pool, 1).unwrap();
/// queue.push(&arena, &pool, 2).unwrap();
/// assert_eq!(queue.pop(&arena, &pool).unwrap(), 1);
/// assert_eq!(queue.pop(&arena, &pool).unwrap(), 2);
///
/// queue.clear(&arena, &pool).unwrap();
/// drop(registration);
/// ```
pub struct Queue<T, A: BlockAllocator, G: PoolTag, const R: usize> {
    nodes: OffsetList<QueueNode<T, A, G, R>>,
}

/// A [`Queue`] of bytes, the configuration the C interface serves.
pub type ByteQueue<A, G, const R: usize> = Queue<u8, A, G, R>;

impl<T, A: BlockAllocator, G: PoolTag, const R: usize> Queue<T, A, G, R> {
    const NODE_FITS: () = assert!(
        size_of::<QueueNode<T, A, G, R>>() <= G::SUB_BLOCK_SIZE
            && align_of::<QueueNode<T, A, G, R>>() <= G::SUB_BLOCK_SIZE,
        "queue node does not fit in a pool sub-block"
    );

    /// An empty queue. Allocates nothing.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            nodes: OffsetList::new(),
        }
    }

    fn node_ref(&self, ptr: PoolPtr<QueueNode<T, A, G, R>, G>) -> &QueueNode<T, A, G, R> {
        // SAFETY: Every node handle in `self.nodes` refers to a sub-block
        // this queue allocated and exclusively owns; the shared borrow of
        // `self` keeps mutating operations away.
        unsafe { ptr.get().as_ref() }
    }

    fn node_mut(&mut self, ptr: PoolPtr<QueueNode<T, A, G, R>, G>) -> &mut QueueNode<T, A, G, R> {
        // SAFETY: See `node_ref`; `&mut self` makes the access exclusive.
        unsafe { ptr.get().as_mut() }
    }

    /// Prepends a fresh node with an empty ring buffer.
    fn grow<P>(&mut self, store: &A, pool: &P) -> Result<()>
    where
        P: BlockAllocator<Handle = PoolPtr<u8, G>>,
    {
        let () = Self::NODE_FITS;
        let raw = pool.allocate_block()?;
        let ring = match RingBuffer::new_in(store) {
            Ok(ring) => ring,
            Err(err) => {
                // Give the half-built node back before surfacing the error.
                let _ = pool.deallocate_block(raw);
                return Err(err);
            }
        };

        let node_ptr = raw.cast::<QueueNode<T, A, G, R>>();
        // SAFETY: The sub-block was just vended, so it is unaliased raw
        // storage; `NODE_FITS` guarantees size and alignment.
        unsafe {
            pool.block_at(raw)
                .cast::<QueueNode<T, A, G, R>>()
                .write(QueueNode {
                    ring,
                    next: PoolPtr::NULL,
                });
        }
        self.nodes.push_front(node_ptr);
        Ok(())
    }

    /// Unlinks `ptr` (the back node, already empty), returning its storage
    /// and its sub-block.
    fn retire<P>(&mut self, store: &A, pool: &P) -> Result<()>
    where
        P: BlockAllocator<Handle = PoolPtr<u8, G>>,
    {
        let ptr = self.nodes.pop_back()?;
        self.node_mut(ptr).ring.release(store)?;
        pool.deallocate_block(ptr.cast::<u8>())
    }

    /// Enqueues `value`.
    ///
    /// A new node is created when the queue is empty or the front node's
    /// ring buffer is full; allocation failures propagate unchanged.
    pub fn push<P>(&mut self, store: &A, pool: &P, value: T) -> Result<()>
    where
        P: BlockAllocator<Handle = PoolPtr<u8, G>>,
    {
        let needs_node = match self.nodes.front() {
            Err(_) => true,
            Ok(front) => self.node_ref(front).ring.is_full(),
        };
        if needs_node {
            self.grow(store, pool)?;
        }

        let front = self.nodes.front()?;
        self.node_mut(front).ring.push(store, value)
    }

    /// Enqueues every element of `values` in order.
    pub fn extend_from_slice<P>(&mut self, store: &A, pool: &P, values: &[T]) -> Result<()>
    where
        T: Clone,
        P: BlockAllocator<Handle = PoolPtr<u8, G>>,
    {
        for value in values {
            self.push(store, pool, value.clone())?;
        }
        Ok(())
    }

    /// Dequeues the oldest element.
    ///
    /// Fails with [`Error::Empty`] on an empty queue. A node whose ring
    /// buffer this empties is unlinked and returned to its pool.
    pub fn pop<P>(&mut self, store: &A, pool: &P) -> Result<T>
    where
        P: BlockAllocator<Handle = PoolPtr<u8, G>>,
    {
        let back = self.nodes.back().map_err(|_| Error::Empty)?;
        let node = self.node_mut(back);
        let value = node.ring.pop(store)?;

        if self.node_ref(back).ring.is_empty() {
            self.retire(store, pool)?;
        }
        Ok(value)
    }

    /// The oldest element: the front of the back node's ring buffer.
    pub fn front<'s>(&'s self, store: &'s A) -> Result<&'s T> {
        let back = self.nodes.back().map_err(|_| Error::Empty)?;
        self.node_ref(back).ring.front(store)
    }

    /// The newest element: the back of the front node's ring buffer.
    pub fn back<'s>(&'s self, store: &'s A) -> Result<&'s T> {
        let front = self.nodes.front().map_err(|_| Error::Empty)?;
        self.node_ref(front).ring.back(store)
    }

    /// Number of queued elements. `O(number of nodes)`.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes
            .iter()
            .map(|ptr| self.node_ref(ptr).ring.len())
            .sum()
    }

    /// Returns `true` if nothing is queued.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of nodes currently linked in.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Destroys every element and returns all nodes and ring storage to
    /// their allocators.
    pub fn clear<P>(&mut self, store: &A, pool: &P) -> Result<()>
    where
        P: BlockAllocator<Handle = PoolPtr<u8, G>>,
    {
        while let Ok(ptr) = self.nodes.pop_front() {
            self.node_mut(ptr).ring.release(store)?;
            pool.deallocate_block(ptr.cast::<u8>())?;
        }
        Ok(())
    }
}

impl<T, A: BlockAllocator, G: PoolTag, const R: usize> Default for Queue<T, A, G, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, A: BlockAllocator, G: PoolTag, const R: usize> fmt::Debug for Queue<T, A, G, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("nodes", &self.node_count())
            .finish()
    }
}
