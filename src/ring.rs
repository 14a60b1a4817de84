// Copyright © 2024 Andrea Corbellini and contributors
// SPDX-License-Identifier: BSD-3-Clause

use crate::alloc::BlockAllocator;
use crate::alloc::Handle;
use crate::error::Error;
use crate::error::Result;
use core::fmt;
use core::marker::PhantomData;
use core::ptr::NonNull;

/// A fixed-capacity circular buffer of `R` elements, backed by one block of
/// the allocator `A`.
///
/// The struct itself holds only three saturating counters and the storage
/// handle, a handful of bytes, which is what lets a ring buffer live
/// inside a pool sub-block. The price is that the backing allocator is not
/// stored but passed to every operation, the same way interrupt-driven byte
/// buffers do it; passing a different allocator instance than the one that
/// vended the storage is a logic error.
///
/// Elements occupy positions `[head, head + len) mod R` of the storage
/// block; all other positions are raw storage. `len + free == R` at all
/// times.
///
/// Dropping a `RingBuffer` does not free its storage or its elements; the
/// owner must call [`release`](Self::release) first. (The byte queue does
/// this for its nodes.)
pub struct RingBuffer<T, A: BlockAllocator, const R: usize> {
    head: u8,
    tail: u8,
    free: u8,
    storage: A::Handle,
    marker: PhantomData<T>,
}

impl<T, A: BlockAllocator, const R: usize> RingBuffer<T, A, R> {
    const LAYOUT_OK: () = assert!(
        R > 0
            && R <= u8::MAX as usize
            && size_of::<T>() > 0
            && R * size_of::<T>() <= A::BLOCK_SIZE
            && align_of::<T>() <= A::BLOCK_SIZE,
        "ring storage must fit in one block and the capacity must fit the \
         counters"
    );

    /// Creates a ring buffer whose storage is one block vended by `store`.
    pub fn new_in(store: &A) -> Result<Self> {
        let () = Self::LAYOUT_OK;
        let storage = store.allocate_block()?;
        Ok(Self {
            head: 0,
            tail: 0,
            free: R as u8,
            storage,
            marker: PhantomData,
        })
    }

    /// Number of live elements. `len + free == R` always holds.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        R - self.free as usize
    }

    /// The compile-time capacity `R`.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        R
    }

    /// Number of unoccupied positions.
    #[inline]
    #[must_use]
    pub fn free(&self) -> usize {
        self.free as usize
    }

    /// Returns `true` if no element is live.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.free as usize == R
    }

    /// Returns `true` if every position is occupied.
    #[inline]
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.free == 0
    }

    fn storage_ptr(&self, store: &A) -> NonNull<T> {
        debug_assert!(!self.storage.is_null(), "ring buffer already released");
        store.block_at(self.storage).cast()
    }

    /// Address of the physical slot `index`.
    fn slot(&self, store: &A, index: u8) -> NonNull<T> {
        debug_assert!((index as usize) < R, "slot index out of range");
        // SAFETY: `LAYOUT_OK` guarantees that `R` elements fit in the block.
        unsafe { self.storage_ptr(store).add(index as usize) }
    }

    #[inline]
    fn wrap(index: u8) -> u8 {
        ((index as u16 + 1) % R as u16) as u8
    }

    /// Appends an element at the tail.
    pub fn push(&mut self, store: &A, value: T) -> Result<()> {
        if self.is_full() {
            return Err(Error::Full);
        }
        // SAFETY: The tail slot holds no live element (`free > 0`).
        unsafe { self.slot(store, self.tail).write(value) };
        self.tail = Self::wrap(self.tail);
        self.free -= 1;
        Ok(())
    }

    /// Constructs an element in place at the tail.
    pub fn push_with(&mut self, store: &A, value: impl FnOnce() -> T) -> Result<()> {
        if self.is_full() {
            return Err(Error::Full);
        }
        // SAFETY: See `push`.
        unsafe { self.slot(store, self.tail).write(value()) };
        self.tail = Self::wrap(self.tail);
        self.free -= 1;
        Ok(())
    }

    /// Removes and returns the oldest element.
    pub fn pop(&mut self, store: &A) -> Result<T> {
        if self.is_empty() {
            return Err(Error::Empty);
        }
        // SAFETY: The head slot holds a live element; reading it out leaves
        // raw storage behind, and the position is freed before any re-read.
        let value = unsafe { self.slot(store, self.head).read() };
        self.head = Self::wrap(self.head);
        self.free += 1;
        Ok(value)
    }

    /// The oldest element.
    pub fn front<'s>(&'s self, store: &'s A) -> Result<&'s T> {
        if self.is_empty() {
            return Err(Error::Empty);
        }
        // SAFETY: The head slot holds a live element.
        Ok(unsafe { self.slot(store, self.head).as_ref() })
    }

    /// The newest element.
    pub fn back<'s>(&'s self, store: &'s A) -> Result<&'s T> {
        if self.is_empty() {
            return Err(Error::Empty);
        }
        let back = if self.tail == 0 { R as u8 - 1 } else { self.tail - 1 };
        // SAFETY: The slot before the tail holds a live element.
        Ok(unsafe { self.slot(store, back).as_ref() })
    }

    /// The element at logical position `index` (`0` is the oldest), or
    /// `None` past the end.
    pub fn at<'s>(&'s self, store: &'s A, index: usize) -> Option<&'s T> {
        if index >= self.len() {
            return None;
        }
        let physical = ((self.head as usize + index) % R) as u8;
        // SAFETY: Logical positions below `len` hold live elements.
        Some(unsafe { self.slot(store, physical).as_ref() })
    }

    /// Destroys all elements in FIFO order and resets the counters.
    pub fn clear(&mut self, store: &A) {
        while !self.is_empty() {
            let slot = self.slot(store, self.head);
            // SAFETY: The head slot holds a live element, dropped exactly
            // once here.
            unsafe { slot.drop_in_place() };
            self.head = Self::wrap(self.head);
            self.free += 1;
        }
        self.head = 0;
        self.tail = 0;
    }

    /// Destroys all elements and returns the storage block to `store`.
    ///
    /// The buffer is unusable afterwards.
    pub fn release(&mut self, store: &A) -> Result<()> {
        if self.storage.is_null() {
            return Ok(());
        }
        self.clear(store);
        let storage = self.storage;
        self.storage = <A::Handle as Handle>::NULL;
        store.deallocate_block(storage)
    }

    /// Iterates the elements in logical (FIFO) order.
    #[must_use]
    pub fn iter<'s>(&'s self, store: &'s A) -> Iter<'s, T, A, R> {
        Iter {
            ring: self,
            store,
            front: 0,
            back: self.len(),
        }
    }
}

impl<T, A: BlockAllocator, const R: usize> fmt::Debug for RingBuffer<T, A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("len", &self.len())
            .field("capacity", &R)
            .finish()
    }
}

/// Iterator over the elements of a [`RingBuffer`] in logical order.
///
/// Logical position `0` is the oldest element; iteration covers
/// `[0, len)`.
#[derive(Debug)]
pub struct Iter<'s, T, A: BlockAllocator, const R: usize> {
    ring: &'s RingBuffer<T, A, R>,
    store: &'s A,
    front: usize,
    back: usize,
}

impl<'s, T, A: BlockAllocator, const R: usize> Iterator for Iter<'s, T, A, R> {
    type Item = &'s T;

    fn next(&mut self) -> Option<Self::Item> {
        if self.front >= self.back {
            return None;
        }
        let item = self.ring.at(self.store, self.front);
        self.front += 1;
        item
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.back - self.front;
        (remaining, Some(remaining))
    }
}

impl<'s, T, A: BlockAllocator, const R: usize> DoubleEndedIterator for Iter<'s, T, A, R> {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.front >= self.back {
            return None;
        }
        self.back -= 1;
        self.ring.at(self.store, self.back)
    }
}

impl<'s, T, A: BlockAllocator, const R: usize> ExactSizeIterator for Iter<'s, T, A, R> {}
