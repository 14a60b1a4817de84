// Copyright © 2024 Andrea Corbellini and contributors
// SPDX-License-Identifier: BSD-3-Clause

use crate::alloc::BlockAllocator;
use crate::alloc::BlockHandle;
use crate::alloc::Handle;
use crate::error::Error;
use crate::error::Result;
use crate::freelist::RawFreeList;
use crate::usage::Usage;
use core::alloc::GlobalAlloc;
use core::alloc::Layout;
use core::fmt;
use core::marker::PhantomData;
use core::ptr::NonNull;
use spin::Mutex;

#[inline]
#[must_use]
fn slice_to_nonnull<T>(slice: &mut [T]) -> NonNull<[T]> {
    let start = unsafe { NonNull::new_unchecked(slice.as_mut_ptr()) };
    let size = slice.len();
    NonNull::slice_from_raw_parts(start, size)
}

#[derive(Copy, Clone, Debug)]
struct FreeState {
    head: u16,
    free: u16,
}

/// The root allocator: `BC` uniform blocks of `BS` bytes each, carved out of
/// one contiguous region provided by the caller.
///
/// Every byte of state managed by this crate ultimately lives inside one of
/// these blocks. The arena itself is nothing more than a free list (threaded
/// through the blocks) plus an alignment fix-up at construction: the first
/// block starts at the first `BS`-aligned address inside the region, so the
/// address of any block is a multiple of the block size.
///
/// Blocks are addressed by [`BlockHandle`] (a small index), not by pointer.
///
/// # Examples
///
/// ```
/// use thimble::BlockAllocator;
/// use thimble::SlotArena;
///
/// #[repr(align(16))]
/// struct Memory([u8; 256]);
///
/// let mut memory = Memory([0; 256]);
/// let arena = SlotArena::<16, 16>::from_slice(&mut memory.0);
///
/// let block = arena.allocate_block().unwrap();
/// assert_eq!(arena.free_blocks(), 15);
/// arena.deallocate_block(block).unwrap();
/// assert_eq!(arena.free_blocks(), 16);
/// ```
pub struct SlotArena<'a, const BS: usize, const BC: usize> {
    list: RawFreeList,
    state: Mutex<FreeState>,
    upstream: Option<&'a dyn GlobalAlloc>,
    phantom: PhantomData<&'a mut [u8]>,
}

// SAFETY: The `'a` lifetime and the `&'a mut [u8]` in `phantom` are there to
// ensure that the underlying region is unique and not aliased. The free-list
// metadata is guarded by the `Mutex`; exclusivity of block *contents* is the
// responsibility of whoever holds the corresponding `BlockHandle`, exactly as
// with any allocator.
unsafe impl<'a, const BS: usize, const BC: usize> Send for SlotArena<'a, BS, BC> where
    &'a mut [u8]: Send
{
}

// SAFETY: See the `Send` impl above. The upstream allocator, when present, is
// only reachable through `unsafe` `GlobalAlloc` calls whose contract the
// caller already carries.
unsafe impl<'a, const BS: usize, const BC: usize> Sync for SlotArena<'a, BS, BC> {}

impl<'a, const BS: usize, const BC: usize> SlotArena<'a, BS, BC> {
    const LAYOUT_OK: () = assert!(
        BS.is_power_of_two()
            && BC.is_power_of_two()
            && BS >= size_of::<u16>()
            && BC < u16::MAX as usize,
        "block size and count must be powers of two, and the count must leave \
         room for the null sentinel"
    );

    /// Constructs an arena from a slice.
    ///
    /// The first block is placed at the first `BS`-aligned address inside the
    /// slice, so the slice must be large enough to hold `BC` blocks *after*
    /// that adjustment. Passing a slice that is already aligned to `BS` (for
    /// example via `#[repr(align(...))]`) wastes nothing.
    ///
    /// # Panics
    ///
    /// If the slice cannot hold `BC` aligned blocks.
    #[must_use]
    pub fn from_slice(slice: &'a mut [u8]) -> Self {
        let slice = slice_to_nonnull(slice);
        // SAFETY: The mutable borrow guarantees that `slice` is valid,
        // unique, and alive for `'a`.
        unsafe { Self::from_ptr(slice) }
    }

    /// Constructs an arena from a slice pointer.
    ///
    /// # Panics
    ///
    /// If the region cannot hold `BC` aligned blocks.
    ///
    /// # Safety
    ///
    /// - `slice` must be [valid](core::ptr#safety) for reads and writes.
    /// - `slice` must be alive for the lifetime of `'a`.
    /// - `slice` must not be aliased by any other reference or pointer for
    ///   the lifetime of `'a`.
    #[must_use]
    pub unsafe fn from_ptr(slice: NonNull<[u8]>) -> Self {
        let () = Self::LAYOUT_OK;

        let start = slice.cast::<u8>();
        let pad = start.align_offset(BS);
        assert!(
            pad.saturating_add(BS * BC) <= slice.len(),
            "arena region too small for the configured block count"
        );

        // SAFETY: In bounds per the assertion above.
        let base = unsafe { start.byte_add(pad) };
        // SAFETY: `base` is aligned to `BS` and the region holds `BC` blocks.
        let list = unsafe { RawFreeList::new(base, BS, BC) };

        let mut state = FreeState { head: 0, free: 0 };
        list.reset(&mut state.head, &mut state.free);

        Self {
            list,
            state: Mutex::new(state),
            upstream: None,
            phantom: PhantomData,
        }
    }

    /// Registers a general-purpose upstream allocator.
    ///
    /// Requests through the [`GlobalAlloc`] entry point that do not fit in a
    /// block are forwarded to the upstream allocator instead of failing. The
    /// uniform-block interface never touches the upstream.
    #[inline]
    #[must_use]
    pub fn with_upstream(mut self, upstream: &'a dyn GlobalAlloc) -> Self {
        self.upstream = Some(upstream);
        self
    }

    /// Returns the address of the first block.
    #[inline]
    #[must_use]
    pub fn base(&self) -> NonNull<u8> {
        self.list.base()
    }

    /// Returns memory usage information for this arena.
    ///
    /// # Examples
    ///
    /// ```
    /// use thimble::BlockAllocator;
    /// use thimble::SlotArena;
    ///
    /// #[repr(align(16))]
    /// struct Memory([u8; 256]);
    ///
    /// let mut memory = Memory([0; 256]);
    /// let arena = SlotArena::<16, 16>::from_slice(&mut memory.0);
    /// let _block = arena.allocate_block().unwrap();
    ///
    /// let usage = arena.usage();
    /// assert_eq!(usage.total, 16);
    /// assert_eq!(usage.used, 1);
    /// assert_eq!(usage.free, 15);
    /// ```
    #[must_use]
    pub fn usage(&self) -> Usage {
        let free = self.free_blocks();
        Usage {
            total: BC,
            used: BC - free,
            free,
        }
    }
}

impl<'a, const BS: usize, const BC: usize> BlockAllocator for SlotArena<'a, BS, BC> {
    const BLOCK_SIZE: usize = BS;
    const BLOCK_COUNT: usize = BC;

    type Handle = BlockHandle;

    fn allocate_block(&self) -> Result<BlockHandle> {
        let mut state = self.state.lock();
        let FreeState { head, free } = &mut *state;
        let block = self.list.pop(head, free).map_err(|_| Error::OutOfMemory)?;
        let index = self
            .list
            .index_of(block)
            .expect("popped block must belong to the arena");
        Ok(BlockHandle::new(index))
    }

    fn deallocate_block(&self, handle: BlockHandle) -> Result<()> {
        if handle.is_null() {
            return Err(Error::NotOwned);
        }
        let block = self.block_at(handle);
        let mut state = self.state.lock();
        let FreeState { head, free } = &mut *state;
        self.list.push(block, head, free)
    }

    fn block_at(&self, handle: BlockHandle) -> NonNull<u8> {
        assert!(!handle.is_null(), "null block handle");
        self.list.block_at(handle.0)
    }

    fn handle_of(&self, ptr: NonNull<u8>) -> Result<BlockHandle> {
        Ok(BlockHandle::new(self.list.index_of(ptr)?))
    }

    fn owns(&self, ptr: NonNull<u8>) -> bool {
        self.list.owns(ptr)
    }

    fn free_blocks(&self) -> usize {
        self.state.lock().free as usize
    }

    fn reset(&self) {
        let mut state = self.state.lock();
        let FreeState { head, free } = &mut *state;
        self.list.reset(head, free);
    }
}

// SAFETY: `alloc` returns either a block of `BS >= size` bytes aligned to
// `BS >= align`, memory from the upstream allocator, or null. `dealloc`
// routes each pointer back to wherever it came from.
unsafe impl<'a, const BS: usize, const BC: usize> GlobalAlloc for SlotArena<'a, BS, BC> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let fits = layout.size() <= BS && layout.align() <= BS;
        if fits {
            return match self.allocate_block() {
                Ok(handle) => self.block_at(handle).as_ptr(),
                Err(_) => core::ptr::null_mut(),
            };
        }
        match self.upstream {
            Some(upstream) => upstream.alloc(layout),
            None => core::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let fits = layout.size() <= BS && layout.align() <= BS;
        if fits {
            if let Some(ptr) = NonNull::new(ptr) {
                if let Ok(handle) = self.handle_of(ptr) {
                    let _ = self.deallocate_block(handle);
                    return;
                }
            }
        }
        if let Some(upstream) = self.upstream {
            upstream.dealloc(ptr, layout);
        }
    }
}

impl<'a, const BS: usize, const BC: usize> From<&'a mut [u8]> for SlotArena<'a, BS, BC> {
    #[inline]
    fn from(slice: &'a mut [u8]) -> Self {
        Self::from_slice(slice)
    }
}

impl<'a, const BS: usize, const BC: usize, const N: usize> From<&'a mut [u8; N]>
    for SlotArena<'a, BS, BC>
{
    #[inline]
    fn from(array: &'a mut [u8; N]) -> Self {
        Self::from(array.as_mut_slice())
    }
}

impl<'a, const BS: usize, const BC: usize> fmt::Debug for SlotArena<'a, BS, BC> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotArena")
            .field("block_size", &BS)
            .field("block_count", &BC)
            .field("free", &self.free_blocks())
            .field("upstream", &self.upstream.is_some())
            .finish()
    }
}
