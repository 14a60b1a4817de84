// Copyright © 2024 Andrea Corbellini and contributors
// SPDX-License-Identifier: BSD-3-Clause

//! The C-linkage byte-queue service.
//!
//! This module instantiates the whole stack at its canonical configuration
//! (a 2 KiB arena of 16-byte blocks, 8-byte pool sub-blocks, 16-byte ring
//! buffers) and exports it behind four C entry points:
//!
//! ```c
//! queue_handle *create_queue(void);
//! void destroy_queue(queue_handle *q);
//! void enqueue_byte(queue_handle *q, unsigned char b);
//! unsigned char dequeue_byte(queue_handle *q);
//! ```
//!
//! plus the `queue_is_empty` / `queue_size` / `queue_clear` conveniences.
//!
//! Failures do not surface as return codes: a request the arena cannot
//! satisfy invokes the out-of-memory hook, and misuse (null handle, dequeue
//! from an empty queue) invokes the illegal-operation hook. Neither hook is
//! allowed to return; the defaults panic. Embedders that want different
//! behavior (a reset, a log-and-halt) install their own diverging function
//! with [`set_out_of_memory_handler`] or [`set_illegal_operation_handler`],
//! which stand in for the weakly-linked override symbols a C library would
//! use here (stable Rust has no weak linkage).
//!
//! The entry points use the `C-unwind` ABI so that a hook which unwinds
//! (for example a test harness catching the failure) is defined behavior.

use crate::alloc::BlockAllocator;
use crate::manager::max_segments_for;
use crate::pool::GrowingPool;
use crate::pool_tag;
use crate::ptr::PoolPtr;
use crate::queue::ByteQueue;
use crate::registry::PoolRegistration;
use crate::usage::Usage;
use core::ptr::NonNull;
use spin::Lazy;
use spin::Mutex;

/// Size of one arena block, in bytes.
pub const ARENA_BLOCK_SIZE: usize = 16;
/// Number of arena blocks. 16 × 128 = the 2 KiB budget.
pub const ARENA_BLOCK_COUNT: usize = 128;
/// Size of the pool sub-blocks holding queue nodes and control blocks.
pub const SUB_BLOCK_SIZE: usize = 8;
/// Capacity, in bytes, of each queue node's ring buffer.
pub const RING_CAPACITY: usize = 16;

const MAX_SEGMENTS: usize = max_segments_for(ARENA_BLOCK_SIZE);

pool_tag! {
    /// Tag of the pool holding queue nodes (ring buffer + link).
    pub struct QueueNodes {
        sub_block_size: SUB_BLOCK_SIZE,
        sub_block_count: ARENA_BLOCK_SIZE / SUB_BLOCK_SIZE,
        max_segments: max_segments_for(ARENA_BLOCK_SIZE),
        max_managers: 32,
    }
}

pool_tag! {
    /// Tag of the pool holding queue control blocks. The manager cap is
    /// deliberately beyond what the arena can back, so running out of
    /// queues always surfaces as arena exhaustion.
    pub struct QueueSlots {
        sub_block_size: SUB_BLOCK_SIZE,
        sub_block_count: ARENA_BLOCK_SIZE / SUB_BLOCK_SIZE,
        max_segments: max_segments_for(ARENA_BLOCK_SIZE),
        max_managers: 64,
    }
}

type ServiceArena = crate::SlotArena<'static, ARENA_BLOCK_SIZE, ARENA_BLOCK_COUNT>;
type NodePool = GrowingPool<'static, ServiceArena, QueueNodes, MAX_SEGMENTS>;
type HandlePool = GrowingPool<'static, ServiceArena, QueueSlots, MAX_SEGMENTS>;
type ServiceQueue = ByteQueue<ServiceArena, QueueNodes, RING_CAPACITY>;

#[repr(align(16))]
struct ArenaMemory([u8; ARENA_BLOCK_SIZE * ARENA_BLOCK_COUNT]);

#[allow(static_mut_refs)]
static ARENA: Lazy<ServiceArena> = Lazy::new(|| {
    static mut MEMORY: ArenaMemory = ArenaMemory([0; ARENA_BLOCK_SIZE * ARENA_BLOCK_COUNT]);
    // SAFETY: This closure runs exactly once, so `MEMORY` is entirely owned
    // by this `SlotArena` and no other reference to it can be created.
    ServiceArena::from_slice(unsafe { &mut MEMORY.0 })
});

static NODE_POOL: Lazy<NodePool> = Lazy::new(|| GrowingPool::new(&ARENA));
static HANDLE_POOL: Lazy<HandlePool> = Lazy::new(|| GrowingPool::new(&ARENA));

static NODE_REGISTRATION: Lazy<PoolRegistration<'static>> = Lazy::new(|| {
    NODE_POOL
        .register()
        .expect("queue-node tag registered twice")
});
static HANDLE_REGISTRATION: Lazy<PoolRegistration<'static>> = Lazy::new(|| {
    HANDLE_POOL
        .register()
        .expect("queue-slot tag registered twice")
});

/// Forces the lazy service singletons, in dependency order.
fn bootstrap() {
    Lazy::force(&NODE_REGISTRATION);
    Lazy::force(&HANDLE_REGISTRATION);
}

/// A failure hook. Must not return.
pub type FailureHandler = fn() -> !;

fn default_out_of_memory() -> ! {
    panic!("byte-queue service: out of memory");
}

fn default_illegal_operation() -> ! {
    panic!("byte-queue service: illegal operation");
}

static OUT_OF_MEMORY: Mutex<FailureHandler> = Mutex::new(default_out_of_memory);
static ILLEGAL_OPERATION: Mutex<FailureHandler> = Mutex::new(default_illegal_operation);

/// Installs the hook invoked when the arena cannot satisfy a request.
pub fn set_out_of_memory_handler(handler: FailureHandler) {
    *OUT_OF_MEMORY.lock() = handler;
}

/// Installs the hook invoked on a null handle or a dequeue from an empty
/// queue.
pub fn set_illegal_operation_handler(handler: FailureHandler) {
    *ILLEGAL_OPERATION.lock() = handler;
}

fn out_of_memory() -> ! {
    log::error!("byte-queue service out of memory");
    let handler = *OUT_OF_MEMORY.lock();
    handler()
}

fn illegal_operation() -> ! {
    log::error!("byte-queue service illegal operation");
    let handler = *ILLEGAL_OPERATION.lock();
    handler()
}

/// The opaque queue handle handed across the C boundary.
///
/// Its storage is one sub-block of the control-block pool; the handle
/// remembers its own sub-block so `destroy_queue` can give it back.
pub struct QueueHandle {
    queue: ServiceQueue,
    self_ptr: PoolPtr<QueueHandle, QueueSlots>,
}

impl core::fmt::Debug for QueueHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("QueueHandle")
            .field("len", &self.queue.len())
            .finish()
    }
}

/// Creates a queue.
///
/// The returned handle is never null: if the arena cannot hold another
/// control block, the out-of-memory hook is invoked instead of returning.
#[no_mangle]
pub extern "C-unwind" fn create_queue() -> *mut QueueHandle {
    bootstrap();
    let Ok(raw) = HANDLE_POOL.allocate_block() else {
        out_of_memory()
    };

    let handle = HANDLE_POOL.block_at(raw).cast::<QueueHandle>();
    // SAFETY: The sub-block was just vended, so it is unaliased raw storage;
    // the pool geometry guarantees it fits and aligns a `QueueHandle`.
    unsafe {
        handle.write(QueueHandle {
            queue: ServiceQueue::new(),
            self_ptr: raw.cast(),
        });
    }
    handle.as_ptr()
}

/// Destroys a queue, returning all of its memory to the arena.
///
/// Invokes the illegal-operation hook on a null handle.
///
/// # Safety
///
/// `q` must be null or a handle obtained from [`create_queue`] that has not
/// been destroyed yet.
#[no_mangle]
pub unsafe extern "C-unwind" fn destroy_queue(q: *mut QueueHandle) {
    let Some(mut q) = NonNull::new(q) else {
        illegal_operation()
    };
    bootstrap();

    // SAFETY: Per this function's contract, `q` is a live handle and the
    // caller relinquishes it here.
    let handle = unsafe { q.as_mut() };
    let self_ptr = handle.self_ptr;
    if handle.queue.clear(&*ARENA, &*NODE_POOL).is_err() {
        illegal_operation()
    }
    // SAFETY: `q` stays valid until its sub-block is returned below.
    unsafe { core::ptr::drop_in_place(q.as_ptr()) };
    if HANDLE_POOL.deallocate_block(self_ptr.cast()).is_err() {
        illegal_operation()
    }
}

/// Enqueues one byte.
///
/// Invokes the illegal-operation hook on a null handle, and the
/// out-of-memory hook if the arena cannot hold the byte.
///
/// # Safety
///
/// `q` must be null or a live handle obtained from [`create_queue`].
#[no_mangle]
pub unsafe extern "C-unwind" fn enqueue_byte(q: *mut QueueHandle, b: u8) {
    let Some(mut q) = NonNull::new(q) else {
        illegal_operation()
    };
    bootstrap();

    // SAFETY: Per this function's contract, `q` is a live handle.
    let handle = unsafe { q.as_mut() };
    if handle.queue.push(&*ARENA, &*NODE_POOL, b).is_err() {
        out_of_memory()
    }
}

/// Dequeues the oldest byte.
///
/// Invokes the illegal-operation hook on a null handle or an empty queue.
///
/// # Safety
///
/// `q` must be null or a live handle obtained from [`create_queue`].
#[no_mangle]
pub unsafe extern "C-unwind" fn dequeue_byte(q: *mut QueueHandle) -> u8 {
    let Some(mut q) = NonNull::new(q) else {
        illegal_operation()
    };
    bootstrap();

    // SAFETY: Per this function's contract, `q` is a live handle.
    let handle = unsafe { q.as_mut() };
    match handle.queue.pop(&*ARENA, &*NODE_POOL) {
        Ok(byte) => byte,
        Err(_) => illegal_operation(),
    }
}

/// Returns `true` for a null handle or an empty queue.
///
/// # Safety
///
/// `q` must be null or a live handle obtained from [`create_queue`].
#[no_mangle]
pub unsafe extern "C-unwind" fn queue_is_empty(q: *const QueueHandle) -> bool {
    let Some(q) = NonNull::new(q.cast_mut()) else {
        return true;
    };
    // SAFETY: Per this function's contract, `q` is a live handle.
    unsafe { q.as_ref() }.queue.is_empty()
}

/// Number of bytes currently queued; `0` for a null handle.
///
/// # Safety
///
/// `q` must be null or a live handle obtained from [`create_queue`].
#[no_mangle]
pub unsafe extern "C-unwind" fn queue_size(q: *const QueueHandle) -> usize {
    let Some(q) = NonNull::new(q.cast_mut()) else {
        return 0;
    };
    // SAFETY: Per this function's contract, `q` is a live handle.
    unsafe { q.as_ref() }.queue.len()
}

/// Discards every queued byte, returning the queue's nodes to the arena.
/// A null handle is ignored.
///
/// # Safety
///
/// `q` must be null or a live handle obtained from [`create_queue`].
#[no_mangle]
pub unsafe extern "C-unwind" fn queue_clear(q: *mut QueueHandle) {
    let Some(mut q) = NonNull::new(q) else {
        return;
    };
    bootstrap();
    // SAFETY: Per this function's contract, `q` is a live handle.
    let handle = unsafe { q.as_mut() };
    if handle.queue.clear(&*ARENA, &*NODE_POOL).is_err() {
        illegal_operation()
    }
}

/// Memory usage of the service arena, in blocks.
pub fn service_usage() -> Usage {
    bootstrap();
    ARENA.usage()
}

#[cfg(test)]
pub(crate) fn service_arena() -> &'static ServiceArena {
    bootstrap();
    &ARENA
}
